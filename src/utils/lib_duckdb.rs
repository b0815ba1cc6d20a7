use std::path::Path;
use std::time::Duration;

use duckdb::{AccessMode, Config, Connection};
use log::warn;

/// Open a DuckDB connection, retrying while another process holds the file lock.
/// Suggested `max_attempts = 8`, `initial_wait = Duration::from_millis(25)`.
pub fn open_with_retry(
    duckdb_path: &Path,
    max_attempts: u32,
    initial_wait: Duration,
    access_mode: AccessMode,
) -> Result<Connection, duckdb::Error> {
    let mut attempts = 0;
    let mut wait_duration = initial_wait;

    loop {
        // `AccessMode` does not implement `Clone` in duckdb 1.3.2; copy it per variant.
        let mode = match access_mode {
            AccessMode::Automatic => AccessMode::Automatic,
            AccessMode::ReadOnly => AccessMode::ReadOnly,
            AccessMode::ReadWrite => AccessMode::ReadWrite,
        };
        let config = Config::default().access_mode(mode)?;
        match Connection::open_with_flags(duckdb_path, config) {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                attempts += 1;
                if attempts >= max_attempts {
                    return Err(e);
                }
                warn!(
                    "retrying to open {} after error: {} (attempt {}/{})",
                    duckdb_path.display(),
                    e,
                    attempts,
                    max_attempts
                );
                std::thread::sleep(wait_duration);
                wait_duration *= 2;
            }
        }
    }
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, duckdb::Error> {
    let n: i64 = conn.query_row(
        "SELECT count(*) FROM information_schema.tables WHERE table_name = ?",
        [table],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Column names of `table` in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, duckdb::Error> {
    let mut stmt = conn.prepare(
        "SELECT column_name FROM information_schema.columns \
         WHERE table_name = ? ORDER BY ordinal_position",
    )?;
    let columns = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Quote an identifier, keeping its casing.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn open_and_inspect() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let conn = open_with_retry(
            &dir.path().join("test.duckdb"),
            8,
            Duration::from_millis(25),
            AccessMode::ReadWrite,
        )?;
        conn.execute_batch(r#"CREATE TABLE einheitenwind ("EinheitMastrNummer" VARCHAR, "Nettonennleistung" DOUBLE);"#)?;
        assert!(table_exists(&conn, "einheitenwind")?);
        assert!(!table_exists(&conn, "einheitensolar")?);
        assert_eq!(
            table_columns(&conn, "einheitenwind")?,
            vec!["EinheitMastrNummer", "Nettonennleistung"]
        );
        Ok(())
    }

    #[test]
    fn quoting() {
        assert_eq!(quote_ident(r#"a"b"#), r#""a""b""#);
        assert_eq!(quote_literal("Müller's"), "'Müller''s'");
    }
}
