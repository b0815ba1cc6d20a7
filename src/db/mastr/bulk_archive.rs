use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use duckdb::{AccessMode, Connection};
use jiff::civil::Date;
use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use regex::Regex;
use reqwest::blocking::Client;
use scraper::{Html, Selector};
use zip::ZipArchive;

use crate::db::mastr::xml_table::{coerce, decode, parse_with_excision, TypedFrame};
use crate::error::MastrError;
use crate::soap::client::send_with_retries;
use crate::utils::lib_duckdb::{open_with_retry, quote_ident};

pub const DOWNLOAD_PAGE: &str = "https://www.marktstammdatenregister.de/MaStR/Datendownload";

const CHUNK_SIZE: usize = 1 << 20;
const INSERT_BATCH: usize = 1000;

lazy_static! {
    static ref UNKNOWN_COLUMN: Regex =
        Regex::new(r#"does not have a column with name "([^"]+)""#).unwrap();
    static ref BAD_VALUE: Vec<Regex> = vec![
        Regex::new(r"Could not convert string '(.*?)' to").unwrap(),
        Regex::new(r#"value out of range: "([^"]+)""#).unwrap(),
        Regex::new(r"with value (\S+) can't be cast").unwrap(),
    ];
}

/// The href of the single anchor styled as primary button.
pub fn extract_primary_href(html: &str) -> Result<String, MastrError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a.btn-primary[href]")
        .map_err(|e| MastrError::Scrape(format!("invalid selector: {:?}", e)))?;
    let hrefs: Vec<String> = document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .map(|href| href.trim().to_string())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    match hrefs.len() {
        1 => Ok(hrefs[0].clone()),
        0 => Err(MastrError::Scrape("no primary download link".to_string())),
        n => Err(MastrError::Scrape(format!("{} primary download links", n))),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Replace,
    Append,
}

impl Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteMode::Replace => write!(f, "replace"),
            WriteMode::Append => write!(f, "append"),
        }
    }
}

/// Archive member name like `EinheitenWind_3.xml`, split into its parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub table: String,
    pub shard: Option<String>,
}

impl Member {
    /// `None` for directories and non-XML members.
    pub fn parse(name: &str) -> Option<Member> {
        let path = Path::new(name);
        let is_xml = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("xml"));
        if !is_xml {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let (entity, shard) = match stem.split_once('_') {
            Some((e, s)) => (e, Some(s.to_string())),
            None => (stem, None),
        };
        let table = entity.split('.').next().unwrap_or(entity).to_lowercase();
        Some(Member {
            name: name.to_string(),
            table,
            shard,
        })
    }

    /// The first shard of an entity replaces the table.
    pub fn mode(&self) -> WriteMode {
        match self.shard.as_deref() {
            None | Some("1") => WriteMode::Replace,
            Some(_) => WriteMode::Append,
        }
    }

    fn shard_key(&self) -> (u64, String) {
        match &self.shard {
            None => (0, String::new()),
            Some(s) => (s.parse::<u64>().unwrap_or(u64::MAX), s.clone()),
        }
    }
}

/// Member indices in load order: entities as they first appear, shards ascending.
pub fn load_order(names: &[String]) -> Vec<(usize, Member)> {
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut members: Vec<(usize, Member)> = names
        .iter()
        .enumerate()
        .filter_map(|(i, n)| Member::parse(n).map(|m| (i, m)))
        .collect();
    for (i, m) in &members {
        first_seen.entry(m.table.clone()).or_insert(*i);
    }
    members.sort_by_key(|(_, m)| (first_seen[&m.table], m.shard_key()));
    members
}

/// Which tables to load.  An allowlist, when given, wins over the denylist.
#[derive(Clone, Debug, Default)]
pub struct TableFilter {
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
}

impl TableFilter {
    pub fn accepts(&self, table: &str) -> bool {
        if let Some(include) = &self.include {
            return include.iter().any(|t| t.to_lowercase() == table);
        }
        if let Some(exclude) = &self.exclude {
            return !exclude.iter().any(|t| t.to_lowercase() == table);
        }
        true
    }
}

/// What happened to one member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberReport {
    pub member: String,
    pub table: String,
    pub mode: WriteMode,
    pub rows: usize,
    pub excised: usize,
    pub added_columns: Vec<String>,
    pub nulled_values: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub members: Vec<MemberReport>,
    pub skipped: Vec<String>,
}

enum WriteFailure {
    UnknownColumn(String),
    BadValue(String),
    Fatal,
}

fn classify(e: &duckdb::Error) -> WriteFailure {
    let message = e.to_string();
    if let Some(c) = UNKNOWN_COLUMN.captures(&message) {
        return WriteFailure::UnknownColumn(c[1].to_string());
    }
    for re in BAD_VALUE.iter() {
        if let Some(c) = re.captures(&message) {
            return WriteFailure::BadValue(c[1].to_string());
        }
    }
    WriteFailure::Fatal
}

fn insert_sql(table: &str, frame: &TypedFrame, from: usize, to: usize) -> String {
    let columns = frame
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let values = (from..to)
        .map(|r| {
            let row = frame
                .columns
                .iter()
                .map(|c| c.literal(r))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", row)
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "INSERT INTO {} ({}) VALUES\n{};",
        quote_ident(table),
        columns,
        values
    )
}

fn try_write(
    conn: &mut Connection,
    table: &str,
    mode: WriteMode,
    frame: &TypedFrame,
) -> Result<(), duckdb::Error> {
    let ddl = frame
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type.ddl()))
        .collect::<Vec<_>>()
        .join(", ");
    let tx = conn.transaction()?;
    match mode {
        WriteMode::Replace => tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {t}; CREATE TABLE {t} ({ddl});",
            t = quote_ident(table),
            ddl = ddl
        ))?,
        WriteMode::Append => tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            quote_ident(table),
            ddl
        ))?,
    }
    let mut from = 0;
    while from < frame.rows {
        let to = (from + INSERT_BATCH).min(frame.rows);
        tx.execute_batch(&insert_sql(table, frame, from, to))?;
        from = to;
    }
    tx.commit()
}

/// Write `frame` into `table`, evolving the table on the way: columns the table does
/// not have are added as text, values the database refuses are set to null.
pub fn write_frame(
    conn: &mut Connection,
    table: &str,
    mode: WriteMode,
    frame: &mut TypedFrame,
) -> Result<(Vec<String>, Vec<String>), MastrError> {
    let mut added: Vec<String> = Vec::new();
    let mut nulled: Vec<String> = Vec::new();
    loop {
        let e = match try_write(conn, table, mode, frame) {
            Ok(()) => return Ok((added, nulled)),
            Err(e) => e,
        };
        match classify(&e) {
            WriteFailure::UnknownColumn(column) if !added.contains(&column) => {
                info!("{}: adding column {}", table, column);
                conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} VARCHAR;",
                    quote_ident(table),
                    quote_ident(&column)
                ))?;
                added.push(column);
            }
            WriteFailure::BadValue(value) if !nulled.contains(&value) => {
                let n = frame.null_value(&value);
                if n == 0 {
                    return Err(MastrError::Db(e));
                }
                warn!("{}: {} occurrences of {:?} set to null", table, n, value);
                nulled.push(value);
            }
            _ => return Err(MastrError::Db(e)),
        }
    }
}

/// Loads the XML members of one archive into DuckDB, one table per entity.
pub struct BulkLoader {
    pub duckdb_path: PathBuf,
}

impl BulkLoader {
    pub fn new<P: Into<PathBuf>>(duckdb_path: P) -> Self {
        Self {
            duckdb_path: duckdb_path.into(),
        }
    }

    pub fn load(&self, archive_path: &Path, filter: &TableFilter) -> Result<LoadReport, MastrError> {
        let mut zip = ZipArchive::new(BufReader::new(File::open(archive_path)?))?;
        let mut names = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            names.push(zip.by_index_raw(i)?.name().to_string());
        }
        if let Some(dir) = self.duckdb_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut conn = open_with_retry(
            &self.duckdb_path,
            8,
            Duration::from_millis(25),
            AccessMode::ReadWrite,
        )?;

        let mut report = LoadReport::default();
        for (index, member) in load_order(&names) {
            if !filter.accepts(&member.table) {
                debug!("{}: table {} filtered out", member.name, member.table);
                report.skipped.push(member.name);
                continue;
            }
            let mut bytes = Vec::new();
            zip.by_index(index)?.read_to_end(&mut bytes)?;
            let xml = decode(&bytes)?;
            drop(bytes);
            let (frame, excised) = parse_with_excision(xml, &member.name)?;
            let mut typed = coerce(frame, &member.table);
            let mode = member.mode();
            if typed.columns.is_empty() {
                if mode == WriteMode::Append {
                    info!("{}: no rows, nothing written", member.name);
                    report.skipped.push(member.name);
                    continue;
                }
                // an empty first shard still replaces what the previous load left
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(&member.table)))?;
                info!("{}: no rows, dropped {}", member.name, member.table);
                report.members.push(MemberReport {
                    member: member.name,
                    table: member.table,
                    mode,
                    rows: 0,
                    excised,
                    added_columns: Vec::new(),
                    nulled_values: Vec::new(),
                });
                continue;
            }
            let (added_columns, nulled_values) =
                match write_frame(&mut conn, &member.table, mode, &mut typed) {
                    Ok(x) => x,
                    Err(e) => {
                        error!("{}: failed to write {}: {}", member.name, member.table, e);
                        return Err(e);
                    }
                };
            info!(
                "{}: {} rows, {} into {} ({} excised, {} columns added)",
                member.name,
                typed.rows,
                mode,
                member.table,
                excised,
                added_columns.len()
            );
            report.members.push(MemberReport {
                member: member.name,
                table: member.table,
                mode,
                rows: typed.rows,
                excised,
                added_columns,
                nulled_values,
            });
        }
        Ok(report)
    }
}

/// The daily full export: zip files on disk and the DuckDB they are loaded into.
#[derive(Clone, Debug)]
pub struct MastrBulkArchive {
    pub base_dir: String,
    pub duckdb_path: String,
}

impl MastrBulkArchive {
    /// Path of the export of a given day.  Does not check if the file exists.
    pub fn filename(&self, date: &Date) -> PathBuf {
        PathBuf::from(&self.base_dir)
            .join("Raw")
            .join(format!("Gesamtdatenexport_{}.zip", date.strftime("%Y%m%d")))
    }

    /// URL of today's export, read from the download page.
    pub fn resolve_url(&self, http: &Client) -> Result<String, MastrError> {
        resolve_url_from(http, DOWNLOAD_PAGE)
    }

    /// Stream `url` to `path` in 1 MiB chunks.  Returns false if `path` was already there.
    pub fn download(&self, http: &Client, url: &str, path: &Path) -> Result<bool, MastrError> {
        if path.exists() {
            info!("{} exists, not downloading again", path.display());
            return Ok(false);
        }
        let mut response = send_with_retries(|| http.get(url))?;
        if !response.status().is_success() {
            return Err(MastrError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let total = response.content_length();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let part = path.with_extension("zip.part");
        let mut out = File::create(&part)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;
        let mut chunks = 0u64;
        loop {
            let n = response.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            written += n as u64;
            chunks += 1;
            if chunks % 64 == 0 {
                match total {
                    Some(t) if t > 0 => info!(
                        "downloaded {} MiB of {} MiB ({:.0}%)",
                        written >> 20,
                        t >> 20,
                        100.0 * written as f64 / t as f64
                    ),
                    _ => info!("downloaded {} MiB", written >> 20),
                }
            }
        }
        out.flush()?;
        fs::rename(&part, path)?;
        info!("downloaded {} bytes to {}", written, path.display());
        Ok(true)
    }

    /// Load the export of `date` into the archive's DuckDB.
    pub fn update_duckdb(&self, date: &Date, filter: &TableFilter) -> Result<LoadReport, MastrError> {
        let path = self.filename(date);
        if !path.exists() {
            return Err(MastrError::MissingInput(path));
        }
        BulkLoader::new(&self.duckdb_path).load(&path, filter)
    }
}

pub fn resolve_url_from(http: &Client, page: &str) -> Result<String, MastrError> {
    let response = send_with_retries(|| http.get(page))?;
    if !response.status().is_success() {
        return Err(MastrError::HttpStatus {
            url: page.to_string(),
            status: response.status().as_u16(),
        });
    }
    let url = extract_primary_href(&response.text()?)?;
    info!("export URL is {}", url);
    Ok(url)
}
