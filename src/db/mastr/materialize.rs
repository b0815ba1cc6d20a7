use std::collections::HashMap;
use std::path::Path;

use jiff::Timestamp;
use log::{info, warn};

use crate::carrier::Carrier;
use crate::db::mastr::unit_archive::MastrUnitArchive;
use crate::error::MastrError;
use crate::ingest::sink::FlatTable;

/// Suffix of unit-detail columns whose name is already taken.
pub const UNIT_SUFFIX: &str = "_w";
/// Suffix of EEG/KWK-detail columns whose name is already taken.
pub const LINKED_SUFFIX: &str = "_e";

fn read_or_empty(path: &Path) -> Result<FlatTable, MastrError> {
    if path.exists() {
        FlatTable::read(path)
    } else {
        info!("{} not found, joining nothing", path.display());
        Ok(FlatTable::default())
    }
}

/// Index `table` by `key`, keeping the row with the latest `timestamp` when a key
/// was fetched more than once.  Rows without a key are ignored.
fn latest_by_key(table: &FlatTable, key: &str) -> HashMap<String, usize> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let Some(k) = table.column_index(key) else {
        return index;
    };
    let ts = table.column_index("timestamp");
    let stamp = |row: usize| -> Option<Timestamp> {
        ts.and_then(|i| table.rows[row].get(i))
            .and_then(|v| v.parse::<Timestamp>().ok())
    };
    for (n, row) in table.rows.iter().enumerate() {
        let id = &row[k];
        if id.is_empty() {
            continue;
        }
        match index.get(id) {
            Some(&seen) if stamp(seen) > stamp(n) => {}
            _ => {
                index.insert(id.clone(), n);
            }
        }
    }
    index
}

/// Left-join `right` onto `left`, matching `left[left_key]` with `right[right_key]`.
/// The right key column is not repeated, other right columns whose name is taken get
/// `suffix`.
fn left_join(
    left: &FlatTable,
    left_key: &str,
    right: &FlatTable,
    right_key: &str,
    suffix: &str,
) -> FlatTable {
    let lk = left.column_index(left_key);
    let index = latest_by_key(right, right_key);
    let right_cols: Vec<usize> = (0..right.header.len())
        .filter(|&i| right.header[i] != right_key)
        .collect();

    let mut header = left.header.clone();
    for &i in &right_cols {
        let name = &right.header[i];
        if header.contains(name) {
            header.push(format!("{}{}", name, suffix));
        } else {
            header.push(name.clone());
        }
    }

    let mut out = FlatTable::new(header);
    for row in &left.rows {
        let mut joined = row.clone();
        let hit = lk
            .and_then(|k| row.get(k))
            .and_then(|id| index.get(id))
            .map(|&n| &right.rows[n]);
        match hit {
            Some(r) => joined.extend(right_cols.iter().map(|&i| r[i].clone())),
            None => joined.extend(right_cols.iter().map(|_| String::new())),
        }
        out.rows.push(joined);
    }
    out
}

/// Join the catalog, unit details and EEG or KWK details of `carrier` into
/// `bnetza_mastr_<carrier>.csv`.  Returns the number of rows written.
pub fn materialize(archive: &MastrUnitArchive, carrier: Carrier) -> Result<usize, MastrError> {
    let catalog_path = archive.catalog_file(carrier);
    if !catalog_path.exists() {
        return Err(MastrError::MissingInput(catalog_path));
    }
    let mut catalog = FlatTable::read(&catalog_path)?;
    if let Some(k) = catalog.column_index("EinheitMastrNummer") {
        let before = catalog.rows.len();
        catalog.rows.retain(|row| !row[k].is_empty());
        if catalog.rows.len() < before {
            warn!(
                "{}: dropped {} catalog rows without unit id",
                carrier,
                before - catalog.rows.len()
            );
        }
    }

    let units = read_or_empty(&archive.unit_file(carrier))?;
    let mut joined = left_join(
        &catalog,
        "EinheitMastrNummer",
        &units,
        "EinheitMastrNummer",
        UNIT_SUFFIX,
    );

    if let Some(linked) = carrier.linked() {
        let key = linked.key_column();
        let details = read_or_empty(&archive.linked_file(carrier, linked))?;
        // the catalog carries the link, the unit details may carry it too
        let left_key = if joined.column_index(key).is_some() {
            key.to_string()
        } else {
            format!("{}{}", key, UNIT_SUFFIX)
        };
        joined = left_join(&joined, &left_key, &details, key, LINKED_SUFFIX);
    }

    let out = archive.joined_file(carrier);
    joined.write(&out)?;
    info!("{}: {} rows joined into {}", carrier, joined.rows.len(), out.display());
    Ok(joined.rows.len())
}
