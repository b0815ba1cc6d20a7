use std::path::Path;

use itertools::Itertools;
use jiff::Timestamp;
use log::{info, warn};

use crate::carrier::Carrier;
use crate::error::MastrError;
use crate::ingest::sink::FlatTable;

/// Columns identifying one master-list entry.  Repeated polling of the master list
/// produces exact duplicates on these, which are dropped.
pub const DEDUP_KEY: [&str; 12] = [
    "EinheitMastrNummer",
    "Name",
    "Einheittyp",
    "Standort",
    "Bruttoleistung",
    "Erzeugungsleistung",
    "EinheitBetriebsstatus",
    "Anlagenbetreiber",
    "EegMastrNummer",
    "KwkMastrNummer",
    "SpeMastrNummer",
    "GenMastrNummer",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatalogOutcome {
    /// catalog written with this many units
    Built(usize),
    /// catalog already there, left untouched
    Skipped,
    /// no master list to build from
    MissingInput,
}

/// Keep the first row of every group of rows equal on [`DEDUP_KEY`].  Key columns
/// missing from the header count as null.
pub fn dedup(table: &FlatTable) -> FlatTable {
    let key: Vec<Option<usize>> = DEDUP_KEY.iter().map(|k| table.column_index(k)).collect();
    let rows = table
        .rows
        .iter()
        .unique_by(|row| {
            key.iter()
                .map(|i| i.and_then(|i| row.get(i)).map(String::as_str).unwrap_or(""))
                .collect::<Vec<&str>>()
        })
        .cloned()
        .collect();
    FlatTable {
        header: table.header.clone(),
        rows,
    }
}

/// Units of one carrier from the master list, deduplicated, with a fresh `index`
/// column and `version`/`timestamp` filled where missing.
pub fn carrier_rows(master: &FlatTable, carrier: Carrier, version: &str) -> FlatTable {
    let tags = carrier.class_tags();
    let class = master.column_index("Einheittyp");
    let filtered = FlatTable {
        header: master.header.clone(),
        rows: master
            .rows
            .iter()
            .filter(|row| {
                class
                    .and_then(|i| row.get(i))
                    .is_some_and(|v| tags.contains(&v.as_str()))
            })
            .cloned()
            .collect(),
    };
    let unique = dedup(&filtered);

    // drop a stale index, append the stamps if the master list has none
    let keep: Vec<usize> = (0..unique.header.len())
        .filter(|&i| unique.header[i] != "index")
        .collect();
    let mut header = vec!["index".to_string()];
    header.extend(keep.iter().map(|&i| unique.header[i].clone()));
    for stamp in ["version", "timestamp"] {
        if !header.iter().any(|h| h == stamp) {
            header.push(stamp.to_string());
        }
    }
    let version_col = header.iter().position(|h| h == "version");
    let timestamp_col = header.iter().position(|h| h == "timestamp");
    let now = Timestamp::now().to_string();

    let mut catalog = FlatTable::new(header);
    for (n, row) in unique.rows.iter().enumerate() {
        let mut out = vec![n.to_string()];
        out.extend(keep.iter().map(|&i| row[i].clone()));
        out.resize(catalog.header.len(), String::new());
        if let Some(i) = version_col {
            if out[i].is_empty() {
                out[i] = version.to_string();
            }
        }
        if let Some(i) = timestamp_col {
            if out[i].is_empty() {
                out[i] = now.clone();
            }
        }
        catalog.rows.push(out);
    }
    catalog
}

/// Build the catalog of `carrier` from the master list at `master_path`.
/// An existing catalog is never rebuilt.
pub fn build_catalog(
    master_path: &Path,
    carrier: Carrier,
    out_path: &Path,
    version: &str,
) -> Result<CatalogOutcome, MastrError> {
    if out_path.exists() {
        info!("{} catalog exists at {}, skipping", carrier, out_path.display());
        return Ok(CatalogOutcome::Skipped);
    }
    if !master_path.exists() {
        warn!(
            "{} catalog not built: {}",
            carrier,
            MastrError::MissingInput(master_path.to_path_buf())
        );
        return Ok(CatalogOutcome::MissingInput);
    }
    let master = FlatTable::read(master_path)?;
    let catalog = carrier_rows(&master, carrier, version);
    catalog.write(out_path)?;
    info!(
        "{} catalog: {} units out of {} master rows",
        carrier,
        catalog.rows.len(),
        master.rows.len()
    );
    Ok(CatalogOutcome::Built(catalog.rows.len()))
}

/// Distinct non-null values of `column`, in order of first appearance.
pub fn ids(table: &FlatTable, column: &str) -> Vec<String> {
    let Some(i) = table.column_index(column) else {
        return Vec::new();
    };
    table
        .rows
        .iter()
        .filter_map(|row| row.get(i))
        .filter(|v| !v.is_empty())
        .unique()
        .cloned()
        .collect()
}
