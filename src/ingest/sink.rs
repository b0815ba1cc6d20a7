use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use jiff::Timestamp;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::MastrError;
use crate::ingest::record::Record;

pub const DELIMITER: u8 = b';';

/// An in-memory copy of one flat file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlatTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl FlatTable {
    pub fn new(header: Vec<String>) -> Self {
        Self {
            header,
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    pub fn value<'a>(&'a self, row: &'a [String], name: &str) -> Option<&'a str> {
        self.column_index(name)
            .and_then(|i| row.get(i))
            .map(|v| v.as_str())
    }

    /// Read a `;` delimited file.  A short last line (a write cut off mid-way) is dropped,
    /// short lines elsewhere are padded with nulls.
    pub fn read(path: &Path) -> Result<FlatTable, MastrError> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(DELIMITER)
            .flexible(true)
            .has_headers(true)
            .from_path(path)?;
        let header: Vec<String> = rdr.headers()?.iter().map(|h| h.to_string()).collect();
        let mut rows: Vec<Vec<String>> = Vec::new();
        for record in rdr.records() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!("skipping unreadable line in {}: {}", path.display(), e);
                    continue;
                }
            };
            rows.push(record.iter().map(|v| v.to_string()).collect());
        }
        if let Some(last) = rows.last() {
            if last.len() < header.len() {
                warn!(
                    "dropping truncated last line of {} ({} of {} fields)",
                    path.display(),
                    last.len(),
                    header.len()
                );
                rows.pop();
            }
        }
        for row in rows.iter_mut() {
            row.resize(header.len(), String::new());
        }
        Ok(FlatTable { header, rows })
    }

    /// Write the table to `path` (replacing it) with a header row.
    pub fn write(&self, path: &Path) -> Result<(), MastrError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(DELIMITER)
            .from_path(path)?;
        wtr.write_record(&self.header)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Append-only flat file.  The header is fixed by the first record written; later
/// records are projected onto it.
pub struct CsvSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CsvSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &Record) -> Result<(), MastrError> {
        self.append_all(std::slice::from_ref(record))
    }

    pub fn append_all(&self, records: &[Record]) -> Result<(), MastrError> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let (mut file, mut header) = open_for_append(&self.path, || {
            first.columns().map(|c| c.to_string()).collect()
        })?;

        let mut added: Vec<String> = Vec::new();
        for column in records.iter().flat_map(|r| r.columns()) {
            if !header.iter().any(|h| h == column) && !added.iter().any(|a| a == column) {
                added.push(column.to_string());
            }
        }
        if !added.is_empty() {
            drop(file);
            info!("{}: adding columns {}", self.path.display(), added.join(", "));
            widen_header(&self.path, &added)?;
            header.extend(added);
            file = OpenOptions::new().append(true).open(&self.path)?;
        }

        let mut wtr = csv::WriterBuilder::new()
            .delimiter(DELIMITER)
            .has_headers(false)
            .from_writer(Vec::new());
        for record in records {
            wtr.write_record(header.iter().map(|h| record.get(h).unwrap_or("")))?;
        }
        let bytes = wtr.into_inner().map_err(|e| MastrError::Io(e.into_error()))?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(())
    }

    /// All values of one column, e.g. the ids already fetched.
    pub fn column_values(&self, column: &str) -> Result<Vec<String>, MastrError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let table = FlatTable::read(&self.path)?;
        let Some(i) = table.column_index(column) else {
            return Ok(Vec::new());
        };
        Ok(table.rows.into_iter().map(|mut r| r.swap_remove(i)).collect())
    }
}

/// Rewrite `path` with `columns` appended to its header, existing rows padded with nulls.
fn widen_header(path: &Path, columns: &[String]) -> Result<(), MastrError> {
    let mut table = FlatTable::read(path)?;
    table.header.extend(columns.iter().cloned());
    let width = table.header.len();
    for row in table.rows.iter_mut() {
        row.resize(width, String::new());
    }
    let tmp = path.with_extension("widen.tmp");
    table.write(&tmp)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Cut a trailing partial line (a write cut off mid-way) back to the last newline.
/// Returns the new length of the file.
fn drop_partial_line(file: &mut File, len: u64) -> Result<u64, MastrError> {
    if len == 0 {
        return Ok(0);
    }
    let mut buf = vec![0u8; 64 * 1024];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(i) = chunk.iter().rposition(|&b| b == b'\n') {
            let keep = start + i as u64 + 1;
            if keep < len {
                warn!("dropping {} bytes of a partial last line", len - keep);
                file.set_len(keep)?;
            }
            return Ok(keep);
        }
        end = start;
    }
    warn!("no complete line found, starting over");
    file.set_len(0)?;
    Ok(0)
}

/// Open `path` for appending.  Returns the header in use, writing `new_header()` if the
/// file is new or empty.  A partial last line is removed first.
fn open_for_append<F>(path: &Path, new_header: F) -> Result<(File, Vec<String>), MastrError>
where
    F: FnOnce() -> Vec<String>,
{
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;
    let len = file.metadata()?.len();
    if drop_partial_line(&mut file, len)? == 0 {
        let header = new_header();
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(DELIMITER)
            .from_writer(Vec::new());
        wtr.write_record(&header)?;
        let bytes = wtr.into_inner().map_err(|e| MastrError::Io(e.into_error()))?;
        file.write_all(&bytes)?;
        return Ok((file, header));
    }

    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(DELIMITER)
        .has_headers(true)
        .from_path(path)?;
    let header = rdr.headers()?.iter().map(|h| h.to_string()).collect();
    Ok((file, header))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailStage {
    #[serde(rename = "Second fail")]
    Second,
    #[serde(rename = "Third fail")]
    Third,
}

impl Display for FailStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailStage::Second => write!(f, "Second fail"),
            FailStage::Third => write!(f, "Third fail"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailRecord {
    pub id: String,
    pub timestamp: Timestamp,
    pub comment: FailStage,
}

/// Append-only log of ids whose fetch failed after the second or the third attempt.
pub struct FailSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FailSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, id: &str, stage: FailStage) -> Result<(), MastrError> {
        let record = FailRecord {
            id: id.to_string(),
            timestamp: Timestamp::now(),
            comment: stage,
        };
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let (mut file, _) = open_for_append(&self.path, || {
            vec!["id".to_string(), "timestamp".to_string(), "comment".to_string()]
        })?;
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(DELIMITER)
            .has_headers(false)
            .from_writer(Vec::new());
        wtr.serialize(&record)?;
        let bytes = wtr.into_inner().map_err(|e| MastrError::Io(e.into_error()))?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(())
    }

    /// Every fail record in file order.  Unreadable lines are skipped.
    pub fn read_all(&self) -> Result<Vec<FailRecord>, MastrError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(DELIMITER)
            .has_headers(true)
            .from_path(&self.path)?;
        let mut out = Vec::new();
        for row in rdr.deserialize::<FailRecord>() {
            match row {
                Ok(r) => out.push(r),
                Err(e) => warn!("skipping fail record in {}: {}", self.path.display(), e),
            }
        }
        Ok(out)
    }
}
