use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MastrError {
    #[error("failed to read credentials at {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("no credentials available: {0}")]
    MissingCredentials(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("input file not found: {0}")]
    MissingInput(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("SOAP fault from {operation}: {message}")]
    Soap { operation: String, message: String },

    #[error("operation {0} is not offered by the service description")]
    UnknownOperation(String),

    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("database error: {0}")]
    Db(#[from] duckdb::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("could not find the download link: {0}")]
    Scrape(String),

    #[error("connection aborted: no successful fetch for {0:?}")]
    ConnectionAborted(std::time::Duration),
}

impl From<quick_xml::Error> for MastrError {
    fn from(e: quick_xml::Error) -> Self {
        MastrError::Xml(e.to_string())
    }
}
