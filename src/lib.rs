pub mod carrier;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod soap;
pub mod utils;
