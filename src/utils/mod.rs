pub mod lib_duckdb;
pub mod log_filter;
