pub mod client;
pub mod envelope;
pub mod fetcher;
pub mod power_units;
pub mod quota;
