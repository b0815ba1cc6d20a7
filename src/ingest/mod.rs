pub mod blacklist;
pub mod driver;
pub mod record;
pub mod sink;
