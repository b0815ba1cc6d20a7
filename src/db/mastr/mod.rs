pub mod bulk_archive;
pub mod catalog;
pub mod materialize;
pub mod table_metadata;
pub mod unit_archive;
pub mod xml_table;
