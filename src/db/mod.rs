pub mod mastr;
pub mod prod_db;
