use crate::config::Settings;
use crate::db::mastr::bulk_archive::MastrBulkArchive;
use crate::db::mastr::unit_archive::MastrUnitArchive;

/// Production locations of the archives.  Rooted at `$MASTR_DATA_DIR`, see [`Settings`].
pub struct ProdDb {}

impl ProdDb {
    pub fn mastr_units() -> MastrUnitArchive {
        let settings = Settings::from_env();
        MastrUnitArchive {
            base_dir: settings.data_dir.join("units").to_string_lossy().to_string(),
        }
    }

    pub fn mastr_bulk() -> MastrBulkArchive {
        let settings = Settings::from_env();
        MastrBulkArchive {
            base_dir: settings.data_dir.join("bulk").to_string_lossy().to_string(),
            duckdb_path: settings.duckdb_path.to_string_lossy().to_string(),
        }
    }
}
