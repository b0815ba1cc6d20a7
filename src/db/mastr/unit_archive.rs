use std::path::PathBuf;

use crate::carrier::{Carrier, Linked};

/// Which fetch a fail file belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailTarget {
    /// unit details, `_fail_u`
    Unit,
    /// EEG or KWK records, `_fail_e`
    Linked,
    /// permits, `_fail_p`
    Permit,
}

/// Flat files of the per-unit SOAP path, all in one directory.
#[derive(Clone, Debug)]
pub struct MastrUnitArchive {
    pub base_dir: String,
}

impl MastrUnitArchive {
    fn file(&self, name: String) -> PathBuf {
        PathBuf::from(&self.base_dir).join(name)
    }

    /// The master unit list, input of every catalog.
    pub fn power_unit_file(&self) -> PathBuf {
        self.file("bnetza_mastr_power-unit.csv".to_string())
    }

    pub fn catalog_file(&self, carrier: Carrier) -> PathBuf {
        self.file(format!("bnetza_mastr_{}_power-unit.csv", carrier))
    }

    pub fn unit_file(&self, carrier: Carrier) -> PathBuf {
        self.file(format!("bnetza_mastr_{}_unit.csv", carrier))
    }

    /// `bnetza_mastr_<carrier>_eeg.csv` or `bnetza_mastr_<carrier>_kwk.csv`
    pub fn linked_file(&self, carrier: Carrier, linked: Linked) -> PathBuf {
        self.file(format!("bnetza_mastr_{}_{}.csv", carrier, linked.role()))
    }

    pub fn permit_file(&self, carrier: Carrier) -> PathBuf {
        self.file(format!("bnetza_mastr_{}_permit.csv", carrier))
    }

    pub fn fail_file(&self, carrier: Carrier, target: FailTarget) -> PathBuf {
        let suffix = match target {
            FailTarget::Unit => "u",
            FailTarget::Linked => "e",
            FailTarget::Permit => "p",
        };
        self.file(format!("bnetza_mastr_{}_fail_{}.csv", carrier, suffix))
    }

    /// Output of the join.
    pub fn joined_file(&self, carrier: Carrier) -> PathBuf {
        self.file(format!("bnetza_mastr_{}.csv", carrier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names() {
        let archive = MastrUnitArchive {
            base_dir: "/tmp/mastr".to_string(),
        };
        assert_eq!(
            archive.power_unit_file(),
            PathBuf::from("/tmp/mastr/bnetza_mastr_power-unit.csv")
        );
        assert_eq!(
            archive.catalog_file(Carrier::Hydro),
            PathBuf::from("/tmp/mastr/bnetza_mastr_hydro_power-unit.csv")
        );
        assert_eq!(
            archive.linked_file(Carrier::Combustion, Linked::Kwk),
            PathBuf::from("/tmp/mastr/bnetza_mastr_combustion_kwk.csv")
        );
        assert_eq!(
            archive.fail_file(Carrier::Wind, FailTarget::Linked),
            PathBuf::from("/tmp/mastr/bnetza_mastr_wind_fail_e.csv")
        );
        assert_eq!(
            archive.joined_file(Carrier::Solar),
            PathBuf::from("/tmp/mastr/bnetza_mastr_solar.csv")
        );
    }
}
