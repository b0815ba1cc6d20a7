use std::fmt::Display;
use std::str::FromStr;

use crate::error::MastrError;

/// Energy carrier of a generation unit.  Each one has its own SOAP operations and its
/// own column schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Carrier {
    Wind,
    Solar,
    Biomass,
    Hydro,
    Nuclear,
    Combustion,
    Gas,
    Storage,
    Gsgk,
}

/// Which auxiliary record is joined onto the unit details of a carrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Linked {
    /// renewable-subsidy (EEG) record, keyed by `EegMastrNummer`
    Eeg,
    /// combined-heat-and-power (KWK) record, keyed by `KwkMastrNummer`
    Kwk,
}

impl Linked {
    pub fn key_column(&self) -> &'static str {
        match self {
            Linked::Eeg => "EegMastrNummer",
            Linked::Kwk => "KwkMastrNummer",
        }
    }

    /// Role suffix of the flat file holding these records
    pub fn role(&self) -> &'static str {
        match self {
            Linked::Eeg => "eeg",
            Linked::Kwk => "kwk",
        }
    }
}

impl Carrier {
    pub fn all() -> [Carrier; 9] {
        use Carrier::*;
        [Wind, Solar, Biomass, Hydro, Nuclear, Combustion, Gas, Storage, Gsgk]
    }

    /// Used in file names, e.g. `bnetza_mastr_wind_unit.csv`
    pub fn slug(&self) -> &'static str {
        match self {
            Carrier::Wind => "wind",
            Carrier::Solar => "solar",
            Carrier::Biomass => "biomass",
            Carrier::Hydro => "hydro",
            Carrier::Nuclear => "nuclear",
            Carrier::Combustion => "combustion",
            Carrier::Gas => "gas",
            Carrier::Storage => "storage",
            Carrier::Gsgk => "gsgk",
        }
    }

    /// Values of the `Einheittyp` column in the master unit list belonging to this carrier.
    pub fn class_tags(&self) -> &'static [&'static str] {
        match self {
            Carrier::Wind => &["Windeinheit"],
            Carrier::Solar => &["Solareinheit"],
            Carrier::Biomass => &["Biomasse"],
            Carrier::Hydro => &["Wasser"],
            Carrier::Nuclear => &["Kernenergie"],
            Carrier::Combustion => &["Verbrennung"],
            Carrier::Gas => &["Gaserzeugungseinheit"],
            Carrier::Storage => &["Stromspeichereinheit"],
            Carrier::Gsgk => &[
                "Geothermie",
                "Solarthermie",
                "Grubengas",
                "Klärschlamm",
                "Druckentspannung",
            ],
        }
    }

    fn operation_suffix(&self) -> &'static str {
        match self {
            Carrier::Wind => "Wind",
            Carrier::Solar => "Solar",
            Carrier::Biomass => "Biomasse",
            Carrier::Hydro => "Wasser",
            Carrier::Nuclear => "Kernkraft",
            Carrier::Combustion => "Verbrennung",
            Carrier::Gas => "GasErzeuger",
            Carrier::Storage => "StromSpeicher",
            Carrier::Gsgk => "GeoSolarthermieGrubenKlaerschlammDruckentspannung",
        }
    }

    /// `GetEinheit<Carrier>`
    pub fn unit_operation(&self) -> String {
        format!("GetEinheit{}", self.operation_suffix())
    }

    /// `GetAnlageEeg<Carrier>`, for carriers with subsidy records
    pub fn subsidy_operation(&self) -> Option<String> {
        match self {
            Carrier::Storage => Some("GetAnlageEegSpeicher".to_string()),
            Carrier::Nuclear | Carrier::Combustion | Carrier::Gas => None,
            _ => Some(format!("GetAnlageEeg{}", self.operation_suffix())),
        }
    }

    pub fn linked(&self) -> Option<Linked> {
        match self {
            Carrier::Nuclear | Carrier::Gas => None,
            Carrier::Combustion => Some(Linked::Kwk),
            _ => Some(Linked::Eeg),
        }
    }
}

impl Display for Carrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug())
    }
}

impl FromStr for Carrier {
    type Err = MastrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Carrier::all()
            .into_iter()
            .find(|c| c.slug() == s.to_lowercase())
            .ok_or_else(|| MastrError::InvalidSetting(format!("unknown carrier {:?}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations() {
        assert_eq!(Carrier::Wind.unit_operation(), "GetEinheitWind");
        assert_eq!(
            Carrier::Hydro.subsidy_operation().as_deref(),
            Some("GetAnlageEegWasser")
        );
        assert_eq!(Carrier::Nuclear.subsidy_operation(), None);
        assert_eq!(Carrier::Combustion.linked(), Some(Linked::Kwk));
        assert_eq!("Solar".parse::<Carrier>().ok(), Some(Carrier::Solar));
        assert!("coal".parse::<Carrier>().is_err());
    }
}
