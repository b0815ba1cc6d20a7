use std::collections::HashMap;

use lazy_static::lazy_static;

/// Logical column type used to coerce the text of the bulk export.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalType {
    Text,
    Int,
    Float,
    Date,
    DateTime,
}

use LogicalType::*;

// Columns shared by the unit tables of all carriers
const UNIT_COLUMNS: &[(&str, LogicalType)] = &[
    ("DatumLetzteAktualisierung", DateTime),
    ("LokationMaStRNummer", Text),
    ("Postleitzahl", Text),
    ("Gemeindeschluessel", Text),
    ("Laengengrad", Float),
    ("Breitengrad", Float),
    ("Registrierungsdatum", Date),
    ("Inbetriebnahmedatum", Date),
    ("EinheitSystemstatus", Int),
    ("EinheitBetriebsstatus", Int),
    ("DatumEndgueltigeStilllegung", Date),
    ("DatumBeginnVoruebergehendeStilllegung", Date),
    ("DatumWiederaufnahmeBetrieb", Date),
    ("GeplantesInbetriebnahmedatum", Date),
    ("Bruttoleistung", Float),
    ("Nettonennleistung", Float),
    ("Energietraeger", Int),
    ("Bundesland", Int),
    ("Land", Int),
    ("Einspeisungsart", Int),
    ("AnschlussAnHoechstOderHochSpannung", Int),
    ("FernsteuerbarkeitNb", Int),
    ("DatumDesBetreiberwechsels", Date),
    ("DatumRegistrierungDesBetreiberwechsels", Date),
];

const EEG_COLUMNS: &[(&str, LogicalType)] = &[
    ("DatumLetzteAktualisierung", DateTime),
    ("Registrierungsdatum", Date),
    ("EegInbetriebnahmedatum", Date),
    ("InstallierteLeistung", Float),
    ("AnlageBetriebsstatus", Int),
    ("Zuschlagsdatum", Date),
];

lazy_static! {
    /// Column types per table.  Columns not listed are text.
    static ref TABLE_METADATA: HashMap<&'static str, HashMap<&'static str, LogicalType>> = {
        let mut map: HashMap<&'static str, HashMap<&'static str, LogicalType>> = HashMap::new();
        let units = |extra: &[(&'static str, LogicalType)]| {
            UNIT_COLUMNS.iter().chain(extra.iter()).copied().collect::<HashMap<_, _>>()
        };
        map.insert("einheitenwind", units(&[
            ("Nabenhoehe", Float),
            ("Rotordurchmesser", Float),
            ("Lage", Int),
            ("Hersteller", Int),
            ("Technologie", Int),
            ("AuflageAbschaltungLeistungsbegrenzung", Int),
        ]));
        map.insert("einheitensolar", units(&[
            ("AnzahlModule", Int),
            ("Lage", Int),
            ("Leistungsbegrenzung", Int),
            ("Hauptausrichtung", Int),
            ("HauptausrichtungNeigungswinkel", Int),
            ("ZugeordneteWirkleistungWechselrichter", Float),
            ("Nutzungsbereich", Int),
        ]));
        map.insert("einheitenbiomasse", units(&[
            ("Hauptbrennstoff", Int),
            ("Biomasseart", Int),
        ]));
        map.insert("einheitenwasser", units(&[
            ("ArtDerWasserkraftanlage", Int),
            ("ArtDesZuflusses", Int),
            ("Pumpspeichertechnologie", Int),
        ]));
        map.insert("einheitenverbrennung", units(&[
            ("Hauptbrennstoff", Int),
            ("Technologie", Int),
            ("DatumBaubeginn", Date),
            ("AnzeigeEinerStilllegung", Int),
        ]));
        map.insert("einheitenkernkraft", units(&[("Technologie", Int)]));
        map.insert("einheitenstromspeicher", units(&[
            ("Batterietechnologie", Int),
            ("NutzbareSpeicherkapazitaet", Float),
            ("Technologie", Int),
            ("AcDcKoppelung", Int),
        ]));
        map.insert("einheitengasspeicher", units(&[("Speichervolumen", Float)]));
        map.insert("einheitengaserzeuger", units(&[("Erzeugungsleistung", Float)]));
        map.insert("einheitengeothermiegrubengasdruckentspannung", units(&[]));
        map.insert(
            "anlageneegwind",
            EEG_COLUMNS.iter().chain([("PrototypAnlage", Int)].iter()).copied().collect(),
        );
        map.insert("anlageneegsolar", EEG_COLUMNS.iter().copied().collect());
        map.insert("anlageneegbiomasse", EEG_COLUMNS.iter().copied().collect());
        map.insert("anlageneegwasser", EEG_COLUMNS.iter().copied().collect());
        map.insert("anlageneegspeicher", EEG_COLUMNS.iter().copied().collect());
        map.insert("anlagenkwk", [
            ("DatumLetzteAktualisierung", DateTime),
            ("Inbetriebnahmedatum", Date),
            ("Zulassungsdatum", Date),
            ("ThermischeNutzleistung", Float),
            ("ElektrischeKwkLeistung", Float),
            ("AnlageBetriebsstatus", Int),
        ].into_iter().collect());
        map.insert("einheitengenehmigung", [
            ("DatumLetzteAktualisierung", DateTime),
            ("Datum", Date),
            ("Registrierungsdatum", Date),
            ("Art", Int),
        ].into_iter().collect());
        map.insert("marktakteure", [
            ("DatumLetzteAktualisierung", DateTime),
            ("Registrierungsdatum", Date),
            ("Taetigkeitsbeginn", Date),
            ("Taetigkeitsende", Date),
            ("Marktfunktion", Int),
            ("Personenart", Int),
            ("Land", Int),
            ("Bundesland", Int),
        ].into_iter().collect());
        map.insert("lokationen", [
            ("DatumLetzteAktualisierung", DateTime),
            ("Lokationtyp", Int),
        ].into_iter().collect());
        map.insert("netzanschlusspunkte", [
            ("DatumLetzteAktualisierung", DateTime),
            ("Spannungsebene", Int),
            ("Nettoengpassleistung", Float),
            ("Netzanschlusskapazitaet", Float),
            ("MaximaleEinspeiseleistung", Float),
            ("MaximaleAusspeiseleistung", Float),
        ].into_iter().collect());
        map.insert("katalogwerte", [("Id", Int), ("KatalogKategorieId", Int)].into_iter().collect());
        map.insert("katalogkategorien", [("Id", Int)].into_iter().collect());
        map
    };
}

/// Declared type of `column` in `table`, text when undeclared.
pub fn column_type(table: &str, column: &str) -> LogicalType {
    TABLE_METADATA
        .get(table)
        .and_then(|columns| columns.get(column))
        .copied()
        .unwrap_or(Text)
}

pub fn has_metadata(table: &str) -> bool {
    TABLE_METADATA.contains_key(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_and_default_types() {
        assert_eq!(column_type("einheitenwind", "Nabenhoehe"), Float);
        assert_eq!(column_type("einheitenwind", "Inbetriebnahmedatum"), Date);
        assert_eq!(column_type("einheitensolar", "DatumLetzteAktualisierung"), DateTime);
        assert_eq!(column_type("einheitenwind", "NameWindpark"), Text);
        assert_eq!(column_type("unknown", "Bruttoleistung"), Text);
        assert!(has_metadata("anlagenkwk"));
        assert!(!has_metadata("einheiten"));
    }
}
