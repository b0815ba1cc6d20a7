use std::collections::HashMap;
use std::io::Read;

use flate2::read::GzDecoder;
use jiff::civil::{Date, DateTime};
use lazy_static::lazy_static;
use log::{debug, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;

use crate::db::mastr::table_metadata::{column_type, LogicalType};
use crate::error::MastrError;
use crate::utils::lib_duckdb::quote_literal;

lazy_static! {
    static ref YEAR_PREFIX: Regex = Regex::new(r"^\s*(-?\d+)-\d{1,2}-\d{1,2}").unwrap();
}

/// Decode the bytes of one archive member.  Gzipped members are inflated first.  The
/// encoding comes from the byte-order mark; without one, NUL bytes in the first code
/// unit decide between UTF-16 and UTF-8.
pub fn decode(bytes: &[u8]) -> Result<String, MastrError> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut inflated = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut inflated)?;
        return decode(&inflated);
    }
    match bytes {
        [0xff, 0xfe, rest @ ..] => Ok(utf16(rest, u16::from_le_bytes)),
        [0xfe, 0xff, rest @ ..] => Ok(utf16(rest, u16::from_be_bytes)),
        [0xef, 0xbb, 0xbf, rest @ ..] => utf8(rest),
        [a, 0, ..] if *a != 0 => Ok(utf16(bytes, u16::from_le_bytes)),
        [0, b, ..] if *b != 0 => Ok(utf16(bytes, u16::from_be_bytes)),
        _ => utf8(bytes),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, MastrError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| MastrError::Xml(format!("member is neither UTF-16 nor UTF-8: {}", e)))
}

fn utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    if bytes.len() % 2 == 1 {
        warn!("odd number of bytes in UTF-16 member, ignoring the last one");
    }
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| unit([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units)
}

/// A parse failure at byte `position` of the decoded text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

/// Rows and cells of one member, all values still text.  `None` is null.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

fn is_invalid_xml_char(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}' | '\u{fffe}' | '\u{ffff}')
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// The root element holds the rows, each row element holds one element per cell.
pub fn parse_rows(xml: &str) -> Result<Frame, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut frame = Frame::default();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut row: Vec<Option<String>> = Vec::new();
    let mut cell: Option<usize> = None;
    let mut depth = 0usize;

    loop {
        let before = reader.buffer_position() as usize;
        let event = reader.read_event().map_err(|e| ParseError {
            position: reader.error_position() as usize,
            message: e.to_string(),
        })?;
        match event {
            Event::Start(e) => {
                depth += 1;
                match depth {
                    2 => row = vec![None; frame.columns.len()],
                    3 => cell = Some(column_of(&mut frame, &mut index, &mut row, local_name(&e))),
                    _ => {}
                }
            }
            Event::Empty(e) => match depth + 1 {
                2 => frame.rows.push(vec![None; frame.columns.len()]),
                3 => {
                    column_of(&mut frame, &mut index, &mut row, local_name(&e));
                }
                _ => {}
            },
            Event::Text(t) if depth == 3 => {
                let text = t.unescape().map_err(|e| ParseError {
                    position: before,
                    message: e.to_string(),
                })?;
                if let Some(c) = text.chars().find(|&c| is_invalid_xml_char(c)) {
                    return Err(ParseError {
                        position: before,
                        message: format!("invalid XML character {:?}", c),
                    });
                }
                push_text(&mut row, cell, &text);
            }
            Event::CData(t) if depth == 3 => {
                let text = String::from_utf8_lossy(&t.into_inner()).into_owned();
                push_text(&mut row, cell, &text);
            }
            Event::End(_) => {
                match depth {
                    2 => frame.rows.push(std::mem::take(&mut row)),
                    3 => cell = None,
                    0 => {
                        return Err(ParseError {
                            position: before,
                            message: "unbalanced end tag".to_string(),
                        })
                    }
                    _ => {}
                }
                depth -= 1;
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ParseError {
            position: xml.len(),
            message: "unexpected end of document".to_string(),
        });
    }
    let width = frame.columns.len();
    for r in frame.rows.iter_mut() {
        r.resize(width, None);
    }
    Ok(frame)
}

fn column_of(
    frame: &mut Frame,
    index: &mut HashMap<String, usize>,
    row: &mut Vec<Option<String>>,
    name: String,
) -> usize {
    let i = match index.get(&name) {
        Some(&i) => i,
        None => {
            frame.columns.push(name.clone());
            index.insert(name, frame.columns.len() - 1);
            frame.columns.len() - 1
        }
    };
    if row.len() <= i {
        row.resize(i + 1, None);
    }
    i
}

fn push_text(row: &mut [Option<String>], cell: Option<usize>, text: &str) {
    let Some(i) = cell else { return };
    match &mut row[i] {
        Some(v) => {
            v.push(',');
            v.push_str(text);
        }
        None => row[i] = Some(text.to_string()),
    }
}

/// The span to cut for an error at `position`: after the closest `>` before it, up to
/// the next `<`.
pub fn excision_span(xml: &[u8], position: usize) -> (usize, usize) {
    let position = position.min(xml.len());
    let start = xml[..position]
        .iter()
        .rposition(|&b| b == b'>')
        .map(|i| i + 1)
        .unwrap_or(0);
    let end = xml[position..]
        .iter()
        .position(|&b| b == b'<')
        .map(|i| position + i)
        .unwrap_or(xml.len());
    (start, end)
}

/// Parse `xml`, cutting out the content of every element the parser chokes on.  Returns
/// the frame and the number of spans cut.  A failure that leaves nothing to cut is fatal.
pub fn parse_with_excision(mut xml: String, member: &str) -> Result<(Frame, usize), MastrError> {
    let mut excised = 0;
    loop {
        match parse_rows(&xml) {
            Ok(frame) => return Ok((frame, excised)),
            Err(e) => {
                let (start, end) = excision_span(xml.as_bytes(), e.position);
                if start >= end {
                    return Err(MastrError::Xml(format!(
                        "{}: {} at byte {}",
                        member, e.message, e.position
                    )));
                }
                let cut: String = xml[start..end].chars().take(80).collect();
                warn!(
                    "{}: {} at byte {}, excising {:?}",
                    member, e.message, e.position, cut
                );
                xml.replace_range(start..end, "");
                excised += 1;
            }
        }
    }
}

/// Column type in the database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlType {
    Varchar,
    BigInt,
    Double,
    Date,
    Timestamp,
}

impl SqlType {
    pub fn ddl(&self) -> &'static str {
        match self {
            SqlType::Varchar => "VARCHAR",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE",
            SqlType::Date => "DATE",
            SqlType::Timestamp => "TIMESTAMP",
        }
    }
}

/// A typed column.  Values are kept in the canonical text form of their type.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub sql_type: SqlType,
    pub values: Vec<Option<String>>,
}

impl Column {
    /// SQL literal of one value
    pub fn literal(&self, row: usize) -> String {
        match &self.values[row] {
            None => "NULL".to_string(),
            Some(v) => match self.sql_type {
                SqlType::Varchar => quote_literal(v),
                SqlType::BigInt | SqlType::Double => v.clone(),
                SqlType::Date => format!("DATE {}", quote_literal(v)),
                SqlType::Timestamp => format!("TIMESTAMP {}", quote_literal(v)),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypedFrame {
    pub columns: Vec<Column>,
    pub rows: usize,
}

impl TypedFrame {
    /// Replace every occurrence of `value` with null.  Returns how many were replaced.
    pub fn null_value(&mut self, value: &str) -> usize {
        let mut n = 0;
        for column in self.columns.iter_mut() {
            for v in column.values.iter_mut() {
                if v.as_deref() == Some(value) {
                    *v = None;
                    n += 1;
                }
            }
        }
        n
    }
}

/// Whether a date-like value lies outside years 1..=9999.  `None` if it does not look
/// like a date.
fn out_of_range(value: &str) -> Option<bool> {
    let caps = YEAR_PREFIX.captures(value)?;
    let year: i64 = caps[1].parse().ok()?;
    Some(!(1..=9999).contains(&year))
}

fn coerce_value(ty: LogicalType, value: &str) -> Result<Option<String>, ()> {
    let v = value.trim();
    match ty {
        LogicalType::Text => Ok(Some(value.to_string())),
        LogicalType::Int => v.parse::<i64>().map(|n| Some(n.to_string())).map_err(|_| ()),
        LogicalType::Float => match v.parse::<f64>() {
            Ok(x) if x.is_finite() => Ok(Some(x.to_string())),
            _ => Err(()),
        },
        LogicalType::Date => {
            if out_of_range(v) == Some(true) {
                return Ok(None);
            }
            let date = v
                .get(..10)
                .and_then(|d| d.parse::<Date>().ok())
                .ok_or(())?;
            Ok(Some(date.to_string()))
        }
        LogicalType::DateTime => {
            if out_of_range(v) == Some(true) {
                return Ok(None);
            }
            let dt = match v.parse::<DateTime>() {
                Ok(dt) => dt,
                Err(_) => v.parse::<Date>().map_err(|_| ())?.at(0, 0, 0, 0),
            };
            Ok(Some(format!(
                "{} {:02}:{:02}:{:02}.{:06}",
                dt.date(),
                dt.hour(),
                dt.minute(),
                dt.second(),
                dt.subsec_nanosecond() / 1000
            )))
        }
    }
}

fn sql_type(ty: LogicalType) -> SqlType {
    match ty {
        LogicalType::Text => SqlType::Varchar,
        LogicalType::Int => SqlType::BigInt,
        LogicalType::Float => SqlType::Double,
        LogicalType::Date => SqlType::Date,
        LogicalType::DateTime => SqlType::Timestamp,
    }
}

/// Type the columns of `frame` with the metadata of `table`.  A column with a value that
/// does not convert stays text; out-of-range dates become null.
pub fn coerce(frame: Frame, table: &str) -> TypedFrame {
    let rows = frame.rows.len();
    let mut values: Vec<Vec<Option<String>>> = vec![Vec::with_capacity(rows); frame.columns.len()];
    for row in frame.rows {
        for (i, v) in row.into_iter().enumerate() {
            values[i].push(v);
        }
    }
    let columns = frame
        .columns
        .into_iter()
        .zip(values)
        .map(|(name, raw)| {
            let ty = column_type(table, &name);
            if ty == LogicalType::Text {
                return Column {
                    name,
                    sql_type: SqlType::Varchar,
                    values: raw,
                };
            }
            let converted: Result<Vec<Option<String>>, ()> = raw
                .iter()
                .map(|v| match v {
                    Some(v) if !v.trim().is_empty() => coerce_value(ty, v),
                    _ => Ok(None),
                })
                .collect();
            match converted {
                Ok(values) => {
                    let nulled = values.iter().filter(|v| v.is_none()).count()
                        - raw.iter().filter(|v| v.as_deref().map_or(true, |s| s.trim().is_empty())).count();
                    if nulled > 0 {
                        debug!("{}.{}: {} out-of-range dates set to null", table, name, nulled);
                    }
                    Column {
                        name,
                        sql_type: sql_type(ty),
                        values,
                    }
                }
                Err(()) => {
                    warn!("{}.{}: values do not convert to {:?}, keeping text", table, name, ty);
                    Column {
                        name,
                        sql_type: SqlType::Varchar,
                        values: raw,
                    }
                }
            }
        })
        .collect();
    TypedFrame { columns, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::error::Error;
    use std::io::Write;

    fn utf16le(s: &str) -> Vec<u8> {
        let mut out = vec![0xff, 0xfe];
        for u in s.encode_utf16() {
            out.extend_from_slice(&u.to_le_bytes());
        }
        out
    }

    #[test]
    fn decode_encodings() -> Result<(), Box<dyn Error>> {
        let xml = "<Einheiten><Einheit><Ort>Köln</Ort></Einheit></Einheiten>";
        assert_eq!(decode(&utf16le(xml))?, xml);
        // no byte-order mark
        assert_eq!(decode(&utf16le(xml)[2..])?, xml);
        let be: Vec<u8> = xml.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
        assert_eq!(decode(&be)?, xml);
        assert_eq!(decode(xml.as_bytes())?, xml);

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&utf16le(xml))?;
        assert_eq!(decode(&gz.finish()?)?, xml);
        Ok(())
    }

    #[test]
    fn rows_and_cells() -> Result<(), Box<dyn Error>> {
        let xml = r#"<?xml version="1.0" encoding="UTF-16"?>
<EinheitenWind xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <EinheitWind><EinheitMastrNummer>SEE1</EinheitMastrNummer><Name>A &amp; B</Name></EinheitWind>
  <EinheitWind><EinheitMastrNummer>SEE2</EinheitMastrNummer><Nabenhoehe>120</Nabenhoehe><Name/></EinheitWind>
</EinheitenWind>"#;
        let frame = parse_rows(xml).map_err(|e| e.message)?;
        assert_eq!(frame.columns, vec!["EinheitMastrNummer", "Name", "Nabenhoehe"]);
        assert_eq!(
            frame.rows,
            vec![
                vec![Some("SEE1".to_string()), Some("A & B".to_string()), None],
                vec![Some("SEE2".to_string()), None, Some("120".to_string())],
            ]
        );
        Ok(())
    }

    #[test]
    fn invalid_character_is_excised() -> Result<(), Box<dyn Error>> {
        let xml = "<Einheiten>\
            <Einheit><Id>1</Id><Name>ok</Name></Einheit>\
            <Einheit><Id>2</Id><Name>bad &#x1; text</Name></Einheit>\
            </Einheiten>";
        let err = parse_rows(xml).expect_err("control character");
        assert_eq!(&xml[err.position..err.position + 3], "bad");

        let (frame, excised) = parse_with_excision(xml.to_string(), "Einheiten_1.xml")?;
        assert_eq!(excised, 1);
        assert_eq!(frame.rows.len(), 2);
        assert_eq!(frame.rows[1], vec![Some("2".to_string()), None]);
        Ok(())
    }

    #[test]
    fn broken_escape_is_excised() -> Result<(), Box<dyn Error>> {
        let xml = "<Einheiten><Einheit><Name>M&uuml;hle</Name></Einheit></Einheiten>";
        let (frame, excised) = parse_with_excision(xml.to_string(), "Einheiten.xml")?;
        assert_eq!(excised, 1);
        assert_eq!(frame.rows, vec![vec![None]]);
        Ok(())
    }

    #[test]
    fn nothing_to_excise_is_fatal() {
        let xml = "<Einheiten><Einheit><Name>x</Einheit></Einheiten>";
        assert!(matches!(
            parse_with_excision(xml.to_string(), "Einheiten.xml"),
            Err(MastrError::Xml(_))
        ));
    }

    #[test]
    fn excision_span_between_tags() {
        let xml = b"<a><b>xx\x01yy</b></a>";
        assert_eq!(excision_span(xml, 8), (6, 11));
        assert_eq!(excision_span(xml, 6), (6, 11));
    }

    #[test]
    fn coercion_by_metadata() {
        let frame = Frame {
            columns: vec![
                "EinheitMastrNummer".to_string(),
                "Nabenhoehe".to_string(),
                "Inbetriebnahmedatum".to_string(),
                "DatumLetzteAktualisierung".to_string(),
                "Lage".to_string(),
            ],
            rows: vec![
                vec![
                    Some("SEE1".into()),
                    Some("120.5".into()),
                    Some("2001-05-04".into()),
                    Some("2020-07-24T10:16:49.4347606".into()),
                    Some("888".into()),
                ],
                vec![
                    Some("SEE2".into()),
                    None,
                    Some("0001-01-01".into()),
                    Some("2020-07-24".into()),
                    Some("unbekannt".into()),
                ],
                vec![
                    Some("SEE3".into()),
                    Some("99".into()),
                    Some("0000-12-31".into()),
                    Some("10000-01-01T00:00:00".into()),
                    None,
                ],
            ],
        };
        let typed = coerce(frame, "einheitenwind");
        let types: Vec<_> = typed.columns.iter().map(|c| c.sql_type).collect();
        assert_eq!(
            types,
            vec![
                SqlType::Varchar,
                SqlType::Double,
                SqlType::Date,
                SqlType::Timestamp,
                SqlType::Varchar
            ]
        );
        assert_eq!(typed.columns[1].values[0].as_deref(), Some("120.5"));
        assert_eq!(typed.columns[2].values[1].as_deref(), Some("0001-01-01"));
        assert_eq!(typed.columns[2].values[2], None);
        assert_eq!(
            typed.columns[3].values[0].as_deref(),
            Some("2020-07-24 10:16:49.434760")
        );
        assert_eq!(typed.columns[3].values[2], None);
        assert_eq!(typed.columns[4].values[1].as_deref(), Some("unbekannt"));
        assert_eq!(typed.columns[3].literal(1), "TIMESTAMP '2020-07-24 00:00:00.000000'");
        assert_eq!(typed.columns[1].literal(1), "NULL");
    }

    #[test]
    fn null_every_occurrence() {
        let mut typed = TypedFrame {
            columns: vec![Column {
                name: "A".to_string(),
                sql_type: SqlType::Varchar,
                values: vec![Some("x".into()), Some("y".into()), Some("x".into())],
            }],
            rows: 3,
        };
        assert_eq!(typed.null_value("x"), 2);
        assert_eq!(typed.columns[0].values, vec![None, Some("y".to_string()), None]);
    }
}
