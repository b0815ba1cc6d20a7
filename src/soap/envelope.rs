use std::collections::{HashMap, HashSet};

use lazy_static::lazy_static;
use log::warn;
use quick_xml::events::{BytesStart, Event};
use quick_xml::escape::escape;
use quick_xml::Reader;
use regex::Regex;

use crate::error::MastrError;
use crate::ingest::record::Record;

const SOAP_ENV: &str = "http://schemas.xmlsoap.org/soap/envelope/";

lazy_static! {
    static ref LEAP_SECOND: Regex = Regex::new(r"(T\d{2}:\d{2}):60").unwrap();
}

/// Minimal element tree, enough to walk a SOAP response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct XmlNode {
    /// local name, namespace prefix removed
    pub name: String,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Flatten into one record.  Nested elements are joined with `.`, repeated elements
    /// are comma separated.
    pub fn flatten(&self) -> Record {
        let mut record = Record::new();
        for child in &self.children {
            flatten_into(child, "", &mut record);
        }
        record
    }

    /// One record per child element called `row_element`.
    pub fn rows(&self, row_element: &str) -> Vec<Record> {
        self.children
            .iter()
            .filter(|c| c.name == row_element)
            .map(|c| c.flatten())
            .collect()
    }
}

fn flatten_into(node: &XmlNode, prefix: &str, record: &mut Record) {
    let key = if prefix.is_empty() {
        node.name.clone()
    } else {
        format!("{}.{}", prefix, node.name)
    };
    if node.children.is_empty() {
        // xs:dateTime allows a leap second, jiff and DuckDB do not
        let text = if LEAP_SECOND.is_match(&node.text) {
            let clamped = LEAP_SECOND.replace_all(&node.text, "${1}:59").into_owned();
            warn!("{}: second must be in 0..59, {:?} read as {:?}", key, node.text, clamped);
            clamped
        } else {
            node.text.clone()
        };
        let value = match record.get(&key) {
            Some(prev) => format!("{},{}", prev, text),
            None => text,
        };
        record.set(key, value);
    } else {
        for child in &node.children {
            flatten_into(child, &key, record);
        }
    }
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// Parse a whole document into a tree and return the root element.
pub fn parse_tree(xml: &str) -> Result<XmlNode, MastrError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<XmlNode> = vec![XmlNode::default()];
    loop {
        match reader.read_event()? {
            Event::Start(e) => stack.push(XmlNode {
                name: local_name(&e),
                ..Default::default()
            }),
            Event::Empty(e) => {
                let node = XmlNode {
                    name: local_name(&e),
                    ..Default::default()
                };
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Event::Text(t) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(t) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| MastrError::Xml("unbalanced end tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Err(MastrError::Xml("unbalanced end tag".to_string())),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    let mut document = stack
        .pop()
        .filter(|_| stack.is_empty())
        .ok_or_else(|| MastrError::Xml("unexpected end of document".to_string()))?;
    if document.children.len() != 1 {
        return Err(MastrError::Xml(format!(
            "expected one root element, found {}",
            document.children.len()
        )));
    }
    Ok(document.children.remove(0))
}

/// Build the request envelope for a document/literal operation.
pub fn request(namespace: &str, operation: &str, params: &[(&str, &str)]) -> String {
    let mut body = String::new();
    for (name, value) in params {
        body.push_str(&format!("<ns:{0}>{1}</ns:{0}>", name, escape(*value)));
    }
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soapenv:Envelope xmlns:soapenv="{}" xmlns:ns="{}"><soapenv:Body><ns:{}>{}</ns:{}></soapenv:Body></soapenv:Envelope>"#,
        SOAP_ENV, namespace, operation, body, operation
    )
}

/// Return the payload element of a response, or the fault as an error.
pub fn parse_response(xml: &str, operation: &str) -> Result<XmlNode, MastrError> {
    let mut envelope = parse_tree(xml)?;
    let body_index = envelope
        .children
        .iter()
        .position(|c| c.name == "Body")
        .ok_or_else(|| MastrError::Xml(format!("{}: response has no Body", operation)))?;
    let mut body = envelope.children.swap_remove(body_index);
    if body.children.is_empty() {
        return Err(MastrError::Xml(format!("{}: empty Body", operation)));
    }
    let payload = body.children.remove(0);
    if payload.name == "Fault" {
        let message = payload
            .child("faultstring")
            .or_else(|| payload.child("Reason"))
            .map(|n| n.flatten().get("Text").map(str::to_string).unwrap_or_else(|| n.text.clone()))
            .unwrap_or_else(|| "unknown fault".to_string());
        return Err(MastrError::Soap {
            operation: operation.to_string(),
            message,
        });
    }
    Ok(payload)
}

/// What we need from the service description.
#[derive(Clone, Debug, Default)]
pub struct Wsdl {
    pub target_namespace: String,
    pub endpoint: String,
    pub operations: HashSet<String>,
    pub soap_actions: HashMap<String, String>,
}

impl Wsdl {
    pub fn parse(xml: &str) -> Result<Wsdl, MastrError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut wsdl = Wsdl::default();
        let mut path: Vec<String> = Vec::new();
        let mut current_operation: Option<String> = None;
        loop {
            let (e, is_empty) = match reader.read_event()? {
                Event::Start(e) => (e, false),
                Event::Empty(e) => (e, true),
                Event::End(_) => {
                    if path.pop().as_deref() == Some("operation") {
                        current_operation = None;
                    }
                    continue;
                }
                Event::Eof => break,
                _ => continue,
            };
            let name = local_name(&e);
            let attrs = attributes(&e)?;
            match name.as_str() {
                "definitions" => {
                    if let Some(ns) = attrs.get("targetNamespace") {
                        wsdl.target_namespace = ns.clone();
                    }
                }
                "operation"
                    if matches!(path.last().map(String::as_str), Some("portType" | "binding")) =>
                {
                    if let Some(op) = attrs.get("name") {
                        wsdl.operations.insert(op.clone());
                        current_operation = Some(op.clone());
                    }
                }
                // soap:operation inside a binding operation
                "operation" => {
                    if let (Some(op), Some(action)) = (&current_operation, attrs.get("soapAction")) {
                        wsdl.soap_actions.insert(op.clone(), action.clone());
                    }
                }
                "address" => {
                    if let Some(location) = attrs.get("location") {
                        wsdl.endpoint = location.clone();
                    }
                }
                _ => {}
            }
            if !is_empty {
                path.push(name);
            }
        }
        if wsdl.endpoint.is_empty() {
            return Err(MastrError::Xml("service description has no endpoint".to_string()));
        }
        Ok(wsdl)
    }

    pub fn has_operation(&self, operation: &str) -> bool {
        self.operations.contains(operation)
    }

    pub fn soap_action(&self, operation: &str) -> String {
        self.soap_actions
            .get(operation)
            .cloned()
            .unwrap_or_else(|| format!("{}/{}", self.target_namespace, operation))
    }
}

fn attributes(e: &BytesStart) -> Result<HashMap<String, String>, MastrError> {
    let mut out = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| MastrError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    const WSDL: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<wsdl:definitions xmlns:wsdl="http://schemas.xmlsoap.org/wsdl/" xmlns:soap="http://schemas.xmlsoap.org/wsdl/soap/"
    targetNamespace="https://www.marktstammdatenregister.de/Services/Public/1_2/Entities">
  <wsdl:portType name="Anlage">
    <wsdl:operation name="GetEinheitWind"><wsdl:input message="x"/></wsdl:operation>
    <wsdl:operation name="GetLokaleUhrzeit"><wsdl:input message="y"/></wsdl:operation>
  </wsdl:portType>
  <wsdl:binding name="AnlageBinding" type="Anlage">
    <wsdl:operation name="GetEinheitWind">
      <soap:operation soapAction="urn:GetEinheitWind" style="document"/>
    </wsdl:operation>
  </wsdl:binding>
  <wsdl:service name="Marktstammdatenregister">
    <wsdl:port name="Anlage" binding="AnlageBinding">
      <soap:address location="https://www.marktstammdatenregister.de/MaStRAPI/Anlage"/>
    </wsdl:port>
  </wsdl:service>
</wsdl:definitions>"#;

    #[test]
    fn parse_wsdl() -> Result<(), Box<dyn Error>> {
        let wsdl = Wsdl::parse(WSDL)?;
        assert_eq!(wsdl.endpoint, "https://www.marktstammdatenregister.de/MaStRAPI/Anlage");
        assert!(wsdl.has_operation("GetEinheitWind"));
        assert!(wsdl.has_operation("GetLokaleUhrzeit"));
        assert!(!wsdl.has_operation("GetEinheitSolar"));
        assert_eq!(wsdl.soap_action("GetEinheitWind"), "urn:GetEinheitWind");
        assert_eq!(
            wsdl.soap_action("GetLokaleUhrzeit"),
            "https://www.marktstammdatenregister.de/Services/Public/1_2/Entities/GetLokaleUhrzeit"
        );
        Ok(())
    }

    #[test]
    fn request_escapes_values() {
        let xml = request("urn:x", "GetEinheitWind", &[("apiKey", "a<b")]);
        assert!(xml.contains("<ns:apiKey>a&lt;b</ns:apiKey>"));
        assert!(xml.contains("<ns:GetEinheitWind>"));
    }

    #[test]
    fn flatten_response() -> Result<(), Box<dyn Error>> {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
<s:Body><GetEinheitWindResponse xmlns="urn:x">
  <Ergebniscode>OK</Ergebniscode>
  <EinheitMastrNummer>SEE900001</EinheitMastrNummer>
  <Hausnummer><Wert>12</Wert><NichtVorhanden>false</NichtVorhanden></Hausnummer>
  <Hersteller>Enercon &amp; Co</Hersteller>
  <WeitereBrennstoffe>Holz</WeitereBrennstoffe>
  <WeitereBrennstoffe>Stroh</WeitereBrennstoffe>
  <DatumLetzteAktualisierung>2020-03-29T02:59:60</DatumLetzteAktualisierung>
  <Leer/>
</GetEinheitWindResponse></s:Body></s:Envelope>"#;
        let payload = parse_response(xml, "GetEinheitWind")?;
        let record = payload.flatten();
        assert_eq!(record.get("Ergebniscode"), Some("OK"));
        assert_eq!(record.get("Hausnummer.Wert"), Some("12"));
        assert_eq!(record.get("Hausnummer.NichtVorhanden"), Some("false"));
        assert_eq!(record.get("Hersteller"), Some("Enercon & Co"));
        assert_eq!(record.get("WeitereBrennstoffe"), Some("Holz,Stroh"));
        assert_eq!(record.get("DatumLetzteAktualisierung"), Some("2020-03-29T02:59:59"));
        let ts: jiff::civil::DateTime = record.get("DatumLetzteAktualisierung").unwrap_or("").parse()?;
        assert_eq!(ts.second(), 59);
        assert_eq!(record.get("Leer"), Some(""));
        Ok(())
    }

    #[test]
    fn fault_is_an_error() {
        let xml = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body>
<s:Fault><faultcode>s:Client</faultcode><faultstring>Der API-Key ist ungültig</faultstring></s:Fault>
</s:Body></s:Envelope>"#;
        match parse_response(xml, "GetEinheitWind") {
            Err(MastrError::Soap { message, .. }) => assert_eq!(message, "Der API-Key ist ungültig"),
            other => panic!("expected a fault, got {:?}", other),
        }
    }

    #[test]
    fn rows_of_a_list_response() -> Result<(), Box<dyn Error>> {
        let xml = r#"<Envelope><Body><GetListeAlleEinheitenResponse>
<Ergebniscode>OK</Ergebniscode>
<Einheiten><EinheitMastrNummer>SEE1</EinheitMastrNummer><Einheittyp>Wasser</Einheittyp></Einheiten>
<Einheiten><EinheitMastrNummer>SEE2</EinheitMastrNummer><Einheittyp>Windeinheit</Einheittyp></Einheiten>
</GetListeAlleEinheitenResponse></Body></Envelope>"#;
        let rows = parse_response(xml, "GetListeAlleEinheiten")?.rows("Einheiten");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("EinheitMastrNummer"), Some("SEE2"));
        Ok(())
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_response("<<nope", "GetEinheitWind").is_err());
        assert!(parse_response("", "GetEinheitWind").is_err());
    }
}
