use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use jiff::Timestamp;
use log::debug;

use crate::carrier::Carrier;
use crate::error::MastrError;
use crate::ingest::record::Record;
use crate::soap::client::MastrApi;

/// Turns one identifier into one record.  `None` means the fetch failed for whatever
/// reason; the batch driver decides what a failure means by counting them.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, id: &str) -> Option<Record>;
}

impl<F> Fetcher for F
where
    F: Fn(&str) -> Option<Record> + Send + Sync,
{
    fn fetch(&self, id: &str) -> Option<Record> {
        self(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchKind {
    /// `get_unit_<carrier>`
    Unit(Carrier),
    /// `get_subsidy_<carrier>`
    Subsidy(Carrier),
    Chp,
    Permit,
}

impl Display for FetchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchKind::Unit(c) => write!(f, "get_unit_{}", c),
            FetchKind::Subsidy(c) => write!(f, "get_subsidy_{}", c),
            FetchKind::Chp => write!(f, "get_chp"),
            FetchKind::Permit => write!(f, "get_permit"),
        }
    }
}

/// One SOAP operation wrapped as a [`Fetcher`].  The bound client is injected, so
/// one client can serve every fetcher of a run.
pub struct SoapFetcher {
    api: MastrApi,
    kind: FetchKind,
    version: String,
    lid: AtomicU64,
}

impl SoapFetcher {
    pub fn new(api: MastrApi, kind: FetchKind, version: &str) -> Self {
        Self {
            api,
            kind,
            version: version.to_string(),
            lid: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> FetchKind {
        self.kind
    }

    fn call(&self, id: &str) -> Result<Record, MastrError> {
        match self.kind {
            FetchKind::Unit(carrier) => self.api.get_unit(carrier, id),
            FetchKind::Subsidy(carrier) => self.api.get_subsidy(carrier, id),
            FetchKind::Chp => self.api.get_chp(id),
            FetchKind::Permit => self.api.get_permit(id),
        }
    }
}

impl Fetcher for SoapFetcher {
    fn fetch(&self, id: &str) -> Option<Record> {
        match self.call(id) {
            Ok(fields) => {
                let lid = self.lid.fetch_add(1, Ordering::Relaxed);
                let mut record = Record::new().with("lid", lid.to_string());
                for column in fields.columns() {
                    record.set(column, fields.get(column).unwrap_or(""));
                }
                record.stamp(&self.version, Timestamp::now());
                Some(record)
            }
            Err(e) => {
                let kind = match e {
                    MastrError::Http(ref inner) if inner.is_timeout() => "timeout",
                    MastrError::Http(_) => "transport",
                    MastrError::HttpStatus { .. } => "http status",
                    MastrError::Soap { .. } => "soap fault",
                    MastrError::Xml(_) => "malformed response",
                    _ => "other",
                };
                debug!("{} {} failed ({}): {}", self.kind, id, kind, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::soap::client::SoapClient;
    use crate::soap::envelope::Wsdl;
    use httpmock::prelude::*;
    use reqwest::blocking::Client;
    use std::sync::Arc;

    fn api(endpoint: String) -> MastrApi {
        let wsdl = Wsdl {
            endpoint,
            operations: ["GetAnlageKwk".to_string(), "GetEinheitKernkraft".to_string()].into(),
            ..Default::default()
        };
        MastrApi::new(
            Arc::new(SoapClient::new(Client::new(), wsdl)),
            Credentials {
                operator_id: "SOM1".to_string(),
                api_token: "token".to_string(),
            },
        )
    }

    #[test]
    fn success_carries_lid_version_timestamp() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/soap");
            then.status(200).body(
                r#"<Envelope><Body><GetAnlageKwkResponse><Ergebniscode>OK</Ergebniscode>
<KwkMastrNummer>KWK900001</KwkMastrNummer></GetAnlageKwkResponse></Body></Envelope>"#,
            );
        });
        let fetcher = SoapFetcher::new(api(server.url("/soap")), FetchKind::Chp, "v1");
        let first = fetcher.fetch("KWK900001").expect("record");
        let second = fetcher.fetch("KWK900001").expect("record");
        assert_eq!(first.get("lid"), Some("0"));
        assert_eq!(second.get("lid"), Some("1"));
        assert_eq!(first.get("KwkMastrNummer"), Some("KWK900001"));
        assert_eq!(first.get("Ergebniscode"), Some("OK"));
        assert_eq!(first.get("version"), Some("v1"));
        assert!(first.get("timestamp").is_some());
    }

    #[test]
    fn every_failure_is_none() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/soap");
            then.status(200).body("<not-xml");
        });
        let fetcher = SoapFetcher::new(api(server.url("/soap")), FetchKind::Chp, "v1");
        assert!(fetcher.fetch("KWK1").is_none());

        // operation missing from the service description
        let fetcher = SoapFetcher::new(
            api(server.url("/soap")),
            FetchKind::Subsidy(Carrier::Wind),
            "v1",
        );
        assert!(fetcher.fetch("EEG1").is_none());

        // nothing listening
        let fetcher = SoapFetcher::new(
            api("http://127.0.0.1:9/soap".to_string()),
            FetchKind::Unit(Carrier::Nuclear),
            "v1",
        );
        assert!(fetcher.fetch("SEE1").is_none());
    }

    #[test]
    fn closures_are_fetchers() {
        let f = |id: &str| Some(Record::new().with("EinheitMastrNummer", id));
        assert_eq!(
            f.fetch("SEE1").and_then(|r| r.get("EinheitMastrNummer").map(str::to_string)),
            Some("SEE1".to_string())
        );
    }
}
