use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::CONTENT_TYPE;

use crate::carrier::Carrier;
use crate::config::{Credentials, Settings};
use crate::error::MastrError;
use crate::ingest::record::Record;
use crate::soap::envelope::{self, Wsdl, XmlNode};

pub const WSDL_URL: &str = "https://www.marktstammdatenregister.de/MaStRAPI/wsdl/mastr.wsdl";

const POOL_SIZE: usize = 2000;
const TRANSPORT_RETRIES: u32 = 3;
const MAX_REDIRECTS: usize = 30;
const CALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Pooled HTTP client shared by every SOAP call of a run.
pub fn http_client() -> Result<Client, MastrError> {
    let client = Client::builder()
        .pool_max_idle_per_host(POOL_SIZE)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(CALL_TIMEOUT)
        .build()?;
    Ok(client)
}

/// Send a request, retrying transport-level failures (connect errors, timeouts) up
/// to three times.  HTTP error statuses are returned to the caller as they are.
pub fn send_with_retries<F>(mut build: F) -> Result<Response, MastrError>
where
    F: FnMut() -> RequestBuilder,
{
    let mut attempt = 0;
    let mut wait = Duration::from_millis(250);
    loop {
        match build().send() {
            Ok(response) => return Ok(response),
            Err(e) if attempt < TRANSPORT_RETRIES && (e.is_connect() || e.is_timeout()) => {
                attempt += 1;
                debug!("transport error, retry {}/{}: {}", attempt, TRANSPORT_RETRIES, e);
                thread::sleep(wait);
                wait *= 2;
            }
            Err(e) => return Err(MastrError::Http(e)),
        }
    }
}

/// Read the service description from the disk cache, downloading it on first use.
pub fn load_wsdl(http: &Client, url: &str, cache_dir: &Path) -> Result<Wsdl, MastrError> {
    let path = cache_dir.join("mastr.wsdl");
    if path.exists() {
        debug!("using cached service description {}", path.display());
        return Wsdl::parse(&fs::read_to_string(&path)?);
    }
    info!("downloading service description from {}", url);
    let response = send_with_retries(|| http.get(url))?;
    if !response.status().is_success() {
        return Err(MastrError::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }
    let text = response.text()?;
    let wsdl = Wsdl::parse(&text)?;
    fs::create_dir_all(cache_dir)?;
    // write-then-rename, several processes may share the cache
    let tmp = cache_dir.join(format!("mastr.wsdl.{}", std::process::id()));
    fs::write(&tmp, &text)?;
    fs::rename(&tmp, &path)?;
    Ok(wsdl)
}

/// Generic client: call any operation offered by the service description.
pub struct SoapClient {
    http: Client,
    wsdl: Wsdl,
}

impl SoapClient {
    pub fn new(http: Client, wsdl: Wsdl) -> Self {
        Self { http, wsdl }
    }

    pub fn wsdl(&self) -> &Wsdl {
        &self.wsdl
    }

    pub fn call(&self, operation: &str, params: &[(&str, &str)]) -> Result<XmlNode, MastrError> {
        if !self.wsdl.has_operation(operation) {
            return Err(MastrError::UnknownOperation(operation.to_string()));
        }
        let body = envelope::request(&self.wsdl.target_namespace, operation, params);
        let action = self.wsdl.soap_action(operation);
        let response = send_with_retries(|| {
            self.http
                .post(&self.wsdl.endpoint)
                .header(CONTENT_TYPE, "text/xml; charset=utf-8")
                .header("SOAPAction", action.as_str())
                .body(body.clone())
        })?;
        let status = response.status();
        let text = response.text()?;
        match envelope::parse_response(&text, operation) {
            Ok(payload) if status.is_success() => Ok(payload),
            Err(e @ MastrError::Soap { .. }) => Err(e),
            Ok(_) => Err(MastrError::HttpStatus {
                url: self.wsdl.endpoint.clone(),
                status: status.as_u16(),
            }),
            Err(e) if status.is_success() => Err(e),
            Err(_) => Err(MastrError::HttpStatus {
                url: self.wsdl.endpoint.clone(),
                status: status.as_u16(),
            }),
        }
    }
}

/// The Registry operations bound to one operator identity and token.
#[derive(Clone)]
pub struct MastrApi {
    client: Arc<SoapClient>,
    credentials: Credentials,
}

impl MastrApi {
    pub fn new(client: Arc<SoapClient>, credentials: Credentials) -> Self {
        Self {
            client,
            credentials,
        }
    }

    pub fn client(&self) -> &SoapClient {
        &self.client
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn authenticated(&self, operation: &str, extra: &[(&str, &str)]) -> Result<XmlNode, MastrError> {
        let mut params = vec![
            ("apiKey", self.credentials.api_token.as_str()),
            (
                "marktakteurMastrNummer",
                self.credentials.operator_id.as_str(),
            ),
        ];
        params.extend_from_slice(extra);
        self.client.call(operation, &params)
    }

    pub fn get_unit(&self, carrier: Carrier, unit_id: &str) -> Result<Record, MastrError> {
        let node = self.authenticated(
            &carrier.unit_operation(),
            &[("einheitMastrNummer", unit_id)],
        )?;
        Ok(node.flatten())
    }

    pub fn get_subsidy(&self, carrier: Carrier, eeg_id: &str) -> Result<Record, MastrError> {
        let operation = carrier
            .subsidy_operation()
            .ok_or_else(|| MastrError::UnknownOperation(format!("GetAnlageEeg for {}", carrier)))?;
        let node = self.authenticated(&operation, &[("eegMastrNummer", eeg_id)])?;
        Ok(node.flatten())
    }

    pub fn get_chp(&self, kwk_id: &str) -> Result<Record, MastrError> {
        let node = self.authenticated("GetAnlageKwk", &[("kwkMastrNummer", kwk_id)])?;
        Ok(node.flatten())
    }

    pub fn get_permit(&self, permit_id: &str) -> Result<Record, MastrError> {
        let node = self.authenticated("GetEinheitGenehmigung", &[("genMastrNummer", permit_id)])?;
        Ok(node.flatten())
    }

    /// One page of the master unit list, starting at the 1-based position `start`.
    pub fn list_units(&self, start: u64, limit: u64) -> Result<Vec<Record>, MastrError> {
        let start = start.to_string();
        let limit = limit.to_string();
        let node = self.authenticated(
            "GetListeAlleEinheiten",
            &[("startAb", start.as_str()), ("limit", limit.as_str())],
        )?;
        Ok(node.rows("Einheiten"))
    }

    /// Unauthenticated probe of the service.
    pub fn local_time(&self) -> Result<String, MastrError> {
        let node = self.client.call("GetLokaleUhrzeit", &[])?;
        local_time_of(&node)
    }

    /// Probe of the service that also validates the credentials.
    pub fn local_time_authenticated(&self) -> Result<String, MastrError> {
        let node = self.authenticated("GetLokaleUhrzeitMitAuthentifizierung", &[])?;
        local_time_of(&node)
    }
}

fn local_time_of(node: &XmlNode) -> Result<String, MastrError> {
    node.child("LokaleUhrzeit")
        .map(|n| n.text.clone())
        .ok_or_else(|| MastrError::Xml("response has no LokaleUhrzeit".to_string()))
}

/// Build the session of a run: `(generic client, bound client, token, operator id)`.
pub fn session(
    settings: &Settings,
    credentials: Credentials,
) -> Result<(Arc<SoapClient>, MastrApi, String, String), MastrError> {
    let http = http_client()?;
    let wsdl = load_wsdl(&http, WSDL_URL, &settings.cache_dir)?;
    if wsdl.operations.is_empty() {
        warn!("service description lists no operations");
    }
    let client = Arc::new(SoapClient::new(http, wsdl));
    let api = MastrApi::new(client.clone(), credentials.clone());
    Ok((client, api, credentials.api_token, credentials.operator_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::collections::{HashMap, HashSet};
    use std::error::Error;

    fn test_api(endpoint: String, operations: &[&str]) -> MastrApi {
        let wsdl = Wsdl {
            target_namespace: "urn:mastr".to_string(),
            endpoint,
            operations: operations.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            soap_actions: HashMap::new(),
        };
        let client = Arc::new(SoapClient::new(Client::new(), wsdl));
        MastrApi::new(
            client,
            Credentials {
                operator_id: "SOM123".to_string(),
                api_token: "token".to_string(),
            },
        )
    }

    #[test]
    fn get_unit_over_http() -> Result<(), Box<dyn Error>> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/soap")
                .body_includes("<ns:einheitMastrNummer>SEE900001</ns:einheitMastrNummer>")
                .body_includes("<ns:apiKey>token</ns:apiKey>");
            then.status(200).body(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body>
<GetEinheitWasserResponse><Ergebniscode>OK</Ergebniscode><EinheitMastrNummer>SEE900001</EinheitMastrNummer></GetEinheitWasserResponse>
</s:Body></s:Envelope>"#,
            );
        });
        let api = test_api(server.url("/soap"), &["GetEinheitWasser"]);
        let record = api.get_unit(Carrier::Hydro, "SEE900001")?;
        mock.assert();
        assert_eq!(record.get("EinheitMastrNummer"), Some("SEE900001"));
        Ok(())
    }

    #[test]
    fn fault_and_unknown_operation() -> Result<(), Box<dyn Error>> {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/soap");
            then.status(500).body(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body>
<s:Fault><faultcode>s:Server</faultcode><faultstring>Tageskontingent erreicht</faultstring></s:Fault>
</s:Body></s:Envelope>"#,
            );
        });
        let api = test_api(server.url("/soap"), &["GetEinheitWasser"]);
        assert!(matches!(
            api.get_unit(Carrier::Hydro, "SEE1"),
            Err(MastrError::Soap { .. })
        ));
        assert!(matches!(
            api.get_unit(Carrier::Wind, "SEE1"),
            Err(MastrError::UnknownOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn credential_probe() -> Result<(), Box<dyn Error>> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/soap")
                .body_includes("<ns:GetLokaleUhrzeitMitAuthentifizierung>")
                .body_includes("<ns:marktakteurMastrNummer>SOM123</ns:marktakteurMastrNummer>");
            then.status(200).body(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body>
<GetLokaleUhrzeitMitAuthentifizierungResponse><Ergebniscode>OK</Ergebniscode><LokaleUhrzeit>2024-05-02T10:11:12</LokaleUhrzeit></GetLokaleUhrzeitMitAuthentifizierungResponse>
</s:Body></s:Envelope>"#,
            );
        });
        let api = test_api(server.url("/soap"), &["GetLokaleUhrzeitMitAuthentifizierung"]);
        assert_eq!(api.local_time_authenticated()?, "2024-05-02T10:11:12");
        mock.assert();
        Ok(())
    }

    #[test]
    fn wsdl_is_cached_on_disk() -> Result<(), Box<dyn Error>> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/mastr.wsdl");
            then.status(200).body(
                r#"<definitions targetNamespace="urn:mastr"><portType name="p"><operation name="GetLokaleUhrzeit"/></portType>
<service><port><address location="http://localhost/soap"/></port></service></definitions>"#,
            );
        });
        let dir = tempfile::tempdir()?;
        let http = Client::new();
        let first = load_wsdl(&http, &server.url("/mastr.wsdl"), dir.path())?;
        let second = load_wsdl(&http, &server.url("/mastr.wsdl"), dir.path())?;
        mock.assert_hits(1);
        assert!(first.has_operation("GetLokaleUhrzeit"));
        assert_eq!(second.endpoint, "http://localhost/soap");
        Ok(())
    }

    #[ignore]
    #[test]
    fn local_time_live() -> Result<(), Box<dyn Error>> {
        let http = http_client()?;
        let dir = tempfile::tempdir()?;
        let wsdl = load_wsdl(&http, WSDL_URL, dir.path())?;
        let api = MastrApi::new(
            Arc::new(SoapClient::new(http, wsdl)),
            Credentials {
                operator_id: String::new(),
                api_token: String::new(),
            },
        );
        println!("{}", api.local_time()?);
        Ok(())
    }
}
