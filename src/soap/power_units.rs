use jiff::Timestamp;
use log::info;

use crate::error::MastrError;
use crate::ingest::sink::CsvSink;
use crate::soap::client::MastrApi;

/// Largest page the service hands out for `GetListeAlleEinheiten`.
pub const MAX_CHUNK: u64 = 2000;

/// Page through the master unit list and append every entry to `sink`.
///
/// Pages start at position 1 and are `chunk` entries long.  Stops after `limit`
/// entries, or when the service returns a short page.  Returns the number of
/// entries written.
pub fn download_power_units(
    api: &MastrApi,
    sink: &CsvSink,
    version: &str,
    limit: u64,
    chunk: u64,
) -> Result<u64, MastrError> {
    let chunk = chunk.clamp(1, MAX_CHUNK);
    let mut written = 0u64;
    let mut start = 1u64;
    while written < limit {
        let size = chunk.min(limit - written);
        let mut page = api.list_units(start, size)?;
        let n = page.len() as u64;
        let timestamp = Timestamp::now();
        for record in page.iter_mut() {
            record.stamp(version, timestamp);
        }
        sink.append_all(&page)?;
        written += n;
        info!("master list: {} entries from position {}", n, start);
        if n < size {
            break;
        }
        start += n;
    }
    info!("master list: {} entries in {}", written, sink.path().display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::soap::client::SoapClient;
    use crate::soap::envelope::Wsdl;
    use httpmock::prelude::*;
    use reqwest::blocking::Client;
    use std::error::Error;
    use std::sync::Arc;

    fn page(ids: &[&str]) -> String {
        let entries: String = ids
            .iter()
            .map(|id| {
                format!(
                    "<Einheiten><EinheitMastrNummer>{}</EinheitMastrNummer>\
                     <Einheittyp>Windeinheit</Einheittyp></Einheiten>",
                    id
                )
            })
            .collect();
        format!(
            "<Envelope><Body><GetListeAlleEinheitenResponse><Ergebniscode>OK</Ergebniscode>\
             {}</GetListeAlleEinheitenResponse></Body></Envelope>",
            entries
        )
    }

    #[test]
    fn pages_until_short_page() -> Result<(), Box<dyn Error>> {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(POST).path("/soap").body_includes("<ns:startAb>1</ns:startAb>");
            then.status(200).body(page(&["SEE1", "SEE2"]));
        });
        let second = server.mock(|when, then| {
            when.method(POST).path("/soap").body_includes("<ns:startAb>3</ns:startAb>");
            then.status(200).body(page(&["SEE3"]));
        });
        let wsdl = Wsdl {
            endpoint: server.url("/soap"),
            operations: ["GetListeAlleEinheiten".to_string()].into(),
            ..Default::default()
        };
        let api = MastrApi::new(
            Arc::new(SoapClient::new(Client::new(), wsdl)),
            Credentials {
                operator_id: "SOM1".to_string(),
                api_token: "token".to_string(),
            },
        );
        let dir = tempfile::tempdir()?;
        let sink = CsvSink::new(dir.path().join("bnetza_mastr_power-unit.csv"));
        let n = download_power_units(&api, &sink, "v1", 100, 2)?;
        assert_eq!(n, 3);
        first.assert();
        second.assert();
        assert_eq!(
            sink.column_values("EinheitMastrNummer")?,
            vec!["SEE1", "SEE2", "SEE3"]
        );
        assert_eq!(sink.column_values("version")?, vec!["v1", "v1", "v1"]);
        Ok(())
    }
}
