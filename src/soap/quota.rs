use log::info;

use crate::error::MastrError;
use crate::ingest::record::Record;
use crate::soap::client::SoapClient;

/// Daily request quota of one operator at the Registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub used: u64,
}

impl Quota {
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }

    /// Number of calls left for today
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    fn from_record(record: &Record) -> Result<Quota, MastrError> {
        let field = |name: &str| -> Result<u64, MastrError> {
            record
                .get(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| MastrError::Xml(format!("quota response has no valid {}", name)))
        };
        Ok(Quota {
            limit: field("AktuellesLimitTageskontingent")?,
            used: field("AktuellerStandTageskontingent")?,
        })
    }
}

/// Ask the Registry how much of today's quota is used.  The values are advisory.
pub fn read_quota(
    client: &SoapClient,
    operator_id: &str,
    token: &str,
) -> Result<Quota, MastrError> {
    let node = client.call(
        "GetAktuellerStandTageskontingent",
        &[("apiKey", token), ("marktakteurMastrNummer", operator_id)],
    )?;
    let quota = Quota::from_record(&node.flatten())?;
    info!("daily quota: {} of {} calls used", quota.used, quota.limit);
    Ok(quota)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soap::envelope::Wsdl;
    use httpmock::prelude::*;
    use reqwest::blocking::Client;
    use std::error::Error;

    #[test]
    fn quota_arithmetic() {
        let q = Quota { limit: 10, used: 3 };
        assert_eq!(q.remaining(), 7);
        assert!(!q.is_exhausted());
        let q = Quota { limit: 10, used: 12 };
        assert_eq!(q.remaining(), 0);
        assert!(q.is_exhausted());
    }

    #[test]
    fn read_quota_from_service() -> Result<(), Box<dyn Error>> {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/soap");
            then.status(200).body(
                r#"<Envelope><Body><GetAktuellerStandTageskontingentResponse>
<Ergebniscode>OK</Ergebniscode>
<AktuellesLimitTageskontingent>100000</AktuellesLimitTageskontingent>
<AktuellerStandTageskontingent>1234</AktuellerStandTageskontingent>
</GetAktuellerStandTageskontingentResponse></Body></Envelope>"#,
            );
        });
        let wsdl = Wsdl {
            endpoint: server.url("/soap"),
            operations: ["GetAktuellerStandTageskontingent".to_string()].into(),
            ..Default::default()
        };
        let client = SoapClient::new(Client::new(), wsdl);
        let quota = read_quota(&client, "SOM1", "token")?;
        assert_eq!(quota, Quota { limit: 100000, used: 1234 });
        Ok(())
    }
}
