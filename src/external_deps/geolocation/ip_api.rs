use async_trait::async_trait;
use serde::Deserialize;

use super::{GeoLocation, GeoLocationConfig, GeoLocationError, GeoLocationResult, GeoLocator, GeoLookup};
use crate::modules::identity::ProxyIdentity;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: String,
    message: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
    region_name: Option<String>,
    city: Option<String>,
    query: Option<String>,
}

/// Adapter for ip-api.com style IP echo endpoints.
///
/// The request goes out through the same proxy identity as the trace, so the
/// sticky session resolves to the same exit IP.
#[derive(Debug, Clone, Default)]
pub struct IpApiLocator {
    pub config: GeoLocationConfig,
}

impl IpApiLocator {
    pub fn new(config: GeoLocationConfig) -> Self {
        Self { config }
    }

    fn client(&self, identity: Option<&ProxyIdentity>) -> Result<reqwest::Client, reqwest::Error> {
        let builder = reqwest::Client::builder().timeout(self.config.timeout());
        let builder = match identity {
            Some(identity) => builder.proxy(identity.reqwest_proxy()?),
            None => builder.no_proxy(),
        };
        builder.build()
    }
}

#[async_trait]
impl GeoLocator for IpApiLocator {
    fn name(&self) -> &'static str {
        "ip-api"
    }

    async fn locate(&self, identity: Option<&ProxyIdentity>) -> GeoLocationResult {
        let client = self.client(identity)?;
        let response = client
            .get(&self.config.endpoint)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| self.classify(err))?;
        let body: IpApiResponse = response.json().await.map_err(|err| self.classify(err))?;

        if !body.status.eq_ignore_ascii_case("success") {
            return Err(GeoLocationError::Provider(
                body.message.unwrap_or_else(|| body.status.clone()),
            ));
        }
        let ip = body
            .query
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| GeoLocationError::Provider("response carried no ip".into()))?;

        Ok(GeoLookup {
            ip,
            location: GeoLocation {
                country: body.country,
                country_code: body.country_code,
                city: body.city,
                region: body.region_name,
            },
        })
    }
}

impl IpApiLocator {
    fn classify(&self, err: reqwest::Error) -> GeoLocationError {
        if err.is_timeout() {
            GeoLocationError::Timeout(self.config.timeout())
        } else {
            GeoLocationError::Http(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_api_payload() {
        let body: IpApiResponse = serde_json::from_str(
            r#"{"status":"success","country":"Germany","countryCode":"DE","regionName":"Hesse","city":"Frankfurt am Main","query":"203.0.113.7"}"#,
        )
        .unwrap();
        assert_eq!(body.status, "success");
        assert_eq!(body.region_name.as_deref(), Some("Hesse"));
        assert_eq!(body.query.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn default_config_uses_short_timeout() {
        let locator = IpApiLocator::default();
        assert!(locator.config.enabled);
        assert_eq!(locator.config.timeout_ms, 3_000);
        assert_eq!(locator.name(), "ip-api");
    }
}
