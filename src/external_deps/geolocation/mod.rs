//! Reverse geolocation of a trace's exit IP.
//!
//! The orchestrator runs a lookup concurrently with every trace. Lookups are
//! best effort: a failure only leaves the geolocation fields of the response
//! empty.

mod ip_api;

pub use ip_api::IpApiLocator;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::identity::ProxyIdentity;

/// Lookup endpoint and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoLocationConfig {
    pub enabled: bool,
    /// IP echo endpoint answering in the ip-api JSON shape.
    pub endpoint: String,
    pub timeout_ms: u64,
}

impl Default for GeoLocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://ip-api.com/json?fields=status,message,country,countryCode,regionName,city,query".into(),
            timeout_ms: 3_000,
        }
    }
}

impl GeoLocationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
}

/// Exit IP as seen by the lookup service, plus where it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLookup {
    pub ip: String,
    pub location: GeoLocation,
}

pub type GeoLocationResult = Result<GeoLookup, GeoLocationError>;

/// Shared interface implemented by geolocation services.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Looks up the egress IP of `identity`, or of this host when `None`.
    async fn locate(&self, identity: Option<&ProxyIdentity>) -> GeoLocationResult;
}

#[derive(Debug, Error)]
pub enum GeoLocationError {
    #[error("geolocation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geolocation timed out after {0:?}")]
    Timeout(Duration),
    #[error("geolocation provider rejected the lookup: {0}")]
    Provider(String),
}
