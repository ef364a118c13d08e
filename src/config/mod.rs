//! Tracer configuration.
//!
//! Every section deserializes with defaults, so a partial JSON document (or
//! `{}`) is a valid configuration. Loading validates the result.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::external_deps::geolocation::GeoLocationConfig;
use crate::modules::adaptive_timing::HopTimingConfig;
use crate::modules::geo::{GeoRotator, GeoStrategy};
use crate::modules::identity::{ProxyCredentials, normalize_country};
use crate::modules::user_agents::{UserAgentMode, UserAgentRotatorConfig};
use crate::tracers::browser::BrowserSettings;

/// One year.
const MAX_REFRESH_INTERVAL_HOURS: f64 = 8_760.0;
const MAX_LATENCY_MULTIPLIER: f64 = 100.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Request defaults applied when a trace request leaves them out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceDefaults {
    pub max_redirects: usize,
    pub timeout_ms: u64,
}

impl Default for TraceDefaults {
    fn default() -> Self {
        Self {
            max_redirects: 20,
            timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Upstream rotating-IP provider. Traces go direct when absent.
    pub credentials: Option<ProxyCredentials>,
    /// Sticky-session duration hint appended to every username.
    pub session_minutes: u32,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            credentials: None,
            session_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAgentSettings {
    pub mode: UserAgentMode,
    pub pool_size: usize,
    pub refresh_interval_hours: f64,
}

impl Default for UserAgentSettings {
    fn default() -> Self {
        Self {
            mode: UserAgentMode::Hybrid,
            pool_size: 50,
            refresh_interval_hours: 6.0,
        }
    }
}

impl UserAgentSettings {
    pub fn rotator_config(&self) -> UserAgentRotatorConfig {
        UserAgentRotatorConfig {
            mode: self.mode,
            pool_size: self.pool_size,
            refresh_interval: Duration::try_from_secs_f64(self.refresh_interval_hours.max(0.0) * 3600.0)
                .unwrap_or(Duration::from_secs(MAX_REFRESH_INTERVAL_HOURS as u64 * 3600)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoSettings {
    pub pool: Vec<String>,
    pub strategy: GeoStrategy,
    pub weights: HashMap<String, f64>,
    /// Used when neither the request nor the rotator yields a country.
    pub default_country: Option<String>,
}

impl GeoSettings {
    pub fn rotator(&self) -> GeoRotator {
        GeoRotator::new(&self.pool, self.strategy).with_weights(self.weights.clone())
    }
}

/// Root configuration for [`TraceOrchestrator`](crate::TraceOrchestrator).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    pub defaults: TraceDefaults,
    pub proxy: ProxySettings,
    pub user_agents: UserAgentSettings,
    pub geo: GeoSettings,
    pub http: HopTimingConfig,
    pub browser: BrowserSettings,
    pub geolocation: GeoLocationConfig,
}

impl TracerConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: TracerConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        if self.defaults.timeout_ms == 0 {
            return invalid("defaults.timeout_ms must be positive".into());
        }
        if let Some(credentials) = &self.proxy.credentials {
            if credentials.host.trim().is_empty() {
                return invalid("proxy.credentials.host is empty".into());
            }
            if credentials.port == 0 {
                return invalid("proxy.credentials.port must be non-zero".into());
            }
            if credentials.username.trim().is_empty() {
                return invalid("proxy.credentials.username is empty".into());
            }
        }
        if self.user_agents.mode != UserAgentMode::Dynamic && self.user_agents.pool_size == 0 {
            return invalid("user_agents.pool_size must be positive outside dynamic mode".into());
        }
        let refresh = self.user_agents.refresh_interval_hours;
        if !(refresh > 0.0 && refresh <= MAX_REFRESH_INTERVAL_HOURS) {
            return invalid(format!(
                "user_agents.refresh_interval_hours must be in (0, {MAX_REFRESH_INTERVAL_HOURS}]"
            ));
        }

        for code in self.geo.pool.iter().chain(self.geo.default_country.iter()) {
            if normalize_country(code).is_err() {
                return invalid(format!("geo country '{code}' is not an alpha-2 code"));
            }
        }
        if let Some((code, weight)) = self.geo.weights.iter().find(|(_, weight)| !(weight.is_finite() && **weight >= 0.0)) {
            return invalid(format!("geo weight for '{code}' must be non-negative, got {weight}"));
        }

        let http = &self.http;
        if !(http.budget_fraction > 0.0 && http.budget_fraction <= 1.0) {
            return invalid("http.budget_fraction must be in (0, 1]".into());
        }
        if !(http.smoothing > 0.0 && http.smoothing <= 1.0) {
            return invalid("http.smoothing must be in (0, 1]".into());
        }
        if !(http.latency_multiplier > 0.0 && http.latency_multiplier <= MAX_LATENCY_MULTIPLIER) {
            return invalid(format!("http.latency_multiplier must be in (0, {MAX_LATENCY_MULTIPLIER}]"));
        }

        let browser = &self.browser;
        if browser.idle_window_ms == 0 || browser.anti_cloaking_idle_window_ms == 0 {
            return invalid("browser idle windows must be positive".into());
        }

        if self.geolocation.enabled {
            if self.geolocation.timeout_ms == 0 {
                return invalid("geolocation.timeout_ms must be positive".into());
            }
            if url::Url::parse(&self.geolocation.endpoint).is_err() {
                return invalid(format!("geolocation.endpoint '{}' is not a url", self.geolocation.endpoint));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = TracerConfig::from_json_str("{}").unwrap();
        assert_eq!(config, TracerConfig::default());
        assert_eq!(config.defaults.max_redirects, 20);
        assert_eq!(config.defaults.timeout_ms, 15_000);
        assert_eq!(config.proxy.session_minutes, 10);
        assert_eq!(config.user_agents.mode, UserAgentMode::Hybrid);
        assert_eq!(config.browser.idle_window_ms, 3_000);
        assert_eq!(config.geolocation.timeout_ms, 3_000);
    }

    #[test]
    fn parses_partial_sections() {
        let config = TracerConfig::from_json_str(
            r#"{
                "proxy": {"credentials": {"host": "gw.proxy.test", "port": 7777, "username": "cust-abc", "password": "pw"}},
                "user_agents": {"mode": "pool", "pool_size": 5},
                "geo": {"pool": ["US", "gb"], "strategy": "weighted", "weights": {"us": 3.0}},
                "http": {"budget_fraction": 0.5, "slow_domain_floors": {"slow.test": 4000}},
                "browser": {"headless": false}
            }"#,
        )
        .unwrap();

        let credentials = config.proxy.credentials.as_ref().unwrap();
        assert_eq!(credentials.port, 7777);
        assert_eq!(config.user_agents.rotator_config().pool_size, 5);
        assert_eq!(
            config.user_agents.rotator_config().refresh_interval,
            Duration::from_secs(6 * 3600)
        );
        assert_eq!(config.geo.strategy, GeoStrategy::Weighted);
        assert_eq!(config.geo.rotator().pool(), &["us".to_string(), "gb".to_string()]);
        assert_eq!(config.http.budget_fraction, 0.5);
        assert_eq!(config.http.initial_latency_ms, 1_500);
        assert_eq!(config.http.floor_for("a.slow.test"), Some(Duration::from_millis(4000)));
        assert!(!config.browser.headless);
        assert_eq!(config.browser.anti_cloaking_idle_window_ms, 6_000);
    }

    #[test]
    fn rejects_invalid_values() {
        for raw in [
            r#"{"defaults": {"timeout_ms": 0}}"#,
            r#"{"geo": {"pool": ["usa"]}}"#,
            r#"{"http": {"budget_fraction": 1.5}}"#,
            r#"{"proxy": {"credentials": {"host": "", "port": 1, "username": "u", "password": "p"}}}"#,
            r#"{"user_agents": {"mode": "pool", "pool_size": 0}}"#,
            r#"{"user_agents": {"refresh_interval_hours": 1e300}}"#,
            r#"{"http": {"latency_multiplier": 1e300}}"#,
        ] {
            assert!(
                matches!(TracerConfig::from_json_str(raw), Err(ConfigError::Invalid(_))),
                "{raw} should be rejected"
            );
        }
        // JSON has no infinity literal; weights can still arrive that way programmatically.
        let mut config = TracerConfig::default();
        config.geo.weights.insert("us".into(), f64::INFINITY);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        assert!(matches!(
            TracerConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
