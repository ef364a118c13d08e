//! Redirect tracing strategies.
//!
//! Three interchangeable engines sit behind [`RedirectTracer`]:
//! - [`HttpOnlyTracer`]: header-only hops issued as a self-racing pipeline
//! - [`BrowserTracer`]: full page loads in a disposable browser process
//! - [`AntiCloakingTracer`]: the browser engine with stealth extras
//!
//! Per-hop failures never surface as `Err`; they end up in the chain. Only a
//! failure that prevents producing any chain is returned as [`TracerError`].

pub mod anti_cloaking;
pub mod browser;
pub mod http_only;
pub mod types;

pub use anti_cloaking::AntiCloakingTracer;
pub use browser::BrowserTracer;
pub use http_only::HttpOnlyTracer;
pub use types::{
    Aggressiveness, BrowserExtras, CloakingIndicator, FormSubmission, HopRecord, JsRedirectEvent,
    NetworkStats, ParallelMetrics, PopupChain, RedirectType, TraceResult,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::modules::identity::ProxyIdentity;
use crate::modules::spoofing::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    #[default]
    HttpOnly,
    Browser,
    AntiCloaking,
}

impl TraceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceMode::HttpOnly => "http_only",
            TraceMode::Browser => "browser",
            TraceMode::AntiCloaking => "anti_cloaking",
        }
    }
}

impl fmt::Display for TraceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http_only" | "http" => Ok(TraceMode::HttpOnly),
            "browser" => Ok(TraceMode::Browser),
            "anti_cloaking" | "anticloaking" => Ok(TraceMode::AntiCloaking),
            other => Err(other.to_string()),
        }
    }
}

/// Everything a tracer needs for one trace. Built by the orchestrator.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub url: Url,
    pub max_redirects: usize,
    /// Trace-wide wall-clock budget.
    pub timeout: Duration,
    pub user_agent: String,
    /// Synthesized once per trace and reused for every hop.
    pub fingerprint: Fingerprint,
    /// `None` traces directly without a proxy.
    pub identity: Option<ProxyIdentity>,
    pub referrer: Option<String>,
    pub target_country: Option<String>,
    pub expected_final_url: Option<Url>,
}

impl TraceContext {
    /// True when `url` is on the host the caller expects the chain to end on.
    pub fn reached_expected_host(&self, url: &Url) -> bool {
        match (
            self.expected_final_url.as_ref().and_then(Url::host_str),
            url.host_str(),
        ) {
            (Some(expected), Some(current)) => {
                let expected = expected.trim_start_matches("www.");
                let current = current.trim_start_matches("www.");
                current.eq_ignore_ascii_case(expected)
                    || current
                        .to_ascii_lowercase()
                        .ends_with(&format!(".{}", expected.to_ascii_lowercase()))
            }
            _ => false,
        }
    }
}

/// Request-level tracer failures.
#[derive(Debug, Error)]
pub enum TracerError {
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("failed to launch browser: {0}")]
    BrowserLaunch(String),
    #[error("browser protocol failure: {0}")]
    Browser(String),
    #[error("browser support not compiled; enable the `browser` feature")]
    BrowserUnavailable,
}

/// Shared interface implemented by all tracing strategies.
#[async_trait]
pub trait RedirectTracer: Send + Sync {
    fn mode(&self) -> TraceMode;
    async fn trace(&self, ctx: &TraceContext) -> Result<TraceResult, TracerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::spoofing::FingerprintSynthesizer;

    fn context(expected: Option<&str>) -> TraceContext {
        TraceContext {
            url: Url::parse("https://click.test/start").unwrap(),
            max_redirects: 20,
            timeout: Duration::from_secs(5),
            user_agent: "ua".into(),
            fingerprint: FingerprintSynthesizer::new().synthesize("ua"),
            identity: None,
            referrer: None,
            target_country: None,
            expected_final_url: expected.map(|u| Url::parse(u).unwrap()),
        }
    }

    #[test]
    fn parses_modes() {
        assert_eq!("http_only".parse::<TraceMode>(), Ok(TraceMode::HttpOnly));
        assert_eq!("Anti_Cloaking".parse::<TraceMode>(), Ok(TraceMode::AntiCloaking));
        assert!("ftp".parse::<TraceMode>().is_err());
        assert_eq!(serde_json::to_string(&TraceMode::AntiCloaking).unwrap(), "\"anti_cloaking\"");
    }

    #[test]
    fn expected_host_matches_subdomains() {
        let ctx = context(Some("https://www.shop.test/landing"));
        assert!(ctx.reached_expected_host(&Url::parse("https://shop.test/p?id=1").unwrap()));
        assert!(ctx.reached_expected_host(&Url::parse("https://m.shop.test/").unwrap()));
        assert!(!ctx.reached_expected_host(&Url::parse("https://notshop.test/").unwrap()));
        assert!(!context(None).reached_expected_host(&Url::parse("https://shop.test/").unwrap()));
    }
}
