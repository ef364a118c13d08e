//! Browser-rendering tracer.
//!
//! Each trace launches its own Chrome process (never pooled, so the next
//! trace gets a fresh egress connection), instruments the page before any
//! script runs, navigates once and then waits for the page to go idle. Hops
//! are taken from main-frame document requests on the DevTools network domain.

#[cfg(feature = "browser")]
pub(crate) mod driver;
pub mod instrumentation;
#[cfg_attr(not(feature = "browser"), allow(dead_code))]
mod recorder;
#[cfg(feature = "browser")]
mod session;
pub mod signals;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::types::TraceResult;
use super::{RedirectTracer, TraceContext, TraceMode, TracerError};

/// Browser engine knobs. All durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Chrome/Chromium binary; auto-detected when unset.
    pub chrome_executable: Option<PathBuf>,
    pub headless: bool,
    /// Quiet period after which a page counts as settled.
    pub idle_window_ms: u64,
    pub anti_cloaking_idle_window_ms: u64,
    /// Idle detection never fires earlier than this after a navigation starts.
    pub min_navigation_window_ms: u64,
    /// DevTools resource types failed before they hit the network.
    pub block_resource_types: Vec<String>,
    /// Fail every request to an analytics domain, not only XHR/fetch/beacons.
    pub block_analytics_requests: bool,
    pub analytics_domains: Vec<String>,
    pub extra_args: Vec<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            chrome_executable: None,
            headless: true,
            idle_window_ms: 3_000,
            anti_cloaking_idle_window_ms: 6_000,
            min_navigation_window_ms: 1_500,
            block_resource_types: ["image", "stylesheet", "font", "media", "ping"]
                .into_iter()
                .map(String::from)
                .collect(),
            block_analytics_requests: true,
            analytics_domains: [
                "google-analytics.com",
                "googletagmanager.com",
                "doubleclick.net",
                "facebook.net",
                "hotjar.com",
                "segment.io",
                "mixpanel.com",
                "clarity.ms",
                "scorecardresearch.com",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            extra_args: Vec::new(),
        }
    }
}

impl BrowserSettings {
    pub fn idle_window(&self, anti_cloaking: bool) -> Duration {
        Duration::from_millis(if anti_cloaking {
            self.anti_cloaking_idle_window_ms
        } else {
            self.idle_window_ms
        })
    }

    pub fn min_navigation_window(&self) -> Duration {
        Duration::from_millis(self.min_navigation_window_ms)
    }

    /// Whether an intercepted request should be failed instead of continued.
    /// `resource_type` is the DevTools name, compared case-insensitively.
    pub fn should_block(&self, resource_type: &str, url: &str) -> bool {
        let resource_type = resource_type.to_ascii_lowercase();
        if resource_type == "document" {
            return false;
        }
        if self
            .block_resource_types
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(&resource_type))
        {
            return true;
        }
        let analytics = url::Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
            .is_some_and(|host| {
                self.analytics_domains.iter().any(|domain| {
                    let domain = domain.to_ascii_lowercase();
                    host == domain || host.ends_with(&format!(".{domain}"))
                })
            });
        analytics
            && (self.block_analytics_requests || matches!(resource_type.as_str(), "xhr" | "fetch" | "ping"))
    }
}

/// Full page-load tracer for script, meta-refresh and popup redirects.
#[derive(Debug, Clone, Default)]
pub struct BrowserTracer {
    settings: BrowserSettings,
}

impl BrowserTracer {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.settings
    }
}

#[async_trait]
impl RedirectTracer for BrowserTracer {
    fn mode(&self) -> TraceMode {
        TraceMode::Browser
    }

    #[cfg(feature = "browser")]
    async fn trace(&self, ctx: &TraceContext) -> Result<TraceResult, TracerError> {
        driver::run(&self.settings, ctx, driver::RunProfile::standard(&self.settings)).await
    }

    #[cfg(not(feature = "browser"))]
    async fn trace(&self, _ctx: &TraceContext) -> Result<TraceResult, TracerError> {
        Err(TracerError::BrowserUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_heavy_resources_but_never_documents() {
        let settings = BrowserSettings::default();
        assert!(settings.should_block("Image", "https://cdn.test/a.png"));
        assert!(settings.should_block("Stylesheet", "https://cdn.test/a.css"));
        assert!(!settings.should_block("Document", "https://www.google-analytics.com/"));
        assert!(!settings.should_block("Script", "https://cdn.test/app.js"));
    }

    #[test]
    fn analytics_blocking_respects_toggle() {
        let mut settings = BrowserSettings::default();
        assert!(settings.should_block("Script", "https://www.googletagmanager.com/gtm.js"));
        settings.block_analytics_requests = false;
        assert!(!settings.should_block("Script", "https://www.googletagmanager.com/gtm.js"));
        assert!(settings.should_block("Xhr", "https://region1.google-analytics.com/g/collect"));
        assert!(!settings.should_block("Xhr", "https://notgoogle-analytics.com/collect"));
    }

    #[test]
    fn idle_window_depends_on_mode() {
        let settings = BrowserSettings::default();
        assert!(settings.idle_window(true) > settings.idle_window(false));
    }
}
