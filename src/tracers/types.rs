//! Hop and result data shared by every tracer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Error text recorded when a chain hits the redirect limit.
pub const MAX_REDIRECTS_REACHED: &str = "max redirects reached";
/// Error text recorded when a redirect target was already visited.
pub const REDIRECT_LOOP: &str = "redirect loop detected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectType {
    Http,
    Final,
    Error,
    Popup,
}

/// One request/response (or page navigation) in a redirect chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopRecord {
    pub sequence: usize,
    pub url: String,
    /// 0 when unknown or when the hop failed before a status arrived.
    pub http_status: u16,
    pub redirect_type: RedirectType,
    /// Tracer/transport that produced the hop, e.g. `http_stream`, `browser_document`.
    pub originating_method: String,
    pub timing_ms: u64,
    pub bandwidth_bytes: Option<u64>,
    pub params: HashMap<String, String>,
    pub error: Option<String>,
}

impl HopRecord {
    pub fn new(
        sequence: usize,
        url: impl Into<String>,
        http_status: u16,
        redirect_type: RedirectType,
        originating_method: impl Into<String>,
    ) -> Self {
        let url = url.into();
        let params = query_params(&url);
        Self {
            sequence,
            url,
            http_status,
            redirect_type,
            originating_method: originating_method.into(),
            timing_ms: 0,
            bandwidth_bytes: None,
            params,
            error: None,
        }
    }

    /// Error hop. Always terminal.
    pub fn failed(
        sequence: usize,
        url: impl Into<String>,
        http_status: u16,
        originating_method: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(sequence, url, http_status, RedirectType::Error, originating_method).with_error(error)
    }

    pub fn with_timing_ms(mut self, timing_ms: u64) -> Self {
        self.timing_ms = timing_ms;
        self
    }

    pub fn with_bandwidth(mut self, bytes: u64) -> Self {
        self.bandwidth_bytes = Some(bytes);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.redirect_type = RedirectType::Error;
        self.error = Some(error.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.redirect_type == RedirectType::Error || self.error.is_some()
    }
}

/// Query parameters of `url`; later duplicates win. Empty for unparsable URLs.
pub fn query_params(url: &str) -> HashMap<String, String> {
    Url::parse(url)
        .map(|parsed| {
            parsed
                .query_pairs()
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

/// Execution metrics of the header-only tracer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelMetrics {
    pub hops_launched: usize,
    /// Peak number of hop tasks alive at once.
    pub max_in_flight: usize,
    /// Hop tasks still tearing down when the trace returned; they are aborted.
    pub aborted_streams: usize,
    pub average_hop_latency_ms: Option<f64>,
    pub budget_exhausted: bool,
}

/// A navigation attempt captured by the in-page instrumentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsRedirectEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    /// Milliseconds since the Unix epoch, page clock.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSubmission {
    pub action: String,
    pub method: String,
    pub timestamp: f64,
}

/// Side chain followed by a window opened from the traced page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopupChain {
    pub opener_url: String,
    pub chain: Vec<HopRecord>,
    pub final_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub document_requests: u64,
    pub total_requests: u64,
    pub blocked_requests: u64,
    /// Document URLs requested more than once.
    pub detected_retries: u64,
    pub retry_ratio: f64,
}

impl NetworkStats {
    pub fn finish(&mut self) {
        self.retry_ratio = if self.document_requests == 0 {
            0.0
        } else {
            self.detected_retries as f64 / self.document_requests as f64
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloakingIndicator {
    ObfuscatedScript,
    BotDetectionKeyword,
    DelayedRedirect,
    MetaRefresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggressiveness {
    Low,
    Medium,
    High,
}

impl Aggressiveness {
    /// Each indicator and each popup counts as one signal.
    pub fn from_signals(indicators: usize, popups: usize) -> Self {
        match indicators + popups {
            n if n >= 4 => Aggressiveness::High,
            n if n >= 2 => Aggressiveness::Medium,
            _ => Aggressiveness::Low,
        }
    }
}

/// Extras reported by the browser-family tracers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserExtras {
    pub js_redirect_log: Vec<JsRedirectEvent>,
    pub form_submissions: Vec<FormSubmission>,
    pub popup_chains: Vec<PopupChain>,
    pub network_stats: NetworkStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloaking_indicators: Option<Vec<CloakingIndicator>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggressiveness: Option<Aggressiveness>,
}

/// Outcome of one trace. Built once by a tracer and not mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceResult {
    pub chain: Vec<HopRecord>,
    pub final_url: String,
    pub success: bool,
    pub user_agent: String,
    pub total_bandwidth_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_metrics: Option<ParallelMetrics>,
    #[serde(flatten)]
    pub browser: Option<BrowserExtras>,
}

impl TraceResult {
    /// Orders the chain causally, enforces the redirect limit and derives the
    /// final URL, success flag and bandwidth total.
    pub fn from_chain(start_url: &str, mut chain: Vec<HopRecord>, user_agent: &str, max_redirects: usize) -> Self {
        chain.sort_by_key(|hop| hop.sequence);
        enforce_redirect_limit(&mut chain, max_redirects);
        for (index, hop) in chain.iter_mut().enumerate() {
            hop.sequence = index;
        }

        let final_url = chain
            .last()
            .map(|hop| hop.url.clone())
            .unwrap_or_else(|| start_url.to_string());
        let success = chain.last().is_some_and(|hop| !hop.is_error());
        let total_bandwidth_bytes = chain.iter().filter_map(|hop| hop.bandwidth_bytes).sum();

        Self {
            chain,
            final_url,
            success,
            user_agent: user_agent.to_string(),
            total_bandwidth_bytes,
            parallel_metrics: None,
            browser: None,
        }
    }

    pub fn with_parallel_metrics(mut self, metrics: ParallelMetrics) -> Self {
        self.parallel_metrics = Some(metrics);
        self
    }

    pub fn with_browser_extras(mut self, extras: BrowserExtras) -> Self {
        self.browser = Some(extras);
        self
    }
}

/// Truncates to `max_redirects + 1` entries, turning the last kept hop into
/// the "max redirects reached" error.
pub fn enforce_redirect_limit(chain: &mut Vec<HopRecord>, max_redirects: usize) {
    let limit = max_redirects + 1;
    if chain.len() <= limit {
        return;
    }
    chain.truncate(limit);
    if let Some(last) = chain.last_mut() {
        last.redirect_type = RedirectType::Error;
        last.error = Some(MAX_REDIRECTS_REACHED.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(sequence: usize, url: &str, redirect_type: RedirectType) -> HopRecord {
        HopRecord::new(sequence, url, 302, redirect_type, "test").with_bandwidth(100)
    }

    #[test]
    fn sorts_and_resequences_chain() {
        let chain = vec![
            hop(2, "https://c.test/", RedirectType::Final),
            hop(0, "https://a.test/", RedirectType::Http),
            hop(1, "https://b.test/", RedirectType::Http),
        ];
        let result = TraceResult::from_chain("https://a.test/", chain, "ua", 20);
        let urls: Vec<_> = result.chain.iter().map(|h| h.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.test/", "https://b.test/", "https://c.test/"]);
        assert!(result.chain.iter().enumerate().all(|(i, h)| h.sequence == i));
        assert_eq!(result.final_url, "https://c.test/");
        assert!(result.success);
        assert_eq!(result.total_bandwidth_bytes, 300);
    }

    #[test]
    fn error_tail_is_not_success() {
        let chain = vec![
            hop(0, "https://a.test/", RedirectType::Http),
            HopRecord::failed(1, "https://a.test/", 0, "test", REDIRECT_LOOP),
        ];
        let result = TraceResult::from_chain("https://a.test/", chain, "ua", 20);
        assert!(!result.success);
    }

    #[test]
    fn empty_chain_keeps_start_url() {
        let result = TraceResult::from_chain("https://a.test/", Vec::new(), "ua", 20);
        assert_eq!(result.final_url, "https://a.test/");
        assert!(!result.success);
    }

    #[test]
    fn truncates_chain_over_limit() {
        let chain: Vec<_> = (0..6)
            .map(|i| hop(i, &format!("https://h{i}.test/"), RedirectType::Http))
            .collect();
        let result = TraceResult::from_chain("https://h0.test/", chain, "ua", 2);
        assert_eq!(result.chain.len(), 3);
        let last = result.chain.last().unwrap();
        assert_eq!(last.error.as_deref(), Some(MAX_REDIRECTS_REACHED));
        assert!(!result.success);
    }

    #[test]
    fn hop_extracts_query_params() {
        let hop = HopRecord::new(0, "https://t.test/c?gclid=abc&utm_source=x", 200, RedirectType::Final, "test");
        assert_eq!(hop.params.get("gclid").map(String::as_str), Some("abc"));
        assert_eq!(hop.params.len(), 2);
    }

    #[test]
    fn aggressiveness_thresholds() {
        assert_eq!(Aggressiveness::from_signals(0, 1), Aggressiveness::Low);
        assert_eq!(Aggressiveness::from_signals(1, 1), Aggressiveness::Medium);
        assert_eq!(Aggressiveness::from_signals(3, 1), Aggressiveness::High);
    }

    #[test]
    fn serializes_lowercase_redirect_type() {
        let hop = HopRecord::new(0, "https://a.test/", 200, RedirectType::Final, "test");
        let value = serde_json::to_value(&hop).unwrap();
        assert_eq!(value["redirect_type"], "final");
    }
}
