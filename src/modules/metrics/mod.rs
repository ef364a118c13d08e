//! Metrics collection utilities.
//!
//! Aggregated trace counters plus per-domain hop statistics with latency
//! percentiles. A read-only side channel; nothing in the tracing path
//! depends on it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::tracers::{HopRecord, TraceMode};

const DEFAULT_MAX_DOMAINS: usize = 1_024;

/// Outcome counters for one trace mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModeStats {
    pub traces: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Aggregated metrics across all traces.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_traces: u64,
    pub successes: u64,
    pub failures: u64,
    pub per_mode: HashMap<TraceMode, ModeStats>,
    pub total_hops: u64,
    pub hop_errors: u64,
    pub geo_failures: u64,
    pub average_trace_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_traces: 0,
            successes: 0,
            failures: 0,
            per_mode: HashMap::new(),
            total_hops: 0,
            hop_errors: 0,
            geo_failures: 0,
            average_trace_latency: None,
        }
    }
}

/// Domain-scoped hop statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DomainStats {
    pub domain: String,
    pub hops: u64,
    pub errors: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub last_status: Option<u16>,
}

impl DomainStats {
    fn from_accumulator(domain: &str, acc: &DomainAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        Self {
            domain: domain.to_string(),
            hops: acc.hops,
            errors: acc.errors,
            average_latency: avg,
            p95_latency: p95,
            last_status: acc.last_status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub domains: Vec<DomainStats>,
}

#[derive(Debug)]
struct DomainAccumulator {
    hops: u64,
    errors: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    last_status: Option<u16>,
    /// Recording tick of the latest hop, for eviction.
    last_seen: u64,
}

impl DomainAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            hops: 0,
            errors: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            last_status: None,
            last_seen: 0,
        }
    }

    fn record(&mut self, hop: &HopRecord, tick: u64) {
        self.hops += 1;
        self.last_seen = tick;
        self.last_status = Some(hop.http_status);
        if hop.is_error() {
            self.errors += 1;
        }
        // Hops without a response carry no meaningful latency.
        if hop.http_status != 0 {
            if self.latencies.len() == self.max_window {
                self.latencies.pop_front();
            }
            self.latencies.push_back(Duration::from_millis(hop.timing_ms));
        }
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        let p95 = samples[p95_index];
        (Some(Duration::from_secs_f64(avg)), Some(p95))
    }
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    max_domains: usize,
    domains: HashMap<String, DomainAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize, max_domains: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            max_domains,
            domains: HashMap::new(),
        }
    }

    /// Accumulator for `domain`. Click-wrapper traffic has unbounded host
    /// cardinality, so the least recently seen domain is evicted at capacity.
    fn accumulator_mut(&mut self, domain: &str) -> &mut DomainAccumulator {
        if !self.domains.contains_key(domain) && self.domains.len() >= self.max_domains {
            let stalest = self
                .domains
                .iter()
                .min_by_key(|(_, acc)| acc.last_seen)
                .map(|(name, _)| name.clone());
            if let Some(name) = stalest {
                self.domains.remove(&name);
            }
        }
        self.domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainAccumulator::new(self.max_window))
    }
}

/// Thread-safe metrics collector used by the orchestration layer.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_limits(128, DEFAULT_MAX_DOMAINS)
    }

    pub fn with_window(window: usize) -> Self {
        Self::with_limits(window, DEFAULT_MAX_DOMAINS)
    }

    /// Latency window per domain and the number of domains tracked at once.
    pub fn with_limits(window: usize, max_domains: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16), max_domains.max(1)))),
        }
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_trace(&self, mode: TraceMode, success: bool, latency: Duration) {
        let mut guard = self.state();
        let global = &mut guard.global;
        global.total_traces += 1;
        let per_mode = global.per_mode.entry(mode).or_default();
        per_mode.traces += 1;
        if success {
            global.successes += 1;
            per_mode.successes += 1;
        } else {
            global.failures += 1;
            per_mode.failures += 1;
        }

        global.average_trace_latency = Some(match global.average_trace_latency {
            Some(avg) => Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1),
            None => latency,
        });
    }

    pub fn record_hop(&self, hop: &HopRecord) {
        let domain = url::Url::parse(&hop.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_default();
        let mut guard = self.state();
        guard.global.total_hops += 1;
        if hop.is_error() {
            guard.global.hop_errors += 1;
        }
        let tick = guard.global.total_hops;
        guard.accumulator_mut(&domain).record(hop, tick);
    }

    pub fn record_geo_failure(&self) {
        self.state().global.geo_failures += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.state();
        let mut domains: Vec<_> = guard
            .domains
            .iter()
            .map(|(domain, acc)| DomainStats::from_accumulator(domain, acc))
            .collect();
        domains.sort_by(|a, b| b.hops.cmp(&a.hops).then_with(|| a.domain.cmp(&b.domain)));
        MetricsSnapshot {
            global: guard.global.clone(),
            domains,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracers::RedirectType;

    fn hop(url: &str, status: u16, ms: u64) -> HopRecord {
        HopRecord::new(0, url, status, RedirectType::Http, "http_stream").with_timing_ms(ms)
    }

    #[test]
    fn records_hops_per_domain() {
        let metrics = MetricsCollector::new();
        metrics.record_hop(&hop("https://example.com/a", 301, 150));
        metrics.record_hop(&hop("https://example.com/b", 200, 50));
        metrics.record_hop(&HopRecord::failed(2, "https://example.com/c", 0, "http_stream", "timeout"));

        let snapshot = metrics.snapshot();
        let domain = snapshot
            .domains
            .iter()
            .find(|d| d.domain == "example.com")
            .unwrap();
        assert_eq!(domain.hops, 3);
        assert_eq!(domain.errors, 1);
        assert_eq!(domain.last_status, Some(0));
        assert_eq!(domain.average_latency, Some(Duration::from_millis(100)));
        assert_eq!(domain.p95_latency, Some(Duration::from_millis(150)));
        assert_eq!(snapshot.global.hop_errors, 1);
    }

    #[test]
    fn evicts_least_recently_seen_domain() {
        let metrics = MetricsCollector::with_limits(16, 2);
        metrics.record_hop(&hop("https://a.test/", 200, 10));
        metrics.record_hop(&hop("https://b.test/", 200, 10));
        metrics.record_hop(&hop("https://a.test/again", 200, 10));
        metrics.record_hop(&hop("https://c.test/", 200, 10));

        let snapshot = metrics.snapshot();
        let mut domains: Vec<_> = snapshot.domains.iter().map(|d| d.domain.as_str()).collect();
        domains.sort_unstable();
        assert_eq!(domains, vec!["a.test", "c.test"]);
        assert_eq!(snapshot.global.total_hops, 4);
    }

    #[test]
    fn records_trace_outcomes_per_mode() {
        let metrics = MetricsCollector::new();
        metrics.record_trace(TraceMode::HttpOnly, true, Duration::from_millis(200));
        metrics.record_trace(TraceMode::Browser, false, Duration::from_millis(900));
        metrics.record_trace(TraceMode::HttpOnly, true, Duration::from_millis(100));

        let global = metrics.snapshot().global;
        assert_eq!(global.total_traces, 3);
        assert_eq!(global.successes, 2);
        assert_eq!(global.failures, 1);
        assert_eq!(
            global.per_mode[&TraceMode::HttpOnly],
            ModeStats { traces: 2, successes: 2, failures: 0 }
        );
        assert!(global.average_trace_latency.is_some());
    }
}
