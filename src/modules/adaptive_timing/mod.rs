//! Adaptive per-hop timeout budgeting.
//!
//! Responsibilities:
//! - keep a rolling exponential estimate of hop latency within one trace
//! - apply per-domain floors for hosts that are structurally slow
//! - derive each hop's timeout from the estimate and the remaining trace budget

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Timing knobs for the header-only tracer. All durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HopTimingConfig {
    /// Share of the remaining trace budget a single hop may consume.
    pub budget_fraction: f64,
    /// Multiple of the latency estimate granted to a hop.
    pub latency_multiplier: f64,
    /// Estimate used before the first hop completes.
    pub initial_latency_ms: u64,
    /// Weight of the newest sample in the exponential average.
    pub smoothing: f64,
    pub min_hop_timeout_ms: u64,
    /// Host suffix -> minimum latency estimate.
    pub slow_domain_floors: HashMap<String, u64>,
}

impl Default for HopTimingConfig {
    fn default() -> Self {
        let mut slow_domain_floors = HashMap::new();
        slow_domain_floors.insert("doubleclick.net".to_string(), 2_500);
        slow_domain_floors.insert("go2cloud.org".to_string(), 2_500);
        slow_domain_floors.insert("awin1.com".to_string(), 2_000);
        Self {
            budget_fraction: 0.7,
            latency_multiplier: 3.0,
            initial_latency_ms: 1_500,
            smoothing: 0.3,
            min_hop_timeout_ms: 10,
            slow_domain_floors,
        }
    }
}

impl HopTimingConfig {
    /// Floor registered for `host` (exact host or any parent domain).
    pub fn floor_for(&self, host: &str) -> Option<Duration> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.slow_domain_floors
            .iter()
            .filter(|(suffix, _)| {
                let suffix = suffix.trim_start_matches('.').to_ascii_lowercase();
                host == suffix || host.ends_with(&format!(".{suffix}"))
            })
            .map(|(_, ms)| Duration::from_millis(*ms))
            .max()
    }
}

/// Per-trace latency estimator. Cheap; build one per trace.
#[derive(Debug, Clone)]
pub struct LatencyEstimator {
    config: HopTimingConfig,
    estimate: Duration,
    samples: u32,
}

impl LatencyEstimator {
    pub fn new(config: HopTimingConfig) -> Self {
        let estimate = Duration::from_millis(config.initial_latency_ms.max(1));
        Self {
            config,
            estimate,
            samples: 0,
        }
    }

    pub fn estimate(&self) -> Duration {
        self.estimate
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Blends a completed hop's latency into the estimate.
    pub fn observe(&mut self, latency: Duration) {
        let alpha = self.config.smoothing.clamp(0.0, 1.0);
        let blended = if self.samples == 0 {
            latency.as_secs_f64()
        } else {
            alpha * latency.as_secs_f64() + (1.0 - alpha) * self.estimate.as_secs_f64()
        };
        self.estimate = Duration::from_secs_f64(blended.max(0.0));
        self.samples = self.samples.saturating_add(1);
    }

    /// Timeout for the next hop to `host` given what is left of the trace budget.
    ///
    /// Never exceeds `remaining`, so a hop can not outlive the trace deadline.
    pub fn hop_timeout(&self, host: &str, remaining: Duration) -> Duration {
        let floor = self.config.floor_for(host).unwrap_or_default();
        let basis = self.estimate.max(floor);
        let multiplier = self.config.latency_multiplier;
        let multiplier = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
        let by_latency = Duration::try_from_secs_f64(basis.as_secs_f64() * multiplier).unwrap_or(remaining);
        let by_budget = remaining.mul_f64(self.config.budget_fraction.clamp(0.05, 1.0));
        let minimum = Duration::from_millis(self.config.min_hop_timeout_ms);

        by_latency.min(by_budget).max(minimum).min(remaining)
    }
}

impl Default for LatencyEstimator {
    fn default() -> Self {
        Self::new(HopTimingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_multiplier_falls_back_to_budget() {
        let estimator = LatencyEstimator::new(HopTimingConfig {
            latency_multiplier: f64::MAX,
            ..HopTimingConfig::default()
        });
        let timeout = estimator.hop_timeout("example.com", Duration::from_secs(1));
        assert_eq!(timeout, Duration::from_millis(700));
    }

    #[test]
    fn budget_fraction_caps_timeout() {
        let estimator = LatencyEstimator::default();
        // 3 x 1500ms would be 4.5s; 70% of 1s wins.
        let timeout = estimator.hop_timeout("example.com", Duration::from_secs(1));
        assert_eq!(timeout, Duration::from_millis(700));
    }

    #[test]
    fn estimate_scales_timeout() {
        let mut estimator = LatencyEstimator::default();
        estimator.observe(Duration::from_millis(100));
        assert_eq!(estimator.estimate(), Duration::from_millis(100));
        let timeout = estimator.hop_timeout("example.com", Duration::from_secs(10));
        assert_eq!(timeout, Duration::from_millis(300));
    }

    #[test]
    fn ewma_blends_samples() {
        let mut estimator = LatencyEstimator::default();
        estimator.observe(Duration::from_millis(100));
        estimator.observe(Duration::from_millis(200));
        let ms = estimator.estimate().as_secs_f64() * 1000.0;
        assert!((ms - 130.0).abs() < 0.5, "estimate {ms}");
        assert_eq!(estimator.samples(), 2);
    }

    #[test]
    fn slow_domain_floor_applies_to_subdomains() {
        let mut estimator = LatencyEstimator::default();
        estimator.observe(Duration::from_millis(50));
        let timeout = estimator.hop_timeout("ad.doubleclick.net", Duration::from_secs(60));
        assert_eq!(timeout, Duration::from_millis(7_500));
        assert!(HopTimingConfig::default().floor_for("notdoubleclick.net").is_none());
    }

    #[test]
    fn never_exceeds_remaining_budget() {
        let estimator = LatencyEstimator::default();
        let timeout = estimator.hop_timeout("example.com", Duration::from_millis(5));
        assert_eq!(timeout, Duration::from_millis(5));
    }
}
