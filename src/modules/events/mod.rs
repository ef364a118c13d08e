//! Event system for trace orchestration.
//!
//! Provides hooks for metrics, logging, and custom reactions around trace
//! activity.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::metrics::MetricsCollector;
use crate::tracers::{HopRecord, TraceMode};

/// Emitted once identity and geo target are resolved, before the tracer runs.
#[derive(Debug, Clone)]
pub struct TraceStartedEvent {
    pub url: String,
    pub mode: TraceMode,
    pub target_country: Option<String>,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One hop of a finished chain, in causal order.
#[derive(Debug, Clone)]
pub struct HopRecordedEvent {
    pub mode: TraceMode,
    pub hop: HopRecord,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TraceFinishedEvent {
    pub url: String,
    pub mode: TraceMode,
    pub final_url: Option<String>,
    pub success: bool,
    pub hops: usize,
    pub elapsed: Duration,
    /// Set when the trace failed at request level.
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GeoLookupFailedEvent {
    pub locator: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum TraceEvent {
    TraceStarted(TraceStartedEvent),
    HopRecorded(HopRecordedEvent),
    TraceFinished(TraceFinishedEvent),
    GeoLookupFailed(GeoLookupFailedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &TraceEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn dispatch(&self, event: TraceEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &TraceEvent) {
        match event {
            TraceEvent::TraceStarted(started) => {
                log::debug!(
                    "trace [{}] {} country={} session={}",
                    started.mode,
                    started.url,
                    started.target_country.as_deref().unwrap_or("-"),
                    started.session_id.as_deref().unwrap_or("direct")
                );
            }
            TraceEvent::HopRecorded(recorded) => {
                let hop = &recorded.hop;
                log::debug!(
                    "  #{} {} {} ({}ms, {:?}){}",
                    hop.sequence,
                    hop.http_status,
                    hop.url,
                    hop.timing_ms,
                    hop.redirect_type,
                    hop.error.as_deref().map(|err| format!(" error: {err}")).unwrap_or_default()
                );
            }
            TraceEvent::TraceFinished(finished) => match &finished.error {
                Some(error) => log::warn!("trace [{}] {} failed: {}", finished.mode, finished.url, error),
                None => log::info!(
                    "trace [{}] {} -> {} success={} hops={} ({:.2}s)",
                    finished.mode,
                    finished.url,
                    finished.final_url.as_deref().unwrap_or("-"),
                    finished.success,
                    finished.hops,
                    finished.elapsed.as_secs_f64()
                ),
            },
            TraceEvent::GeoLookupFailed(failed) => {
                log::warn!("geolocation via {} failed: {}", failed.locator, failed.error);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &TraceEvent) {
        match event {
            TraceEvent::HopRecorded(recorded) => self.metrics.record_hop(&recorded.hop),
            TraceEvent::TraceFinished(finished) => {
                self.metrics
                    .record_trace(finished.mode, finished.success, finished.elapsed);
            }
            TraceEvent::GeoLookupFailed(_) => self.metrics.record_geo_failure(),
            TraceEvent::TraceStarted(_) => {}
        }
    }
}
