//! Hop bookkeeping for browser traces.
//!
//! The driver's DevTools listeners translate network and page events into the
//! plain observations below; the recorder turns them into the hop chain,
//! network statistics and redirect log.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::tracers::types::{HopRecord, JsRedirectEvent, NetworkStats, RedirectType};

pub(crate) const METHOD_DOCUMENT: &str = "browser_document";
pub(crate) const METHOD_HTTP_REDIRECT: &str = "browser_http_redirect";
pub(crate) const METHOD_CLIENT_REDIRECT: &str = "browser_client_redirect";
pub(crate) const METHOD_POPUP: &str = "browser_popup";

/// A request the page is about to send.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestSent {
    pub request_id: String,
    pub url: String,
    pub frame_id: Option<String>,
    pub document: bool,
    /// Status of the redirect response this request follows, if any.
    pub redirect_status: Option<u16>,
    /// Script URLs on the initiator stack, innermost first.
    pub initiator_scripts: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct LoadingFailed {
    pub request_id: String,
    pub error_text: String,
    pub canceled: bool,
    pub blocked: bool,
}

/// Why a navigation wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settle {
    Idle,
    ExpectedReached,
    Deadline,
}

/// State fed by the DevTools listeners and read by the driving task.
pub(crate) struct Recorder {
    pub main_frame: Option<String>,
    pub hops: Vec<HopRecord>,
    /// Request id -> (hop index, time the current leg of the request started).
    requests: HashMap<String, (usize, Instant)>,
    seen_documents: HashSet<String>,
    /// Child frame id -> current document URL.
    child_frames: HashMap<String, String>,
    pub stats: NetworkStats,
    pub js_log: Vec<JsRedirectEvent>,
    /// Method tag for the next document hop, set before a driver-initiated navigation.
    pub pending_method: Option<String>,
    pub expected_request: Option<String>,
    pub expected_reached: bool,
    pub last_progress: Instant,
}

impl Recorder {
    pub(crate) fn new(main_frame: Option<String>) -> Self {
        Self {
            main_frame,
            hops: Vec::new(),
            requests: HashMap::new(),
            seen_documents: HashSet::new(),
            child_frames: HashMap::new(),
            stats: NetworkStats::default(),
            js_log: Vec::new(),
            pending_method: None,
            expected_request: None,
            expected_reached: false,
            last_progress: Instant::now(),
        }
    }

    fn is_main_frame(&self, frame: Option<&str>) -> bool {
        match (&self.main_frame, frame) {
            (Some(main), Some(frame)) => main == frame,
            _ => true,
        }
    }

    /// Returns the hop URL when the request opened a main-frame document hop.
    pub(crate) fn on_request(&mut self, sent: &RequestSent) -> Option<String> {
        self.stats.total_requests += 1;
        if !sent.document || !self.is_main_frame(sent.frame_id.as_deref()) {
            return None;
        }

        self.stats.document_requests += 1;
        let url = sent.url.clone();
        if !self.seen_documents.insert(url.clone()) {
            self.stats.detected_retries += 1;
        }

        let now = Instant::now();
        let method = match sent.redirect_status {
            Some(status) => {
                if let Some((index, started)) = self.requests.get(&sent.request_id).copied()
                    && let Some(hop) = self.hops.get_mut(index)
                {
                    hop.http_status = status;
                    hop.redirect_type = RedirectType::Http;
                    hop.timing_ms = now.duration_since(started).as_millis() as u64;
                }
                METHOD_HTTP_REDIRECT.to_string()
            }
            None => {
                // A fresh document load: the page on screen redirected client side.
                if let Some(last) = self.hops.last_mut()
                    && last.redirect_type == RedirectType::Final
                {
                    last.redirect_type = RedirectType::Http;
                }
                if let Some(frame_url) = self.initiating_child_frame(sent) {
                    log::debug!("frame {} forced top navigation to {}", frame_url, url);
                    self.js_log.push(JsRedirectEvent {
                        kind: "top_navigation".to_string(),
                        url: url.clone(),
                        timestamp: chrono::Utc::now().timestamp_millis() as f64,
                        method: Some("frame_script".to_string()),
                        frame: Some("child".to_string()),
                    });
                }
                self.pending_method.take().unwrap_or_else(|| {
                    if self.hops.is_empty() {
                        METHOD_DOCUMENT.to_string()
                    } else {
                        METHOD_CLIENT_REDIRECT.to_string()
                    }
                })
            }
        };

        let sequence = self.hops.len();
        log::debug!("browser hop {} -> {} ({})", sequence, url, method);
        self.hops
            .push(HopRecord::new(sequence, url.clone(), 0, RedirectType::Final, method));
        self.requests.insert(sent.request_id.clone(), (sequence, now));
        self.last_progress = now;
        Some(url)
    }

    /// Child frame whose script started this main-frame load. Inline scripts
    /// report the frame document URL; external ones are matched by origin
    /// when that origin differs from the page being replaced.
    fn initiating_child_frame(&self, sent: &RequestSent) -> Option<String> {
        let current_origin = self.hops.last().and_then(|hop| origin_of(&hop.url));
        sent.initiator_scripts.iter().find_map(|script| {
            self.child_frames.values().find_map(|frame_url| {
                if script == frame_url {
                    return Some(frame_url.clone());
                }
                let script_origin = origin_of(script)?;
                (Some(&script_origin) == origin_of(frame_url).as_ref() && Some(&script_origin) != current_origin.as_ref())
                    .then(|| frame_url.clone())
            })
        })
    }

    pub(crate) fn on_response(&mut self, request_id: &str, status: i64) {
        if let Some((index, started)) = self.requests.get(request_id).copied()
            && let Some(hop) = self.hops.get_mut(index)
        {
            hop.http_status = u16::try_from(status).unwrap_or(0);
            hop.timing_ms = started.elapsed().as_millis() as u64;
        }
    }

    pub(crate) fn on_finished(&mut self, request_id: &str, encoded_bytes: f64) {
        if let Some((index, _)) = self.requests.get(request_id).copied()
            && let Some(hop) = self.hops.get_mut(index)
        {
            hop.bandwidth_bytes = Some(encoded_bytes.max(0.0) as u64);
        }
    }

    pub(crate) fn on_failed(&mut self, failed: &LoadingFailed) {
        // Cancelled loads are superseded navigations or our own StopLoading.
        if failed.canceled || failed.blocked {
            return;
        }
        if let Some((index, _)) = self.requests.get(&failed.request_id).copied()
            && let Some(hop) = self.hops.get_mut(index)
        {
            hop.redirect_type = RedirectType::Error;
            hop.error = Some(failed.error_text.clone());
        }
    }

    pub(crate) fn on_frame_navigated(&mut self, frame_id: &str, parent_id: Option<&str>, url: &str) {
        if parent_id.is_none() {
            self.last_progress = Instant::now();
            if self.main_frame.is_none() {
                self.main_frame = Some(frame_id.to_string());
            }
            // A new top document discards its frames.
            self.child_frames.clear();
        } else {
            self.child_frames.insert(frame_id.to_string(), url.to_string());
        }
    }

    pub(crate) fn on_report(&mut self, payload: &str) {
        match serde_json::from_str::<JsRedirectEvent>(payload) {
            Ok(entry) => {
                if matches!(entry.kind.as_str(), "navigate" | "timer" | "meta_refresh" | "form_submit") {
                    self.last_progress = Instant::now();
                }
                self.js_log.push(entry);
            }
            Err(err) => log::debug!("ignoring malformed instrumentation report: {}", err),
        }
    }

    /// Moves the collected chain, log and statistics out of the recorder.
    pub(crate) fn take(&mut self) -> (Vec<HopRecord>, Vec<JsRedirectEvent>, NetworkStats) {
        let mut stats = std::mem::take(&mut self.stats);
        stats.finish();
        (
            std::mem::take(&mut self.hops),
            std::mem::take(&mut self.js_log),
            stats,
        )
    }
}

fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed.origin().is_tuple().then(|| parsed.origin().ascii_serialization())
}

/// Terminal fix-ups: a last hop without a response at the deadline or with an
/// error status is an error, and an empty chain gets one error hop.
pub(crate) fn finalize_hops(hops: &mut Vec<HopRecord>, start_url: &str, method: &str, timeout: Duration, settle: Settle) {
    match hops.last_mut() {
        Some(last) if !last.is_error() => {
            if last.http_status == 0 && settle == Settle::Deadline {
                last.redirect_type = RedirectType::Error;
                last.error = Some(format!("navigation timed out after {}ms", timeout.as_millis()));
            } else if last.http_status >= 400 {
                last.redirect_type = RedirectType::Error;
                last.error = Some(format!("http status {}", last.http_status));
            }
        }
        Some(_) => {}
        None => hops.push(HopRecord::failed(0, start_url, 0, method, "navigation produced no document")),
    }
}
