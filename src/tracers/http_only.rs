//! Header-only redirect tracer.
//!
//! Every hop is a cancellable task that sends a GET with automatic redirects
//! disabled and reports back as soon as the response head arrives. The task
//! drops the response right after reporting, so bodies are never read, and the
//! next hop is launched without waiting for that teardown. The driving loop
//! owns the visited set and the trace deadline; completions arrive over a
//! channel and the chain is re-sorted by launch index before returning.

use async_trait::async_trait;
use http::header::{ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, LOCATION, REFERER};
use reqwest::Client;
use reqwest::redirect::Policy;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use url::Url;

use super::types::{HopRecord, MAX_REDIRECTS_REACHED, ParallelMetrics, REDIRECT_LOOP, RedirectType, TraceResult};
use super::{RedirectTracer, TraceContext, TraceMode, TracerError};
use crate::modules::adaptive_timing::{HopTimingConfig, LatencyEstimator};

const METHOD: &str = "http_stream";

/// Status line plus the blank line ending the head.
const HEAD_OVERHEAD_BYTES: u64 = 19;

#[derive(Debug, Clone, Default)]
pub struct HttpOnlyTracer {
    timing: HopTimingConfig,
}

#[derive(Debug, Clone)]
struct HopHeaders {
    status: u16,
    location: Option<String>,
    header_bytes: u64,
}

impl HopHeaders {
    fn from_response(response: &reqwest::Response) -> Self {
        let headers = response.headers();
        Self {
            status: response.status().as_u16(),
            location: headers
                .get(LOCATION)
                .map(|value| decode_location(value.as_bytes()).trim().to_string()),
            header_bytes: head_size(headers),
        }
    }
}

#[derive(Debug)]
enum HopFailure {
    Timeout(Duration),
    Transport(String),
}

#[derive(Debug)]
struct HopOutcome {
    index: usize,
    url: Url,
    latency: Duration,
    result: Result<HopHeaders, HopFailure>,
}

#[derive(Debug, PartialEq)]
enum HopDecision {
    Follow(Url),
    Final,
    Loop(Url),
    LimitReached,
    HttpError(u16),
    InvalidLocation(String),
}

impl HttpOnlyTracer {
    pub fn new(timing: HopTimingConfig) -> Self {
        Self { timing }
    }

    /// One client per trace: keep-alive across this trace's hops, never
    /// shared with another trace so each trace gets a fresh exit IP.
    fn build_client(&self, ctx: &TraceContext) -> Result<Client, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        if let Ok(value) = HeaderValue::from_str(&ctx.fingerprint.accept_language) {
            headers.insert(ACCEPT_LANGUAGE, value);
        }
        if let Ok(value) = HeaderValue::from_str(&ctx.fingerprint.accept_encoding) {
            headers.insert(ACCEPT_ENCODING, value);
        }
        if let Some(referrer) = ctx.referrer.as_deref()
            && let Ok(value) = HeaderValue::from_str(referrer)
        {
            headers.insert(REFERER, value);
        }

        let builder = Client::builder()
            .redirect(Policy::none())
            .cookie_store(true)
            .user_agent(ctx.user_agent.as_str())
            .default_headers(headers)
            .pool_idle_timeout(ctx.timeout);

        let builder = match ctx.identity.as_ref() {
            Some(identity) => builder.proxy(identity.reqwest_proxy()?),
            None => builder.no_proxy(),
        };
        builder.build()
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        tasks: &mut JoinSet<()>,
        client: &Client,
        tx: &mpsc::UnboundedSender<HopOutcome>,
        estimator: &LatencyEstimator,
        deadline: Instant,
        metrics: &mut ParallelMetrics,
        index: usize,
        url: Url,
    ) -> (usize, Url) {
        while tasks.try_join_next().is_some() {}

        let remaining = deadline.saturating_duration_since(Instant::now());
        let hop_timeout = estimator.hop_timeout(url.host_str().unwrap_or_default(), remaining);
        log::debug!("hop {} -> {} (timeout {}ms)", index, url, hop_timeout.as_millis());

        let request = client.get(url.clone());
        let tx = tx.clone();
        let task_url = url.clone();
        tasks.spawn(async move {
            let started = Instant::now();
            let (result, response) = match tokio::time::timeout(hop_timeout, request.send()).await {
                Ok(Ok(response)) => (Ok(HopHeaders::from_response(&response)), Some(response)),
                Ok(Err(err)) => (Err(HopFailure::Transport(describe_transport_error(&err))), None),
                Err(_) => (Err(HopFailure::Timeout(hop_timeout)), None),
            };
            let _ = tx.send(HopOutcome {
                index,
                url: task_url,
                latency: started.elapsed(),
                result,
            });
            // Tear the stream down only after the driver has been told.
            drop(response);
        });

        metrics.hops_launched += 1;
        metrics.max_in_flight = metrics.max_in_flight.max(tasks.len());
        (index, url)
    }
}

#[async_trait]
impl RedirectTracer for HttpOnlyTracer {
    fn mode(&self) -> TraceMode {
        TraceMode::HttpOnly
    }

    async fn trace(&self, ctx: &TraceContext) -> Result<TraceResult, TracerError> {
        let deadline = Instant::now() + ctx.timeout;
        let client = self.build_client(ctx)?;

        let mut estimator = LatencyEstimator::new(self.timing.clone());
        let mut metrics = ParallelMetrics::default();
        let mut tasks = JoinSet::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut visited = HashSet::new();
        visited.insert(visit_key(&ctx.url));
        let mut chain: Vec<HopRecord> = Vec::new();
        let mut latencies: Vec<f64> = Vec::new();
        let mut redirects = 0usize;

        let mut pending = Some(self.launch(
            &mut tasks,
            &client,
            &tx,
            &estimator,
            deadline,
            &mut metrics,
            0,
            ctx.url.clone(),
        ));

        while let Some((pending_index, pending_url)) = pending.take() {
            tokio::select! {
                outcome = rx.recv() => {
                    let Some(outcome) = outcome else { break };
                    let timing_ms = outcome.latency.as_millis() as u64;
                    let headers = match outcome.result {
                        Ok(headers) => headers,
                        Err(failure) => {
                            let message = match failure {
                                HopFailure::Timeout(limit) => format!("hop timed out after {}ms", limit.as_millis()),
                                HopFailure::Transport(message) => message,
                            };
                            log::debug!("hop {} failed: {}", outcome.index, message);
                            chain.push(
                                HopRecord::failed(outcome.index, outcome.url.as_str(), 0, METHOD, message)
                                    .with_timing_ms(timing_ms),
                            );
                            continue;
                        }
                    };

                    estimator.observe(outcome.latency);
                    latencies.push(outcome.latency.as_secs_f64() * 1000.0);
                    let hop = HopRecord::new(outcome.index, outcome.url.as_str(), headers.status, RedirectType::Http, METHOD)
                        .with_timing_ms(timing_ms)
                        .with_bandwidth(headers.header_bytes);

                    match decide(&outcome.url, &headers, redirects, ctx.max_redirects, &visited) {
                        HopDecision::Follow(next) => {
                            chain.push(hop);
                            redirects += 1;
                            visited.insert(visit_key(&next));
                            pending = Some(self.launch(
                                &mut tasks,
                                &client,
                                &tx,
                                &estimator,
                                deadline,
                                &mut metrics,
                                outcome.index + 1,
                                next,
                            ));
                        }
                        HopDecision::Final => {
                            let mut hop = hop;
                            hop.redirect_type = RedirectType::Final;
                            chain.push(hop);
                        }
                        HopDecision::Loop(target) => {
                            chain.push(hop);
                            chain.push(HopRecord::failed(outcome.index + 1, target.as_str(), 0, METHOD, REDIRECT_LOOP));
                        }
                        HopDecision::LimitReached => chain.push(hop.with_error(MAX_REDIRECTS_REACHED)),
                        HopDecision::HttpError(status) => chain.push(hop.with_error(format!("http status {status}"))),
                        HopDecision::InvalidLocation(location) => {
                            chain.push(hop.with_error(format!("invalid location header '{location}'")))
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    metrics.budget_exhausted = true;
                    log::debug!("trace budget exhausted while waiting on hop {}", pending_index);
                    chain.push(HopRecord::failed(
                        pending_index,
                        pending_url.as_str(),
                        0,
                        METHOD,
                        format!("trace budget of {}ms exhausted", ctx.timeout.as_millis()),
                    ));
                }
            }
        }

        while tasks.try_join_next().is_some() {}
        metrics.aborted_streams = tasks.len();
        tasks.abort_all();

        if !latencies.is_empty() {
            metrics.average_hop_latency_ms = Some(latencies.iter().sum::<f64>() / latencies.len() as f64);
        }

        Ok(TraceResult::from_chain(ctx.url.as_str(), chain, &ctx.user_agent, ctx.max_redirects)
            .with_parallel_metrics(metrics))
    }
}

fn decide(
    current: &Url,
    headers: &HopHeaders,
    redirects: usize,
    max_redirects: usize,
    visited: &HashSet<String>,
) -> HopDecision {
    let status = headers.status;
    if status >= 400 {
        return HopDecision::HttpError(status);
    }
    if !(300..400).contains(&status) {
        return HopDecision::Final;
    }
    let Some(location) = headers.location.as_deref() else {
        return HopDecision::Final;
    };
    if location.is_empty() {
        return HopDecision::InvalidLocation(String::new());
    }
    let Ok(next) = current.join(location) else {
        return HopDecision::InvalidLocation(location.to_string());
    };
    if redirects >= max_redirects {
        HopDecision::LimitReached
    } else if visited.contains(&visit_key(&next)) {
        HopDecision::Loop(next)
    } else {
        HopDecision::Follow(next)
    }
}

/// Loop-detection key: fragments never reach the server.
fn visit_key(url: &Url) -> String {
    let mut key = url.clone();
    key.set_fragment(None);
    key.to_string()
}

/// Location values are not required to be ASCII; click wrappers send raw
/// UTF-8 or Latin-1. Valid UTF-8 is kept as is (`Url::join` percent-encodes
/// it), any other high byte is percent-encoded.
fn decode_location(raw: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(raw) {
        return text.to_string();
    }
    let mut decoded = String::with_capacity(raw.len() * 3);
    for &byte in raw {
        if byte.is_ascii() {
            decoded.push(byte as char);
        } else {
            decoded.push_str(&format!("%{byte:02X}"));
        }
    }
    decoded
}

fn head_size(headers: &HeaderMap) -> u64 {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().len() + value.len() + 4) as u64)
        .sum::<u64>()
        + HEAD_OVERHEAD_BYTES
}

fn describe_transport_error(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(status: u16, location: Option<&str>) -> HopHeaders {
        HopHeaders {
            status,
            location: location.map(str::to_string),
            header_bytes: 0,
        }
    }

    fn url(value: &str) -> Url {
        Url::parse(value).unwrap()
    }

    #[test]
    fn follows_relative_location() {
        let visited = HashSet::new();
        let decision = decide(&url("https://a.test/x/y"), &head(301, Some("../z?q=1")), 0, 5, &visited);
        assert_eq!(decision, HopDecision::Follow(url("https://a.test/z?q=1")));
    }

    #[test]
    fn detects_loop_ignoring_fragment() {
        let mut visited = HashSet::new();
        visited.insert(visit_key(&url("https://a.test/start")));
        let decision = decide(&url("https://a.test/start"), &head(302, Some("/start#again")), 0, 5, &visited);
        assert_eq!(decision, HopDecision::Loop(url("https://a.test/start#again")));
    }

    #[test]
    fn limit_checked_before_loop() {
        let decision = decide(&url("https://a.test/"), &head(302, Some("/next")), 3, 3, &HashSet::new());
        assert_eq!(decision, HopDecision::LimitReached);
    }

    #[test]
    fn terminal_statuses() {
        let visited = HashSet::new();
        let current = url("https://a.test/");
        assert_eq!(decide(&current, &head(200, None), 0, 5, &visited), HopDecision::Final);
        assert_eq!(decide(&current, &head(304, None), 0, 5, &visited), HopDecision::Final);
        assert_eq!(decide(&current, &head(404, Some("/x")), 0, 5, &visited), HopDecision::HttpError(404));
    }

    #[test]
    fn non_ascii_location_is_followed() {
        let location = decode_location("/café".as_bytes());
        let decision = decide(&url("https://a.test/x"), &head(302, Some(&location)), 0, 5, &HashSet::new());
        assert_eq!(decision, HopDecision::Follow(url("https://a.test/caf%C3%A9")));

        assert_eq!(decode_location(b"/caf\xe9"), "/caf%E9");
        assert_eq!(
            decide(&url("https://a.test/x"), &head(302, Some("")), 0, 5, &HashSet::new()),
            HopDecision::InvalidLocation(String::new())
        );
    }

    #[test]
    fn head_size_counts_header_lines() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("/next"));
        // "location: /next\r\n"
        assert_eq!(head_size(&headers), 8 + 5 + 4 + HEAD_OVERHEAD_BYTES);
    }
}
