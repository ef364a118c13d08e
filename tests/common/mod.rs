#![allow(dead_code)]

use std::time::Duration;

use redirect_tracer::{FingerprintSynthesizer, TraceContext};
use url::Url;

pub const DESKTOP_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Direct (no proxy) trace context for fixture servers.
pub fn context(url: &str, max_redirects: usize, timeout: Duration) -> TraceContext {
    TraceContext {
        url: Url::parse(url).unwrap(),
        max_redirects,
        timeout,
        user_agent: DESKTOP_UA.to_string(),
        fingerprint: FingerprintSynthesizer::new().synthesize(DESKTOP_UA),
        identity: None,
        referrer: None,
        target_country: None,
        expected_final_url: None,
    }
}
