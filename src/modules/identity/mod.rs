//! Proxy session identities.
//!
//! Every trace presents a username carrying a fresh session token so the
//! upstream rotating-IP provider assigns it its own sticky exit IP. Reusing a
//! token would pin two traces to the same IP.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Entropy of the random part of a session token, in bytes.
const SESSION_TOKEN_BYTES: usize = 8;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Credentials for the upstream rotating-IP provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Per-trace proxy identity. Never shared between traces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyIdentity {
    pub host: String,
    pub port: u16,
    pub base_username: String,
    /// Full username presented to the proxy (base + selectors + session).
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub session_id: String,
    pub target_country: Option<String>,
}

impl ProxyIdentity {
    /// Proxy endpoint without credentials. Browser engines take credentials
    /// through their auth hook instead of the URL.
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn reqwest_proxy(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        Ok(reqwest::Proxy::all(self.proxy_url())?.basic_auth(&self.username, &self.password))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("proxy host is empty")]
    MissingHost,
    #[error("proxy port must be non-zero")]
    InvalidPort,
    #[error("proxy base username is empty")]
    MissingUsername,
    #[error("invalid country selector '{0}'")]
    InvalidCountry(String),
}

/// Builds proxy usernames and identities.
#[derive(Debug, Clone)]
pub struct ProxyIdentityBuilder {
    session_minutes: u32,
}

impl ProxyIdentityBuilder {
    pub fn new(session_minutes: u32) -> Self {
        Self {
            session_minutes: session_minutes.max(1),
        }
    }

    /// Appends `-region-<cc>` when a country is given and not already encoded,
    /// then a fresh session token and the session-duration hint.
    pub fn build(&self, base_username: &str, country: Option<&str>, country_already_encoded: bool) -> String {
        self.build_with_session(base_username, country, country_already_encoded, &new_session_token())
    }

    /// Builds a complete identity for one trace.
    pub fn identity(
        &self,
        credentials: &ProxyCredentials,
        country: Option<&str>,
    ) -> Result<ProxyIdentity, IdentityError> {
        if credentials.host.trim().is_empty() {
            return Err(IdentityError::MissingHost);
        }
        if credentials.port == 0 {
            return Err(IdentityError::InvalidPort);
        }
        if credentials.username.trim().is_empty() {
            return Err(IdentityError::MissingUsername);
        }
        let country = match country {
            Some(code) => Some(normalize_country(code)?),
            None => None,
        };

        let session_id = new_session_token();
        let encoded = country_encoded(&credentials.username);
        let username = self.build_with_session(&credentials.username, country.as_deref(), encoded, &session_id);

        Ok(ProxyIdentity {
            host: credentials.host.trim().to_string(),
            port: credentials.port,
            base_username: credentials.username.clone(),
            username,
            password: credentials.password.clone(),
            session_id,
            target_country: country,
        })
    }

    fn build_with_session(
        &self,
        base_username: &str,
        country: Option<&str>,
        country_already_encoded: bool,
        session: &str,
    ) -> String {
        let mut username = base_username.to_string();
        if let Some(code) = country
            && !country_already_encoded
        {
            username.push_str("-region-");
            username.push_str(&code.to_ascii_lowercase());
        }
        username.push_str(&format!("-sessid-{session}-sesstime-{}", self.session_minutes));
        username
    }
}

impl Default for ProxyIdentityBuilder {
    fn default() -> Self {
        Self::new(10)
    }
}

/// True when the base username already pins a country selector.
pub fn country_encoded(base_username: &str) -> bool {
    let lower = base_username.to_ascii_lowercase();
    lower.contains("-region-") || lower.contains("-country-")
}

/// Validates and lowercases an ISO-3166 alpha-2 code.
pub fn normalize_country(code: &str) -> Result<String, IdentityError> {
    let trimmed = code.trim();
    if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(trimmed.to_ascii_lowercase())
    } else {
        Err(IdentityError::InvalidCountry(code.to_string()))
    }
}

/// 8 random bytes plus a process-wide counter, hex encoded.
fn new_session_token() -> String {
    let mut bytes = [0u8; SESSION_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let sequence = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}{:x}", hex::encode(bytes), sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn credentials() -> ProxyCredentials {
        ProxyCredentials {
            host: "gate.proxy.test".into(),
            port: 7000,
            username: "customer-acme".into(),
            password: "secret".into(),
        }
    }

    #[test]
    fn appends_region_and_session() {
        let builder = ProxyIdentityBuilder::new(10);
        let username = builder.build("customer-acme", Some("US"), false);
        assert!(username.starts_with("customer-acme-region-us-sessid-"));
        assert!(username.ends_with("-sesstime-10"));
    }

    #[test]
    fn skips_region_when_already_encoded() {
        let builder = ProxyIdentityBuilder::default();
        let username = builder.build("customer-acme-region-gb", Some("us"), true);
        assert!(username.starts_with("customer-acme-region-gb-sessid-"));
        assert!(!username.contains("-region-us"));
    }

    #[test]
    fn usernames_never_repeat() {
        let builder = ProxyIdentityBuilder::default();
        let mut seen = HashSet::new();
        for i in 0..2_000 {
            let country = if i % 2 == 0 { Some("us") } else { None };
            assert!(seen.insert(builder.build("customer-acme", country, false)));
        }
    }

    #[test]
    fn session_token_has_enough_entropy() {
        let token = new_session_token();
        assert!(token.len() > SESSION_TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identity_detects_encoded_country() {
        let builder = ProxyIdentityBuilder::default();
        let mut creds = credentials();
        creds.username = "customer-acme-country-de".into();
        let identity = builder.identity(&creds, Some("fr")).unwrap();
        assert!(!identity.username.contains("-region-fr"));
        assert_eq!(identity.target_country.as_deref(), Some("fr"));
        assert!(identity.username.contains(&identity.session_id));
        assert_eq!(identity.proxy_url(), "http://gate.proxy.test:7000");
    }

    #[test]
    fn identity_rejects_bad_input() {
        let builder = ProxyIdentityBuilder::default();
        let mut creds = credentials();
        creds.host = " ".into();
        assert_eq!(builder.identity(&creds, None), Err(IdentityError::MissingHost));
        assert_eq!(
            builder.identity(&credentials(), Some("usa")),
            Err(IdentityError::InvalidCountry("usa".into()))
        );
    }
}
