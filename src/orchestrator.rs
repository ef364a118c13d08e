//! High level trace orchestration.
//!
//! Wires together the rotators (identity, user agent, fingerprint, geo), the
//! three tracing strategies, exit IP geolocation, events and metrics behind a
//! single `trace` entry point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::{ConfigError, TracerConfig};
use crate::external_deps::geolocation::{GeoLocation, GeoLocator, IpApiLocator};
use crate::modules::events::{
	EventDispatcher, EventHandler, GeoLookupFailedEvent, HopRecordedEvent, LoggingHandler, MetricsHandler,
	TraceEvent, TraceFinishedEvent, TraceStartedEvent,
};
use crate::modules::geo::{GeoRotator, GeoSelection};
use crate::modules::identity::{IdentityError, ProxyCredentials, ProxyIdentityBuilder, normalize_country};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::spoofing::FingerprintSynthesizer;
use crate::modules::user_agents::{UserAgentRotator, UserAgentStats};
use crate::tracers::{
	AntiCloakingTracer, BrowserTracer, HttpOnlyTracer, RedirectTracer, TraceContext, TraceMode, TraceResult,
	TracerError,
};

/// Result alias used across the orchestration layer.
pub type OrchestratorResult<T> = Result<T, TraceError>;

/// Request-level failure. Per-hop failures are reported inside the chain.
#[derive(Debug, Error)]
pub enum TraceError {
	#[error("invalid url: {0}")]
	InvalidUrl(String),
	#[error("trace mode '{0}' is not enabled")]
	UnsupportedMode(TraceMode),
	#[error("proxy identity: {0}")]
	Identity(#[from] IdentityError),
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("tracer failed: {0}")]
	Tracer(#[from] TracerError),
}

/// One trace invocation. Unset limits fall back to the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceRequest {
	pub url: String,
	#[serde(default)]
	pub mode: TraceMode,
	pub max_redirects: Option<usize>,
	/// Trace-wide time budget.
	pub timeout_ms: Option<u64>,
	pub user_agent: Option<String>,
	/// Forced ISO-3166 alpha-2 country; wins over the geo rotator.
	pub target_country: Option<String>,
	pub referrer: Option<String>,
	pub proxy_host: Option<String>,
	pub proxy_port: Option<u16>,
	pub proxy_username: Option<String>,
	pub proxy_password: Option<String>,
	/// Lets browser modes stop loading once this host is reached.
	pub expected_final_url: Option<String>,
}

impl TraceRequest {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			..Self::default()
		}
	}

	pub fn with_mode(mut self, mode: TraceMode) -> Self {
		self.mode = mode;
		self
	}

	pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
		self.max_redirects = Some(max_redirects);
		self
	}

	pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
		self.timeout_ms = Some(timeout_ms);
		self
	}

	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.user_agent = Some(user_agent.into());
		self
	}

	pub fn with_target_country(mut self, country: impl Into<String>) -> Self {
		self.target_country = Some(country.into());
		self
	}

	pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
		self.referrer = Some(referrer.into());
		self
	}

	pub fn with_expected_final_url(mut self, url: impl Into<String>) -> Self {
		self.expected_final_url = Some(url.into());
		self
	}

	fn has_proxy_override(&self) -> bool {
		self.proxy_host.is_some()
			|| self.proxy_port.is_some()
			|| self.proxy_username.is_some()
			|| self.proxy_password.is_some()
	}
}

/// Tracer output merged with geo targeting and exit IP details.
#[derive(Debug, Clone, Serialize)]
pub struct TraceResponse {
	pub mode: TraceMode,
	#[serde(flatten)]
	pub result: TraceResult,
	pub selected_geo: Option<String>,
	pub geo_selection: GeoSelection,
	pub session_id: Option<String>,
	pub proxy_ip: Option<String>,
	pub geo_location: Option<GeoLocation>,
	pub total_timing_ms: u64,
}

impl TraceResponse {
	pub fn success(&self) -> bool {
		self.result.success
	}

	pub fn final_url(&self) -> &str {
		&self.result.final_url
	}
}

/// Fluent builder for [`TraceOrchestrator`].
pub struct TraceOrchestratorBuilder {
	config: TracerConfig,
	geo_locator: Option<Arc<dyn GeoLocator>>,
	use_default_locator: bool,
	handlers: Vec<Arc<dyn EventHandler>>,
	tracers: Vec<Arc<dyn RedirectTracer>>,
	disabled_modes: Vec<TraceMode>,
	enable_metrics: bool,
}

impl TraceOrchestratorBuilder {
	pub fn new() -> Self {
		Self {
			config: TracerConfig::default(),
			geo_locator: None,
			use_default_locator: true,
			handlers: Vec::new(),
			tracers: Vec::new(),
			disabled_modes: Vec::new(),
			enable_metrics: true,
		}
	}

	pub fn with_config(mut self, config: TracerConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_geo_locator(mut self, locator: Arc<dyn GeoLocator>) -> Self {
		self.geo_locator = Some(locator);
		self
	}

	/// Skips exit IP geolocation entirely.
	pub fn without_geo_locator(mut self) -> Self {
		self.geo_locator = None;
		self.use_default_locator = false;
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	/// Replaces the built-in tracer for `tracer.mode()`.
	pub fn with_tracer(mut self, tracer: Arc<dyn RedirectTracer>) -> Self {
		self.tracers.push(tracer);
		self
	}

	/// Rejects requests for `mode`, e.g. on hosts without a browser.
	pub fn disable_mode(mut self, mode: TraceMode) -> Self {
		self.disabled_modes.push(mode);
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.enable_metrics = false;
		self
	}

	pub fn build(self) -> OrchestratorResult<TraceOrchestrator> {
		self.config.validate()?;
		let config = self.config;

		let mut tracers: HashMap<TraceMode, Arc<dyn RedirectTracer>> = HashMap::new();
		tracers.insert(TraceMode::HttpOnly, Arc::new(HttpOnlyTracer::new(config.http.clone())));
		tracers.insert(TraceMode::Browser, Arc::new(BrowserTracer::new(config.browser.clone())));
		tracers.insert(
			TraceMode::AntiCloaking,
			Arc::new(AntiCloakingTracer::new(config.browser.clone())),
		);
		for tracer in self.tracers {
			tracers.insert(tracer.mode(), tracer);
		}
		for mode in &self.disabled_modes {
			tracers.remove(mode);
		}

		let geo_locator = match self.geo_locator {
			Some(locator) => Some(locator),
			None if self.use_default_locator && config.geolocation.enabled => {
				Some(Arc::new(IpApiLocator::new(config.geolocation.clone())) as Arc<dyn GeoLocator>)
			}
			None => None,
		};

		let metrics = self.enable_metrics.then(MetricsCollector::new);
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in self.handlers {
			events.register_handler(handler);
		}

		Ok(TraceOrchestrator {
			identities: ProxyIdentityBuilder::new(config.proxy.session_minutes),
			user_agents: Arc::new(UserAgentRotator::new(config.user_agents.rotator_config())),
			fingerprints: FingerprintSynthesizer::new(),
			geo: Arc::new(config.geo.rotator()),
			geo_locator,
			tracers,
			metrics,
			events: Arc::new(events),
			config,
		})
	}
}

impl Default for TraceOrchestratorBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Single entry point for redirect traces.
///
/// Rotators are built once and shared by every trace running through this
/// instance; everything else is created per trace.
pub struct TraceOrchestrator {
	config: TracerConfig,
	identities: ProxyIdentityBuilder,
	user_agents: Arc<UserAgentRotator>,
	fingerprints: FingerprintSynthesizer,
	geo: Arc<GeoRotator>,
	geo_locator: Option<Arc<dyn GeoLocator>>,
	tracers: HashMap<TraceMode, Arc<dyn RedirectTracer>>,
	metrics: Option<MetricsCollector>,
	events: Arc<EventDispatcher>,
}

impl TraceOrchestrator {
	/// Construct an orchestrator with default configuration.
	pub fn new() -> OrchestratorResult<Self> {
		TraceOrchestratorBuilder::new().build()
	}

	/// Obtain a builder to customise the orchestrator instance.
	pub fn builder() -> TraceOrchestratorBuilder {
		TraceOrchestratorBuilder::new()
	}

	pub fn config(&self) -> &TracerConfig {
		&self.config
	}

	/// `None` when metrics were disabled on the builder.
	pub fn metrics_snapshot(&self) -> Option<MetricsSnapshot> {
		self.metrics.as_ref().map(MetricsCollector::snapshot)
	}

	pub fn user_agent_stats(&self) -> UserAgentStats {
		self.user_agents.stats()
	}

	/// Runs one trace end to end.
	pub async fn trace(&self, request: TraceRequest) -> OrchestratorResult<TraceResponse> {
		let started = Instant::now();
		let url = parse_target(&request.url)?;
		let mode = request.mode;
		let tracer = self
			.tracers
			.get(&mode)
			.cloned()
			.ok_or(TraceError::UnsupportedMode(mode))?;

		let forced = match request.target_country.as_deref().filter(|code| !code.trim().is_empty()) {
			Some(code) => Some(normalize_country(code)?),
			None => None,
		};
		let geo_selection = self.geo.select(forced.as_deref());
		let country = match geo_selection.resolved.clone() {
			Some(code) => Some(code),
			None => match self.config.geo.default_country.as_deref() {
				Some(code) => Some(normalize_country(code)?),
				None => None,
			},
		};

		let identity = match self.proxy_credentials(&request) {
			Some(credentials) => Some(self.identities.identity(&credentials, country.as_deref())?),
			None => None,
		};

		let user_agent = request
			.user_agent
			.clone()
			.filter(|ua| !ua.trim().is_empty())
			.unwrap_or_else(|| self.user_agents.next());
		let fingerprint = self.fingerprints.synthesize(&user_agent);

		let expected_final_url = request.expected_final_url.as_deref().and_then(|raw| {
			Url::parse(raw)
				.map_err(|err| log::warn!("ignoring expected_final_url '{}': {}", raw, err))
				.ok()
		});

		let ctx = TraceContext {
			url: url.clone(),
			max_redirects: request.max_redirects.unwrap_or(self.config.defaults.max_redirects),
			timeout: Duration::from_millis(request.timeout_ms.unwrap_or(self.config.defaults.timeout_ms).max(1)),
			user_agent,
			fingerprint,
			identity,
			referrer: request.referrer.clone(),
			target_country: country.clone(),
			expected_final_url,
		};

		self.events.dispatch(TraceEvent::TraceStarted(TraceStartedEvent {
			url: url.to_string(),
			mode,
			target_country: country.clone(),
			session_id: ctx.identity.as_ref().map(|identity| identity.session_id.clone()),
			timestamp: Utc::now(),
		}));

		let lookup = async {
			match &self.geo_locator {
				Some(locator) => Some((locator.name(), locator.locate(ctx.identity.as_ref()).await)),
				None => None,
			}
		};
		let (traced, located) = tokio::join!(tracer.trace(&ctx), lookup);

		let (proxy_ip, geo_location) = match located {
			Some((_, Ok(lookup))) => (Some(lookup.ip), Some(lookup.location)),
			Some((name, Err(err))) => {
				self.events.dispatch(TraceEvent::GeoLookupFailed(GeoLookupFailedEvent {
					locator: name.to_string(),
					error: err.to_string(),
					timestamp: Utc::now(),
				}));
				(None, None)
			}
			None => (None, None),
		};

		let result = match traced {
			Ok(result) => result,
			Err(err) => {
				self.events.dispatch(TraceEvent::TraceFinished(TraceFinishedEvent {
					url: url.to_string(),
					mode,
					final_url: None,
					success: false,
					hops: 0,
					elapsed: started.elapsed(),
					error: Some(err.to_string()),
					timestamp: Utc::now(),
				}));
				return Err(err.into());
			}
		};

		for hop in &result.chain {
			self.events.dispatch(TraceEvent::HopRecorded(HopRecordedEvent {
				mode,
				hop: hop.clone(),
				timestamp: Utc::now(),
			}));
		}
		let elapsed = started.elapsed();
		self.events.dispatch(TraceEvent::TraceFinished(TraceFinishedEvent {
			url: url.to_string(),
			mode,
			final_url: Some(result.final_url.clone()),
			success: result.success,
			hops: result.chain.len(),
			elapsed,
			error: None,
			timestamp: Utc::now(),
		}));

		Ok(TraceResponse {
			mode,
			result,
			selected_geo: country,
			geo_selection,
			session_id: ctx.identity.as_ref().map(|identity| identity.session_id.clone()),
			proxy_ip,
			geo_location,
			total_timing_ms: elapsed.as_millis() as u64,
		})
	}

	/// Configured credentials with request overrides applied field by field.
	fn proxy_credentials(&self, request: &TraceRequest) -> Option<ProxyCredentials> {
		let base = self.config.proxy.credentials.clone();
		if base.is_none() && !request.has_proxy_override() {
			return None;
		}
		let mut credentials = base.unwrap_or(ProxyCredentials {
			host: String::new(),
			port: 0,
			username: String::new(),
			password: String::new(),
		});
		if let Some(host) = &request.proxy_host {
			credentials.host = host.clone();
		}
		if let Some(port) = request.proxy_port {
			credentials.port = port;
		}
		if let Some(username) = &request.proxy_username {
			credentials.username = username.clone();
		}
		if let Some(password) = &request.proxy_password {
			credentials.password = password.clone();
		}
		Some(credentials)
	}
}

fn parse_target(raw: &str) -> OrchestratorResult<Url> {
	let url = Url::parse(raw.trim()).map_err(|err| TraceError::InvalidUrl(format!("{raw}: {err}")))?;
	if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
		return Err(TraceError::InvalidUrl(format!("{raw}: only http(s) urls can be traced")));
	}
	Ok(url)
}
