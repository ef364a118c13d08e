//! # redirect-tracer
//!
//! Resolves the real landing page behind ad-click redirect chains, routing
//! every trace through a fresh rotating-proxy session.
//!
//! ## Features
//!
//! - Header-only tracing with hops issued as a self-racing pipeline
//! - Browser tracing for script, meta-refresh and popup redirects
//! - Anti-cloaking mode with canvas/WebGL noise and cloak scoring
//! - Per-trace proxy sessions, user-agent rotation and consistent fingerprints
//! - Geo targeting with round-robin or weighted country pools
//! - Best-effort geolocation of the exit IP
//!
//! Browser modes need the default `browser` feature and a local Chrome or
//! Chromium binary.
//!
//! ## Example
//!
//! ```no_run
//! use redirect_tracer::{TraceMode, TraceOrchestrator, TraceRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = TraceOrchestrator::new()?;
//!     let request = TraceRequest::new("https://example.com/click?id=42")
//!         .with_mode(TraceMode::HttpOnly)
//!         .with_max_redirects(10);
//!     let response = orchestrator.trace(request).await?;
//!     println!("{} -> {}", response.success(), response.final_url());
//!     Ok(())
//! }
//! ```

mod orchestrator;

pub mod config;
pub mod external_deps;
pub mod modules;
pub mod tracers;

pub use crate::orchestrator::{
    OrchestratorResult,
    TraceError,
    TraceOrchestrator,
    TraceOrchestratorBuilder,
    TraceRequest,
    TraceResponse,
};

pub use crate::config::{ConfigError, TracerConfig};

pub use crate::external_deps::geolocation::{
    GeoLocation,
    GeoLocationConfig,
    GeoLocationError,
    GeoLocator,
    GeoLookup,
    IpApiLocator,
};

pub use crate::tracers::{
    AntiCloakingTracer,
    BrowserTracer,
    HopRecord,
    HttpOnlyTracer,
    RedirectTracer,
    RedirectType,
    TraceContext,
    TraceMode,
    TraceResult,
    TracerError,
};

pub use crate::modules::{
    DeviceType,
    EventDispatcher,
    EventHandler,
    Fingerprint,
    FingerprintSynthesizer,
    GeoRotator,
    GeoSelection,
    GeoStrategy,
    IdentityError,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    ProxyCredentials,
    ProxyIdentity,
    ProxyIdentityBuilder,
    TraceEvent,
    UserAgentMode,
    UserAgentRotator,
    UserAgentStats,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
