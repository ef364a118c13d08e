//! Cross-cutting services module
//!
//! Rotators that give every trace a fresh identity (proxy session, user
//! agent, fingerprint, geo target), hop timing, and the event and metrics
//! side channels.

pub mod adaptive_timing;
pub mod events;
pub mod geo;
pub mod identity;
pub mod metrics;
pub mod spoofing;
pub mod user_agents;

// Re-export commonly used types
pub use adaptive_timing::{HopTimingConfig, LatencyEstimator};
pub use events::{
    EventDispatcher, EventHandler, GeoLookupFailedEvent, HopRecordedEvent, LoggingHandler, MetricsHandler,
    TraceEvent, TraceFinishedEvent, TraceStartedEvent,
};
pub use geo::{GeoRotator, GeoSelection, GeoStrategy};
pub use identity::{IdentityError, ProxyCredentials, ProxyIdentity, ProxyIdentityBuilder};
pub use metrics::{DomainStats, GlobalStats, MetricsCollector, MetricsSnapshot, ModeStats};
pub use spoofing::{DeviceType, Fingerprint, FingerprintSynthesizer, Viewport};
pub use user_agents::{UserAgentMode, UserAgentRotator, UserAgentRotatorConfig, UserAgentStats};
