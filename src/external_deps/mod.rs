//! Integrations that rely on third-party services.
//!
//! Currently the reverse-geolocation lookup used to report where a trace's
//! exit IP sits.

pub mod geolocation;

pub use geolocation::{GeoLocation, GeoLocationConfig, GeoLocationError, GeoLocator, GeoLookup, IpApiLocator};
