//! Proxy candidates and everything that describes them
//!
//! - [`models`]: candidate, scheme and tier types
//! - [`parser`]: URI / list / subscription parsing and re-serialization
//! - [`geo`]: country resolution
//! - [`xray`]: Xray outbound and config builders

pub mod geo;
pub mod models;
pub mod parser;
pub mod xray;

pub use geo::{CountryLookup, CountryResolver, GeoLocator, IpApiResolver, NullResolver};
pub use models::{FingerprintMode, ProxyCandidate, Scheme, TestResult, Tier};
pub use parser::{ParseOutcome, ProxyParser};
