//! IP intelligence and access gating.
//!
//! Classifies security-event log lines, enriches IPs with network
//! ownership, geographic origin, and threat reputation, and folds the
//! enrichment into a single allow/block verdict per request.
//!
//! # Features
//!
//! - **Network-Ownership Resolution** - cascading BGP / RDAP / registry
//!   search / WHOIS lookup of the pool an IP belongs to
//! - **Geo Consensus** - multiple geolocation sources voted down to one
//!   country code with a confidence flag
//! - **Threat Aggregation** - confidence score, detection counts, DNSBL
//!   and community intel combined into one capped score
//! - **Access Decisions** - allowlist, score threshold, and country policy
//!   evaluated in a fixed order, fail-open by default
//! - **Log Rotation** - size/age-based rotation with bounded archive
//!   retention, idempotent and crash-safe
//! - **Caching** - every enrichment cached with per-kind TTLs
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   enabled: true
//!   mode: blacklist
//!   countries: ["RU"]
//!   fail_open: true
//!   intel_threshold: 80
//!
//! rotation:
//!   max_size_bytes: 10485760
//!   max_archive_count: 5
//!   max_retention_days: 30
//!
//! abuseipdb:
//!   enabled: true
//!   api_key: "${ABUSEIPDB_API_KEY}"
//! ```

pub mod access;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod geo;
pub mod intel;
pub mod pool;
pub mod range;
pub mod rotation;

pub use access::{AccessEngine, AccessVerdict, Reason};
pub use cache::CacheStore;
pub use config::Config;
pub use geo::{GeoConsensus, GeoResolver};
pub use intel::{ThreatAggregator, ThreatIntel};
pub use pool::PoolResolver;
pub use range::NetworkPool;
