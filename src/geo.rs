//! Multi-source geolocation reduced to one country code by voting.
//!
//! Sources disagree often enough that a single answer is never trusted on
//! its own: two agreeing sources, or the edge network's header plus any
//! agreeing source, make a confident verdict. Anything less is served with
//! `confident=false` and re-checked quickly.

use crate::cache::CacheStore;
use crate::config::GeoConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Placeholder country code for "could not determine".
pub const UNKNOWN_COUNTRY: &str = "??";

/// Source name recorded for the edge-network header vote.
pub const EDGE_SOURCE: &str = "cf";

/// Cache lifetime for a confident verdict.
pub const CONFIDENT_TTL: Duration = Duration::from_secs(2 * 3600);

/// Cache lifetime for an unconfident verdict, kept short so uncertainty is
/// re-checked quickly.
pub const UNCONFIDENT_TTL: Duration = Duration::from_secs(600);

/// A third-party geolocation source.
#[async_trait]
pub trait GeoSource: Send + Sync {
    /// `Ok(None)` when the source has no verdict for this IP.
    async fn country(&self, ip: &IpAddr) -> Result<Option<String>, ProviderError>;

    fn name(&self) -> &str;
}

/// Consensus verdict for one IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoConsensus {
    pub country_code: String,
    pub confident: bool,
    /// Every source that answered, edge header included, in query order.
    pub sources: Vec<(String, String)>,
}

impl GeoConsensus {
    fn unknown(sources: Vec<(String, String)>) -> Self {
        Self {
            country_code: UNKNOWN_COUNTRY.to_string(),
            confident: false,
            sources,
        }
    }
}

/// ip-api.com style source: JSON with a `status` flag and `countryCode`.
pub struct IpApiSource {
    url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "countryCode")]
    country_code: Option<String>,
}

impl IpApiSource {
    pub fn new(url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl GeoSource for IpApiSource {
    async fn country(&self, ip: &IpAddr) -> Result<Option<String>, ProviderError> {
        let url = format!("{}/{}?fields=status,countryCode", self.url, ip);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }

        let body: IpApiResponse = match response.json().await {
            Ok(body) => body,
            Err(_) => return Ok(None),
        };

        if body.status.as_deref() != Some("success") {
            return Ok(None);
        }
        Ok(body.country_code)
    }

    fn name(&self) -> &str {
        "ip-api"
    }
}

/// ipwho.is style source: JSON with a `success` flag and `country_code`.
pub struct IpWhoisSource {
    url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct IpWhoisResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    country_code: Option<String>,
}

impl IpWhoisSource {
    pub fn new(url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl GeoSource for IpWhoisSource {
    async fn country(&self, ip: &IpAddr) -> Result<Option<String>, ProviderError> {
        let url = format!("{}/{}", self.url, ip);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }

        let body: IpWhoisResponse = match response.json().await {
            Ok(body) => body,
            Err(_) => return Ok(None),
        };

        if body.success == Some(false) {
            return Ok(None);
        }
        Ok(body.country_code)
    }

    fn name(&self) -> &str {
        "ipwhois"
    }
}

/// Consensus resolver over the configured sources.
pub struct GeoResolver {
    sources: Vec<Box<dyn GeoSource>>,
    cache: Arc<CacheStore>,
}

impl GeoResolver {
    pub fn new(config: &GeoConfig, cache: Arc<CacheStore>) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        let mut sources: Vec<Box<dyn GeoSource>> = Vec::new();

        if config.ipapi_enabled {
            sources.push(Box::new(IpApiSource::new(&config.ipapi_url, timeout)));
        }
        if config.ipwhois_enabled {
            sources.push(Box::new(IpWhoisSource::new(&config.ipwhois_url, timeout)));
        }

        Self { sources, cache }
    }

    /// Build a resolver over explicit sources.
    pub fn with_sources(sources: Vec<Box<dyn GeoSource>>, cache: Arc<CacheStore>) -> Self {
        Self { sources, cache }
    }

    /// Resolve the consensus country for an IP.
    ///
    /// `edge_hint` is the request-scoped country header from the edge
    /// network, when one was present.
    pub async fn consensus(&self, ip: &IpAddr, edge_hint: Option<&str>) -> GeoConsensus {
        let key = CacheStore::key("geo", ip);
        if let Some(cached) = self.cache.get::<GeoConsensus>(&key) {
            debug!(ip = %ip, code = %cached.country_code, "Geo cache hit");
            return cached;
        }

        let edge = edge_hint.and_then(normalize_code);
        let mut provider_votes: Vec<(String, String)> = Vec::new();

        for source in &self.sources {
            match source.country(ip).await {
                Ok(Some(code)) => {
                    if let Some(code) = normalize_code(&code) {
                        provider_votes.push((source.name().to_string(), code));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(ip = %ip, source = source.name(), error = %e, "Geo source failed");
                }
            }
        }

        let consensus = tally(edge.as_deref(), &provider_votes);
        let ttl = if consensus.confident {
            CONFIDENT_TTL
        } else {
            UNCONFIDENT_TTL
        };
        self.cache.set(&key, &consensus, ttl);

        debug!(
            ip = %ip,
            code = %consensus.country_code,
            confident = consensus.confident,
            "Geo consensus"
        );
        consensus
    }

    /// Consensus code, but only when confident; `"??"` otherwise. Callers
    /// must treat `"??"` as unknown, never as a real country.
    pub async fn get_country(&self, ip: &IpAddr, edge_hint: Option<&str>) -> String {
        let consensus = self.consensus(ip, edge_hint).await;
        if consensus.confident {
            consensus.country_code
        } else {
            UNKNOWN_COUNTRY.to_string()
        }
    }
}

/// Keep only plausible two-letter codes, uppercased.
fn normalize_code(code: &str) -> Option<String> {
    let code = code.trim();
    if code.len() == 2 && code.bytes().all(|b| b.is_ascii_alphabetic()) {
        Some(code.to_ascii_uppercase())
    } else {
        None
    }
}

/// Reduce the votes to a single verdict.
///
/// 1. Any code two third-party sources agree on wins confidently.
/// 2. The edge header agreeing with any single source wins confidently.
/// 3. Otherwise the most trusted answer (edge first, then query order) is
///    served unconfidently.
pub fn tally(edge: Option<&str>, provider_votes: &[(String, String)]) -> GeoConsensus {
    let mut sources: Vec<(String, String)> = Vec::new();
    if let Some(code) = edge {
        sources.push((EDGE_SOURCE.to_string(), code.to_string()));
    }
    sources.extend(provider_votes.iter().cloned());

    // First code reaching two provider votes wins, in vote order.
    let mut counted: Vec<(&str, usize)> = Vec::new();
    for (_, code) in provider_votes {
        match counted.iter_mut().find(|(c, _)| c == code) {
            Some((_, n)) => *n += 1,
            None => counted.push((code, 1)),
        }
    }
    for (code, count) in &counted {
        if *count >= 2 {
            return GeoConsensus {
                country_code: (*code).to_string(),
                confident: true,
                sources,
            };
        }
    }

    if let Some(edge_code) = edge {
        if provider_votes.iter().any(|(_, code)| code == edge_code) {
            return GeoConsensus {
                country_code: edge_code.to_string(),
                confident: true,
                sources,
            };
        }
    }

    if let Some(code) = edge {
        return GeoConsensus {
            country_code: code.to_string(),
            confident: false,
            sources,
        };
    }
    if let Some((_, code)) = provider_votes.first() {
        return GeoConsensus {
            country_code: code.clone(),
            confident: false,
            sources,
        };
    }

    GeoConsensus::unknown(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        name: &'static str,
        answer: Option<String>,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    impl FakeSource {
        fn answering(name: &'static str, code: &str) -> Box<dyn GeoSource> {
            Box::new(Self {
                name,
                answer: Some(code.to_string()),
                fail: false,
                calls: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn failing(name: &'static str) -> Box<dyn GeoSource> {
            Box::new(Self {
                name,
                answer: None,
                fail: true,
                calls: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn counting(
            name: &'static str,
            code: &str,
        ) -> (Box<dyn GeoSource>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Box::new(Self {
                    name,
                    answer: Some(code.to_string()),
                    fail: false,
                    calls: calls.clone(),
                }),
                calls,
            )
        }
    }

    #[async_trait]
    impl GeoSource for FakeSource {
        async fn country(&self, _ip: &IpAddr) -> Result<Option<String>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Timeout);
            }
            Ok(self.answer.clone())
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    fn votes(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(n, c)| (n.to_string(), c.to_string()))
            .collect()
    }

    fn ip() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    #[test]
    fn test_tally_two_provider_votes_win() {
        let result = tally(Some("UA"), &votes(&[("p1", "UA"), ("p2", "PL")]));
        assert_eq!(result.country_code, "UA");
        assert!(result.confident);
        assert_eq!(result.sources.len(), 3);
    }

    #[test]
    fn test_tally_two_votes_without_edge() {
        let result = tally(None, &votes(&[("p1", "DE"), ("p2", "DE"), ("p3", "PL")]));
        assert_eq!(result.country_code, "DE");
        assert!(result.confident);
    }

    #[test]
    fn test_tally_edge_plus_one_source() {
        let result = tally(Some("UA"), &votes(&[("p1", "UA")]));
        assert_eq!(result.country_code, "UA");
        assert!(result.confident);
    }

    #[test]
    fn test_tally_single_source_unconfident() {
        let result = tally(None, &votes(&[("p1", "PL")]));
        assert_eq!(result.country_code, "PL");
        assert!(!result.confident);
    }

    #[test]
    fn test_tally_edge_only_unconfident() {
        let result = tally(Some("UA"), &[]);
        assert_eq!(result.country_code, "UA");
        assert!(!result.confident);
    }

    #[test]
    fn test_tally_disagreement_prefers_edge() {
        let result = tally(Some("UA"), &votes(&[("p1", "PL")]));
        assert_eq!(result.country_code, "UA");
        assert!(!result.confident);
    }

    #[test]
    fn test_tally_no_sources() {
        let result = tally(None, &[]);
        assert_eq!(result.country_code, UNKNOWN_COUNTRY);
        assert!(!result.confident);
        assert!(result.sources.is_empty());
    }

    #[test]
    fn test_tally_is_deterministic() {
        let input = votes(&[("p1", "UA"), ("p2", "PL"), ("p3", "UA")]);
        let first = tally(None, &input);
        for _ in 0..10 {
            assert_eq!(tally(None, &input), first);
        }
        assert_eq!(first.country_code, "UA");
        assert!(first.confident);
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code(" ua "), Some("UA".to_string()));
        assert_eq!(normalize_code("XX"), Some("XX".to_string()));
        assert_eq!(normalize_code("USA"), None);
        assert_eq!(normalize_code("1A"), None);
        assert_eq!(normalize_code(""), None);
    }

    #[tokio::test]
    async fn test_consensus_from_sources() {
        let resolver = GeoResolver::with_sources(
            vec![
                FakeSource::answering("p1", "ua"),
                FakeSource::answering("p2", "UA"),
            ],
            Arc::new(CacheStore::ephemeral()),
        );

        let result = resolver.consensus(&ip(), None).await;
        assert_eq!(result.country_code, "UA");
        assert!(result.confident);
    }

    #[tokio::test]
    async fn test_failed_source_skipped() {
        let resolver = GeoResolver::with_sources(
            vec![
                FakeSource::failing("p1"),
                FakeSource::answering("p2", "PL"),
            ],
            Arc::new(CacheStore::ephemeral()),
        );

        let result = resolver.consensus(&ip(), None).await;
        assert_eq!(result.country_code, "PL");
        assert!(!result.confident);
    }

    #[tokio::test]
    async fn test_consensus_cached() {
        let (source, calls) = FakeSource::counting("p1", "PL");
        let resolver =
            GeoResolver::with_sources(vec![source], Arc::new(CacheStore::ephemeral()));

        resolver.consensus(&ip(), None).await;
        resolver.consensus(&ip(), None).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_country_masks_unconfident() {
        let resolver = GeoResolver::with_sources(
            vec![FakeSource::answering("p1", "PL")],
            Arc::new(CacheStore::ephemeral()),
        );

        assert_eq!(resolver.get_country(&ip(), None).await, UNKNOWN_COUNTRY);
    }

    #[tokio::test]
    async fn test_get_country_confident() {
        let resolver = GeoResolver::with_sources(
            vec![
                FakeSource::answering("p1", "UA"),
                FakeSource::answering("p2", "UA"),
            ],
            Arc::new(CacheStore::ephemeral()),
        );

        assert_eq!(resolver.get_country(&ip(), None).await, "UA");
    }

    #[tokio::test]
    async fn test_no_sources_unknown() {
        let resolver = GeoResolver::with_sources(vec![], Arc::new(CacheStore::ephemeral()));
        let result = resolver.consensus(&ip(), None).await;
        assert_eq!(result.country_code, UNKNOWN_COUNTRY);
        assert!(!result.confident);
    }

    #[tokio::test]
    async fn test_junk_code_ignored() {
        let resolver = GeoResolver::with_sources(
            vec![
                FakeSource::answering("p1", "garbage"),
                FakeSource::answering("p2", "PL"),
            ],
            Arc::new(CacheStore::ephemeral()),
        );

        let result = resolver.consensus(&ip(), None).await;
        assert_eq!(result.country_code, "PL");
    }
}
