//! Threat-reputation aggregation across independent providers.
//!
//! Each provider contributes one typed signal; the aggregate folds them
//! into a single capped score and verdict. Providers are optional and
//! individually fault-tolerant: a failing or unconfigured provider
//! contributes nothing and is absent from the verdict's source list.

pub mod abuseipdb;
pub mod dnsbl;
pub mod greynoise;
pub mod virustotal;

pub use abuseipdb::AbuseIpDbProvider;
pub use dnsbl::DnsblProvider;
pub use greynoise::GreyNoiseProvider;
pub use virustotal::VirusTotalProvider;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Aggregated verdicts are kept for twelve hours.
pub const INTEL_TTL: Duration = Duration::from_secs(12 * 3600);

/// Scores never exceed this cap.
pub const SCORE_CAP: i64 = 150;

/// Score at which an IP is considered malicious outright.
pub const MALICIOUS_SCORE: i64 = 80;

/// Weight of one reported detection.
pub const DETECTION_WEIGHT: i64 = 10;

/// Flat weight of a DNS blocklist listing.
pub const DNSBL_WEIGHT: i64 = 30;

/// Flat weight of a community-intel listing.
pub const COMMUNITY_WEIGHT: i64 = 40;

/// One provider's contribution to the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntelSignal {
    /// Nothing to report; the provider did not fire.
    Clean,
    /// Abuse-confidence score, 0-100, added to the aggregate directly.
    Confidence(u8),
    /// Engines or reports flagging the IP, weighted per detection.
    Detections(u32),
    /// Listed on a DNS blocklist.
    DnsblListed,
    /// Known to community intelligence.
    CommunityListed,
}

impl IntelSignal {
    /// Whether this signal counts as the provider "firing".
    pub fn fired(&self) -> bool {
        match self {
            IntelSignal::Clean => false,
            IntelSignal::Confidence(score) => *score > 0,
            IntelSignal::Detections(count) => *count > 0,
            IntelSignal::DnsblListed | IntelSignal::CommunityListed => true,
        }
    }
}

/// Trait for threat-reputation providers.
#[async_trait]
pub trait IntelProvider: Send + Sync {
    async fn check(&self, ip: &IpAddr) -> Result<IntelSignal, ProviderError>;

    /// Provider name for logging and the verdict's source list.
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;
}

/// Aggregated threat verdict for one IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatIntel {
    pub ip: IpAddr,
    /// Abuse-confidence score, 0-100.
    pub abuse_score: u8,
    pub detection_count: u32,
    pub dnsbl_hit: bool,
    pub community_hit: bool,
    /// Weighted sum, capped at [`SCORE_CAP`].
    pub score: i64,
    pub is_malicious: bool,
    /// Providers that fired, in evaluation order.
    pub sources: Vec<String>,
}

/// The convenience slice of a verdict most callers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntelScore {
    pub score: i64,
    pub is_malicious: bool,
}

/// Fold fired signals into a verdict.
///
/// `score = confidence + detections*10 + 30*dnsbl + 40*community`, capped.
/// Malicious when the score reaches the cutoff, more than one source
/// fired, or a hard-negative source (blocklist or community intel) fired
/// on its own.
pub fn aggregate(ip: IpAddr, signals: &[(String, IntelSignal)]) -> ThreatIntel {
    let mut intel = ThreatIntel {
        ip,
        abuse_score: 0,
        detection_count: 0,
        dnsbl_hit: false,
        community_hit: false,
        score: 0,
        is_malicious: false,
        sources: Vec::new(),
    };

    for (name, signal) in signals {
        match signal {
            IntelSignal::Clean => {}
            IntelSignal::Confidence(score) => {
                intel.abuse_score = intel.abuse_score.max(*score);
            }
            IntelSignal::Detections(count) => {
                intel.detection_count += count;
            }
            IntelSignal::DnsblListed => intel.dnsbl_hit = true,
            IntelSignal::CommunityListed => intel.community_hit = true,
        }
        if signal.fired() {
            intel.sources.push(name.clone());
        }
    }

    let raw = intel.abuse_score as i64
        + intel.detection_count as i64 * DETECTION_WEIGHT
        + if intel.dnsbl_hit { DNSBL_WEIGHT } else { 0 }
        + if intel.community_hit { COMMUNITY_WEIGHT } else { 0 };
    intel.score = raw.min(SCORE_CAP);

    intel.is_malicious = intel.score >= MALICIOUS_SCORE
        || intel.sources.len() > 1
        || intel.dnsbl_hit
        || intel.community_hit;

    intel
}

/// Aggregator over the configured providers.
pub struct ThreatAggregator {
    providers: Vec<Box<dyn IntelProvider>>,
    cache: Arc<CacheStore>,
}

impl ThreatAggregator {
    pub fn new(config: &Config, cache: Arc<CacheStore>) -> Self {
        let mut providers: Vec<Box<dyn IntelProvider>> = Vec::new();

        if let Some(ref abuseipdb) = config.abuseipdb {
            providers.push(Box::new(AbuseIpDbProvider::new(abuseipdb.clone())));
        }
        if let Some(ref virustotal) = config.virustotal {
            providers.push(Box::new(VirusTotalProvider::new(virustotal.clone())));
        }
        if let Some(ref dnsbl) = config.dnsbl {
            providers.push(Box::new(DnsblProvider::new(dnsbl.clone())));
        }
        if let Some(ref greynoise) = config.greynoise {
            providers.push(Box::new(GreyNoiseProvider::new(greynoise.clone())));
        }

        Self { providers, cache }
    }

    /// Build an aggregator over explicit providers.
    pub fn with_providers(providers: Vec<Box<dyn IntelProvider>>, cache: Arc<CacheStore>) -> Self {
        Self { providers, cache }
    }

    /// Full aggregated verdict, cached twelve hours per IP.
    pub async fn check(&self, ip: &IpAddr) -> ThreatIntel {
        let key = CacheStore::key("intel", ip);
        if let Some(cached) = self.cache.get::<ThreatIntel>(&key) {
            debug!(ip = %ip, score = cached.score, "Intel cache hit");
            return cached;
        }

        let mut signals: Vec<(String, IntelSignal)> = Vec::new();
        for provider in &self.providers {
            if !provider.is_enabled() {
                continue;
            }
            match provider.check(ip).await {
                Ok(signal) => signals.push((provider.name().to_string(), signal)),
                Err(e) => {
                    warn!(ip = %ip, provider = provider.name(), error = %e, "Intel lookup failed");
                }
            }
        }

        let intel = aggregate(*ip, &signals);
        self.cache.set(&key, &intel, INTEL_TTL);

        debug!(
            ip = %ip,
            score = intel.score,
            malicious = intel.is_malicious,
            sources = intel.sources.len(),
            "Intel aggregated"
        );
        intel
    }

    /// Score-only convenience with its own cache layer.
    pub async fn score(&self, ip: &IpAddr) -> IntelScore {
        let key = CacheStore::key("intel-score", ip);
        if let Some(cached) = self.cache.get::<IntelScore>(&key) {
            return cached;
        }

        let intel = self.check(ip).await;
        let score = IntelScore {
            score: intel.score,
            is_malicious: intel.is_malicious,
        };
        self.cache.set(&key, &score, INTEL_TTL);
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ip() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    fn signals(entries: &[(&str, IntelSignal)]) -> Vec<(String, IntelSignal)> {
        entries
            .iter()
            .map(|(n, s)| (n.to_string(), *s))
            .collect()
    }

    #[test]
    fn test_score_formula() {
        let intel = aggregate(
            ip(),
            &signals(&[
                ("abuseipdb", IntelSignal::Confidence(50)),
                ("virustotal", IntelSignal::Detections(2)),
                ("dnsbl", IntelSignal::DnsblListed),
            ]),
        );

        assert_eq!(intel.score, 50 + 20 + 30);
        assert!(intel.is_malicious);
        assert_eq!(intel.sources, vec!["abuseipdb", "virustotal", "dnsbl"]);
    }

    #[test]
    fn test_score_capped_at_150() {
        let intel = aggregate(
            ip(),
            &signals(&[
                ("abuseipdb", IntelSignal::Confidence(100)),
                ("virustotal", IntelSignal::Detections(12)),
                ("dnsbl", IntelSignal::DnsblListed),
                ("greynoise", IntelSignal::CommunityListed),
            ]),
        );

        assert_eq!(intel.score, SCORE_CAP);
        assert!(intel.is_malicious);
    }

    #[test]
    fn test_clean_verdict() {
        let intel = aggregate(
            ip(),
            &signals(&[
                ("abuseipdb", IntelSignal::Confidence(0)),
                ("virustotal", IntelSignal::Clean),
            ]),
        );

        assert_eq!(intel.score, 0);
        assert!(!intel.is_malicious);
        assert!(intel.sources.is_empty());
    }

    #[test]
    fn test_two_weak_sources_malicious() {
        // Neither source alone crosses the score cutoff, but two firing
        // sources do.
        let intel = aggregate(
            ip(),
            &signals(&[
                ("abuseipdb", IntelSignal::Confidence(10)),
                ("virustotal", IntelSignal::Detections(1)),
            ]),
        );

        assert_eq!(intel.score, 20);
        assert!(intel.is_malicious);
    }

    #[test]
    fn test_dnsbl_alone_is_hard_negative() {
        let intel = aggregate(ip(), &signals(&[("dnsbl", IntelSignal::DnsblListed)]));
        assert_eq!(intel.score, 30);
        assert!(intel.is_malicious);
    }

    #[test]
    fn test_community_alone_is_hard_negative() {
        let intel = aggregate(
            ip(),
            &signals(&[("greynoise", IntelSignal::CommunityListed)]),
        );
        assert_eq!(intel.score, 40);
        assert!(intel.is_malicious);
    }

    #[test]
    fn test_moderate_single_confidence_not_malicious() {
        let intel = aggregate(
            ip(),
            &signals(&[("abuseipdb", IntelSignal::Confidence(60))]),
        );
        assert_eq!(intel.score, 60);
        assert!(!intel.is_malicious);
    }

    #[test]
    fn test_high_confidence_alone_malicious() {
        let intel = aggregate(
            ip(),
            &signals(&[("abuseipdb", IntelSignal::Confidence(85))]),
        );
        assert!(intel.is_malicious);
    }

    struct FakeProvider {
        name: &'static str,
        signal: Result<IntelSignal, ()>,
        enabled: bool,
        calls: Arc<AtomicUsize>,
    }

    impl FakeProvider {
        fn new(
            name: &'static str,
            signal: Result<IntelSignal, ()>,
        ) -> (Box<dyn IntelProvider>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Box::new(Self {
                    name,
                    signal,
                    enabled: true,
                    calls: calls.clone(),
                }),
                calls,
            )
        }

        fn disabled(name: &'static str) -> (Box<dyn IntelProvider>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Box::new(Self {
                    name,
                    signal: Ok(IntelSignal::Clean),
                    enabled: false,
                    calls: calls.clone(),
                }),
                calls,
            )
        }
    }

    #[async_trait]
    impl IntelProvider for FakeProvider {
        async fn check(&self, _ip: &IpAddr) -> Result<IntelSignal, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.signal.map_err(|_| ProviderError::Timeout)
        }

        fn name(&self) -> &str {
            self.name
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }
    }

    #[tokio::test]
    async fn test_aggregator_folds_providers() {
        let (abuse, _) = FakeProvider::new("abuseipdb", Ok(IntelSignal::Confidence(50)));
        let (vt, _) = FakeProvider::new("virustotal", Ok(IntelSignal::Detections(2)));
        let aggregator =
            ThreatAggregator::with_providers(vec![abuse, vt], Arc::new(CacheStore::ephemeral()));

        let intel = aggregator.check(&ip()).await;
        assert_eq!(intel.score, 70);
        assert!(intel.is_malicious); // two fired sources
    }

    #[tokio::test]
    async fn test_failed_provider_contributes_nothing() {
        let (bad, _) = FakeProvider::new("abuseipdb", Err(()));
        let (good, _) = FakeProvider::new("dnsbl", Ok(IntelSignal::DnsblListed));
        let aggregator =
            ThreatAggregator::with_providers(vec![bad, good], Arc::new(CacheStore::ephemeral()));

        let intel = aggregator.check(&ip()).await;
        assert_eq!(intel.score, 30);
        assert_eq!(intel.sources, vec!["dnsbl"]);
    }

    #[tokio::test]
    async fn test_disabled_provider_skipped() {
        let (off, calls) = FakeProvider::disabled("abuseipdb");
        let aggregator =
            ThreatAggregator::with_providers(vec![off], Arc::new(CacheStore::ephemeral()));

        let intel = aggregator.check(&ip()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(intel.score, 0);
    }

    #[tokio::test]
    async fn test_check_cached() {
        let (provider, calls) = FakeProvider::new("abuseipdb", Ok(IntelSignal::Confidence(10)));
        let aggregator =
            ThreatAggregator::with_providers(vec![provider], Arc::new(CacheStore::ephemeral()));

        aggregator.check(&ip()).await;
        aggregator.check(&ip()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_score_convenience() {
        let (provider, _) = FakeProvider::new("abuseipdb", Ok(IntelSignal::Confidence(90)));
        let aggregator =
            ThreatAggregator::with_providers(vec![provider], Arc::new(CacheStore::ephemeral()));

        let score = aggregator.score(&ip()).await;
        assert_eq!(score.score, 90);
        assert!(score.is_malicious);
    }

    #[tokio::test]
    async fn test_no_providers_all_clean() {
        let aggregator =
            ThreatAggregator::with_providers(vec![], Arc::new(CacheStore::ephemeral()));
        let intel = aggregator.check(&ip()).await;
        assert_eq!(intel.score, 0);
        assert!(!intel.is_malicious);
        assert!(intel.sources.is_empty());
    }
}
