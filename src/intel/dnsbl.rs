//! DNS blocklist provider.
//!
//! Listing is checked with a reversed-octet `A` lookup against the
//! configured zone; an answer of any kind is a hit, NXDOMAIN is clean.
//! IPv4 only.

use super::{IntelProvider, IntelSignal};
use crate::config::DnsblConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use tracing::debug;

/// DNSBL provider.
pub struct DnsblProvider {
    config: DnsblConfig,
    resolver: TokioAsyncResolver,
}

impl DnsblProvider {
    pub fn new(config: DnsblConfig) -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

        Self { config, resolver }
    }

    /// Reversed-octet query name for an IPv4 address, `None` for IPv6.
    pub fn query_name(ip: &IpAddr, zone: &str) -> Option<String> {
        match ip {
            IpAddr::V4(v4) => {
                let [a, b, c, d] = v4.octets();
                Some(format!("{}.{}.{}.{}.{}.", d, c, b, a, zone))
            }
            IpAddr::V6(_) => None,
        }
    }
}

#[async_trait]
impl IntelProvider for DnsblProvider {
    async fn check(&self, ip: &IpAddr) -> Result<IntelSignal, ProviderError> {
        let Some(query) = Self::query_name(ip, &self.config.zone) else {
            return Ok(IntelSignal::Clean);
        };

        debug!(query = %query, "DNSBL lookup");

        match self.resolver.lookup_ip(query.as_str()).await {
            Ok(response) => {
                if response.iter().next().is_some() {
                    debug!(ip = %ip, zone = %self.config.zone, "DNSBL hit");
                    Ok(IntelSignal::DnsblListed)
                } else {
                    Ok(IntelSignal::Clean)
                }
            }
            Err(e) => match e.kind() {
                // Not listed.
                ResolveErrorKind::NoRecordsFound { .. } => Ok(IntelSignal::Clean),
                _ => Err(ProviderError::Other(format!("DNSBL lookup failed: {}", e))),
            },
        }
    }

    fn name(&self) -> &str {
        "dnsbl"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.zone.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_name_reverses_octets() {
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        assert_eq!(
            DnsblProvider::query_name(&ip, "zen.spamhaus.org"),
            Some("9.113.0.203.zen.spamhaus.org.".to_string())
        );
    }

    #[test]
    fn test_query_name_skips_ipv6() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(DnsblProvider::query_name(&ip, "zen.spamhaus.org"), None);
    }

    #[tokio::test]
    async fn test_ipv6_check_is_clean() {
        let provider = DnsblProvider::new(DnsblConfig {
            enabled: true,
            zone: "zen.spamhaus.org".to_string(),
        });

        let signal = provider.check(&"2001:db8::1".parse().unwrap()).await.unwrap();
        assert_eq!(signal, IntelSignal::Clean);
    }

    #[tokio::test]
    async fn test_enabled_requires_zone() {
        let provider = DnsblProvider::new(DnsblConfig {
            enabled: true,
            zone: String::new(),
        });
        assert!(!provider.is_enabled());
    }
}
