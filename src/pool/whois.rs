//! Raw port-43 WHOIS fallback.
//!
//! Free-text responses are scanned for the registry's
//! `inetnum: start - end` attribute.

use super::PoolProvider;
use crate::config::PoolConfig;
use crate::error::ProviderError;
use crate::range::NetworkPool;
use async_trait::async_trait;
use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

fn inetnum_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^inetnum:\s*([0-9.]+)\s*-\s*([0-9.]+)").expect("static pattern")
    })
}

/// WHOIS socket provider.
pub struct WhoisProvider {
    host: String,
    timeout: Duration,
}

impl WhoisProvider {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            host: config.whois_host.clone(),
            timeout: Duration::from_millis(config.whois_timeout_ms),
        }
    }

    async fn query(&self, ip: &IpAddr) -> Result<String, ProviderError> {
        let io = async {
            let mut stream = TcpStream::connect(&self.host).await?;
            stream.write_all(format!("{}\r\n", ip).as_bytes()).await?;

            let mut response = String::new();
            stream.read_to_string(&mut response).await?;
            Ok::<_, std::io::Error>(response)
        };

        timeout(self.timeout, io)
            .await
            .map_err(|_| ProviderError::Timeout)?
            .map_err(ProviderError::from)
    }

    /// First `inetnum` range in the response.
    pub fn parse_inetnum(response: &str) -> Option<NetworkPool> {
        let caps = inetnum_pattern().captures(response)?;
        let start: IpAddr = caps[1].parse().ok()?;
        let end: IpAddr = caps[2].parse().ok()?;
        format!("{}-{}", start, end).parse().ok()
    }
}

#[async_trait]
impl PoolProvider for WhoisProvider {
    async fn resolve(&self, ip: &IpAddr) -> Result<Option<NetworkPool>, ProviderError> {
        let response = self.query(ip).await?;
        let pool = Self::parse_inetnum(&response);
        debug!(ip = %ip, found = pool.is_some(), "WHOIS answer");
        Ok(pool)
    }

    fn name(&self) -> &str {
        "whois"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inetnum() {
        let response = "\
% Information related to '203.0.113.0 - 203.0.113.255'

inetnum:        203.0.113.0 - 203.0.113.255
netname:        DOC-NET
country:        NL
";
        assert_eq!(
            WhoisProvider::parse_inetnum(response),
            Some("203.0.113.0-203.0.113.255".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_case_insensitive_and_tight_spacing() {
        let response = "INETNUM: 10.0.0.0-10.0.0.255\n";
        assert_eq!(
            WhoisProvider::parse_inetnum(response),
            Some("10.0.0.0-10.0.0.255".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_ignores_non_attribute_mentions() {
        // The attribute must start its line.
        let response = "remarks: see inetnum: 1.2.3.4 - 1.2.3.5 elsewhere\n";
        assert_eq!(WhoisProvider::parse_inetnum(response), None);
    }

    #[test]
    fn test_parse_no_inetnum() {
        assert_eq!(WhoisProvider::parse_inetnum("% no entries found\n"), None);
    }

    #[test]
    fn test_parse_inverted_range_rejected() {
        let response = "inetnum: 10.0.0.255 - 10.0.0.0\n";
        assert_eq!(WhoisProvider::parse_inetnum(response), None);
    }

    #[tokio::test]
    async fn test_unreachable_host_errors() {
        let config = PoolConfig {
            whois_host: "127.0.0.1:1".to_string(),
            whois_timeout_ms: 500,
            ..PoolConfig::default()
        };
        let provider = WhoisProvider::new(&config);

        let err = provider.resolve(&"203.0.113.9".parse().unwrap()).await;
        assert!(err.is_err());
    }
}
