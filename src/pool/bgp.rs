//! BGP route-server lookup over the port-43 line protocol.
//!
//! The route server answers a verbose single-line record of the form
//! `AS | IP | Prefix | CC | Registry | Allocated | AS Name`; the first
//! CIDR in the response is the announced prefix.

use super::PoolProvider;
use crate::config::PoolConfig;
use crate::error::ProviderError;
use crate::range::NetworkPool;
use async_trait::async_trait;
use ipnet::IpNet;
use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

fn cidr_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b((?:\d{1,3}\.){3}\d{1,3}/\d{1,2}|[0-9a-f]{1,4}(?::[0-9a-f:]+)+/\d{1,3})")
            .expect("static pattern")
    })
}

/// BGP prefix provider.
pub struct BgpProvider {
    host: String,
    timeout: Duration,
}

impl BgpProvider {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            host: config.bgp_host.clone(),
            timeout: Duration::from_millis(config.bgp_timeout_ms),
        }
    }

    async fn query(&self, ip: &IpAddr) -> Result<String, ProviderError> {
        let io = async {
            let mut stream = TcpStream::connect(&self.host).await?;
            stream.write_all(format!(" -v {}\r\n", ip).as_bytes()).await?;

            let mut response = String::new();
            stream.read_to_string(&mut response).await?;
            Ok::<_, std::io::Error>(response)
        };

        timeout(self.timeout, io)
            .await
            .map_err(|_| ProviderError::Timeout)?
            .map_err(ProviderError::from)
    }

    /// First CIDR found anywhere in the response.
    pub fn parse_prefix(response: &str) -> Option<NetworkPool> {
        cidr_pattern()
            .find(response)
            .and_then(|m| m.as_str().parse::<IpNet>().ok())
            .map(NetworkPool::Cidr)
    }
}

#[async_trait]
impl PoolProvider for BgpProvider {
    async fn resolve(&self, ip: &IpAddr) -> Result<Option<NetworkPool>, ProviderError> {
        let response = self.query(ip).await?;
        let pool = Self::parse_prefix(&response);
        debug!(ip = %ip, found = pool.is_some(), "BGP route-server answer");
        Ok(pool)
    }

    fn name(&self) -> &str {
        "bgp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verbose_response() {
        let response = "\
AS      | IP               | BGP Prefix          | CC | Registry | Allocated  | AS Name
15169   | 8.8.8.8          | 8.8.8.0/24          | US | arin     | 1992-12-01 | GOOGLE, US
";
        assert_eq!(
            BgpProvider::parse_prefix(response),
            Some("8.8.8.0/24".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_takes_first_cidr() {
        let response = "1.2.3.0/24 something 5.6.0.0/16";
        assert_eq!(
            BgpProvider::parse_prefix(response),
            Some("1.2.3.0/24".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_v6_prefix() {
        let response = "15169 | 2001:4860:4860::8888 | 2001:4860::/32 | US | arin";
        assert_eq!(
            BgpProvider::parse_prefix(response),
            Some("2001:4860::/32".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_no_prefix() {
        assert_eq!(BgpProvider::parse_prefix("Error: no match found"), None);
        assert_eq!(BgpProvider::parse_prefix(""), None);
    }

    #[test]
    fn test_dates_do_not_match_as_cidrs() {
        let response = "NA | 203.0.113.9 | NA | NA | ripencc | 2019-03-12 | NOT-ANNOUNCED";
        assert_eq!(BgpProvider::parse_prefix(response), None);
    }

    #[tokio::test]
    async fn test_unreachable_host_errors() {
        let config = PoolConfig {
            bgp_host: "127.0.0.1:1".to_string(),
            bgp_timeout_ms: 500,
            ..PoolConfig::default()
        };
        let provider = BgpProvider::new(&config);

        let err = provider.resolve(&"8.8.8.8".parse().unwrap()).await;
        assert!(err.is_err());
    }
}
