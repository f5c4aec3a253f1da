//! RDAP walk against the IANA-anchor registry.
//!
//! A single document may carry explicit `cidr0_cidrs` entries, bare
//! `startAddress`/`endAddress` fields (top-level or nested under
//! `network`), or only an "up" link to a wider registration. The walk
//! follows up-links a bounded number of hops with a visited-URL cycle
//! guard.

use super::PoolProvider;
use crate::config::PoolConfig;
use crate::error::ProviderError;
use crate::range::NetworkPool;
use async_trait::async_trait;
use ipnet::IpNet;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Maximum up-link hops before giving up.
const MAX_HOPS: usize = 5;

/// RDAP document, reduced to the fields the walk needs.
#[derive(Debug, Default, Deserialize)]
pub struct RdapDocument {
    #[serde(default)]
    pub cidr0_cidrs: Vec<RdapCidr>,

    #[serde(default, rename = "startAddress")]
    pub start_address: Option<String>,

    #[serde(default, rename = "endAddress")]
    pub end_address: Option<String>,

    #[serde(default)]
    pub network: Option<RdapNetwork>,

    #[serde(default)]
    pub links: Vec<RdapLink>,
}

#[derive(Debug, Deserialize)]
pub struct RdapNetwork {
    #[serde(default, rename = "startAddress")]
    pub start_address: Option<String>,

    #[serde(default, rename = "endAddress")]
    pub end_address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RdapCidr {
    #[serde(default)]
    pub v4prefix: Option<String>,

    #[serde(default)]
    pub v6prefix: Option<String>,

    #[serde(default)]
    pub length: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct RdapLink {
    #[serde(default)]
    pub rel: Option<String>,

    #[serde(default)]
    pub href: Option<String>,
}

/// RDAP walking provider.
pub struct RdapProvider {
    root: String,
    client: Client,
}

impl RdapProvider {
    pub fn new(config: &PoolConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.rdap_timeout_ms))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            root: config.rdap_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Pick the best pool a single document offers, if any.
    ///
    /// IPv4 ranges compete on span and the widest block wins (the most
    /// conservative registration). IPv6 keeps the first candidate as a
    /// literal start-end with no span math.
    pub fn select_pool(doc: &RdapDocument, ip: &IpAddr) -> Option<NetworkPool> {
        let cidrs = Self::family_cidrs(doc, ip);
        match ip {
            IpAddr::V4(_) => {
                if let Some(widest) = cidrs.iter().max_by_key(|p| p.span()) {
                    return Some(widest.clone());
                }
                Self::address_range(doc).map(|(start, end)| NetworkPool::Range(start, end))
            }
            IpAddr::V6(_) => {
                if let Some(first) = cidrs.into_iter().next() {
                    return Some(first);
                }
                Self::address_range(doc).map(|(start, end)| NetworkPool::Range(start, end))
            }
        }
    }

    fn family_cidrs(doc: &RdapDocument, ip: &IpAddr) -> Vec<NetworkPool> {
        doc.cidr0_cidrs
            .iter()
            .filter_map(|c| {
                let length = c.length?;
                let prefix = match ip {
                    IpAddr::V4(_) => c.v4prefix.as_deref()?,
                    IpAddr::V6(_) => c.v6prefix.as_deref()?,
                };
                format!("{}/{}", prefix, length).parse::<IpNet>().ok()
            })
            .map(NetworkPool::Cidr)
            .collect()
    }

    fn address_range(doc: &RdapDocument) -> Option<(IpAddr, IpAddr)> {
        let (start, end) = match (&doc.start_address, &doc.end_address) {
            (Some(s), Some(e)) => (s.clone(), e.clone()),
            _ => {
                let network = doc.network.as_ref()?;
                (
                    network.start_address.clone()?,
                    network.end_address.clone()?,
                )
            }
        };

        // Registries occasionally append a prefix length to the bare
        // addresses.
        let start: IpAddr = start.split('/').next()?.trim().parse().ok()?;
        let end: IpAddr = end.split('/').next()?.trim().parse().ok()?;
        Some((start, end))
    }

    /// The document's "up" relation target.
    pub fn up_link(doc: &RdapDocument) -> Option<&str> {
        doc.links
            .iter()
            .find(|l| l.rel.as_deref() == Some("up"))
            .and_then(|l| l.href.as_deref())
    }

    async fn fetch(&self, url: &str) -> Result<RdapDocument, ProviderError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::InvalidResponse(format!(
                "HTTP {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse RDAP: {}", e)))
    }
}

#[async_trait]
impl PoolProvider for RdapProvider {
    async fn resolve(&self, ip: &IpAddr) -> Result<Option<NetworkPool>, ProviderError> {
        let mut url = format!("{}/{}", self.root, ip);
        let mut visited: HashSet<String> = HashSet::new();

        for hop in 0..MAX_HOPS {
            if !visited.insert(url.clone()) {
                debug!(ip = %ip, url = %url, "RDAP up-link cycle");
                return Ok(None);
            }

            let doc = self.fetch(&url).await?;

            if let Some(pool) = Self::select_pool(&doc, ip) {
                debug!(ip = %ip, hops = hop, pool = %pool, "RDAP resolved");
                return Ok(Some(pool));
            }

            match Self::up_link(&doc) {
                Some(next) => url = next.to_string(),
                None => return Ok(None),
            }
        }

        debug!(ip = %ip, "RDAP walk exhausted its hop limit");
        Ok(None)
    }

    fn name(&self) -> &str {
        "rdap"
    }
}
