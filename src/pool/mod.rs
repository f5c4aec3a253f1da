//! Network-ownership resolution: the pool (CIDR or range) an IP belongs to.
//!
//! Providers form a strict cascade behind a common interface; each layer is
//! tried only when the previous one had no answer, and each layer's result
//! is cached independently. The cascade always produces something: when
//! every registry source comes up empty, a conservative /23 block around
//! the IP is returned.

pub mod bgp;
pub mod rdap;
pub mod ripe;
pub mod whois;

pub use bgp::BgpProvider;
pub use rdap::RdapProvider;
pub use ripe::RipeProvider;
pub use whois::WhoisProvider;

use crate::cache::CacheStore;
use crate::config::PoolConfig;
use crate::error::ProviderError;
pub use crate::range::NetworkPool;
use async_trait::async_trait;
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One layer of the ownership cascade.
///
/// `Ok(None)` means the layer has no answer for this IP and the cascade
/// advances; an error is logged by the resolver and treated the same way,
/// but is not cached.
#[async_trait]
pub trait PoolProvider: Send + Sync {
    async fn resolve(&self, ip: &IpAddr) -> Result<Option<NetworkPool>, ProviderError>;

    /// Provider name, also the cache-key segment.
    fn name(&self) -> &str;
}

/// Cascading ownership resolver.
pub struct PoolResolver {
    providers: Vec<Box<dyn PoolProvider>>,
    cache: Arc<CacheStore>,
    cache_ttl: Duration,
}

impl PoolResolver {
    pub fn new(config: &PoolConfig, cache: Arc<CacheStore>) -> Self {
        let providers: Vec<Box<dyn PoolProvider>> = vec![
            Box::new(BgpProvider::new(config)),
            Box::new(RdapProvider::new(config)),
            Box::new(RipeProvider::new(config)),
            Box::new(WhoisProvider::new(config)),
        ];

        Self {
            providers,
            cache,
            cache_ttl: Duration::from_secs(config.cache_ttl_seconds),
        }
    }

    /// Build a resolver over an explicit provider chain.
    pub fn with_providers(
        providers: Vec<Box<dyn PoolProvider>>,
        cache: Arc<CacheStore>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            providers,
            cache,
            cache_ttl,
        }
    }

    /// Walk the cascade and return the first non-empty pool, falling back
    /// to the static /23 block. Never fails.
    pub async fn resolve_pool(&self, ip: &IpAddr) -> NetworkPool {
        for provider in &self.providers {
            let key = CacheStore::key(&format!("pool:{}", provider.name()), ip);

            // The cached value is the layer's answer including "empty", so
            // a dead layer is not re-queried for the whole TTL.
            if let Some(cached) = self.cache.get::<Option<NetworkPool>>(&key) {
                match cached {
                    Some(pool) => {
                        debug!(ip = %ip, provider = provider.name(), "Pool cache hit");
                        return pool;
                    }
                    None => continue,
                }
            }

            match provider.resolve(ip).await {
                Ok(Some(pool)) => {
                    debug!(ip = %ip, provider = provider.name(), pool = %pool, "Pool resolved");
                    self.cache.set(&key, &Some(pool.clone()), self.cache_ttl);
                    return pool;
                }
                Ok(None) => {
                    self.cache.set(&key, &None::<NetworkPool>, self.cache_ttl);
                }
                Err(e) => {
                    warn!(ip = %ip, provider = provider.name(), error = %e, "Pool lookup failed");
                }
            }
        }

        fallback_pool(ip)
    }
}

/// Static last-resort pool: the /23 block containing the IP, as a range.
pub fn fallback_pool(ip: &IpAddr) -> NetworkPool {
    match ip {
        IpAddr::V4(v4) => {
            let net = Ipv4Net::new(*v4, 23).expect("23 <= 32");
            NetworkPool::Range(IpAddr::V4(net.network()), IpAddr::V4(net.broadcast()))
        }
        IpAddr::V6(v6) => {
            let net = Ipv6Net::new(*v6, 23).expect("23 <= 128");
            NetworkPool::Range(IpAddr::V6(net.network()), IpAddr::V6(net.broadcast()))
        }
    }
}
