//! Regional-registry structured search for the most specific `inetnum`.

use super::PoolProvider;
use crate::config::PoolConfig;
use crate::error::ProviderError;
use crate::range::NetworkPool;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub objects: Objects,
}

#[derive(Debug, Default, Deserialize)]
pub struct Objects {
    #[serde(default)]
    pub object: Vec<Object>,
}

#[derive(Debug, Deserialize)]
pub struct Object {
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug, Default, Deserialize)]
pub struct Attributes {
    #[serde(default)]
    pub attribute: Vec<Attribute>,
}

#[derive(Debug, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// Structured registry-search provider.
pub struct RipeProvider {
    url: String,
    client: Client,
}

impl RipeProvider {
    pub fn new(config: &PoolConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.ripe_timeout_ms))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            url: config.ripe_search_url.clone(),
            client,
        }
    }

    /// Among the returned `inetnum` attributes, the narrowest range that
    /// actually contains the IP wins (the most specific registration).
    pub fn select_inetnum(response: &SearchResponse, ip: &IpAddr) -> Option<NetworkPool> {
        response
            .objects
            .object
            .iter()
            .flat_map(|o| o.attributes.attribute.iter())
            .filter(|a| a.name == "inetnum")
            .filter_map(|a| a.value.parse::<NetworkPool>().ok())
            .filter(|pool| pool.contains(ip))
            .min_by_key(|pool| pool.span())
    }
}

#[async_trait]
impl PoolProvider for RipeProvider {
    async fn resolve(&self, ip: &IpAddr) -> Result<Option<NetworkPool>, ProviderError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("query-string", ip.to_string().as_str()),
                ("type-filter", "inetnum"),
                ("flags", "no-referenced"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::InvalidResponse(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let search: SearchResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse search: {}", e))
        })?;

        let pool = Self::select_inetnum(&search, ip);
        debug!(ip = %ip, found = pool.is_some(), "Registry search answer");
        Ok(pool)
    }

    fn name(&self) -> &str {
        "ripe"
    }
}
