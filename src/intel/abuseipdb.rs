//! AbuseIPDB confidence-score provider.

use super::{IntelProvider, IntelSignal};
use crate::config::AbuseIpDbConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// AbuseIPDB API response.
#[derive(Debug, Deserialize)]
struct AbuseIpDbResponse {
    data: AbuseIpDbData,
}

#[derive(Debug, Deserialize)]
struct AbuseIpDbData {
    /// Abuse confidence score (0-100).
    #[serde(rename = "abuseConfidenceScore")]
    abuse_confidence_score: u8,

    /// Total number of reports.
    #[serde(rename = "totalReports", default)]
    total_reports: u32,
}

/// AbuseIPDB provider.
pub struct AbuseIpDbProvider {
    config: AbuseIpDbConfig,
    client: Client,
}

impl AbuseIpDbProvider {
    pub fn new(config: AbuseIpDbConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .expect("Failed to create HTTP client");

        Self { config, client }
    }
}

#[async_trait]
impl IntelProvider for AbuseIpDbProvider {
    async fn check(&self, ip: &IpAddr) -> Result<IntelSignal, ProviderError> {
        let url = format!(
            "{}?ipAddress={}&maxAgeInDays={}",
            self.config.url, ip, self.config.max_age_days
        );

        debug!(ip = %ip, "Querying AbuseIPDB");

        let response = self
            .client
            .get(&url)
            .header("Key", &self.config.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("AbuseIPDB rate limit exceeded");
            return Err(ProviderError::RateLimited);
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidResponse(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let api_response: AbuseIpDbResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        let data = api_response.data;
        debug!(
            ip = %ip,
            score = data.abuse_confidence_score,
            reports = data.total_reports,
            "AbuseIPDB lookup complete"
        );

        Ok(IntelSignal::Confidence(data.abuse_confidence_score))
    }

    fn name(&self) -> &str {
        "abuseipdb"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.api_key.is_empty()
    }
}
