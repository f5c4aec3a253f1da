//! VirusTotal detection-count provider.
//!
//! Preferred signal is the engine verdict breakdown; when that is absent
//! the negative-reputation field stands in, and failing that the count of
//! risk-indicating tags.

use super::{IntelProvider, IntelSignal};
use crate::config::VirusTotalConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Tags that count as detections in the last-resort fallback.
const RISK_TAGS: &[&str] = &["malicious", "suspicious", "malware", "phishing", "spam", "scanner"];

#[derive(Debug, Deserialize)]
struct VtResponse {
    data: VtData,
}

#[derive(Debug, Deserialize)]
struct VtData {
    attributes: VtAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct VtAttributes {
    #[serde(default)]
    last_analysis_stats: Option<VtAnalysisStats>,

    #[serde(default)]
    reputation: Option<i64>,

    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VtAnalysisStats {
    #[serde(default)]
    malicious: u32,
    #[serde(default)]
    suspicious: u32,
}

/// Count of flagged verdicts with the documented fallbacks.
fn detection_count(attributes: &VtAttributes) -> u32 {
    if let Some(ref stats) = attributes.last_analysis_stats {
        return stats.malicious + stats.suspicious;
    }

    if let Some(reputation) = attributes.reputation {
        if reputation < 0 {
            return reputation.unsigned_abs().min(u32::MAX as u64) as u32;
        }
        return 0;
    }

    attributes
        .tags
        .iter()
        .filter(|tag| RISK_TAGS.contains(&tag.to_ascii_lowercase().as_str()))
        .count() as u32
}

/// VirusTotal provider.
pub struct VirusTotalProvider {
    config: VirusTotalConfig,
    client: Client,
}

impl VirusTotalProvider {
    pub fn new(config: VirusTotalConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .expect("Failed to create HTTP client");

        Self { config, client }
    }
}

#[async_trait]
impl IntelProvider for VirusTotalProvider {
    async fn check(&self, ip: &IpAddr) -> Result<IntelSignal, ProviderError> {
        let url = format!("{}/{}", self.config.url.trim_end_matches('/'), ip);

        debug!(ip = %ip, "Querying VirusTotal");

        let response = self
            .client
            .get(&url)
            .header("x-apikey", &self.config.api_key)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }

        if !response.status().is_success() {
            return Err(ProviderError::InvalidResponse(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let body: VtResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        let count = detection_count(&body.data.attributes);
        debug!(ip = %ip, detections = count, "VirusTotal lookup complete");

        Ok(IntelSignal::Detections(count))
    }

    fn name(&self) -> &str {
        "virustotal"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.api_key.is_empty()
    }
}
