//! Community-intel provider with bearer-token authentication.
//!
//! The API key is exchanged for a short-lived bearer token through a
//! separate auth call; the token is reused for ~23 hours and re-fetched
//! on expiry. An IP is a hit when the context record carries a
//! classification, any attack details, or a nonzero noise score.

use super::{IntelProvider, IntelSignal};
use crate::config::GreyNoiseConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct ContextResponse {
    #[serde(default)]
    classification: Option<String>,

    #[serde(default)]
    attack_details: Vec<serde_json::Value>,

    #[serde(default)]
    noise: Option<serde_json::Value>,
}

/// Hit when any threat-indicating field is present.
fn is_hit(context: &ContextResponse) -> bool {
    if context
        .classification
        .as_deref()
        .map(|c| !c.is_empty())
        .unwrap_or(false)
    {
        return true;
    }

    if !context.attack_details.is_empty() {
        return true;
    }

    // The noise field has shipped both as a boolean and as a score.
    match &context.noise {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        _ => false,
    }
}

struct BearerToken {
    token: String,
    fetched_at: Instant,
}

/// Community-intel provider.
pub struct GreyNoiseProvider {
    config: GreyNoiseConfig,
    client: Client,
    token: RwLock<Option<BearerToken>>,
}

impl GreyNoiseProvider {
    pub fn new(config: GreyNoiseConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            config,
            client,
            token: RwLock::new(None),
        }
    }

    fn cached_token(&self) -> Option<String> {
        let guard = self.token.read().ok()?;
        let state = guard.as_ref()?;
        if state.fetched_at.elapsed() < Duration::from_secs(self.config.token_ttl_seconds) {
            Some(state.token.clone())
        } else {
            None
        }
    }

    async fn bearer_token(&self) -> Result<String, ProviderError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        debug!("Exchanging API key for bearer token");

        let response = self
            .client
            .post(&self.config.auth_url)
            .json(&serde_json::json!({ "api_key": self.config.api_key }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::InvalidResponse(format!(
                "token exchange failed: HTTP {}",
                response.status()
            )));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse token: {}", e))
        })?;

        if let Ok(mut guard) = self.token.write() {
            *guard = Some(BearerToken {
                token: body.access_token.clone(),
                fetched_at: Instant::now(),
            });
        }

        Ok(body.access_token)
    }

    #[cfg(test)]
    fn inject_token(&self, token: &str, age: Duration) {
        *self.token.write().unwrap() = Some(BearerToken {
            token: token.to_string(),
            fetched_at: Instant::now() - age,
        });
    }
}

#[async_trait]
impl IntelProvider for GreyNoiseProvider {
    async fn check(&self, ip: &IpAddr) -> Result<IntelSignal, ProviderError> {
        let token = self.bearer_token().await?;
        let url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), ip);

        debug!(ip = %ip, "Querying community intel");

        let response = self.client.get(&url).bearer_auth(&token).send().await?;

        // An unknown IP commonly answers 404: clean, not an error.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(IntelSignal::Clean);
        }

        if !response.status().is_success() {
            return Err(ProviderError::InvalidResponse(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let context: ContextResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse context: {}", e))
        })?;

        if is_hit(&context) {
            debug!(ip = %ip, classification = ?context.classification, "Community intel hit");
            Ok(IntelSignal::CommunityListed)
        } else {
            Ok(IntelSignal::Clean)
        }
    }

    fn name(&self) -> &str {
        "greynoise"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.api_key.is_empty()
    }
}
