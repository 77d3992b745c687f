//! Routing Configuration Store — per-inbound-number IVR settings.
//!
//! The record for the dialed number is fetched exactly once when the call
//! starts and snapshotted into the session, so an edit to the store can
//! never corrupt an in-flight call.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    pub number: String,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub code_gate_enabled: bool,
    #[serde(default)]
    pub code_prompt: Option<String>,
    #[serde(default)]
    pub source_prompt: Option<String>,
    #[serde(default)]
    pub target_prompt: Option<String>,
    /// Static destination dialed once every priority tier is exhausted.
    #[serde(default)]
    pub fallback_number: Option<String>,
    /// Per-number overrides of the global IVR retry budgets.
    #[serde(default)]
    pub max_silence_retries: Option<u32>,
    #[serde(default)]
    pub max_invalid_retries: Option<u32>,
    #[serde(default)]
    pub record_conference: bool,
}

#[async_trait]
pub trait RoutingStore: Send + Sync {
    /// Returns the routing record for a dialed number, or `None` when the
    /// number is not provisioned.
    async fn config_for(&self, number: &str) -> Result<Option<RoutingConfig>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RoutingData {
    #[serde(default)]
    pub numbers: Vec<RoutingConfig>,
}

pub struct MemoryRoutingStore {
    configs: HashMap<String, RoutingConfig>,
}

impl MemoryRoutingStore {
    pub fn new(data: RoutingData) -> Self {
        let configs = data
            .numbers
            .into_iter()
            .map(|c| (c.number.clone(), c))
            .collect();
        Self { configs }
    }

    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read routing data '{}': {}", path, e))?;
        let data: RoutingData = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse routing data '{}': {}", path, e))?;
        Ok(Self::new(data))
    }
}

#[async_trait]
impl RoutingStore for MemoryRoutingStore {
    async fn config_for(&self, number: &str) -> Result<Option<RoutingConfig>> {
        Ok(self.configs.get(number).cloned())
    }
}

pub struct HttpRoutingStore {
    client: reqwest::Client,
    url: String,
    headers: Option<HashMap<String, String>>,
}

impl HttpRoutingStore {
    pub fn new(url: String, headers: Option<HashMap<String, String>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            headers,
        }
    }
}

#[async_trait]
impl RoutingStore for HttpRoutingStore {
    async fn config_for(&self, number: &str) -> Result<Option<RoutingConfig>> {
        let url = format!(
            "{}/numbers/{}/routing",
            self.url.trim_end_matches('/'),
            urlencoding::encode(number)
        );
        let mut req = self.client.get(&url);
        if let Some(headers) = &self.headers {
            for (k, v) in headers {
                req = req.header(k, v);
            }
        }
        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let config = resp.error_for_status()?.json::<Option<RoutingConfig>>().await?;
        Ok(config)
    }
}

impl RoutingConfig {
    /// Minimal config used by tests and programmatic setup.
    pub fn for_number(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            greeting: None,
            code_gate_enabled: false,
            code_prompt: None,
            source_prompt: None,
            target_prompt: None,
            fallback_number: None,
            max_silence_retries: None,
            max_invalid_retries: None,
            record_conference: false,
        }
    }
}
