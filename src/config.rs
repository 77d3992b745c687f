use anyhow::Error;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "lingoroute.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub http_addr: String,
    /// External base URL the telephony provider uses to reach the webhook
    /// endpoints, e.g. `https://route.example.com`.
    pub public_url: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    /// IANA time zone used when matching interpreter availability windows.
    pub timezone: String,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub ivr: IvrConfig,
    #[serde(default)]
    pub directory: DirectoryBackendConfig,
    #[serde(default)]
    pub routing: RoutingBackendConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

/// Credentials and endpoint of the telephony carrier's REST API.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub api_base: String,
    /// Caller id presented on outbound interpreter legs.
    pub caller_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Highest priority tier tried before the static fallback number.
    pub max_tier: u32,
    /// Ring timeout for each outbound leg, enforced by the provider.
    pub ring_timeout_secs: u32,
    /// Whether an inconclusive machine-detection result is accepted as a
    /// human pickup. Matches the historical optimistic policy.
    pub treat_unknown_as_human: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IvrConfig {
    /// No-input retries allowed per gather step.
    pub max_silence_retries: u32,
    /// Validation-failure retries allowed per gather step.
    pub max_invalid_retries: u32,
    pub digit_timeout_secs: u32,
    pub max_digits: u32,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum DirectoryBackendConfig {
    Memory,
    File {
        path: String,
    },
    Http {
        url: String,
        headers: Option<HashMap<String, String>>,
    },
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum RoutingBackendConfig {
    Memory,
    File {
        path: String,
    },
    Http {
        url: String,
        headers: Option<HashMap<String, String>>,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    /// Calls shorter than this never produce a final outcome record.
    pub min_billable_secs: u64,
    #[serde(default)]
    pub backend: HistoryBackendConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum HistoryBackendConfig {
    Local {
        root: String,
    },
    Http {
        url: String,
        headers: Option<HashMap<String, String>>,
    },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            public_url: "http://localhost:8080".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            timezone: "UTC".to_string(),
            provider: ProviderConfig::default(),
            dispatch: DispatchConfig::default(),
            ivr: IvrConfig::default(),
            directory: DirectoryBackendConfig::default(),
            routing: RoutingBackendConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            account_sid: "".to_string(),
            auth_token: "".to_string(),
            api_base: "https://api.twilio.com/2010-04-01".to_string(),
            caller_id: "".to_string(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_tier: 5,
            ring_timeout_secs: 20,
            treat_unknown_as_human: true,
        }
    }
}

impl Default for IvrConfig {
    fn default() -> Self {
        Self {
            max_silence_retries: 2,
            max_invalid_retries: 2,
            digit_timeout_secs: 5,
            max_digits: 10,
        }
    }
}

impl Default for DirectoryBackendConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl Default for RoutingBackendConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            min_billable_secs: 10,
            backend: HistoryBackendConfig::default(),
        }
    }
}

impl Default for HistoryBackendConfig {
    fn default() -> Self {
        #[cfg(target_os = "windows")]
        let root = "./callhistory".to_string();
        #[cfg(not(target_os = "windows"))]
        let root = "/tmp/callhistory".to_string();
        Self::Local { root }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}
