//! Telephony provider client: the REST side of call control.
//!
//! Webhooks flow inward through `handler`; this module is the outward
//! direction — placing outbound legs, hanging up losers, and redirecting
//! live calls to a new markup document.

use crate::config::ProviderConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::debug;

/// One outbound dial attempt. The answer URL receives the machine-detection
/// result; the status callback receives busy/failed/no-answer outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCall {
    pub to: String,
    pub from: String,
    pub answer_url: String,
    pub status_callback: String,
    pub ring_timeout_secs: u32,
    pub machine_detection: bool,
}

#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    /// Places an outbound call and returns the provider's call id for the
    /// new leg.
    async fn create_call(&self, call: &OutboundCall) -> Result<String>;
    /// Best-effort termination of a leg; the leg may already be gone.
    async fn hangup_call(&self, call_id: &str) -> Result<()>;
    /// Points a live call at a new markup URL.
    async fn redirect_call(&self, call_id: &str, url: &str) -> Result<()>;
}

/// Carrier REST API client (Twilio-compatible surface).
pub struct RestProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl RestProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Calls.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    fn call_url(&self, call_id: &str) -> String {
        format!(
            "{}/Accounts/{}/Calls/{}.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid,
            call_id
        )
    }
}

#[async_trait]
impl TelephonyProvider for RestProvider {
    async fn create_call(&self, call: &OutboundCall) -> Result<String> {
        let timeout = call.ring_timeout_secs.to_string();
        let mut form = vec![
            ("To", call.to.as_str()),
            ("From", call.from.as_str()),
            ("Url", call.answer_url.as_str()),
            ("Method", "POST"),
            ("StatusCallback", call.status_callback.as_str()),
            ("StatusCallbackMethod", "POST"),
            ("Timeout", timeout.as_str()),
        ];
        if call.machine_detection {
            form.push(("MachineDetection", "Enable"));
        }
        let resp = self
            .client
            .post(self.calls_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = resp.json().await?;
        let sid = body["sid"]
            .as_str()
            .ok_or_else(|| anyhow!("create call response missing sid: {}", body))?;
        debug!(to = call.to, leg_id = sid, "outbound leg placed");
        Ok(sid.to_string())
    }

    async fn hangup_call(&self, call_id: &str) -> Result<()> {
        self.client
            .post(self.call_url(call_id))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn redirect_call(&self, call_id: &str, url: &str) -> Result<()> {
        self.client
            .post(self.call_url(call_id))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[("Url", url), ("Method", "POST")])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
