//! Shared test harness: a fake telephony provider plus a builder that wires
//! a full in-memory engine.

use crate::app::{AppState, AppStateBuilder};
use crate::config::Config;
use crate::directory::{
    AccessCode, DirectoryData, Interpreter, Language, MemoryDirectory, NumberDirectory,
};
use crate::history::HistoryReceiver;
use crate::provider::{OutboundCall, TelephonyProvider};
use crate::routing::{MemoryRoutingStore, RoutingConfig, RoutingData};
use crate::session::CallSession;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const TEST_NUMBER: &str = "+15550100";
pub const TEST_CALLER: &str = "+15550199";
pub const TEST_INBOUND_CALL_ID: &str = "CA-in";

/// Records every provider interaction instead of talking to a carrier.
/// Outbound legs are issued ids `leg-1`, `leg-2`, ... in creation order.
#[derive(Default)]
pub struct MockProvider {
    calls: Mutex<Vec<OutboundCall>>,
    hangups: Mutex<Vec<String>>,
    redirects: Mutex<Vec<(String, String)>>,
    next_leg: AtomicUsize,
    fail_creates: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` create_call invocations fail.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn placed(&self) -> Vec<OutboundCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn hung_up(&self) -> Vec<String> {
        self.hangups.lock().unwrap().clone()
    }

    pub fn redirected(&self) -> Vec<(String, String)> {
        self.redirects.lock().unwrap().clone()
    }
}

#[async_trait]
impl TelephonyProvider for MockProvider {
    async fn create_call(&self, call: &OutboundCall) -> Result<String> {
        if self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("simulated create failure for {}", call.to));
        }
        self.calls.lock().unwrap().push(call.clone());
        let n = self.next_leg.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("leg-{}", n))
    }

    async fn hangup_call(&self, call_id: &str) -> Result<()> {
        self.hangups.lock().unwrap().push(call_id.to_string());
        Ok(())
    }

    async fn redirect_call(&self, call_id: &str, url: &str) -> Result<()> {
        self.redirects
            .lock()
            .unwrap()
            .push((call_id.to_string(), url.to_string()));
        Ok(())
    }
}

/// Builds the directory entries for [`TEST_NUMBER`].
#[derive(Default, Clone)]
pub struct TestDirectory {
    interpreters: Vec<Interpreter>,
    languages: Vec<Language>,
    access_codes: Vec<AccessCode>,
}

impl TestDirectory {
    pub fn languages(mut self, languages: &[(&str, &str, &str)]) -> Self {
        for (id, name, digit) in languages {
            self.languages.push(Language {
                id: id.to_string(),
                name: name.to_string(),
                digit: digit.to_string(),
            });
        }
        self
    }

    pub fn access_code(mut self, id: &str, code: &str) -> Self {
        self.access_codes.push(AccessCode {
            id: id.to_string(),
            code: code.to_string(),
        });
        self
    }

    /// An interpreter with a window covering every minute of every day.
    pub fn always_available_interpreter(mut self, id: &str, tier: u32, phone: &str) -> Self {
        let windows: HashMap<String, String> = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
            .iter()
            .map(|d| (d.to_string(), "00:00-23:59".to_string()))
            .collect();
        self.interpreters.push(Interpreter {
            id: id.to_string(),
            name: format!("Interpreter {}", id),
            phone: phone.to_string(),
            priority: tier,
            windows,
        });
        self
    }

    pub fn interpreter(mut self, interpreter: Interpreter) -> Self {
        self.interpreters.push(interpreter);
        self
    }

    fn into_data(self) -> DirectoryData {
        DirectoryData {
            numbers: vec![NumberDirectory {
                number: TEST_NUMBER.to_string(),
                interpreters: self.interpreters,
                languages: self.languages,
                access_codes: self.access_codes,
            }],
        }
    }
}

pub struct TestEnvBuilder {
    directory: TestDirectory,
    code_gate: bool,
    fallback: Option<String>,
    treat_unknown_as_human: Option<bool>,
    min_billable_secs: Option<u64>,
}

pub struct TestEnv {
    pub state: AppState,
    pub provider: Arc<MockProvider>,
    pub history_rx: HistoryReceiver,
}

impl TestEnv {
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder {
            directory: TestDirectory::default(),
            code_gate: false,
            fallback: None,
            treat_unknown_as_human: None,
            min_billable_secs: None,
        }
    }

    /// Inserts a fresh session for the standard inbound call, the way the
    /// incoming-call webhook would.
    pub async fn start_session(&self) -> CallSession {
        let routing = self
            .state
            .routing
            .config_for(TEST_NUMBER)
            .await
            .unwrap()
            .unwrap();
        let session = CallSession::new(TEST_INBOUND_CALL_ID, TEST_NUMBER, TEST_CALLER, routing);
        self.state.session_store.insert(session.clone()).await;
        session
    }
}

impl TestEnvBuilder {
    pub fn directory(mut self, directory: TestDirectory) -> Self {
        self.directory = directory;
        self
    }

    pub fn code_gate(mut self, enabled: bool) -> Self {
        self.code_gate = enabled;
        self
    }

    pub fn fallback(mut self, number: &str) -> Self {
        self.fallback = Some(number.to_string());
        self
    }

    pub fn treat_unknown_as_human(mut self, value: bool) -> Self {
        self.treat_unknown_as_human = Some(value);
        self
    }

    pub fn min_billable_secs(mut self, secs: u64) -> Self {
        self.min_billable_secs = Some(secs);
        self
    }

    pub async fn build(self) -> TestEnv {
        let mut config = Config::default();
        if let Some(value) = self.treat_unknown_as_human {
            config.dispatch.treat_unknown_as_human = value;
        }
        if let Some(secs) = self.min_billable_secs {
            config.history.min_billable_secs = secs;
        }

        let routing = RoutingData {
            numbers: vec![RoutingConfig {
                code_gate_enabled: self.code_gate,
                fallback_number: self.fallback,
                ..RoutingConfig::for_number(TEST_NUMBER)
            }],
        };

        let provider = Arc::new(MockProvider::new());
        let (history_tx, history_rx) = tokio::sync::mpsc::unbounded_channel();
        let state = AppStateBuilder::new()
            .config(config)
            .with_directory(Arc::new(MemoryDirectory::new(self.directory.into_data())))
            .with_routing(Arc::new(MemoryRoutingStore::new(routing)))
            .with_provider(provider.clone())
            .with_history_sender(history_tx)
            .build()
            .await
            .unwrap();

        TestEnv {
            state,
            provider,
            history_rx,
        }
    }
}
