//! Call history recording: fire-and-forget outcome persistence.
//!
//! The adapter resolves display data and pushes records onto an unbounded
//! channel; a background manager drains the channel into the configured
//! backend. Nothing here may ever fail or block the call-control path —
//! errors are logged and swallowed.

use crate::config::{HistoryBackendConfig, HistoryConfig};
use crate::directory::DirectoryService;
use crate::session::CallSession;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{future::Future, path::Path, pin::Pin, sync::Arc};
use tokio::{fs::File, io::AsyncWriteExt, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type HistorySender = tokio::sync::mpsc::UnboundedSender<CallOutcomeRecord>;
pub type HistoryReceiver = tokio::sync::mpsc::UnboundedReceiver<CallOutcomeRecord>;

pub type FnSaveOutcome = Arc<
    Box<
        dyn Fn(
                Arc<HistoryConfig>,
                CallOutcomeRecord,
            ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
            + Send
            + Sync,
    >,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Mirror write while the IVR is still resolving values.
    InProgress,
    /// Conference reached and ended normally.
    Completed,
    /// Caller left before an interpreter was bridged.
    Abandoned,
    /// Every tier and the fallback were exhausted.
    Unconnected,
}

/// Durable record of a finished (or in-flight, for mirrors) session. Written
/// at most once per session close; never mutated by the engine afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOutcomeRecord {
    pub session_id: String,
    pub caller_number: String,
    pub called_number: String,
    pub access_code_id: Option<String>,
    pub interpreter_id: Option<String>,
    pub interpreter_name: Option<String>,
    pub source_language_id: Option<String>,
    pub source_language: Option<String>,
    pub target_language_id: Option<String>,
    pub target_language: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub status: OutcomeStatus,
}

/// Fire-and-forget bridge between the call engine and the recorder channel.
#[derive(Clone)]
pub struct HistoryRecorderAdapter {
    directory: Arc<dyn DirectoryService>,
    sender: HistorySender,
    min_billable_secs: u64,
}

impl HistoryRecorderAdapter {
    pub fn new(
        directory: Arc<dyn DirectoryService>,
        sender: HistorySender,
        min_billable_secs: u64,
    ) -> Self {
        Self {
            directory,
            sender,
            min_billable_secs,
        }
    }

    /// Mirrors the session's resolved values so a record exists even if the
    /// call is abandoned mid-IVR. Never blocks the caller.
    pub fn mirror(&self, session: &CallSession) {
        self.submit(session.clone(), OutcomeStatus::InProgress, false);
    }

    /// Writes the final outcome. Skips calls that never reached a billable
    /// duration and calls answered only by the standalone fallback number,
    /// since neither represents a mediation.
    pub fn finalize(&self, session: &CallSession, status: OutcomeStatus) {
        self.submit(session.clone(), status, true);
    }

    fn submit(&self, session: CallSession, status: OutcomeStatus, apply_skip_rules: bool) {
        let directory = self.directory.clone();
        let sender = self.sender.clone();
        let min_billable_secs = self.min_billable_secs;
        tokio::spawn(async move {
            let duration_secs = (Utc::now() - session.started_at).num_seconds().max(0) as u64;
            if apply_skip_rules {
                if duration_secs < min_billable_secs {
                    debug!(
                        session_id = session.session_id,
                        duration_secs, "below billable duration, skipping outcome record"
                    );
                    return;
                }
                if session.winning_leg_id.is_some() && session.winning_interpreter_id().is_none() {
                    debug!(
                        session_id = session.session_id,
                        "fallback destination answered, skipping outcome record"
                    );
                    return;
                }
            }

            let interpreter_id = session.winning_interpreter_id().map(|s| s.to_string());
            let interpreter_name = match &interpreter_id {
                Some(id) => lookup_interpreter_name(directory.as_ref(), id).await,
                None => None,
            };
            let source_language =
                lookup_language_name(directory.as_ref(), session.source_language_id.as_deref())
                    .await;
            let target_language =
                lookup_language_name(directory.as_ref(), session.target_language_id.as_deref())
                    .await;

            let record = CallOutcomeRecord {
                session_id: session.session_id.clone(),
                caller_number: session.caller_number.clone(),
                called_number: session.called_number.clone(),
                access_code_id: session.access_code_id.clone(),
                interpreter_id,
                interpreter_name,
                source_language_id: session.source_language_id.clone(),
                source_language,
                target_language_id: session.target_language_id.clone(),
                target_language,
                started_at: session.started_at,
                duration_secs,
                status,
            };
            if let Err(e) = sender.send(record) {
                warn!(
                    session_id = session.session_id,
                    "history recorder channel closed: {}", e
                );
            }
        });
    }
}

async fn lookup_interpreter_name(directory: &dyn DirectoryService, id: &str) -> Option<String> {
    match directory.interpreter(id).await {
        Ok(found) => found.map(|i| i.name),
        Err(e) => {
            warn!(interpreter_id = id, "interpreter lookup failed: {}", e);
            None
        }
    }
}

async fn lookup_language_name(
    directory: &dyn DirectoryService,
    id: Option<&str>,
) -> Option<String> {
    let id = id?;
    match directory.language(id).await {
        Ok(found) => found.map(|l| l.name),
        Err(e) => {
            warn!(language_id = id, "language lookup failed: {}", e);
            None
        }
    }
}

pub struct HistoryRecorderManager {
    pub sender: HistorySender,
    receiver: HistoryReceiver,
    config: Arc<HistoryConfig>,
    cancel_token: CancellationToken,
    saver_fn: FnSaveOutcome,
}

pub struct HistoryRecorderManagerBuilder {
    cancel_token: Option<CancellationToken>,
    config: Option<HistoryConfig>,
    saver_fn: Option<FnSaveOutcome>,
}

impl HistoryRecorderManagerBuilder {
    pub fn new() -> Self {
        Self {
            cancel_token: None,
            config: None,
            saver_fn: None,
        }
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn with_config(mut self, config: HistoryConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_saver(mut self, saver: FnSaveOutcome) -> Self {
        self.saver_fn = Some(saver);
        self
    }

    pub fn build(self) -> HistoryRecorderManager {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let config = Arc::new(self.config.unwrap_or_default());
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let saver_fn = self
            .saver_fn
            .unwrap_or_else(|| Arc::new(Box::new(HistoryRecorderManager::default_saver)));

        if let HistoryBackendConfig::Local { root } = config.backend.clone() {
            if !Path::new(&root).exists() {
                match std::fs::create_dir_all(&root) {
                    Ok(_) => info!("history recorder created directory: {}", root),
                    Err(e) => error!("history recorder failed to create directory: {}", e),
                }
            }
        }

        HistoryRecorderManager {
            sender,
            receiver,
            config,
            cancel_token,
            saver_fn,
        }
    }
}

impl HistoryRecorderManager {
    fn default_saver(
        config: Arc<HistoryConfig>,
        record: CallOutcomeRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            match &config.backend {
                HistoryBackendConfig::Local { root } => {
                    Self::save_to_file(root, &record).await?;
                }
                HistoryBackendConfig::Http { url, headers } => {
                    let client = reqwest::Client::new();
                    let mut req = client.post(url).json(&record);
                    if let Some(headers) = headers {
                        for (k, v) in headers {
                            req = req.header(k, v);
                        }
                    }
                    req.send().await?.error_for_status()?;
                }
            }
            Ok(())
        })
    }

    /// One JSON file per session; a later final write replaces the mirror.
    async fn save_to_file(root: &str, record: &CallOutcomeRecord) -> Result<()> {
        let file_name = Path::new(root).join(format!("{}.json", record.session_id));
        let content = serde_json::to_string_pretty(record)?;
        let mut file = File::create(&file_name).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Drains the channel until cancellation. Save failures are logged and
    /// never retried; the recorder must not back-pressure call control.
    pub async fn serve(&mut self) {
        loop {
            select! {
                _ = self.cancel_token.cancelled() => {
                    info!("history recorder shutting down");
                    break;
                }
                record = self.receiver.recv() => {
                    match record {
                        Some(record) => {
                            let session_id = record.session_id.clone();
                            let saver = self.saver_fn.clone();
                            if let Err(e) = saver(self.config.clone(), record).await {
                                error!(session_id, "failed to save call outcome: {}", e);
                            } else {
                                debug!(session_id, "call outcome saved");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryData, MemoryDirectory};
    use crate::routing::RoutingConfig;
    use chrono::Duration;

    fn finished_session() -> CallSession {
        let mut session = CallSession::new(
            "CA1",
            "+15550100",
            "+15550199",
            RoutingConfig::for_number("+15550100"),
        );
        session.started_at = Utc::now() - Duration::seconds(120);
        session
    }

    fn adapter_with_channel(min_billable_secs: u64) -> (HistoryRecorderAdapter, HistoryReceiver) {
        let directory = Arc::new(MemoryDirectory::new(DirectoryData::default()));
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (
            HistoryRecorderAdapter::new(directory, sender, min_billable_secs),
            receiver,
        )
    }

    #[tokio::test]
    async fn test_finalize_emits_record() {
        let (adapter, mut receiver) = adapter_with_channel(10);
        let mut session = finished_session();
        session.leg_interpreters.insert("leg-1".to_string(), "i1".to_string());
        session.winning_leg_id = Some("leg-1".to_string());

        adapter.finalize(&session, OutcomeStatus::Completed);
        let record = receiver.recv().await.unwrap();
        assert_eq!(record.status, OutcomeStatus::Completed);
        assert_eq!(record.interpreter_id.as_deref(), Some("i1"));
        assert!(record.duration_secs >= 120);
    }

    #[tokio::test]
    async fn test_finalize_skips_short_call() {
        let (adapter, mut receiver) = adapter_with_channel(10);
        let mut session = finished_session();
        session.started_at = Utc::now();

        adapter.finalize(&session, OutcomeStatus::Abandoned);
        // The mirror path still writes, proving the skip was rule-driven.
        adapter.mirror(&session);
        let record = receiver.recv().await.unwrap();
        assert_eq!(record.status, OutcomeStatus::InProgress);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_finalize_skips_fallback_destination() {
        let (adapter, mut receiver) = adapter_with_channel(10);
        let mut session = finished_session();
        session.fallback_used = true;
        session.winning_leg_id = Some("leg-fb".to_string());
        // No leg_interpreters entry: the winner was the fallback number.

        adapter.finalize(&session, OutcomeStatus::Completed);
        adapter.mirror(&session);
        let record = receiver.recv().await.unwrap();
        assert_eq!(record.status, OutcomeStatus::InProgress);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_manager_saves_to_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let token = CancellationToken::new();
        let mut manager = HistoryRecorderManagerBuilder::new()
            .with_cancel_token(token.clone())
            .with_config(HistoryConfig {
                min_billable_secs: 10,
                backend: HistoryBackendConfig::Local { root: root.clone() },
            })
            .build();

        let record = CallOutcomeRecord {
            session_id: "s-123".to_string(),
            caller_number: "+15550199".to_string(),
            called_number: "+15550100".to_string(),
            access_code_id: None,
            interpreter_id: Some("i1".to_string()),
            interpreter_name: Some("Ana".to_string()),
            source_language_id: Some("es".to_string()),
            source_language: Some("Spanish".to_string()),
            target_language_id: Some("en".to_string()),
            target_language: Some("English".to_string()),
            started_at: Utc::now(),
            duration_secs: 300,
            status: OutcomeStatus::Completed,
        };
        manager.sender.send(record).unwrap();

        let handle = tokio::spawn(async move {
            manager.serve().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        let saved = std::fs::read_to_string(dir.path().join("s-123.json")).unwrap();
        let parsed: CallOutcomeRecord = serde_json::from_str(&saved).unwrap();
        assert_eq!(parsed.session_id, "s-123");
        assert_eq!(parsed.status, OutcomeStatus::Completed);
    }
}
