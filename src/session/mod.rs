//! Per-call transient state and the store coordinating concurrent webhooks.
//!
//! Webhook handlers are stateless and run concurrently; the only thing they
//! share is this store. Race resolution between sibling legs therefore
//! happens inside single-lock operations: [`SessionStore::settle_leg`] is an
//! atomic remove-and-check-empty, and [`SessionStore::claim_winner`] marks
//! the winner and its losing siblings in one step. Both are no-ops on
//! already-settled legs and on cleared sessions, so duplicate and late
//! callbacks are harmless.

use crate::config::IvrConfig;
use crate::routing::RoutingConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

pub type LegId = String;

/// Per-leg outcome of an outbound dial attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegOutcome {
    Pending,
    Won,
    LostToSibling,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    /// Internally generated id, stable for the whole call lifetime and
    /// distinct from any provider call id.
    pub session_id: String,
    pub inbound_call_id: String,
    pub called_number: String,
    pub caller_number: String,
    /// Copy of the routing record fetched at call start; never re-read.
    pub routing: RoutingConfig,
    pub access_code_id: Option<String>,
    pub source_language_id: Option<String>,
    pub target_language_id: Option<String>,
    /// Outbound legs still ringing in the current tier.
    pub dialed_leg_ids: Vec<LegId>,
    /// All legs placed for the current tier, settled or not.
    pub tier_leg_ids: Vec<LegId>,
    /// Outcome per leg, cumulative across tiers.
    pub leg_outcomes: HashMap<LegId, LegOutcome>,
    /// Interpreter behind each leg. The fallback leg has no entry.
    pub leg_interpreters: HashMap<LegId, String>,
    pub winning_leg_id: Option<LegId>,
    pub priority_tier: u32,
    pub fallback_used: bool,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(
        inbound_call_id: impl Into<String>,
        called_number: impl Into<String>,
        caller_number: impl Into<String>,
        routing: RoutingConfig,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            inbound_call_id: inbound_call_id.into(),
            called_number: called_number.into(),
            caller_number: caller_number.into(),
            routing,
            access_code_id: None,
            source_language_id: None,
            target_language_id: None,
            dialed_leg_ids: Vec::new(),
            tier_leg_ids: Vec::new(),
            leg_outcomes: HashMap::new(),
            leg_interpreters: HashMap::new(),
            winning_leg_id: None,
            priority_tier: 1,
            fallback_used: false,
            started_at: Utc::now(),
        }
    }

    pub fn winning_interpreter_id(&self) -> Option<&str> {
        self.winning_leg_id
            .as_ref()
            .and_then(|leg| self.leg_interpreters.get(leg))
            .map(|s| s.as_str())
    }

    pub fn max_silence_retries(&self, cfg: &IvrConfig) -> u32 {
        self.routing
            .max_silence_retries
            .unwrap_or(cfg.max_silence_retries)
    }

    pub fn max_invalid_retries(&self, cfg: &IvrConfig) -> u32 {
        self.routing
            .max_invalid_retries
            .unwrap_or(cfg.max_invalid_retries)
    }
}

/// Whether every leg of a tier has terminated without producing a winner.
/// A tier with a won or still-pending leg is not exhausted.
pub fn tier_exhausted(tier_legs: &[LegId], outcomes: &HashMap<LegId, LegOutcome>) -> bool {
    !tier_legs.is_empty()
        && tier_legs.iter().all(|leg| {
            matches!(
                outcomes.get(leg),
                Some(LegOutcome::Failed) | Some(LegOutcome::Canceled)
            )
        })
}

/// Result of atomically settling one leg.
#[derive(Debug, Clone)]
pub struct LegSettled {
    /// True exactly once per tier: when this settlement drained the last
    /// outstanding leg and no sibling won.
    pub now_empty: bool,
    pub session: CallSession,
}

/// Result of atomically claiming the race for one leg.
#[derive(Debug, Clone)]
pub struct WinnerClaim {
    /// Sibling legs that were still ringing; cancellation is the caller's
    /// (best-effort) responsibility.
    pub losers: Vec<LegId>,
    pub session: CallSession,
}

#[derive(Default)]
struct StoreInner {
    by_inbound: HashMap<String, CallSession>,
    inbound_by_session: HashMap<String, String>,
}

/// In-memory key/value + ordered-set store for in-flight sessions, keyed by
/// the provider's inbound call id with a session-id secondary index.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<StoreInner>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: CallSession) {
        let mut inner = self.inner.lock().await;
        inner
            .inbound_by_session
            .insert(session.session_id.clone(), session.inbound_call_id.clone());
        inner
            .by_inbound
            .insert(session.inbound_call_id.clone(), session);
    }

    pub async fn get(&self, inbound_call_id: &str) -> Option<CallSession> {
        self.inner.lock().await.by_inbound.get(inbound_call_id).cloned()
    }

    pub async fn get_by_session_id(&self, session_id: &str) -> Option<CallSession> {
        let inner = self.inner.lock().await;
        let inbound = inner.inbound_by_session.get(session_id)?;
        inner.by_inbound.get(inbound).cloned()
    }

    /// Applies `f` to the session under the store lock and returns the
    /// updated copy; `None` when the session has already been cleared.
    pub async fn update<F>(&self, inbound_call_id: &str, f: F) -> Option<CallSession>
    where
        F: FnOnce(&mut CallSession),
    {
        let mut inner = self.inner.lock().await;
        let session = inner.by_inbound.get_mut(inbound_call_id)?;
        f(session);
        Some(session.clone())
    }

    pub async fn remove(&self, inbound_call_id: &str) -> Option<CallSession> {
        let mut inner = self.inner.lock().await;
        let session = inner.by_inbound.remove(inbound_call_id)?;
        inner.inbound_by_session.remove(&session.session_id);
        Some(session)
    }

    /// Starts a new dial tier: clears the per-tier leg sets. Cumulative
    /// per-leg outcomes are kept so late callbacks for old legs stay no-ops.
    pub async fn begin_tier(&self, inbound_call_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.by_inbound.get_mut(inbound_call_id) {
            session.dialed_leg_ids.clear();
            session.tier_leg_ids.clear();
        }
    }

    /// Records one newly placed outbound leg as pending.
    pub async fn record_leg(
        &self,
        inbound_call_id: &str,
        leg_id: &str,
        interpreter_id: Option<String>,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.by_inbound.get_mut(inbound_call_id) {
            session.dialed_leg_ids.push(leg_id.to_string());
            session.tier_leg_ids.push(leg_id.to_string());
            session
                .leg_outcomes
                .insert(leg_id.to_string(), LegOutcome::Pending);
            if let Some(id) = interpreter_id {
                session.leg_interpreters.insert(leg_id.to_string(), id);
            }
        }
    }

    /// Atomic remove-and-check-empty. Settles a pending leg with `outcome`,
    /// removes it from the ringing set, and reports whether this settlement
    /// exhausted the tier. Returns `None` if the session is gone or the leg
    /// is unknown or already settled, so duplicate callbacks cannot
    /// double-escalate.
    pub async fn settle_leg(
        &self,
        session_id: &str,
        leg_id: &str,
        outcome: LegOutcome,
    ) -> Option<LegSettled> {
        let mut inner = self.inner.lock().await;
        let inbound = inner.inbound_by_session.get(session_id)?.clone();
        let session = inner.by_inbound.get_mut(&inbound)?;
        match session.leg_outcomes.get(leg_id) {
            Some(LegOutcome::Pending) => {}
            _ => return None,
        }
        session.leg_outcomes.insert(leg_id.to_string(), outcome);
        session.dialed_leg_ids.retain(|id| id != leg_id);
        let now_empty = session.dialed_leg_ids.is_empty()
            && tier_exhausted(&session.tier_leg_ids, &session.leg_outcomes);
        Some(LegSettled {
            now_empty,
            session: session.clone(),
        })
    }

    /// Atomically claims the race for `leg_id`. The first pending leg to
    /// claim wins; every other ringing sibling is marked lost and returned
    /// for cancellation. Returns `None` when a winner already exists or the
    /// leg is unknown/settled, which guarantees at most one leg is ever
    /// bridged per session.
    pub async fn claim_winner(&self, session_id: &str, leg_id: &str) -> Option<WinnerClaim> {
        let mut inner = self.inner.lock().await;
        let inbound = inner.inbound_by_session.get(session_id)?.clone();
        let session = inner.by_inbound.get_mut(&inbound)?;
        if session.winning_leg_id.is_some() {
            return None;
        }
        match session.leg_outcomes.get(leg_id) {
            Some(LegOutcome::Pending) => {}
            _ => return None,
        }
        session.leg_outcomes.insert(leg_id.to_string(), LegOutcome::Won);
        session.winning_leg_id = Some(leg_id.to_string());
        session.dialed_leg_ids.retain(|id| id != leg_id);
        let losers: Vec<LegId> = session.dialed_leg_ids.drain(..).collect();
        for loser in &losers {
            session
                .leg_outcomes
                .insert(loser.clone(), LegOutcome::LostToSibling);
        }
        Some(WinnerClaim {
            losers,
            session: session.clone(),
        })
    }
}
