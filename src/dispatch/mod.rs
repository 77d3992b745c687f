//! Dispatch orchestrator: fans out simultaneous outbound legs to the
//! candidate set for the session's current priority tier and resolves the
//! race between them.
//!
//! The winner is whichever leg's webhook is processed first — first to
//! report a human pickup wins, intentionally a race rather than a ranked
//! choice. Tier escalation happens when a tier's candidate set is empty at
//! lookup time, or when every placed leg settles without a winner; the
//! session store's atomic settlement guarantees escalation fires exactly
//! once per exhausted tier even under racing callbacks.

use crate::app::AppState;
use crate::bridge;
use crate::directory::{find_candidates, Candidate};
use crate::history::OutcomeStatus;
use crate::provider::OutboundCall;
use crate::session::{CallSession, LegOutcome};
use crate::twiml;
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Correlation state embedded in every callback URL so provider webhooks
/// are self-describing and the engine never re-derives context it already
/// had when placing the leg.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackContext {
    pub session_id: String,
    #[serde(default = "default_tier")]
    pub priority_tier: u32,
    #[serde(default)]
    pub fallback_used: bool,
}

fn default_tier() -> u32 {
    1
}

impl CallbackContext {
    pub fn to_query(&self) -> String {
        format!(
            "sessionId={}&priorityTier={}&fallbackUsed={}",
            urlencoding::encode(&self.session_id),
            self.priority_tier,
            self.fallback_used
        )
    }
}

/// Enters (or re-enters) the dialing phase for a session. Walks tiers
/// upward past empty candidate sets, places one outbound call per
/// candidate in the first non-empty tier, and falls back to the static
/// fallback number once the tier cap is passed. Safe to call for a
/// session that has already been cleared.
pub async fn dispatch(state: &AppState, inbound_call_id: &str) -> Result<()> {
    loop {
        let Some(session) = state.session_store.get(inbound_call_id).await else {
            return Ok(());
        };
        let tier = session.priority_tier;
        let max_tier = state.config.dispatch.max_tier;

        let (candidates, fallback_attempt) = if tier > max_tier {
            if session.fallback_used {
                give_up(state, session).await;
                return Ok(());
            }
            match session.routing.fallback_number.clone() {
                Some(number) => (
                    vec![Candidate {
                        interpreter_id: None,
                        phone: number,
                    }],
                    true,
                ),
                None => {
                    give_up(state, session).await;
                    return Ok(());
                }
            }
        } else {
            let roster = match state.directory.interpreters(&session.called_number).await {
                Ok(roster) => roster,
                Err(e) => {
                    warn!(
                        session_id = session.session_id,
                        "directory lookup failed: {}", e
                    );
                    Vec::new()
                }
            };
            let now = Utc::now().with_timezone(&state.timezone);
            (find_candidates(&roster, tier, now), false)
        };

        if candidates.is_empty() {
            debug!(
                session_id = session.session_id,
                tier, "no candidates at tier, escalating"
            );
            if state
                .session_store
                .update(inbound_call_id, |s| s.priority_tier += 1)
                .await
                .is_none()
            {
                return Ok(());
            }
            continue;
        }

        if fallback_attempt {
            info!(
                session_id = session.session_id,
                "all tiers empty, dialing fallback number"
            );
            if state
                .session_store
                .update(inbound_call_id, |s| s.fallback_used = true)
                .await
                .is_none()
            {
                return Ok(());
            }
        }

        let ctx = CallbackContext {
            session_id: session.session_id.clone(),
            priority_tier: tier,
            fallback_used: fallback_attempt || session.fallback_used,
        };
        state.session_store.begin_tier(inbound_call_id).await;

        let mut placed = 0usize;
        for candidate in &candidates {
            let call = OutboundCall {
                to: candidate.phone.clone(),
                from: state.config.provider.caller_id.clone(),
                answer_url: state.webhook_url("/webhook/amd", &ctx.to_query()),
                status_callback: state.webhook_url("/webhook/leg-status", &ctx.to_query()),
                ring_timeout_secs: state.config.dispatch.ring_timeout_secs,
                machine_detection: true,
            };
            match state.provider.create_call(&call).await {
                Ok(leg_id) => {
                    info!(
                        session_id = ctx.session_id,
                        leg_id,
                        tier,
                        to = candidate.phone,
                        "outbound leg ringing"
                    );
                    state
                        .session_store
                        .record_leg(inbound_call_id, &leg_id, candidate.interpreter_id.clone())
                        .await;
                    placed += 1;
                }
                Err(e) => {
                    warn!(
                        session_id = ctx.session_id,
                        to = candidate.phone,
                        "failed to place outbound leg: {}",
                        e
                    );
                }
            }
        }

        if placed == 0 {
            // A tier where every create failed escalates like an empty tier.
            if fallback_attempt {
                if let Some(session) = state.session_store.get(inbound_call_id).await {
                    give_up(state, session).await;
                }
                return Ok(());
            }
            if state
                .session_store
                .update(inbound_call_id, |s| s.priority_tier += 1)
                .await
                .is_none()
            {
                return Ok(());
            }
            continue;
        }
        return Ok(());
    }
}

enum Pickup {
    Human,
    Machine,
}

/// Classifies a machine-detection result. An inconclusive result is
/// optimistically accepted as a person when configured, so a real answer is
/// never lost to an unreliable detector.
fn classify(answered_by: Option<&str>, treat_unknown_as_human: bool) -> Pickup {
    match answered_by {
        Some("human") => Pickup::Human,
        Some(s) if s.starts_with("machine") || s == "fax" => Pickup::Machine,
        _ if treat_unknown_as_human => Pickup::Human,
        _ => Pickup::Machine,
    }
}

/// Handles the machine-detection webhook for one outbound leg. Returns the
/// markup for that leg: a conference join when it won, a hangup otherwise.
pub async fn on_machine_detection(
    state: &AppState,
    leg_id: &str,
    answered_by: Option<&str>,
    ctx: &CallbackContext,
) -> twiml::Response {
    match classify(answered_by, state.config.dispatch.treat_unknown_as_human) {
        Pickup::Human => {
            match state.session_store.claim_winner(&ctx.session_id, leg_id).await {
                Some(claim) => {
                    info!(
                        session_id = ctx.session_id,
                        leg_id,
                        tier = ctx.priority_tier,
                        answered_by = answered_by.unwrap_or("unknown"),
                        "leg won the race"
                    );
                    for loser in &claim.losers {
                        if let Err(e) = state.provider.hangup_call(loser).await {
                            // Best effort: the sibling may already be gone.
                            debug!(leg_id = loser.as_str(), "sibling cancel failed: {}", e);
                        }
                    }
                    bridge::interpreter_join(state, &claim.session)
                }
                None => {
                    // Providers redeliver answer webhooks on transient HTTP
                    // failure; a retry for the leg that already won must get
                    // the same join markup back, not a hangup.
                    if let Some(session) =
                        state.session_store.get_by_session_id(&ctx.session_id).await
                    {
                        if session.winning_leg_id.as_deref() == Some(leg_id) {
                            debug!(
                                session_id = ctx.session_id,
                                leg_id, "duplicate pickup callback for winner, re-issuing join"
                            );
                            return bridge::interpreter_join(state, &session);
                        }
                    }
                    debug!(
                        session_id = ctx.session_id,
                        leg_id, "pickup on settled leg or decided race, hanging up"
                    );
                    twiml::Response::new().hangup()
                }
            }
        }
        Pickup::Machine => {
            info!(
                session_id = ctx.session_id,
                leg_id,
                answered_by = answered_by.unwrap_or(""),
                "answering machine detected, dropping leg"
            );
            if let Some(settled) = state
                .session_store
                .settle_leg(&ctx.session_id, leg_id, LegOutcome::Failed)
                .await
            {
                if settled.session.fallback_used {
                    // The fallback destination was a machine: nothing left.
                    give_up(state, settled.session).await;
                } else if settled.now_empty {
                    escalate(state, settled.session).await;
                }
            }
            twiml::Response::new().hangup()
        }
    }
}

/// Handles a leg status callback. Busy, failed, no-answer and canceled legs
/// never had a chance to answer; they are settled and, when the tier
/// drains, trigger exactly one escalation.
pub async fn on_leg_status(
    state: &AppState,
    leg_id: &str,
    call_status: &str,
    ctx: &CallbackContext,
) {
    let outcome = match call_status {
        "busy" | "failed" | "no-answer" => LegOutcome::Failed,
        "canceled" => LegOutcome::Canceled,
        // ringing / in-progress / completed: no engine action
        _ => return,
    };
    let Some(settled) = state
        .session_store
        .settle_leg(&ctx.session_id, leg_id, outcome)
        .await
    else {
        debug!(
            session_id = ctx.session_id,
            leg_id, call_status, "status callback for settled or unknown leg, ignoring"
        );
        return;
    };
    info!(
        session_id = ctx.session_id,
        leg_id,
        call_status,
        tier = ctx.priority_tier,
        "outbound leg ended without answer"
    );
    if settled.now_empty {
        escalate(state, settled.session).await;
    }
}

async fn escalate(state: &AppState, session: CallSession) {
    if session.fallback_used {
        give_up(state, session).await;
        return;
    }
    let inbound = session.inbound_call_id.clone();
    if state
        .session_store
        .update(&inbound, |s| s.priority_tier += 1)
        .await
        .is_some()
    {
        if let Err(e) = dispatch(state, &inbound).await {
            warn!(
                session_id = session.session_id,
                "dispatch after tier exhaustion failed: {}", e
            );
        }
    }
}

/// Terminal exhaustion: every tier and the fallback are spent. The inbound
/// caller is redirected to the could-not-connect announcement and the
/// session is finalized.
pub(crate) async fn give_up(state: &AppState, session: CallSession) {
    warn!(
        session_id = session.session_id,
        "all tiers and fallback exhausted, ending call"
    );
    let url = state.webhook_url("/webhook/unavailable", "");
    if let Err(e) = state
        .provider
        .redirect_call(&session.inbound_call_id, &url)
        .await
    {
        warn!(
            session_id = session.session_id,
            "failed to redirect caller to announcement: {}", e
        );
    }
    if let Some(session) = state.session_store.remove(&session.inbound_call_id).await {
        state.history.finalize(&session, OutcomeStatus::Unconnected);
    }
}
