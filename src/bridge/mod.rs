//! Conference bridge controller: joins the caller and the winning
//! interpreter into a two-party conference and tears the session down when
//! either side leaves.
//!
//! The conference room is named after the inbound call id, so both legs
//! derive the same room without coordination.

use crate::app::AppState;
use crate::dispatch::CallbackContext;
use crate::history::OutcomeStatus;
use crate::session::CallSession;
use crate::twiml::{self, Conference};
use tracing::{debug, info};

fn conference(state: &AppState, session: &CallSession, ctx: &CallbackContext) -> Conference {
    Conference {
        room: session.inbound_call_id.clone(),
        start_on_enter: true,
        end_on_exit: true,
        record: session.routing.record_conference,
        status_callback: Some(state.webhook_url("/webhook/conference", &ctx.to_query())),
    }
}

fn context_for(session: &CallSession) -> CallbackContext {
    CallbackContext {
        session_id: session.session_id.clone(),
        priority_tier: session.priority_tier,
        fallback_used: session.fallback_used,
    }
}

/// Markup parking the inbound caller in the conference while dialing runs.
pub fn caller_join(state: &AppState, session: &CallSession) -> twiml::Response {
    let ctx = context_for(session);
    twiml::Response::new()
        .say("Please hold while we connect you to an interpreter.")
        .dial_conference(conference(state, session, &ctx))
}

/// Markup dropping the winning leg into the caller's conference.
pub fn interpreter_join(state: &AppState, session: &CallSession) -> twiml::Response {
    let ctx = context_for(session);
    twiml::Response::new()
        .say("Connecting you to the caller now.")
        .dial_conference(conference(state, session, &ctx))
}

/// Conference status callback. Only departures matter: the first participant
/// to leave ends the session, since a two-party bridge with one side gone
/// has nothing left to interpret.
pub async fn on_conference_event(state: &AppState, event: &str, ctx: &CallbackContext) {
    if event != "participant-leave" {
        debug!(session_id = ctx.session_id, event, "ignoring conference event");
        return;
    }
    let Some(session) = state.session_store.get_by_session_id(&ctx.session_id).await else {
        return;
    };
    let Some(session) = state.session_store.remove(&session.inbound_call_id).await else {
        return;
    };
    info!(
        session_id = session.session_id,
        "conference participant left, tearing down session"
    );
    let mut legs = vec![session.inbound_call_id.clone()];
    legs.extend(session.winning_leg_id.iter().cloned());
    legs.extend(session.dialed_leg_ids.iter().cloned());
    for leg in legs {
        if let Err(e) = state.provider.hangup_call(&leg).await {
            // The departed side is usually already disconnected.
            debug!(leg_id = leg, "teardown hangup failed: {}", e);
        }
    }
    let status = if session.winning_leg_id.is_some() {
        OutcomeStatus::Completed
    } else {
        OutcomeStatus::Abandoned
    };
    state.history.finalize(&session, status);
}

/// Inbound-call status callback. A caller hanging up during the IVR or
/// while dialing is still in progress abandons the session; any outstanding
/// outbound legs are canceled.
pub async fn on_inbound_call_ended(state: &AppState, inbound_call_id: &str, call_status: &str) {
    match call_status {
        "completed" | "busy" | "failed" | "no-answer" | "canceled" => {}
        _ => return,
    }
    let Some(session) = state.session_store.remove(inbound_call_id).await else {
        return;
    };
    info!(
        session_id = session.session_id,
        call_status, "inbound call ended, clearing session"
    );
    for leg in &session.dialed_leg_ids {
        if let Err(e) = state.provider.hangup_call(leg).await {
            debug!(leg_id = leg.as_str(), "cancel of outstanding leg failed: {}", e);
        }
    }
    let status = if session.winning_leg_id.is_some() {
        OutcomeStatus::Completed
    } else {
        OutcomeStatus::Abandoned
    };
    state.history.finalize(&session, status);
}
