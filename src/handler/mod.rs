//! Webhook surface: every provider callback enters here and is translated
//! into engine operations. Call-progress webhooks answer with markup;
//! fire-only status webhooks always answer 200 with an empty document so
//! the provider never retries into a torn-down call.

use crate::app::AppState;
use crate::bridge;
use crate::dispatch::{self, CallbackContext};
use crate::ivr::{self, GatherState, GatherStep};
use crate::session::CallSession;
use crate::twiml;
use axum::extract::{Form, Path, Query, State};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use tracing::{error, info, warn};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhook/incoming", post(incoming_call))
        .route("/webhook/gather/{step}", post(gather))
        .route("/webhook/dial", post(dial_trigger))
        .route("/webhook/amd", post(machine_detection))
        .route("/webhook/leg-status", post(leg_status))
        .route("/webhook/inbound-status", post(inbound_status))
        .route("/webhook/conference", post(conference_event))
        .route("/webhook/unavailable", post(unavailable))
}

#[derive(Debug, Deserialize)]
pub struct IncomingCallForm {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub struct GatherForm {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "Digits")]
    pub digits: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DialForm {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
}

#[derive(Debug, Deserialize)]
pub struct AmdForm {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "AnsweredBy")]
    pub answered_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusForm {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    pub call_status: String,
}

#[derive(Debug, Deserialize)]
pub struct ConferenceForm {
    #[serde(rename = "StatusCallbackEvent")]
    pub event: Option<String>,
}

/// New inbound call. Looks up routing for the dialed number, creates the
/// session, and starts the IVR.
async fn incoming_call(
    State(state): State<AppState>,
    Form(form): Form<IncomingCallForm>,
) -> twiml::Response {
    match state.routing.config_for(&form.to).await {
        Ok(Some(routing)) => {
            let session = CallSession::new(&form.call_sid, &form.to, &form.from, routing.clone());
            info!(
                session_id = session.session_id,
                inbound_call_id = form.call_sid,
                called_number = form.to,
                "inbound call accepted"
            );
            state.session_store.insert(session.clone()).await;
            state.history.mirror(&session);

            let mut markup = twiml::Response::new();
            if let Some(greeting) = &routing.greeting {
                markup = markup.say(greeting);
            }
            markup.append(ivr::advance(&state, &form.call_sid).await)
        }
        Ok(None) => {
            warn!(called_number = form.to, "no routing configured for number");
            ivr::terminal_apology(ivr::APOLOGY)
        }
        Err(e) => {
            error!(called_number = form.to, "routing lookup failed: {}", e);
            ivr::terminal_apology(ivr::APOLOGY)
        }
    }
}

/// Digits (or silence) posted back for one gather step.
async fn gather(
    State(state): State<AppState>,
    Path(step): Path<String>,
    Query(gather_state): Query<GatherState>,
    Form(form): Form<GatherForm>,
) -> twiml::Response {
    let Ok(step) = step.parse::<GatherStep>() else {
        warn!(step, "unknown gather step");
        return ivr::terminal_apology(ivr::APOLOGY);
    };
    let Some(session) = state.session_store.get(&form.call_sid).await else {
        warn!(inbound_call_id = form.call_sid, "gather for unknown call");
        return ivr::terminal_apology(ivr::APOLOGY);
    };
    ivr::handle_gather(&state, session, step, form.digits, gather_state).await
}

/// IVR complete: parks the caller in the conference and starts dialing in
/// the background so the hold markup is returned immediately.
async fn dial_trigger(
    State(state): State<AppState>,
    Form(form): Form<DialForm>,
) -> twiml::Response {
    let Some(session) = state.session_store.get(&form.call_sid).await else {
        return ivr::terminal_apology(ivr::APOLOGY);
    };
    let dial_state = state.clone();
    let inbound = form.call_sid.clone();
    tokio::spawn(async move {
        if let Err(e) = dispatch::dispatch(&dial_state, &inbound).await {
            error!(inbound_call_id = inbound, "dispatch failed: {}", e);
        }
    });
    bridge::caller_join(&state, &session)
}

/// Machine-detection result for one outbound leg.
async fn machine_detection(
    State(state): State<AppState>,
    Query(ctx): Query<CallbackContext>,
    Form(form): Form<AmdForm>,
) -> twiml::Response {
    dispatch::on_machine_detection(&state, &form.call_sid, form.answered_by.as_deref(), &ctx).await
}

async fn leg_status(
    State(state): State<AppState>,
    Query(ctx): Query<CallbackContext>,
    Form(form): Form<StatusForm>,
) -> twiml::Response {
    dispatch::on_leg_status(&state, &form.call_sid, &form.call_status, &ctx).await;
    twiml::Response::new()
}

async fn inbound_status(
    State(state): State<AppState>,
    Form(form): Form<StatusForm>,
) -> twiml::Response {
    bridge::on_inbound_call_ended(&state, &form.call_sid, &form.call_status).await;
    twiml::Response::new()
}

async fn conference_event(
    State(state): State<AppState>,
    Query(ctx): Query<CallbackContext>,
    Form(form): Form<ConferenceForm>,
) -> twiml::Response {
    bridge::on_conference_event(&state, form.event.as_deref().unwrap_or(""), &ctx).await;
    twiml::Response::new()
}

/// Terminal announcement the inbound call is redirected to when no
/// interpreter could be reached.
async fn unavailable() -> twiml::Response {
    ivr::terminal_apology(ivr::UNAVAILABLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{TestDirectory, TestEnv, TEST_CALLER, TEST_NUMBER};
    use crate::history::{CallOutcomeRecord, HistoryReceiver, OutcomeStatus};
    use crate::twiml::Verb;
    use std::time::Duration;

    fn incoming(call_sid: &str, to: &str) -> Form<IncomingCallForm> {
        Form(IncomingCallForm {
            call_sid: call_sid.to_string(),
            from: TEST_CALLER.to_string(),
            to: to.to_string(),
        })
    }

    fn digits(call_sid: &str, value: &str) -> Form<GatherForm> {
        Form(GatherForm {
            call_sid: call_sid.to_string(),
            digits: Some(value.to_string()),
        })
    }

    fn conference_room(markup: &twiml::Response) -> Option<String> {
        markup.verbs().iter().find_map(|v| match v {
            Verb::Dial { conference } => Some(conference.room.clone()),
            _ => None,
        })
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// Skips past mirror writes to the final outcome record.
    async fn final_record(rx: &mut HistoryReceiver) -> CallOutcomeRecord {
        loop {
            let record = rx.recv().await.unwrap();
            if record.status != OutcomeStatus::InProgress {
                return record;
            }
        }
    }

    #[tokio::test]
    async fn test_full_call_reaches_conference_and_records_outcome() {
        let mut env = TestEnv::builder()
            .directory(
                TestDirectory::default()
                    .languages(&[("es", "Spanish", "1"), ("en", "English", "2")])
                    .access_code("ac1", "4321")
                    .always_available_interpreter("i-a", 2, "+15553001"),
            )
            .code_gate(true)
            .min_billable_secs(0)
            .build()
            .await;

        // Inbound call: the code gate prompts first.
        let markup = incoming_call(State(env.state.clone()), incoming("CA-in", TEST_NUMBER)).await;
        assert!(markup.to_xml().contains("/webhook/gather/access_code"));

        // Valid code advances to the two-language source menu.
        let markup = gather(
            State(env.state.clone()),
            Path("access_code".to_string()),
            Query(GatherState::default()),
            digits("CA-in", "4321"),
        )
        .await;
        assert!(markup.to_xml().contains("/webhook/gather/source_language"));

        // Selecting the source leaves one target, which auto-selects, so the
        // call goes straight to the dial phase.
        let markup = gather(
            State(env.state.clone()),
            Path("source_language".to_string()),
            Query(GatherState::default()),
            digits("CA-in", "1"),
        )
        .await;
        assert!(markup.to_xml().contains("/webhook/dial"));

        // The caller is parked in a conference named after the inbound call
        // while dispatch runs in the background.
        let markup = dial_trigger(
            State(env.state.clone()),
            Form(DialForm {
                call_sid: "CA-in".to_string(),
            }),
        )
        .await;
        assert_eq!(conference_room(&markup).as_deref(), Some("CA-in"));

        // Tier 1 is empty; dispatch escalates to the tier-2 interpreter.
        let provider = env.provider.clone();
        wait_until(move || provider.placed().len() == 1).await;
        let session = env.state.session_store.get("CA-in").await.unwrap();
        assert_eq!(session.priority_tier, 2);

        // The interpreter answers as a human and joins the same room.
        let ctx = CallbackContext {
            session_id: session.session_id.clone(),
            priority_tier: 2,
            fallback_used: false,
        };
        let markup = machine_detection(
            State(env.state.clone()),
            Query(ctx.clone()),
            Form(AmdForm {
                call_sid: "leg-1".to_string(),
                answered_by: Some("human".to_string()),
            }),
        )
        .await;
        assert_eq!(conference_room(&markup).as_deref(), Some("CA-in"));

        // Either side leaving tears the session down and records the call.
        conference_event(
            State(env.state.clone()),
            Query(ctx),
            Form(ConferenceForm {
                event: Some("participant-leave".to_string()),
            }),
        )
        .await;
        assert!(env.state.session_store.get("CA-in").await.is_none());

        let record = final_record(&mut env.history_rx).await;
        assert_eq!(record.status, OutcomeStatus::Completed);
        assert_eq!(record.interpreter_id.as_deref(), Some("i-a"));
        assert_eq!(record.source_language.as_deref(), Some("Spanish"));
        assert_eq!(record.target_language.as_deref(), Some("English"));
        assert_eq!(record.caller_number, TEST_CALLER);
    }

    #[tokio::test]
    async fn test_exhausted_directory_falls_back_then_gives_up() {
        let mut env = TestEnv::builder()
            .directory(
                TestDirectory::default()
                    .languages(&[("es", "Spanish", "1"), ("en", "English", "2")]),
            )
            .fallback("+15550777")
            .min_billable_secs(0)
            .build()
            .await;

        incoming_call(State(env.state.clone()), incoming("CA-in", TEST_NUMBER)).await;
        gather(
            State(env.state.clone()),
            Path("source_language".to_string()),
            Query(GatherState::default()),
            digits("CA-in", "1"),
        )
        .await;
        dial_trigger(
            State(env.state.clone()),
            Form(DialForm {
                call_sid: "CA-in".to_string(),
            }),
        )
        .await;

        // Every tier is empty, so the fallback number is dialed once.
        let provider = env.provider.clone();
        wait_until(move || provider.placed().len() == 1).await;
        assert_eq!(env.provider.placed()[0].to, "+15550777");
        let session = env.state.session_store.get("CA-in").await.unwrap();
        assert!(session.fallback_used);

        // The fallback does not answer: the caller is redirected to the
        // terminal announcement and the session ends unconnected.
        let ctx = CallbackContext {
            session_id: session.session_id.clone(),
            priority_tier: 6,
            fallback_used: true,
        };
        leg_status(
            State(env.state.clone()),
            Query(ctx),
            Form(StatusForm {
                call_sid: "leg-1".to_string(),
                call_status: "no-answer".to_string(),
            }),
        )
        .await;

        assert_eq!(env.provider.placed().len(), 1);
        let redirects = env.provider.redirected();
        assert_eq!(redirects.len(), 1);
        assert!(redirects[0].1.contains("/webhook/unavailable"));
        assert!(env.state.session_store.get("CA-in").await.is_none());

        let record = final_record(&mut env.history_rx).await;
        assert_eq!(record.status, OutcomeStatus::Unconnected);
        assert!(record.interpreter_id.is_none());
    }

    #[tokio::test]
    async fn test_unprovisioned_number_gets_apology_without_session() {
        let env = TestEnv::builder()
            .directory(TestDirectory::default())
            .build()
            .await;

        let markup = incoming_call(State(env.state.clone()), incoming("CA-x", "+15559999")).await;
        let xml = markup.to_xml();
        assert!(xml.contains("<Hangup/>"));
        assert!(env.state.session_store.get("CA-x").await.is_none());
    }

    #[tokio::test]
    async fn test_caller_hangup_during_ivr_abandons() {
        let mut env = TestEnv::builder()
            .directory(
                TestDirectory::default()
                    .languages(&[("es", "Spanish", "1"), ("en", "English", "2")]),
            )
            .min_billable_secs(0)
            .build()
            .await;

        incoming_call(State(env.state.clone()), incoming("CA-in", TEST_NUMBER)).await;
        inbound_status(
            State(env.state.clone()),
            Form(StatusForm {
                call_sid: "CA-in".to_string(),
                call_status: "completed".to_string(),
            }),
        )
        .await;

        assert!(env.state.session_store.get("CA-in").await.is_none());
        let record = final_record(&mut env.history_rx).await;
        assert_eq!(record.status, OutcomeStatus::Abandoned);
    }

    #[tokio::test]
    async fn test_unavailable_announcement_is_terminal() {
        let markup = unavailable().await;
        let xml = markup.to_xml();
        assert!(xml.contains("no interpreter could be reached"));
        assert!(xml.contains("<Hangup/>"));
    }
}
