//! IVR prompt engine: digit collection for the access code and language
//! selection steps, with independent silence and validation retry budgets.
//!
//! Each step is optional — disabled by the routing snapshot, or skipped
//! with an auto-selected value when exactly one candidate exists. Exceeding
//! either retry budget ends the call with a spoken apology instead of
//! looping. Every resolved value is mirrored to the history recorder so a
//! record exists even if the caller hangs up before dispatch.

use crate::app::AppState;
use crate::directory::Language;
use crate::session::CallSession;
use crate::twiml::{self, Gather, Verb};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{error, info, warn};

pub const APOLOGY: &str =
    "We are sorry, we are unable to process your call at this time. Please try again later. Goodbye.";
pub const UNAVAILABLE: &str =
    "We are sorry, no interpreter could be reached at this time. Please try again later. Goodbye.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatherStep {
    AccessCode,
    SourceLanguage,
    TargetLanguage,
}

impl GatherStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatherStep::AccessCode => "access_code",
            GatherStep::SourceLanguage => "source_language",
            GatherStep::TargetLanguage => "target_language",
        }
    }
}

impl FromStr for GatherStep {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access_code" => Ok(GatherStep::AccessCode),
            "source_language" => Ok(GatherStep::SourceLanguage),
            "target_language" => Ok(GatherStep::TargetLanguage),
            other => Err(anyhow::anyhow!("unknown gather step '{}'", other)),
        }
    }
}

/// Retry counters carried on the gather action URL, so every callback is
/// self-describing.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct GatherState {
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub errors: u32,
}

impl GatherState {
    pub fn to_query(&self) -> String {
        format!("retries={}&errors={}", self.retries, self.errors)
    }
}

pub fn terminal_apology(text: &str) -> twiml::Response {
    twiml::Response::new().say(text).hangup()
}

/// Moves the session to its next unresolved step: a gather prompt, an
/// auto-selected skip, or — once everything is resolved — a redirect into
/// the dial phase.
pub async fn advance(state: &AppState, inbound_call_id: &str) -> twiml::Response {
    let Some(mut session) = state.session_store.get(inbound_call_id).await else {
        return terminal_apology(APOLOGY);
    };

    if session.routing.code_gate_enabled && session.access_code_id.is_none() {
        return prompt(state, &session, GatherStep::AccessCode, GatherState::default(), false)
            .await;
    }

    if session.source_language_id.is_none() {
        let candidates = match state.directory.source_languages(&session.called_number).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(
                    session_id = session.session_id,
                    "failed to list source languages: {}", e
                );
                return terminal_apology(APOLOGY);
            }
        };
        match resolve_language_step(state, &mut session, GatherStep::SourceLanguage, candidates)
            .await
        {
            StepResolution::Prompt(markup) => return markup,
            StepResolution::AutoSelected => {}
            StepResolution::Terminal(markup) => return markup,
        }
    }

    if session.target_language_id.is_none() {
        let source_id = session.source_language_id.clone().unwrap_or_default();
        let candidates = match state
            .directory
            .target_languages(&session.called_number, &source_id)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(
                    session_id = session.session_id,
                    "failed to list target languages: {}", e
                );
                return terminal_apology(APOLOGY);
            }
        };
        match resolve_language_step(state, &mut session, GatherStep::TargetLanguage, candidates)
            .await
        {
            StepResolution::Prompt(markup) => return markup,
            StepResolution::AutoSelected => {}
            StepResolution::Terminal(markup) => return markup,
        }
    }

    twiml::Response::new().redirect(state.webhook_url("/webhook/dial", ""))
}

enum StepResolution {
    Prompt(twiml::Response),
    AutoSelected,
    Terminal(twiml::Response),
}

async fn resolve_language_step(
    state: &AppState,
    session: &mut CallSession,
    step: GatherStep,
    candidates: Vec<Language>,
) -> StepResolution {
    match candidates.len() {
        0 => {
            error!(
                session_id = session.session_id,
                step = step.as_str(),
                called_number = session.called_number,
                "no languages configured for number"
            );
            StepResolution::Terminal(terminal_apology(APOLOGY))
        }
        1 => {
            let language = &candidates[0];
            info!(
                session_id = session.session_id,
                step = step.as_str(),
                language_id = language.id,
                "single qualifying language, auto-selecting"
            );
            let value = match step {
                GatherStep::SourceLanguage => ResolvedValue::SourceLanguage(language.id.clone()),
                _ => ResolvedValue::TargetLanguage(language.id.clone()),
            };
            let inbound = session.inbound_call_id.clone();
            match state.session_store.update(&inbound, |s| value.apply(s)).await {
                Some(updated) => {
                    state.history.mirror(&updated);
                    *session = updated;
                    StepResolution::AutoSelected
                }
                None => StepResolution::Terminal(terminal_apology(APOLOGY)),
            }
        }
        _ => {
            StepResolution::Prompt(
                prompt(state, session, step, GatherState::default(), false).await,
            )
        }
    }
}

/// Handles the digits (or silence) posted back for one gather step.
pub async fn handle_gather(
    state: &AppState,
    session: CallSession,
    step: GatherStep,
    digits: Option<String>,
    mut gather_state: GatherState,
) -> twiml::Response {
    let cfg = &state.config.ivr;
    let digits = digits.unwrap_or_default();

    if digits.is_empty() {
        gather_state.retries += 1;
        if gather_state.retries > session.max_silence_retries(cfg) {
            warn!(
                session_id = session.session_id,
                step = step.as_str(),
                "silence retries exhausted"
            );
            return terminal_apology(APOLOGY);
        }
        return prompt(state, &session, step, gather_state, false).await;
    }

    match validate(state, &session, step, &digits).await {
        Some(value) => {
            let inbound = session.inbound_call_id.clone();
            match state.session_store.update(&inbound, |s| value.apply(s)).await {
                Some(updated) => {
                    state.history.mirror(&updated);
                    advance(state, &inbound).await
                }
                None => terminal_apology(APOLOGY),
            }
        }
        None => {
            gather_state.errors += 1;
            if gather_state.errors > session.max_invalid_retries(cfg) {
                warn!(
                    session_id = session.session_id,
                    step = step.as_str(),
                    "validation retries exhausted"
                );
                return terminal_apology(APOLOGY);
            }
            prompt(state, &session, step, gather_state, true).await
        }
    }
}

enum ResolvedValue {
    AccessCode(String),
    SourceLanguage(String),
    TargetLanguage(String),
}

impl ResolvedValue {
    fn apply(&self, session: &mut CallSession) {
        match self {
            ResolvedValue::AccessCode(id) => session.access_code_id = Some(id.clone()),
            ResolvedValue::SourceLanguage(id) => session.source_language_id = Some(id.clone()),
            ResolvedValue::TargetLanguage(id) => session.target_language_id = Some(id.clone()),
        }
    }
}

async fn validate(
    state: &AppState,
    session: &CallSession,
    step: GatherStep,
    digits: &str,
) -> Option<ResolvedValue> {
    match step {
        GatherStep::AccessCode => {
            match state
                .directory
                .verify_access_code(&session.called_number, digits)
                .await
            {
                Ok(Some(code)) => Some(ResolvedValue::AccessCode(code.id)),
                Ok(None) => None,
                Err(e) => {
                    warn!(
                        session_id = session.session_id,
                        "access code verification failed: {}", e
                    );
                    None
                }
            }
        }
        GatherStep::SourceLanguage => {
            let candidates = language_candidates(state, session, step).await;
            candidates
                .into_iter()
                .find(|l| l.digit == digits)
                .map(|l| ResolvedValue::SourceLanguage(l.id))
        }
        GatherStep::TargetLanguage => {
            let candidates = language_candidates(state, session, step).await;
            candidates
                .into_iter()
                .find(|l| l.digit == digits)
                .map(|l| ResolvedValue::TargetLanguage(l.id))
        }
    }
}

async fn language_candidates(
    state: &AppState,
    session: &CallSession,
    step: GatherStep,
) -> Vec<Language> {
    let result = match step {
        GatherStep::TargetLanguage => {
            let source_id = session.source_language_id.clone().unwrap_or_default();
            state
                .directory
                .target_languages(&session.called_number, &source_id)
                .await
        }
        _ => state.directory.source_languages(&session.called_number).await,
    };
    match result {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!(
                session_id = session.session_id,
                step = step.as_str(),
                "language lookup failed: {}", e
            );
            Vec::new()
        }
    }
}

async fn prompt(
    state: &AppState,
    session: &CallSession,
    step: GatherStep,
    gather_state: GatherState,
    error_variant: bool,
) -> twiml::Response {
    let cfg = &state.config.ivr;
    let text = match step {
        GatherStep::AccessCode => session
            .routing
            .code_prompt
            .clone()
            .unwrap_or_else(|| "Please enter your access code.".to_string()),
        GatherStep::SourceLanguage => {
            let base = session
                .routing
                .source_prompt
                .clone()
                .unwrap_or_else(|| "Please select the language of your conversation.".to_string());
            menu_text(&base, &language_candidates(state, session, step).await)
        }
        GatherStep::TargetLanguage => {
            let base = session
                .routing
                .target_prompt
                .clone()
                .unwrap_or_else(|| "Please select the language to interpret into.".to_string());
            menu_text(&base, &language_candidates(state, session, step).await)
        }
    };
    let text = if error_variant {
        match step {
            GatherStep::AccessCode => format!("That access code was not recognized. {}", text),
            _ => format!("That selection was not recognized. {}", text),
        }
    } else {
        text
    };

    let num_digits = match step {
        GatherStep::AccessCode => cfg.max_digits,
        _ => 1,
    };
    twiml::Response::new().gather(Gather {
        action: state.webhook_url(
            &format!("/webhook/gather/{}", step.as_str()),
            &gather_state.to_query(),
        ),
        num_digits: Some(num_digits),
        timeout_secs: cfg.digit_timeout_secs,
        prompts: vec![Verb::Say { text }],
    })
}

fn menu_text(base: &str, candidates: &[Language]) -> String {
    let mut text = base.to_string();
    for language in candidates {
        text.push_str(&format!(" For {}, press {}.", language.name, language.digit));
    }
    text
}
