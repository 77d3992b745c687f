//! Call-control markup returned to the telephony provider.
//!
//! Every webhook response that continues a call must be a valid markup
//! document; fire-only webhooks return an empty `<Response/>`.

use axum::http::header;
use axum::response::IntoResponse;

#[derive(Debug, Clone, PartialEq)]
pub enum Verb {
    Say { text: String },
    Gather(Gather),
    Dial { conference: Conference },
    Redirect { url: String },
    Hangup,
}

/// Digit-collection verb. The action URL is invoked with the collected
/// digits; with `action_on_empty_result` the provider also invokes it on
/// input timeout, which is how silence surfaces to the IVR engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Gather {
    pub action: String,
    pub num_digits: Option<u32>,
    pub timeout_secs: u32,
    pub prompts: Vec<Verb>,
}

/// Two-party conference room. `end_on_exit` makes either participant's
/// departure end the conference for both.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Conference {
    pub room: String,
    pub start_on_enter: bool,
    pub end_on_exit: bool,
    pub record: bool,
    pub status_callback: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    verbs: Vec<Verb>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn say(mut self, text: impl Into<String>) -> Self {
        self.verbs.push(Verb::Say { text: text.into() });
        self
    }

    pub fn gather(mut self, gather: Gather) -> Self {
        self.verbs.push(Verb::Gather(gather));
        self
    }

    pub fn dial_conference(mut self, conference: Conference) -> Self {
        self.verbs.push(Verb::Dial { conference });
        self
    }

    pub fn redirect(mut self, url: impl Into<String>) -> Self {
        self.verbs.push(Verb::Redirect { url: url.into() });
        self
    }

    pub fn hangup(mut self) -> Self {
        self.verbs.push(Verb::Hangup);
        self
    }

    pub fn append(mut self, other: Response) -> Self {
        self.verbs.extend(other.verbs);
        self
    }

    pub fn verbs(&self) -> &[Verb] {
        &self.verbs
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response>");
        for verb in &self.verbs {
            render_verb(&mut out, verb);
        }
        out.push_str("</Response>");
        out
    }
}

fn render_verb(out: &mut String, verb: &Verb) {
    match verb {
        Verb::Say { text } => {
            out.push_str("<Say>");
            out.push_str(&escape_text(text));
            out.push_str("</Say>");
        }
        Verb::Gather(gather) => {
            out.push_str(&format!(
                "<Gather action=\"{}\" method=\"POST\" timeout=\"{}\" actionOnEmptyResult=\"true\"",
                escape_attr(&gather.action),
                gather.timeout_secs
            ));
            if let Some(n) = gather.num_digits {
                out.push_str(&format!(" numDigits=\"{}\"", n));
            }
            out.push('>');
            for prompt in &gather.prompts {
                render_verb(out, prompt);
            }
            out.push_str("</Gather>");
        }
        Verb::Dial { conference } => {
            out.push_str("<Dial><Conference");
            out.push_str(&format!(
                " startConferenceOnEnter=\"{}\" endConferenceOnExit=\"{}\"",
                conference.start_on_enter, conference.end_on_exit
            ));
            if conference.record {
                out.push_str(" record=\"record-from-start\"");
            }
            if let Some(url) = &conference.status_callback {
                out.push_str(&format!(
                    " statusCallback=\"{}\" statusCallbackEvent=\"leave\"",
                    escape_attr(url)
                ));
            }
            out.push('>');
            out.push_str(&escape_text(&conference.room));
            out.push_str("</Conference></Dial>");
        }
        Verb::Redirect { url } => {
            out.push_str("<Redirect method=\"POST\">");
            out.push_str(&escape_text(url));
            out.push_str("</Redirect>");
        }
        Verb::Hangup => {
            out.push_str("<Hangup/>");
        }
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}

impl IntoResponse for Response {
    fn into_response(self) -> axum::response::Response {
        (
            [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
            self.to_xml(),
        )
            .into_response()
    }
}
