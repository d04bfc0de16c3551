//! Wire encoding of AMI commands and decoding of their responses.
//!
//! Outbound payload:
//!
//! ```text
//! AMI-COMMAND<token,"clientId","username">commandText
//! ```
//!
//! published on `ami/<serverName>/command/<converter>`. Placeholders of the
//! form `-name=?` in the command text are filled left to right from the
//! parameter list.
//!
//! Inbound payload:
//!
//! ```text
//! AMI-RESPONSE<token,true|false>body
//! ```
//!
//! where the body runs to the end of the payload, newlines included.
//!
//! # Parameter quoting
//!
//! [`QuotingPolicy::Always`] renders every value as text and wraps it in double
//! quotes, escaping backslashes, newlines and quotes (`-run="123"`,
//! `-name="a\"b"`). [`QuotingPolicy::Json`] writes the JSON literal, so only
//! strings end up quoted (`-run=123`, `-name="a\"b"`). `Always` is the default.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use tracing::warn;

use super::query;
use super::{CommandResponse, ResponseData};
use crate::error::AmiError;

static PARAM_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-\W*([a-zA-Z][a-zA-Z0-9]*)\W*=\W*\?").expect("placeholder pattern is valid")
});

static RESPONSE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)AMI-RESPONSE<([0-9]+),(true|false)>(.*)").expect("response pattern is valid")
});

const INFO_PATH: &str = ".AMIMessage.info.$";
const ERROR_PATH: &str = ".AMIMessage.error.$";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotingPolicy {
    #[default]
    Always,
    Json,
}

/// Envelope fields that accompany a command on the wire.
#[derive(Debug, Clone, Copy)]
pub struct CommandHeader<'a> {
    pub token: u64,
    pub client_id: &'a str,
    pub username: &'a str,
    pub server_name: &'a str,
    pub converter: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCommand {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub token: u64,
    pub is_json: bool,
    pub body: String,
}

pub fn encode(
    command: &str,
    params: &[Value],
    quoting: QuotingPolicy,
    header: &CommandHeader<'_>,
) -> EncodedCommand {
    let command = substitute_params(command, params, quoting);

    EncodedCommand {
        topic: command_topic(header.server_name, header.converter),
        payload: format!(
            "AMI-COMMAND<{},\"{}\",\"{}\">{}",
            header.token, header.client_id, header.username, command
        ),
    }
}

pub fn command_topic(server_name: &str, converter: &str) -> String {
    format!("ami/{}/command/{}", server_name, converter)
}

/// Trims `command` and fills its `-name=?` placeholders in declaration order.
///
/// Placeholders left over once `params` is exhausted stay untouched.
pub fn substitute_params(command: &str, params: &[Value], quoting: QuotingPolicy) -> String {
    let mut values = params.iter();
    let mut exhausted = false;

    let substituted = PARAM_PATTERN.replace_all(command.trim(), |caps: &regex::Captures| {
        match values.next() {
            Some(value) => format!("-{}={}", &caps[1], render_value(value, quoting)),
            None => {
                exhausted = true;
                caps[0].to_string()
            }
        }
    });

    if exhausted {
        warn!(
            "Parameter list exhausted after {} values, remaining placeholders left as-is",
            params.len()
        );
    }

    substituted.into_owned()
}

fn render_value(value: &Value, quoting: QuotingPolicy) -> String {
    match quoting {
        QuotingPolicy::Always => {
            let text = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            format!("\"{}\"", escape(&text))
        }
        QuotingPolicy::Json => value.to_string(),
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '"' => escaped.push_str("\\\""),
            '\'' => escaped.push_str("\\'"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Parses a response envelope; `None` means the payload is not a command response.
pub fn decode(payload: &str) -> Option<ResponseEnvelope> {
    let caps = RESPONSE_PATTERN.captures(payload)?;
    let token = caps[1].parse().ok()?;

    Some(ResponseEnvelope {
        token,
        is_json: &caps[2] == "true",
        body: caps[3].to_string(),
    })
}

impl ResponseEnvelope {
    /// Classifies the response as a resolved or rejected command outcome.
    ///
    /// JSON bodies carrying any `.AMIMessage.error.$` entries reject with the
    /// entries joined by `". "`; otherwise the `.AMIMessage.info.$` entries
    /// form the message. Text bodies resolve verbatim with an empty message.
    pub fn into_outcome(self) -> Result<CommandResponse, AmiError> {
        let token = self.token;

        if !self.is_json {
            return Ok(CommandResponse {
                data: ResponseData::Text(self.body),
                message: String::new(),
                token,
            });
        }

        let body: Value = serde_json::from_str(&self.body)
            .map_err(|source| AmiError::InvalidResponseBody { token, source })?;

        let errors = query::select_strings(ERROR_PATH, &body);
        if !errors.is_empty() {
            return Err(AmiError::Application {
                token,
                message: errors.join(". "),
                body,
            });
        }

        let info = query::select_strings(INFO_PATH, &body);
        Ok(CommandResponse {
            data: ResponseData::Json(body),
            message: info.join(". "),
            token,
        })
    }
}
