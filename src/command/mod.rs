//! AMI command protocol: request options, response values and the wire codec.

pub mod codec;
pub mod query;

use serde_json::Value;
use std::time::Duration;

use crate::transport::QoS;

pub use codec::QuotingPolicy;

/// Converter applied by the server unless a command overrides it.
pub const DEFAULT_CONVERTER: &str = "AMIXmlToJson.xsl";

/// Time a command waits for its response before it is rejected.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Per-command options for [`AmiClient::execute`](crate::client::AmiClient::execute).
///
/// Unset fields fall back to the client's command defaults.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Values for the `-name=?` placeholders, in declaration order
    pub params: Vec<Value>,
    /// Target server; `Some("")` also falls back to the signed-in server
    pub server_name: Option<String>,
    /// Converter name; `Some("")` disables server-side conversion
    pub converter: Option<String>,
    pub qos: Option<QoS>,
    pub retained: Option<bool>,
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn with_params<I, V>(params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn converter(mut self, converter: impl Into<String>) -> Self {
        self.converter = Some(converter.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    Json(Value),
    Text(String),
}

impl ResponseData {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseData::Json(value) => Some(value),
            ResponseData::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseData::Text(text) => Some(text),
            ResponseData::Json(_) => None,
        }
    }
}

/// A successfully settled command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub data: ResponseData,
    /// Info entries joined with `". "`, empty for text responses
    pub message: String,
    pub token: u64,
}
