//! Classification of inbound messages.
//!
//! Checked in order:
//! 1. discovery announcement: discovery topic, no server name yet, JSON payload with a non-empty server-name field
//! 2. command response: the client's own topic and a payload matching the response envelope
//! 3. anything else is handed to the application unchanged

use tracing::trace;

use crate::command::codec::{self, ResponseEnvelope};
use crate::transport::InboundMessage;

/// What the router needs to know about the client.
#[derive(Debug, Clone, Copy)]
pub struct RouteContext<'a> {
    pub identity_topic: &'a str,
    pub discovery_topic: Option<&'a str>,
    pub discovery_field: &'a str,
    pub server_name_known: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Discovery { server_name: String },
    Response(ResponseEnvelope),
    Other,
}

pub fn classify(message: &InboundMessage, ctx: &RouteContext<'_>) -> Route {
    if !ctx.server_name_known && ctx.discovery_topic == Some(message.topic.as_str()) {
        if let Some(server_name) = discovered_server_name(&message.payload, ctx.discovery_field) {
            return Route::Discovery { server_name };
        }
        trace!("Discovery topic message without a server name");
    }

    if message.topic == ctx.identity_topic {
        if let Some(envelope) = codec::decode(&message.payload) {
            return Route::Response(envelope);
        }
    }

    Route::Other
}

/// Reads `field` from a JSON announcement, if present and non-empty.
pub fn discovered_server_name(payload: &str, field: &str) -> Option<String> {
    let announcement: serde_json::Value = serde_json::from_str(payload).ok()?;
    announcement
        .get(field)
        .and_then(|value| value.as_str())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
}
