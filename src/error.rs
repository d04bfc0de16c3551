//! Error types shared by the client, the transport binding and configuration loading.

use std::path::PathBuf;
use thiserror::Error;

use crate::lifecycle::ConnectionState;

/// Failures reported by the MQTT transport.
///
/// Carried inside [`AmiError::Transport`] whenever a connect, subscribe,
/// unsubscribe, publish or disconnect request fails.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Subscribe failed for {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Unsubscribe failed for {topic}: {reason}")]
    Unsubscribe { topic: String, reason: String },

    #[error("Publish failed for {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Disconnect failed: {0}")]
    Disconnect(String),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Transport closed")]
    Closed,
}

/// Errors surfaced by [`AmiClient`](crate::client::AmiClient) operations.
///
/// Every asynchronous client operation settles exactly once, either with its
/// value or with one of these variants. The variants map onto the outcomes a
/// caller needs to tell apart: a bad credential, a missing configuration, a
/// transport failure, a malformed reply, a timeout or a command the server
/// rejected.
#[derive(Debug, Error)]
pub enum AmiError {
    /// The bearer credential carried no readable `sub` claim
    #[error("Invalid credential: no subject found in token")]
    InvalidCredential,

    /// Neither a server name nor a discovery topic was available at sign-in
    #[error("Discovery topic is required when no server name is given")]
    DiscoveryTopicRequired,

    /// Sign-in requested while a connection is already active or in progress
    #[error("Invalid connection state for this operation: {0:?}")]
    InvalidState(ConnectionState),

    /// A command was issued before any server name was given or discovered
    #[error("Server name unknown: sign in with a server name or wait for discovery")]
    ServerNameUnknown,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The response announced a JSON body that does not parse
    #[error("Invalid response body for token {token}: {source}")]
    InvalidResponseBody {
        token: u64,
        #[source]
        source: serde_json::Error,
    },

    /// No response arrived before the command timeout elapsed
    #[error("Command {token} timed out")]
    Timeout { token: u64 },

    /// The server executed the command and reported errors
    #[error("{message}")]
    Application {
        token: u64,
        message: String,
        body: serde_json::Value,
    },

    /// The client worker task is gone
    #[error("Client worker closed")]
    WorkerClosed,
}

impl AmiError {
    /// Token of the command this error settled, if it belongs to one.
    pub fn token(&self) -> Option<u64> {
        match self {
            AmiError::InvalidResponseBody { token, .. }
            | AmiError::Timeout { token }
            | AmiError::Application { token, .. } => Some(*token),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AmiError::Timeout { .. })
    }
}

/// Errors raised while loading a [`ClientConfig`](crate::config::ClientConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
