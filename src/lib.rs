//! Client for AMI servers reachable over MQTT.
//!
//! Commands are published as `AMI-COMMAND` messages to
//! `ami/<server>/command/<converter>`; responses come back as `AMI-RESPONSE`
//! messages on the client's own topic and are matched to their caller by a
//! numeric token. See [`AmiClient`] for the entry point.

pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod pending;
pub mod router;
pub mod transport;

pub use client::{AmiClient, ClientHooks, ClientStatus};
pub use command::{CommandResponse, ExecuteOptions, QuotingPolicy, ResponseData};
pub use config::ClientConfig;
pub use error::{AmiError, ConfigError, TransportError};
pub use lifecycle::ConnectionState;
pub use transport::{
    InboundMessage, PublishOptions, QoS, SubscribeOptions, Transport, TransportEvent,
};
