//! # Transport Interface
//!
//! The command layer sits on top of an MQTT client it does not implement. This
//! module names exactly what it consumes from that client:
//!
//! - requests: connect, disconnect, subscribe, unsubscribe, send
//! - events: connected, connection lost, message arrived, message delivered
//!
//! ```text
//! AmiClient worker ──[Transport requests]──► MQTT binding ──► broker
//!        ▲                                        │
//!        └──────────[TransportEvent channel]──────┘
//! ```
//!
//! Requests that complete later (connect, subscribe, unsubscribe) return a
//! boxed future the worker spawns, so the worker loop itself never waits on the
//! network. Events flow back on an unbounded channel created alongside the
//! transport.
//!
//! [`mqtt::MqttTransport`] is the rumqttc-backed implementation; tests drive
//! the client through an in-memory one.

pub mod mqtt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::TransportError;

/// Error code reported with a client-requested disconnect.
pub const NORMAL_DISCONNECT: i32 = 0;

/// Error code reported when the broker connection drops unexpectedly.
pub const CONNECTION_LOST: i32 = 8;

/// MQTT quality of service level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("Invalid QoS level: {}", other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub qos: QoS,
    pub timeout: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retained: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retained: bool,
    /// Correlation token reported back in [`TransportEvent::MessageDelivered`]
    pub token: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retained: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { reconnect: bool, endpoint: String },
    ConnectionLost { error_code: i32, error_message: String },
    MessageArrived(InboundMessage),
    MessageDelivered { token: u64 },
}

/// The MQTT capability the command layer is built on.
pub trait Transport: Send + 'static {
    /// Starts connecting; the future settles once the broker accepted or refused.
    fn connect(&mut self, options: ConnectOptions) -> BoxFuture<'static, Result<(), TransportError>>;

    fn disconnect(&mut self) -> Result<(), TransportError>;

    fn subscribe(
        &mut self,
        topic: &str,
        options: SubscribeOptions,
    ) -> BoxFuture<'static, Result<(), TransportError>>;

    fn unsubscribe(
        &mut self,
        topic: &str,
        options: SubscribeOptions,
    ) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Queues a message for publication.
    fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError>;
}
