//! # AMI Client
//!
//! Public entry point of the crate. An [`AmiClient`] is a cheap, cloneable
//! handle to a worker task that owns every piece of mutable client state:
//! identity, token counter, pending commands, connection lifecycle, hooks and
//! the transport.
//!
//! ```text
//! AmiClient ──[ClientAction + oneshot]──► ClientWorker ──► Transport ──► broker
//!     ▲                                      │    ▲
//!     └────────[watch<ClientStatus>]─────────┘    └──[TransportEvent]── broker
//! ```
//!
//! The worker handles one action or event at a time, so encode, decode, table
//! lookups and state transitions never race. Transport operations that finish
//! later are spawned and report back to the worker instead of blocking it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ami_mqtt_client::{AmiClient, ClientConfig, ClientHooks, ExecuteOptions};
//! use std::time::Duration;
//!
//! # async fn run(token: &str) -> Result<(), ami_mqtt_client::AmiError> {
//! let config = ClientConfig::new("wss://broker.example.org/mqtt")
//!     .with_discovery("ami/world", None);
//! let client = AmiClient::over_mqtt(config, ClientHooks::new())?;
//!
//! client.sign_in(token, None).await?;
//! client.ready(Duration::from_secs(10)).await?;
//!
//! let response = client
//!     .execute("GetUserInfo -amiLogin=?", ExecuteOptions::with_params(["jdoe"]))
//!     .await?;
//! println!("{}: {:?}", response.message, response.data);
//! # Ok(())
//! # }
//! ```

mod worker;

use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tracing::{debug, info};

use crate::command::{query, CommandResponse, ExecuteOptions};
use crate::config::ClientConfig;
use crate::error::{AmiError, TransportError};
use crate::identity::ClientIdentity;
use crate::lifecycle::ConnectionState;
use crate::pending::Outcome;
use crate::transport::mqtt::MqttTransport;
use crate::transport::{
    InboundMessage, PublishOptions, SubscribeOptions, Transport, TransportEvent,
};

use worker::ClientWorker;

const ACTION_CAPACITY: usize = 100;

pub type ConnectedHook = Box<dyn Fn(bool, &str) + Send + Sync>;
pub type ConnectionLostHook = Box<dyn Fn(&str) + Send + Sync>;
pub type MessageArrivedHook = Box<dyn Fn(&InboundMessage) + Send + Sync>;
pub type MessageDeliveredHook = Box<dyn Fn(u64) + Send + Sync>;

/// Application callbacks, invoked from the client worker.
///
/// - `on_connected(reconnect, endpoint)` once the client is ready to execute commands
/// - `on_connection_lost(message)` when the connection drops with an error
/// - `on_message_arrived(message)` for every message that is neither a discovery
///   announcement nor a response to one of this client's commands
/// - `on_message_delivered(token)` when a published message left the client
#[derive(Default)]
pub struct ClientHooks {
    on_connected: Option<ConnectedHook>,
    on_connection_lost: Option<ConnectionLostHook>,
    on_message_arrived: Option<MessageArrivedHook>,
    on_message_delivered: Option<MessageDeliveredHook>,
}

impl ClientHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(mut self, hook: impl Fn(bool, &str) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Box::new(hook));
        self
    }

    pub fn on_connection_lost(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_connection_lost = Some(Box::new(hook));
        self
    }

    pub fn on_message_arrived(
        mut self,
        hook: impl Fn(&InboundMessage) + Send + Sync + 'static,
    ) -> Self {
        self.on_message_arrived = Some(Box::new(hook));
        self
    }

    pub fn on_message_delivered(mut self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.on_message_delivered = Some(Box::new(hook));
        self
    }

    fn connected(&self, reconnect: bool, endpoint: &str) {
        if let Some(hook) = &self.on_connected {
            hook(reconnect, endpoint);
        }
    }

    fn connection_lost(&self, message: &str) {
        if let Some(hook) = &self.on_connection_lost {
            hook(message);
        }
    }

    fn message_arrived(&self, message: &InboundMessage) {
        if let Some(hook) = &self.on_message_arrived {
            hook(message);
        }
    }

    fn message_delivered(&self, token: u64) {
        if let Some(hook) = &self.on_message_delivered {
            hook(token);
        }
    }
}

impl fmt::Debug for ClientHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHooks")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_connection_lost", &self.on_connection_lost.is_some())
            .field("on_message_arrived", &self.on_message_arrived.is_some())
            .field("on_message_delivered", &self.on_message_delivered.is_some())
            .finish()
    }
}

/// Snapshot of the client as published by the worker.
#[derive(Clone, Debug, Default)]
pub struct ClientStatus {
    pub connection_state: ConnectionState,
    pub username: Option<String>,
    pub server_name: Option<String>,
    /// Endpoint reported by the current connection
    pub connected_endpoint: Option<String>,
    /// Connections re-established by the transport after the first one
    pub reconnects: u32,
    pub last_error: Option<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub pending_commands: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

#[derive(Debug)]
enum ClientAction {
    SignIn {
        credential: String,
        server_name: Option<String>,
        response_tx: oneshot::Sender<Result<String, AmiError>>,
    },
    SignOut {
        response_tx: oneshot::Sender<String>,
    },
    Subscribe {
        topic: String,
        options: SubscribeOptions,
        response_tx: oneshot::Sender<Result<(), AmiError>>,
    },
    Unsubscribe {
        topic: String,
        options: SubscribeOptions,
        response_tx: oneshot::Sender<Result<(), AmiError>>,
    },
    Send {
        topic: String,
        payload: String,
        options: PublishOptions,
        response_tx: oneshot::Sender<Result<u64, AmiError>>,
    },
    Execute {
        command: String,
        options: ExecuteOptions,
        response_tx: oneshot::Sender<Outcome>,
    },
    SetHooks {
        hooks: ClientHooks,
    },
}

/// Handle to a running AMI MQTT client.
#[derive(Clone)]
pub struct AmiClient {
    id: String,
    endpoint: String,
    actions: mpsc::Sender<ClientAction>,
    status: watch::Receiver<ClientStatus>,
}

impl AmiClient {
    /// Starts a client worker over `transport`, whose events arrive on `events`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: ClientConfig,
        hooks: ClientHooks,
        transport: impl Transport,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let identity = ClientIdentity::generate();
        let id = identity.id().to_string();
        let endpoint = config.endpoint.clone();

        let (actions_tx, actions_rx) = mpsc::channel(ACTION_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ClientStatus::default());

        let worker = ClientWorker::new(
            config,
            identity,
            hooks,
            Box::new(transport),
            actions_rx,
            events,
            status_tx,
        );
        tokio::spawn(worker.run());

        info!("Spawned AMI client {} for {}", id, endpoint);
        Self {
            id,
            endpoint,
            actions: actions_tx,
            status: status_rx,
        }
    }

    /// Starts a client connected through rumqttc to `config.endpoint`.
    pub fn over_mqtt(config: ClientConfig, hooks: ClientHooks) -> Result<Self, AmiError> {
        let (transport, events) = MqttTransport::new(&config.endpoint, config.transport.clone())?;
        Ok(Self::spawn(config, hooks, transport, events))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ClientAction,
    ) -> Result<T, AmiError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.actions
            .send(build(response_tx))
            .await
            .map_err(|_| AmiError::WorkerClosed)?;
        response_rx.await.map_err(|_| AmiError::WorkerClosed)
    }

    /// Signs in with a bearer token and connects.
    ///
    /// Resolves with the client id once the broker accepted the connection.
    /// Without `server_name` the client learns it from the discovery topic and
    /// only becomes ready afterwards.
    pub async fn sign_in(&self, credential: &str, server_name: Option<&str>) -> Result<String, AmiError> {
        self.request(|response_tx| ClientAction::SignIn {
            credential: credential.to_string(),
            server_name: server_name.map(str::to_owned),
            response_tx,
        })
        .await?
    }

    /// Disconnects; always resolves with the client id.
    pub async fn sign_out(&self) -> String {
        match self
            .request(|response_tx| ClientAction::SignOut { response_tx })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                debug!("Sign-out without worker: {}", e);
                self.id.clone()
            }
        }
    }

    pub async fn subscribe(&self, topic: &str, options: SubscribeOptions) -> Result<(), AmiError> {
        self.request(|response_tx| ClientAction::Subscribe {
            topic: topic.to_string(),
            options,
            response_tx,
        })
        .await?
    }

    pub async fn unsubscribe(&self, topic: &str, options: SubscribeOptions) -> Result<(), AmiError> {
        self.request(|response_tx| ClientAction::Unsubscribe {
            topic: topic.to_string(),
            options,
            response_tx,
        })
        .await?
    }

    /// Publishes a plain message and returns its delivery token.
    pub async fn send(
        &self,
        topic: &str,
        payload: &str,
        options: PublishOptions,
    ) -> Result<u64, AmiError> {
        self.request(|response_tx| ClientAction::Send {
            topic: topic.to_string(),
            payload: payload.to_string(),
            options,
            response_tx,
        })
        .await?
    }

    /// Executes an AMI command and waits for its response.
    pub async fn execute(
        &self,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<CommandResponse, AmiError> {
        self.request(|response_tx| ClientAction::Execute {
            command: command.to_string(),
            options,
            response_tx,
        })
        .await?
    }

    /// Replaces the application callbacks.
    pub async fn set_hooks(&self, hooks: ClientHooks) -> Result<(), AmiError> {
        self.actions
            .send(ClientAction::SetHooks { hooks })
            .await
            .map_err(|_| AmiError::WorkerClosed)
    }

    /// Waits until the client is ready to execute commands.
    pub async fn ready(&self, timeout: Duration) -> Result<(), AmiError> {
        let mut status = self.status.clone();
        let waiting = async {
            status
                .wait_for(|status| status.connection_state == ConnectionState::Ready)
                .await
                .map(|_| ())
        };

        let waited = time::timeout(timeout, waiting).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(AmiError::WorkerClosed),
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64).into()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Endpoint the client was configured with.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn username(&self) -> Option<String> {
        self.status.borrow().username.clone()
    }

    pub fn server_name(&self) -> Option<String> {
        self.status.borrow().server_name.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status.borrow().connection_state
    }

    /// True while the transport connection is up, ready or not.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.connection_state(),
            ConnectionState::ConnectedUnready | ConnectionState::Ready
        )
    }

    pub fn is_ready(&self) -> bool {
        self.connection_state() == ConnectionState::Ready
    }

    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    /// Runs a dot-path query such as `.AMIMessage.info.$` over a JSON document.
    pub fn jspath<'a>(path: &str, json: &'a Value) -> Vec<&'a Value> {
        query::select(path, json)
    }
}

impl fmt::Debug for AmiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmiClient")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.connection_state())
            .finish()
    }
}
