//! Client worker: the single task that owns and mutates client state.

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::{ClientAction, ClientHooks, ClientStatus};
use crate::command::codec::{self, CommandHeader};
use crate::command::ExecuteOptions;
use crate::config::ClientConfig;
use crate::error::{AmiError, TransportError};
use crate::identity::token::TokenGenerator;
use crate::identity::{self, ClientIdentity};
use crate::lifecycle::{ConnectionState, Lifecycle, LinkInfo};
use crate::pending::{Outcome, PendingTable};
use crate::router::{self, Route, RouteContext};
use crate::transport::{
    ConnectOptions, InboundMessage, OutboundMessage, PublishOptions, QoS, SubscribeOptions,
    Transport, TransportEvent, NORMAL_DISCONNECT,
};

macro_rules! respond {
    ($response_tx:expr, $result:expr) => {
        if $response_tx.send($result).is_err() {
            debug!("Caller dropped before the response was delivered");
        }
    };
}

/// Completions of spawned transport operations, fed back into the worker.
///
/// `generation` ties a completion to the connection it was started on, so
/// results from a connection that has since dropped are ignored.
#[derive(Debug)]
enum Continuation {
    Connected {
        result: Result<(), TransportError>,
        response_tx: oneshot::Sender<Result<String, AmiError>>,
    },
    IdentitySubscribed {
        generation: u64,
        result: Result<(), TransportError>,
    },
    DiscoverySubscribed {
        generation: u64,
        result: Result<(), TransportError>,
    },
}

pub(super) struct ClientWorker {
    config: ClientConfig,
    identity: ClientIdentity,
    tokens: TokenGenerator,
    pending: PendingTable,
    lifecycle: Lifecycle,
    hooks: ClientHooks,
    transport: Box<dyn Transport>,
    actions: mpsc::Receiver<ClientAction>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    continuation_tx: mpsc::UnboundedSender<Continuation>,
    continuations: mpsc::UnboundedReceiver<Continuation>,
    status: watch::Sender<ClientStatus>,
    generation: u64,
}

impl ClientWorker {
    pub(super) fn new(
        config: ClientConfig,
        identity: ClientIdentity,
        hooks: ClientHooks,
        transport: Box<dyn Transport>,
        actions: mpsc::Receiver<ClientAction>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        status: watch::Sender<ClientStatus>,
    ) -> Self {
        let (continuation_tx, continuations) = mpsc::unbounded_channel();
        let lifecycle = Lifecycle::new(identity.id());

        Self {
            config,
            identity,
            tokens: TokenGenerator::new(),
            pending: PendingTable::new(),
            lifecycle,
            hooks,
            transport,
            actions,
            transport_events,
            continuation_tx,
            continuations,
            status,
            generation: 0,
        }
    }

    /// Processes actions, transport events, completions and command deadlines
    /// until every client handle is dropped.
    pub(super) async fn run(mut self) {
        info!("Client worker {} started", self.identity.id());

        loop {
            tokio::select! {
                action = self.actions.recv() => match action {
                    Some(action) => self.handle_action(action),
                    None => break,
                },
                Some(event) = self.transport_events.recv() => self.handle_transport_event(event),
                Some(continuation) = self.continuations.recv() => self.handle_continuation(continuation),
                Some(token) = self.pending.next_expired() => {
                    debug!("Removed expired command {}", token);
                    self.publish_status();
                }
            }
        }

        if !self.pending.is_empty() {
            warn!(
                "Client worker stopping with {} commands still pending",
                self.pending.len()
            );
        }
        info!("Client worker {} stopped", self.identity.id());
    }

    fn handle_action(&mut self, action: ClientAction) {
        match action {
            ClientAction::SignIn {
                credential,
                server_name,
                response_tx,
            } => self.sign_in(credential, server_name, response_tx),
            ClientAction::SignOut { response_tx } => {
                self.sign_out();
                respond!(response_tx, self.identity.id().to_string());
            }
            ClientAction::Subscribe {
                topic,
                options,
                response_tx,
            } => {
                debug!("Subscribing to {}", topic);
                let subscribing = self.transport.subscribe(&topic, options);
                tokio::spawn(async move {
                    respond!(response_tx, subscribing.await.map_err(AmiError::from));
                });
            }
            ClientAction::Unsubscribe {
                topic,
                options,
                response_tx,
            } => {
                debug!("Unsubscribing from {}", topic);
                let unsubscribing = self.transport.unsubscribe(&topic, options);
                tokio::spawn(async move {
                    respond!(response_tx, unsubscribing.await.map_err(AmiError::from));
                });
            }
            ClientAction::Send {
                topic,
                payload,
                options,
                response_tx,
            } => {
                let result = self.publish(topic, payload, options);
                respond!(response_tx, result.map_err(AmiError::from));
            }
            ClientAction::Execute {
                command,
                options,
                response_tx,
            } => self.execute(command, options, response_tx),
            ClientAction::SetHooks { hooks } => {
                debug!("Replacing client hooks: {:?}", hooks);
                self.hooks = hooks;
            }
        }
    }

    fn sign_in(
        &mut self,
        credential: String,
        server_name: Option<String>,
        response_tx: oneshot::Sender<Result<String, AmiError>>,
    ) {
        let Some(username) = identity::extract_subject(&credential) else {
            warn!("Sign-in rejected: credential carries no subject");
            respond!(response_tx, Err(AmiError::InvalidCredential));
            return;
        };

        let server_name = server_name.filter(|name| !name.is_empty());
        if server_name.is_none() && self.config.discovery_topic.is_none() {
            warn!("Sign-in rejected: no server name and no discovery topic");
            respond!(response_tx, Err(AmiError::DiscoveryTopicRequired));
            return;
        }

        if let Err(state) = self.lifecycle.begin_connect() {
            warn!("Sign-in rejected in state {:?}", state);
            respond!(response_tx, Err(AmiError::InvalidState(state)));
            return;
        }

        info!(
            "Signing in as {} (server: {})",
            username,
            server_name.as_deref().unwrap_or("<discovery>")
        );
        self.identity.username = Some(username.clone());
        self.identity.server_name = server_name;
        self.publish_status();

        let connecting = self.transport.connect(ConnectOptions {
            client_id: self.identity.id().to_string(),
            username,
            password: credential,
        });
        let continuation_tx = self.continuation_tx.clone();
        tokio::spawn(async move {
            let result = connecting.await;
            let _ = continuation_tx.send(Continuation::Connected {
                result,
                response_tx,
            });
        });
    }

    fn sign_out(&mut self) {
        info!("Signing out client {}", self.identity.id());
        if let Err(e) = self.transport.disconnect() {
            debug!("Disconnect during sign-out failed: {}", e);
        }
        self.lifecycle.on_connection_lost();
        self.publish_status();
    }

    fn publish(
        &mut self,
        topic: String,
        payload: String,
        options: PublishOptions,
    ) -> Result<u64, TransportError> {
        let token = self.tokens.next_token();
        self.transport.send(OutboundMessage {
            topic,
            payload,
            qos: options.qos,
            retained: options.retained,
            token,
        })?;

        self.status.send_modify(|status| status.messages_sent += 1);
        Ok(token)
    }

    fn execute(
        &mut self,
        command: String,
        options: ExecuteOptions,
        response_tx: oneshot::Sender<Outcome>,
    ) {
        let Some(server_name) = options
            .server_name
            .filter(|name| !name.is_empty())
            .or_else(|| self.identity.server_name.clone())
        else {
            warn!("Cannot execute '{}': server name unknown", command.trim());
            respond!(response_tx, Err(AmiError::ServerNameUnknown));
            return;
        };

        let token = self.tokens.next_token();
        let converter = options
            .converter
            .unwrap_or_else(|| self.config.command.converter.clone());

        let encoded = codec::encode(
            &command,
            &options.params,
            self.config.command.quoting,
            &CommandHeader {
                token,
                client_id: self.identity.id(),
                username: self.identity.username.as_deref().unwrap_or_default(),
                server_name: &server_name,
                converter: &converter,
            },
        );

        let message = OutboundMessage {
            topic: encoded.topic,
            payload: encoded.payload,
            qos: options.qos.unwrap_or(self.config.command.qos),
            retained: options.retained.unwrap_or(self.config.command.retained),
            token,
        };
        let topic = message.topic.clone();

        if let Err(e) = self.transport.send(message) {
            error!("Failed to send command {}: {}", token, e);
            respond!(response_tx, Err(e.into()));
            return;
        }

        let timeout = options.timeout.unwrap_or_else(|| self.config.command.timeout());
        self.pending.register(token, response_tx, timeout);
        info!("Sent command {} to {}", token, topic);

        self.status.send_modify(|status| status.messages_sent += 1);
        self.publish_status();
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected {
                reconnect,
                endpoint,
            } => self.on_connected(reconnect, endpoint),
            TransportEvent::ConnectionLost {
                error_code,
                error_message,
            } => self.on_connection_lost(error_code, error_message),
            TransportEvent::MessageArrived(message) => self.on_message_arrived(message),
            TransportEvent::MessageDelivered { token } => {
                debug!("Message {} delivered", token);
                self.hooks.message_delivered(token);
            }
        }
    }

    fn on_connected(&mut self, reconnect: bool, endpoint: String) {
        if reconnect {
            info!("Client {} reconnected to {}", self.identity.id(), endpoint);
        } else {
            info!("Client {} connected to {}", self.identity.id(), endpoint);
        }

        self.generation += 1;
        self.lifecycle.on_connected(LinkInfo {
            reconnect,
            endpoint,
        });
        self.publish_status();

        let generation = self.generation;
        let subscribing = self
            .transport
            .subscribe(self.identity.response_topic(), SubscribeOptions::default());
        let continuation_tx = self.continuation_tx.clone();
        tokio::spawn(async move {
            let result = subscribing.await;
            let _ = continuation_tx.send(Continuation::IdentitySubscribed { generation, result });
        });
    }

    fn on_connection_lost(&mut self, error_code: i32, error_message: String) {
        // Only sign-out produces a normal disconnect, so it belongs to an earlier session.
        if error_code == NORMAL_DISCONNECT
            && self.lifecycle.state() == ConnectionState::Connecting
        {
            debug!("Ignoring disconnect of a previous session");
            return;
        }

        let previous = self.lifecycle.on_connection_lost();

        if error_code == NORMAL_DISCONNECT {
            debug!("Connection closed normally (was {:?})", previous);
            self.publish_status();
            return;
        }

        warn!(
            "Client {} disconnected, cause: {}",
            self.identity.id(),
            error_message
        );
        self.status
            .send_modify(|status| status.last_error = Some(error_message.clone()));
        self.publish_status();
        self.hooks.connection_lost(&error_message);
    }

    fn on_message_arrived(&mut self, message: InboundMessage) {
        self.status.send_modify(|status| status.messages_received += 1);

        let route = router::classify(
            &message,
            &RouteContext {
                identity_topic: self.identity.response_topic(),
                discovery_topic: self.config.discovery_topic.as_deref(),
                discovery_field: &self.config.discovery_field,
                server_name_known: self.identity.server_name.is_some(),
            },
        );

        match route {
            Route::Discovery { server_name } => {
                info!("Discovered server {}", server_name);
                self.identity.server_name = Some(server_name);
                self.become_ready();
            }
            Route::Response(envelope) => {
                let token = envelope.token;
                if self.pending.settle(token, envelope.into_outcome()) {
                    debug!("Settled command {}", token);
                } else {
                    debug!("Dropping response for unknown or settled command {}", token);
                }
                self.publish_status();
            }
            Route::Other => self.hooks.message_arrived(&message),
        }
    }

    fn handle_continuation(&mut self, continuation: Continuation) {
        match continuation {
            Continuation::Connected {
                result,
                response_tx,
            } => match result {
                Ok(()) => {
                    debug!("Connect accepted for {}", self.identity.id());
                    respond!(response_tx, Ok(self.identity.id().to_string()));
                }
                Err(e) => {
                    error!("Connect failed: {}", e);
                    self.lifecycle.connect_failed();
                    self.identity.username = None;
                    self.identity.server_name = None;
                    self.status
                        .send_modify(|status| status.last_error = Some(e.to_string()));
                    self.publish_status();
                    respond!(response_tx, Err(e.into()));
                }
            },
            Continuation::IdentitySubscribed { generation, result } => {
                if generation != self.generation {
                    debug!("Ignoring identity subscription from an earlier connection");
                    return;
                }
                if let Err(e) = result {
                    warn!("Subscription to own topic failed: {}", e);
                }

                if self.identity.server_name.is_some() {
                    self.become_ready();
                } else {
                    self.start_discovery(generation);
                }
            }
            Continuation::DiscoverySubscribed { generation, result } => {
                if generation != self.generation {
                    return;
                }
                if let Err(e) = result {
                    warn!("Subscription to discovery topic failed: {}", e);
                }
                self.trigger_discovery();
            }
        }
    }

    fn start_discovery(&mut self, generation: u64) {
        let Some(topic) = self.config.discovery_topic.clone() else {
            warn!("Server name unknown and no discovery topic configured");
            return;
        };

        info!("Waiting for server announcement on {}", topic);
        let subscribing = self.transport.subscribe(&topic, SubscribeOptions::default());
        let continuation_tx = self.continuation_tx.clone();
        tokio::spawn(async move {
            let result = subscribing.await;
            let _ = continuation_tx.send(Continuation::DiscoverySubscribed { generation, result });
        });
    }

    fn trigger_discovery(&mut self) {
        if self.identity.server_name.is_some() {
            return;
        }
        let Some(trigger) = self.config.discovery_trigger_topic.clone() else {
            return;
        };

        let options = PublishOptions {
            qos: QoS::AtMostOnce,
            retained: false,
        };
        match self.publish(trigger.clone(), String::new(), options) {
            Ok(token) => debug!("Requested server announcements on {} ({})", trigger, token),
            Err(e) => warn!("Failed to request server announcements: {}", e),
        }
    }

    fn become_ready(&mut self) {
        if let Some(info) = self.lifecycle.mark_ready() {
            self.hooks.connected(info.reconnect, &info.endpoint);
            self.publish_status();
        }
    }

    fn publish_status(&self) {
        let state = self.lifecycle.state();
        let endpoint = self.lifecycle.link_info().map(|info| info.endpoint.clone());
        let reconnects = self.lifecycle.reconnects();

        self.status.send_modify(|status| {
            status.connection_state = state;
            status.username = self.identity.username.clone();
            status.server_name = self.identity.server_name.clone();
            status.connected_endpoint = endpoint;
            status.reconnects = reconnects;
            status.pending_commands = self.pending.len();
            status.last_activity = Some(chrono::Local::now());
        });
    }
}
