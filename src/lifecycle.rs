//! Connection lifecycle with statum state machine
//!
//! Tracks where a client stands between sign-in and readiness. The transport
//! reconnects on its own, so a connected event may also arrive while
//! Disconnected.
//!
//! # State Machine
//!
//! ```text
//!                 sign-in            connected          subscribed/discovered
//! Disconnected ───────────► Connecting ───────► ConnectedUnready ───────────► Ready
//!      ▲  ▲                     │                    │    ▲                    │
//!      │  └─────────────────────┘ connect failed      │    │ reconnected        │
//!      │                                              │    │                    │
//!      └──────────────────── connection lost ◄────────┴────┴────────────────────┘
//! ```
//!
//! [`Link`] enforces the allowed transitions at compile time; [`Lifecycle`]
//! holds whichever state is current so the worker can drive it from runtime
//! events.

use statum::{machine, state};
use tracing::{debug, info, warn};

/// Externally visible connection state.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    ConnectedUnready,
    Ready,
}

/// Details of the connected event that opened the current connection.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct LinkInfo {
    pub reconnect: bool,
    pub endpoint: String,
}

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Disconnected,
    Connecting,
    ConnectedUnready(LinkInfo),
    Ready(LinkInfo),
}

#[machine]
#[derive(Debug)]
pub struct Link<S: LinkState> {
    client_id: String,
    reconnects: u32,
}

impl<S: LinkState> Link<S> {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Number of connected events received while not Connecting.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }
}

impl Link<Disconnected> {
    pub fn create(client_id: String) -> Self {
        Self::new(client_id, 0)
    }

    pub fn connect(self) -> Link<Connecting> {
        info!("Client {} connecting", self.client_id);
        self.transition()
    }

    pub fn reconnected(mut self, info: LinkInfo) -> Link<ConnectedUnready> {
        self.reconnects += 1;
        info!("Client {} reconnected to {}", self.client_id, info.endpoint);
        self.transition_with(info)
    }
}

impl Link<Connecting> {
    pub fn connected(self, info: LinkInfo) -> Link<ConnectedUnready> {
        info!("Client {} connected to {}", self.client_id, info.endpoint);
        self.transition_with(info)
    }

    pub fn failed(self) -> Link<Disconnected> {
        warn!("Client {} failed to connect", self.client_id);
        self.transition()
    }
}

impl Link<ConnectedUnready> {
    pub fn ready(self) -> Link<Ready> {
        let info = self.get_state_data().cloned().unwrap_or_default();
        info!("Client {} ready on {}", self.client_id, info.endpoint);
        self.transition_with(info)
    }

    pub fn reconnected(mut self, info: LinkInfo) -> Link<ConnectedUnready> {
        self.reconnects += 1;
        debug!("Client {} connected again before becoming ready", self.client_id);
        self.transition_with(info)
    }

    pub fn lost(self) -> Link<Disconnected> {
        info!("Client {} disconnected before becoming ready", self.client_id);
        self.transition()
    }
}

impl Link<Ready> {
    pub fn reconnected(mut self, info: LinkInfo) -> Link<ConnectedUnready> {
        self.reconnects += 1;
        debug!("Client {} connected again while ready", self.client_id);
        self.transition_with(info)
    }

    pub fn lost(self) -> Link<Disconnected> {
        info!("Client {} disconnected", self.client_id);
        self.transition()
    }
}

/// The current [`Link`] state, driven by runtime events.
#[derive(Debug)]
pub enum Lifecycle {
    Disconnected(Link<Disconnected>),
    Connecting(Link<Connecting>),
    ConnectedUnready(Link<ConnectedUnready>),
    Ready(Link<Ready>),
}

impl Lifecycle {
    pub fn new(client_id: impl Into<String>) -> Self {
        Lifecycle::Disconnected(Link::create(client_id.into()))
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            Lifecycle::Disconnected(_) => ConnectionState::Disconnected,
            Lifecycle::Connecting(_) => ConnectionState::Connecting,
            Lifecycle::ConnectedUnready(_) => ConnectionState::ConnectedUnready,
            Lifecycle::Ready(_) => ConnectionState::Ready,
        }
    }

    pub fn link_info(&self) -> Option<&LinkInfo> {
        match self {
            Lifecycle::ConnectedUnready(link) => link.get_state_data(),
            Lifecycle::Ready(link) => link.get_state_data(),
            _ => None,
        }
    }

    pub fn reconnects(&self) -> u32 {
        match self {
            Lifecycle::Disconnected(link) => link.reconnects(),
            Lifecycle::Connecting(link) => link.reconnects(),
            Lifecycle::ConnectedUnready(link) => link.reconnects(),
            Lifecycle::Ready(link) => link.reconnects(),
        }
    }

    fn client_id(&self) -> &str {
        match self {
            Lifecycle::Disconnected(link) => link.client_id(),
            Lifecycle::Connecting(link) => link.client_id(),
            Lifecycle::ConnectedUnready(link) => link.client_id(),
            Lifecycle::Ready(link) => link.client_id(),
        }
    }

    fn take(&mut self) -> Lifecycle {
        let placeholder = Lifecycle::new(self.client_id().to_string());
        std::mem::replace(self, placeholder)
    }

    /// Disconnected → Connecting; any other state is returned as the error.
    pub fn begin_connect(&mut self) -> Result<(), ConnectionState> {
        match self.take() {
            Lifecycle::Disconnected(link) => {
                *self = Lifecycle::Connecting(link.connect());
                Ok(())
            }
            other => {
                let state = other.state();
                *self = other;
                Err(state)
            }
        }
    }

    /// Connecting → Disconnected after a refused connect.
    pub fn connect_failed(&mut self) {
        *self = match self.take() {
            Lifecycle::Connecting(link) => Lifecycle::Disconnected(link.failed()),
            other => other,
        };
    }

    /// Any state → ConnectedUnready on a transport connected event.
    pub fn on_connected(&mut self, info: LinkInfo) {
        *self = match self.take() {
            Lifecycle::Disconnected(link) => Lifecycle::ConnectedUnready(link.reconnected(info)),
            Lifecycle::Connecting(link) => Lifecycle::ConnectedUnready(link.connected(info)),
            Lifecycle::ConnectedUnready(link) => Lifecycle::ConnectedUnready(link.reconnected(info)),
            Lifecycle::Ready(link) => Lifecycle::ConnectedUnready(link.reconnected(info)),
        };
    }

    /// ConnectedUnready → Ready, returning the connection details.
    ///
    /// Returns `None` and changes nothing in any other state.
    pub fn mark_ready(&mut self) -> Option<LinkInfo> {
        match self.take() {
            Lifecycle::ConnectedUnready(link) => {
                let ready = link.ready();
                let info = ready.get_state_data().cloned();
                *self = Lifecycle::Ready(ready);
                info
            }
            other => {
                *self = other;
                None
            }
        }
    }

    /// Any state → Disconnected, returning the state that was left.
    pub fn on_connection_lost(&mut self) -> ConnectionState {
        let previous = self.state();
        *self = match self.take() {
            Lifecycle::Connecting(link) => Lifecycle::Disconnected(link.failed()),
            Lifecycle::ConnectedUnready(link) => Lifecycle::Disconnected(link.lost()),
            Lifecycle::Ready(link) => Lifecycle::Disconnected(link.lost()),
            disconnected => disconnected,
        };
        previous
    }
}
