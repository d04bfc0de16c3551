#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ami_mqtt_client::transport::{ConnectOptions, OutboundMessage};
use ami_mqtt_client::{
    AmiClient, ClientConfig, ClientHooks, InboundMessage, QoS, SubscribeOptions, Transport,
    TransportError, TransportEvent,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::future::{self, BoxFuture};
use tokio::sync::mpsc;

pub const ENDPOINT: &str = "tcp://broker.test:1883";

#[derive(Debug, Default)]
pub struct Recorded {
    pub connects: Vec<ConnectOptions>,
    pub subscriptions: Vec<String>,
    pub unsubscriptions: Vec<String>,
    pub sent: Vec<OutboundMessage>,
    pub disconnects: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Behaviour {
    pub refuse_connect: bool,
    pub fail_disconnect: bool,
    pub fail_send: bool,
    pub fail_subscribe: bool,
    /// Emit `Connected` as soon as a connect is accepted
    pub auto_connected: bool,
}

/// In-memory transport recording every call.
pub struct MockTransport {
    recorded: Arc<Mutex<Recorded>>,
    behaviour: Behaviour,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport for MockTransport {
    fn connect(&mut self, options: ConnectOptions) -> BoxFuture<'static, Result<(), TransportError>> {
        self.recorded.lock().unwrap().connects.push(options);

        if self.behaviour.refuse_connect {
            return Box::pin(future::ready(Err(TransportError::Connect(
                "connection refused".to_string(),
            ))));
        }
        if self.behaviour.auto_connected {
            let _ = self.events.send(TransportEvent::Connected {
                reconnect: false,
                endpoint: ENDPOINT.to_string(),
            });
        }
        Box::pin(future::ready(Ok(())))
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.recorded.lock().unwrap().disconnects += 1;
        if self.behaviour.fail_disconnect {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    fn subscribe(
        &mut self,
        topic: &str,
        _options: SubscribeOptions,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        self.recorded.lock().unwrap().subscriptions.push(topic.to_string());
        if self.behaviour.fail_subscribe {
            return Box::pin(future::ready(Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "not authorized".to_string(),
            })));
        }
        Box::pin(future::ready(Ok(())))
    }

    fn unsubscribe(
        &mut self,
        topic: &str,
        _options: SubscribeOptions,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        self.recorded.lock().unwrap().unsubscriptions.push(topic.to_string());
        Box::pin(future::ready(Ok(())))
    }

    fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        if self.behaviour.fail_send {
            return Err(TransportError::Publish {
                topic: message.topic,
                reason: "queue full".to_string(),
            });
        }
        self.recorded.lock().unwrap().sent.push(message);
        Ok(())
    }
}

/// Test side of the mock: inspects calls and injects broker events.
#[derive(Clone)]
pub struct MockBroker {
    recorded: Arc<Mutex<Recorded>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockBroker {
    pub fn connected(&self, reconnect: bool) {
        self.emit(TransportEvent::Connected {
            reconnect,
            endpoint: ENDPOINT.to_string(),
        });
    }

    pub fn lost(&self, error_code: i32, error_message: &str) {
        self.emit(TransportEvent::ConnectionLost {
            error_code,
            error_message: error_message.to_string(),
        });
    }

    pub fn publish(&self, topic: &str, payload: &str) {
        self.emit(TransportEvent::MessageArrived(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos: QoS::AtMostOnce,
            retained: false,
        }));
    }

    pub fn delivered(&self, token: u64) {
        self.emit(TransportEvent::MessageDelivered { token });
    }

    fn emit(&self, event: TransportEvent) {
        self.events.send(event).expect("worker receiving events");
    }

    pub fn connects(&self) -> Vec<ConnectOptions> {
        self.recorded.lock().unwrap().connects.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.recorded.lock().unwrap().subscriptions.clone()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.recorded.lock().unwrap().sent.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.recorded.lock().unwrap().disconnects
    }
}

pub fn spawn_client(
    config: ClientConfig,
    hooks: ClientHooks,
    behaviour: Behaviour,
) -> (AmiClient, MockBroker) {
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let transport = MockTransport {
        recorded: recorded.clone(),
        behaviour,
        events: events_tx.clone(),
    };
    let client = AmiClient::spawn(config, hooks, transport, events_rx);

    (
        client,
        MockBroker {
            recorded,
            events: events_tx,
        },
    )
}

pub fn config() -> ClientConfig {
    ClientConfig::new(ENDPOINT)
}

/// Unsigned JWT carrying `sub`.
pub fn bearer(subject: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{}","exp":4102444800}}"#, subject));
    format!("{}.{}.signature", header, claims)
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
