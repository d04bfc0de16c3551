//! rumqttc binding for the [`Transport`] interface.
//!
//! Each connect builds a fresh `AsyncClient` and spawns a task that drives its
//! `EventLoop`, translating packets into [`TransportEvent`]s:
//!
//! ```text
//! ConnAck            ──► Connected { reconnect, endpoint }
//! Publish (incoming) ──► MessageArrived
//! Publish (outgoing) ──► MessageDelivered { token }
//! poll error         ──► ConnectionLost { CONNECTION_LOST, .. }, wait, poll again
//! Disconnect         ──► ConnectionLost { NORMAL_DISCONNECT, .. }, stop
//! ```
//!
//! rumqttc does not hand out packet ids for queued requests, so subscribe and
//! unsubscribe completions are matched in request order: the outgoing
//! Subscribe/Unsubscribe event binds the oldest waiting request to its packet
//! id, and the SubAck/UnsubAck with that id settles it. Publishes are matched
//! the same way; QoS 1 and 2 publishes stay bound to their packet id until
//! acknowledged, so a retransmission is not mistaken for the next message.
//!
//! Every connect starts a new session. Events from the loop of an earlier
//! session are dropped.

use futures::future::{self, BoxFuture, FutureExt};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, SubscribeReasonCode,
    Transport as Link,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::{
    ConnectOptions, InboundMessage, OutboundMessage, QoS, SubscribeOptions, Transport,
    TransportEvent, CONNECTION_LOST, NORMAL_DISCONNECT,
};
use crate::config::TransportSettings;
use crate::error::TransportError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }
}

/// Broker address parsed from the configured endpoint URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub url: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl BrokerEndpoint {
    pub fn parse(endpoint: &str) -> Result<Self, TransportError> {
        let url = Url::parse(endpoint)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;

        let scheme = match url.scheme() {
            "tcp" | "mqtt" => Scheme::Tcp,
            "ssl" | "tls" | "mqtts" => Scheme::Tls,
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "unsupported scheme '{}' in {}",
                    other, endpoint
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("missing host in {}", endpoint)))?
            .to_string();

        Ok(Self {
            url: endpoint.to_string(),
            scheme,
            port: url.port().unwrap_or_else(|| scheme.default_port()),
            path: url.path().to_string(),
            host,
        })
    }

    fn mqtt_options(&self, options: &ConnectOptions, settings: &TransportSettings) -> MqttOptions {
        let mut mqtt_options = match self.scheme {
            Scheme::Ws | Scheme::Wss => {
                let scheme = if self.scheme == Scheme::Wss { "wss" } else { "ws" };
                let address = format!("{}://{}:{}{}", scheme, self.host, self.port, self.path);
                MqttOptions::new(options.client_id.clone(), address, self.port)
            }
            Scheme::Tcp | Scheme::Tls => {
                MqttOptions::new(options.client_id.clone(), self.host.clone(), self.port)
            }
        };

        mqtt_options
            .set_credentials(options.username.clone(), options.password.clone())
            .set_keep_alive(Duration::from_secs(settings.keep_alive_secs))
            .set_max_packet_size(settings.max_packet_size, settings.max_packet_size)
            .set_clean_session(true);

        match self.scheme {
            Scheme::Tcp => {}
            Scheme::Tls => {
                mqtt_options.set_transport(Link::tls_with_default_config());
            }
            Scheme::Ws => {
                mqtt_options.set_transport(Link::Ws);
            }
            Scheme::Wss => {
                mqtt_options.set_transport(Link::wss_with_default_config());
            }
        }

        mqtt_options
    }
}

struct Ack {
    topic: String,
    responder: oneshot::Sender<Result<(), TransportError>>,
}

/// Requests waiting for their broker acknowledgement.
#[derive(Default)]
struct Correlation {
    delivered: VecDeque<(u64, QoS)>,
    unacknowledged: HashMap<u16, u64>,
    queued_subscribes: VecDeque<Ack>,
    subscribes: HashMap<u16, Ack>,
    queued_unsubscribes: VecDeque<Ack>,
    unsubscribes: HashMap<u16, Ack>,
}

type SharedCorrelation = Arc<Mutex<Correlation>>;

fn lock(correlation: &SharedCorrelation) -> MutexGuard<'_, Correlation> {
    correlation.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Session {
    client: AsyncClient,
    correlation: SharedCorrelation,
    disconnecting: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// [`Transport`] over a rumqttc client.
pub struct MqttTransport {
    endpoint: BrokerEndpoint,
    settings: TransportSettings,
    events: mpsc::UnboundedSender<TransportEvent>,
    session: Option<Session>,
    current_session: Arc<AtomicU64>,
}

impl MqttTransport {
    /// Creates the transport and the channel its events are delivered on.
    pub fn new(
        endpoint: &str,
        settings: TransportSettings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let endpoint = BrokerEndpoint::parse(endpoint)?;
        let (events, events_rx) = mpsc::unbounded_channel();
        debug!("Created MQTT transport for {}", endpoint.url);

        Ok((
            Self {
                endpoint,
                settings,
                events,
                session: None,
                current_session: Arc::new(AtomicU64::new(0)),
            },
            events_rx,
        ))
    }

    fn active_session(&self) -> Result<&Session, TransportError> {
        match &self.session {
            Some(session) if !session.task.is_finished() => Ok(session),
            _ => Err(TransportError::NotConnected),
        }
    }
}

impl Transport for MqttTransport {
    fn connect(&mut self, options: ConnectOptions) -> BoxFuture<'static, Result<(), TransportError>> {
        if self.active_session().is_ok() {
            return future::ready(Err(TransportError::AlreadyConnected)).boxed();
        }

        info!(
            "Connecting client {} to {} as {}",
            options.client_id, self.endpoint.url, options.username
        );

        let mqtt_options = self.endpoint.mqtt_options(&options, &self.settings);
        let (client, eventloop) = AsyncClient::new(mqtt_options, self.settings.request_capacity);
        let (connected_tx, connected_rx) = oneshot::channel();

        let correlation = SharedCorrelation::default();
        let disconnecting = Arc::new(AtomicBool::new(false));
        let session_id = self.current_session.fetch_add(1, Ordering::SeqCst) + 1;
        let driver = EventDriver {
            events: self.events.clone(),
            correlation: correlation.clone(),
            disconnecting: disconnecting.clone(),
            endpoint: self.endpoint.url.clone(),
            session: session_id,
            current_session: self.current_session.clone(),
            connect_result: Some(connected_tx),
            connected_once: false,
        };
        let reconnect_delay = Duration::from_millis(self.settings.reconnect_delay_ms);
        let task = tokio::spawn(driver.run(eventloop, reconnect_delay));

        self.session = Some(Session {
            client,
            correlation,
            disconnecting,
            task,
        });

        async move { connected_rx.await.unwrap_or(Err(TransportError::Closed)) }.boxed()
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let session = self.session.take().ok_or(TransportError::NotConnected)?;
        session.disconnecting.store(true, Ordering::SeqCst);

        if let Err(e) = session.client.try_disconnect() {
            warn!("Disconnect request failed, stopping event loop: {}", e);
            session.task.abort();
            return Err(TransportError::Disconnect(e.to_string()));
        }

        debug!("Disconnect requested");
        Ok(())
    }

    fn subscribe(
        &mut self,
        topic: &str,
        options: SubscribeOptions,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let session = match self.active_session() {
            Ok(session) => session,
            Err(e) => return future::ready(Err(e)).boxed(),
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut correlation = lock(&session.correlation);
            if let Err(e) = session.client.try_subscribe(topic, to_mqtt_qos(options.qos)) {
                return future::ready(Err(TransportError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                }))
                .boxed();
            }
            correlation.queued_subscribes.push_back(Ack {
                topic: topic.to_string(),
                responder: tx,
            });
        }

        debug!("Subscribe requested for {}", topic);
        await_ack(rx, options.timeout)
    }

    fn unsubscribe(
        &mut self,
        topic: &str,
        options: SubscribeOptions,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let session = match self.active_session() {
            Ok(session) => session,
            Err(e) => return future::ready(Err(e)).boxed(),
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut correlation = lock(&session.correlation);
            if let Err(e) = session.client.try_unsubscribe(topic) {
                return future::ready(Err(TransportError::Unsubscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                }))
                .boxed();
            }
            correlation.queued_unsubscribes.push_back(Ack {
                topic: topic.to_string(),
                responder: tx,
            });
        }

        debug!("Unsubscribe requested for {}", topic);
        await_ack(rx, options.timeout)
    }

    fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        let session = self.active_session()?;

        let mut correlation = lock(&session.correlation);
        session
            .client
            .try_publish(
                message.topic.clone(),
                to_mqtt_qos(message.qos),
                message.retained,
                message.payload.into_bytes(),
            )
            .map_err(|e| TransportError::Publish {
                topic: message.topic.clone(),
                reason: e.to_string(),
            })?;
        correlation.delivered.push_back((message.token, message.qos));

        trace!("Queued publish {} on {}", message.token, message.topic);
        Ok(())
    }
}

fn await_ack(
    rx: oneshot::Receiver<Result<(), TransportError>>,
    timeout: Duration,
) -> BoxFuture<'static, Result<(), TransportError>> {
    async move {
        match time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        }
    }
    .boxed()
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_mqtt_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// What the event loop does after handling one poll result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    /// Connection dropped; wait before polling again
    Reconnect,
    Stop,
}

/// Drives one rumqttc event loop until disconnect or initial connect failure.
struct EventDriver {
    events: mpsc::UnboundedSender<TransportEvent>,
    correlation: SharedCorrelation,
    disconnecting: Arc<AtomicBool>,
    endpoint: String,
    session: u64,
    current_session: Arc<AtomicU64>,
    connect_result: Option<oneshot::Sender<Result<(), TransportError>>>,
    connected_once: bool,
}

impl EventDriver {
    async fn run(mut self, mut eventloop: EventLoop, reconnect_delay: Duration) {
        loop {
            let step = match eventloop.poll().await {
                Ok(event) => self.on_event(event),
                Err(e) => self.on_error(&e),
            };

            match step {
                Step::Continue => {}
                Step::Reconnect => time::sleep(reconnect_delay).await,
                Step::Stop => break,
            }
        }

        debug!("Event loop {} for {} stopped", self.session, self.endpoint);
    }

    fn on_event(&mut self, event: Event) -> Step {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!("Connected to {} ({:?})", self.endpoint, ack.code);
                if let Some(tx) = self.connect_result.take() {
                    let _ = tx.send(Ok(()));
                }
                let event = TransportEvent::Connected {
                    reconnect: self.connected_once,
                    endpoint: self.endpoint.clone(),
                };
                self.connected_once = true;
                self.emit(event)
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                    qos: from_mqtt_qos(publish.qos),
                    retained: publish.retain,
                };
                trace!("Message arrived on {}", message.topic);
                self.emit(TransportEvent::MessageArrived(message))
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let pending = lock(&self.correlation).subscribes.remove(&ack.pkid);
                if let Some(pending) = pending {
                    let refused = ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    let result = if refused {
                        warn!("Broker refused subscription to {}", pending.topic);
                        Err(TransportError::Subscribe {
                            topic: pending.topic,
                            reason: "refused by broker".to_string(),
                        })
                    } else {
                        debug!("Subscribed to {}", pending.topic);
                        Ok(())
                    };
                    let _ = pending.responder.send(result);
                }
                Step::Continue
            }
            Event::Incoming(Packet::UnsubAck(ack)) => {
                let pending = lock(&self.correlation).unsubscribes.remove(&ack.pkid);
                if let Some(pending) = pending {
                    debug!("Unsubscribed from {}", pending.topic);
                    let _ = pending.responder.send(Ok(()));
                }
                Step::Continue
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                lock(&self.correlation).unacknowledged.remove(&ack.pkid);
                Step::Continue
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                lock(&self.correlation).unacknowledged.remove(&comp.pkid);
                Step::Continue
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                let mut correlation = lock(&self.correlation);
                if let Some(ack) = correlation.queued_subscribes.pop_front() {
                    correlation.subscribes.insert(pkid, ack);
                }
                Step::Continue
            }
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                let mut correlation = lock(&self.correlation);
                if let Some(ack) = correlation.queued_unsubscribes.pop_front() {
                    correlation.unsubscribes.insert(pkid, ack);
                }
                Step::Continue
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => match self.published(pkid) {
                Some(token) => self.emit(TransportEvent::MessageDelivered { token }),
                None => Step::Continue,
            },
            Event::Outgoing(Outgoing::Disconnect) => {
                info!("Disconnected from {}", self.endpoint);
                self.emit(TransportEvent::ConnectionLost {
                    error_code: NORMAL_DISCONNECT,
                    error_message: "disconnected by client".to_string(),
                });
                Step::Stop
            }
            other => {
                trace!("MQTT event: {:?}", other);
                Step::Continue
            }
        }
    }

    /// Token of the message that just left the client, unless `pkid` is a
    /// retransmission of a publish still waiting for its acknowledgement.
    fn published(&self, pkid: u16) -> Option<u64> {
        let mut correlation = lock(&self.correlation);
        if pkid != 0 && correlation.unacknowledged.contains_key(&pkid) {
            trace!("Publish {} retransmitted", pkid);
            return None;
        }

        let (token, qos) = correlation.delivered.pop_front()?;
        if qos != QoS::AtMostOnce && pkid != 0 {
            correlation.unacknowledged.insert(pkid, token);
        }
        Some(token)
    }

    fn on_error(&mut self, error: &dyn fmt::Display) -> Step {
        if self.disconnecting.load(Ordering::SeqCst) {
            debug!("Event loop closed after disconnect: {}", error);
            self.emit(TransportEvent::ConnectionLost {
                error_code: NORMAL_DISCONNECT,
                error_message: "disconnected by client".to_string(),
            });
            return Step::Stop;
        }

        if let Some(tx) = self.connect_result.take() {
            error!("Connection to {} failed: {}", self.endpoint, error);
            let _ = tx.send(Err(TransportError::Connect(error.to_string())));
            return Step::Stop;
        }

        warn!("Connection to {} lost: {}", self.endpoint, error);
        self.fail_in_flight();
        match self.emit(TransportEvent::ConnectionLost {
            error_code: CONNECTION_LOST,
            error_message: error.to_string(),
        }) {
            Step::Continue => Step::Reconnect,
            stop => stop,
        }
    }

    /// Stops once nobody listens for events or a newer session replaced this one.
    fn emit(&self, event: TransportEvent) -> Step {
        if self.current_session.load(Ordering::SeqCst) != self.session {
            debug!("Session {} was replaced, dropping {:?}", self.session, event);
            return Step::Stop;
        }
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped, stopping event loop");
            return Step::Stop;
        }
        Step::Continue
    }

    /// Acknowledgements for packets sent on a dropped connection will never arrive.
    fn fail_in_flight(&self) {
        let mut correlation = lock(&self.correlation);
        for (_, ack) in correlation.subscribes.drain() {
            let _ = ack.responder.send(Err(TransportError::Subscribe {
                topic: ack.topic,
                reason: "connection lost".to_string(),
            }));
        }
        for (_, ack) in correlation.unsubscribes.drain() {
            let _ = ack.responder.send(Err(TransportError::Unsubscribe {
                topic: ack.topic,
                reason: "connection lost".to_string(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_websocket_endpoint_with_default_port() {
        let endpoint = BrokerEndpoint::parse("wss://broker.example.org/mqtt").expect("parses");
        assert_eq!(endpoint.scheme, Scheme::Wss);
        assert_eq!(endpoint.host, "broker.example.org");
        assert_eq!(endpoint.port, 443);
        assert_eq!(endpoint.path, "/mqtt");
    }

    #[test]
    fn parses_tcp_endpoint_with_explicit_port() {
        let endpoint = BrokerEndpoint::parse("tcp://127.0.0.1:1884").expect("parses");
        assert_eq!(endpoint.scheme, Scheme::Tcp);
        assert_eq!(endpoint.host, "127.0.0.1");
        assert_eq!(endpoint.port, 1884);
    }

    #[test]
    fn defaults_port_per_scheme() {
        assert_eq!(BrokerEndpoint::parse("mqtt://h").expect("parses").port, 1883);
        assert_eq!(BrokerEndpoint::parse("mqtts://h").expect("parses").port, 8883);
        assert_eq!(BrokerEndpoint::parse("ws://h").expect("parses").port, 80);
    }

    #[test]
    fn rejects_unknown_scheme_and_garbage() {
        assert!(matches!(
            BrokerEndpoint::parse("http://h"),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            BrokerEndpoint::parse("not a url"),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn qos_conversion_is_symmetric() {
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            assert_eq!(from_mqtt_qos(to_mqtt_qos(qos)), qos);
        }
    }

    #[tokio::test]
    async fn requests_without_session_fail() {
        let (mut transport, _events) =
            MqttTransport::new("tcp://localhost:1883", TransportSettings::default())
                .expect("valid endpoint");

        assert_eq!(transport.disconnect(), Err(TransportError::NotConnected));
        assert_eq!(
            transport
                .subscribe("topic", SubscribeOptions::default())
                .await,
            Err(TransportError::NotConnected)
        );
        let message = OutboundMessage {
            topic: "t".to_string(),
            payload: String::new(),
            qos: QoS::AtMostOnce,
            retained: false,
            token: 1,
        };
        assert_eq!(transport.send(message), Err(TransportError::NotConnected));
    }

    use rumqttc::{ConnAck, ConnectReturnCode, PubAck, Publish, SubAck, UnsubAck};

    type ConnectResult = oneshot::Receiver<Result<(), TransportError>>;

    fn driver() -> (EventDriver, mpsc::UnboundedReceiver<TransportEvent>, ConnectResult) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();
        let driver = EventDriver {
            events,
            correlation: SharedCorrelation::default(),
            disconnecting: Arc::new(AtomicBool::new(false)),
            endpoint: "tcp://broker.test:1883".to_string(),
            session: 1,
            current_session: Arc::new(AtomicU64::new(1)),
            connect_result: Some(connected_tx),
            connected_once: false,
        };
        (driver, events_rx, connected_rx)
    }

    fn conn_ack() -> Event {
        Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }))
    }

    fn queue_subscribe(driver: &EventDriver, topic: &str) -> ConnectResult {
        let (tx, rx) = oneshot::channel();
        lock(&driver.correlation).queued_subscribes.push_back(Ack {
            topic: topic.to_string(),
            responder: tx,
        });
        rx
    }

    fn queue_publish(driver: &EventDriver, token: u64, qos: QoS) {
        lock(&driver.correlation).delivered.push_back((token, qos));
    }

    #[test]
    fn conn_ack_settles_connect_and_marks_later_ones_as_reconnects() {
        let (mut driver, mut events, mut connected) = driver();

        assert_eq!(driver.on_event(conn_ack()), Step::Continue);
        assert_eq!(connected.try_recv(), Ok(Ok(())));
        assert_eq!(
            events.try_recv(),
            Ok(TransportEvent::Connected {
                reconnect: false,
                endpoint: "tcp://broker.test:1883".to_string(),
            })
        );

        driver.on_event(conn_ack());
        assert!(matches!(
            events.try_recv(),
            Ok(TransportEvent::Connected { reconnect: true, .. })
        ));
    }

    #[test]
    fn incoming_publish_becomes_message_arrived() {
        let (mut driver, mut events, _connected) = driver();
        let mut publish = Publish::new("ami/c1", rumqttc::QoS::AtLeastOnce, b"AMI-RESPONSE".to_vec());
        publish.retain = true;

        driver.on_event(Event::Incoming(Packet::Publish(publish)));

        assert_eq!(
            events.try_recv(),
            Ok(TransportEvent::MessageArrived(InboundMessage {
                topic: "ami/c1".to_string(),
                payload: "AMI-RESPONSE".to_string(),
                qos: QoS::AtLeastOnce,
                retained: true,
            }))
        );
    }

    #[test]
    fn sub_acks_settle_requests_by_packet_id() {
        let (mut driver, _events, _connected) = driver();
        let mut first = queue_subscribe(&driver, "ami/c1");
        let mut second = queue_subscribe(&driver, "ami/world");
        driver.on_event(Event::Outgoing(Outgoing::Subscribe(3)));
        driver.on_event(Event::Outgoing(Outgoing::Subscribe(4)));

        let granted = SubAck {
            pkid: 4,
            return_codes: vec![SubscribeReasonCode::Success(rumqttc::QoS::AtMostOnce)],
        };
        driver.on_event(Event::Incoming(Packet::SubAck(granted)));
        assert_eq!(second.try_recv(), Ok(Ok(())));
        assert_eq!(first.try_recv(), Err(oneshot::error::TryRecvError::Empty));

        let refused = SubAck {
            pkid: 3,
            return_codes: vec![SubscribeReasonCode::Failure],
        };
        driver.on_event(Event::Incoming(Packet::SubAck(refused)));
        assert_eq!(
            first.try_recv(),
            Ok(Err(TransportError::Subscribe {
                topic: "ami/c1".to_string(),
                reason: "refused by broker".to_string(),
            }))
        );
    }

    #[test]
    fn unsub_ack_settles_request() {
        let (mut driver, _events, _connected) = driver();
        let (tx, mut rx) = oneshot::channel();
        lock(&driver.correlation).queued_unsubscribes.push_back(Ack {
            topic: "ami/world".to_string(),
            responder: tx,
        });

        driver.on_event(Event::Outgoing(Outgoing::Unsubscribe(7)));
        driver.on_event(Event::Incoming(Packet::UnsubAck(UnsubAck { pkid: 7 })));

        assert_eq!(rx.try_recv(), Ok(Ok(())));
    }

    #[test]
    fn outgoing_publishes_report_tokens_in_order() {
        let (mut driver, mut events, _connected) = driver();
        queue_publish(&driver, 7, QoS::AtMostOnce);
        queue_publish(&driver, 8, QoS::AtMostOnce);

        driver.on_event(Event::Outgoing(Outgoing::Publish(0)));
        driver.on_event(Event::Outgoing(Outgoing::Publish(0)));

        assert_eq!(events.try_recv(), Ok(TransportEvent::MessageDelivered { token: 7 }));
        assert_eq!(events.try_recv(), Ok(TransportEvent::MessageDelivered { token: 8 }));
    }

    #[test]
    fn retransmitted_publish_keeps_its_token() {
        let (mut driver, mut events, _connected) = driver();
        queue_publish(&driver, 1, QoS::AtLeastOnce);
        queue_publish(&driver, 2, QoS::AtLeastOnce);

        driver.on_event(Event::Outgoing(Outgoing::Publish(10)));
        assert_eq!(events.try_recv(), Ok(TransportEvent::MessageDelivered { token: 1 }));

        driver.on_event(Event::Outgoing(Outgoing::Publish(10)));
        assert!(events.try_recv().is_err());

        driver.on_event(Event::Outgoing(Outgoing::Publish(11)));
        assert_eq!(events.try_recv(), Ok(TransportEvent::MessageDelivered { token: 2 }));

        driver.on_event(Event::Incoming(Packet::PubAck(PubAck { pkid: 10 })));
        let correlation = lock(&driver.correlation);
        assert!(!correlation.unacknowledged.contains_key(&10));
        assert_eq!(correlation.unacknowledged.get(&11), Some(&2));
    }

    #[test]
    fn client_disconnect_reports_normal_code_and_stops() {
        let (mut driver, mut events, _connected) = driver();
        driver.on_event(conn_ack());
        let _ = events.try_recv();

        assert_eq!(driver.on_event(Event::Outgoing(Outgoing::Disconnect)), Step::Stop);
        assert!(matches!(
            events.try_recv(),
            Ok(TransportEvent::ConnectionLost { error_code: NORMAL_DISCONNECT, .. })
        ));
    }

    #[test]
    fn error_before_conn_ack_fails_connect() {
        let (mut driver, mut events, mut connected) = driver();

        assert_eq!(driver.on_error(&"connection refused"), Step::Stop);
        assert_eq!(
            connected.try_recv(),
            Ok(Err(TransportError::Connect("connection refused".to_string())))
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn error_after_connect_reports_loss_and_fails_in_flight_acks() {
        let (mut driver, mut events, _connected) = driver();
        driver.on_event(conn_ack());
        let _ = events.try_recv();
        let mut pending = queue_subscribe(&driver, "ami/c1");
        driver.on_event(Event::Outgoing(Outgoing::Subscribe(1)));

        assert_eq!(driver.on_error(&"connection reset"), Step::Reconnect);
        assert_eq!(
            events.try_recv(),
            Ok(TransportEvent::ConnectionLost {
                error_code: CONNECTION_LOST,
                error_message: "connection reset".to_string(),
            })
        );
        assert_eq!(
            pending.try_recv(),
            Ok(Err(TransportError::Subscribe {
                topic: "ami/c1".to_string(),
                reason: "connection lost".to_string(),
            }))
        );
    }

    #[test]
    fn error_while_disconnecting_is_a_normal_disconnect() {
        let (mut driver, mut events, _connected) = driver();
        driver.on_event(conn_ack());
        let _ = events.try_recv();
        driver.disconnecting.store(true, Ordering::SeqCst);

        assert_eq!(driver.on_error(&"connection closed"), Step::Stop);
        assert!(matches!(
            events.try_recv(),
            Ok(TransportEvent::ConnectionLost { error_code: NORMAL_DISCONNECT, .. })
        ));
    }

    #[test]
    fn replaced_session_emits_nothing() {
        let (mut driver, mut events, _connected) = driver();
        driver.on_event(conn_ack());
        let _ = events.try_recv();
        driver.current_session.store(2, Ordering::SeqCst);

        assert_eq!(driver.on_error(&"connection closed"), Step::Stop);
        assert_eq!(driver.on_event(Event::Outgoing(Outgoing::Disconnect)), Step::Stop);
        assert!(events.try_recv().is_err());
    }
}
