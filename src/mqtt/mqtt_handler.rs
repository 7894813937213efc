//! Broker connection lifecycle
//!
//! # State Machine
//!
//! ```text
//!                 connect()            CONNACK
//! Disconnected ─────────────► Connecting ─────────► Connected
//!      ▲                          │                    │  ▲
//!      │ disconnect()             │ refused/timeout    │  │ CONNACK
//!      │                          ▼                    ▼  │
//!      └────────────────────── Error ◄──────────── Reconnecting
//!                         (auth rejected)        (network drop, backoff)
//! ```
//!
//! A fatal error while `Connected` also goes straight to `Error`.
//!
//! Leaving `Connected` for any reason cancels every pending command
//! immediately. `Error` is terminal until `connect` is called again.

use crate::command::pending::PendingTable;
use crate::error::{CancelReason, ConnectError, TransportError};
use crate::mqtt::config::{
    BackoffSchedule, BrokerAddress, ConnectOptions, Credentials, DeliveryGuarantee,
};
use crate::mqtt::message_manager::{InboundMessage, SubscriptionRouter, TopicHandler};
use crate::mqtt::Publisher;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    NetworkOptions, Outgoing, Packet, QoS,
};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Error, Connecting)
                | (Error, Disconnected)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Error)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Error)
                | (Reconnecting, Disconnected)
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

/// Lifecycle notifications for observers of the connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    Error(String),
    MessageReceived { topic: String },
}

/// State shared between the handle and its event-loop task
struct ConnectionCore {
    status: watch::Sender<MqttStatus>,
    events: broadcast::Sender<TransportEvent>,
    router: Arc<SubscriptionRouter>,
    pending: Arc<PendingTable>,
}

impl ConnectionCore {
    fn new(router: Arc<SubscriptionRouter>, pending: Arc<PendingTable>) -> Self {
        let (status, _) = watch::channel(MqttStatus::default());
        let (events, _) = broadcast::channel(64);
        Self {
            status,
            events,
            router,
            pending,
        }
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().connection_state
    }

    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Applies a transition if the state machine allows it
    fn transition(&self, next: ConnectionState) -> bool {
        let mut previous = ConnectionState::default();
        let changed = self.status.send_if_modified(|status| {
            previous = status.connection_state;
            if previous == next || !previous.can_transition_to(next) {
                return false;
            }
            status.connection_state = next;
            true
        });

        if !changed {
            if previous != next {
                warn!("Ignoring connection transition {:?} -> {:?}", previous, next);
            }
            return false;
        }

        info!("MQTT connection {:?} -> {:?}", previous, next);
        if previous == ConnectionState::Connected {
            self.pending.cancel_all(CancelReason::ConnectionLost);
        }

        match next {
            ConnectionState::Connected => self.emit(TransportEvent::Connected),
            ConnectionState::Disconnected => self.emit(TransportEvent::Disconnected),
            _ => {}
        }
        true
    }

    fn fail(&self, err: &ConnectError) {
        error!("MQTT connection failed: {}", err);
        self.status
            .send_modify(|status| status.last_error = Some(err.to_string()));
        self.transition(ConnectionState::Error);
        self.emit(TransportEvent::Error(err.to_string()));
    }

    fn deliver(&self, topic: &str, payload: Vec<u8>) {
        self.status.send_modify(|status| {
            status.messages_received += 1;
            status.last_activity = Some(Local::now());
        });
        let message = InboundMessage::new(topic, payload);
        debug!("Received {}", message);
        self.router.dispatch(&message);
        self.emit(TransportEvent::MessageReceived {
            topic: topic.to_string(),
        });
    }

    fn count_sent(&self) {
        self.status.send_modify(|status| {
            status.messages_sent += 1;
            status.last_activity = Some(Local::now());
        });
    }
}

fn classify(err: &ConnectionError) -> ConnectError {
    match err {
        ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable) => {
            ConnectError::Unreachable("broker service unavailable".into())
        }
        ConnectionError::ConnectionRefused(code) => ConnectError::Rejected(format!("{:?}", code)),
        other => ConnectError::Unreachable(other.to_string()),
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(classify(&ConnectionError::ConnectionRefused(code))),
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(classify(&e)),
        }
    }
}

fn presence_payload(status: &str) -> Vec<u8> {
    serde_json::json!({
        "status": status,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })
    .to_string()
    .into_bytes()
}

fn resubscribe_all(core: &ConnectionCore, client: &AsyncClient) {
    for pattern in core.router.patterns() {
        match client.try_subscribe(pattern.clone(), QoS::AtLeastOnce) {
            Ok(()) => debug!("Subscribed to {}", pattern),
            Err(e) => warn!("Failed to subscribe to {}: {}", pattern, e),
        }
    }
}

async fn run_event_loop(
    core: Arc<ConnectionCore>,
    client: AsyncClient,
    mut eventloop: EventLoop,
    backoff: BackoffSchedule,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Event loop shutdown requested");
                break;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                core.deliver(&publish.topic, publish.payload.to_vec());
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                attempt = 0;
                if core.transition(ConnectionState::Connected) {
                    info!("Reconnected to broker");
                    resubscribe_all(&core, &client);
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(_))) => core.count_sent(),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent, leaving event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if shutdown.is_cancelled() || core.state() == ConnectionState::Disconnected {
                    break;
                }

                let err = classify(&e);
                if !err.is_retriable() {
                    core.fail(&err);
                    break;
                }

                warn!("MQTT connection lost: {}", e);
                core.status
                    .send_modify(|status| status.last_error = Some(e.to_string()));
                core.transition(ConnectionState::Reconnecting);

                let delay = backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                core.emit(TransportEvent::Reconnecting { attempt, delay });
                info!("Reconnect attempt {} in {:?}", attempt, delay);

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!("Event loop stopped");
}

struct Session {
    client: AsyncClient,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    presence_topic: Option<String>,
}

/// One logical connection to the broker
///
/// Owns the subscription router and the pending-request table it cancels
/// when the session drops. Cheap accessors, no global state: construct one
/// per broker session and share it behind an `Arc`.
pub struct MqttHandle {
    core: Arc<ConnectionCore>,
    session: Mutex<Option<Session>>,
}

impl MqttHandle {
    pub fn new(router: Arc<SubscriptionRouter>, pending: Arc<PendingTable>) -> Self {
        Self {
            core: Arc::new(ConnectionCore::new(router, pending)),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn status(&self) -> MqttStatus {
        self.core.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<MqttStatus> {
        self.core.status.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.core.events.subscribe()
    }

    pub fn router(&self) -> &Arc<SubscriptionRouter> {
        &self.core.router
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.core.pending
    }

    fn client(&self) -> Option<AsyncClient> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.client.clone())
    }

    /// Establishes a session and starts the event loop
    ///
    /// Resolves once the broker acknowledged the session. Registered
    /// subscriptions are (re)issued and an `online` notice is published on
    /// the presence topic, if one is configured.
    pub async fn connect(
        &self,
        address: &BrokerAddress,
        credentials: &Credentials,
        options: ConnectOptions,
    ) -> Result<(), ConnectError> {
        if !self.core.transition(ConnectionState::Connecting) {
            return Err(ConnectError::AlreadyActive);
        }
        info!("Connecting to {} as {}", address, options.client_id);

        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), address.host.clone(), address.port);
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_clean_session(true);
        if !credentials.is_empty() {
            mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }
        if let Some(will) = &options.last_will {
            mqtt_options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                QoS::AtLeastOnce,
                will.retain,
            ));
        }

        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options, options.request_channel_capacity);
        let mut network_options = NetworkOptions::new();
        network_options.set_connection_timeout(options.connect_timeout.as_secs().max(1));
        eventloop.set_network_options(network_options);

        let handshake =
            tokio::time::timeout(options.connect_timeout, wait_for_connack(&mut eventloop)).await;
        let result = match handshake {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout(options.connect_timeout)),
        };
        if let Err(e) = result {
            self.core.fail(&e);
            return Err(e);
        }

        if !self.core.transition(ConnectionState::Connected) {
            // disconnect() raced the handshake
            let _ = client.try_disconnect();
            return Err(ConnectError::Unreachable("connect aborted".into()));
        }

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_event_loop(
            self.core.clone(),
            client.clone(),
            eventloop,
            options.backoff.clone(),
            shutdown.clone(),
        ));

        resubscribe_all(&self.core, &client);
        if let Some(topic) = &options.presence_topic {
            let online = presence_payload("online");
            if let Err(e) = client.try_publish(topic.clone(), QoS::AtLeastOnce, true, online) {
                warn!("Failed to announce presence on {}: {}", topic, e);
            }
        }

        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Session {
                client,
                shutdown,
                task,
                presence_topic: options.presence_topic,
            });
        if let Some(stale) = previous {
            stale.shutdown.cancel();
        }

        info!("Connected to {}", address);
        Ok(())
    }

    /// Graceful teardown
    ///
    /// Pending commands are cancelled first, then the offline notice and the
    /// MQTT DISCONNECT are queued and the event loop is given a short grace
    /// period to flush them.
    pub async fn disconnect(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let was_connected = self.state() == ConnectionState::Connected;
        self.core.transition(ConnectionState::Disconnected);

        let Some(mut session) = session else {
            return;
        };

        if was_connected {
            if let Some(topic) = &session.presence_topic {
                if let Err(e) = session
                    .client
                    .publish(topic.clone(), QoS::AtLeastOnce, true, presence_payload("offline"))
                    .await
                {
                    warn!("Failed to publish offline notice: {}", e);
                }
            }
            if let Err(e) = session.client.disconnect().await {
                warn!("Failed to queue disconnect: {}", e);
            }
        } else {
            session.shutdown.cancel();
        }

        if tokio::time::timeout(DISCONNECT_GRACE, &mut session.task)
            .await
            .is_err()
        {
            debug!("Event loop did not stop in time, cancelling");
            session.shutdown.cancel();
            let _ = session.task.await;
        }
        info!("Disconnected from broker");
    }

    /// Sends one message; requires `Connected`
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        guarantee: DeliveryGuarantee,
    ) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let client = self.client().ok_or(TransportError::NotConnected)?;
        debug!("Publishing {} bytes to {} ({:?})", payload.len(), topic, guarantee);
        client
            .publish(topic, QoS::from(guarantee), false, payload)
            .await?;
        Ok(())
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        message: &T,
        guarantee: DeliveryGuarantee,
    ) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(message)?;
        self.publish(topic, payload, guarantee).await
    }

    /// Registers a handler; issues the MQTT SUBSCRIBE now if connected,
    /// otherwise on the next (re)connect
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn TopicHandler>,
    ) -> Result<(), TransportError> {
        self.core.router.register(pattern, handler);
        if self.state() == ConnectionState::Connected {
            if let Some(client) = self.client() {
                client.subscribe(pattern, QoS::AtLeastOnce).await?;
                info!("Subscribed to {}", pattern);
            }
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        self.core.router.remove(pattern);
        if self.state() == ConnectionState::Connected {
            if let Some(client) = self.client() {
                client.unsubscribe(pattern).await?;
                info!("Unsubscribed from {}", pattern);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for MqttHandle {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        guarantee: DeliveryGuarantee,
    ) -> Result<(), TransportError> {
        MqttHandle::publish(self, topic, payload, guarantee).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::dispatcher::{CommandDispatcher, DispatchSettings};
    use crate::command::envelope::{CommandEnvelope, CommandType};
    use crate::command::pending::Termination;
    use crate::error::{CommandError, MalformedMessage};
    use crate::mqtt::config::LastWill as WillMessage;
    use crate::mqtt::topic::APP_STATUS_TOPIC;
    use serde_json::Value;
    use std::future::Future;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::Instant;

    fn core() -> ConnectionCore {
        ConnectionCore::new(
            Arc::new(SubscriptionRouter::new()),
            Arc::new(PendingTable::new()),
        )
    }

    fn connect_core(core: &ConnectionCore) {
        assert!(core.transition(ConnectionState::Connecting));
        assert!(core.transition(ConnectionState::Connected));
    }

    #[test]
    fn follows_the_lifecycle() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Error.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Reconnecting));
    }

    #[test]
    fn rejects_invalid_transitions() {
        let core = core();
        assert!(!core.transition(ConnectionState::Connected));
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(core.transition(ConnectionState::Connecting));
        assert!(!core.transition(ConnectionState::Connecting));
    }

    #[test]
    fn reconnecting_cancels_all_pending_immediately() {
        let core = core();
        connect_core(&core);

        let deadline = Instant::now() + Duration::from_secs(30);
        let mut receivers: Vec<_> = ["R1", "R2", "R3"]
            .iter()
            .map(|id| {
                let envelope =
                    CommandEnvelope::new(CommandType::Lock, "D1", "u1").with_request_id(*id);
                core.pending.insert(envelope, deadline, 0).unwrap()
            })
            .collect();

        assert!(core.transition(ConnectionState::Reconnecting));
        assert!(core.pending.is_empty());
        for rx in receivers.iter_mut() {
            assert!(matches!(
                rx.try_recv(),
                Ok(Termination::Cancelled(CancelReason::ConnectionLost))
            ));
        }
    }

    #[test]
    fn auth_failure_parks_in_error() {
        let core = core();
        core.transition(ConnectionState::Connecting);
        core.fail(&ConnectError::Rejected("BadUserNamePassword".into()));

        assert_eq!(core.state(), ConnectionState::Error);
        assert!(core.status.borrow().last_error.is_some());
        assert!(!core.transition(ConnectionState::Reconnecting));
        assert!(core.transition(ConnectionState::Connecting));
    }

    #[test]
    fn fatal_error_while_connected_cancels_pending() {
        let core = core();
        connect_core(&core);

        let envelope = CommandEnvelope::new(CommandType::Lock, "D1", "u1").with_request_id("R1");
        let mut rx = core
            .pending
            .insert(envelope, Instant::now() + Duration::from_secs(30), 0)
            .unwrap();

        core.fail(&ConnectError::Rejected("NotAuthorized".into()));

        assert_eq!(core.state(), ConnectionState::Error);
        assert!(core.pending.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Ok(Termination::Cancelled(CancelReason::ConnectionLost))
        ));
    }

    #[test]
    fn refusal_codes_are_classified() {
        assert!(matches!(
            classify(&ConnectionError::ConnectionRefused(
                ConnectReturnCode::BadUserNamePassword
            )),
            ConnectError::Rejected(_)
        ));
        assert!(matches!(
            classify(&ConnectionError::ConnectionRefused(
                ConnectReturnCode::NotAuthorized
            )),
            ConnectError::Rejected(_)
        ));
        assert!(classify(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::ServiceUnavailable
        ))
        .is_retriable());
    }

    #[tokio::test]
    async fn delivery_routes_and_counts() {
        let core = core();
        let mut events = core.events.subscribe();
        let handler = |_: &str, payload: &Value| -> Result<(), MalformedMessage> {
            assert_eq!(payload["isLocked"], true);
            Ok(())
        };
        core.router.register("lock/status/+", Arc::new(handler));

        core.deliver("lock/status/D1", br#"{"isLocked":true}"#.to_vec());

        assert_eq!(core.status.borrow().messages_received, 1);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::MessageReceived {
                topic: "lock/status/D1".into()
            }
        );
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let handle = MqttHandle::new(
            Arc::new(SubscriptionRouter::new()),
            Arc::new(PendingTable::new()),
        );
        let result = handle
            .publish("lock/control/D1", b"{}".to_vec(), DeliveryGuarantee::AtLeastOnce)
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn subscribe_while_offline_only_registers() {
        let handle = MqttHandle::new(
            Arc::new(SubscriptionRouter::new()),
            Arc::new(PendingTable::new()),
        );
        let handler = |_: &str, _: &Value| -> Result<(), MalformedMessage> { Ok(()) };
        handle
            .subscribe("lock/status/D1", Arc::new(handler))
            .await
            .unwrap();
        assert_eq!(handle.router().patterns(), vec!["lock/status/D1"]);

        handle.unsubscribe("lock/status/D1").await.unwrap();
        assert!(handle.router().patterns().is_empty());
    }

    #[tokio::test]
    async fn unreachable_broker_fails_into_error_state() {
        let handle = MqttHandle::new(
            Arc::new(SubscriptionRouter::new()),
            Arc::new(PendingTable::new()),
        );
        let options = ConnectOptions {
            connect_timeout: Duration::from_secs(2),
            ..ConnectOptions::default()
        };

        let result = handle
            .connect(
                &BrokerAddress::new("127.0.0.1", 1),
                &Credentials::default(),
                options,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(handle.state(), ConnectionState::Error);

        handle.disconnect().await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    async fn within<F: Future>(future: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), future)
            .await
            .expect("broker exchange timed out")
    }

    async fn eventually(check: impl Fn() -> bool) {
        within(async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
    }

    fn remaining_length(mut length: usize, packet: &mut Vec<u8>) {
        loop {
            let mut byte = (length % 128) as u8;
            length /= 128;
            if length > 0 {
                byte |= 0x80;
            }
            packet.push(byte);
            if length == 0 {
                break;
            }
        }
    }

    fn mqtt_str(bytes: &[u8]) -> (String, &[u8]) {
        let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let text = String::from_utf8(bytes[2..2 + len].to_vec()).unwrap();
        (text, &bytes[2 + len..])
    }

    /// What the client sent, as far as the tests care
    #[derive(Debug, PartialEq)]
    enum Seen {
        Subscribe(Vec<String>),
        Publish {
            topic: String,
            payload: Vec<u8>,
            retain: bool,
        },
        Disconnect,
    }

    /// In-process MQTT 3.1.1 listener speaking just enough of the protocol
    struct FakeBroker {
        listener: TcpListener,
        address: BrokerAddress,
    }

    impl FakeBroker {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            Self {
                listener,
                address: BrokerAddress::new("127.0.0.1", port),
            }
        }

        /// Takes the next client and answers its CONNECT with `code`
        async fn accept(&self, code: u8) -> BrokerLink {
            let (stream, _) = within(self.listener.accept()).await.unwrap();
            let mut link = BrokerLink { stream };
            let (header, _) = within(link.read_packet()).await.unwrap();
            assert_eq!(header >> 4, 1, "expected CONNECT");
            link.stream.write_all(&[0x20, 0x02, 0x00, code]).await.unwrap();
            link
        }
    }

    struct BrokerLink {
        stream: TcpStream,
    }

    impl BrokerLink {
        async fn read_packet(&mut self) -> std::io::Result<(u8, Vec<u8>)> {
            let header = self.stream.read_u8().await?;
            let mut length = 0usize;
            let mut shift = 0;
            loop {
                let byte = self.stream.read_u8().await?;
                length |= ((byte & 0x7f) as usize) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }
            let mut body = vec![0; length];
            self.stream.read_exact(&mut body).await?;
            Ok((header, body))
        }

        /// Next packet of interest; acks are written along the way
        async fn next(&mut self) -> Seen {
            loop {
                let (header, body) = within(self.read_packet()).await.unwrap();
                match header >> 4 {
                    3 => {
                        let qos = (header >> 1) & 0x03;
                        let (topic, mut rest) = mqtt_str(&body);
                        if qos > 0 {
                            // peer may already be gone after DISCONNECT
                            let _ = self.stream.write_all(&[0x40, 0x02, rest[0], rest[1]]).await;
                            rest = &rest[2..];
                        }
                        return Seen::Publish {
                            topic,
                            payload: rest.to_vec(),
                            retain: header & 0x01 == 1,
                        };
                    }
                    8 => {
                        let mut filters = Vec::new();
                        let mut rest = &body[2..];
                        while !rest.is_empty() {
                            let (filter, after) = mqtt_str(rest);
                            filters.push(filter);
                            rest = &after[1..];
                        }
                        let mut ack = vec![0x90, 2 + filters.len() as u8, body[0], body[1]];
                        ack.extend(std::iter::repeat(0x01).take(filters.len()));
                        let _ = self.stream.write_all(&ack).await;
                        return Seen::Subscribe(filters);
                    }
                    12 => {
                        let _ = self.stream.write_all(&[0xD0, 0x00]).await;
                    }
                    14 => return Seen::Disconnect,
                    _ => {}
                }
            }
        }

        async fn next_subscribe(&mut self) -> Vec<String> {
            loop {
                if let Seen::Subscribe(filters) = self.next().await {
                    return filters;
                }
            }
        }

        /// Delivers a QoS 0 message to the client
        async fn publish(&mut self, topic: &str, payload: &[u8]) {
            let mut body = (topic.len() as u16).to_be_bytes().to_vec();
            body.extend_from_slice(topic.as_bytes());
            body.extend_from_slice(payload);
            let mut packet = vec![0x30];
            remaining_length(body.len(), &mut packet);
            packet.extend(body);
            self.stream.write_all(&packet).await.unwrap();
        }
    }

    fn broker_options() -> ConnectOptions {
        ConnectOptions {
            client_id: "lockbridge-test".into(),
            connect_timeout: Duration::from_secs(5),
            backoff: BackoffSchedule {
                initial_ms: 50,
                max_ms: 200,
                multiplier: 2.0,
            },
            last_will: Some(WillMessage {
                topic: APP_STATUS_TOPIC.into(),
                payload: r#"{"status":"offline"}"#.into(),
                retain: true,
            }),
            presence_topic: Some(APP_STATUS_TOPIC.into()),
            ..ConnectOptions::default()
        }
    }

    fn handle() -> Arc<MqttHandle> {
        Arc::new(MqttHandle::new(
            Arc::new(SubscriptionRouter::new()),
            Arc::new(PendingTable::new()),
        ))
    }

    fn spawn_connect(
        handle: &Arc<MqttHandle>,
        broker: &FakeBroker,
    ) -> JoinHandle<Result<(), ConnectError>> {
        let handle = handle.clone();
        let address = broker.address.clone();
        tokio::spawn(async move {
            handle
                .connect(&address, &Credentials::new("alice", "secret"), broker_options())
                .await
        })
    }

    fn presence_status(seen: Seen) -> String {
        match seen {
            Seen::Publish {
                topic,
                payload,
                retain,
            } => {
                assert_eq!(topic, APP_STATUS_TOPIC);
                assert!(retain);
                let notice: Value = serde_json::from_slice(&payload).unwrap();
                notice["status"].as_str().unwrap().to_string()
            }
            other => panic!("expected a presence notice, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn session_runs_against_a_broker() {
        let broker = FakeBroker::start().await;
        let handle = handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |topic: &str, payload: &Value| -> Result<(), MalformedMessage> {
            sink.lock().unwrap().push((topic.to_string(), payload.clone()));
            Ok(())
        };
        handle
            .subscribe("lock/status/+", Arc::new(handler))
            .await
            .unwrap();

        let connecting = spawn_connect(&handle, &broker);
        let mut link = broker.accept(0).await;
        within(connecting).await.unwrap().unwrap();
        assert_eq!(handle.state(), ConnectionState::Connected);

        assert_eq!(link.next().await, Seen::Subscribe(vec!["lock/status/+".into()]));
        assert_eq!(presence_status(link.next().await), "online");

        link.publish("lock/status/D1", br#"{"isLocked":true}"#).await;
        eventually(|| !seen.lock().unwrap().is_empty()).await;
        assert_eq!(seen.lock().unwrap()[0].0, "lock/status/D1");
        assert_eq!(seen.lock().unwrap()[0].1["isLocked"], true);
        assert_eq!(handle.status().messages_received, 1);

        handle
            .publish("lock/control/D1", b"{}".to_vec(), DeliveryGuarantee::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(
            link.next().await,
            Seen::Publish {
                topic: "lock/control/D1".into(),
                payload: b"{}".to_vec(),
                retain: false,
            }
        );
        eventually(|| handle.status().messages_sent == 2).await;

        let closing = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.disconnect().await })
        };
        assert_eq!(presence_status(link.next().await), "offline");
        assert_eq!(link.next().await, Seen::Disconnect);
        within(closing).await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn dropped_socket_cancels_waiters_and_resubscribes() {
        let broker = FakeBroker::start().await;
        let handle = handle();
        let handler = |_: &str, _: &Value| -> Result<(), MalformedMessage> { Ok(()) };
        handle
            .subscribe("lock/response/D1", Arc::new(handler))
            .await
            .unwrap();
        let mut events = handle.events();

        let connecting = spawn_connect(&handle, &broker);
        let mut link = broker.accept(0).await;
        within(connecting).await.unwrap().unwrap();
        assert_eq!(link.next_subscribe().await, vec!["lock/response/D1"]);

        let dispatcher = Arc::new(CommandDispatcher::new(
            handle.clone(),
            handle.pending().clone(),
            DispatchSettings::default(),
        ));
        let waiting: Vec<_> = ["C1", "C2", "C3"]
            .into_iter()
            .map(|id| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    let envelope =
                        CommandEnvelope::new(CommandType::Lock, "D1", "u1").with_request_id(id);
                    dispatcher.send_command(envelope, None).await
                })
            })
            .collect();
        eventually(|| handle.pending().len() == 3).await;

        drop(link);

        for task in waiting {
            let result = within(task).await.unwrap();
            assert!(matches!(
                result,
                Err(CommandError::Cancelled {
                    reason: CancelReason::ConnectionLost,
                    ..
                })
            ));
        }
        assert!(handle.pending().is_empty());

        let attempt = within(async {
            loop {
                if let TransportEvent::Reconnecting { attempt, .. } = events.recv().await.unwrap() {
                    return attempt;
                }
            }
        })
        .await;
        assert_eq!(attempt, 1);

        let mut link = broker.accept(0).await;
        assert_eq!(link.next_subscribe().await, vec!["lock/response/D1"]);
        eventually(|| handle.state() == ConnectionState::Connected).await;

        handle.disconnect().await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn bad_credentials_park_in_error() {
        let broker = FakeBroker::start().await;
        let handle = handle();

        let connecting = spawn_connect(&handle, &broker);
        let _link = broker.accept(4).await;
        let result = within(connecting).await.unwrap();

        assert!(matches!(result, Err(ConnectError::Rejected(_))));
        assert_eq!(handle.state(), ConnectionState::Error);
        assert!(handle
            .status()
            .last_error
            .unwrap()
            .contains("BadUserNamePassword"));
    }

    #[tokio::test]
    async fn refused_reconnect_parks_in_error() {
        let broker = FakeBroker::start().await;
        let handle = handle();
        let mut events = handle.events();

        let connecting = spawn_connect(&handle, &broker);
        let link = broker.accept(0).await;
        within(connecting).await.unwrap().unwrap();

        drop(link);
        let _refused = broker.accept(5).await;

        eventually(|| handle.state() == ConnectionState::Error).await;
        assert!(handle.status().last_error.unwrap().contains("NotAuthorized"));
        let failure = within(async {
            loop {
                if let TransportEvent::Error(message) = events.recv().await.unwrap() {
                    return message;
                }
            }
        })
        .await;
        assert!(failure.contains("NotAuthorized"));

        handle.disconnect().await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }
}
