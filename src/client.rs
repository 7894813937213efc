//! # Lock Client
//!
//! One explicitly constructed instance per broker session, wiring the
//! transport, the subscription router, the pending-request table, the command
//! dispatcher, the device state store and the action history together.
//!
//! ```text
//!  lock()/unlock()/...          lock/response/{id}          lock/status/{id}
//!        │                              │                           │
//!        ▼                              ▼                           ▼
//!  CommandDispatcher ──publish──► (device) ──► router ──► PendingTable   DeviceStateStore
//!        │                                                              │
//!        └── success: optimistic patch + history entry ◄────────────────┘
//! ```
//!
//! Nothing here is global; drop the client and its handles to tear it down.

use crate::command::dispatcher::{
    new_request_id, CommandDispatcher, CommandObserver, DispatchSettings,
};
use crate::command::envelope::{CommandEnvelope, CommandType, ResponseEnvelope};
use crate::command::pending::{PendingTable, ResolveOutcome};
use crate::command::signing::MessageSigner;
use crate::device::history::{ActionHistory, ActionLogEntry, DEFAULT_CAPACITY};
use crate::device::state_store::{DeviceStateStore, UpdateOutcome};
use crate::device::status::{ActionType, DeviceStatus, LockAction, LockMethod, StatusPatch};
use crate::error::{CommandError, MalformedMessage, TransportError};
use crate::mqtt::config::DeliveryGuarantee;
use crate::mqtt::message_manager::{decode_payload, SubscriptionRouter, TopicHandler};
use crate::mqtt::mqtt_handler::MqttHandle;
use crate::mqtt::topic::{control_topic, parse_lock_topic, response_topic, status_topic, LockTopic};
use crate::mqtt::Publisher;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Sent as `userId` on every command
    pub user_id: String,
    pub dispatch: DispatchSettings,
    pub history_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            user_id: "lockbridge".into(),
            dispatch: DispatchSettings::default(),
            history_capacity: DEFAULT_CAPACITY,
        }
    }
}

fn topic_mismatch(topic: &str, expected: &str, got: &str) -> MalformedMessage {
    MalformedMessage::Shape {
        topic: topic.to_string(),
        source: <serde_json::Error as serde::de::Error>::custom(format!(
            "payload for device {got} on topic of device {expected}"
        )),
    }
}

fn device_of<'a>(topic: &'a str) -> Option<&'a str> {
    match parse_lock_topic(topic)? {
        LockTopic::Status(device) | LockTopic::Response(device) => Some(device),
        LockTopic::Control(_) => None,
    }
}

/// Applies a status broadcast and logs actions taken at the door
///
/// Remote actions are logged when their command is confirmed, so only a
/// changed `lastAction` with a non-remote method is recorded here. The first
/// status seen for a device only seeds the store.
pub fn apply_status_broadcast(
    store: &DeviceStateStore,
    history: &ActionHistory,
    status: DeviceStatus,
) -> UpdateOutcome {
    let action = status.last_action.clone();
    let device_id = status.device_id.clone();
    let outcome = store.apply_status_update(status);

    if let (UpdateOutcome::Accepted { previous: Some(previous) }, Some(action)) = (&outcome, action)
    {
        if previous.last_action.as_ref() != Some(&action) && action.method != LockMethod::Remote {
            history.record(ActionLogEntry::from_action(device_id, &action));
        }
    }
    outcome
}

/// Reflects every confirmed lock/unlock in the store and the history
///
/// Hooked into the dispatcher, so it sees confirmations from every entry
/// point: the convenience methods, `send_command` and the dispatcher itself.
struct ConfirmedActions {
    store: Arc<DeviceStateStore>,
    history: Arc<ActionHistory>,
}

impl CommandObserver for ConfirmedActions {
    fn command_confirmed(&self, envelope: &CommandEnvelope, response: &ResponseEnvelope) {
        let action_type = match envelope.command {
            CommandType::Lock => ActionType::Lock,
            CommandType::Unlock => ActionType::Unlock,
            _ => return,
        };
        let confirmed = LockAction::new(
            action_type,
            LockMethod::Remote,
            Some(envelope.user_id.clone()),
            response.timestamp,
        );
        self.store.apply_optimistic_patch(
            &envelope.device_id,
            &StatusPatch::from_action(confirmed.clone()),
        );
        self.history
            .record(ActionLogEntry::from_action(envelope.device_id.as_str(), &confirmed));
        info!("{} confirmed by {}", envelope.command, envelope.device_id);
    }
}

pub struct LockClient {
    settings: ClientSettings,
    publisher: Arc<dyn Publisher>,
    router: Arc<SubscriptionRouter>,
    pending: Arc<PendingTable>,
    dispatcher: Arc<CommandDispatcher>,
    store: Arc<DeviceStateStore>,
    history: Arc<ActionHistory>,
    transport: Option<Arc<MqttHandle>>,
}

impl LockClient {
    /// Wires a client over any publisher
    ///
    /// Inbound traffic has to be fed into `router`; with a broker that is the
    /// connection's event loop.
    pub fn new(
        publisher: Arc<dyn Publisher>,
        router: Arc<SubscriptionRouter>,
        pending: Arc<PendingTable>,
        settings: ClientSettings,
    ) -> Self {
        let store = Arc::new(DeviceStateStore::new());
        let history = Arc::new(ActionHistory::new(settings.history_capacity));
        let dispatcher = Arc::new(Self::build_dispatcher(
            &publisher, &pending, &settings, &store, &history,
        ));
        Self {
            store,
            history,
            settings,
            publisher,
            router,
            pending,
            dispatcher,
            transport: None,
        }
    }

    fn build_dispatcher(
        publisher: &Arc<dyn Publisher>,
        pending: &Arc<PendingTable>,
        settings: &ClientSettings,
        store: &Arc<DeviceStateStore>,
        history: &Arc<ActionHistory>,
    ) -> CommandDispatcher {
        CommandDispatcher::new(publisher.clone(), pending.clone(), settings.dispatch.clone())
            .with_observer(Arc::new(ConfirmedActions {
                store: store.clone(),
                history: history.clone(),
            }))
    }

    /// Wires a client over an MQTT connection, sharing its router and table
    pub fn over_mqtt(transport: Arc<MqttHandle>, settings: ClientSettings) -> Self {
        let publisher: Arc<dyn Publisher> = transport.clone();
        let mut client = Self::new(
            publisher,
            transport.router().clone(),
            transport.pending().clone(),
            settings,
        );
        client.transport = Some(transport);
        client
    }

    pub fn with_signer(mut self, signer: Arc<dyn MessageSigner>) -> Self {
        self.dispatcher = Arc::new(
            Self::build_dispatcher(
                &self.publisher,
                &self.pending,
                &self.settings,
                &self.store,
                &self.history,
            )
            .with_signer(signer),
        );
        self
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    pub fn router(&self) -> &Arc<SubscriptionRouter> {
        &self.router
    }

    pub fn store(&self) -> &Arc<DeviceStateStore> {
        &self.store
    }

    pub fn history(&self) -> &Arc<ActionHistory> {
        &self.history
    }

    pub fn transport(&self) -> Option<&Arc<MqttHandle>> {
        self.transport.as_ref()
    }

    fn response_handler(&self, device_id: &str) -> Arc<dyn TopicHandler> {
        let dispatcher = self.dispatcher.clone();
        let expected = device_id.to_string();
        let handler = move |topic: &str, payload: &Value| -> Result<(), MalformedMessage> {
            let response: ResponseEnvelope = decode_payload(topic, payload)?;
            if device_of(topic) != Some(response.device_id.as_str()) {
                return Err(topic_mismatch(topic, &expected, &response.device_id));
            }
            if dispatcher.handle_response(response) == ResolveOutcome::Interim {
                debug!("Interim acknowledgement on {}", topic);
            }
            Ok(())
        };
        Arc::new(handler)
    }

    fn status_handler(&self, device_id: &str) -> Arc<dyn TopicHandler> {
        let store = self.store.clone();
        let history = self.history.clone();
        let expected = device_id.to_string();
        let handler = move |topic: &str, payload: &Value| -> Result<(), MalformedMessage> {
            let status: DeviceStatus = decode_payload(topic, payload)?;
            if device_of(topic) != Some(status.device_id.as_str()) {
                return Err(topic_mismatch(topic, &expected, &status.device_id));
            }
            apply_status_broadcast(&store, &history, status);
            Ok(())
        };
        Arc::new(handler)
    }

    /// Starts following a device's responses and status broadcasts
    pub async fn attach_device(&self, device_id: &str) -> Result<(), TransportError> {
        let routes = [
            (response_topic(device_id), self.response_handler(device_id)),
            (status_topic(device_id), self.status_handler(device_id)),
        ];

        for (pattern, handler) in routes {
            match &self.transport {
                Some(transport) => transport.subscribe(&pattern, handler).await?,
                None => {
                    self.router.register(pattern, handler);
                }
            }
        }
        info!("Attached device {}", device_id);
        Ok(())
    }

    pub async fn detach_device(&self, device_id: &str) -> Result<(), TransportError> {
        for pattern in [response_topic(device_id), status_topic(device_id)] {
            match &self.transport {
                Some(transport) => transport.unsubscribe(&pattern).await?,
                None => {
                    self.router.remove(&pattern);
                }
            }
        }
        info!("Detached device {}", device_id);
        Ok(())
    }

    fn envelope(&self, command: CommandType, device_id: &str) -> CommandEnvelope {
        CommandEnvelope::new(command, device_id, self.settings.user_id.as_str())
    }

    /// Sends a single command without retries
    pub async fn send_command(
        &self,
        envelope: CommandEnvelope,
        timeout: Option<Duration>,
    ) -> Result<ResponseEnvelope, CommandError> {
        self.dispatcher.send_command(envelope, timeout).await
    }

    pub async fn lock(&self, device_id: &str) -> Result<ResponseEnvelope, CommandError> {
        self.lock_action(device_id, ActionType::Lock).await
    }

    pub async fn unlock(&self, device_id: &str) -> Result<ResponseEnvelope, CommandError> {
        self.lock_action(device_id, ActionType::Unlock).await
    }

    async fn lock_action(
        &self,
        device_id: &str,
        action_type: ActionType,
    ) -> Result<ResponseEnvelope, CommandError> {
        let command = match action_type {
            ActionType::Lock => CommandType::Lock,
            ActionType::Unlock => CommandType::Unlock,
        };
        let response = self
            .dispatcher
            .send_with_retries(self.envelope(command, device_id), None)
            .await?;

        self.request_status_refresh(device_id).await;
        Ok(response)
    }

    /// Asks the device for a fresh broadcast without waiting for the answer
    async fn request_status_refresh(&self, device_id: &str) {
        let envelope = self
            .envelope(CommandType::GetStatus, device_id)
            .with_request_id(new_request_id());
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode status refresh: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .publisher
            .publish(&control_topic(device_id), payload, DeliveryGuarantee::AtLeastOnce)
            .await
        {
            warn!("Status refresh for {} not sent: {}", device_id, e);
        }
    }

    /// Queries the device; a status carried in the answer is applied to the store
    pub async fn get_status(&self, device_id: &str) -> Result<ResponseEnvelope, CommandError> {
        let response = self
            .dispatcher
            .send_with_retries(self.envelope(CommandType::GetStatus, device_id), None)
            .await?;

        if let Some(data) = &response.data {
            match serde_json::from_value::<DeviceStatus>(data.clone()) {
                Ok(status) if status.device_id == device_id => {
                    apply_status_broadcast(&self.store, &self.history, status);
                }
                Ok(status) => warn!(
                    "Status answer for {} names device {}",
                    device_id, status.device_id
                ),
                Err(e) => debug!("get_status answer carries no status: {}", e),
            }
        }
        Ok(response)
    }

    pub async fn set_password(
        &self,
        device_id: &str,
        password: &str,
    ) -> Result<ResponseEnvelope, CommandError> {
        let envelope = self
            .envelope(CommandType::SetPassword, device_id)
            .with_param("password", password);
        self.send_command(envelope, None).await
    }

    pub async fn enroll_fingerprint(
        &self,
        device_id: &str,
        label: &str,
    ) -> Result<ResponseEnvelope, CommandError> {
        let envelope = self
            .envelope(CommandType::EnrollFingerprint, device_id)
            .with_param("label", label);
        self.send_command(envelope, None).await
    }

    pub async fn delete_fingerprint(
        &self,
        device_id: &str,
        fingerprint_id: &str,
    ) -> Result<ResponseEnvelope, CommandError> {
        let envelope = self
            .envelope(CommandType::DeleteFingerprint, device_id)
            .with_param("fingerprintId", fingerprint_id);
        self.send_command(envelope, None).await
    }

    pub async fn start_stream(&self, device_id: &str) -> Result<ResponseEnvelope, CommandError> {
        self.send_command(self.envelope(CommandType::StartStream, device_id), None)
            .await
    }

    pub async fn take_snapshot(&self, device_id: &str) -> Result<ResponseEnvelope, CommandError> {
        self.send_command(self.envelope(CommandType::TakeSnapshot, device_id), None)
            .await
    }
}
