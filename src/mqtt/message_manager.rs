use crate::error::MalformedMessage;
use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// One message as delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = String::from_utf8_lossy(&self.payload);
        let preview: String = content.chars().take(40).collect();
        write!(f, "{} - {}: {}", self.received_at, self.topic, preview)
    }
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{}: {}\n{}",
            self.received_at,
            self.topic,
            String::from_utf8_lossy(&self.payload)
        )
    }
}

/// Receives decoded payloads for one topic pattern
///
/// Handlers run on the connection's event loop, in arrival order, and must not
/// block.
pub trait TopicHandler: Send + Sync {
    fn handle(&self, topic: &str, payload: &Value) -> Result<(), MalformedMessage>;
}

impl<F> TopicHandler for F
where
    F: Fn(&str, &Value) -> Result<(), MalformedMessage> + Send + Sync,
{
    fn handle(&self, topic: &str, payload: &Value) -> Result<(), MalformedMessage> {
        self(topic, payload)
    }
}

/// Decodes a JSON value into a typed payload for a handler
pub fn decode_payload<T: DeserializeOwned>(
    topic: &str,
    payload: &Value,
) -> Result<T, MalformedMessage> {
    T::deserialize(payload).map_err(|source| MalformedMessage::Shape {
        topic: topic.to_string(),
        source,
    })
}

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    NoHandler,
    Malformed,
}

/// Topic pattern → handler table
///
/// Re-registering a pattern replaces its handler. An exact pattern wins over
/// wildcards; among wildcards the longest (most specific) filter wins.
#[derive(Default)]
pub struct SubscriptionRouter {
    handlers: RwLock<HashMap<String, Arc<dyn TopicHandler>>>,
    malformed: AtomicUsize,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when an existing handler was replaced
    pub fn register(&self, pattern: impl Into<String>, handler: Arc<dyn TopicHandler>) -> bool {
        let pattern = pattern.into();
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let replaced = handlers.insert(pattern.clone(), handler).is_some();
        debug!(
            "{} handler for {}",
            if replaced { "Replaced" } else { "Registered" },
            pattern
        );
        replaced
    }

    pub fn remove(&self, pattern: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pattern)
            .is_some()
    }

    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        patterns.sort();
        patterns
    }

    /// Messages dropped because they could not be decoded
    pub fn malformed_count(&self) -> usize {
        self.malformed.load(Ordering::Relaxed)
    }

    fn lookup(&self, topic: &str) -> Option<Arc<dyn TopicHandler>> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(handler) = handlers.get(topic) {
            return Some(handler.clone());
        }

        handlers
            .iter()
            .filter(|(pattern, _)| {
                rumqttc::has_wildcards(pattern) && rumqttc::matches(topic, pattern)
            })
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, handler)| handler.clone())
    }

    /// Decodes and hands one message to its handler
    ///
    /// Decode failures are logged and counted, never returned.
    pub fn dispatch(&self, message: &InboundMessage) -> RouteOutcome {
        let Some(handler) = self.lookup(&message.topic) else {
            debug!("No handler for {}", message.topic);
            return RouteOutcome::NoHandler;
        };

        let payload: Value = match serde_json::from_slice(&message.payload) {
            Ok(value) => value,
            Err(source) => {
                let err = MalformedMessage::Decode {
                    topic: message.topic.clone(),
                    source,
                };
                return self.drop_malformed(err);
            }
        };

        match handler.handle(&message.topic, &payload) {
            Ok(()) => RouteOutcome::Delivered,
            Err(err) => self.drop_malformed(err),
        }
    }

    fn drop_malformed(&self, err: MalformedMessage) -> RouteOutcome {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        warn!("Dropping message: {}", err);
        RouteOutcome::Malformed
    }
}
