//! # MQTT Transport Module
//!
//! Owns the single broker session the lock link runs on: connecting with a
//! last will, reconnecting with backoff, publishing commands and routing
//! inbound device traffic to the handlers registered for it.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connect options, backoff schedule, delivery guarantees
//! ├── topic.rs            - lock/control|response|status/{deviceId} naming, filter matching
//! ├── message_manager.rs  - Inbound messages and the subscription router
//! └── mqtt_handler.rs     - Connection state machine and event loop
//! ```
//!
//! ## Event Loop
//!
//! All inbound traffic is handled on one tokio task per connection. Messages
//! are decoded and dispatched in the order the broker delivered them, and
//! state transitions (including cancelling pending commands when the session
//! drops) happen on that same task.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod topic;

use crate::error::TransportError;
use async_trait::async_trait;
use config::DeliveryGuarantee;

/// Outbound side of the transport, as seen by the command dispatcher
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        guarantee: DeliveryGuarantee,
    ) -> Result<(), TransportError>;
}
