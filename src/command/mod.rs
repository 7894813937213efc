//! # Command Module
//!
//! Turns a lock command into exactly one outcome.
//!
//! ## Module Architecture
//!
//! ```text
//! command/
//! ├── envelope.rs    - Command and response envelopes (wire format)
//! ├── pending.rs     - Pending-request table, typestate request lifecycle
//! ├── dispatcher.rs  - Publish, await, time out, retry with fresh ids
//! └── signing.rs     - Pluggable envelope signing (HMAC-SHA256)
//! ```
//!
//! ## Correlation
//!
//! Responses are matched by `requestId` alone. The table is the only owner of
//! a waiting request, and removal from it is the single point where a request
//! terminates; duplicate, late or unknown responses find nothing to remove and
//! are dropped without effect.

pub mod dispatcher;
pub mod envelope;
pub mod pending;
pub mod signing;
