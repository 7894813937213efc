//! # Device Module
//!
//! What the client knows about its locks.
//!
//! ```text
//! device/
//! ├── status.rs       - DeviceStatus, LockAction, optimistic StatusPatch
//! ├── state_store.rs  - Per-device mirror with stale-update rejection and observers
//! └── history.rs      - Bounded newest-first action log
//! ```
//!
//! Both the store and the history use interior locking and are shared behind
//! `Arc`; readers always get whole values, never a half-written status.

pub mod history;
pub mod state_store;
pub mod status;
