//! # lockbridge
//!
//! Command/response correlation for locks driven over MQTT.
//!
//! Every command issued through a [`client::LockClient`] ends in exactly one
//! outcome: the device's answer, a device-reported error, a timeout, or a
//! cancellation when the broker session drops. Status broadcasts keep a local
//! mirror of each lock current and feed a bounded action history.

pub mod client;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod mqtt;
