use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// How the bolt was last operated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMethod {
    Password,
    Fingerprint,
    Remote,
    Key,
}

impl fmt::Display for LockMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Password => "password",
            Self::Fingerprint => "fingerprint",
            Self::Remote => "remote",
            Self::Key => "key",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Lock,
    Unlock,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock => f.write_str("lock"),
            Self::Unlock => f.write_str("unlock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub method: LockMethod,
    /// Absent for actions at the door (keypad, key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl LockAction {
    pub fn new(
        action_type: ActionType,
        method: LockMethod,
        user_id: Option<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            action_type,
            method,
            user_id,
            timestamp,
        }
    }
}

/// Device status as broadcast on `lock/status/{deviceId}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    pub is_locked: bool,
    pub lock_method: LockMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<LockAction>,
    /// Epoch milliseconds, never decreases for a device
    ///
    /// Only device broadcasts move it; local patches leave it alone.
    pub last_action_at: i64,
    #[serde(deserialize_with = "percent")]
    pub battery_level: u8,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

fn percent<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let level = u8::deserialize(deserializer)?;
    if level > 100 {
        return Err(serde::de::Error::custom(format!(
            "batteryLevel {level} is outside 0-100"
        )));
    }
    Ok(level)
}

/// Partial update applied locally after a confirmed command
///
/// Only the fields that are `Some` are written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusPatch {
    pub is_locked: Option<bool>,
    pub lock_method: Option<LockMethod>,
    pub last_action: Option<LockAction>,
    pub battery_level: Option<u8>,
    pub is_online: Option<bool>,
    pub error_code: Option<String>,
}

impl StatusPatch {
    /// Patch reflecting a lock or unlock the client just saw confirmed
    pub fn from_action(action: LockAction) -> Self {
        Self {
            is_locked: Some(action.action_type == ActionType::Lock),
            lock_method: Some(action.method),
            last_action: Some(action),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, status: &mut DeviceStatus) {
        if let Some(locked) = self.is_locked {
            status.is_locked = locked;
        }
        if let Some(method) = self.lock_method {
            status.lock_method = method;
        }
        if let Some(action) = &self.last_action {
            status.last_action = Some(action.clone());
        }
        if let Some(level) = self.battery_level {
            status.battery_level = level.min(100);
        }
        if let Some(online) = self.is_online {
            status.is_online = online;
        }
        if let Some(code) = &self.error_code {
            status.error_code = Some(code.clone());
        }
    }
}
