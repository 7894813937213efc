use crate::device::status::{ActionType, LockAction, LockMethod};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    pub device_id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub method: LockMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub timestamp: i64,
}

impl ActionLogEntry {
    pub fn from_action(device_id: impl Into<String>, action: &LockAction) -> Self {
        Self {
            device_id: device_id.into(),
            action_type: action.action_type,
            method: action.method,
            user_id: action.user_id.clone(),
            timestamp: action.timestamp,
        }
    }
}

/// Filter for [`ActionHistory::query`]; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub device_id: Option<String>,
    pub method: Option<LockMethod>,
    pub user_id: Option<String>,
    /// Inclusive epoch-millis range
    pub range: Option<RangeInclusive<i64>>,
}

impl HistoryQuery {
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn method(mut self, method: LockMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn between(mut self, from: i64, to: i64) -> Self {
        self.range = Some(from..=to);
        self
    }

    fn matches(&self, entry: &ActionLogEntry) -> bool {
        self.device_id
            .as_ref()
            .map_or(true, |device| *device == entry.device_id)
            && self.method.map_or(true, |method| method == entry.method)
            && self
                .user_id
                .as_ref()
                .map_or(true, |user| entry.user_id.as_ref() == Some(user))
            && self
                .range
                .as_ref()
                .map_or(true, |range| range.contains(&entry.timestamp))
    }
}

/// Fixed-capacity, newest-first log of lock and unlock actions
pub struct ActionHistory {
    entries: RwLock<VecDeque<ActionLogEntry>>,
    capacity: usize,
}

impl Default for ActionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ActionHistory {
    /// A capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prepends the entry, evicting the oldest past capacity
    pub fn record(&self, entry: ActionLogEntry) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        debug!(
            "History: {} {} via {} at {}",
            entry.device_id, entry.action_type, entry.method, entry.timestamp
        );
        entries.push_front(entry);
        entries.truncate(self.capacity);
    }

    pub fn query(&self, query: &HistoryQuery) -> Vec<ActionLogEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|entry| query.matches(entry))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Whole log as pretty JSON, newest first
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_string_pretty(&*entries)
    }
}
