//! Local mirror of device status
//!
//! Authoritative broadcasts replace a device's status wholesale, provided
//! their `lastActionAt` is not older than the stored one. Optimistic patches
//! are merged on top for immediate feedback but never touch `lastActionAt`,
//! so the visible value only moves forward and the next broadcast always wins.

use crate::device::status::{DeviceStatus, StatusPatch};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Authoritative,
    Optimistic,
}

/// Notification sent to observers for every accepted change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub device_id: String,
    pub status: DeviceStatus,
    pub source: ChangeSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Stored; carries what was there before
    Accepted { previous: Option<DeviceStatus> },
    /// Older than the stored `lastActionAt`, dropped
    Stale { stored_at: i64 },
}

impl UpdateOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

pub struct DeviceStateStore {
    devices: RwLock<HashMap<String, DeviceStatus>>,
    changes: broadcast::Sender<StatusChange>,
}

impl Default for DeviceStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStateStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            devices: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DeviceStatus>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DeviceStatus>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Observers see changes in the order they were applied
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    fn notify(&self, status: &DeviceStatus, source: ChangeSource) {
        // Nobody listening is fine.
        let _ = self.changes.send(StatusChange {
            device_id: status.device_id.clone(),
            status: status.clone(),
            source,
        });
    }

    /// Applies a broadcast from the device
    pub fn apply_status_update(&self, status: DeviceStatus) -> UpdateOutcome {
        let mut devices = self.write();

        if let Some(stored) = devices.get(&status.device_id) {
            if status.last_action_at < stored.last_action_at {
                info!(
                    "Rejecting stale status for {} ({} < {})",
                    status.device_id, status.last_action_at, stored.last_action_at
                );
                return UpdateOutcome::Stale {
                    stored_at: stored.last_action_at,
                };
            }
        }

        debug!(
            "Status for {}: locked={} battery={} at {}",
            status.device_id, status.is_locked, status.battery_level, status.last_action_at
        );
        self.notify(&status, ChangeSource::Authoritative);
        let previous = devices.insert(status.device_id.clone(), status);
        UpdateOutcome::Accepted { previous }
    }

    /// Merges a local patch into a known device; unknown devices are ignored
    pub fn apply_optimistic_patch(&self, device_id: &str, patch: &StatusPatch) -> bool {
        if patch.is_empty() {
            return false;
        }

        let mut devices = self.write();
        let Some(stored) = devices.get_mut(device_id) else {
            debug!("No status for {} yet, skipping optimistic patch", device_id);
            return false;
        };

        patch.apply_to(stored);
        debug!("Optimistic patch applied to {}", device_id);
        self.notify(stored, ChangeSource::Optimistic);
        true
    }

    pub fn snapshot(&self, device_id: &str) -> Option<DeviceStatus> {
        self.read().get(device_id).cloned()
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Forgets a device; its next broadcast is accepted unconditionally
    pub fn forget(&self, device_id: &str) -> bool {
        self.write().remove(device_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::status::{ActionType, LockAction, LockMethod};

    fn status(device: &str, at: i64, locked: bool) -> DeviceStatus {
        DeviceStatus {
            device_id: device.into(),
            is_locked: locked,
            lock_method: LockMethod::Key,
            last_action: None,
            last_action_at: at,
            battery_level: 80,
            is_online: true,
            error_code: None,
        }
    }

    #[test]
    fn stale_update_leaves_store_unchanged() {
        let store = DeviceStateStore::new();
        assert!(store.apply_status_update(status("D1", 100, true)).is_accepted());

        let outcome = store.apply_status_update(status("D1", 50, false));

        assert_eq!(outcome, UpdateOutcome::Stale { stored_at: 100 });
        let stored = store.snapshot("D1").unwrap();
        assert!(stored.is_locked);
        assert_eq!(stored.last_action_at, 100);
    }

    #[test]
    fn equal_timestamp_is_accepted() {
        let store = DeviceStateStore::new();
        store.apply_status_update(status("D1", 100, true));
        assert!(store.apply_status_update(status("D1", 100, false)).is_accepted());
        assert!(!store.snapshot("D1").unwrap().is_locked);
    }

    #[test]
    fn authoritative_update_erases_optimistic_fields() {
        let store = DeviceStateStore::new();
        store.apply_status_update(status("D1", 100, false));

        let patch = StatusPatch {
            error_code: Some("JAM".into()),
            ..StatusPatch::from_action(LockAction::new(
                ActionType::Lock,
                LockMethod::Remote,
                Some("u1".into()),
                500,
            ))
        };
        assert!(store.apply_optimistic_patch("D1", &patch));
        assert!(store.snapshot("D1").unwrap().is_locked);

        // older than the patch, newer than the last broadcast
        let authoritative = status("D1", 200, false);
        assert!(store.apply_status_update(authoritative.clone()).is_accepted());
        assert_eq!(store.snapshot("D1").unwrap(), authoritative);
    }

    #[test]
    fn visible_timestamp_never_goes_backwards() {
        let store = DeviceStateStore::new();
        let mut changes = store.subscribe();
        store.apply_status_update(status("D1", 100, false));

        let confirmed = LockAction::new(ActionType::Lock, LockMethod::Remote, None, 500);
        store.apply_optimistic_patch("D1", &StatusPatch::from_action(confirmed));
        assert_eq!(store.snapshot("D1").unwrap().last_action_at, 100);

        assert!(store.apply_status_update(status("D1", 200, true)).is_accepted());
        assert_eq!(
            store.apply_status_update(status("D1", 150, false)),
            UpdateOutcome::Stale { stored_at: 200 }
        );

        let mut seen = Vec::new();
        while let Ok(change) = changes.try_recv() {
            seen.push(change.status.last_action_at);
        }
        assert_eq!(seen, vec![100, 100, 200]);
    }

    #[test]
    fn patch_needs_a_known_device() {
        let store = DeviceStateStore::new();
        let patch = StatusPatch {
            is_locked: Some(true),
            ..StatusPatch::default()
        };
        assert!(!store.apply_optimistic_patch("D9", &patch));
        assert!(store.snapshot("D9").is_none());
    }

    #[test]
    fn devices_are_tracked_independently() {
        let store = DeviceStateStore::new();
        store.apply_status_update(status("D1", 100, true));
        assert!(store.apply_status_update(status("D2", 10, false)).is_accepted());
        assert_eq!(store.device_ids(), vec!["D1", "D2"]);

        assert!(store.forget("D1"));
        assert!(store.apply_status_update(status("D1", 1, false)).is_accepted());
    }

    #[tokio::test]
    async fn observers_see_accepted_changes_only() {
        let store = DeviceStateStore::new();
        let mut changes = store.subscribe();

        store.apply_status_update(status("D1", 100, true));
        store.apply_status_update(status("D1", 50, false));
        store.apply_optimistic_patch(
            "D1",
            &StatusPatch {
                battery_level: Some(40),
                ..StatusPatch::default()
            },
        );

        let first = changes.recv().await.unwrap();
        assert_eq!(first.source, ChangeSource::Authoritative);
        assert!(first.status.is_locked);

        let second = changes.recv().await.unwrap();
        assert_eq!(second.source, ChangeSource::Optimistic);
        assert_eq!(second.status.battery_level, 40);

        assert!(changes.try_recv().is_err());
    }
}
