// crates/pdsno-approval/src/rollback.rs
// ============================================================================
// Module: Rollback Manager
// Description: Pre-execution backups and automatic or manual reversion.
// Purpose: Make every configuration execution undoable.
// Dependencies: pdsno-core, serde, uuid
// ============================================================================

//! ## Overview
//! Before a configuration executes, the current device command lines are
//! snapshotted into a backup keyed by a fresh id and tracked per device in
//! chronological order. A rollback validates that the backup belongs to the
//! device, re-applies the saved lines through the device adapter, and
//! records the outcome. `auto_rollback` picks the latest backup after an
//! execution failure.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use pdsno_core::BackupId;
use pdsno_core::Clock;
use pdsno_core::ConfigId;
use pdsno_core::ControllerId;
use pdsno_core::DeviceAdapter;
use pdsno_core::DeviceId;
use pdsno_core::UtcTimestamp;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tracing::error;
use tracing::info;
use uuid::Uuid;

// ============================================================================
// SECTION: Records
// ============================================================================

/// Snapshot of a device's configuration before an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigBackup {
    /// Backup identifier.
    pub backup_id: BackupId,
    /// Device the snapshot came from.
    pub device_id: DeviceId,
    /// Captured command lines.
    pub config_lines: Vec<String>,
    /// Capture time.
    pub created_at: UtcTimestamp,
    /// Arbitrary metadata (e.g. the config id it precedes).
    pub metadata: Map<String, Value>,
}

/// Outcome record of one rollback attempt.
///
/// # Invariants
/// - `error` is set iff `success` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEvent {
    /// Event identifier.
    pub event_id: String,
    /// Configuration being reverted.
    pub config_id: ConfigId,
    /// Target device.
    pub device_id: DeviceId,
    /// Backup that was applied.
    pub backup_id: BackupId,
    /// Controller that triggered the rollback.
    pub triggered_by: ControllerId,
    /// Trigger time.
    pub triggered_at: UtcTimestamp,
    /// Reason for the rollback.
    pub reason: String,
    /// Whether the device accepted the restored configuration.
    pub success: bool,
    /// Failure detail when unsuccessful.
    pub error: Option<String>,
}

// ============================================================================
// SECTION: Manager
// ============================================================================

/// Backup store and rollback driver for one controller.
///
/// # Invariants
/// - Per-device backup lists are chronological; `latest_backup` returns the
///   most recent.
pub struct RollbackManager {
    /// Owning controller.
    controller_id: ControllerId,
    /// Backups by id.
    backups: Mutex<HashMap<BackupId, ConfigBackup>>,
    /// Backup ids per device in creation order.
    device_backups: Mutex<HashMap<DeviceId, Vec<BackupId>>>,
    /// Rollback outcomes in order.
    events: Mutex<Vec<RollbackEvent>>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl RollbackManager {
    /// Creates a manager for a controller.
    #[must_use]
    pub fn new(controller_id: ControllerId, clock: Arc<dyn Clock>) -> Self {
        Self {
            controller_id,
            backups: Mutex::new(HashMap::new()),
            device_backups: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Snapshots a device's current command lines.
    #[must_use]
    pub fn create_backup(
        &self,
        device_id: &DeviceId,
        config_lines: Vec<String>,
        metadata: Map<String, Value>,
    ) -> ConfigBackup {
        let backup = ConfigBackup {
            backup_id: BackupId::new(format!("backup-{}", Uuid::new_v4())),
            device_id: device_id.clone(),
            config_lines,
            created_at: self.clock.now(),
            metadata,
        };
        if let Ok(mut backups) = self.backups.lock() {
            backups.insert(backup.backup_id.clone(), backup.clone());
        }
        if let Ok(mut per_device) = self.device_backups.lock() {
            per_device.entry(device_id.clone()).or_default().push(backup.backup_id.clone());
        }
        info!(
            backup = %backup.backup_id,
            device = %device_id,
            lines = backup.config_lines.len(),
            "created backup"
        );
        backup
    }

    /// Returns a backup by id.
    #[must_use]
    pub fn get_backup(&self, backup_id: &BackupId) -> Option<ConfigBackup> {
        self.backups.lock().ok().and_then(|backups| backups.get(backup_id).cloned())
    }

    /// Returns all backups for a device, oldest first.
    #[must_use]
    pub fn device_backups(&self, device_id: &DeviceId) -> Vec<ConfigBackup> {
        let ids = self
            .device_backups
            .lock()
            .ok()
            .and_then(|per_device| per_device.get(device_id).cloned())
            .unwrap_or_default();
        let Ok(backups) = self.backups.lock() else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| backups.get(id).cloned()).collect()
    }

    /// Returns the most recent backup for a device.
    #[must_use]
    pub fn latest_backup(&self, device_id: &DeviceId) -> Option<ConfigBackup> {
        self.device_backups(device_id).into_iter().max_by_key(|backup| backup.created_at)
    }

    /// Applies a backup to the device and records the outcome.
    ///
    /// Validation failures (unknown backup, wrong device) are recorded as
    /// failed events, not panics or errors.
    pub fn rollback(
        &self,
        config_id: &ConfigId,
        device_id: &DeviceId,
        backup_id: &BackupId,
        reason: &str,
        adapter: &mut dyn DeviceAdapter,
    ) -> RollbackEvent {
        let mut event = RollbackEvent {
            event_id: format!("rollback-{}", Uuid::new_v4()),
            config_id: config_id.clone(),
            device_id: device_id.clone(),
            backup_id: backup_id.clone(),
            triggered_by: self.controller_id.clone(),
            triggered_at: self.clock.now(),
            reason: reason.to_string(),
            success: false,
            error: None,
        };

        let Some(backup) = self.get_backup(backup_id) else {
            event.error = Some(format!("backup {backup_id} not found"));
            error!(backup = %backup_id, "rollback failed: backup not found");
            self.record(event.clone());
            return event;
        };
        if backup.device_id != *device_id {
            event.error =
                Some(format!("backup belongs to {}, not {device_id}", backup.device_id));
            error!(backup = %backup_id, device = %device_id, "rollback failed: device mismatch");
            self.record(event.clone());
            return event;
        }

        info!(
            backup = %backup_id,
            device = %device_id,
            lines = backup.config_lines.len(),
            "rolling back device"
        );
        match adapter.apply_config(&backup.config_lines) {
            Ok(outcome) if outcome.success => {
                event.success = true;
            }
            Ok(outcome) => {
                event.error =
                    Some(outcome.error.unwrap_or_else(|| "device rejected restore".to_string()));
            }
            Err(err) => {
                event.error = Some(err.to_string());
            }
        }
        if event.success {
            info!(event = %event.event_id, "rollback succeeded");
        } else {
            error!(event = %event.event_id, error = ?event.error, "rollback failed");
        }
        self.record(event.clone());
        event
    }

    /// Rolls back to the latest backup after an execution failure.
    ///
    /// Returns `None` when no backup exists for the device.
    pub fn auto_rollback(
        &self,
        config_id: &ConfigId,
        device_id: &DeviceId,
        failure_reason: &str,
        adapter: &mut dyn DeviceAdapter,
    ) -> Option<RollbackEvent> {
        let Some(backup) = self.latest_backup(device_id) else {
            error!(device = %device_id, "auto-rollback impossible: no backup available");
            return None;
        };
        info!(device = %device_id, failure_reason, "auto-rollback triggered");
        Some(self.rollback(
            config_id,
            device_id,
            &backup.backup_id,
            &format!("automatic rollback after failure: {failure_reason}"),
            adapter,
        ))
    }

    /// Drops all but the most recent `keep_count` backups for a device.
    pub fn cleanup_old_backups(&self, device_id: &DeviceId, keep_count: usize) -> usize {
        let mut all = self.device_backups(device_id);
        if all.len() <= keep_count {
            return 0;
        }
        all.sort_by_key(|backup| backup.created_at);
        let to_delete: Vec<BackupId> = all
            .iter()
            .take(all.len() - keep_count)
            .map(|backup| backup.backup_id.clone())
            .collect();

        let mut deleted = 0;
        if let (Ok(mut backups), Ok(mut per_device)) =
            (self.backups.lock(), self.device_backups.lock())
        {
            for backup_id in &to_delete {
                if backups.remove(backup_id).is_some() {
                    deleted += 1;
                }
                if let Some(ids) = per_device.get_mut(device_id) {
                    ids.retain(|id| id != backup_id);
                }
            }
        }
        info!(device = %device_id, deleted, kept = keep_count, "cleaned up old backups");
        deleted
    }

    /// Returns rollback history, optionally filtered by device.
    #[must_use]
    pub fn history(&self, device_id: Option<&DeviceId>) -> Vec<RollbackEvent> {
        let Ok(events) = self.events.lock() else {
            return Vec::new();
        };
        events
            .iter()
            .filter(|event| device_id.is_none_or(|wanted| event.device_id == *wanted))
            .cloned()
            .collect()
    }

    /// Appends an event to the history.
    fn record(&self, event: RollbackEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pdsno_core::AdapterError;
    use pdsno_core::ApplyOutcome;
    use pdsno_core::ConfigId;
    use pdsno_core::ControllerId;
    use pdsno_core::Device;
    use pdsno_core::DeviceAdapter;
    use pdsno_core::DeviceId;
    use pdsno_core::ManualClock;
    use pdsno_core::UtcTimestamp;
    use serde_json::Map;
    use serde_json::Value;

    use super::RollbackManager;

    /// Scripted adapter: applies succeed or fail by switch.
    struct ScriptedAdapter {
        /// Whether applies succeed.
        accept: bool,
        /// Commands from the last apply.
        last_applied: Vec<String>,
    }

    impl DeviceAdapter for ScriptedAdapter {
        fn connect(&mut self, _device: &Device) -> Result<(), AdapterError> {
            Ok(())
        }

        fn disconnect(&mut self) {}

        fn translate_intent(&self, _intent: &Value) -> Result<Vec<String>, AdapterError> {
            Ok(Vec::new())
        }

        fn apply_config(&mut self, commands: &[String]) -> Result<ApplyOutcome, AdapterError> {
            self.last_applied = commands.to_vec();
            if self.accept {
                Ok(ApplyOutcome {
                    success: true,
                    output: "ok".to_string(),
                    error: None,
                })
            } else {
                Ok(ApplyOutcome {
                    success: false,
                    output: String::new(),
                    error: Some("invalid command".to_string()),
                })
            }
        }

        fn get_running_config(&mut self) -> Result<Vec<String>, AdapterError> {
            Ok(self.last_applied.clone())
        }

        fn verify_config(&mut self, _intent: &Value) -> Result<bool, AdapterError> {
            Ok(true)
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn manager(clock: &Arc<ManualClock>) -> RollbackManager {
        RollbackManager::new(ControllerId::new("local_cntl_zone-A_1"), clock.clone())
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::starting_at(UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap()))
    }

    #[test]
    fn latest_backup_is_the_most_recent() {
        let clock = clock();
        let manager = manager(&clock);
        let device = DeviceId::new("switch-01");

        let _ = manager.create_backup(&device, vec!["hostname sw1".to_string()], Map::new());
        clock.advance_seconds(60);
        let newer =
            manager.create_backup(&device, vec!["hostname sw1-new".to_string()], Map::new());

        assert_eq!(manager.latest_backup(&device).unwrap().backup_id, newer.backup_id);
        assert_eq!(manager.device_backups(&device).len(), 2);
    }

    #[test]
    fn rollback_applies_the_saved_lines() {
        let clock = clock();
        let manager = manager(&clock);
        let device = DeviceId::new("switch-01");
        let backup =
            manager.create_backup(&device, vec!["vlan 100".to_string()], Map::new());

        let mut adapter = ScriptedAdapter {
            accept: true,
            last_applied: Vec::new(),
        };
        let event = manager.rollback(
            &ConfigId::new("config-1"),
            &device,
            &backup.backup_id,
            "manual revert",
            &mut adapter,
        );
        assert!(event.success);
        assert_eq!(adapter.last_applied, vec!["vlan 100".to_string()]);
        assert_eq!(manager.history(Some(&device)).len(), 1);
    }

    #[test]
    fn rollback_validates_backup_and_device_pairing() {
        let clock = clock();
        let manager = manager(&clock);
        let backup = manager.create_backup(
            &DeviceId::new("switch-01"),
            vec!["vlan 100".to_string()],
            Map::new(),
        );

        let mut adapter = ScriptedAdapter {
            accept: true,
            last_applied: Vec::new(),
        };
        let event = manager.rollback(
            &ConfigId::new("config-1"),
            &DeviceId::new("switch-02"),
            &backup.backup_id,
            "manual revert",
            &mut adapter,
        );
        assert!(!event.success);
        assert!(event.error.as_deref().is_some_and(|detail| detail.contains("belongs to")));
        assert!(adapter.last_applied.is_empty());
    }

    #[test]
    fn auto_rollback_uses_the_latest_backup_or_reports_none() {
        let clock = clock();
        let manager = manager(&clock);
        let device = DeviceId::new("switch-01");
        let mut adapter = ScriptedAdapter {
            accept: true,
            last_applied: Vec::new(),
        };

        assert!(
            manager
                .auto_rollback(&ConfigId::new("config-1"), &device, "apply failed", &mut adapter)
                .is_none()
        );

        let _ = manager.create_backup(&device, vec!["old line".to_string()], Map::new());
        let event = manager
            .auto_rollback(&ConfigId::new("config-1"), &device, "apply failed", &mut adapter)
            .unwrap();
        assert!(event.success);
        assert!(event.reason.contains("apply failed"));
    }

    #[test]
    fn cleanup_keeps_only_the_newest_backups() {
        let clock = clock();
        let manager = manager(&clock);
        let device = DeviceId::new("switch-01");
        for index in 0..5 {
            let _ = manager.create_backup(&device, vec![format!("line {index}")], Map::new());
            clock.advance_seconds(10);
        }
        assert_eq!(manager.cleanup_old_backups(&device, 2), 3);
        let remaining = manager.device_backups(&device);
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].config_lines, vec!["line 3".to_string()]);
        assert_eq!(remaining[1].config_lines, vec!["line 4".to_string()]);
    }
}
