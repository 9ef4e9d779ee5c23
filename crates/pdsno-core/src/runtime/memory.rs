// crates/pdsno-core/src/runtime/memory.rs
// ============================================================================
// Module: In-Memory NIB
// Description: Mutex-guarded reference implementation of the NIB contract.
// Purpose: Back tests and single-process deployments without a database.
// Dependencies: serde_json, uuid, crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! [`InMemoryNib`] implements [`NibStore`] with the same observable
//! semantics as the SQLite store: MAC-keyed device upserts, version
//! compare-and-swap, tamper-evident append-only events, and TTL-scoped
//! coordination locks. State is process-local and lost on exit.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

use uuid::Uuid;

use crate::core::entity::ConfigRecord;
use crate::core::entity::Controller;
use crate::core::entity::ControllerRole;
use crate::core::entity::Device;
use crate::core::entity::DeviceStatus;
use crate::core::entity::LockType;
use crate::core::entity::NibEvent;
use crate::core::entity::NibLock;
use crate::core::entity::Policy;
use crate::core::hashing;
use crate::core::identifiers::ConfigId;
use crate::core::identifiers::ControllerId;
use crate::core::identifiers::DeviceId;
use crate::core::identifiers::EventId;
use crate::core::identifiers::LockId;
use crate::core::identifiers::MacAddress;
use crate::core::identifiers::Region;
use crate::core::time::UtcTimestamp;
use crate::interfaces::NibError;
use crate::interfaces::NibStore;
use crate::interfaces::UpsertReceipt;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Extracts the admission sequence from a permanent controller id of the
/// form `<role>_cntl_<region>_<seq>`; returns `None` for other shapes.
#[must_use]
pub fn parse_admission_sequence(controller_id: &ControllerId, role: ControllerRole) -> Option<u64> {
    let id = controller_id.as_str();
    let prefix = format!("{}_cntl_", role.as_str());
    let rest = id.strip_prefix(&prefix)?;
    let (_, seq) = rest.rsplit_once('_')?;
    seq.parse().ok()
}

/// Computes the tamper-evidence tag for an event under the store secret.
fn event_tag(secret: &[u8], event: &NibEvent) -> Result<String, NibError> {
    event.compute_tag(secret).map_err(|err| NibError::Storage(err.to_string()))
}

/// Returns the 8-character prefix of a fresh UUID in simple form.
fn short_uuid(len: usize) -> String {
    Uuid::new_v4().simple().to_string().chars().take(len).collect()
}

// ============================================================================
// SECTION: State
// ============================================================================

/// Mutable state behind the store mutex.
#[derive(Debug, Default)]
struct MemoryState {
    /// Devices keyed by NIB device id.
    devices: BTreeMap<String, Device>,
    /// MAC identity index into `devices`.
    mac_index: BTreeMap<String, String>,
    /// Controllers keyed by id.
    controllers: BTreeMap<String, Controller>,
    /// Configuration records keyed by id.
    configs: BTreeMap<String, ConfigRecord>,
    /// Policies keyed by id.
    policies: BTreeMap<String, Policy>,
    /// Append-only event log in insertion order.
    events: Vec<NibEvent>,
    /// Live coordination locks (expired entries swept on acquisition).
    locks: Vec<NibLock>,
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// In-memory [`NibStore`] implementation.
///
/// # Invariants
/// - All mutation happens under one mutex; readers see committed snapshots.
/// - The event log only ever grows.
pub struct InMemoryNib {
    /// Secret used for event tamper-evidence tags.
    event_secret: Vec<u8>,
    /// Guarded state.
    state: Mutex<MemoryState>,
}

impl InMemoryNib {
    /// Creates a store with the given event-log secret.
    #[must_use]
    pub fn new(event_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            event_secret: event_secret.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Acquires the state mutex, mapping poisoning to a storage error.
    fn guard(&self) -> Result<MutexGuard<'_, MemoryState>, NibError> {
        self.state.lock().map_err(|_| NibError::Storage("state mutex poisoned".to_string()))
    }
}

impl NibStore for InMemoryNib {
    fn get_device(&self, device_id: &DeviceId) -> Result<Option<Device>, NibError> {
        Ok(self.guard()?.devices.get(device_id.as_str()).cloned())
    }

    fn get_device_by_mac(&self, mac: &MacAddress) -> Result<Option<Device>, NibError> {
        let state = self.guard()?;
        Ok(state
            .mac_index
            .get(mac.as_str())
            .and_then(|device_id| state.devices.get(device_id))
            .cloned())
    }

    fn upsert_device(&self, device: &Device) -> Result<UpsertReceipt, NibError> {
        let mut state = self.guard()?;
        if let Some(existing_id) = state.mac_index.get(device.mac_address.as_str()).cloned() {
            let Some(existing) = state.devices.get(&existing_id) else {
                return Err(NibError::Storage("mac index points at missing device".to_string()));
            };
            if existing.version != device.version {
                return Err(NibError::Conflict);
            }
            let mut updated = device.clone();
            updated.device_id = existing.device_id.clone();
            updated.temp_scan_id = existing.temp_scan_id.clone();
            updated.first_seen = existing.first_seen;
            updated.version = existing.version + 1;
            let version = updated.version;
            state.devices.insert(existing_id.clone(), updated);
            return Ok(UpsertReceipt {
                entity_id: existing_id,
                version,
            });
        }
        let mut inserted = device.clone();
        if inserted.device_id.as_str().is_empty() {
            inserted.device_id = DeviceId::new(format!("nib-dev-{}", short_uuid(8)));
        }
        inserted.version = 0;
        let id = inserted.device_id.as_str().to_string();
        state.mac_index.insert(inserted.mac_address.as_str().to_string(), id.clone());
        state.devices.insert(id.clone(), inserted);
        Ok(UpsertReceipt {
            entity_id: id,
            version: 0,
        })
    }

    fn active_devices(&self) -> Result<Vec<Device>, NibError> {
        Ok(self
            .guard()?
            .devices
            .values()
            .filter(|device| device.status == DeviceStatus::Active)
            .cloned()
            .collect())
    }

    fn get_controller(&self, controller_id: &ControllerId) -> Result<Option<Controller>, NibError> {
        Ok(self.guard()?.controllers.get(controller_id.as_str()).cloned())
    }

    fn controllers_by_region(&self, region: &Region) -> Result<Vec<Controller>, NibError> {
        Ok(self
            .guard()?
            .controllers
            .values()
            .filter(|controller| {
                controller.region.as_ref() == Some(region)
                    && controller.status == crate::core::entity::ControllerStatus::Active
            })
            .cloned()
            .collect())
    }

    fn upsert_controller(&self, controller: &Controller) -> Result<UpsertReceipt, NibError> {
        let mut state = self.guard()?;
        let id = controller.controller_id.as_str().to_string();
        if let Some(existing) = state.controllers.get(&id) {
            if existing.version != controller.version {
                return Err(NibError::Conflict);
            }
            let mut updated = controller.clone();
            updated.version = existing.version + 1;
            let version = updated.version;
            state.controllers.insert(id.clone(), updated);
            return Ok(UpsertReceipt {
                entity_id: id,
                version,
            });
        }
        let mut inserted = controller.clone();
        inserted.version = 0;
        state.controllers.insert(id.clone(), inserted);
        Ok(UpsertReceipt {
            entity_id: id,
            version: 0,
        })
    }

    fn max_sequence_for_role(&self, role: ControllerRole) -> Result<u64, NibError> {
        Ok(self
            .guard()?
            .controllers
            .values()
            .filter_map(|controller| parse_admission_sequence(&controller.controller_id, role))
            .max()
            .unwrap_or(0))
    }

    fn get_config(&self, config_id: &ConfigId) -> Result<Option<ConfigRecord>, NibError> {
        Ok(self.guard()?.configs.get(config_id.as_str()).cloned())
    }

    fn upsert_config(&self, config: &ConfigRecord) -> Result<UpsertReceipt, NibError> {
        let mut state = self.guard()?;
        let id = config.config_id.as_str().to_string();
        if let Some(existing) = state.configs.get(&id) {
            if existing.version != config.version {
                return Err(NibError::Conflict);
            }
            let mut updated = config.clone();
            updated.version = existing.version + 1;
            let version = updated.version;
            state.configs.insert(id.clone(), updated);
            return Ok(UpsertReceipt {
                entity_id: id,
                version,
            });
        }
        let mut inserted = config.clone();
        inserted.version = 0;
        state.configs.insert(id.clone(), inserted);
        Ok(UpsertReceipt {
            entity_id: id,
            version: 0,
        })
    }

    fn get_policy(&self, policy_id: &str) -> Result<Option<Policy>, NibError> {
        Ok(self.guard()?.policies.get(policy_id).cloned())
    }

    fn upsert_policy(&self, policy: &Policy) -> Result<UpsertReceipt, NibError> {
        let mut state = self.guard()?;
        let id = policy.policy_id.clone();
        if let Some(existing) = state.policies.get(&id) {
            if existing.version != policy.version {
                return Err(NibError::Conflict);
            }
            let mut updated = policy.clone();
            updated.version = existing.version + 1;
            let version = updated.version;
            state.policies.insert(id.clone(), updated);
            return Ok(UpsertReceipt {
                entity_id: id,
                version,
            });
        }
        let mut inserted = policy.clone();
        inserted.version = 0;
        state.policies.insert(id.clone(), inserted);
        Ok(UpsertReceipt {
            entity_id: id,
            version: 0,
        })
    }

    fn write_event(&self, event: &NibEvent) -> Result<EventId, NibError> {
        let mut stored = event.clone();
        if stored.event_id.as_str().is_empty() {
            stored.event_id = EventId::new(format!("evt-{}", short_uuid(12)));
        }
        stored.signature = Some(event_tag(&self.event_secret, &stored)?);
        let mut state = self.guard()?;
        if state.events.iter().any(|existing| existing.event_id == stored.event_id) {
            return Err(NibError::ConstraintViolation(format!(
                "duplicate event id {}",
                stored.event_id
            )));
        }
        let event_id = stored.event_id.clone();
        state.events.push(stored);
        Ok(event_id)
    }

    fn verify_event(&self, event: &NibEvent) -> Result<bool, NibError> {
        let expected = event_tag(&self.event_secret, event)?;
        Ok(event
            .signature
            .as_ref()
            .is_some_and(|tag| hashing::constant_time_eq(tag.as_bytes(), expected.as_bytes())))
    }

    fn events_by_type(&self, event_type: &str) -> Result<Vec<NibEvent>, NibError> {
        Ok(self
            .guard()?
            .events
            .iter()
            .rev()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect())
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<NibEvent>, NibError> {
        Ok(self.guard()?.events.iter().rev().take(limit).cloned().collect())
    }

    fn acquire_lock(
        &self,
        subject_id: &str,
        lock_type: LockType,
        held_by: &ControllerId,
        ttl_seconds: i64,
        now: UtcTimestamp,
    ) -> Result<NibLock, NibError> {
        let mut state = self.guard()?;
        state.locks.retain(|lock| !lock.is_expired(&now));
        if let Some(existing) = state
            .locks
            .iter()
            .find(|lock| lock.subject_id == subject_id && lock.lock_type == lock_type)
        {
            return Err(NibError::Locked {
                holder: existing.held_by.as_str().to_string(),
            });
        }
        let lock = NibLock {
            lock_id: LockId::new(format!("lock-{}", short_uuid(12))),
            subject_id: subject_id.to_string(),
            lock_type,
            held_by: held_by.clone(),
            acquired_at: now,
            expires_at: now.plus_seconds(ttl_seconds),
        };
        state.locks.push(lock.clone());
        Ok(lock)
    }

    fn release_lock(&self, lock_id: &LockId, held_by: &ControllerId) -> Result<(), NibError> {
        let mut state = self.guard()?;
        let before = state.locks.len();
        state.locks.retain(|lock| !(lock.lock_id == *lock_id && lock.held_by == *held_by));
        if state.locks.len() == before {
            return Err(NibError::NotFound(format!("lock {lock_id} held by {held_by}")));
        }
        Ok(())
    }

    fn check_lock(
        &self,
        subject_id: &str,
        lock_type: LockType,
        now: UtcTimestamp,
    ) -> Result<Option<NibLock>, NibError> {
        Ok(self
            .guard()?
            .locks
            .iter()
            .find(|lock| {
                lock.subject_id == subject_id
                    && lock.lock_type == lock_type
                    && !lock.is_expired(&now)
            })
            .cloned())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::InMemoryNib;
    use super::parse_admission_sequence;
    use crate::core::entity::Controller;
    use crate::core::entity::ControllerRole;
    use crate::core::entity::ControllerStatus;
    use crate::core::entity::Device;
    use crate::core::entity::DeviceStatus;
    use crate::core::entity::LockType;
    use crate::core::entity::NibEvent;
    use crate::core::identifiers::ControllerId;
    use crate::core::identifiers::DeviceId;
    use crate::core::identifiers::EventId;
    use crate::core::identifiers::MacAddress;
    use crate::core::identifiers::Region;
    use crate::core::time::UtcTimestamp;
    use crate::interfaces::NibError;
    use crate::interfaces::NibStore;

    fn store() -> InMemoryNib {
        InMemoryNib::new(*b"0123456789abcdef0123456789abcdef")
    }

    fn sample_device(mac: &str, ip: [u8; 4]) -> Device {
        Device {
            device_id: DeviceId::new(""),
            temp_scan_id: None,
            ip_address: ip.into(),
            mac_address: MacAddress::new(mac),
            hostname: None,
            vendor: None,
            device_type: None,
            status: DeviceStatus::Active,
            first_seen: None,
            last_seen: None,
            managed_by: None,
            region: Some(Region::new("zone-A")),
            version: 0,
            metadata: Map::new(),
        }
    }

    #[test]
    fn device_upsert_keys_off_mac_and_increments_version() {
        let nib = store();
        let receipt = nib.upsert_device(&sample_device("aa:bb:cc:00:00:01", [10, 0, 0, 1])).unwrap();
        assert_eq!(receipt.version, 0);

        let mut update = sample_device("aa:bb:cc:00:00:01", [10, 0, 0, 2]);
        update.version = 0;
        let receipt = nib.upsert_device(&update).unwrap();
        assert_eq!(receipt.version, 1);

        let stored = nib.get_device_by_mac(&MacAddress::new("AA:BB:CC:00:00:01")).unwrap().unwrap();
        assert_eq!(stored.ip_address, std::net::Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn stale_version_conflicts_for_second_writer() {
        let nib = store();
        nib.upsert_device(&sample_device("aa:bb:cc:00:00:02", [10, 0, 0, 3])).unwrap();
        let first = nib.get_device_by_mac(&MacAddress::new("aa:bb:cc:00:00:02")).unwrap().unwrap();
        let second = first.clone();

        let mut winner = first;
        winner.hostname = Some("sw-1".to_string());
        assert!(nib.upsert_device(&winner).is_ok());

        let mut loser = second;
        loser.hostname = Some("sw-2".to_string());
        assert!(matches!(nib.upsert_device(&loser), Err(NibError::Conflict)));
    }

    #[test]
    fn events_are_tagged_and_verifiable() {
        let nib = store();
        let event = NibEvent {
            event_id: EventId::new(""),
            event_type: "CONTROLLER_VALIDATED".to_string(),
            controller_id: ControllerId::new("global_cntl_1"),
            timestamp: UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap(),
            details: Map::new(),
            signature: None,
        };
        let event_id = nib.write_event(&event).unwrap();
        let stored = nib.events_by_type("CONTROLLER_VALIDATED").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event_id, event_id);
        assert!(nib.verify_event(&stored[0]).unwrap());

        let mut tampered = stored[0].clone();
        tampered.event_type = "CONTROLLER_REVOKED".to_string();
        assert!(!nib.verify_event(&tampered).unwrap());
    }

    #[test]
    fn lock_excludes_second_holder_until_expiry() {
        let nib = store();
        let now = UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap();
        let holder_a = ControllerId::new("regional_cntl_zone-A_1");
        let holder_b = ControllerId::new("regional_cntl_zone-A_2");

        let lock =
            nib.acquire_lock("config-1", LockType::ConfigApproval, &holder_a, 300, now).unwrap();
        assert!(matches!(
            nib.acquire_lock("config-1", LockType::ConfigApproval, &holder_b, 300, now),
            Err(NibError::Locked { .. })
        ));

        let later = now.plus_seconds(301);
        assert!(nib.check_lock("config-1", LockType::ConfigApproval, later).unwrap().is_none());
        assert!(
            nib.acquire_lock("config-1", LockType::ConfigApproval, &holder_b, 300, later).is_ok()
        );
        assert!(matches!(nib.release_lock(&lock.lock_id, &holder_a), Err(NibError::NotFound(_))));
    }

    #[test]
    fn max_sequence_is_seeded_from_persisted_ids() {
        let nib = store();
        for seq in [1_u64, 3, 2] {
            let controller = Controller {
                controller_id: ControllerId::new(format!("regional_cntl_zone-A_{seq}")),
                role: ControllerRole::Regional,
                region: Some(Region::new("zone-A")),
                status: ControllerStatus::Active,
                validated_by: Some(ControllerId::new("global_cntl_1")),
                validated_at: Some(UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap()),
                public_key: None,
                certificate: None,
                capabilities: Vec::new(),
                metadata: Map::new(),
                version: 0,
            };
            nib.upsert_controller(&controller).unwrap();
        }
        assert_eq!(nib.max_sequence_for_role(ControllerRole::Regional).unwrap(), 3);
        assert_eq!(nib.max_sequence_for_role(ControllerRole::Local).unwrap(), 0);
        assert_eq!(
            parse_admission_sequence(
                &ControllerId::new("local_cntl_zone-B_7"),
                ControllerRole::Local
            ),
            Some(7)
        );
    }
}
