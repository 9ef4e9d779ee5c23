// crates/pdsno-security/src/keys.rs
// ============================================================================
// Module: Key Manager & Rotation Scheduler
// Description: Shared-secret storage per controller pair with rotation tracking.
// Purpose: Hold derived secrets and decide when each is due for replacement.
// Dependencies: pdsno-core, tracing
// ============================================================================

//! ## Overview
//! The [`KeyManager`] stores the symmetric secrets used between controller
//! pairs, keyed by the deterministic pairwise [`KeyId`]. The
//! [`KeyRotationScheduler`] tracks `created_at`/`rotates_at` per key; a
//! periodic check returns the keys past their rotation point, initiation
//! writes a new versioned key id alongside the old, and completion removes
//! the old key.
//!
//! Security posture: keys live only in process memory; secret-at-rest
//! encryption is a deployment concern outside this crate.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use pdsno_core::Clock;
use pdsno_core::KeyId;
use pdsno_core::UtcTimestamp;
use pdsno_core::hashing;
use thiserror::Error;
use tracing::debug;
use tracing::info;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Minimum stored key length in bytes.
pub const MIN_KEY_LENGTH: usize = 32;
/// Default rotation interval (90 days, in seconds).
pub const DEFAULT_ROTATION_INTERVAL_SECONDS: i64 = 90 * 24 * 60 * 60;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by key storage and rotation.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// Key shorter than [`MIN_KEY_LENGTH`].
    #[error("key must be at least {MIN_KEY_LENGTH} bytes")]
    KeyTooShort,
    /// Key id is not registered.
    #[error("unknown key: {0}")]
    UnknownKey(String),
    /// Internal synchronization failure.
    #[error("key store mutex poisoned")]
    Poisoned,
}

// ============================================================================
// SECTION: Key Manager
// ============================================================================

/// In-memory store of shared secrets for controller relationships.
///
/// # Invariants
/// - Every stored key is at least [`MIN_KEY_LENGTH`] bytes.
#[derive(Default)]
pub struct KeyManager {
    /// Keys by id.
    keys: Mutex<HashMap<KeyId, Vec<u8>>>,
}

impl KeyManager {
    /// Creates an empty key manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates, stores, and returns a fresh 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Poisoned`] on internal synchronization failure.
    pub fn generate_key(&self, key_id: &KeyId) -> Result<Vec<u8>, KeyError> {
        let key = hashing::random_bytes(MIN_KEY_LENGTH);
        self.guard()?.insert(key_id.clone(), key.clone());
        info!(key_id = %key_id, "generated new key");
        Ok(key)
    }

    /// Returns a key by id, if present.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Poisoned`] on internal synchronization failure.
    pub fn get_key(&self, key_id: &KeyId) -> Result<Option<Vec<u8>>, KeyError> {
        Ok(self.guard()?.get(key_id).cloned())
    }

    /// Stores a key under an id.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::KeyTooShort`] for undersized keys and
    /// [`KeyError::Poisoned`] on internal synchronization failure.
    pub fn set_key(&self, key_id: &KeyId, key: Vec<u8>) -> Result<(), KeyError> {
        if key.len() < MIN_KEY_LENGTH {
            return Err(KeyError::KeyTooShort);
        }
        self.guard()?.insert(key_id.clone(), key);
        debug!(key_id = %key_id, "stored key");
        Ok(())
    }

    /// Deletes a key; silently succeeds when absent.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Poisoned`] on internal synchronization failure.
    pub fn delete_key(&self, key_id: &KeyId) -> Result<(), KeyError> {
        if self.guard()?.remove(key_id).is_some() {
            info!(key_id = %key_id, "deleted key");
        }
        Ok(())
    }

    /// Lists all registered key ids.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Poisoned`] on internal synchronization failure.
    pub fn list_keys(&self) -> Result<Vec<KeyId>, KeyError> {
        let mut ids: Vec<KeyId> = self.guard()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Acquires the store mutex.
    fn guard(&self) -> Result<MutexGuard<'_, HashMap<KeyId, Vec<u8>>>, KeyError> {
        self.keys.lock().map_err(|_| KeyError::Poisoned)
    }
}

// ============================================================================
// SECTION: Rotation Scheduler
// ============================================================================

/// Rotation lifecycle of a tracked key.
///
/// # Invariants
/// - `Active → Rotating → Deleted` is the only forward path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStatus {
    /// In service, not yet due.
    Active,
    /// Replacement issued; old key still accepted.
    Rotating,
    /// Removed from the key manager.
    Deleted,
}

/// Rotation metadata for one key.
#[derive(Debug, Clone)]
struct RotationEntry {
    /// Registration time.
    created_at: UtcTimestamp,
    /// Instant after which the key is due for rotation.
    rotates_at: UtcTimestamp,
    /// Lifecycle position.
    status: RotationStatus,
}

/// Schedules gradual key rollover for registered keys.
///
/// # Invariants
/// - `due_for_rotation` only reports keys whose status is `Active`.
pub struct KeyRotationScheduler {
    /// Backing key storage.
    key_manager: Arc<KeyManager>,
    /// Interval between rotations in seconds.
    rotation_interval_seconds: i64,
    /// Tracked metadata per key id.
    metadata: Mutex<HashMap<KeyId, RotationEntry>>,
    /// Time source for due checks.
    clock: Arc<dyn Clock>,
}

impl KeyRotationScheduler {
    /// Creates a scheduler over a key manager.
    #[must_use]
    pub fn new(
        key_manager: Arc<KeyManager>,
        rotation_interval_seconds: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key_manager,
            rotation_interval_seconds,
            metadata: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Registers a key for rotation tracking starting now.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Poisoned`] on internal synchronization failure.
    pub fn register_key(&self, key_id: &KeyId) -> Result<(), KeyError> {
        let now = self.clock.now();
        self.guard()?.insert(
            key_id.clone(),
            RotationEntry {
                created_at: now,
                rotates_at: now.plus_seconds(self.rotation_interval_seconds),
                status: RotationStatus::Active,
            },
        );
        debug!(key_id = %key_id, interval = self.rotation_interval_seconds, "registered key for rotation");
        Ok(())
    }

    /// Returns the registration time of a key, when tracked.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Poisoned`] on internal synchronization failure.
    pub fn created_at(&self, key_id: &KeyId) -> Result<Option<UtcTimestamp>, KeyError> {
        Ok(self.guard()?.get(key_id).map(|entry| entry.created_at))
    }

    /// Returns the keys whose `rotates_at` has passed and are still active.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Poisoned`] on internal synchronization failure.
    pub fn due_for_rotation(&self) -> Result<Vec<KeyId>, KeyError> {
        let now = self.clock.now();
        let mut due: Vec<KeyId> = self
            .guard()?
            .iter()
            .filter(|(_, entry)| {
                entry.status == RotationStatus::Active && !entry.rotates_at.is_after(&now)
            })
            .map(|(key_id, _)| key_id.clone())
            .collect();
        due.sort();
        Ok(due)
    }

    /// Initiates rotation: generates a successor key under a versioned id,
    /// registers it, and marks the old key as rotating.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::UnknownKey`] when the key is untracked and
    /// [`KeyError::Poisoned`] on internal synchronization failure.
    pub fn initiate_rotation(&self, key_id: &KeyId) -> Result<KeyId, KeyError> {
        {
            let mut entries = self.guard()?;
            let entry = entries
                .get_mut(key_id)
                .ok_or_else(|| KeyError::UnknownKey(key_id.as_str().to_string()))?;
            entry.status = RotationStatus::Rotating;
        }
        let new_key_id = next_version_id(key_id);
        let key = hashing::random_bytes(MIN_KEY_LENGTH);
        self.key_manager.set_key(&new_key_id, key)?;
        self.register_key(&new_key_id)?;
        info!(old = %key_id, new = %new_key_id, "initiated key rotation");
        Ok(new_key_id)
    }

    /// Completes rotation by deleting the old key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Poisoned`] on internal synchronization failure.
    pub fn complete_rotation(&self, old_key_id: &KeyId) -> Result<(), KeyError> {
        self.key_manager.delete_key(old_key_id)?;
        if let Some(entry) = self.guard()?.get_mut(old_key_id) {
            entry.status = RotationStatus::Deleted;
        }
        info!(old = %old_key_id, "completed key rotation");
        Ok(())
    }

    /// Acquires the metadata mutex.
    fn guard(&self) -> Result<MutexGuard<'_, HashMap<KeyId, RotationEntry>>, KeyError> {
        self.metadata.lock().map_err(|_| KeyError::Poisoned)
    }
}

/// Returns the next versioned id for a key (`…_v2`, `…_v3`, …).
fn next_version_id(key_id: &KeyId) -> KeyId {
    let raw = key_id.as_str();
    if let Some((base, version)) = raw.rsplit_once("_v")
        && let Ok(current) = version.parse::<u64>()
    {
        return KeyId::new(format!("{base}_v{}", current + 1));
    }
    KeyId::new(format!("{raw}_v2"))
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pdsno_core::ControllerId;
    use pdsno_core::KeyId;
    use pdsno_core::ManualClock;
    use pdsno_core::UtcTimestamp;

    use super::KeyError;
    use super::KeyManager;
    use super::KeyRotationScheduler;
    use super::next_version_id;

    #[test]
    fn keys_round_trip_and_enforce_length() {
        let manager = KeyManager::new();
        let key_id = KeyId::for_pair(
            &ControllerId::new("global_cntl_1"),
            &ControllerId::new("regional_cntl_zone-A_1"),
        );
        let generated = manager.generate_key(&key_id).unwrap();
        assert_eq!(manager.get_key(&key_id).unwrap(), Some(generated));
        assert_eq!(manager.set_key(&key_id, vec![0; 16]), Err(KeyError::KeyTooShort));
        manager.delete_key(&key_id).unwrap();
        assert_eq!(manager.get_key(&key_id).unwrap(), None);
    }

    #[test]
    fn rotation_becomes_due_after_the_interval() {
        let clock = Arc::new(ManualClock::starting_at(
            UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap(),
        ));
        let manager = Arc::new(KeyManager::new());
        let scheduler = KeyRotationScheduler::new(manager.clone(), 3_600, clock.clone());

        let key_id = KeyId::new("key_a_b");
        manager.generate_key(&key_id).unwrap();
        scheduler.register_key(&key_id).unwrap();
        assert!(scheduler.due_for_rotation().unwrap().is_empty());

        clock.advance_seconds(3_601);
        assert_eq!(scheduler.due_for_rotation().unwrap(), vec![key_id.clone()]);

        let new_id = scheduler.initiate_rotation(&key_id).unwrap();
        assert_eq!(new_id.as_str(), "key_a_b_v2");
        assert!(manager.get_key(&new_id).unwrap().is_some());
        assert!(!scheduler.due_for_rotation().unwrap().contains(&key_id));

        scheduler.complete_rotation(&key_id).unwrap();
        assert_eq!(manager.get_key(&key_id).unwrap(), None);
    }

    #[test]
    fn versioned_ids_increment() {
        assert_eq!(next_version_id(&KeyId::new("key_a_b")).as_str(), "key_a_b_v2");
        assert_eq!(next_version_id(&KeyId::new("key_a_b_v2")).as_str(), "key_a_b_v3");
        assert_eq!(next_version_id(&KeyId::new("key_a_b_vx")).as_str(), "key_a_b_vx_v2");
    }
}
