// crates/pdsno-core/src/interfaces/mod.rs
// ============================================================================
// Module: Core Interfaces
// Description: Storage and device-adapter seams consumed across the workspace.
// Purpose: Define the NIB contract and the vendor driver interface.
// Dependencies: serde, serde_json, thiserror, crate::core
// ============================================================================

//! ## Overview
//! Two seams live here. [`NibStore`] is the single mutator barrier for all
//! persisted state: every write goes through its compare-and-swap upserts,
//! its append-only event log, or its coordination locks. [`DeviceAdapter`]
//! is the vendor driver interface the core consumes but does not implement;
//! concrete Cisco/Juniper/Arista/NETCONF drivers are external collaborators.
//!
//! Security posture: stores must enforce event immutability at the storage
//! layer; adapters receive only approved, token-verified command sets.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::entity::ConfigRecord;
use crate::core::entity::Controller;
use crate::core::entity::ControllerRole;
use crate::core::entity::Device;
use crate::core::entity::LockType;
use crate::core::entity::NibEvent;
use crate::core::entity::NibLock;
use crate::core::entity::Policy;
use crate::core::identifiers::ConfigId;
use crate::core::identifiers::ControllerId;
use crate::core::identifiers::DeviceId;
use crate::core::identifiers::EventId;
use crate::core::identifiers::LockId;
use crate::core::identifiers::MacAddress;
use crate::core::identifiers::Region;
use crate::core::time::UtcTimestamp;

// ============================================================================
// SECTION: Store Errors
// ============================================================================

/// Errors surfaced by NIB store implementations.
///
/// # Invariants
/// - Variants are stable for programmatic handling; `Conflict` always means
///   a version mismatch the caller may resolve by re-reading.
#[derive(Debug, Error)]
pub enum NibError {
    /// Optimistic concurrency check failed; re-read and retry at discretion.
    #[error("version conflict: entity was modified by another writer")]
    Conflict,
    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// An unexpired coordination lock is held by another controller.
    #[error("locked by {holder}")]
    Locked {
        /// Current lock holder.
        holder: String,
    },
    /// Schema constraint rejected the write (including event immutability).
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    /// Underlying storage failure.
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Outcome of an accepted upsert.
///
/// # Invariants
/// - `version` is the stored version after the write (0 for fresh inserts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertReceipt {
    /// Identifier of the stored entity (assigned by the store for inserts).
    pub entity_id: String,
    /// Version now held by the store.
    pub version: i64,
}

// ============================================================================
// SECTION: NIB Store Contract
// ============================================================================

/// Network Information Base storage contract.
///
/// # Invariants
/// - Upserts are atomic `UPDATE … WHERE id = ? AND version = ?` operations;
///   zero matched rows surfaces [`NibError::Conflict`].
/// - `write_event` is append-only; no exposed operation modifies or deletes
///   an event.
/// - Lock acquisition sweeps expired records for the requested key before
///   evaluating the holder check.
pub trait NibStore: Send + Sync {
    /// Fetches a device by NIB id.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Storage`] on backend failure.
    fn get_device(&self, device_id: &DeviceId) -> Result<Option<Device>, NibError>;

    /// Fetches a device by its MAC identity key.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Storage`] on backend failure.
    fn get_device_by_mac(&self, mac: &MacAddress) -> Result<Option<Device>, NibError>;

    /// Inserts or updates a device, keyed by MAC, with optimistic concurrency.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Conflict`] on version mismatch and
    /// [`NibError::Storage`] on backend failure.
    fn upsert_device(&self, device: &Device) -> Result<UpsertReceipt, NibError>;

    /// Lists devices currently in the `active` status.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Storage`] on backend failure.
    fn active_devices(&self) -> Result<Vec<Device>, NibError>;

    /// Fetches a controller by id.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Storage`] on backend failure.
    fn get_controller(&self, controller_id: &ControllerId) -> Result<Option<Controller>, NibError>;

    /// Lists active controllers registered in a region.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Storage`] on backend failure.
    fn controllers_by_region(&self, region: &Region) -> Result<Vec<Controller>, NibError>;

    /// Inserts or updates a controller with optimistic concurrency.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Conflict`] on version mismatch and
    /// [`NibError::Storage`] on backend failure.
    fn upsert_controller(&self, controller: &Controller) -> Result<UpsertReceipt, NibError>;

    /// Returns the highest admission sequence number among persisted ids for
    /// a role, used to seed the in-memory counter at validator startup.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Storage`] on backend failure.
    fn max_sequence_for_role(&self, role: ControllerRole) -> Result<u64, NibError>;

    /// Fetches a configuration record by id.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Storage`] on backend failure.
    fn get_config(&self, config_id: &ConfigId) -> Result<Option<ConfigRecord>, NibError>;

    /// Inserts or updates a configuration record with optimistic concurrency.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Conflict`] on version mismatch and
    /// [`NibError::Storage`] on backend failure.
    fn upsert_config(&self, config: &ConfigRecord) -> Result<UpsertReceipt, NibError>;

    /// Fetches a policy by id.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Storage`] on backend failure.
    fn get_policy(&self, policy_id: &str) -> Result<Option<Policy>, NibError>;

    /// Inserts or updates a policy with optimistic concurrency.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Conflict`] on version mismatch and
    /// [`NibError::Storage`] on backend failure.
    fn upsert_policy(&self, policy: &Policy) -> Result<UpsertReceipt, NibError>;

    /// Appends an event, computing its tamper-evidence tag under the store
    /// secret. The event's own id is used when present, otherwise assigned.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::ConstraintViolation`] on duplicate ids and
    /// [`NibError::Storage`] on backend failure.
    fn write_event(&self, event: &NibEvent) -> Result<EventId, NibError>;

    /// Recomputes an event's tag and compares it with the stored tag.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Storage`] on backend failure.
    fn verify_event(&self, event: &NibEvent) -> Result<bool, NibError>;

    /// Lists events with a given type label, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Storage`] on backend failure.
    fn events_by_type(&self, event_type: &str) -> Result<Vec<NibEvent>, NibError>;

    /// Lists the most recent events, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Storage`] on backend failure.
    fn recent_events(&self, limit: usize) -> Result<Vec<NibEvent>, NibError>;

    /// Acquires a coordination lock after sweeping expired records.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Locked`] when an unexpired holder exists and
    /// [`NibError::Storage`] on backend failure.
    fn acquire_lock(
        &self,
        subject_id: &str,
        lock_type: LockType,
        held_by: &ControllerId,
        ttl_seconds: i64,
        now: UtcTimestamp,
    ) -> Result<NibLock, NibError>;

    /// Releases a lock; only the holder may release.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::NotFound`] when the lock does not exist or is held
    /// by another controller, and [`NibError::Storage`] on backend failure.
    fn release_lock(&self, lock_id: &LockId, held_by: &ControllerId) -> Result<(), NibError>;

    /// Returns the unexpired lock for a key, if any.
    ///
    /// # Errors
    ///
    /// Returns [`NibError::Storage`] on backend failure.
    fn check_lock(
        &self,
        subject_id: &str,
        lock_type: LockType,
        now: UtcTimestamp,
    ) -> Result<Option<NibLock>, NibError>;
}

// ============================================================================
// SECTION: Device Adapter Contract
// ============================================================================

/// Errors surfaced by device adapters.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Session could not be established or was lost.
    #[error("device connection failure: {0}")]
    Connection(String),
    /// Command application failed on the device.
    #[error("apply failure: {0}")]
    Apply(String),
    /// Intent is not expressible for this vendor.
    #[error("unsupported intent: {0}")]
    Unsupported(String),
}

/// Result of applying a command set to a device.
///
/// # Invariants
/// - `error` is set iff `success` is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// Whether the device accepted the full command set.
    pub success: bool,
    /// Device output captured during application.
    pub output: String,
    /// Failure detail when the device rejected the change.
    pub error: Option<String>,
}

/// Vendor driver interface consumed by configuration execution and rollback.
///
/// Concrete implementations (Cisco IOS, Juniper, Arista, NETCONF) live
/// outside this workspace; tests use scripted doubles.
pub trait DeviceAdapter: Send {
    /// Opens a session to the device.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Connection`] when the session cannot be opened.
    fn connect(&mut self, device: &Device) -> Result<(), AdapterError>;

    /// Closes the session; idempotent.
    fn disconnect(&mut self);

    /// Translates a vendor-neutral intent into device command lines.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Unsupported`] for inexpressible intents.
    fn translate_intent(&self, intent: &Value) -> Result<Vec<String>, AdapterError>;

    /// Applies an ordered command set to the connected device.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Connection`] when no session is open; command
    /// rejection is reported through [`ApplyOutcome`], not an error.
    fn apply_config(&mut self, commands: &[String]) -> Result<ApplyOutcome, AdapterError>;

    /// Reads the device's current running configuration as command lines.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Connection`] when no session is open.
    fn get_running_config(&mut self) -> Result<Vec<String>, AdapterError>;

    /// Verifies that the device state satisfies an intent.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Connection`] when no session is open.
    fn verify_config(&mut self, intent: &Value) -> Result<bool, AdapterError>;

    /// Returns true while a session is open.
    fn is_connected(&self) -> bool;
}
