// crates/pdsno-core/src/core/entity.rs
// ============================================================================
// Module: NIB Entity Model
// Description: Records persisted in the Network Information Base.
// Purpose: Capture controllers, devices, configurations, policies, events,
// and coordination locks with optimistic-concurrency versions.
// Dependencies: serde, serde_json, crate::core::{identifiers, time}
// ============================================================================

//! ## Overview
//! Every persisted entity carries an integer `version` used by the store's
//! compare-and-swap contract: readers keep the version they saw and the
//! store only accepts a write when the stored version still matches. New
//! inserts carry version 0. Objects handed to callers are snapshots; the
//! NIB is the single mutator barrier.
//!
//! Security posture: rows loaded from storage are untrusted until the event
//! tag (for events) or the caller's own checks pass.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::Ipv4Addr;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::core::identifiers::ConfigId;
use crate::core::identifiers::ControllerId;
use crate::core::identifiers::DeviceId;
use crate::core::identifiers::EventId;
use crate::core::identifiers::LockId;
use crate::core::identifiers::MacAddress;
use crate::core::identifiers::Region;
use crate::core::identifiers::RequestId;
use crate::core::identifiers::TokenId;
use crate::core::time::UtcTimestamp;

// ============================================================================
// SECTION: Roles and Statuses
// ============================================================================

/// Hierarchy tier of a controller.
///
/// # Invariants
/// - Variants are stable for serialization and id formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerRole {
    /// Root of trust; exactly one logical instance.
    Global,
    /// Zone-level governance under delegated authority.
    Regional,
    /// Subnet-level discovery and execution.
    Local,
}

impl ControllerRole {
    /// Returns the stable wire label for the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Regional => "regional",
            Self::Local => "local",
        }
    }

    /// Parses a wire label into a role.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "global" => Some(Self::Global),
            "regional" => Some(Self::Regional),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

/// Lifecycle status of a controller record.
///
/// # Invariants
/// - `validated_at` on the record is set iff the status is `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerStatus {
    /// Admission in progress; no permanent identity yet.
    Validating,
    /// Identity assigned and certificate issued.
    Active,
    /// Failed admission or decommissioned.
    Inactive,
}

impl ControllerStatus {
    /// Returns the stable wire label for the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    /// Parses a wire label into a status.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "validating" => Some(Self::Validating),
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Operational status of a discovered device.
///
/// # Invariants
/// - Variants are stable for serialization and delta reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Seen by discovery but not yet classified.
    Discovered,
    /// Undergoing managed-device admission.
    Validating,
    /// Reachable in the most recent cycle.
    Active,
    /// Present on the wire but not reachable.
    Quarantined,
    /// Absent for longer than the miss budget.
    Inactive,
    /// Last configuration execution failed.
    Failed,
}

impl DeviceStatus {
    /// Returns the stable wire label for the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Validating => "validating",
            Self::Active => "active",
            Self::Quarantined => "quarantined",
            Self::Inactive => "inactive",
            Self::Failed => "failed",
        }
    }

    /// Parses a wire label into a status.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "discovered" => Some(Self::Discovered),
            "validating" => Some(Self::Validating),
            "active" => Some(Self::Active),
            "quarantined" => Some(Self::Quarantined),
            "inactive" => Some(Self::Inactive),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Sensitivity tier assigned to a configuration change.
///
/// # Invariants
/// - Ordering is `Low < Medium < High` so the classifier can take a maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensitivityLevel {
    /// Cosmetic or monitoring-only changes; auto-approved.
    Low,
    /// VLAN, interface, and QoS changes; regional approval.
    Medium,
    /// Routing, security, and crypto changes; global approval.
    High,
}

impl SensitivityLevel {
    /// Returns the stable wire label for the tier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

/// Lifecycle state of a configuration record.
///
/// # Invariants
/// - Realized state sequences are walks on the transition table enforced by
///   the configuration state machine; the enum itself carries no rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigState {
    /// Being prepared by the requester.
    Draft,
    /// Awaiting an approver decision.
    PendingApproval,
    /// Approved and ready for execution.
    Approved,
    /// Currently being applied to the device.
    Executing,
    /// Applied successfully.
    Executed,
    /// Application failed.
    Failed,
    /// Reverted to the pre-execution backup.
    RolledBack,
    /// Abandoned; terminal.
    Cancelled,
}

impl ConfigState {
    /// Returns the stable wire label for the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::PendingApproval => "PENDING_APPROVAL",
            Self::Approved => "APPROVED",
            Self::Executing => "EXECUTING",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Cancelled => "CANCELLED",
        }
    }
}

// ============================================================================
// SECTION: Controller Record
// ============================================================================

/// Controller identity record.
///
/// # Invariants
/// - `(role, region)` is unique for regional controllers.
/// - Local controllers reference an existing regional in the same region.
/// - `validated_at` is set iff `status` is [`ControllerStatus::Active`].
/// - `version` increases monotonically on each accepted update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    /// Permanent controller identifier.
    pub controller_id: ControllerId,
    /// Hierarchy tier.
    pub role: ControllerRole,
    /// Governed region; required for regional and local controllers.
    pub region: Option<Region>,
    /// Lifecycle status.
    pub status: ControllerStatus,
    /// Validator that admitted this controller.
    pub validated_by: Option<ControllerId>,
    /// Admission completion time.
    pub validated_at: Option<UtcTimestamp>,
    /// Base64 Ed25519 public key presented at admission.
    pub public_key: Option<String>,
    /// Serialized certificate issued by the validator.
    pub certificate: Option<String>,
    /// Declared capability labels.
    pub capabilities: Vec<String>,
    /// Free-form metadata supplied at admission.
    pub metadata: Map<String, Value>,
    /// Optimistic concurrency version.
    pub version: i64,
}

// ============================================================================
// SECTION: Device Record
// ============================================================================

/// Network device record.
///
/// # Invariants
/// - `mac_address` is the identity key across controllers; an IP change never
///   changes identity.
/// - `version` increases monotonically on each accepted update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// NIB-assigned stable identifier.
    pub device_id: DeviceId,
    /// Temporary identifier from the discovery scan that first saw the device.
    pub temp_scan_id: Option<String>,
    /// Current IPv4 address.
    pub ip_address: Ipv4Addr,
    /// Hardware address; unique identity key.
    pub mac_address: MacAddress,
    /// Hostname from SNMP enrichment when available.
    pub hostname: Option<String>,
    /// Vendor from SNMP enrichment when available.
    pub vendor: Option<String>,
    /// Model or device type from SNMP enrichment when available.
    pub device_type: Option<String>,
    /// Operational status.
    pub status: DeviceStatus,
    /// First sighting time.
    pub first_seen: Option<UtcTimestamp>,
    /// Most recent sighting time.
    pub last_seen: Option<UtcTimestamp>,
    /// Owning local controller.
    pub managed_by: Option<ControllerId>,
    /// Region of the owning controller.
    pub region: Option<Region>,
    /// Optimistic concurrency version.
    pub version: i64,
    /// Free-form metadata (RTT, uptime, and similar enrichment fields).
    pub metadata: Map<String, Value>,
}

// ============================================================================
// SECTION: Configuration Record
// ============================================================================

/// Configuration record for a device.
///
/// # Invariants
/// - `config_lines` preserve requester ordering; they are vendor-neutral
///   command lines translated by the device adapter at execution time.
/// - `version` increases monotonically on each accepted update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    /// Configuration identifier.
    pub config_id: ConfigId,
    /// Target device.
    pub device_id: DeviceId,
    /// Ordered vendor-neutral command lines.
    pub config_lines: Vec<String>,
    /// Controller that proposed the change.
    pub requester: ControllerId,
    /// Sensitivity classification.
    pub sensitivity: SensitivityLevel,
    /// Current lifecycle state.
    pub state: ConfigState,
    /// Linked approval request, once submitted.
    pub approval_request_id: Option<RequestId>,
    /// Linked execution token, once issued.
    pub execution_token_id: Option<TokenId>,
    /// Pre-execution backup reference.
    pub backup_id: Option<crate::core::identifiers::BackupId>,
    /// Execution result detail from the adapter.
    pub execution_result: Option<Map<String, Value>>,
    /// Optimistic concurrency version.
    pub version: i64,
}

// ============================================================================
// SECTION: Policy Record
// ============================================================================

/// Network policy record distributed by regional controllers.
///
/// # Invariants
/// - `scope` is `global`, `regional`, or a specific region id.
/// - `version` increases monotonically on each accepted update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Policy identifier.
    pub policy_id: String,
    /// Human-readable policy name.
    pub name: String,
    /// Serialized rule set.
    pub rule_set: Value,
    /// Applicability scope.
    pub scope: String,
    /// Whether the policy is currently in force.
    pub active: bool,
    /// Creating actor.
    pub created_by: ControllerId,
    /// Creation time.
    pub created_at: Option<UtcTimestamp>,
    /// Last update time.
    pub updated_at: Option<UtcTimestamp>,
    /// Optimistic concurrency version.
    pub version: i64,
}

// ============================================================================
// SECTION: Event Record
// ============================================================================

/// Immutable NIB audit event.
///
/// # Invariants
/// - Immutable once written: the store offers no update or delete path and
///   the schema enforces the same at the storage layer.
/// - `signature` is an HMAC-SHA256 tag over the canonical serialization of
///   `(event_type, controller_id, timestamp, details)` under the store secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NibEvent {
    /// Event identifier.
    pub event_id: EventId,
    /// Event type label (e.g. `CONTROLLER_VALIDATED`).
    pub event_type: String,
    /// Acting controller.
    pub controller_id: ControllerId,
    /// Event time.
    pub timestamp: UtcTimestamp,
    /// Structured event detail.
    pub details: Map<String, Value>,
    /// Tamper-evidence tag; filled in by the store on write.
    pub signature: Option<String>,
}

// ============================================================================
// SECTION: Coordination Locks
// ============================================================================

/// Kinds of multi-step workflows guarded by coordination locks.
///
/// # Invariants
/// - Variants are stable; the lock key is `(subject_id, lock_type)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Approval-through-execution of a configuration.
    ConfigApproval,
    /// Assignment of a device to a local controller.
    DeviceAssignment,
    /// Region-wide policy rollout.
    PolicyUpdate,
}

impl LockType {
    /// Returns the stable wire label for the lock type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigApproval => "config_approval",
            Self::DeviceAssignment => "device_assignment",
            Self::PolicyUpdate => "policy_update",
        }
    }

    /// Parses a wire label into a lock type.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "config_approval" => Some(Self::ConfigApproval),
            "device_assignment" => Some(Self::DeviceAssignment),
            "policy_update" => Some(Self::PolicyUpdate),
            _ => None,
        }
    }
}

/// Coordination lock record.
///
/// # Invariants
/// - At most one unexpired record exists per `(subject_id, lock_type)` key.
/// - Holders must re-acquire after expiry; expiry releases the lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NibLock {
    /// Lock identifier.
    pub lock_id: LockId,
    /// Locked resource identifier.
    pub subject_id: String,
    /// Workflow kind guarded by this lock.
    pub lock_type: LockType,
    /// Controller holding the lock.
    pub held_by: ControllerId,
    /// Acquisition time.
    pub acquired_at: UtcTimestamp,
    /// Expiry time; the record is dead after this instant.
    pub expires_at: UtcTimestamp,
}

impl NibEvent {
    /// Computes the tamper-evidence tag for this event under a store secret.
    ///
    /// The tag covers the canonical JSON of
    /// `(event_type, controller_id, timestamp, details)`; the event id is
    /// excluded so verification is independent of id assignment.
    ///
    /// # Errors
    ///
    /// Returns [`crate::core::hashing::HashingError`] when the event cannot
    /// be canonicalized or the key is rejected.
    pub fn compute_tag(
        &self,
        secret: &[u8],
    ) -> Result<String, crate::core::hashing::HashingError> {
        let timestamp = self.timestamp.to_rfc3339().map_err(|err| {
            crate::core::hashing::HashingError::Canonicalize(err.to_string())
        })?;
        let canonical = serde_json::json!({
            "event_type": self.event_type,
            "controller_id": self.controller_id,
            "timestamp": timestamp,
            "details": self.details,
        });
        let bytes = crate::core::hashing::canonical_json_bytes(&canonical)?;
        crate::core::hashing::hmac_sha256_hex(secret, &bytes)
    }
}

impl NibLock {
    /// Returns true when the lock has expired as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: &UtcTimestamp) -> bool {
        now.is_after(&self.expires_at)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
