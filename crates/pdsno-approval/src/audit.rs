// crates/pdsno-approval/src/audit.rs
// ============================================================================
// Module: Audit Trail
// Description: Append-only event stream with queries, reports, and export.
// Purpose: Record every configuration decision with tamper-evident tags.
// Dependencies: pdsno-core, serde, serde_json, uuid
// ============================================================================

//! ## Overview
//! The audit trail is the system of record for every decision that denies,
//! rejects, or reverts. Records are append-only and carry an HMAC-SHA256
//! tag over the canonical serialization of `(kind, actor, timestamp,
//! details)` under a process secret, so out-of-band edits are detectable.
//! The query surface covers resource, actor, kind, and time range; the
//! report aggregates counts by kind and result over a window, and export
//! emits JSON.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use pdsno_core::Clock;
use pdsno_core::ControllerId;
use pdsno_core::UtcTimestamp;
use pdsno_core::hashing;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

// ============================================================================
// SECTION: Vocabulary
// ============================================================================

/// Enumerated audit event kinds.
///
/// # Invariants
/// - Wire labels are stable for queries and export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    /// Configuration created.
    ConfigCreated,
    /// Configuration submitted for approval.
    ConfigSubmitted,
    /// Configuration approved.
    ConfigApproved,
    /// Configuration rejected.
    ConfigRejected,
    /// Configuration executed successfully.
    ConfigExecuted,
    /// Configuration execution failed.
    ConfigFailed,
    /// Configuration rolled back.
    ConfigRolledBack,
    /// Configuration cancelled.
    ConfigCancelled,
    /// Backup created.
    BackupCreated,
    /// Execution token issued.
    TokenIssued,
    /// Execution token verified.
    TokenVerified,
    /// Execution token rejected.
    TokenRejected,
}

impl AuditEventKind {
    /// Returns the stable wire label for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigCreated => "CONFIG_CREATED",
            Self::ConfigSubmitted => "CONFIG_SUBMITTED",
            Self::ConfigApproved => "CONFIG_APPROVED",
            Self::ConfigRejected => "CONFIG_REJECTED",
            Self::ConfigExecuted => "CONFIG_EXECUTED",
            Self::ConfigFailed => "CONFIG_FAILED",
            Self::ConfigRolledBack => "CONFIG_ROLLED_BACK",
            Self::ConfigCancelled => "CONFIG_CANCELLED",
            Self::BackupCreated => "BACKUP_CREATED",
            Self::TokenIssued => "TOKEN_ISSUED",
            Self::TokenVerified => "TOKEN_VERIFIED",
            Self::TokenRejected => "TOKEN_REJECTED",
        }
    }
}

/// Outcome classification of an audited action.
///
/// # Invariants
/// - Wire labels are stable for queries and export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditResult {
    /// The action succeeded.
    Success,
    /// The action failed.
    Failure,
    /// The action is awaiting a decision.
    Pending,
}

impl AuditResult {
    /// Returns the stable wire label for the result.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Pending => "PENDING",
        }
    }
}

// ============================================================================
// SECTION: Records
// ============================================================================

/// One immutable audit record.
///
/// # Invariants
/// - Never updated or deleted once written.
/// - `tag` is the HMAC over `(kind, actor, timestamp, details)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Record identifier.
    pub event_id: String,
    /// Event kind.
    pub kind: AuditEventKind,
    /// Event time.
    pub timestamp: UtcTimestamp,
    /// Acting entity.
    pub actor_id: ControllerId,
    /// Resource kind label (configuration, device, token).
    pub resource_type: String,
    /// Concrete resource identifier.
    pub resource_id: String,
    /// Action performed.
    pub action: String,
    /// Outcome classification.
    pub result: AuditResult,
    /// Structured detail mapping.
    pub details: Map<String, Value>,
    /// Tamper-evidence tag.
    pub tag: Option<String>,
}

/// Aggregate report over a time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    /// Records counted.
    pub total: usize,
    /// Counts by event kind label.
    pub by_kind: BTreeMap<String, usize>,
    /// Counts by result label.
    pub by_result: BTreeMap<String, usize>,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the audit trail.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Record could not be tagged or serialized.
    #[error("audit serialization failure: {0}")]
    Serialization(String),
    /// Internal synchronization failure.
    #[error("audit trail mutex poisoned")]
    Poisoned,
}

// ============================================================================
// SECTION: Trail
// ============================================================================

/// Append-only audit stream scoped to one controller.
///
/// # Invariants
/// - No exposed operation modifies or deletes a record.
pub struct AuditTrail {
    /// Owning controller.
    controller_id: ControllerId,
    /// Tagging secret.
    secret: Vec<u8>,
    /// Records in append order.
    records: Mutex<Vec<AuditRecord>>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl AuditTrail {
    /// Creates an audit trail for a controller.
    #[must_use]
    pub fn new(controller_id: ControllerId, secret: impl Into<Vec<u8>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            controller_id,
            secret: secret.into(),
            records: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Returns the owning controller's id.
    #[must_use]
    pub const fn controller_id(&self) -> &ControllerId {
        &self.controller_id
    }

    /// Appends a record, computing its tag.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] on serialization or synchronization failure.
    #[allow(clippy::too_many_arguments, reason = "Audit fields mirror the record shape.")]
    pub fn log(
        &self,
        kind: AuditEventKind,
        actor_id: &ControllerId,
        resource_type: &str,
        resource_id: &str,
        action: &str,
        result: AuditResult,
        details: Map<String, Value>,
    ) -> Result<AuditRecord, AuditError> {
        let mut record = AuditRecord {
            event_id: format!("audit-{}", Uuid::new_v4()),
            kind,
            timestamp: self.clock.now(),
            actor_id: actor_id.clone(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            action: action.to_string(),
            result,
            details,
            tag: None,
        };
        record.tag = Some(self.compute_tag(&record)?);
        info!(
            kind = kind.as_str(),
            actor = %actor_id,
            resource = format!("{resource_type}/{resource_id}"),
            action,
            result = result.as_str(),
            "audit event"
        );
        self.records.lock().map_err(|_| AuditError::Poisoned)?.push(record.clone());
        Ok(record)
    }

    /// Recomputes a record's tag and compares it with the stored tag.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Serialization`] when the record cannot be
    /// canonicalized.
    pub fn verify(&self, record: &AuditRecord) -> Result<bool, AuditError> {
        let expected = self.compute_tag(record)?;
        Ok(record
            .tag
            .as_ref()
            .is_some_and(|tag| hashing::constant_time_eq(tag.as_bytes(), expected.as_bytes())))
    }

    /// Returns records touching a resource id, oldest first.
    #[must_use]
    pub fn by_resource(&self, resource_id: &str) -> Vec<AuditRecord> {
        self.filtered(|record| record.resource_id == resource_id)
    }

    /// Returns records by an actor, oldest first.
    #[must_use]
    pub fn by_actor(&self, actor_id: &ControllerId) -> Vec<AuditRecord> {
        self.filtered(|record| record.actor_id == *actor_id)
    }

    /// Returns records of one kind, oldest first.
    #[must_use]
    pub fn by_kind(&self, kind: AuditEventKind) -> Vec<AuditRecord> {
        self.filtered(|record| record.kind == kind)
    }

    /// Returns records inside a closed time range, oldest first.
    #[must_use]
    pub fn in_range(&self, start: UtcTimestamp, end: UtcTimestamp) -> Vec<AuditRecord> {
        self.filtered(|record| {
            !start.is_after(&record.timestamp) && !record.timestamp.is_after(&end)
        })
    }

    /// Aggregates counts by kind and result over a time window.
    #[must_use]
    pub fn report(&self, start: UtcTimestamp, end: UtcTimestamp) -> AuditSummary {
        let window = self.in_range(start, end);
        let mut by_kind = BTreeMap::new();
        let mut by_result = BTreeMap::new();
        for record in &window {
            *by_kind.entry(record.kind.as_str().to_string()).or_insert(0) += 1;
            *by_result.entry(record.result.as_str().to_string()).or_insert(0) += 1;
        }
        AuditSummary {
            total: window.len(),
            by_kind,
            by_result,
        }
    }

    /// Exports the full stream as a JSON array.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] on serialization or synchronization failure.
    pub fn export_json(&self) -> Result<String, AuditError> {
        let records = self.records.lock().map_err(|_| AuditError::Poisoned)?;
        serde_json::to_string_pretty(&*records)
            .map_err(|err| AuditError::Serialization(err.to_string()))
    }

    /// Returns records passing a predicate.
    fn filtered(&self, keep: impl Fn(&AuditRecord) -> bool) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| records.iter().filter(|record| keep(record)).cloned().collect())
            .unwrap_or_default()
    }

    /// Computes the tamper-evidence tag of a record.
    fn compute_tag(&self, record: &AuditRecord) -> Result<String, AuditError> {
        let timestamp = record
            .timestamp
            .to_rfc3339()
            .map_err(|err| AuditError::Serialization(err.to_string()))?;
        let canonical = json!({
            "kind": record.kind.as_str(),
            "actor_id": record.actor_id.as_str(),
            "timestamp": timestamp,
            "details": record.details,
        });
        let bytes = hashing::canonical_json_bytes(&canonical)
            .map_err(|err| AuditError::Serialization(err.to_string()))?;
        hashing::hmac_sha256_hex(&self.secret, &bytes)
            .map_err(|err| AuditError::Serialization(err.to_string()))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pdsno_core::ControllerId;
    use pdsno_core::ManualClock;
    use pdsno_core::UtcTimestamp;
    use serde_json::Map;
    use serde_json::json;

    use super::AuditEventKind;
    use super::AuditResult;
    use super::AuditTrail;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::starting_at(UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap()))
    }

    fn trail(clock: &Arc<ManualClock>) -> AuditTrail {
        AuditTrail::new(
            ControllerId::new("local_cntl_zone-A_1"),
            *b"0123456789abcdef0123456789abcdef",
            clock.clone(),
        )
    }

    fn actor() -> ControllerId {
        ControllerId::new("local_cntl_zone-A_1")
    }

    #[test]
    fn records_verify_and_detect_tampering() {
        let clock = clock();
        let trail = trail(&clock);
        let mut details = Map::new();
        details.insert("device_id".to_string(), json!("switch-01"));
        let record = trail
            .log(
                AuditEventKind::ConfigCreated,
                &actor(),
                "configuration",
                "config-1",
                "create",
                AuditResult::Success,
                details,
            )
            .unwrap();
        assert!(trail.verify(&record).unwrap());

        let mut forged = record;
        forged.actor_id = ControllerId::new("intruder");
        assert!(!trail.verify(&forged).unwrap());
    }

    #[test]
    fn queries_filter_by_resource_actor_kind_and_range() {
        let clock = clock();
        let trail = trail(&clock);
        trail
            .log(
                AuditEventKind::ConfigCreated,
                &actor(),
                "configuration",
                "config-1",
                "create",
                AuditResult::Success,
                Map::new(),
            )
            .unwrap();
        clock.advance_seconds(100);
        trail
            .log(
                AuditEventKind::ConfigApproved,
                &ControllerId::new("regional_cntl_zone-A_1"),
                "configuration",
                "config-1",
                "approve",
                AuditResult::Success,
                Map::new(),
            )
            .unwrap();
        clock.advance_seconds(100);
        trail
            .log(
                AuditEventKind::TokenIssued,
                &ControllerId::new("regional_cntl_zone-A_1"),
                "execution_token",
                "token-1",
                "issue",
                AuditResult::Success,
                Map::new(),
            )
            .unwrap();

        assert_eq!(trail.by_resource("config-1").len(), 2);
        assert_eq!(trail.by_actor(&ControllerId::new("regional_cntl_zone-A_1")).len(), 2);
        assert_eq!(trail.by_kind(AuditEventKind::TokenIssued).len(), 1);

        let start = UtcTimestamp::from_unix_seconds(1_700_000_050).unwrap();
        let end = UtcTimestamp::from_unix_seconds(1_700_000_150).unwrap();
        assert_eq!(trail.in_range(start, end).len(), 1);
    }

    #[test]
    fn report_aggregates_by_kind_and_result() {
        let clock = clock();
        let trail = trail(&clock);
        for result in [AuditResult::Success, AuditResult::Success, AuditResult::Failure] {
            trail
                .log(
                    AuditEventKind::ConfigExecuted,
                    &actor(),
                    "configuration",
                    "config-1",
                    "execute",
                    result,
                    Map::new(),
                )
                .unwrap();
        }
        let start = UtcTimestamp::from_unix_seconds(1_699_999_999).unwrap();
        let end = UtcTimestamp::from_unix_seconds(1_700_000_001).unwrap();
        let summary = trail.report(start, end);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_kind.get("CONFIG_EXECUTED"), Some(&3));
        assert_eq!(summary.by_result.get("SUCCESS"), Some(&2));
        assert_eq!(summary.by_result.get("FAILURE"), Some(&1));
    }

    #[test]
    fn export_emits_a_json_array() {
        let clock = clock();
        let trail = trail(&clock);
        trail
            .log(
                AuditEventKind::BackupCreated,
                &actor(),
                "backup",
                "backup-1",
                "create",
                AuditResult::Success,
                Map::new(),
            )
            .unwrap();
        let exported = trail.export_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&exported).unwrap();
        assert_eq!(parsed.as_array().map(Vec::len), Some(1));
    }
}
