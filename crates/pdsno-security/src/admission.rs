// crates/pdsno-security/src/admission.rs
// ============================================================================
// Module: Admission Protocol
// Description: Six-step challenge/response promotion of candidate controllers.
// Purpose: Turn an unvalidated controller into a signed permanent identity,
// written atomically to the NIB alongside its audit event.
// Dependencies: pdsno-core, ed25519-dalek, base64, hex, uuid, serde,
// crate::bootstrap
// ============================================================================

//! ## Overview
//! The validator side drives six steps: envelope freshness, bootstrap token
//! (with blocklist and single-use consumption), challenge issuance (30 s
//! TTL), Ed25519 challenge verification, policy checks (permitted role,
//! region allow-list, region quota), and atomic identity assignment. Every
//! failure maps to a stable rejection reason returned in a signed
//! `VALIDATION_RESULT`; infrastructure failures return status `ERROR`
//! instead and never leave a partial controller record behind.
//!
//! The candidate side builds the validation request, signs the challenge
//! nonce with its ephemeral Ed25519 key, and installs the assigned identity
//! from the final result.
//!
//! Security posture: challenge nonces are single-use and consumed on
//! verification regardless of outcome; the admission sequence is seeded
//! from persisted controller ids so restarts never mint duplicates.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::Signature;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;
use pdsno_core::ChallengeId;
use pdsno_core::Clock;
use pdsno_core::Controller;
use pdsno_core::ControllerId;
use pdsno_core::ControllerRole;
use pdsno_core::ControllerStatus;
use pdsno_core::EventId;
use pdsno_core::MessageEnvelope;
use pdsno_core::MessageType;
use pdsno_core::NibError;
use pdsno_core::NibEvent;
use pdsno_core::NibStore;
use pdsno_core::Region;
use pdsno_core::SKEW_TOLERANCE_SECONDS;
use pdsno_core::UtcTimestamp;
use pdsno_core::hashing;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::bootstrap::BootstrapAuthority;
use crate::bootstrap::BootstrapError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Challenge lifetime in seconds.
pub const CHALLENGE_TTL_SECONDS: i64 = 30;
/// Admission freshness window in seconds (matches the message skew window).
pub const FRESHNESS_WINDOW_SECONDS: i64 = SKEW_TOLERANCE_SECONDS;
/// Action scoped by a delegation credential.
pub const DELEGATED_ACTION_VALIDATE_LOCAL: &str = "validate_local";

// ============================================================================
// SECTION: Rejection Reasons
// ============================================================================

/// Stable rejection reason codes carried in `VALIDATION_RESULT` payloads.
///
/// # Invariants
/// - Wire labels are stable; rejections are never retried by candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    /// Envelope timestamp older than the freshness window.
    StaleTimestamp,
    /// Envelope timestamp in the future beyond skew.
    FutureTimestamp,
    /// Candidate temp id is blocklisted.
    Blocklisted,
    /// Bootstrap token mismatch or reuse.
    InvalidBootstrapToken,
    /// Challenge id not found.
    UnknownChallenge,
    /// Challenge found but past its TTL.
    ChallengeExpired,
    /// Responding temp id differs from the challenged one.
    TempIdMismatch,
    /// Ed25519 verification of the signed nonce failed.
    InvalidSignature,
    /// Candidate role outside the permitted set.
    TypeNotPermitted,
    /// Region not in the allow-list.
    InvalidRegion,
    /// Region quota for the candidate role is exhausted.
    QuotaExceeded,
    /// Identity write lost the NIB compare-and-swap.
    RegistrationFailed,
}

impl RejectionReason {
    /// Returns the stable wire label for the reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StaleTimestamp => "STALE_TIMESTAMP",
            Self::FutureTimestamp => "FUTURE_TIMESTAMP",
            Self::Blocklisted => "BLOCKLISTED",
            Self::InvalidBootstrapToken => "INVALID_BOOTSTRAP_TOKEN",
            Self::UnknownChallenge => "UNKNOWN_CHALLENGE",
            Self::ChallengeExpired => "CHALLENGE_EXPIRED",
            Self::TempIdMismatch => "TEMP_ID_MISMATCH",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::TypeNotPermitted => "TYPE_NOT_PERMITTED",
            Self::InvalidRegion => "INVALID_REGION",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::RegistrationFailed => "REGISTRATION_FAILED",
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the candidate-side helpers.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Payload did not match the expected shape.
    #[error("malformed admission payload: {0}")]
    Malformed(String),
    /// Admission was rejected by the validator.
    #[error("admission rejected: {}", .0.as_str())]
    Rejected(RejectionReason),
    /// Validator reported an infrastructure error.
    #[error("validator error: {0}")]
    ValidatorError(String),
    /// Internal synchronization failure.
    #[error("admission state mutex poisoned")]
    Poisoned,
}

// ============================================================================
// SECTION: Wire Payloads
// ============================================================================

/// Body of a `VALIDATION_REQUEST`.
///
/// # Invariants
/// - `public_key` is the candidate's base64 Ed25519 verifying key.
/// - `bootstrap_token` is hex HMAC over `temp_id|region|type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    /// Candidate's temporary id.
    pub temp_id: String,
    /// Requested role label (`regional` or `local`).
    pub controller_type: String,
    /// Requested region.
    pub region: String,
    /// Base64 Ed25519 public key.
    pub public_key: String,
    /// Provisioning token.
    pub bootstrap_token: String,
    /// Free-form candidate metadata (capabilities, hostname, version).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Body of a `CHALLENGE_RESPONSE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeAnswer {
    /// Challenge being answered.
    pub challenge_id: String,
    /// Candidate's temporary id.
    pub temp_id: String,
    /// Base64 Ed25519 signature over the challenge nonce bytes.
    pub signed_nonce: String,
}

/// Body of a `VALIDATION_RESULT`.
///
/// # Invariants
/// - `status` is `APPROVED`, `REJECTED`, or `ERROR`.
/// - `reason` is set iff the status is not `APPROVED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    /// Outcome status.
    pub status: String,
    /// Permanent id on approval.
    #[serde(default)]
    pub assigned_id: Option<String>,
    /// Certificate object on approval.
    #[serde(default)]
    pub certificate: Option<Value>,
    /// Delegation credential for regional controllers.
    #[serde(default)]
    pub delegation_credential: Option<Value>,
    /// Admitted role label.
    #[serde(default)]
    pub role: Option<String>,
    /// Admitted region.
    #[serde(default)]
    pub region: Option<String>,
    /// Rejection or error reason.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Pending challenge bookkeeping.
#[derive(Debug, Clone)]
struct PendingChallenge {
    /// Challenged temp id.
    temp_id: String,
    /// Raw nonce bytes the candidate must sign.
    nonce: Vec<u8>,
    /// Expiry instant.
    expires_at: UtcTimestamp,
    /// Original validation request held for steps five and six.
    original_request: ValidationRequest,
}

// ============================================================================
// SECTION: Policy
// ============================================================================

/// Validator policy for admission steps one and five.
///
/// # Invariants
/// - `region_quota` bounds active controllers per `(role, region)` pair.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    /// Roles this validator may admit.
    pub permitted_roles: Vec<ControllerRole>,
    /// Region allow-list.
    pub allowed_regions: Vec<Region>,
    /// Maximum active controllers per role in one region.
    pub region_quota: usize,
    /// Challenge lifetime in seconds.
    pub challenge_ttl_seconds: i64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            permitted_roles: vec![ControllerRole::Regional, ControllerRole::Local],
            allowed_regions: vec![
                Region::new("zone-A"),
                Region::new("zone-B"),
                Region::new("zone-C"),
            ],
            region_quota: 16,
            challenge_ttl_seconds: CHALLENGE_TTL_SECONDS,
        }
    }
}

// ============================================================================
// SECTION: Validator
// ============================================================================

/// Validator side of the admission protocol.
///
/// # Invariants
/// - The sequence counter is seeded from persisted ids at construction and
///   only moves forward; a burned number is never reissued.
/// - Pending challenges are swept on access and consumed at verification.
pub struct AdmissionValidator {
    /// Identity of the validating controller.
    validator_id: ControllerId,
    /// Bootstrap token authority.
    bootstrap: BootstrapAuthority,
    /// Admission policy.
    policy: AdmissionPolicy,
    /// Secret used to tag certificates and delegation credentials.
    signing_secret: Vec<u8>,
    /// Durable store for identity records and audit events.
    nib: Arc<dyn NibStore>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Pending challenges by id.
    pending: Mutex<HashMap<ChallengeId, PendingChallenge>>,
    /// Per-role admission sequence counters.
    sequence: Mutex<HashMap<ControllerRole, u64>>,
}

impl AdmissionValidator {
    /// Creates a validator, seeding sequence counters from the NIB.
    ///
    /// # Errors
    ///
    /// Returns [`NibError`] when the persisted sequence scan fails.
    pub fn new(
        validator_id: ControllerId,
        bootstrap: BootstrapAuthority,
        policy: AdmissionPolicy,
        signing_secret: impl Into<Vec<u8>>,
        nib: Arc<dyn NibStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, NibError> {
        let mut sequence = HashMap::new();
        for role in [ControllerRole::Regional, ControllerRole::Local] {
            sequence.insert(role, nib.max_sequence_for_role(role)?);
        }
        Ok(Self {
            validator_id,
            bootstrap,
            policy,
            signing_secret: signing_secret.into(),
            nib,
            clock,
            pending: Mutex::new(HashMap::new()),
            sequence: Mutex::new(sequence),
        })
    }

    /// Returns the validator's id.
    #[must_use]
    pub const fn validator_id(&self) -> &ControllerId {
        &self.validator_id
    }

    /// Handles a `VALIDATION_REQUEST`: steps one through three.
    ///
    /// Returns a `CHALLENGE` envelope on success, otherwise a rejected
    /// `VALIDATION_RESULT`.
    #[must_use]
    pub fn handle_validation_request(&self, envelope: &MessageEnvelope) -> MessageEnvelope {
        let now = self.clock.now();

        // Step 1: freshness.
        if let Err(reason) = self.check_freshness(envelope, now) {
            return self.rejection(envelope, reason);
        }

        // Parse after freshness so stale garbage is cheap to refuse.
        let request: ValidationRequest =
            match serde_json::from_value(Value::Object(envelope.payload.clone())) {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, "malformed validation request");
                    return self.error_response(envelope, "MALFORMED_REQUEST");
                }
            };
        info!(temp_id = %request.temp_id, "validation request received");

        // Step 2: blocklist and bootstrap token.
        let Some(role) = ControllerRole::from_label(&request.controller_type) else {
            return self.rejection(envelope, RejectionReason::TypeNotPermitted);
        };
        let region = Region::new(request.region.clone());
        if let Err(err) =
            self.bootstrap.verify_and_consume(&request.temp_id, &region, role, &request.bootstrap_token)
        {
            let reason = match err {
                BootstrapError::Blocklisted => RejectionReason::Blocklisted,
                BootstrapError::InvalidToken | BootstrapError::Consumed => {
                    RejectionReason::InvalidBootstrapToken
                }
                BootstrapError::Compute(_) | BootstrapError::Poisoned => {
                    return self.error_response(envelope, "BOOTSTRAP_CHECK_FAILED");
                }
            };
            return self.rejection(envelope, reason);
        }

        // Step 3: challenge issuance.
        self.issue_challenge(envelope, request, now)
    }

    /// Handles a `CHALLENGE_RESPONSE`: steps four through six.
    ///
    /// Returns the final `VALIDATION_RESULT` envelope.
    #[must_use]
    pub fn handle_challenge_response(&self, envelope: &MessageEnvelope) -> MessageEnvelope {
        let answer: ChallengeAnswer =
            match serde_json::from_value(Value::Object(envelope.payload.clone())) {
                Ok(answer) => answer,
                Err(err) => {
                    warn!(error = %err, "malformed challenge response");
                    return self.error_response(envelope, "MALFORMED_REQUEST");
                }
            };

        // Step 4: challenge verification.
        let original_request = match self.verify_challenge(&answer) {
            Ok(request) => request,
            Err(reason) => return self.rejection(envelope, reason),
        };

        // Step 5: policy checks.
        let (role, region) = match self.policy_checks(&original_request) {
            Ok(pair) => pair,
            Err(reason) => return self.rejection(envelope, reason),
        };

        // Step 6: identity assignment.
        match self.assign_identity(&original_request, role, &region) {
            Ok(verdict) => self.result_envelope(envelope, &verdict),
            Err(AssignmentFailure::Rejected(reason)) => self.rejection(envelope, reason),
            Err(AssignmentFailure::Infrastructure(detail)) => {
                error!(detail, "identity assignment failed");
                self.error_response(envelope, "NIB_WRITE_FAILED")
            }
        }
    }

    /// Step 1: envelope timestamp freshness.
    fn check_freshness(
        &self,
        envelope: &MessageEnvelope,
        now: UtcTimestamp,
    ) -> Result<(), RejectionReason> {
        let age_seconds = now.seconds_since(&envelope.timestamp);
        if age_seconds < -(SKEW_TOLERANCE_SECONDS as f64) {
            warn!(sender = %envelope.sender_id, age_seconds, "future timestamp");
            return Err(RejectionReason::FutureTimestamp);
        }
        if age_seconds > FRESHNESS_WINDOW_SECONDS as f64 {
            warn!(sender = %envelope.sender_id, age_seconds, "stale timestamp");
            return Err(RejectionReason::StaleTimestamp);
        }
        Ok(())
    }

    /// Step 3: generates and records a challenge, returning its envelope.
    fn issue_challenge(
        &self,
        envelope: &MessageEnvelope,
        request: ValidationRequest,
        now: UtcTimestamp,
    ) -> MessageEnvelope {
        let challenge_id = ChallengeId::new(format!("challenge-{}", short_uuid(12)));
        let nonce = hashing::random_bytes(32);
        let expires_at = now.plus_seconds(self.policy.challenge_ttl_seconds);
        let temp_id = request.temp_id.clone();

        let mut payload = Map::new();
        payload.insert("challenge_id".to_string(), json!(challenge_id.as_str()));
        payload.insert("nonce".to_string(), json!(hex::encode(&nonce)));
        if let Ok(expiry_text) = expires_at.to_rfc3339() {
            payload.insert("expires_at".to_string(), json!(expiry_text));
        }

        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                challenge_id.clone(),
                PendingChallenge {
                    temp_id: temp_id.clone(),
                    nonce,
                    expires_at,
                    original_request: request,
                },
            );
        }
        info!(challenge = %challenge_id, temp_id = %temp_id, "issued challenge");

        envelope.respond(
            self.validator_id.clone(),
            MessageType::Challenge,
            payload,
            self.clock.now(),
        )
    }

    /// Step 4: verifies the signed nonce against the candidate's public key.
    ///
    /// The challenge is consumed before the signature is evaluated so a
    /// failed attempt cannot be retried against the same nonce.
    fn verify_challenge(
        &self,
        answer: &ChallengeAnswer,
    ) -> Result<ValidationRequest, RejectionReason> {
        let challenge_id = ChallengeId::new(answer.challenge_id.clone());
        let now = self.clock.now();

        let pending = {
            let Ok(mut pending) = self.pending.lock() else {
                return Err(RejectionReason::UnknownChallenge);
            };
            let Some(entry) = pending.get(&challenge_id).cloned() else {
                warn!(challenge = %challenge_id, "unknown challenge id");
                return Err(RejectionReason::UnknownChallenge);
            };
            if now.is_after(&entry.expires_at) {
                pending.remove(&challenge_id);
                warn!(challenge = %challenge_id, "challenge expired");
                return Err(RejectionReason::ChallengeExpired);
            }
            if entry.temp_id != answer.temp_id {
                warn!(challenge = %challenge_id, "temp id mismatch in challenge response");
                return Err(RejectionReason::TempIdMismatch);
            }
            pending.remove(&challenge_id);
            entry
        };

        let verified = verify_signed_nonce(
            &pending.original_request.public_key,
            &pending.nonce,
            &answer.signed_nonce,
        );
        if !verified {
            warn!(temp_id = %answer.temp_id, "invalid challenge signature");
            return Err(RejectionReason::InvalidSignature);
        }
        info!(challenge = %challenge_id, temp_id = %answer.temp_id, "challenge verified");
        Ok(pending.original_request)
    }

    /// Step 5: permitted role, region allow-list, and region quota.
    fn policy_checks(
        &self,
        request: &ValidationRequest,
    ) -> Result<(ControllerRole, Region), RejectionReason> {
        let Some(role) = ControllerRole::from_label(&request.controller_type) else {
            return Err(RejectionReason::TypeNotPermitted);
        };
        if !self.policy.permitted_roles.contains(&role) {
            return Err(RejectionReason::TypeNotPermitted);
        }

        let region = Region::new(request.region.clone());
        if !self.policy.allowed_regions.contains(&region) {
            return Err(RejectionReason::InvalidRegion);
        }

        let occupied = self
            .nib
            .controllers_by_region(&region)
            .map_err(|_| RejectionReason::QuotaExceeded)?
            .iter()
            .filter(|controller| controller.role == role)
            .count();
        if occupied >= self.policy.region_quota {
            return Err(RejectionReason::QuotaExceeded);
        }
        Ok((role, region))
    }

    /// Step 6: allocates the permanent id, builds the certificate and
    /// delegation credential, and persists the record plus audit event.
    fn assign_identity(
        &self,
        request: &ValidationRequest,
        role: ControllerRole,
        region: &Region,
    ) -> Result<ValidationVerdict, AssignmentFailure> {
        let now = self.clock.now();
        let sequence = self.next_sequence(role)?;
        let assigned_id = format!("{}_cntl_{}_{}", role.as_str(), region, sequence);

        let certificate = self.build_certificate(&assigned_id, role, region, &request.public_key, now)?;
        let delegation = if role == ControllerRole::Regional {
            Some(self.build_delegation(region)?)
        } else {
            None
        };

        let capabilities = request
            .metadata
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|entries| {
                entries.iter().filter_map(Value::as_str).map(str::to_string).collect()
            })
            .unwrap_or_default();

        let record = Controller {
            controller_id: ControllerId::new(assigned_id.clone()),
            role,
            region: Some(region.clone()),
            status: ControllerStatus::Active,
            validated_by: Some(self.validator_id.clone()),
            validated_at: Some(now),
            public_key: Some(request.public_key.clone()),
            certificate: serde_json::to_string(&certificate).ok(),
            capabilities,
            metadata: request.metadata.clone(),
            version: 0,
        };

        match self.nib.upsert_controller(&record) {
            Ok(_) => {}
            Err(NibError::Conflict) => {
                return Err(AssignmentFailure::Rejected(RejectionReason::RegistrationFailed));
            }
            Err(err) => return Err(AssignmentFailure::Infrastructure(err.to_string())),
        }

        let mut details = Map::new();
        details.insert("assigned_id".to_string(), json!(assigned_id));
        details.insert("role".to_string(), json!(role.as_str()));
        details.insert("region".to_string(), json!(region.as_str()));
        if let Ok(validated_text) = now.to_rfc3339() {
            details.insert("validated_at".to_string(), json!(validated_text));
        }
        let event = NibEvent {
            event_id: EventId::new(""),
            event_type: "CONTROLLER_VALIDATED".to_string(),
            controller_id: self.validator_id.clone(),
            timestamp: now,
            details,
            signature: None,
        };
        if let Err(err) = self.nib.write_event(&event) {
            // The identity is already committed; an audit gap is logged, not fatal.
            warn!(error = %err, assigned_id, "audit event write failed");
        }

        info!(assigned_id, role = role.as_str(), region = %region, "assigned identity");
        Ok(ValidationVerdict {
            status: "APPROVED".to_string(),
            assigned_id: Some(assigned_id),
            certificate: Some(certificate),
            delegation_credential: delegation,
            role: Some(role.as_str().to_string()),
            region: Some(region.as_str().to_string()),
            reason: None,
        })
    }

    /// Allocates the next sequence number for a role.
    fn next_sequence(&self, role: ControllerRole) -> Result<u64, AssignmentFailure> {
        let mut sequence = self
            .sequence
            .lock()
            .map_err(|_| AssignmentFailure::Infrastructure("sequence mutex poisoned".to_string()))?;
        let next = sequence.get(&role).copied().unwrap_or(0) + 1;
        sequence.insert(role, next);
        Ok(next)
    }

    /// Builds the signed certificate object.
    fn build_certificate(
        &self,
        assigned_id: &str,
        role: ControllerRole,
        region: &Region,
        public_key: &str,
        issued_at: UtcTimestamp,
    ) -> Result<Value, AssignmentFailure> {
        let issued_text = issued_at
            .to_rfc3339()
            .map_err(|err| AssignmentFailure::Infrastructure(err.to_string()))?;
        let mut certificate = json!({
            "assigned_id": assigned_id,
            "role": role.as_str(),
            "region": region.as_str(),
            "public_key": public_key,
            "issued_by": self.validator_id.as_str(),
            "issued_at": issued_text,
        });
        let tag = self.tag_value(&certificate)?;
        if let Value::Object(fields) = &mut certificate {
            fields.insert("signature".to_string(), json!(tag));
        }
        Ok(certificate)
    }

    /// Builds the delegation credential scoping local admission to a region.
    fn build_delegation(&self, region: &Region) -> Result<Value, AssignmentFailure> {
        let mut credential = json!({
            "scope": region.as_str(),
            "permitted_actions": [DELEGATED_ACTION_VALIDATE_LOCAL],
            "issued_by": self.validator_id.as_str(),
        });
        let tag = self.tag_value(&credential)?;
        if let Value::Object(fields) = &mut credential {
            fields.insert("signature".to_string(), json!(tag));
        }
        Ok(credential)
    }

    /// Tags a JSON value with HMAC-SHA256 under the signing secret.
    fn tag_value(&self, value: &Value) -> Result<String, AssignmentFailure> {
        let bytes = hashing::canonical_json_bytes(value)
            .map_err(|err| AssignmentFailure::Infrastructure(err.to_string()))?;
        hashing::hmac_sha256_hex(&self.signing_secret, &bytes)
            .map_err(|err| AssignmentFailure::Infrastructure(err.to_string()))
    }

    /// Builds a rejected `VALIDATION_RESULT`.
    fn rejection(&self, envelope: &MessageEnvelope, reason: RejectionReason) -> MessageEnvelope {
        let mut payload = Map::new();
        payload.insert("status".to_string(), json!("REJECTED"));
        payload.insert("reason".to_string(), json!(reason.as_str()));
        envelope.respond(
            self.validator_id.clone(),
            MessageType::ValidationResult,
            payload,
            self.clock.now(),
        )
    }

    /// Builds an `ERROR` `VALIDATION_RESULT` for infrastructure failures.
    fn error_response(&self, envelope: &MessageEnvelope, reason: &str) -> MessageEnvelope {
        let mut payload = Map::new();
        payload.insert("status".to_string(), json!("ERROR"));
        payload.insert("reason".to_string(), json!(reason));
        envelope.respond(
            self.validator_id.clone(),
            MessageType::ValidationResult,
            payload,
            self.clock.now(),
        )
    }

    /// Builds the approved `VALIDATION_RESULT` from a verdict.
    fn result_envelope(
        &self,
        envelope: &MessageEnvelope,
        verdict: &ValidationVerdict,
    ) -> MessageEnvelope {
        let payload = match serde_json::to_value(verdict) {
            Ok(Value::Object(fields)) => fields,
            _ => Map::new(),
        };
        envelope.respond(
            self.validator_id.clone(),
            MessageType::ValidationResult,
            payload,
            self.clock.now(),
        )
    }
}

/// Internal step-six failure split between rejection and infrastructure.
enum AssignmentFailure {
    /// Maps to a `REJECTED` result with a stable reason.
    Rejected(RejectionReason),
    /// Maps to an `ERROR` result; nothing partial was committed.
    Infrastructure(String),
}

/// Verifies a base64 Ed25519 signature over the raw nonce bytes.
fn verify_signed_nonce(public_key_b64: &str, nonce: &[u8], signed_nonce_b64: &str) -> bool {
    let Ok(key_bytes) = BASE64.decode(public_key_b64) else {
        return false;
    };
    let Ok(key_array) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_array) else {
        return false;
    };
    let Ok(signature_bytes) = BASE64.decode(signed_nonce_b64) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&signature_bytes) else {
        return false;
    };
    verifying_key.verify(nonce, &signature).is_ok()
}

/// Returns `len` lowercase hex characters of a fresh UUID.
fn short_uuid(len: usize) -> String {
    Uuid::new_v4().simple().to_string().chars().take(len).collect()
}

// ============================================================================
// SECTION: Candidate
// ============================================================================

/// Identity installed on a candidate after approval.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedIdentity {
    /// Permanent controller id.
    pub assigned_id: ControllerId,
    /// Certificate issued by the validator.
    pub certificate: Value,
    /// Delegation credential, for regional controllers.
    pub delegation_credential: Option<Value>,
}

/// Candidate side of the admission protocol.
///
/// # Invariants
/// - The Ed25519 signing key is ephemeral to this candidate instance.
/// - `identity` is set exactly once, on the first approved result.
pub struct AdmissionCandidate {
    /// Temporary id used before admission.
    temp_id: ControllerId,
    /// Requested role.
    role: ControllerRole,
    /// Requested region.
    region: Region,
    /// Candidate metadata included in the request.
    metadata: Map<String, Value>,
    /// Ephemeral signing key for the challenge step.
    signing_key: SigningKey,
    /// Assigned identity after approval.
    identity: Mutex<Option<AssignedIdentity>>,
}

impl AdmissionCandidate {
    /// Creates a candidate with a fresh Ed25519 keypair.
    #[must_use]
    pub fn new(
        temp_id: ControllerId,
        role: ControllerRole,
        region: Region,
        metadata: Map<String, Value>,
    ) -> Self {
        let mut seed = [0_u8; 32];
        seed.copy_from_slice(&hashing::random_bytes(32));
        Self {
            temp_id,
            role,
            region,
            metadata,
            signing_key: SigningKey::from_bytes(&seed),
            identity: Mutex::new(None),
        }
    }

    /// Returns the candidate's temporary id.
    #[must_use]
    pub const fn temp_id(&self) -> &ControllerId {
        &self.temp_id
    }

    /// Returns the base64 form of the candidate's public key.
    #[must_use]
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Builds the `VALIDATION_REQUEST` payload.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Malformed`] when the request cannot be
    /// represented as a JSON object.
    pub fn build_validation_request(
        &self,
        bootstrap_token: &str,
    ) -> Result<Map<String, Value>, AdmissionError> {
        let request = ValidationRequest {
            temp_id: self.temp_id.as_str().to_string(),
            controller_type: self.role.as_str().to_string(),
            region: self.region.as_str().to_string(),
            public_key: self.public_key_b64(),
            bootstrap_token: bootstrap_token.to_string(),
            metadata: self.metadata.clone(),
        };
        match serde_json::to_value(&request) {
            Ok(Value::Object(fields)) => Ok(fields),
            Ok(_) => Err(AdmissionError::Malformed("request is not an object".to_string())),
            Err(err) => Err(AdmissionError::Malformed(err.to_string())),
        }
    }

    /// Answers a `CHALLENGE` payload by signing its nonce.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Malformed`] when the challenge payload is
    /// missing fields or carries non-hex nonce material.
    pub fn answer_challenge(
        &self,
        challenge_payload: &Map<String, Value>,
    ) -> Result<Map<String, Value>, AdmissionError> {
        let challenge_id = challenge_payload
            .get("challenge_id")
            .and_then(Value::as_str)
            .ok_or_else(|| AdmissionError::Malformed("missing challenge_id".to_string()))?;
        let nonce_hex = challenge_payload
            .get("nonce")
            .and_then(Value::as_str)
            .ok_or_else(|| AdmissionError::Malformed("missing nonce".to_string()))?;
        let nonce =
            hex::decode(nonce_hex).map_err(|err| AdmissionError::Malformed(err.to_string()))?;

        let signature = self.signing_key.sign(&nonce);
        let answer = ChallengeAnswer {
            challenge_id: challenge_id.to_string(),
            temp_id: self.temp_id.as_str().to_string(),
            signed_nonce: BASE64.encode(signature.to_bytes()),
        };
        match serde_json::to_value(&answer) {
            Ok(Value::Object(fields)) => Ok(fields),
            Ok(_) => Err(AdmissionError::Malformed("answer is not an object".to_string())),
            Err(err) => Err(AdmissionError::Malformed(err.to_string())),
        }
    }

    /// Installs the identity from a `VALIDATION_RESULT` payload.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Rejected`] for `REJECTED` results,
    /// [`AdmissionError::ValidatorError`] for `ERROR` results, and
    /// [`AdmissionError::Malformed`] for unparsable payloads.
    pub fn install_result(
        &self,
        result_payload: &Map<String, Value>,
    ) -> Result<AssignedIdentity, AdmissionError> {
        let verdict: ValidationVerdict =
            serde_json::from_value(Value::Object(result_payload.clone()))
                .map_err(|err| AdmissionError::Malformed(err.to_string()))?;

        match verdict.status.as_str() {
            "APPROVED" => {}
            "REJECTED" => {
                let reason = verdict
                    .reason
                    .as_deref()
                    .and_then(reason_from_label)
                    .unwrap_or(RejectionReason::RegistrationFailed);
                return Err(AdmissionError::Rejected(reason));
            }
            _ => {
                return Err(AdmissionError::ValidatorError(
                    verdict.reason.unwrap_or_else(|| "unspecified".to_string()),
                ));
            }
        }

        let assigned_id = verdict
            .assigned_id
            .ok_or_else(|| AdmissionError::Malformed("approved result without id".to_string()))?;
        let certificate = verdict
            .certificate
            .ok_or_else(|| AdmissionError::Malformed("approved result without certificate".to_string()))?;
        let identity = AssignedIdentity {
            assigned_id: ControllerId::new(assigned_id),
            certificate,
            delegation_credential: verdict.delegation_credential,
        };
        *self.identity_guard()? = Some(identity.clone());
        info!(assigned_id = %identity.assigned_id, "installed assigned identity");
        Ok(identity)
    }

    /// Returns the installed identity, if admission completed.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Poisoned`] on internal synchronization
    /// failure.
    pub fn identity(&self) -> Result<Option<AssignedIdentity>, AdmissionError> {
        Ok(self.identity_guard()?.clone())
    }

    /// Acquires the identity mutex.
    fn identity_guard(&self) -> Result<MutexGuard<'_, Option<AssignedIdentity>>, AdmissionError> {
        self.identity.lock().map_err(|_| AdmissionError::Poisoned)
    }
}

/// Parses a wire rejection label.
fn reason_from_label(label: &str) -> Option<RejectionReason> {
    serde_json::from_value(Value::String(label.to_string())).ok()
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pdsno_core::Clock;
    use pdsno_core::ControllerId;
    use pdsno_core::ControllerRole;
    use pdsno_core::InMemoryNib;
    use pdsno_core::ManualClock;
    use pdsno_core::MessageEnvelope;
    use pdsno_core::MessageType;
    use pdsno_core::NibStore;
    use pdsno_core::Region;
    use pdsno_core::UtcTimestamp;
    use serde_json::Map;
    use serde_json::Value;

    use super::AdmissionCandidate;
    use super::AdmissionPolicy;
    use super::AdmissionValidator;
    use super::RejectionReason;
    use crate::bootstrap::BootstrapAuthority;

    const BOOTSTRAP_SECRET: &[u8] = b"pdsno-bootstrap-secret-for-tests";
    const SIGNING_SECRET: &[u8] = b"pdsno-certificate-secret-4-tests";

    struct Rig {
        clock: Arc<ManualClock>,
        nib: Arc<InMemoryNib>,
        validator: AdmissionValidator,
    }

    fn rig() -> Rig {
        let clock = Arc::new(ManualClock::starting_at(
            UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap(),
        ));
        let nib = Arc::new(InMemoryNib::new(*b"0123456789abcdef0123456789abcdef"));
        let validator = AdmissionValidator::new(
            ControllerId::new("global_cntl_1"),
            BootstrapAuthority::new(BOOTSTRAP_SECRET),
            AdmissionPolicy::default(),
            SIGNING_SECRET,
            nib.clone(),
            clock.clone(),
        )
        .unwrap();
        Rig {
            clock,
            nib,
            validator,
        }
    }

    fn candidate(temp_id: &str) -> AdmissionCandidate {
        AdmissionCandidate::new(
            ControllerId::new(temp_id),
            ControllerRole::Regional,
            Region::new("zone-A"),
            Map::new(),
        )
    }

    fn request_envelope(rig: &Rig, payload: Map<String, Value>, temp_id: &str) -> MessageEnvelope {
        MessageEnvelope::new(
            ControllerId::new(temp_id),
            ControllerId::new("global_cntl_1"),
            MessageType::ValidationRequest,
            payload,
            None,
            rig.clock.now(),
        )
    }

    fn mint_token(temp_id: &str) -> String {
        BootstrapAuthority::new(BOOTSTRAP_SECRET)
            .mint(temp_id, &Region::new("zone-A"), ControllerRole::Regional)
            .unwrap()
    }

    fn reason_of(envelope: &MessageEnvelope) -> Option<String> {
        envelope.payload.get("reason").and_then(Value::as_str).map(str::to_string)
    }

    #[test]
    fn happy_path_assigns_first_regional_identity() {
        let rig = rig();
        let candidate = candidate("temp-rc-001");
        let request = candidate.build_validation_request(&mint_token("temp-rc-001")).unwrap();

        let challenge = rig
            .validator
            .handle_validation_request(&request_envelope(&rig, request, "temp-rc-001"));
        assert_eq!(challenge.message_type, MessageType::Challenge);

        let answer = candidate.answer_challenge(&challenge.payload).unwrap();
        let result = rig
            .validator
            .handle_challenge_response(&request_envelope(&rig, answer, "temp-rc-001"));
        assert_eq!(result.message_type, MessageType::ValidationResult);

        let identity = candidate.install_result(&result.payload).unwrap();
        assert_eq!(identity.assigned_id.as_str(), "regional_cntl_zone-A_1");
        assert!(identity.delegation_credential.is_some());

        let record = rig
            .nib
            .get_controller(&ControllerId::new("regional_cntl_zone-A_1"))
            .unwrap()
            .unwrap();
        assert_eq!(record.validated_by, Some(ControllerId::new("global_cntl_1")));
        assert!(record.validated_at.is_some());

        let events = rig.nib.events_by_type("CONTROLLER_VALIDATED").unwrap();
        assert_eq!(events.len(), 1);
        assert!(rig.nib.verify_event(&events[0]).unwrap());
    }

    #[test]
    fn stale_timestamp_rejects_without_nib_writes() {
        let rig = rig();
        let candidate = candidate("temp-rc-001");
        let request = candidate.build_validation_request(&mint_token("temp-rc-001")).unwrap();
        let mut envelope = request_envelope(&rig, request, "temp-rc-001");
        envelope.timestamp = envelope.timestamp.minus_seconds(600);

        let result = rig.validator.handle_validation_request(&envelope);
        assert_eq!(result.message_type, MessageType::ValidationResult);
        assert_eq!(reason_of(&result).as_deref(), Some("STALE_TIMESTAMP"));
        assert!(rig.nib.recent_events(10).unwrap().is_empty());
    }

    #[test]
    fn future_timestamp_beyond_skew_is_rejected() {
        let rig = rig();
        let candidate = candidate("temp-rc-001");
        let request = candidate.build_validation_request(&mint_token("temp-rc-001")).unwrap();
        let mut envelope = request_envelope(&rig, request, "temp-rc-001");
        envelope.timestamp = envelope.timestamp.plus_seconds(301);

        let result = rig.validator.handle_validation_request(&envelope);
        assert_eq!(reason_of(&result).as_deref(), Some("FUTURE_TIMESTAMP"));
    }

    #[test]
    fn wrong_bootstrap_token_is_rejected() {
        let rig = rig();
        let candidate = candidate("temp-rc-001");
        let request = candidate.build_validation_request(&"0".repeat(64)).unwrap();
        let result =
            rig.validator.handle_validation_request(&request_envelope(&rig, request, "temp-rc-001"));
        assert_eq!(reason_of(&result).as_deref(), Some("INVALID_BOOTSTRAP_TOKEN"));
    }

    #[test]
    fn expired_challenge_is_rejected_and_consumed() {
        let rig = rig();
        let candidate = candidate("temp-rc-001");
        let request = candidate.build_validation_request(&mint_token("temp-rc-001")).unwrap();
        let challenge = rig
            .validator
            .handle_validation_request(&request_envelope(&rig, request, "temp-rc-001"));
        let answer = candidate.answer_challenge(&challenge.payload).unwrap();

        rig.clock.advance_seconds(31);
        let result = rig
            .validator
            .handle_challenge_response(&request_envelope(&rig, answer.clone(), "temp-rc-001"));
        assert_eq!(reason_of(&result).as_deref(), Some("CHALLENGE_EXPIRED"));

        let retry = rig
            .validator
            .handle_challenge_response(&request_envelope(&rig, answer, "temp-rc-001"));
        assert_eq!(reason_of(&retry).as_deref(), Some("UNKNOWN_CHALLENGE"));
    }

    #[test]
    fn signature_from_a_different_key_is_rejected() {
        let rig = rig();
        let honest = candidate("temp-rc-001");
        let imposter = candidate("temp-rc-001");
        let request = honest.build_validation_request(&mint_token("temp-rc-001")).unwrap();
        let challenge = rig
            .validator
            .handle_validation_request(&request_envelope(&rig, request, "temp-rc-001"));

        // Imposter signs with its own key against the honest enrollment.
        let answer = imposter.answer_challenge(&challenge.payload).unwrap();
        let result = rig
            .validator
            .handle_challenge_response(&request_envelope(&rig, answer, "temp-rc-001"));
        assert_eq!(reason_of(&result).as_deref(), Some("INVALID_SIGNATURE"));
    }

    #[test]
    fn disallowed_region_is_rejected_at_policy_stage() {
        let rig = rig();
        let candidate = AdmissionCandidate::new(
            ControllerId::new("temp-rc-009"),
            ControllerRole::Regional,
            Region::new("zone-Z"),
            Map::new(),
        );
        let token = BootstrapAuthority::new(BOOTSTRAP_SECRET)
            .mint("temp-rc-009", &Region::new("zone-Z"), ControllerRole::Regional)
            .unwrap();
        let request = candidate.build_validation_request(&token).unwrap();
        let challenge = rig
            .validator
            .handle_validation_request(&request_envelope(&rig, request, "temp-rc-009"));
        assert_eq!(challenge.message_type, MessageType::Challenge);

        let answer = candidate.answer_challenge(&challenge.payload).unwrap();
        let result = rig
            .validator
            .handle_challenge_response(&request_envelope(&rig, answer, "temp-rc-009"));
        assert_eq!(reason_of(&result).as_deref(), Some("INVALID_REGION"));
    }

    #[test]
    fn sequence_increments_across_admissions() {
        let rig = rig();
        for (index, temp_id) in ["temp-rc-001", "temp-rc-002"].iter().enumerate() {
            let candidate = candidate(temp_id);
            let request = candidate.build_validation_request(&mint_token(temp_id)).unwrap();
            let challenge = rig
                .validator
                .handle_validation_request(&request_envelope(&rig, request, temp_id));
            let answer = candidate.answer_challenge(&challenge.payload).unwrap();
            let result =
                rig.validator.handle_challenge_response(&request_envelope(&rig, answer, temp_id));
            let identity = candidate.install_result(&result.payload).unwrap();
            assert_eq!(
                identity.assigned_id.as_str(),
                format!("regional_cntl_zone-A_{}", index + 1)
            );
        }
    }

    #[test]
    fn rejected_reason_surfaces_on_candidate_side() {
        let rig = rig();
        let candidate = candidate("temp-rc-001");
        let request = candidate.build_validation_request(&"0".repeat(64)).unwrap();
        let result =
            rig.validator.handle_validation_request(&request_envelope(&rig, request, "temp-rc-001"));
        let installed = candidate.install_result(&result.payload);
        assert!(matches!(
            installed,
            Err(super::AdmissionError::Rejected(RejectionReason::InvalidBootstrapToken))
        ));
    }
}
