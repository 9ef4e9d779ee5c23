// crates/pdsno-core/src/core/envelope.rs
// ============================================================================
// Module: Message Envelope
// Description: Canonical inter-controller message envelope and type tags.
// Purpose: Provide one envelope shape for in-process, HTTP, and broker transports.
// Dependencies: serde, serde_json, uuid, crate::core::{hashing, identifiers, time}
// ============================================================================

//! ## Overview
//! Every inter-controller message travels inside a [`MessageEnvelope`]. The
//! envelope is transport-independent: replacing the in-process bus with HTTP
//! or broker delivery changes only where signatures are applied and checked.
//! Signing adds `nonce`, `signed_at`, `signature`, and `signature_algorithm`
//! on top of the routing fields; the signature covers the canonical JSON of
//! the populated envelope minus the two signature fields.
//!
//! Security posture: envelopes arriving over any transport are untrusted
//! until the authenticator verifies them.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::core::hashing;
use crate::core::hashing::HashingError;
use crate::core::identifiers::ControllerId;
use crate::core::identifiers::MessageId;
use crate::core::time::UtcTimestamp;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// The only signature algorithm accepted on the wire.
pub const SIGNATURE_ALGORITHM: &str = "HMAC-SHA256";

/// Recipient id used for fan-out messages.
pub const BROADCAST_RECIPIENT: &str = "broadcast";

// ============================================================================
// SECTION: Message Types
// ============================================================================

/// Enumerated inter-controller message types.
///
/// # Invariants
/// - Wire labels are stable SCREAMING_SNAKE strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Candidate requests admission.
    ValidationRequest,
    /// Validator issues a challenge.
    Challenge,
    /// Candidate returns the signed nonce.
    ChallengeResponse,
    /// Validator's final admission verdict.
    ValidationResult,
    /// Request an on-demand discovery cycle.
    DiscoveryRequest,
    /// Delta-only discovery report.
    DiscoveryReport,
    /// Aggregated regional discovery summary.
    DiscoverySummary,
    /// Configuration change proposal.
    ConfigProposal,
    /// Approval decision for a proposal.
    ConfigApproval,
    /// Rejection decision for a proposal.
    ConfigRejection,
    /// Policy distribution to a region.
    PolicyUpdate,
    /// Acknowledgement of a policy update.
    PolicyAck,
    /// Liveness beacon.
    Heartbeat,
    /// State synchronization request.
    SyncRequest,
    /// State synchronization response.
    SyncResponse,
}

impl MessageType {
    /// Returns the stable wire label for the message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationRequest => "VALIDATION_REQUEST",
            Self::Challenge => "CHALLENGE",
            Self::ChallengeResponse => "CHALLENGE_RESPONSE",
            Self::ValidationResult => "VALIDATION_RESULT",
            Self::DiscoveryRequest => "DISCOVERY_REQUEST",
            Self::DiscoveryReport => "DISCOVERY_REPORT",
            Self::DiscoverySummary => "DISCOVERY_SUMMARY",
            Self::ConfigProposal => "CONFIG_PROPOSAL",
            Self::ConfigApproval => "CONFIG_APPROVAL",
            Self::ConfigRejection => "CONFIG_REJECTION",
            Self::PolicyUpdate => "POLICY_UPDATE",
            Self::PolicyAck => "POLICY_ACK",
            Self::Heartbeat => "HEARTBEAT",
            Self::SyncRequest => "SYNC_REQUEST",
            Self::SyncResponse => "SYNC_RESPONSE",
        }
    }

    /// Parses a wire label, tolerating lowercase transport paths.
    #[must_use]
    pub fn from_wire(label: &str) -> Option<Self> {
        match label.to_ascii_uppercase().as_str() {
            "VALIDATION_REQUEST" => Some(Self::ValidationRequest),
            "CHALLENGE" => Some(Self::Challenge),
            "CHALLENGE_RESPONSE" => Some(Self::ChallengeResponse),
            "VALIDATION_RESULT" => Some(Self::ValidationResult),
            "DISCOVERY_REQUEST" => Some(Self::DiscoveryRequest),
            "DISCOVERY_REPORT" => Some(Self::DiscoveryReport),
            "DISCOVERY_SUMMARY" => Some(Self::DiscoverySummary),
            "CONFIG_PROPOSAL" => Some(Self::ConfigProposal),
            "CONFIG_APPROVAL" => Some(Self::ConfigApproval),
            "CONFIG_REJECTION" => Some(Self::ConfigRejection),
            "POLICY_UPDATE" => Some(Self::PolicyUpdate),
            "POLICY_ACK" => Some(Self::PolicyAck),
            "HEARTBEAT" => Some(Self::Heartbeat),
            "SYNC_REQUEST" => Some(Self::SyncRequest),
            "SYNC_RESPONSE" => Some(Self::SyncResponse),
            _ => None,
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while building or canonicalizing envelopes.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Envelope could not be canonicalized for signing.
    #[error("envelope canonicalization failure: {0}")]
    Canonicalize(String),
    /// Envelope JSON did not have the expected object shape.
    #[error("envelope is not a json object")]
    NotAnObject,
}

impl From<HashingError> for EnvelopeError {
    fn from(err: HashingError) -> Self {
        Self::Canonicalize(err.to_string())
    }
}

// ============================================================================
// SECTION: Envelope
// ============================================================================

/// Standard envelope for all inter-controller messages.
///
/// # Invariants
/// - `timestamp` is the creation time stamped by the sender.
/// - The four signing fields are all present or all absent.
/// - `correlation_id` pairs a response with the request's `message_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message identifier.
    pub message_id: MessageId,
    /// Message type tag.
    pub message_type: MessageType,
    /// Sending controller.
    pub sender_id: ControllerId,
    /// Receiving controller, or `broadcast`.
    pub recipient_id: ControllerId,
    /// Sender creation time.
    pub timestamp: UtcTimestamp,
    /// Structured payload.
    pub payload: Map<String, Value>,
    /// Correlates a response to its request; null for unsolicited messages.
    pub correlation_id: Option<MessageId>,
    /// 32-byte hex replay nonce; set by the authenticator.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nonce: Option<String>,
    /// Signing time; set by the authenticator.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signed_at: Option<UtcTimestamp>,
    /// Hex HMAC-SHA256 tag; set by the authenticator.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
    /// Signature algorithm label; set by the authenticator.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature_algorithm: Option<String>,
}

impl MessageEnvelope {
    /// Builds an unsigned envelope with a fresh message id.
    #[must_use]
    pub fn new(
        sender_id: ControllerId,
        recipient_id: ControllerId,
        message_type: MessageType,
        payload: Map<String, Value>,
        correlation_id: Option<MessageId>,
        timestamp: UtcTimestamp,
    ) -> Self {
        Self {
            message_id: MessageId::new(format!("msg-{}", short_uuid())),
            message_type,
            sender_id,
            recipient_id,
            timestamp,
            payload,
            correlation_id,
            nonce: None,
            signed_at: None,
            signature: None,
            signature_algorithm: None,
        }
    }

    /// Builds a response envelope correlated to this message.
    #[must_use]
    pub fn respond(
        &self,
        sender_id: ControllerId,
        message_type: MessageType,
        payload: Map<String, Value>,
        timestamp: UtcTimestamp,
    ) -> Self {
        Self::new(
            sender_id,
            self.sender_id.clone(),
            message_type,
            payload,
            Some(self.message_id.clone()),
            timestamp,
        )
    }

    /// Returns true when the envelope is addressed to all controllers.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.as_str() == BROADCAST_RECIPIENT
    }

    /// Returns the canonical bytes the signature covers: the envelope as a
    /// JSON object with `signature` and `signature_algorithm` removed.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] when the envelope cannot be represented as
    /// canonical JSON.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let value = serde_json::to_value(self)
            .map_err(|err| EnvelopeError::Canonicalize(err.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(EnvelopeError::NotAnObject);
        };
        fields.remove("signature");
        fields.remove("signature_algorithm");
        Ok(hashing::canonical_json_bytes(&Value::Object(fields))?)
    }

    /// Strips the signing fields, returning the envelope to its unsigned form.
    pub fn clear_signature(&mut self) {
        self.nonce = None;
        self.signed_at = None;
        self.signature = None;
        self.signature_algorithm = None;
    }
}

/// Returns the 12-character lowercase hex prefix of a fresh UUID.
fn short_uuid() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex.chars().take(12).collect()
}

// ============================================================================
// SECTION: Tests
// ============================================================================
