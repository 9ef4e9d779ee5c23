// crates/pdsno-security/src/message_auth.rs
// ============================================================================
// Module: Message Authenticator
// Description: HMAC-SHA256 envelope signing and verification with replay defence.
// Purpose: Guarantee integrity, authenticity, and freshness of every envelope.
// Dependencies: pdsno-core, tracing
// ============================================================================

//! ## Overview
//! The authenticator adds three fields to an outbound envelope: a 32-byte
//! hex nonce, an RFC 3339 `signed_at` stamp, and a hex HMAC-SHA256 tag over
//! the canonical representation of the populated envelope minus the
//! signature fields. Verification checks required fields, optional sender
//! binding, algorithm, freshness against the shared five-minute skew window,
//! the nonce replay cache, and finally the tag in constant time.
//!
//! The replay cache is private to one authenticator instance and clears
//! itself every [`NONCE_CLEANUP_INTERVAL`] verifications; production
//! deployments are expected to substitute an externally shared cache with a
//! TTL matching the freshness window.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use pdsno_core::Clock;
use pdsno_core::ControllerId;
use pdsno_core::MessageEnvelope;
use pdsno_core::SIGNATURE_ALGORITHM;
use pdsno_core::SKEW_TOLERANCE_SECONDS;
use pdsno_core::hashing;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Nonce length in bytes (64 hex characters on the wire).
pub const NONCE_LENGTH: usize = 32;
/// Minimum shared-secret length in bytes.
pub const MIN_SECRET_LENGTH: usize = 32;
/// Verifications between replay-cache cleanups.
pub const NONCE_CLEANUP_INTERVAL: usize = 1_000;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while signing or verifying envelopes.
///
/// # Invariants
/// - Variants are stable; `Replay` is silently refused by callers and only
///   audit-logged.
#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    /// A required signing field is absent.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    /// Envelope sender does not match the expected sender binding.
    #[error("sender mismatch: expected {expected}, got {actual}")]
    SenderMismatch {
        /// Sender the caller expected.
        expected: String,
        /// Sender carried by the envelope.
        actual: String,
    },
    /// Signature algorithm label is not `HMAC-SHA256`.
    #[error("unsupported signature algorithm")]
    UnsupportedAlgorithm,
    /// Message is outside the freshness window.
    #[error("message too old or future-dated: {age_seconds:.0}s (max {SKEW_TOLERANCE_SECONDS}s)")]
    Stale {
        /// Observed absolute age in seconds.
        age_seconds: f64,
    },
    /// Nonce was already seen by this verifier.
    #[error("replay detected: nonce already seen")]
    Replay,
    /// Recomputed tag does not match the carried signature.
    #[error("invalid signature: message may have been tampered with")]
    InvalidSignature,
    /// Shared secret shorter than [`MIN_SECRET_LENGTH`].
    #[error("shared secret must be at least {MIN_SECRET_LENGTH} bytes")]
    KeyTooShort,
    /// Canonicalization or HMAC computation failed.
    #[error("signing failure: {0}")]
    Signing(String),
}

// ============================================================================
// SECTION: Authenticator
// ============================================================================

/// Signs and verifies envelopes with a shared HMAC-SHA256 secret.
///
/// # Invariants
/// - The secret is at least [`MIN_SECRET_LENGTH`] bytes and swapped
///   atomically on rotation.
/// - A nonce accepted by `verify` is never accepted again by the same
///   instance within a cleanup window.
pub struct MessageAuthenticator {
    /// Identity of the controller that owns this authenticator.
    controller_id: ControllerId,
    /// Shared secret guarded for atomic rotation.
    secret: Mutex<Vec<u8>>,
    /// Replay cache of accepted nonces plus its cleanup counter.
    seen_nonces: Mutex<NonceCache>,
    /// Time source for `signed_at` stamps and freshness checks.
    clock: Arc<dyn Clock>,
}

/// Replay cache with its self-cleanup counter.
#[derive(Debug, Default)]
struct NonceCache {
    /// Nonces accepted since the last cleanup.
    seen: HashSet<String>,
    /// Verifications since the last cleanup.
    counter: usize,
}

impl MessageAuthenticator {
    /// Creates an authenticator for a controller.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyTooShort`] when the secret is under
    /// [`MIN_SECRET_LENGTH`] bytes.
    pub fn new(
        shared_secret: impl Into<Vec<u8>>,
        controller_id: ControllerId,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        let secret = shared_secret.into();
        if secret.len() < MIN_SECRET_LENGTH {
            return Err(AuthError::KeyTooShort);
        }
        Ok(Self {
            controller_id,
            secret: Mutex::new(secret),
            seen_nonces: Mutex::new(NonceCache::default()),
            clock,
        })
    }

    /// Returns the owning controller's id.
    #[must_use]
    pub const fn controller_id(&self) -> &ControllerId {
        &self.controller_id
    }

    /// Signs an envelope in place, populating nonce, `signed_at`, signature,
    /// and algorithm fields.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Signing`] when canonicalization fails.
    pub fn sign(&self, envelope: &mut MessageEnvelope) -> Result<(), AuthError> {
        envelope.nonce = Some(hashing::random_hex(NONCE_LENGTH));
        envelope.signed_at = Some(self.clock.now());
        let bytes = envelope.signing_bytes().map_err(|err| AuthError::Signing(err.to_string()))?;
        let tag = {
            let secret = self.secret_guard()?;
            hashing::hmac_sha256_hex(&secret, &bytes)
                .map_err(|err| AuthError::Signing(err.to_string()))?
        };
        envelope.signature = Some(tag);
        envelope.signature_algorithm = Some(SIGNATURE_ALGORITHM.to_string());
        debug!(message_id = %envelope.message_id, "signed envelope");
        Ok(())
    }

    /// Verifies an envelope signature, freshness, and nonce uniqueness.
    ///
    /// Checks run in order: required fields, optional sender binding,
    /// algorithm, freshness, replay, signature.
    ///
    /// # Errors
    ///
    /// Returns the first failed check as an [`AuthError`].
    pub fn verify(
        &self,
        envelope: &MessageEnvelope,
        expected_sender: Option<&ControllerId>,
    ) -> Result<(), AuthError> {
        let signature = envelope.signature.as_ref().ok_or(AuthError::MissingField("signature"))?;
        let nonce = envelope.nonce.as_ref().ok_or(AuthError::MissingField("nonce"))?;
        let signed_at = envelope.signed_at.ok_or(AuthError::MissingField("signed_at"))?;
        if envelope.sender_id.as_str().is_empty() {
            return Err(AuthError::MissingField("sender_id"));
        }

        if let Some(expected) = expected_sender
            && expected != &envelope.sender_id
        {
            return Err(AuthError::SenderMismatch {
                expected: expected.as_str().to_string(),
                actual: envelope.sender_id.as_str().to_string(),
            });
        }

        if let Some(algorithm) = envelope.signature_algorithm.as_deref()
            && algorithm != SIGNATURE_ALGORITHM
        {
            return Err(AuthError::UnsupportedAlgorithm);
        }

        let age_seconds = self.clock.now().seconds_since(&signed_at);
        if age_seconds.abs() > SKEW_TOLERANCE_SECONDS as f64 {
            warn!(message_id = %envelope.message_id, age_seconds, "stale envelope rejected");
            return Err(AuthError::Stale {
                age_seconds,
            });
        }

        {
            let mut cache = self.nonce_guard()?;
            if cache.seen.contains(nonce) {
                warn!(message_id = %envelope.message_id, "replayed nonce rejected");
                return Err(AuthError::Replay);
            }
            cache.seen.insert(nonce.clone());
            cache.counter += 1;
            if cache.counter >= NONCE_CLEANUP_INTERVAL {
                let dropped = cache.seen.len();
                cache.seen.clear();
                cache.counter = 0;
                debug!(dropped, "cleared replay nonce cache");
            }
        }

        let bytes = envelope.signing_bytes().map_err(|err| AuthError::Signing(err.to_string()))?;
        let expected_tag = {
            let secret = self.secret_guard()?;
            hashing::hmac_sha256_hex(&secret, &bytes)
                .map_err(|err| AuthError::Signing(err.to_string()))?
        };
        if !hashing::constant_time_eq(signature.as_bytes(), expected_tag.as_bytes()) {
            warn!(message_id = %envelope.message_id, "invalid envelope signature");
            return Err(AuthError::InvalidSignature);
        }

        debug!(message_id = %envelope.message_id, sender = %envelope.sender_id, "verified envelope");
        Ok(())
    }

    /// Atomically swaps the shared secret.
    ///
    /// Gradual rotation (accepting the old and new key in parallel) is a
    /// permitted elaboration that lives in the key manager, not here.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyTooShort`] when the new secret is under
    /// [`MIN_SECRET_LENGTH`] bytes.
    pub fn rotate_key(&self, new_secret: impl Into<Vec<u8>>) -> Result<(), AuthError> {
        let new_secret = new_secret.into();
        if new_secret.len() < MIN_SECRET_LENGTH {
            return Err(AuthError::KeyTooShort);
        }
        *self.secret_guard()? = new_secret;
        debug!(controller = %self.controller_id, "rotated shared secret");
        Ok(())
    }

    /// Acquires the secret mutex, mapping poisoning to a signing failure.
    fn secret_guard(&self) -> Result<MutexGuard<'_, Vec<u8>>, AuthError> {
        self.secret.lock().map_err(|_| AuthError::Signing("secret mutex poisoned".to_string()))
    }

    /// Acquires the nonce-cache mutex, mapping poisoning to a signing failure.
    fn nonce_guard(&self) -> Result<MutexGuard<'_, NonceCache>, AuthError> {
        self.seen_nonces
            .lock()
            .map_err(|_| AuthError::Signing("nonce cache mutex poisoned".to_string()))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pdsno_core::Clock;
    use pdsno_core::ControllerId;
    use pdsno_core::ManualClock;
    use pdsno_core::MessageEnvelope;
    use pdsno_core::MessageType;
    use pdsno_core::UtcTimestamp;
    use serde_json::Map;
    use serde_json::json;

    use super::AuthError;
    use super::MessageAuthenticator;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::starting_at(UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap()))
    }

    fn authenticator(clock: &Arc<ManualClock>) -> MessageAuthenticator {
        MessageAuthenticator::new(SECRET, ControllerId::new("global_cntl_1"), clock.clone())
            .unwrap()
    }

    fn envelope(clock: &Arc<ManualClock>) -> MessageEnvelope {
        let mut payload = Map::new();
        payload.insert("temp_id".to_string(), json!("temp-rc-001"));
        MessageEnvelope::new(
            ControllerId::new("temp-rc-001"),
            ControllerId::new("global_cntl_1"),
            MessageType::ValidationRequest,
            payload,
            None,
            clock.now(),
        )
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let clock = clock();
        let auth = authenticator(&clock);
        let mut message = envelope(&clock);
        auth.sign(&mut message).unwrap();
        assert!(auth.verify(&message, None).is_ok());
    }

    #[test]
    fn payload_mutation_is_rejected() {
        let clock = clock();
        let auth = authenticator(&clock);
        let mut message = envelope(&clock);
        auth.sign(&mut message).unwrap();
        message.payload.insert("temp_id".to_string(), json!("temp-rc-002"));
        assert_eq!(auth.verify(&message, None), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn sender_mutation_is_rejected() {
        let clock = clock();
        let auth = authenticator(&clock);
        let mut message = envelope(&clock);
        auth.sign(&mut message).unwrap();
        message.sender_id = ControllerId::new("temp-rc-002");
        assert_eq!(auth.verify(&message, None), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn second_delivery_of_the_same_nonce_is_replay() {
        let clock = clock();
        let auth = authenticator(&clock);
        let mut message = envelope(&clock);
        auth.sign(&mut message).unwrap();
        assert!(auth.verify(&message, None).is_ok());
        assert_eq!(auth.verify(&message, None), Err(AuthError::Replay));
    }

    #[test]
    fn stale_and_future_messages_are_rejected() {
        let clock = clock();
        let auth = authenticator(&clock);
        let mut message = envelope(&clock);
        auth.sign(&mut message).unwrap();

        clock.advance_seconds(301);
        assert!(matches!(auth.verify(&message, None), Err(AuthError::Stale { .. })));

        clock.advance_seconds(-700);
        assert!(matches!(auth.verify(&message, None), Err(AuthError::Stale { .. })));
    }

    #[test]
    fn expected_sender_binding_is_enforced() {
        let clock = clock();
        let auth = authenticator(&clock);
        let mut message = envelope(&clock);
        auth.sign(&mut message).unwrap();
        let other = ControllerId::new("temp-rc-999");
        assert!(matches!(auth.verify(&message, Some(&other)), Err(AuthError::SenderMismatch { .. })));
    }

    #[test]
    fn rotation_swaps_the_secret() {
        let clock = clock();
        let auth = authenticator(&clock);
        let mut message = envelope(&clock);
        auth.sign(&mut message).unwrap();

        auth.rotate_key(*b"fedcba9876543210fedcba9876543210").unwrap();
        assert_eq!(auth.verify(&message, None), Err(AuthError::InvalidSignature));
        assert_eq!(auth.rotate_key(b"short".to_vec()), Err(AuthError::KeyTooShort));

        let mut fresh = envelope(&clock);
        auth.sign(&mut fresh).unwrap();
        assert!(auth.verify(&fresh, None).is_ok());
    }
}
