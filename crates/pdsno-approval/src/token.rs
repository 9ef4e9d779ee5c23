// crates/pdsno-approval/src/token.rs
// ============================================================================
// Module: Execution Tokens
// Description: Single-use, signed, time-bounded execution authorizations.
// Purpose: Bind one approved request to one device for one execution.
// Dependencies: pdsno-core, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! A token carries its request, device, issuer, validity window, a 256-bit
//! nonce, and an HMAC-SHA256 signature over the canonical JSON of every
//! field except the signature. Verification checks presence, the signature
//! in constant time, expiry, nonce single-use, and the optional expected
//! device, then consumes the nonce. The used-nonce set clears itself on the
//! same cadence as the message replay cache.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use pdsno_core::Clock;
use pdsno_core::ControllerId;
use pdsno_core::DeviceId;
use pdsno_core::RequestId;
use pdsno_core::TokenId;
use pdsno_core::UtcTimestamp;
use pdsno_core::hashing;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default token validity (15 minutes, in seconds).
pub const DEFAULT_TOKEN_VALIDITY_SECONDS: i64 = 15 * 60;
/// Minimum signing secret length in bytes.
pub const MIN_SECRET_LENGTH: usize = 32;
/// Verifications between used-nonce cleanups.
const NONCE_CLEANUP_INTERVAL: usize = 1_000;

// ============================================================================
// SECTION: Token
// ============================================================================

/// Signed execution authorization.
///
/// # Invariants
/// - Valid for at most one successful verification against a matching
///   device within its validity window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionToken {
    /// Token identifier (16-byte hex).
    pub token_id: TokenId,
    /// Approved request being executed.
    pub request_id: RequestId,
    /// Target device.
    pub device_id: DeviceId,
    /// Issuing controller.
    pub issued_by: ControllerId,
    /// Issuance time.
    pub issued_at: UtcTimestamp,
    /// Expiry time.
    pub expires_at: UtcTimestamp,
    /// 256-bit single-use nonce (hex).
    pub nonce: String,
    /// HMAC-SHA256 over the canonical token minus this field.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
}

impl ExecutionToken {
    /// Returns the canonical bytes the signature covers.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Signing`] when the token cannot be
    /// canonicalized.
    fn signing_bytes(&self) -> Result<Vec<u8>, TokenError> {
        let value =
            serde_json::to_value(self).map_err(|err| TokenError::Signing(err.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(TokenError::Signing("token is not an object".to_string()));
        };
        fields.remove("signature");
        hashing::canonical_json_bytes(&Value::Object(fields))
            .map_err(|err| TokenError::Signing(err.to_string()))
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while issuing or verifying tokens.
///
/// # Invariants
/// - Variants are stable; `Replay` is audit-logged by callers.
#[derive(Debug, Error, PartialEq)]
pub enum TokenError {
    /// Token carries no signature.
    #[error("token has no signature")]
    MissingSignature,
    /// Signature does not recompute.
    #[error("invalid token signature")]
    InvalidSignature,
    /// Token is past its expiry.
    #[error("token expired {age_seconds:.0}s ago")]
    Expired {
        /// Seconds past expiry at verification time.
        age_seconds: f64,
    },
    /// Nonce was already consumed.
    #[error("token already used (replay detected)")]
    Replay,
    /// Token was issued for a different device.
    #[error("token issued for {token_device}, not {expected_device}")]
    DeviceMismatch {
        /// Device named in the token.
        token_device: String,
        /// Device the caller expected.
        expected_device: String,
    },
    /// Secret shorter than [`MIN_SECRET_LENGTH`].
    #[error("signing secret must be at least {MIN_SECRET_LENGTH} bytes")]
    KeyTooShort,
    /// Canonicalization or HMAC computation failed.
    #[error("token signing failure: {0}")]
    Signing(String),
}

// ============================================================================
// SECTION: Manager
// ============================================================================

/// Issues and verifies execution tokens for one controller.
///
/// # Invariants
/// - A nonce accepted by `verify` is never accepted again within a cleanup
///   window.
pub struct ExecutionTokenManager {
    /// Issuing controller.
    controller_id: ControllerId,
    /// Shared signing secret.
    secret: Vec<u8>,
    /// Consumed nonces plus the cleanup counter.
    used_nonces: Mutex<UsedNonces>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

/// Consumed-nonce bookkeeping.
#[derive(Debug, Default)]
struct UsedNonces {
    /// Nonces consumed since the last cleanup.
    seen: HashSet<String>,
    /// Verifications since the last cleanup.
    counter: usize,
}

impl ExecutionTokenManager {
    /// Creates a manager over a shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::KeyTooShort`] for undersized secrets.
    pub fn new(
        controller_id: ControllerId,
        secret: impl Into<Vec<u8>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TokenError> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LENGTH {
            return Err(TokenError::KeyTooShort);
        }
        Ok(Self {
            controller_id,
            secret,
            used_nonces: Mutex::new(UsedNonces::default()),
            clock,
        })
    }

    /// Issues a signed token for an approved request.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Signing`] when the token cannot be signed.
    pub fn issue(
        &self,
        request_id: &RequestId,
        device_id: &DeviceId,
        validity_seconds: Option<i64>,
    ) -> Result<ExecutionToken, TokenError> {
        let validity = validity_seconds.unwrap_or(DEFAULT_TOKEN_VALIDITY_SECONDS);
        let now = self.clock.now();
        let mut token = ExecutionToken {
            token_id: TokenId::new(hashing::random_hex(16)),
            request_id: request_id.clone(),
            device_id: device_id.clone(),
            issued_by: self.controller_id.clone(),
            issued_at: now,
            expires_at: now.plus_seconds(validity),
            nonce: hashing::random_hex(32),
            signature: None,
        };
        token.signature = Some(self.sign(&token)?);
        info!(
            token = %token.token_id,
            device = %device_id,
            validity_seconds = validity,
            "issued execution token"
        );
        Ok(token)
    }

    /// Verifies a token and consumes its nonce.
    ///
    /// Checks run in order: signature presence, signature, expiry, replay,
    /// expected device.
    ///
    /// # Errors
    ///
    /// Returns the first failed check as a [`TokenError`].
    pub fn verify(
        &self,
        token: &ExecutionToken,
        expected_device: Option<&DeviceId>,
    ) -> Result<(), TokenError> {
        let Some(signature) = token.signature.as_ref() else {
            return Err(TokenError::MissingSignature);
        };
        let expected_signature = self.sign(token)?;
        if !hashing::constant_time_eq(signature.as_bytes(), expected_signature.as_bytes()) {
            warn!(token = %token.token_id, "tampered execution token rejected");
            return Err(TokenError::InvalidSignature);
        }

        let now = self.clock.now();
        if now.is_after(&token.expires_at) {
            return Err(TokenError::Expired {
                age_seconds: now.seconds_since(&token.expires_at),
            });
        }

        {
            let mut used = self.nonce_guard()?;
            if used.seen.contains(&token.nonce) {
                warn!(token = %token.token_id, "replayed execution token rejected");
                return Err(TokenError::Replay);
            }
            if let Some(expected) = expected_device
                && expected != &token.device_id
            {
                return Err(TokenError::DeviceMismatch {
                    token_device: token.device_id.as_str().to_string(),
                    expected_device: expected.as_str().to_string(),
                });
            }
            used.seen.insert(token.nonce.clone());
            used.counter += 1;
            if used.counter >= NONCE_CLEANUP_INTERVAL {
                let dropped = used.seen.len();
                used.seen.clear();
                used.counter = 0;
                debug!(dropped, "cleared used-token nonce set");
            }
        }

        info!(token = %token.token_id, "verified execution token");
        Ok(())
    }

    /// Computes the token signature.
    fn sign(&self, token: &ExecutionToken) -> Result<String, TokenError> {
        let bytes = token.signing_bytes()?;
        hashing::hmac_sha256_hex(&self.secret, &bytes)
            .map_err(|err| TokenError::Signing(err.to_string()))
    }

    /// Acquires the used-nonce mutex.
    fn nonce_guard(&self) -> Result<MutexGuard<'_, UsedNonces>, TokenError> {
        self.used_nonces
            .lock()
            .map_err(|_| TokenError::Signing("nonce set mutex poisoned".to_string()))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pdsno_core::ControllerId;
    use pdsno_core::DeviceId;
    use pdsno_core::ManualClock;
    use pdsno_core::RequestId;
    use pdsno_core::UtcTimestamp;

    use super::ExecutionTokenManager;
    use super::TokenError;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::starting_at(UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap()))
    }

    fn manager(clock: &Arc<ManualClock>) -> ExecutionTokenManager {
        ExecutionTokenManager::new(
            ControllerId::new("regional_cntl_zone-A_1"),
            SECRET,
            clock.clone(),
        )
        .unwrap()
    }

    #[test]
    fn issued_token_verifies_once_then_replays() {
        let clock = clock();
        let manager = manager(&clock);
        let token = manager
            .issue(&RequestId::new("req-1"), &DeviceId::new("switch-01"), None)
            .unwrap();

        assert!(manager.verify(&token, Some(&DeviceId::new("switch-01"))).is_ok());
        assert_eq!(
            manager.verify(&token, Some(&DeviceId::new("switch-01"))),
            Err(TokenError::Replay)
        );
    }

    #[test]
    fn tampered_tokens_fail_verification() {
        let clock = clock();
        let manager = manager(&clock);
        let token = manager
            .issue(&RequestId::new("req-1"), &DeviceId::new("switch-01"), None)
            .unwrap();

        let mut retargeted = token.clone();
        retargeted.device_id = DeviceId::new("switch-99");
        assert_eq!(manager.verify(&retargeted, None), Err(TokenError::InvalidSignature));

        let mut extended = token.clone();
        extended.expires_at = extended.expires_at.plus_seconds(86_400);
        assert_eq!(manager.verify(&extended, None), Err(TokenError::InvalidSignature));

        let mut unsigned = token;
        unsigned.signature = None;
        assert_eq!(manager.verify(&unsigned, None), Err(TokenError::MissingSignature));
    }

    #[test]
    fn expiry_is_enforced() {
        let clock = clock();
        let manager = manager(&clock);
        let token = manager
            .issue(&RequestId::new("req-1"), &DeviceId::new("switch-01"), Some(60))
            .unwrap();
        clock.advance_seconds(61);
        assert!(matches!(manager.verify(&token, None), Err(TokenError::Expired { .. })));
    }

    #[test]
    fn device_binding_is_enforced_without_burning_the_nonce() {
        let clock = clock();
        let manager = manager(&clock);
        let token = manager
            .issue(&RequestId::new("req-1"), &DeviceId::new("switch-01"), None)
            .unwrap();

        assert!(matches!(
            manager.verify(&token, Some(&DeviceId::new("switch-02"))),
            Err(TokenError::DeviceMismatch { .. })
        ));
        // The mismatch did not consume the nonce; the right device still works.
        assert!(manager.verify(&token, Some(&DeviceId::new("switch-01"))).is_ok());
    }

    #[test]
    fn undersized_secret_is_rejected() {
        let clock = clock();
        assert!(matches!(
            ExecutionTokenManager::new(
                ControllerId::new("regional_cntl_zone-A_1"),
                b"short".to_vec(),
                clock,
            ),
            Err(TokenError::KeyTooShort)
        ));
    }
}
