// crates/pdsno-core/src/core/hashing.rs
// ============================================================================
// Module: Canonical Hashing
// Description: Canonical JSON bytes, HMAC-SHA256 tags, and constant-time compare.
// Purpose: Give every signer and verifier the same byte representation.
// Dependencies: serde, serde_jcs, sha2, hmac, subtle, hex, rand
// ============================================================================

//! ## Overview
//! Every HMAC in PDSNO (envelope signatures, bootstrap tokens, execution
//! tokens, event tags, certificates) is computed over RFC 8785 canonical
//! JSON: sorted keys, no insignificant whitespace. This module provides the
//! canonical byte form, the tag computation, constant-time comparison, and
//! the random material helpers used for nonces and keys.
//!
//! Security posture: comparisons of secret-derived values must go through
//! [`constant_time_eq`]; plain `==` on tags leaks timing.

// ============================================================================
// SECTION: Imports
// ============================================================================

use hmac::Hmac;
use hmac::Mac;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while canonicalizing or tagging values.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum HashingError {
    /// Value could not be canonicalized as JSON.
    #[error("canonicalization failure: {0}")]
    Canonicalize(String),
    /// HMAC key was rejected by the primitive.
    #[error("invalid hmac key")]
    InvalidKey,
}

// ============================================================================
// SECTION: Canonical Bytes
// ============================================================================

/// Serializes a value to RFC 8785 canonical JSON bytes (sorted keys, no whitespace).
///
/// # Errors
///
/// Returns [`HashingError::Canonicalize`] when the value is not representable
/// as canonical JSON (e.g. non-string map keys, non-finite floats).
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, HashingError> {
    serde_jcs::to_vec(value).map_err(|err| HashingError::Canonicalize(err.to_string()))
}

// ============================================================================
// SECTION: HMAC Tags
// ============================================================================

/// Computes an HMAC-SHA256 tag over `data`.
///
/// # Errors
///
/// Returns [`HashingError::InvalidKey`] when the key is rejected by the
/// primitive (never for SHA-256 in practice; kept for interface stability).
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], HashingError> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| HashingError::InvalidKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Computes an HMAC-SHA256 tag over `data` and returns it hex-encoded.
///
/// # Errors
///
/// Propagates [`HashingError::InvalidKey`] from the underlying primitive.
pub fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> Result<String, HashingError> {
    Ok(hex::encode(hmac_sha256(key, data)?))
}

/// Compares two byte strings in constant time.
///
/// Length mismatches return false without inspecting content.
#[must_use]
pub fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.ct_eq(right).into()
}

// ============================================================================
// SECTION: Random Material
// ============================================================================

/// Returns `count` cryptographically random bytes.
#[must_use]
pub fn random_bytes(count: usize) -> Vec<u8> {
    let mut buffer = vec![0_u8; count];
    OsRng.fill_bytes(&mut buffer);
    buffer
}

/// Returns `count` random bytes hex-encoded (string length `2 * count`).
#[must_use]
pub fn random_hex(count: usize) -> String {
    hex::encode(random_bytes(count))
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::canonical_json_bytes;
    use super::constant_time_eq;
    use super::hmac_sha256_hex;
    use super::random_hex;

    #[test]
    fn canonical_bytes_sort_keys_without_whitespace() {
        let value = json!({"b": 2, "a": {"z": 1, "y": [1, 2]}});
        let bytes = canonical_json_bytes(&value).unwrap();
        assert_eq!(bytes, br#"{"a":{"y":[1,2],"z":1},"b":2}"#);
    }

    #[test]
    fn tag_is_stable_and_comparison_rejects_mutation() {
        let tag_a = hmac_sha256_hex(b"0123456789abcdef0123456789abcdef", b"payload").unwrap();
        let tag_b = hmac_sha256_hex(b"0123456789abcdef0123456789abcdef", b"payload").unwrap();
        assert!(constant_time_eq(tag_a.as_bytes(), tag_b.as_bytes()));
        let tag_c = hmac_sha256_hex(b"0123456789abcdef0123456789abcdef", b"payloae").unwrap();
        assert!(!constant_time_eq(tag_a.as_bytes(), tag_c.as_bytes()));
    }

    #[test]
    fn random_hex_has_requested_width() {
        assert_eq!(random_hex(32).len(), 64);
        assert_ne!(random_hex(16), random_hex(16));
    }
}
