// crates/pdsno-security/src/bootstrap.rs
// ============================================================================
// Module: Bootstrap Tokens
// Description: Single-use provisioning tokens for admission step two.
// Purpose: Prove a candidate controller was legitimately provisioned.
// Dependencies: pdsno-core, tracing
// ============================================================================

//! ## Overview
//! A bootstrap token is `HMAC-SHA256(bootstrap_secret, "temp_id|region|type")`
//! in hex, minted at provisioning time and presented once during admission.
//! The authority checks the blocklist before any cryptography, compares in
//! constant time, and consumes the token on its first successful use so a
//! captured token cannot admit a second controller.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::MutexGuard;

use pdsno_core::ControllerRole;
use pdsno_core::Region;
use pdsno_core::hashing;
use thiserror::Error;
use tracing::warn;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while checking bootstrap tokens.
///
/// # Invariants
/// - Variants are stable; admission maps them onto wire rejection reasons.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BootstrapError {
    /// Candidate's temporary id is on the blocklist.
    #[error("candidate is blocklisted")]
    Blocklisted,
    /// Token does not match the expected value.
    #[error("invalid bootstrap token")]
    InvalidToken,
    /// Token was already used for a successful admission.
    #[error("bootstrap token already consumed")]
    Consumed,
    /// Token computation failed.
    #[error("token computation failure: {0}")]
    Compute(String),
    /// Internal synchronization failure.
    #[error("bootstrap state mutex poisoned")]
    Poisoned,
}

// ============================================================================
// SECTION: Authority
// ============================================================================

/// Mints and verifies single-use bootstrap tokens.
///
/// # Invariants
/// - Verification order is blocklist, then constant-time compare, then the
///   consumed set; a token is consumed exactly once.
pub struct BootstrapAuthority {
    /// Shared provisioning secret.
    secret: Vec<u8>,
    /// Blocklisted temporary ids.
    blocklist: Mutex<HashSet<String>>,
    /// Hex tokens already used for a successful admission.
    consumed: Mutex<HashSet<String>>,
}

impl BootstrapAuthority {
    /// Creates an authority over a provisioning secret.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            blocklist: Mutex::new(HashSet::new()),
            consumed: Mutex::new(HashSet::new()),
        }
    }

    /// Computes the token for a candidate tuple.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Compute`] when the HMAC primitive rejects
    /// the secret.
    pub fn mint(
        &self,
        temp_id: &str,
        region: &Region,
        role: ControllerRole,
    ) -> Result<String, BootstrapError> {
        let input = format!("{temp_id}|{region}|{}", role.as_str());
        hashing::hmac_sha256_hex(&self.secret, input.as_bytes())
            .map_err(|err| BootstrapError::Compute(err.to_string()))
    }

    /// Adds a temporary id to the blocklist.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Poisoned`] on internal synchronization
    /// failure.
    pub fn block(&self, temp_id: &str) -> Result<(), BootstrapError> {
        self.blocklist_guard()?.insert(temp_id.to_string());
        Ok(())
    }

    /// Verifies a submitted token and consumes it on success.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Blocklisted`], [`BootstrapError::Consumed`],
    /// or [`BootstrapError::InvalidToken`] in that precedence order.
    pub fn verify_and_consume(
        &self,
        temp_id: &str,
        region: &Region,
        role: ControllerRole,
        submitted: &str,
    ) -> Result<(), BootstrapError> {
        if self.blocklist_guard()?.contains(temp_id) {
            warn!(temp_id, "blocklisted controller attempted admission");
            return Err(BootstrapError::Blocklisted);
        }

        if self.consumed_guard()?.contains(submitted) {
            warn!(temp_id, "reused bootstrap token rejected");
            return Err(BootstrapError::Consumed);
        }

        let expected = self.mint(temp_id, region, role)?;
        if !hashing::constant_time_eq(submitted.as_bytes(), expected.as_bytes()) {
            warn!(temp_id, "invalid bootstrap token");
            return Err(BootstrapError::InvalidToken);
        }

        self.consumed_guard()?.insert(submitted.to_string());
        Ok(())
    }

    /// Acquires the blocklist mutex.
    fn blocklist_guard(&self) -> Result<MutexGuard<'_, HashSet<String>>, BootstrapError> {
        self.blocklist.lock().map_err(|_| BootstrapError::Poisoned)
    }

    /// Acquires the consumed-set mutex.
    fn consumed_guard(&self) -> Result<MutexGuard<'_, HashSet<String>>, BootstrapError> {
        self.consumed.lock().map_err(|_| BootstrapError::Poisoned)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use pdsno_core::ControllerRole;
    use pdsno_core::Region;

    use super::BootstrapAuthority;
    use super::BootstrapError;

    const SECRET: &[u8] = b"pdsno-bootstrap-secret-for-tests";

    #[test]
    fn minted_token_verifies_once_then_is_consumed() {
        let authority = BootstrapAuthority::new(SECRET);
        let region = Region::new("zone-A");
        let token = authority.mint("temp-rc-001", &region, ControllerRole::Regional).unwrap();

        assert!(
            authority
                .verify_and_consume("temp-rc-001", &region, ControllerRole::Regional, &token)
                .is_ok()
        );
        assert_eq!(
            authority.verify_and_consume("temp-rc-001", &region, ControllerRole::Regional, &token),
            Err(BootstrapError::Consumed)
        );
    }

    #[test]
    fn token_binds_the_full_candidate_tuple() {
        let authority = BootstrapAuthority::new(SECRET);
        let region = Region::new("zone-A");
        let token = authority.mint("temp-rc-001", &region, ControllerRole::Regional).unwrap();

        assert_eq!(
            authority.verify_and_consume("temp-rc-002", &region, ControllerRole::Regional, &token),
            Err(BootstrapError::InvalidToken)
        );
        assert_eq!(
            authority.verify_and_consume(
                "temp-rc-001",
                &Region::new("zone-B"),
                ControllerRole::Regional,
                &token
            ),
            Err(BootstrapError::InvalidToken)
        );
        assert_eq!(
            authority.verify_and_consume("temp-rc-001", &region, ControllerRole::Local, &token),
            Err(BootstrapError::InvalidToken)
        );
    }

    #[test]
    fn blocklist_rejects_before_token_evaluation() {
        let authority = BootstrapAuthority::new(SECRET);
        let region = Region::new("zone-A");
        let token = authority.mint("temp-rc-001", &region, ControllerRole::Regional).unwrap();
        authority.block("temp-rc-001").unwrap();
        assert_eq!(
            authority.verify_and_consume("temp-rc-001", &region, ControllerRole::Regional, &token),
            Err(BootstrapError::Blocklisted)
        );
    }
}
