// crates/pdsno-security/src/dh.rs
// ============================================================================
// Module: Diffie-Hellman Key Exchange
// Description: Ephemeral finite-field DH with HKDF-SHA256 key derivation.
// Purpose: Let two controllers derive a shared secret without prior
// provisioning.
// Dependencies: pdsno-core, num-bigint, hkdf, sha2, hex, serde
// ============================================================================

//! ## Overview
//! Key agreement uses the RFC 3526 2048-bit MODP group (group 14, generator
//! 2) with fresh 256-bit private exponents per exchange, giving forward
//! secrecy. Both ends feed the raw shared secret through HKDF-SHA256 with a
//! fixed salt and the `pdsno-shared-secret` info label to produce a 32-byte
//! symmetric key, stored under the deterministic pairwise key id so both
//! ends agree on the storage key.
//!
//! Three-message protocol: the initiator sends its public key, the
//! responder derives and replies with its own public key, and the initiator
//! finalizes by deriving the same secret.
//!
//! Security posture: peer public values are untrusted; degenerate values
//! (0, 1, p−1) are rejected before exponentiation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use hkdf::Hkdf;
use num_bigint::BigUint;
use pdsno_core::Clock;
use pdsno_core::ControllerId;
use pdsno_core::KeyId;
use pdsno_core::UtcTimestamp;
use pdsno_core::hashing;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::info;

use crate::keys::KeyError;
use crate::keys::KeyManager;

// ============================================================================
// SECTION: Group Parameters
// ============================================================================

/// RFC 3526 group 14 modulus (2048-bit MODP), big-endian hex.
const MODP_2048_PRIME_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E08\
8A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651\
ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C180E86039B2783A2\
EC07A28FB5C55DF06F4C52C9DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A8AACAA68\
FFFFFFFFFFFFFFFF";

/// Group generator.
const GENERATOR: u32 = 2;
/// Private exponent length in bytes (256-bit).
const PRIVATE_KEY_BYTES: usize = 32;
/// Serialized public value length in bytes (matches the modulus width).
const PUBLIC_KEY_BYTES: usize = 256;
/// HKDF salt fixed across the deployment.
const HKDF_SALT: &[u8] = b"pdsno-controller-key-derivation";
/// HKDF info label binding derived keys to this protocol.
const HKDF_INFO: &[u8] = b"pdsno-shared-secret";
/// Derived symmetric key length in bytes.
const DERIVED_KEY_BYTES: usize = 32;

/// Returns the group modulus.
fn group_prime() -> BigUint {
    // A failed parse yields zero, which no later range check accepts.
    BigUint::parse_bytes(MODP_2048_PRIME_HEX.as_bytes(), 16).unwrap_or_default()
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised during key exchange.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyExchangeError {
    /// Peer public value failed to decode.
    #[error("invalid peer public key encoding")]
    InvalidPublicKey,
    /// Peer public value is 0, 1, or p−1.
    #[error("degenerate peer public key rejected")]
    DegeneratePublicKey,
    /// No exchange in progress with the peer.
    #[error("no active key exchange with {0}")]
    NoActiveExchange(String),
    /// HKDF expansion failed.
    #[error("key derivation failure")]
    Derivation,
    /// Key storage failed.
    #[error("key storage failure: {0}")]
    Storage(String),
}

impl From<KeyError> for KeyExchangeError {
    fn from(err: KeyError) -> Self {
        Self::Storage(err.to_string())
    }
}

// ============================================================================
// SECTION: DH Exchange
// ============================================================================

/// One ephemeral Diffie-Hellman keypair.
///
/// # Invariants
/// - The private exponent is fresh per exchange and never serialized.
pub struct DhKeyExchange {
    /// Ephemeral private exponent.
    private: BigUint,
    /// Public value `g^x mod p`.
    public: BigUint,
}

impl DhKeyExchange {
    /// Generates a fresh ephemeral keypair.
    #[must_use]
    pub fn generate() -> Self {
        let prime = group_prime();
        let generator = BigUint::from(GENERATOR);
        let mut private = BigUint::from_bytes_be(&hashing::random_bytes(PRIVATE_KEY_BYTES));
        if private < BigUint::from(2_u32) {
            private += BigUint::from(2_u32);
        }
        let public = generator.modpow(&private, &prime);
        Self {
            private,
            public,
        }
    }

    /// Returns the public value as a fixed-width big-endian hex string.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        let bytes = self.public.to_bytes_be();
        let mut padded = vec![0_u8; PUBLIC_KEY_BYTES.saturating_sub(bytes.len())];
        padded.extend_from_slice(&bytes);
        hex::encode(padded)
    }

    /// Computes the 32-byte derived secret from the peer's public value.
    ///
    /// # Errors
    ///
    /// Returns [`KeyExchangeError::InvalidPublicKey`] for undecodable input
    /// and [`KeyExchangeError::DegeneratePublicKey`] for values outside
    /// `[2, p−2]`.
    pub fn compute_shared_secret(
        &self,
        peer_public_hex: &str,
    ) -> Result<[u8; DERIVED_KEY_BYTES], KeyExchangeError> {
        let peer_bytes =
            hex::decode(peer_public_hex).map_err(|_| KeyExchangeError::InvalidPublicKey)?;
        let peer = BigUint::from_bytes_be(&peer_bytes);
        let prime = group_prime();
        let two = BigUint::from(2_u32);
        if peer < two || peer > (&prime - &two) {
            return Err(KeyExchangeError::DegeneratePublicKey);
        }

        let shared = peer.modpow(&self.private, &prime);
        let shared_bytes = shared.to_bytes_be();
        let mut padded = vec![0_u8; PUBLIC_KEY_BYTES.saturating_sub(shared_bytes.len())];
        padded.extend_from_slice(&shared_bytes);

        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), &padded);
        let mut derived = [0_u8; DERIVED_KEY_BYTES];
        hkdf.expand(HKDF_INFO, &mut derived).map_err(|_| KeyExchangeError::Derivation)?;
        Ok(derived)
    }
}

// ============================================================================
// SECTION: Protocol Payloads
// ============================================================================

/// First message: the initiator's public value.
///
/// # Invariants
/// - `public_key` is fixed-width hex of the modulus size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyExchangeInit {
    /// Controller starting the exchange.
    pub initiator_id: ControllerId,
    /// Intended responder.
    pub responder_id: ControllerId,
    /// Initiator public value, hex.
    pub public_key: String,
    /// Creation time.
    pub timestamp: UtcTimestamp,
}

/// Second message: the responder's public value.
///
/// # Invariants
/// - `public_key` is fixed-width hex of the modulus size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyExchangeResponse {
    /// Controller that started the exchange.
    pub initiator_id: ControllerId,
    /// Responding controller.
    pub responder_id: ControllerId,
    /// Responder public value, hex.
    pub public_key: String,
    /// Creation time.
    pub timestamp: UtcTimestamp,
}

// ============================================================================
// SECTION: Protocol Driver
// ============================================================================

/// Drives the three-message key distribution protocol for one controller.
///
/// # Invariants
/// - At most one active exchange per peer; finalizing consumes it.
/// - Derived keys are stored under [`KeyId::for_pair`] so both ends agree.
pub struct KeyExchangeProtocol {
    /// This controller's identity.
    controller_id: ControllerId,
    /// Destination for derived keys.
    key_manager: Arc<KeyManager>,
    /// In-flight exchanges by peer.
    active: Mutex<HashMap<ControllerId, DhKeyExchange>>,
    /// Time source for payload stamps.
    clock: Arc<dyn Clock>,
}

impl KeyExchangeProtocol {
    /// Creates a protocol driver for a controller.
    #[must_use]
    pub fn new(
        controller_id: ControllerId,
        key_manager: Arc<KeyManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            controller_id,
            key_manager,
            active: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Starts an exchange with a peer, producing the init payload.
    ///
    /// # Errors
    ///
    /// Returns [`KeyExchangeError::Storage`] on internal synchronization
    /// failure.
    pub fn initiate(&self, peer: &ControllerId) -> Result<KeyExchangeInit, KeyExchangeError> {
        let exchange = DhKeyExchange::generate();
        let public_key = exchange.public_key_hex();
        self.guard()?.insert(peer.clone(), exchange);
        info!(peer = %peer, "initiated key exchange");
        Ok(KeyExchangeInit {
            initiator_id: self.controller_id.clone(),
            responder_id: peer.clone(),
            public_key,
            timestamp: self.clock.now(),
        })
    }

    /// Responds to an init: derives and stores the shared key, returning the
    /// response payload for the initiator.
    ///
    /// # Errors
    ///
    /// Propagates [`KeyExchangeError`] from derivation or storage.
    pub fn respond(
        &self,
        init: &KeyExchangeInit,
    ) -> Result<KeyExchangeResponse, KeyExchangeError> {
        let exchange = DhKeyExchange::generate();
        let derived = exchange.compute_shared_secret(&init.public_key)?;
        let key_id = KeyId::for_pair(&self.controller_id, &init.initiator_id);
        self.key_manager.set_key(&key_id, derived.to_vec())?;
        info!(peer = %init.initiator_id, key_id = %key_id, "derived shared secret (responder)");
        Ok(KeyExchangeResponse {
            initiator_id: init.initiator_id.clone(),
            responder_id: self.controller_id.clone(),
            public_key: exchange.public_key_hex(),
            timestamp: self.clock.now(),
        })
    }

    /// Finalizes an exchange with the responder's public value, deriving and
    /// storing the same shared key on the initiator side.
    ///
    /// # Errors
    ///
    /// Returns [`KeyExchangeError::NoActiveExchange`] when no exchange is in
    /// flight with the peer; otherwise propagates derivation and storage
    /// failures. The in-flight exchange is consumed in every outcome.
    pub fn finalize(
        &self,
        peer: &ControllerId,
        response: &KeyExchangeResponse,
    ) -> Result<KeyId, KeyExchangeError> {
        let exchange = self
            .guard()?
            .remove(peer)
            .ok_or_else(|| KeyExchangeError::NoActiveExchange(peer.as_str().to_string()))?;
        let derived = exchange.compute_shared_secret(&response.public_key)?;
        let key_id = KeyId::for_pair(&self.controller_id, peer);
        self.key_manager.set_key(&key_id, derived.to_vec())?;
        info!(peer = %peer, key_id = %key_id, "derived shared secret (initiator)");
        Ok(key_id)
    }

    /// Acquires the active-exchange mutex.
    fn guard(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<ControllerId, DhKeyExchange>>, KeyExchangeError> {
        self.active
            .lock()
            .map_err(|_| KeyExchangeError::Storage("exchange mutex poisoned".to_string()))
    }
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

    use super::DhKeyExchange;
    use super::KeyExchangeError;
    use super::KeyExchangeProtocol;
    use super::KeyManager;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::starting_at(UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap()))
    }

    #[test]
    fn both_ends_derive_the_same_secret() {
        let a = DhKeyExchange::generate();
        let b = DhKeyExchange::generate();
        let secret_a = a.compute_shared_secret(&b.public_key_hex()).unwrap();
        let secret_b = b.compute_shared_secret(&a.public_key_hex()).unwrap();
        assert_eq!(secret_a, secret_b);
        assert_eq!(secret_a.len(), 32);
    }

    #[test]
    fn independent_exchanges_derive_different_secrets() {
        let a = DhKeyExchange::generate();
        let b = DhKeyExchange::generate();
        let c = DhKeyExchange::generate();
        let ab = a.compute_shared_secret(&b.public_key_hex()).unwrap();
        let ac = a.compute_shared_secret(&c.public_key_hex()).unwrap();
        assert_ne!(ab, ac);
    }

    #[test]
    fn degenerate_public_values_are_rejected() {
        let a = DhKeyExchange::generate();
        assert_eq!(
            a.compute_shared_secret(&"00".repeat(256)),
            Err(KeyExchangeError::DegeneratePublicKey)
        );
        let mut one = "00".repeat(255);
        one.push_str("01");
        assert_eq!(a.compute_shared_secret(&one), Err(KeyExchangeError::DegeneratePublicKey));
        assert_eq!(
            a.compute_shared_secret("not-hex"),
            Err(KeyExchangeError::InvalidPublicKey)
        );
    }

    #[test]
    fn three_message_protocol_stores_matching_keys() {
        let clock = clock();
        let rc_id = ControllerId::new("regional_cntl_zone-A_1");
        let gc_id = ControllerId::new("global_cntl_1");

        let rc_keys = Arc::new(KeyManager::new());
        let gc_keys = Arc::new(KeyManager::new());
        let rc = KeyExchangeProtocol::new(rc_id.clone(), rc_keys.clone(), clock.clone());
        let gc = KeyExchangeProtocol::new(gc_id.clone(), gc_keys.clone(), clock.clone());

        let init = rc.initiate(&gc_id).unwrap();
        let response = gc.respond(&init).unwrap();
        let key_id = rc.finalize(&gc_id, &response).unwrap();

        assert_eq!(key_id, KeyId::for_pair(&rc_id, &gc_id));
        let rc_secret = rc_keys.get_key(&key_id).unwrap().unwrap();
        let gc_secret = gc_keys.get_key(&key_id).unwrap().unwrap();
        assert_eq!(rc_secret, gc_secret);

        assert!(matches!(
            rc.finalize(&gc_id, &response),
            Err(KeyExchangeError::NoActiveExchange(_))
        ));
    }
}
