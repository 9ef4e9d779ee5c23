// crates/pdsno-controller/src/common.rs
// ============================================================================
// Module: Controller Shared Pieces
// Description: Secrets bundle, bus guard adapter, and the error taxonomy.
// Purpose: Keep the three controller runtimes on identical plumbing.
// Dependencies: pdsno-core, pdsno-bus, pdsno-security
// ============================================================================

//! ## Overview
//! [`SharedSecrets`] carries the init-once secret material a controller
//! process receives at start (bus HMAC key, bootstrap secret, certificate
//! and token signing secret, event-log secret); nothing here is a global.
//! [`AuthenticatorGuard`] adapts the message authenticator onto the bus
//! guard seam, and [`ControllerError`] is the one error type the runtimes
//! surface.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use pdsno_bus::EnvelopeGuard;
use pdsno_core::MessageEnvelope;
use pdsno_security::MessageAuthenticator;
use thiserror::Error;

// ============================================================================
// SECTION: Secrets
// ============================================================================

/// Init-once secret material supplied at process start.
///
/// # Invariants
/// - Each secret is at least 32 bytes; constructors downstream enforce it.
#[derive(Clone)]
pub struct SharedSecrets {
    /// HMAC key for envelope signing on the bus and HTTP transport.
    pub bus_secret: Vec<u8>,
    /// Bootstrap token provisioning secret.
    pub bootstrap_secret: Vec<u8>,
    /// Certificate, delegation, and execution-token signing secret.
    pub signing_secret: Vec<u8>,
    /// NIB event-log tagging secret.
    pub event_secret: Vec<u8>,
}

impl SharedSecrets {
    /// Builds a bundle using one secret for every concern; fine for tests
    /// and single-operator labs, split per concern in production.
    #[must_use]
    pub fn uniform(secret: &[u8]) -> Self {
        Self {
            bus_secret: secret.to_vec(),
            bootstrap_secret: secret.to_vec(),
            signing_secret: secret.to_vec(),
            event_secret: secret.to_vec(),
        }
    }
}

// ============================================================================
// SECTION: Bus Guard
// ============================================================================

/// Adapts a [`MessageAuthenticator`] onto the bus guard seam.
pub struct AuthenticatorGuard {
    /// Wrapped authenticator.
    authenticator: Arc<MessageAuthenticator>,
}

impl AuthenticatorGuard {
    /// Wraps an authenticator.
    #[must_use]
    pub fn new(authenticator: Arc<MessageAuthenticator>) -> Self {
        Self {
            authenticator,
        }
    }
}

impl EnvelopeGuard for AuthenticatorGuard {
    fn on_send(&self, envelope: &mut MessageEnvelope) -> Result<(), String> {
        self.authenticator.sign(envelope).map_err(|err| err.to_string())
    }

    fn on_receive(&self, envelope: &MessageEnvelope) -> Result<(), String> {
        self.authenticator.verify(envelope, None).map_err(|err| err.to_string())
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors surfaced by controller runtimes.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Bus delivery failed.
    #[error("bus failure: {0}")]
    Bus(String),
    /// NIB operation failed.
    #[error("store failure: {0}")]
    Store(String),
    /// Admission flow failed or was rejected.
    #[error("admission failure: {0}")]
    Admission(String),
    /// Approval workflow failure.
    #[error("approval failure: {0}")]
    Approval(String),
    /// Execution token failure.
    #[error("token failure: {0}")]
    Token(String),
    /// Configuration state machine refused a transition.
    #[error("state failure: {0}")]
    State(String),
    /// Device adapter failure.
    #[error("adapter failure: {0}")]
    Adapter(String),
    /// A required collaborator was not configured.
    #[error("not configured: {0}")]
    NotConfigured(&'static str),
    /// Peer response had an unexpected shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    /// Internal synchronization failure.
    #[error("controller state mutex poisoned")]
    Poisoned,
}
