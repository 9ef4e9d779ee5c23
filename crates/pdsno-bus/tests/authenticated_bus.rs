// crates/pdsno-bus/tests/authenticated_bus.rs
// ============================================================================
// Module: Authenticated Bus Tests
// Description: Guard-hook signing and replay defence across the request bus.
// ============================================================================
//! ## Overview
//! Wires real message authenticators into the bus guard seam and checks that
//! signed traffic flows, tampered traffic is refused, and replays die at the
//! recipient.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::collections::HashMap;
use std::sync::Arc;

use pdsno_bus::BusError;
use pdsno_bus::EnvelopeGuard;
use pdsno_bus::RequestBus;
use pdsno_bus::RequestHandler;
use pdsno_core::ControllerId;
use pdsno_core::ManualClock;
use pdsno_core::MessageEnvelope;
use pdsno_core::MessageType;
use pdsno_core::UtcTimestamp;
use pdsno_security::MessageAuthenticator;
use serde_json::Map;
use serde_json::json;

/// Guard backed by a real HMAC authenticator.
struct AuthGuard {
    auth: Arc<MessageAuthenticator>,
}

impl EnvelopeGuard for AuthGuard {
    fn on_send(&self, envelope: &mut MessageEnvelope) -> Result<(), String> {
        self.auth.sign(envelope).map_err(|err| err.to_string())
    }

    fn on_receive(&self, envelope: &MessageEnvelope) -> Result<(), String> {
        self.auth.verify(envelope, None).map_err(|err| err.to_string())
    }
}

const SHARED_SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

fn heartbeat_handler() -> RequestHandler {
    Arc::new(|envelope| {
        let mut payload = Map::new();
        payload.insert("status".to_string(), json!("alive"));
        Ok(Some(envelope.respond(
            envelope.recipient_id.clone(),
            MessageType::SyncResponse,
            payload,
            envelope.timestamp,
        )))
    })
}

fn rig() -> (RequestBus, Arc<ManualClock>, ControllerId, ControllerId) {
    let clock = Arc::new(ManualClock::starting_at(
        UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap(),
    ));
    let bus = RequestBus::new(clock.clone());

    let sender = ControllerId::new("local_cntl_zone-A_1");
    let recipient = ControllerId::new("regional_cntl_zone-A_1");

    let sender_auth = Arc::new(
        MessageAuthenticator::new(SHARED_SECRET, sender.clone(), clock.clone()).unwrap(),
    );
    let recipient_auth = Arc::new(
        MessageAuthenticator::new(SHARED_SECRET, recipient.clone(), clock.clone()).unwrap(),
    );

    bus.register_controller(
        &sender,
        HashMap::new(),
        Some(Arc::new(AuthGuard {
            auth: sender_auth,
        })),
    );
    let mut handlers = HashMap::new();
    handlers.insert(MessageType::Heartbeat, heartbeat_handler());
    bus.register_controller(
        &recipient,
        handlers,
        Some(Arc::new(AuthGuard {
            auth: recipient_auth,
        })),
    );

    (bus, clock, sender, recipient)
}

/// Signed traffic flows end to end and the response verifies at the sender.
#[test]
fn signed_round_trip_succeeds() {
    let (bus, _clock, sender, recipient) = rig();
    let response = bus
        .send(&sender, &recipient, MessageType::Heartbeat, Map::new(), None)
        .unwrap()
        .unwrap();
    assert_eq!(response.message_type, MessageType::SyncResponse);
    assert!(response.signature.is_some());
}

/// A replayed wire envelope is refused by the recipient's guard.
#[test]
fn replayed_wire_envelope_is_refused() {
    let (bus, clock, sender, recipient) = rig();

    // Capture a signed wire envelope by signing one manually.
    let sender_auth =
        MessageAuthenticator::new(SHARED_SECRET, sender.clone(), clock.clone()).unwrap();
    let mut wire = MessageEnvelope::new(
        sender,
        recipient,
        MessageType::Heartbeat,
        Map::new(),
        None,
        UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap(),
    );
    sender_auth.sign(&mut wire).unwrap();

    assert!(bus.dispatch(&wire).is_ok());
    let second = bus.dispatch(&wire);
    assert!(matches!(second, Err(BusError::Auth(detail)) if detail.contains("replay")));
}

/// A tampered payload is refused before the handler runs.
#[test]
fn tampered_wire_envelope_is_refused() {
    let (bus, clock, sender, recipient) = rig();
    let sender_auth =
        MessageAuthenticator::new(SHARED_SECRET, sender.clone(), clock.clone()).unwrap();
    let mut wire = MessageEnvelope::new(
        sender,
        recipient,
        MessageType::Heartbeat,
        Map::new(),
        None,
        UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap(),
    );
    sender_auth.sign(&mut wire).unwrap();
    wire.payload.insert("status".to_string(), json!("forged"));

    let result = bus.dispatch(&wire);
    assert!(matches!(result, Err(BusError::Auth(_))));
}
