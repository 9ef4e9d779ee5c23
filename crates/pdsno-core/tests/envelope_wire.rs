// crates/pdsno-core/tests/envelope_wire.rs
// ============================================================================
// Module: Envelope Wire Tests
// Description: Round-trip and canonicalization properties for the envelope.
// ============================================================================
//! ## Overview
//! Validates that envelopes survive the wire unchanged and that the signing
//! byte form is stable across serialization round trips.

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

use pdsno_core::ControllerId;
use pdsno_core::MessageEnvelope;
use pdsno_core::MessageType;
use pdsno_core::UtcTimestamp;
use proptest::prelude::any;
use proptest::prelude::proptest;
use serde_json::Map;
use serde_json::json;

/// Builds an envelope with the given payload entries.
fn envelope_with(entries: &[(String, String)]) -> MessageEnvelope {
    let mut payload = Map::new();
    for (key, value) in entries {
        payload.insert(key.clone(), json!(value));
    }
    MessageEnvelope::new(
        ControllerId::new("local_cntl_zone-A_1"),
        ControllerId::new("regional_cntl_zone-A_1"),
        MessageType::DiscoveryReport,
        payload,
        None,
        UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap(),
    )
}

proptest! {
    /// Envelopes survive a JSON round trip unchanged.
    #[test]
    fn round_trip_preserves_envelope(entries in proptest::collection::vec((any::<String>(), any::<String>()), 0..8)) {
        let envelope = envelope_with(&entries);
        let wire = serde_json::to_string(&envelope).unwrap();
        let decoded: MessageEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(decoded, envelope);
    }

    /// The signing byte form is identical before and after a wire round trip.
    #[test]
    fn signing_bytes_survive_round_trip(entries in proptest::collection::vec((any::<String>(), any::<String>()), 0..8)) {
        let envelope = envelope_with(&entries);
        let wire = serde_json::to_string(&envelope).unwrap();
        let decoded: MessageEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(decoded.signing_bytes().unwrap(), envelope.signing_bytes().unwrap());
    }
}

/// Message type wire labels match the documented HTTP path forms.
#[test]
fn message_type_labels_match_transport_paths() {
    for (path, expected) in [
        ("validation_request", MessageType::ValidationRequest),
        ("challenge_response", MessageType::ChallengeResponse),
        ("discovery_summary", MessageType::DiscoverySummary),
        ("policy_ack", MessageType::PolicyAck),
        ("sync_response", MessageType::SyncResponse),
    ] {
        assert_eq!(MessageType::from_wire(path), Some(expected));
        assert_eq!(expected.as_str().to_ascii_lowercase(), path);
    }
}
