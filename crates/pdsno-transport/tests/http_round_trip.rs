// crates/pdsno-transport/tests/http_round_trip.rs
// ============================================================================
// Module: HTTP Transport Tests
// Description: Signed envelope round trips over a live local server.
// ============================================================================
//! ## Overview
//! Boots the axum transport on an ephemeral port, sends signed envelopes
//! through the reqwest client, and checks verification, rejection, replay,
//! and the health/info endpoints.

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

use pdsno_bus::EnvelopeGuard;
use pdsno_bus::RequestBus;
use pdsno_bus::RequestHandler;
use pdsno_core::ControllerId;
use pdsno_core::MessageEnvelope;
use pdsno_core::MessageType;
use pdsno_core::SystemClock;
use pdsno_security::MessageAuthenticator;
use pdsno_transport::ClientError;
use pdsno_transport::HttpEnvelopeClient;
use pdsno_transport::HttpTransport;
use serde_json::Map;
use serde_json::json;

const SHARED_SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

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

fn guard_for(id: &ControllerId) -> Arc<dyn EnvelopeGuard> {
    let clock = Arc::new(SystemClock);
    Arc::new(AuthGuard {
        auth: Arc::new(MessageAuthenticator::new(SHARED_SECRET, id.clone(), clock).unwrap()),
    })
}

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

/// Boots a transport for a regional controller; returns its base URL.
async fn boot_server(recipient: &ControllerId) -> String {
    let clock = Arc::new(SystemClock);
    let bus = Arc::new(RequestBus::new(clock.clone()));
    let mut handlers = HashMap::new();
    handlers.insert(MessageType::Heartbeat, heartbeat_handler());
    bus.register_controller(recipient, handlers, Some(guard_for(recipient)));

    let transport = HttpTransport::new(recipient.clone(), bus, clock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let _server = tokio::spawn(async move {
        let _ = transport.serve_on(listener).await;
    });
    format!("http://{address}/")
}

fn signed_envelope(sender: &ControllerId, recipient: &ControllerId) -> MessageEnvelope {
    MessageEnvelope::new(
        sender.clone(),
        recipient.clone(),
        MessageType::Heartbeat,
        Map::new(),
        None,
        pdsno_core::Clock::now(&SystemClock),
    )
}

#[tokio::test]
async fn signed_envelope_round_trips_over_http() {
    let sender = ControllerId::new("local_cntl_zone-A_1");
    let recipient = ControllerId::new("regional_cntl_zone-A_1");
    let base = boot_server(&recipient).await;

    let client = HttpEnvelopeClient::new(&base, Some(guard_for(&sender))).unwrap();
    let response =
        client.send(signed_envelope(&sender, &recipient)).await.unwrap().unwrap();
    assert_eq!(response.message_type, MessageType::SyncResponse);
    assert_eq!(response.payload.get("status"), Some(&json!("alive")));
}

#[tokio::test]
async fn unsigned_envelope_is_rejected_with_401() {
    let sender = ControllerId::new("local_cntl_zone-A_1");
    let recipient = ControllerId::new("regional_cntl_zone-A_1");
    let base = boot_server(&recipient).await;

    let client = HttpEnvelopeClient::new(&base, None).unwrap();
    let result = client.send(signed_envelope(&sender, &recipient)).await;
    assert!(matches!(result, Err(ClientError::Rejected { status: 401, .. })));
}

#[tokio::test]
async fn unknown_recipient_is_rejected_with_404() {
    let sender = ControllerId::new("local_cntl_zone-A_1");
    let recipient = ControllerId::new("regional_cntl_zone-A_1");
    let base = boot_server(&recipient).await;

    let client = HttpEnvelopeClient::new(&base, Some(guard_for(&sender))).unwrap();
    let stranger = ControllerId::new("regional_cntl_zone-B_9");
    let result = client.send(signed_envelope(&sender, &stranger)).await;
    assert!(matches!(result, Err(ClientError::Rejected { status: 404, .. })));
}

#[tokio::test]
async fn health_and_info_report_the_controller() {
    let recipient = ControllerId::new("regional_cntl_zone-A_1");
    let base = boot_server(&recipient).await;

    let client = HttpEnvelopeClient::new(&base, None).unwrap();
    let health = client.health().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.controller_id, "regional_cntl_zone-A_1");

    let info: serde_json::Value = reqwest::Client::new()
        .get(format!("{base}info"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let handlers = info.get("handlers").unwrap();
    assert_eq!(
        handlers.get("regional_cntl_zone-A_1").unwrap(),
        &json!(["HEARTBEAT"])
    );
}
