// crates/pdsno-transport/src/server.rs
// ============================================================================
// Module: HTTP Transport Server
// Description: Axum routes bridging wire envelopes onto the request bus.
// Purpose: Accept signed envelopes over HTTP with the bus as the dispatcher.
// Dependencies: pdsno-core, pdsno-bus, axum, tokio, serde_json
// ============================================================================

//! ## Overview
//! `POST /message/{lowercased-type}` takes the envelope JSON body, checks
//! the path against the embedded type, and hands it to the bus: the
//! recipient's guard verifies, the handler runs, and the response comes
//! back signed. Responses are 200 with a signed envelope, 200 with
//! `{status: "accepted"}` for one-way messages, or 4xx with `{detail}`.
//! `GET /health` and `GET /info` serve liveness and the handler table.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::routing::post;
use pdsno_bus::BusError;
use pdsno_bus::RequestBus;
use pdsno_core::Clock;
use pdsno_core::ControllerId;
use pdsno_core::MessageEnvelope;
use pdsno_core::MessageType;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;
use tracing::warn;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while running the HTTP transport.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Listener could not be bound.
    #[error("bind failure: {0}")]
    Bind(String),
    /// Server terminated with an I/O failure.
    #[error("serve failure: {0}")]
    Serve(String),
}

// ============================================================================
// SECTION: Server
// ============================================================================

/// Shared state behind the HTTP routes.
struct TransportState {
    /// Local controller served by this transport.
    controller_id: ControllerId,
    /// Dispatcher for inbound envelopes.
    bus: Arc<RequestBus>,
    /// Time source for health stamps.
    clock: Arc<dyn Clock>,
}

/// HTTP transport for one controller process.
///
/// # Invariants
/// - Signature verification and response signing happen in the bus guard,
///   never in the route handlers.
pub struct HttpTransport {
    /// Shared route state.
    state: Arc<TransportState>,
}

impl HttpTransport {
    /// Creates a transport over a bus.
    #[must_use]
    pub fn new(controller_id: ControllerId, bus: Arc<RequestBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(TransportState {
                controller_id,
                bus,
                clock,
            }),
        }
    }

    /// Builds the route table.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route("/message/{msg_type}", post(handle_message))
            .route("/health", get(handle_health))
            .route("/info", get(handle_info))
            .with_state(self.state.clone())
    }

    /// Binds the address and serves until the process exits.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the bind or the serve loop fails.
    pub async fn serve(&self, address: SocketAddr) -> Result<(), TransportError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|err| TransportError::Bind(err.to_string()))?;
        self.serve_on(listener).await
    }

    /// Serves on an already-bound listener.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serve`] when the serve loop fails.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<(), TransportError> {
        if let Ok(address) = listener.local_addr() {
            info!(%address, controller = %self.state.controller_id, "http transport listening");
        }
        axum::serve(listener, self.router())
            .await
            .map_err(|err| TransportError::Serve(err.to_string()))
    }
}

// ============================================================================
// SECTION: Route Handlers
// ============================================================================

/// `POST /message/{msg_type}`: dispatches a wire envelope through the bus.
async fn handle_message(
    State(state): State<Arc<TransportState>>,
    Path(msg_type): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(path_type) = MessageType::from_wire(&msg_type) else {
        return detail(StatusCode::NOT_FOUND, format!("unknown message type {msg_type}"));
    };
    let envelope: MessageEnvelope = match serde_json::from_value(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            return detail(StatusCode::BAD_REQUEST, format!("malformed envelope: {err}"));
        }
    };
    if envelope.message_type != path_type {
        return detail(
            StatusCode::BAD_REQUEST,
            format!(
                "path type {} does not match envelope type {}",
                path_type.as_str(),
                envelope.message_type.as_str()
            ),
        );
    }

    match state.bus.dispatch(&envelope) {
        Ok(Some(response)) => match serde_json::to_value(&response) {
            Ok(value) => (StatusCode::OK, Json(value)),
            Err(err) => detail(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("response serialization failure: {err}"),
            ),
        },
        Ok(None) => (StatusCode::OK, Json(json!({"status": "accepted"}))),
        Err(BusError::Auth(reason)) => {
            warn!(reason, "rejected unauthenticated envelope");
            detail(StatusCode::UNAUTHORIZED, reason)
        }
        Err(err @ (BusError::UnknownRecipient(_) | BusError::NoHandler { .. })) => {
            detail(StatusCode::NOT_FOUND, err.to_string())
        }
        Err(err) => detail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// `GET /health`: liveness with the controller id and current time.
async fn handle_health(State(state): State<Arc<TransportState>>) -> (StatusCode, Json<Value>) {
    let timestamp = state.clock.now().to_rfc3339().unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "controller_id": state.controller_id.as_str(),
            "timestamp": timestamp,
        })),
    )
}

/// `GET /info`: registered handler table.
async fn handle_info(State(state): State<Arc<TransportState>>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "controller_id": state.controller_id.as_str(),
            "handlers": state.bus.registered_handlers(),
        })),
    )
}

/// Builds a `{detail}` error body.
fn detail(status: StatusCode, message: String) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"detail": message})))
}
