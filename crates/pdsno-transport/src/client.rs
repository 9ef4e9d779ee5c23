// crates/pdsno-transport/src/client.rs
// ============================================================================
// Module: HTTP Transport Client
// Description: Envelope POST client with signing hook, deadline, and backoff.
// Purpose: Deliver signed envelopes to remote controllers over HTTP.
// Dependencies: pdsno-core, pdsno-bus, reqwest, tokio, url
// ============================================================================

//! ## Overview
//! The client signs each outbound envelope through the same
//! [`EnvelopeGuard`] seam the bus uses, posts it to
//! `/message/<lowercased-type>` under a per-request deadline, and verifies
//! any returned envelope. Transport failures retry with exponential
//! backoff; after the attempts are exhausted the failure surfaces to the
//! caller. 4xx responses are never retried.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use pdsno_bus::EnvelopeGuard;
use pdsno_core::MessageEnvelope;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use tracing::warn;
use url::Url;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Attempts before a transport failure is surfaced.
const MAX_ATTEMPTS: u32 = 3;
/// Initial backoff delay in milliseconds; doubles per retry.
const BACKOFF_BASE_MS: u64 = 500;
/// Default per-request deadline in seconds.
const DEFAULT_DEADLINE_SECONDS: u64 = 10;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by envelope delivery.
///
/// # Invariants
/// - `Transport` is returned only after backoff is exhausted.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Base URL or path could not be formed.
    #[error("invalid url: {0}")]
    Url(String),
    /// Network failure after every retry.
    #[error("transport failure after {MAX_ATTEMPTS} attempts: {0}")]
    Transport(String),
    /// Server refused the envelope.
    #[error("request rejected ({status}): {detail}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Server-provided detail.
        detail: String,
    },
    /// Signing or response verification failed.
    #[error("authentication failure: {0}")]
    Auth(String),
    /// Response body did not parse.
    #[error("malformed response: {0}")]
    Malformed(String),
}

// ============================================================================
// SECTION: Health
// ============================================================================

/// Body of a `/health` response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    /// Reported status label.
    pub status: String,
    /// Responding controller.
    pub controller_id: String,
    /// Server-side timestamp.
    pub timestamp: String,
}

// ============================================================================
// SECTION: Client
// ============================================================================

/// HTTP envelope client for one peer controller endpoint.
///
/// # Invariants
/// - Every send is signed when a guard is present; every returned envelope
///   is verified before being handed to the caller.
pub struct HttpEnvelopeClient {
    /// Underlying HTTP client with the per-request deadline applied.
    http: reqwest::Client,
    /// Peer base URL.
    base_url: Url,
    /// Optional signing/verification hook.
    guard: Option<Arc<dyn EnvelopeGuard>>,
}

impl HttpEnvelopeClient {
    /// Creates a client for a peer endpoint with the default deadline.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Url`] for unparsable base URLs and
    /// [`ClientError::Transport`] when the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        guard: Option<Arc<dyn EnvelopeGuard>>,
    ) -> Result<Self, ClientError> {
        Self::with_deadline(base_url, guard, DEFAULT_DEADLINE_SECONDS)
    }

    /// Creates a client with an explicit per-request deadline.
    ///
    /// # Errors
    ///
    /// Mirrors [`HttpEnvelopeClient::new`].
    pub fn with_deadline(
        base_url: &str,
        guard: Option<Arc<dyn EnvelopeGuard>>,
        deadline_seconds: u64,
    ) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url).map_err(|err| ClientError::Url(err.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(deadline_seconds))
            .build()
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            base_url,
            guard,
        })
    }

    /// Signs and delivers an envelope, returning the verified response
    /// envelope when the peer sent one.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] per the retry and rejection rules above.
    pub async fn send(
        &self,
        mut envelope: MessageEnvelope,
    ) -> Result<Option<MessageEnvelope>, ClientError> {
        if let Some(guard) = &self.guard {
            guard.on_send(&mut envelope).map_err(ClientError::Auth)?;
        }
        let path = format!("message/{}", envelope.message_type.as_str().to_ascii_lowercase());
        let url = self.base_url.join(&path).map_err(|err| ClientError::Url(err.to_string()))?;

        let mut last_failure = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = BACKOFF_BASE_MS * (1_u64 << (attempt - 1));
                warn!(attempt, delay_ms = delay, "retrying envelope delivery");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            match self.http.post(url.clone()).json(&envelope).send().await {
                Ok(response) => return self.decode(response).await,
                Err(err) => {
                    last_failure = err.to_string();
                }
            }
        }
        Err(ClientError::Transport(last_failure))
    }

    /// Fetches the peer's `/health` endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on URL, transport, or decoding failures.
    pub async fn health(&self) -> Result<HealthStatus, ClientError> {
        let url =
            self.base_url.join("health").map_err(|err| ClientError::Url(err.to_string()))?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ClientError::Rejected {
                status: response.status().as_u16(),
                detail: "health check failed".to_string(),
            });
        }
        response.json().await.map_err(|err| ClientError::Malformed(err.to_string()))
    }

    /// Decodes a `POST /message` response body.
    async fn decode(
        &self,
        response: reqwest::Response,
    ) -> Result<Option<MessageEnvelope>, ClientError> {
        let status = response.status();
        let body: Value =
            response.json().await.map_err(|err| ClientError::Malformed(err.to_string()))?;

        if !status.is_success() {
            let detail = body
                .get("detail")
                .and_then(Value::as_str)
                .unwrap_or("unspecified rejection")
                .to_string();
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }

        if body.get("message_id").is_some() {
            let envelope: MessageEnvelope = serde_json::from_value(body)
                .map_err(|err| ClientError::Malformed(err.to_string()))?;
            if let Some(guard) = &self.guard {
                guard.on_receive(&envelope).map_err(ClientError::Auth)?;
            }
            debug!(message_id = %envelope.message_id, "received response envelope");
            return Ok(Some(envelope));
        }
        Ok(None)
    }
}
