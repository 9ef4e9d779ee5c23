// crates/pdsno-transport/src/lib.rs
// ============================================================================
// Module: PDSNO Transport
// Description: HTTP carrier for the standard message envelope.
// Purpose: Let controllers exchange the same signed envelopes over the
// network that they exchange in process.
// Dependencies: pdsno-core, pdsno-bus, axum, reqwest, tokio, url
// ============================================================================

//! ## Overview
//! The server side mounts `POST /message/{type}` over a [`pdsno_bus::RequestBus`],
//! so verification and response signing happen in the bus guard exactly as
//! they do in process. `GET /health` and `GET /info` expose liveness and
//! the registered handler list. The client signs envelopes through the same
//! guard seam, posts them with a per-request deadline, and retries
//! transport failures with exponential backoff before surfacing them.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod client;
pub mod server;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use client::ClientError;
pub use client::HealthStatus;
pub use client::HttpEnvelopeClient;
pub use server::HttpTransport;
pub use server::TransportError;
