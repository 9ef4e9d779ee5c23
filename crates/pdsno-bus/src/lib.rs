// crates/pdsno-bus/src/lib.rs
// ============================================================================
// Module: PDSNO Bus
// Description: Authenticated unicast dispatch and wildcard pub/sub.
// Purpose: Route envelopes between controllers in one process, behind the
// same seams the HTTP and broker transports use.
// Dependencies: pdsno-core, thiserror, tracing
// ============================================================================

//! ## Overview
//! Two buses live here. The [`RequestBus`] routes an envelope to the handler
//! registered under `(recipient_id, message_type)` and returns the response,
//! with at-most-once synchronous delivery in the sender's calling context.
//! The [`PubSubBus`] dispatches by topic with MQTT-style wildcards (`+` for
//! one segment, `#` for a trailing tail).
//!
//! Both buses apply authentication through the [`EnvelopeGuard`] seam:
//! replacing in-process delivery with HTTP or a broker changes only where
//! the guard's sign and verify hooks run, never the envelope format.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod pubsub;
pub mod request;
pub mod topics;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use pubsub::MessageDedup;
pub use pubsub::PatternError;
pub use pubsub::PubSubBus;
pub use pubsub::SubscribeHandler;
pub use pubsub::TopicPattern;
pub use request::BusError;
pub use request::EnvelopeGuard;
pub use request::RequestBus;
pub use request::RequestHandler;
