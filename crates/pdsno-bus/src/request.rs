// crates/pdsno-bus/src/request.rs
// ============================================================================
// Module: Unicast Request Bus
// Description: Synchronous routing to per-recipient, per-type handlers.
// Purpose: At-most-once delivery between named controllers with auth hooks.
// Dependencies: pdsno-core, thiserror, tracing
// ============================================================================

//! ## Overview
//! Controllers register as `(id → {message type → handler})` with an
//! optional [`EnvelopeGuard`] that signs what they send and verifies what
//! they receive. A duplicate registration warns and takes over
//! (last-writer-wins); clean handovers (e.g. a temporary id promoted to a
//! permanent identity) unregister first. Handler failures propagate to the
//! sender as [`BusError::Handler`]; nothing is retried here.
//!
//! The registry read lock is released before a handler runs so handlers may
//! send on the same bus without deadlocking.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use pdsno_core::Clock;
use pdsno_core::ControllerId;
use pdsno_core::MessageEnvelope;
use pdsno_core::MessageId;
use pdsno_core::MessageType;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

// ============================================================================
// SECTION: Seams
// ============================================================================

/// Handler invoked for one message type of one recipient.
///
/// Returning `Ok(None)` acknowledges without a response envelope.
pub type RequestHandler =
    Arc<dyn Fn(&MessageEnvelope) -> Result<Option<MessageEnvelope>, String> + Send + Sync>;

/// Authentication hook applied where the transport meets the bus.
///
/// # Invariants
/// - `on_send` fully populates the signing fields; `on_receive` rejects
///   envelopes that fail verification or replay checks.
pub trait EnvelopeGuard: Send + Sync {
    /// Signs an outbound envelope in place.
    ///
    /// # Errors
    ///
    /// Returns a description of the signing failure.
    fn on_send(&self, envelope: &mut MessageEnvelope) -> Result<(), String>;

    /// Verifies an inbound envelope.
    ///
    /// # Errors
    ///
    /// Returns a description of the verification failure.
    fn on_receive(&self, envelope: &MessageEnvelope) -> Result<(), String>;
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors surfaced by unicast sends.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum BusError {
    /// Recipient id is not registered.
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),
    /// Recipient has no handler for the message type.
    #[error("{recipient} has no handler for {message_type}")]
    NoHandler {
        /// Registered recipient.
        recipient: String,
        /// Unhandled message type label.
        message_type: &'static str,
    },
    /// Signing or verification hook refused the envelope.
    #[error("authentication failure: {0}")]
    Auth(String),
    /// Handler failed; propagated to the sender.
    #[error("handler failure in {recipient}: {detail}")]
    Handler {
        /// Recipient whose handler failed.
        recipient: String,
        /// Failure description.
        detail: String,
    },
    /// Internal synchronization failure.
    #[error("bus registry poisoned")]
    Poisoned,
}

// ============================================================================
// SECTION: Registration
// ============================================================================

/// One controller's registration: handlers plus an optional guard.
#[derive(Clone)]
struct Registration {
    /// Handlers by message type.
    handlers: HashMap<MessageType, RequestHandler>,
    /// Authentication hook, when the controller signs its traffic.
    guard: Option<Arc<dyn EnvelopeGuard>>,
}

// ============================================================================
// SECTION: Request Bus
// ============================================================================

/// In-process unicast request bus.
///
/// # Invariants
/// - Delivery is at-most-once and synchronous in the sender's context.
/// - Messages between one controller pair arrive in send order.
pub struct RequestBus {
    /// Registrations by controller id.
    registry: RwLock<HashMap<String, Registration>>,
    /// Time source for envelope stamps.
    clock: Arc<dyn Clock>,
}

impl RequestBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Registers a controller's handlers and optional guard.
    ///
    /// A duplicate id warns and replaces the previous registration.
    pub fn register_controller(
        &self,
        controller_id: &ControllerId,
        handlers: HashMap<MessageType, RequestHandler>,
        guard: Option<Arc<dyn EnvelopeGuard>>,
    ) {
        let Ok(mut registry) = self.registry.write() else {
            return;
        };
        if registry.contains_key(controller_id.as_str()) {
            warn!(controller = %controller_id, "controller already registered, overwriting");
        }
        debug!(controller = %controller_id, handlers = handlers.len(), "registered controller");
        registry.insert(
            controller_id.as_str().to_string(),
            Registration {
                handlers,
                guard,
            },
        );
    }

    /// Removes a controller from the bus.
    pub fn unregister_controller(&self, controller_id: &ControllerId) {
        if let Ok(mut registry) = self.registry.write()
            && registry.remove(controller_id.as_str()).is_some()
        {
            debug!(controller = %controller_id, "unregistered controller");
        }
    }

    /// Returns true when the controller is registered.
    #[must_use]
    pub fn is_registered(&self, controller_id: &ControllerId) -> bool {
        self.registry
            .read()
            .map(|registry| registry.contains_key(controller_id.as_str()))
            .unwrap_or(false)
    }

    /// Lists registered handlers: controller id to handled message types.
    #[must_use]
    pub fn registered_handlers(&self) -> std::collections::BTreeMap<String, Vec<&'static str>> {
        self.registry
            .read()
            .map(|registry| {
                registry
                    .iter()
                    .map(|(id, registration)| {
                        let mut types: Vec<&'static str> = registration
                            .handlers
                            .keys()
                            .map(|message_type| message_type.as_str())
                            .collect();
                        types.sort_unstable();
                        (id.clone(), types)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Lists registered controller ids.
    #[must_use]
    pub fn registered_controllers(&self) -> Vec<ControllerId> {
        self.registry
            .read()
            .map(|registry| {
                let mut ids: Vec<ControllerId> =
                    registry.keys().map(|id| ControllerId::new(id.clone())).collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    /// Builds, signs, delivers, and returns the verified response.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] for unknown recipients, missing handlers, hook
    /// refusals, and propagated handler failures.
    pub fn send(
        &self,
        sender_id: &ControllerId,
        recipient_id: &ControllerId,
        message_type: MessageType,
        payload: Map<String, Value>,
        correlation_id: Option<MessageId>,
    ) -> Result<Option<MessageEnvelope>, BusError> {
        let mut envelope = MessageEnvelope::new(
            sender_id.clone(),
            recipient_id.clone(),
            message_type,
            payload,
            correlation_id,
            self.clock.now(),
        );
        debug!(
            sender = %sender_id,
            recipient = %recipient_id,
            message_type = message_type.as_str(),
            message_id = %envelope.message_id,
            "bus send"
        );

        let sender_guard = self.guard_of(sender_id)?;
        if let Some(guard) = &sender_guard {
            guard.on_send(&mut envelope).map_err(BusError::Auth)?;
        }

        let response = self.dispatch(&envelope)?;

        if let (Some(guard), Some(response)) = (&sender_guard, &response) {
            guard.on_receive(response).map_err(BusError::Auth)?;
        }
        Ok(response)
    }

    /// Dispatches an already-built envelope to the recipient's handler,
    /// verifying on receipt and signing the response. Transports deliver
    /// wire envelopes through this same path.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] for unknown recipients, missing handlers, hook
    /// refusals, and propagated handler failures.
    pub fn dispatch(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<Option<MessageEnvelope>, BusError> {
        let recipient = envelope.recipient_id.as_str().to_string();
        let (handler, guard) = {
            let registry = self.registry.read().map_err(|_| BusError::Poisoned)?;
            let registration = registry
                .get(&recipient)
                .ok_or_else(|| BusError::UnknownRecipient(recipient.clone()))?;
            let handler = registration.handlers.get(&envelope.message_type).cloned().ok_or(
                BusError::NoHandler {
                    recipient: recipient.clone(),
                    message_type: envelope.message_type.as_str(),
                },
            )?;
            (handler, registration.guard.clone())
        };

        if let Some(guard) = &guard {
            guard.on_receive(envelope).map_err(BusError::Auth)?;
        }

        let response = handler(envelope).map_err(|detail| {
            warn!(recipient = %recipient, detail, "handler failure");
            BusError::Handler {
                recipient: recipient.clone(),
                detail,
            }
        })?;

        match response {
            Some(mut response) => {
                if let Some(guard) = &guard {
                    guard.on_send(&mut response).map_err(BusError::Auth)?;
                }
                debug!(
                    recipient = %recipient,
                    response_id = %response.message_id,
                    "bus response"
                );
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }

    /// Returns the guard registered for a controller, requiring the
    /// controller to exist.
    fn guard_of(
        &self,
        controller_id: &ControllerId,
    ) -> Result<Option<Arc<dyn EnvelopeGuard>>, BusError> {
        let registry = self.registry.read().map_err(|_| BusError::Poisoned)?;
        Ok(registry.get(controller_id.as_str()).and_then(|registration| registration.guard.clone()))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use pdsno_core::ControllerId;
    use pdsno_core::ManualClock;
    use pdsno_core::MessageType;
    use pdsno_core::UtcTimestamp;
    use serde_json::Map;
    use serde_json::json;

    use super::BusError;
    use super::RequestBus;
    use super::RequestHandler;

    fn bus() -> RequestBus {
        RequestBus::new(Arc::new(ManualClock::starting_at(
            UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap(),
        )))
    }

    fn echo_handler() -> RequestHandler {
        Arc::new(|envelope| {
            let mut payload = Map::new();
            payload.insert("echo".to_string(), json!(envelope.payload.clone()));
            Ok(Some(envelope.respond(
                envelope.recipient_id.clone(),
                MessageType::SyncResponse,
                payload,
                envelope.timestamp,
            )))
        })
    }

    #[test]
    fn send_routes_to_the_registered_handler() {
        let bus = bus();
        let recipient = ControllerId::new("regional_cntl_zone-A_1");
        let mut handlers = HashMap::new();
        handlers.insert(MessageType::SyncRequest, echo_handler());
        bus.register_controller(&recipient, handlers, None);

        let mut payload = Map::new();
        payload.insert("want".to_string(), json!("state"));
        let response = bus
            .send(
                &ControllerId::new("local_cntl_zone-A_1"),
                &recipient,
                MessageType::SyncRequest,
                payload,
                None,
            )
            .unwrap()
            .unwrap();
        assert_eq!(response.message_type, MessageType::SyncResponse);
        assert!(response.correlation_id.is_some());
    }

    #[test]
    fn unknown_recipient_and_missing_handler_are_distinct() {
        let bus = bus();
        let sender = ControllerId::new("local_cntl_zone-A_1");
        let recipient = ControllerId::new("regional_cntl_zone-A_1");

        let unknown =
            bus.send(&sender, &recipient, MessageType::SyncRequest, Map::new(), None);
        assert!(matches!(unknown, Err(BusError::UnknownRecipient(_))));

        bus.register_controller(&recipient, HashMap::new(), None);
        let unhandled =
            bus.send(&sender, &recipient, MessageType::SyncRequest, Map::new(), None);
        assert!(matches!(unhandled, Err(BusError::NoHandler { .. })));
    }

    #[test]
    fn handler_failures_propagate_to_the_sender() {
        let bus = bus();
        let recipient = ControllerId::new("regional_cntl_zone-A_1");
        let mut handlers: HashMap<MessageType, RequestHandler> = HashMap::new();
        handlers.insert(
            MessageType::SyncRequest,
            Arc::new(|_| Err("backing store offline".to_string())),
        );
        bus.register_controller(&recipient, handlers, None);

        let result = bus.send(
            &ControllerId::new("local_cntl_zone-A_1"),
            &recipient,
            MessageType::SyncRequest,
            Map::new(),
            None,
        );
        assert!(matches!(result, Err(BusError::Handler { .. })));
    }

    #[test]
    fn reregistration_is_last_writer_wins() {
        let bus = bus();
        let recipient = ControllerId::new("regional_cntl_zone-A_1");
        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));

        let hits = first_hits.clone();
        let mut handlers: HashMap<MessageType, RequestHandler> = HashMap::new();
        handlers.insert(
            MessageType::Heartbeat,
            Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
        );
        bus.register_controller(&recipient, handlers, None);

        let hits = second_hits.clone();
        let mut handlers: HashMap<MessageType, RequestHandler> = HashMap::new();
        handlers.insert(
            MessageType::Heartbeat,
            Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
        );
        bus.register_controller(&recipient, handlers, None);

        bus.send(
            &ControllerId::new("local_cntl_zone-A_1"),
            &recipient,
            MessageType::Heartbeat,
            Map::new(),
            None,
        )
        .unwrap();
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_may_send_on_the_same_bus() {
        let bus = Arc::new(bus());
        let upstream = ControllerId::new("global_cntl_1");
        let relay = ControllerId::new("regional_cntl_zone-A_1");

        let mut handlers = HashMap::new();
        handlers.insert(MessageType::SyncRequest, echo_handler());
        bus.register_controller(&upstream, handlers, None);

        let bus_for_relay = bus.clone();
        let upstream_for_relay = upstream.clone();
        let relay_id = relay.clone();
        let mut handlers: HashMap<MessageType, RequestHandler> = HashMap::new();
        handlers.insert(
            MessageType::SyncRequest,
            Arc::new(move |envelope| {
                let forwarded = bus_for_relay
                    .send(
                        &relay_id,
                        &upstream_for_relay,
                        MessageType::SyncRequest,
                        envelope.payload.clone(),
                        None,
                    )
                    .map_err(|err| err.to_string())?;
                Ok(forwarded)
            }),
        );
        bus.register_controller(&relay, handlers, None);

        let response = bus
            .send(
                &ControllerId::new("local_cntl_zone-A_1"),
                &relay,
                MessageType::SyncRequest,
                Map::new(),
                None,
            )
            .unwrap();
        assert!(response.is_some());
    }
}
