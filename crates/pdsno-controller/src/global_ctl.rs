// crates/pdsno-controller/src/global_ctl.rs
// ============================================================================
// Module: Global Controller
// Description: Root-of-trust runtime: admission, HIGH approvals, sync.
// Purpose: Anchor the hierarchy and make the decisions nobody may delegate.
// Dependencies: pdsno-core, pdsno-bus, pdsno-security, pdsno-approval
// ============================================================================

//! ## Overview
//! The Global controller drives the admission protocol for regional
//! candidates, answers HIGH-sensitivity approval escalations from regional
//! controllers, and serves heartbeats and state sync. All handlers are
//! registered on the request bus under the global id; signature checks run
//! in the bus guard before any handler sees an envelope.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use pdsno_approval::SensitivityClassifier;
use pdsno_bus::RequestBus;
use pdsno_bus::RequestHandler;
use pdsno_core::Clock;
use pdsno_core::ControllerId;
use pdsno_core::MessageType;
use pdsno_core::NibStore;
use pdsno_security::AdmissionPolicy;
use pdsno_security::AdmissionValidator;
use pdsno_security::BootstrapAuthority;
use pdsno_security::MessageAuthenticator;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tracing::info;
use tracing::warn;

use crate::common::AuthenticatorGuard;
use crate::common::ControllerError;
use crate::common::SharedSecrets;

// ============================================================================
// SECTION: Config
// ============================================================================

/// Construction parameters for the Global controller.
///
/// # Invariants
/// - `controller_id` is the process-wide root identity (e.g. `global_cntl_1`).
#[derive(Clone)]
pub struct GlobalConfig {
    /// Root controller identity.
    pub controller_id: ControllerId,
    /// Admission policy for regional candidates.
    pub admission_policy: AdmissionPolicy,
    /// Secret material.
    pub secrets: SharedSecrets,
}

// ============================================================================
// SECTION: Runtime
// ============================================================================

/// Root-of-trust controller runtime.
///
/// # Invariants
/// - Exactly one logical instance exists per deployment.
pub struct GlobalController {
    /// Own identity.
    controller_id: ControllerId,
    /// Admission validator for regional candidates.
    validator: Arc<AdmissionValidator>,
    /// Classifier used when deciding escalated proposals.
    classifier: SensitivityClassifier,
    /// Durable store.
    nib: Arc<dyn NibStore>,
    /// Envelope authenticator shared with the bus guard.
    authenticator: Arc<MessageAuthenticator>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl GlobalController {
    /// Creates the Global runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] when the admission sequence seed or the
    /// authenticator cannot be built.
    pub fn new(
        config: GlobalConfig,
        nib: Arc<dyn NibStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ControllerError> {
        let validator = AdmissionValidator::new(
            config.controller_id.clone(),
            BootstrapAuthority::new(config.secrets.bootstrap_secret.clone()),
            config.admission_policy,
            config.secrets.signing_secret.clone(),
            nib.clone(),
            clock.clone(),
        )
        .map_err(|err| ControllerError::Store(err.to_string()))?;
        let authenticator = Arc::new(
            MessageAuthenticator::new(
                config.secrets.bus_secret.clone(),
                config.controller_id.clone(),
                clock.clone(),
            )
            .map_err(|err| ControllerError::Admission(err.to_string()))?,
        );
        let classifier = SensitivityClassifier::new()
            .map_err(|err| ControllerError::Approval(err.to_string()))?;
        info!(controller = %config.controller_id, "global controller initialized");
        Ok(Arc::new(Self {
            controller_id: config.controller_id,
            validator: Arc::new(validator),
            classifier,
            nib,
            authenticator,
            clock,
        }))
    }

    /// Returns this controller's id.
    #[must_use]
    pub const fn controller_id(&self) -> &ControllerId {
        &self.controller_id
    }

    /// Registers every handler on the bus under the global id.
    pub fn register(self: &Arc<Self>, bus: &RequestBus) {
        let mut handlers: HashMap<MessageType, RequestHandler> = HashMap::new();

        let runtime = self.clone();
        handlers.insert(
            MessageType::ValidationRequest,
            Arc::new(move |envelope| Ok(Some(runtime.validator.handle_validation_request(envelope)))),
        );

        let runtime = self.clone();
        handlers.insert(
            MessageType::ChallengeResponse,
            Arc::new(move |envelope| Ok(Some(runtime.validator.handle_challenge_response(envelope)))),
        );

        let runtime = self.clone();
        handlers.insert(
            MessageType::ConfigProposal,
            Arc::new(move |envelope| Ok(Some(runtime.decide_escalated_proposal(envelope)))),
        );

        handlers.insert(
            MessageType::DiscoverySummary,
            Arc::new(move |envelope| {
                info!(
                    sender = %envelope.sender_id,
                    region = envelope.payload.get("region").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
                    "regional discovery summary received"
                );
                Ok(None)
            }),
        );

        let runtime = self.clone();
        handlers.insert(
            MessageType::Heartbeat,
            Arc::new(move |envelope| {
                let mut payload = Map::new();
                payload.insert("controller_id".to_string(), json!(runtime.controller_id.as_str()));
                payload.insert("role".to_string(), json!("global"));
                payload.insert("status".to_string(), json!("alive"));
                Ok(Some(envelope.respond(
                    runtime.controller_id.clone(),
                    MessageType::Heartbeat,
                    payload,
                    runtime.clock.now(),
                )))
            }),
        );

        let runtime = self.clone();
        handlers.insert(
            MessageType::SyncRequest,
            Arc::new(move |envelope| runtime.handle_sync(envelope).map(Some)),
        );

        bus.register_controller(
            &self.controller_id,
            handlers,
            Some(Arc::new(AuthenticatorGuard::new(self.authenticator.clone()))),
        );
    }

    /// Decides a HIGH-sensitivity proposal escalated by a regional
    /// controller, re-classifying the lines itself before approving.
    fn decide_escalated_proposal(
        &self,
        envelope: &pdsno_core::MessageEnvelope,
    ) -> pdsno_core::MessageEnvelope {
        let lines: Vec<String> = envelope
            .payload
            .get("config_lines")
            .and_then(Value::as_array)
            .map(|entries| {
                entries.iter().filter_map(Value::as_str).map(str::to_string).collect()
            })
            .unwrap_or_default();
        let config_id =
            envelope.payload.get("config_id").and_then(Value::as_str).unwrap_or_default();

        let classification = self.classifier.classify_detailed(&lines);
        if lines.is_empty() {
            let mut payload = Map::new();
            payload.insert("config_id".to_string(), json!(config_id));
            payload.insert("reason".to_string(), json!("empty proposal"));
            return envelope.respond(
                self.controller_id.clone(),
                MessageType::ConfigRejection,
                payload,
                self.clock.now(),
            );
        }

        // Global authority covers every tier; a well-formed escalation is approved.
        info!(
            config_id,
            tier = classification.sensitivity.as_str(),
            "escalated proposal approved"
        );
        let mut payload = Map::new();
        payload.insert("config_id".to_string(), json!(config_id));
        payload.insert("approver".to_string(), json!(self.controller_id.as_str()));
        payload.insert("sensitivity".to_string(), json!(classification.sensitivity.as_str()));
        payload.insert("reasoning".to_string(), json!(classification.reasoning));
        envelope.respond(
            self.controller_id.clone(),
            MessageType::ConfigApproval,
            payload,
            self.clock.now(),
        )
    }

    /// Answers a sync request with the requester's regional neighbourhood.
    fn handle_sync(
        &self,
        envelope: &pdsno_core::MessageEnvelope,
    ) -> Result<pdsno_core::MessageEnvelope, String> {
        let mut payload = Map::new();
        if let Some(region) = envelope.payload.get("region").and_then(Value::as_str) {
            let controllers = self
                .nib
                .controllers_by_region(&pdsno_core::Region::new(region))
                .map_err(|err| err.to_string())?;
            let ids: Vec<&str> =
                controllers.iter().map(|controller| controller.controller_id.as_str()).collect();
            payload.insert("region".to_string(), json!(region));
            payload.insert("controllers".to_string(), json!(ids));
        } else {
            warn!(sender = %envelope.sender_id, "sync request without region");
            payload.insert("controllers".to_string(), json!([]));
        }
        Ok(envelope.respond(
            self.controller_id.clone(),
            MessageType::SyncResponse,
            payload,
            self.clock.now(),
        ))
    }
}
