// crates/pdsno-controller/src/regional.rs
// ============================================================================
// Module: Regional Controller
// Description: Zone-tier runtime: delegated admission, approvals, tokens,
// discovery aggregation, policy fan-out.
// Purpose: Govern one region under authority delegated by the Global.
// Dependencies: pdsno-core, pdsno-bus, pdsno-security, pdsno-approval
// ============================================================================

//! ## Overview
//! A regional controller starts life under a temporary id, earns its
//! permanent identity from the Global through the admission protocol, and
//! re-registers on the bus under the assigned id (clean handover). Once
//! admitted it validates local controllers inside its region under the
//! delegation credential, decides MEDIUM approvals itself, escalates HIGH
//! ones to the Global, issues execution tokens for approved requests,
//! aggregates discovery reports into regional summaries, and publishes
//! policy updates to its region's topic.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use pdsno_approval::ApprovalEngine;
use pdsno_approval::AuditEventKind;
use pdsno_approval::AuditResult;
use pdsno_approval::AuditTrail;
use pdsno_approval::ExecutionTokenManager;
use pdsno_approval::SensitivityClassifier;
use pdsno_bus::MessageDedup;
use pdsno_bus::PubSubBus;
use pdsno_bus::RequestBus;
use pdsno_bus::RequestHandler;
use pdsno_bus::topics;
use pdsno_core::Clock;
use pdsno_core::ControllerId;
use pdsno_core::ControllerRole;
use pdsno_core::DeviceId;
use pdsno_core::MessageEnvelope;
use pdsno_core::MessageType;
use pdsno_core::NibStore;
use pdsno_core::Region;
use pdsno_core::SensitivityLevel;
use pdsno_security::AdmissionCandidate;
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

/// Construction parameters for a regional controller.
///
/// # Invariants
/// - `region` names the zone this controller will govern once admitted.
#[derive(Clone)]
pub struct RegionalConfig {
    /// Temporary id used before admission.
    pub temp_id: ControllerId,
    /// Governed region.
    pub region: Region,
    /// Global controller to request admission from.
    pub parent_global: ControllerId,
    /// Candidate metadata sent with the validation request.
    pub metadata: Map<String, Value>,
    /// Secret material.
    pub secrets: SharedSecrets,
}

// ============================================================================
// SECTION: Runtime
// ============================================================================

/// Zone-tier controller runtime.
///
/// # Invariants
/// - The local-admission validator exists only after this controller has
///   been admitted and holds a delegation credential.
pub struct RegionalController {
    /// Static configuration.
    config: RegionalConfig,
    /// Admission candidate state (keys, identity installation).
    candidate: AdmissionCandidate,
    /// Permanent identity once assigned.
    identity: Mutex<Option<ControllerId>>,
    /// Validator for local candidates; present after admission.
    local_validator: Mutex<Option<Arc<AdmissionValidator>>>,
    /// Approval engine for this region.
    engine: ApprovalEngine,
    /// Execution token issuer.
    tokens: ExecutionTokenManager,
    /// Sensitivity classifier.
    classifier: SensitivityClassifier,
    /// Audit trail for approval and token decisions.
    audit: AuditTrail,
    /// Aggregated discovery report payloads.
    reports: Mutex<Vec<Map<String, Value>>>,
    /// Policy acknowledgements received.
    policy_acks: Mutex<Vec<ControllerId>>,
    /// Dedup window for at-least-once pub/sub delivery.
    dedup: MessageDedup,
    /// Envelope authenticator shared with the bus guard.
    authenticator: Arc<MessageAuthenticator>,
    /// Durable store.
    nib: Arc<dyn NibStore>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl RegionalController {
    /// Creates a regional runtime in the unvalidated state.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] when a collaborator cannot be built from
    /// the supplied secrets.
    pub fn new(
        config: RegionalConfig,
        nib: Arc<dyn NibStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ControllerError> {
        let candidate = AdmissionCandidate::new(
            config.temp_id.clone(),
            ControllerRole::Regional,
            config.region.clone(),
            config.metadata.clone(),
        );
        let authenticator = Arc::new(
            MessageAuthenticator::new(
                config.secrets.bus_secret.clone(),
                config.temp_id.clone(),
                clock.clone(),
            )
            .map_err(|err| ControllerError::Admission(err.to_string()))?,
        );
        let engine = ApprovalEngine::new(config.temp_id.clone(), None, clock.clone());
        let tokens = ExecutionTokenManager::new(
            config.temp_id.clone(),
            config.secrets.signing_secret.clone(),
            clock.clone(),
        )
        .map_err(|err| ControllerError::Token(err.to_string()))?;
        let classifier = SensitivityClassifier::new()
            .map_err(|err| ControllerError::Approval(err.to_string()))?;
        let audit = AuditTrail::new(
            config.temp_id.clone(),
            config.secrets.event_secret.clone(),
            clock.clone(),
        );
        info!(temp_id = %config.temp_id, region = %config.region, "regional controller initialized");
        Ok(Arc::new(Self {
            config,
            candidate,
            identity: Mutex::new(None),
            local_validator: Mutex::new(None),
            engine,
            tokens,
            classifier,
            audit,
            reports: Mutex::new(Vec::new()),
            policy_acks: Mutex::new(Vec::new()),
            dedup: MessageDedup::new(1_024),
            authenticator,
            nib,
            clock,
        }))
    }

    /// Returns the permanent id when admitted, otherwise the temporary id.
    #[must_use]
    pub fn current_id(&self) -> ControllerId {
        self.identity
            .lock()
            .ok()
            .and_then(|identity| identity.clone())
            .unwrap_or_else(|| self.config.temp_id.clone())
    }

    /// Returns the audit trail.
    #[must_use]
    pub const fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Runs the candidate side of the admission protocol against the
    /// Global over the in-process bus.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Admission`] when any protocol step fails
    /// or the validator rejects the candidate.
    pub fn request_admission(
        self: &Arc<Self>,
        bus: &Arc<RequestBus>,
        bootstrap_token: &str,
    ) -> Result<ControllerId, ControllerError> {
        let temp_id = self.config.temp_id.clone();
        let parent = self.config.parent_global.clone();
        let bus_for_send = bus.clone();
        self.request_admission_with(bus, bootstrap_token, &move |message_type, payload| {
            bus_for_send
                .send(&temp_id, &parent, message_type, payload, None)
                .map_err(|err| ControllerError::Bus(err.to_string()))
        })
    }

    /// Runs the candidate side of the admission protocol through an
    /// arbitrary transport (`send` delivers one envelope and returns the
    /// peer's response), installs the identity, builds the delegated local
    /// validator, and re-registers on the bus under the permanent id.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Admission`] when any protocol step fails
    /// or the validator rejects the candidate.
    pub fn request_admission_with(
        self: &Arc<Self>,
        bus: &Arc<RequestBus>,
        bootstrap_token: &str,
        send: &dyn Fn(
            MessageType,
            Map<String, Value>,
        ) -> Result<Option<MessageEnvelope>, ControllerError>,
    ) -> Result<ControllerId, ControllerError> {
        let request = self
            .candidate
            .build_validation_request(bootstrap_token)
            .map_err(|err| ControllerError::Admission(err.to_string()))?;

        let challenge = send(MessageType::ValidationRequest, request)?
            .ok_or_else(|| ControllerError::UnexpectedResponse("no challenge".to_string()))?;
        if challenge.message_type != MessageType::Challenge {
            let reason = challenge
                .payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Err(ControllerError::Admission(reason));
        }

        let answer = self
            .candidate
            .answer_challenge(&challenge.payload)
            .map_err(|err| ControllerError::Admission(err.to_string()))?;
        let result = send(MessageType::ChallengeResponse, answer)?
            .ok_or_else(|| ControllerError::UnexpectedResponse("no result".to_string()))?;

        let identity = self
            .candidate
            .install_result(&result.payload)
            .map_err(|err| ControllerError::Admission(err.to_string()))?;
        let assigned = identity.assigned_id.clone();

        if let Ok(mut slot) = self.identity.lock() {
            *slot = Some(assigned.clone());
        }
        let validator = AdmissionValidator::new(
            assigned.clone(),
            BootstrapAuthority::new(self.config.secrets.bootstrap_secret.clone()),
            AdmissionPolicy {
                permitted_roles: vec![ControllerRole::Local],
                allowed_regions: vec![self.config.region.clone()],
                ..AdmissionPolicy::default()
            },
            self.config.secrets.signing_secret.clone(),
            self.nib.clone(),
            self.clock.clone(),
        )
        .map_err(|err| ControllerError::Store(err.to_string()))?;
        if let Ok(mut slot) = self.local_validator.lock() {
            *slot = Some(Arc::new(validator));
        }

        // Clean handover: drop the temporary registration, take the new id.
        bus.unregister_controller(&self.config.temp_id);
        self.register(bus);
        info!(assigned = %assigned, "regional controller admitted");
        Ok(assigned)
    }

    /// Registers every handler on the bus under the current id.
    pub fn register(self: &Arc<Self>, bus: &Arc<RequestBus>) {
        let mut handlers: HashMap<MessageType, RequestHandler> = HashMap::new();

        let runtime = self.clone();
        let bus_for_proposals = bus.clone();
        handlers.insert(
            MessageType::ConfigProposal,
            Arc::new(move |envelope| {
                runtime.handle_config_proposal(envelope, &bus_for_proposals).map(Some)
            }),
        );

        let runtime = self.clone();
        handlers.insert(
            MessageType::DiscoveryReport,
            Arc::new(move |envelope| {
                runtime.record_report(&envelope.payload, &envelope.message_id);
                Ok(None)
            }),
        );

        let runtime = self.clone();
        handlers.insert(
            MessageType::PolicyAck,
            Arc::new(move |envelope| {
                if let Ok(mut acks) = runtime.policy_acks.lock() {
                    acks.push(envelope.sender_id.clone());
                }
                Ok(None)
            }),
        );

        let runtime = self.clone();
        handlers.insert(
            MessageType::ValidationRequest,
            Arc::new(move |envelope| {
                let Some(validator) = runtime.delegated_validator() else {
                    return Err("not yet authorized to validate locals".to_string());
                };
                Ok(Some(validator.handle_validation_request(envelope)))
            }),
        );

        let runtime = self.clone();
        handlers.insert(
            MessageType::ChallengeResponse,
            Arc::new(move |envelope| {
                let Some(validator) = runtime.delegated_validator() else {
                    return Err("not yet authorized to validate locals".to_string());
                };
                Ok(Some(validator.handle_challenge_response(envelope)))
            }),
        );

        let runtime = self.clone();
        handlers.insert(
            MessageType::Heartbeat,
            Arc::new(move |envelope| {
                let mut payload = Map::new();
                payload.insert("controller_id".to_string(), json!(runtime.current_id().as_str()));
                payload.insert("role".to_string(), json!("regional"));
                payload.insert("region".to_string(), json!(runtime.config.region.as_str()));
                payload.insert("status".to_string(), json!("alive"));
                Ok(Some(envelope.respond(
                    runtime.current_id(),
                    MessageType::Heartbeat,
                    payload,
                    runtime.clock.now(),
                )))
            }),
        );

        bus.register_controller(
            &self.current_id(),
            handlers,
            Some(Arc::new(AuthenticatorGuard::new(self.authenticator.clone()))),
        );
    }

    /// Subscribes to this region's discovery topic on the pub/sub bus.
    pub fn subscribe_discovery(self: &Arc<Self>, pubsub: &PubSubBus) {
        let runtime = self.clone();
        let pattern = topics::discovery_pattern(&self.config.region);
        let outcome = pubsub.subscribe(
            &pattern,
            Arc::new(move |_topic, envelope| {
                runtime.record_report(&envelope.payload, &envelope.message_id);
                Ok(())
            }),
        );
        if let Err(err) = outcome {
            warn!(pattern, error = %err, "discovery subscription failed");
        }
    }

    /// Publishes a policy update to the region's topic and stores it.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Store`] when the policy upsert fails.
    pub fn publish_policy(
        &self,
        pubsub: &PubSubBus,
        policy: &pdsno_core::Policy,
    ) -> Result<bool, ControllerError> {
        self.nib.upsert_policy(policy).map_err(|err| ControllerError::Store(err.to_string()))?;
        let mut payload = Map::new();
        payload.insert("policy_id".to_string(), json!(policy.policy_id));
        payload.insert("name".to_string(), json!(policy.name));
        payload.insert("rule_set".to_string(), policy.rule_set.clone());
        payload.insert("scope".to_string(), json!(policy.scope));
        let envelope = MessageEnvelope::new(
            self.current_id(),
            ControllerId::new(pdsno_core::core::envelope::BROADCAST_RECIPIENT),
            MessageType::PolicyUpdate,
            payload,
            None,
            self.clock.now(),
        );
        let delivered = pubsub.publish(&topics::policy_topic(&self.config.region), &envelope);
        info!(policy = %policy.policy_id, delivered, "policy update published");
        Ok(delivered)
    }

    /// Returns the controllers that acknowledged the last policy update.
    #[must_use]
    pub fn policy_acks(&self) -> Vec<ControllerId> {
        self.policy_acks.lock().map(|acks| acks.clone()).unwrap_or_default()
    }

    /// Builds a `DISCOVERY_SUMMARY` payload over the aggregated reports and
    /// sends it to the Global controller.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Bus`] when the send fails.
    pub fn send_summary(&self, bus: &RequestBus) -> Result<(), ControllerError> {
        let reports = self.reports.lock().map(|reports| reports.clone()).unwrap_or_default();
        let mut new_total = 0_usize;
        let mut inactive_total = 0_usize;
        for report in &reports {
            new_total +=
                report.get("new_devices").and_then(Value::as_array).map_or(0, Vec::len);
            inactive_total +=
                report.get("inactive_devices").and_then(Value::as_array).map_or(0, Vec::len);
        }
        let mut payload = Map::new();
        payload.insert("region".to_string(), json!(self.config.region.as_str()));
        payload.insert("report_count".to_string(), json!(reports.len()));
        payload.insert("new_devices".to_string(), json!(new_total));
        payload.insert("inactive_devices".to_string(), json!(inactive_total));
        bus.send(
            &self.current_id(),
            &self.config.parent_global,
            MessageType::DiscoverySummary,
            payload,
            None,
        )
        .map_err(|err| ControllerError::Bus(err.to_string()))?;
        Ok(())
    }

    /// Returns the aggregated discovery reports.
    #[must_use]
    pub fn discovery_reports(&self) -> Vec<Map<String, Value>> {
        self.reports.lock().map(|reports| reports.clone()).unwrap_or_default()
    }

    /// Records a discovery report once per message id.
    fn record_report(&self, payload: &Map<String, Value>, message_id: &pdsno_core::MessageId) {
        if !self.dedup.first_sighting(message_id) {
            return;
        }
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(payload.clone());
        }
        info!(
            lc = payload.get("lc_id").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "discovery report recorded"
        );
    }

    /// Returns the delegated validator once admitted.
    fn delegated_validator(&self) -> Option<Arc<AdmissionValidator>> {
        self.local_validator.lock().ok().and_then(|slot| slot.clone())
    }

    /// Handles a configuration proposal from a local controller: classify,
    /// run the approval workflow (escalating HIGH to the Global), issue an
    /// execution token, and answer with approval or rejection.
    fn handle_config_proposal(
        &self,
        envelope: &MessageEnvelope,
        bus: &Arc<RequestBus>,
    ) -> Result<MessageEnvelope, String> {
        let config_id =
            envelope.payload.get("config_id").and_then(Value::as_str).unwrap_or_default();
        let device_id = envelope
            .payload
            .get("device_id")
            .and_then(Value::as_str)
            .ok_or("proposal missing device_id")?;
        let lines: Vec<String> = envelope
            .payload
            .get("config_lines")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        let classification = self.classifier.classify_detailed(&lines);
        let tier = classification.sensitivity;
        let request = self
            .engine
            .create_request(DeviceId::new(device_id), lines.clone(), tier)
            .map_err(|err| err.to_string())?;
        self.engine.submit(&request.request_id).map_err(|err| err.to_string())?;

        match tier {
            SensitivityLevel::Low => {}
            SensitivityLevel::Medium => {
                self.engine
                    .approve(&request.request_id, &self.current_id())
                    .map_err(|err| err.to_string())?;
            }
            SensitivityLevel::High => {
                let mut escalation = Map::new();
                escalation.insert("config_id".to_string(), json!(config_id));
                escalation.insert("device_id".to_string(), json!(device_id));
                escalation.insert("config_lines".to_string(), json!(lines));
                let verdict = bus
                    .send(
                        &self.current_id(),
                        &self.config.parent_global,
                        MessageType::ConfigProposal,
                        escalation,
                        None,
                    )
                    .map_err(|err| err.to_string())?
                    .ok_or("global returned no verdict")?;
                match verdict.message_type {
                    MessageType::ConfigApproval => {
                        let approver = verdict
                            .payload
                            .get("approver")
                            .and_then(Value::as_str)
                            .map_or_else(|| self.config.parent_global.clone(), ControllerId::new);
                        self.engine
                            .approve(&request.request_id, &approver)
                            .map_err(|err| err.to_string())?;
                    }
                    _ => {
                        let reason = verdict
                            .payload
                            .get("reason")
                            .and_then(Value::as_str)
                            .unwrap_or("rejected by global")
                            .to_string();
                        self.engine
                            .reject(&request.request_id, &self.config.parent_global, &reason)
                            .map_err(|err| err.to_string())?;
                        let _ = self.audit.log(
                            AuditEventKind::ConfigRejected,
                            &self.config.parent_global,
                            "configuration",
                            config_id,
                            "reject",
                            AuditResult::Failure,
                            Map::new(),
                        );
                        let mut payload = Map::new();
                        payload.insert("config_id".to_string(), json!(config_id));
                        payload.insert("request_id".to_string(), json!(request.request_id.as_str()));
                        payload.insert("reason".to_string(), json!(reason));
                        return Ok(envelope.respond(
                            self.current_id(),
                            MessageType::ConfigRejection,
                            payload,
                            self.clock.now(),
                        ));
                    }
                }
            }
        }

        let approved = self
            .engine
            .get(&request.request_id)
            .map_err(|err| err.to_string())?
            .ok_or("request vanished")?;
        let _ = self.audit.log(
            AuditEventKind::ConfigApproved,
            approved.approvers.last().unwrap_or(&self.current_id()),
            "configuration",
            config_id,
            "approve",
            AuditResult::Success,
            Map::new(),
        );

        let token = self
            .tokens
            .issue(&request.request_id, &DeviceId::new(device_id), None)
            .map_err(|err| err.to_string())?;
        let mut token_details = Map::new();
        token_details.insert("token_id".to_string(), json!(token.token_id.as_str()));
        let _ = self.audit.log(
            AuditEventKind::TokenIssued,
            &self.current_id(),
            "execution_token",
            token.token_id.as_str(),
            "issue",
            AuditResult::Success,
            token_details,
        );

        let token_value = serde_json::to_value(&token).map_err(|err| err.to_string())?;
        let mut payload = Map::new();
        payload.insert("config_id".to_string(), json!(config_id));
        payload.insert("request_id".to_string(), json!(request.request_id.as_str()));
        payload.insert("sensitivity".to_string(), json!(tier.as_str()));
        payload.insert(
            "approvers".to_string(),
            json!(approved.approvers.iter().map(ControllerId::as_str).collect::<Vec<_>>()),
        );
        payload.insert("token".to_string(), token_value);
        Ok(envelope.respond(
            self.current_id(),
            MessageType::ConfigApproval,
            payload,
            self.clock.now(),
        ))
    }
}
