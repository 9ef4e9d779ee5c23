// crates/pdsno-controller/src/local.rs
// ============================================================================
// Module: Local Controller
// Description: Subnet-tier runtime: discovery loop, proposals, execution.
// Purpose: Discover devices, propose changes, and execute approved
// configurations under verified single-use tokens.
// Dependencies: pdsno-core, pdsno-bus, pdsno-security, pdsno-approval,
// pdsno-discovery, tokio
// ============================================================================

//! ## Overview
//! A local controller earns its identity from its regional parent, then
//! drives the discovery pipeline on an interval, publishing delta reports
//! to `pdsno/discovery/<region>/<lc_id>` with a unicast fallback to the
//! regional controller. Configuration changes flow propose → approval
//! (decided upstream) → token verification → backup → adapter apply, with
//! the config state machine enforcing the walk and auto-rollback restoring
//! the pre-execution backup on failure. Every step lands in the audit
//! trail.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use pdsno_approval::AuditEventKind;
use pdsno_approval::AuditResult;
use pdsno_approval::AuditTrail;
use pdsno_approval::ConfigStateMachine;
use pdsno_approval::ExecutionToken;
use pdsno_approval::ExecutionTokenManager;
use pdsno_approval::RollbackManager;
use pdsno_approval::SensitivityClassifier;
use pdsno_bus::MessageDedup;
use pdsno_bus::PubSubBus;
use pdsno_bus::RequestBus;
use pdsno_bus::RequestHandler;
use pdsno_bus::topics;
use pdsno_core::Clock;
use pdsno_core::ConfigId;
use pdsno_core::ConfigRecord;
use pdsno_core::ConfigState;
use pdsno_core::ControllerId;
use pdsno_core::ControllerRole;
use pdsno_core::DeviceAdapter;
use pdsno_core::DeviceId;
use pdsno_core::LockType;
use pdsno_core::MessageEnvelope;
use pdsno_core::MessageType;
use pdsno_core::NibStore;
use pdsno_core::Region;
use pdsno_core::RequestId;
use pdsno_discovery::ArpProbe;
use pdsno_discovery::Cidr;
use pdsno_discovery::CycleSummary;
use pdsno_discovery::DiscoveryPipeline;
use pdsno_discovery::IcmpProbe;
use pdsno_discovery::SnmpProbe;
use pdsno_security::AdmissionCandidate;
use pdsno_security::MessageAuthenticator;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::common::AuthenticatorGuard;
use crate::common::ControllerError;
use crate::common::SharedSecrets;

// ============================================================================
// SECTION: Config
// ============================================================================

/// Construction parameters for a local controller.
///
/// # Invariants
/// - `subnet` is the CIDR the discovery pipeline scans.
#[derive(Clone)]
pub struct LocalConfig {
    /// Temporary id used before admission.
    pub temp_id: ControllerId,
    /// Region of the governing regional controller.
    pub region: Region,
    /// Regional controller to request admission from and report to.
    pub parent_regional: ControllerId,
    /// Scanned subnet.
    pub subnet: Cidr,
    /// Candidate metadata sent with the validation request.
    pub metadata: Map<String, Value>,
    /// Secret material.
    pub secrets: SharedSecrets,
    /// Maximum outstanding probes per scan.
    pub max_in_flight: usize,
    /// Consecutive absences tolerated before a device goes inactive.
    pub miss_budget: u32,
    /// NIB lock TTL held across config execution, in seconds.
    pub execution_lock_ttl_seconds: i64,
}

// ============================================================================
// SECTION: Reports
// ============================================================================

/// Outcome of one configuration execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Executed configuration.
    pub config_id: ConfigId,
    /// Whether the device accepted the change.
    pub success: bool,
    /// Whether a failure was reverted from backup.
    pub rolled_back: bool,
    /// Failure or rollback detail.
    pub detail: Option<String>,
}

/// Approval material held between proposal response and execution.
struct PendingExecution {
    /// Approval request id issued by the regional engine.
    request_id: RequestId,
    /// Single-use execution token.
    token: ExecutionToken,
}

// ============================================================================
// SECTION: Runtime
// ============================================================================

/// Subnet-tier controller runtime.
///
/// # Invariants
/// - The discovery pipeline exists only after `init_discovery` has run
///   (normally right after admission, once the permanent id is known).
pub struct LocalController {
    /// Static configuration.
    config: LocalConfig,
    /// Admission candidate state.
    candidate: AdmissionCandidate,
    /// Permanent identity once assigned.
    identity: Mutex<Option<ControllerId>>,
    /// Discovery pipeline; present after `init_discovery`.
    pipeline: Mutex<Option<Arc<DiscoveryPipeline>>>,
    /// Per-config state machines.
    machines: Mutex<HashMap<ConfigId, ConfigStateMachine>>,
    /// Approval material awaiting execution.
    pending: Mutex<HashMap<ConfigId, PendingExecution>>,
    /// Token verifier sharing the issuing secret.
    tokens: ExecutionTokenManager,
    /// Sensitivity classifier for outbound proposals.
    classifier: SensitivityClassifier,
    /// Backup and rollback driver.
    rollback: RollbackManager,
    /// Audit trail.
    audit: AuditTrail,
    /// Latest policy received from the regional controller.
    policy: Mutex<Option<Map<String, Value>>>,
    /// Dedup window for at-least-once pub/sub delivery.
    dedup: MessageDedup,
    /// Envelope authenticator shared with the bus guard.
    authenticator: Arc<MessageAuthenticator>,
    /// Durable store.
    nib: Arc<dyn NibStore>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl LocalController {
    /// Creates a local runtime in the unvalidated state.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] when a collaborator cannot be built from
    /// the supplied secrets.
    pub fn new(
        config: LocalConfig,
        nib: Arc<dyn NibStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ControllerError> {
        let candidate = AdmissionCandidate::new(
            config.temp_id.clone(),
            ControllerRole::Local,
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
        let tokens = ExecutionTokenManager::new(
            config.temp_id.clone(),
            config.secrets.signing_secret.clone(),
            clock.clone(),
        )
        .map_err(|err| ControllerError::Token(err.to_string()))?;
        let classifier = SensitivityClassifier::new()
            .map_err(|err| ControllerError::Approval(err.to_string()))?;
        let rollback = RollbackManager::new(config.temp_id.clone(), clock.clone());
        let audit = AuditTrail::new(
            config.temp_id.clone(),
            config.secrets.event_secret.clone(),
            clock.clone(),
        );
        info!(temp_id = %config.temp_id, subnet = %config.subnet, "local controller initialized");
        Ok(Arc::new(Self {
            config,
            candidate,
            identity: Mutex::new(None),
            pipeline: Mutex::new(None),
            machines: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            tokens,
            classifier,
            rollback,
            audit,
            policy: Mutex::new(None),
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

    /// Returns the latest policy payload, when one has arrived.
    #[must_use]
    pub fn current_policy(&self) -> Option<Map<String, Value>> {
        self.policy.lock().ok().and_then(|policy| policy.clone())
    }

    /// Runs the candidate side of the admission protocol against the
    /// regional parent over the in-process bus.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Admission`] when any protocol step fails.
    pub fn request_admission(
        self: &Arc<Self>,
        bus: &Arc<RequestBus>,
        bootstrap_token: &str,
    ) -> Result<ControllerId, ControllerError> {
        let temp_id = self.config.temp_id.clone();
        let parent = self.config.parent_regional.clone();
        let bus_for_send = bus.clone();
        self.request_admission_with(bus, bootstrap_token, &move |message_type, payload| {
            bus_for_send
                .send(&temp_id, &parent, message_type, payload, None)
                .map_err(|err| ControllerError::Bus(err.to_string()))
        })
    }

    /// Runs the admission protocol through an arbitrary transport and
    /// re-registers under the permanent id.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Admission`] when any protocol step fails.
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

        if let Ok(mut slot) = self.identity.lock() {
            *slot = Some(identity.assigned_id.clone());
        }
        bus.unregister_controller(&self.config.temp_id);
        self.register(bus);
        info!(assigned = %identity.assigned_id, "local controller admitted");
        Ok(identity.assigned_id)
    }

    /// Registers every handler on the bus under the current id.
    pub fn register(self: &Arc<Self>, bus: &Arc<RequestBus>) {
        let mut handlers: HashMap<MessageType, RequestHandler> = HashMap::new();

        let runtime = self.clone();
        handlers.insert(
            MessageType::PolicyUpdate,
            Arc::new(move |envelope| {
                runtime.accept_policy(&envelope.payload, &envelope.message_id);
                Ok(None)
            }),
        );

        let runtime = self.clone();
        handlers.insert(
            MessageType::DiscoveryRequest,
            Arc::new(move |envelope| {
                let mut payload = Map::new();
                payload.insert("status".to_string(), json!("scheduled"));
                Ok(Some(envelope.respond(
                    runtime.current_id(),
                    MessageType::DiscoverySummary,
                    payload,
                    runtime.clock.now(),
                )))
            }),
        );

        let runtime = self.clone();
        handlers.insert(
            MessageType::Heartbeat,
            Arc::new(move |envelope| {
                let mut payload = Map::new();
                payload.insert("controller_id".to_string(), json!(runtime.current_id().as_str()));
                payload.insert("role".to_string(), json!("local"));
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

    /// Builds the discovery pipeline under the current id.
    pub fn init_discovery(
        &self,
        arp: Arc<dyn ArpProbe>,
        icmp: Arc<dyn IcmpProbe>,
        snmp: Arc<dyn SnmpProbe>,
    ) {
        let pipeline = Arc::new(DiscoveryPipeline::new(
            self.current_id(),
            self.config.region.clone(),
            self.config.subnet,
            arp,
            icmp,
            snmp,
            self.nib.clone(),
            self.clock.clone(),
            self.config.max_in_flight,
            self.config.miss_budget,
        ));
        if let Ok(mut slot) = self.pipeline.lock() {
            *slot = Some(pipeline);
        }
    }

    /// Runs one discovery cycle and publishes the delta report: pub/sub
    /// first, unicast to the regional controller as fallback.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::NotConfigured`] before `init_discovery`,
    /// and [`ControllerError`] when an in-flight cycle forces a drop.
    pub async fn run_discovery_cycle(
        &self,
        pubsub: Option<&PubSubBus>,
        bus: Option<&RequestBus>,
    ) -> Result<CycleSummary, ControllerError> {
        let pipeline = self
            .pipeline
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(ControllerError::NotConfigured("discovery pipeline"))?;
        let summary = pipeline
            .run_cycle()
            .await
            .map_err(|err| ControllerError::State(err.to_string()))?;

        if let Some(report) = &summary.report {
            self.publish_report(report.clone(), pubsub, bus);
        }
        Ok(summary)
    }

    /// Publishes a delta report over pub/sub, falling back to unicast.
    fn publish_report(
        &self,
        report: Map<String, Value>,
        pubsub: Option<&PubSubBus>,
        bus: Option<&RequestBus>,
    ) {
        let envelope = MessageEnvelope::new(
            self.current_id(),
            self.config.parent_regional.clone(),
            MessageType::DiscoveryReport,
            report.clone(),
            None,
            self.clock.now(),
        );

        if let Some(pubsub) = pubsub {
            let topic = topics::discovery_topic(&self.config.region, &self.current_id());
            if pubsub.publish(&topic, &envelope) {
                info!(topic, "discovery report published");
                return;
            }
            warn!(topic, "no subscriber on discovery topic, falling back to unicast");
        }
        if let Some(bus) = bus {
            let outcome = bus.send(
                &self.current_id(),
                &self.config.parent_regional,
                MessageType::DiscoveryReport,
                report,
                None,
            );
            if let Err(err) = outcome {
                warn!(error = %err, "discovery report delivery failed");
            }
        }
    }

    /// Proposes a configuration change: classify, persist the record, walk
    /// it to `PENDING_APPROVAL`, and send the proposal to the regional
    /// controller. On approval the execution token is stored for
    /// [`LocalController::execute_config`].
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] when persistence, the state machine, or
    /// the proposal exchange fails; a rejection surfaces as
    /// [`ControllerError::Approval`] with the upstream reason.
    pub fn propose_config(
        &self,
        bus: &RequestBus,
        device_id: &DeviceId,
        config_lines: Vec<String>,
    ) -> Result<ConfigId, ControllerError> {
        let config_id = ConfigId::new(format!("config-{}", Uuid::new_v4()));
        let classification = self.classifier.classify_detailed(&config_lines);
        let now = self.clock.now();

        let record = ConfigRecord {
            config_id: config_id.clone(),
            device_id: device_id.clone(),
            config_lines: config_lines.clone(),
            requester: self.current_id(),
            sensitivity: classification.sensitivity,
            state: ConfigState::Draft,
            approval_request_id: None,
            execution_token_id: None,
            backup_id: None,
            execution_result: None,
            version: 0,
        };
        self.nib.upsert_config(&record).map_err(|err| ControllerError::Store(err.to_string()))?;
        let mut machine = ConfigStateMachine::new(config_id.clone(), now);
        let mut details = Map::new();
        details.insert("device_id".to_string(), json!(device_id.as_str()));
        details.insert("sensitivity".to_string(), json!(classification.sensitivity.as_str()));
        let _ = self.audit.log(
            AuditEventKind::ConfigCreated,
            &self.current_id(),
            "configuration",
            config_id.as_str(),
            "create",
            AuditResult::Success,
            details,
        );

        machine
            .transition(ConfigState::PendingApproval, &self.current_id(), None, self.clock.now())
            .map_err(|err| ControllerError::State(err.to_string()))?;
        let _ = self.audit.log(
            AuditEventKind::ConfigSubmitted,
            &self.current_id(),
            "configuration",
            config_id.as_str(),
            "submit_for_approval",
            AuditResult::Pending,
            Map::new(),
        );

        let mut payload = Map::new();
        payload.insert("config_id".to_string(), json!(config_id.as_str()));
        payload.insert("device_id".to_string(), json!(device_id.as_str()));
        payload.insert("config_lines".to_string(), json!(config_lines));
        let response = bus
            .send(
                &self.current_id(),
                &self.config.parent_regional,
                MessageType::ConfigProposal,
                payload,
                None,
            )
            .map_err(|err| ControllerError::Bus(err.to_string()))?
            .ok_or_else(|| ControllerError::UnexpectedResponse("no approval verdict".to_string()))?;

        match response.message_type {
            MessageType::ConfigApproval => {
                let token: ExecutionToken = response
                    .payload
                    .get("token")
                    .cloned()
                    .and_then(|value| serde_json::from_value(value).ok())
                    .ok_or_else(|| {
                        ControllerError::UnexpectedResponse("approval without token".to_string())
                    })?;
                let request_id = response
                    .payload
                    .get("request_id")
                    .and_then(Value::as_str)
                    .map(RequestId::new)
                    .ok_or_else(|| {
                        ControllerError::UnexpectedResponse("approval without request id".to_string())
                    })?;

                machine
                    .transition(ConfigState::Approved, &response.sender_id, None, self.clock.now())
                    .map_err(|err| ControllerError::State(err.to_string()))?;
                let _ = self.audit.log(
                    AuditEventKind::ConfigApproved,
                    &response.sender_id,
                    "configuration",
                    config_id.as_str(),
                    "approve",
                    AuditResult::Success,
                    Map::new(),
                );

                self.update_record(&config_id, |record| {
                    record.state = ConfigState::Approved;
                    record.approval_request_id = Some(request_id.clone());
                    record.execution_token_id = Some(token.token_id.clone());
                })?;
                if let Ok(mut pending) = self.pending.lock() {
                    pending.insert(
                        config_id.clone(),
                        PendingExecution {
                            request_id,
                            token,
                        },
                    );
                }
                if let Ok(mut machines) = self.machines.lock() {
                    machines.insert(config_id.clone(), machine);
                }
                Ok(config_id)
            }
            _ => {
                let reason = response
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("rejected")
                    .to_string();
                machine
                    .transition(
                        ConfigState::Draft,
                        &response.sender_id,
                        Some(reason.clone()),
                        self.clock.now(),
                    )
                    .map_err(|err| ControllerError::State(err.to_string()))?;
                let _ = self.audit.log(
                    AuditEventKind::ConfigRejected,
                    &response.sender_id,
                    "configuration",
                    config_id.as_str(),
                    "reject",
                    AuditResult::Failure,
                    Map::new(),
                );
                self.update_record(&config_id, |record| {
                    record.state = ConfigState::Draft;
                })?;
                if let Ok(mut machines) = self.machines.lock() {
                    machines.insert(config_id.clone(), machine);
                }
                Err(ControllerError::Approval(reason))
            }
        }
    }

    /// Executes an approved configuration under its single-use token:
    /// coordination lock, token verification, pre-execution backup, adapter
    /// apply, and auto-rollback on failure.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] when the configuration is not approved,
    /// the lock is held elsewhere, or the token fails verification. Device
    /// rejection is reported through the returned [`ExecutionReport`], not
    /// an error.
    pub fn execute_config(
        &self,
        config_id: &ConfigId,
        adapter: &mut dyn DeviceAdapter,
    ) -> Result<ExecutionReport, ControllerError> {
        let pending = {
            let Ok(mut pending) = self.pending.lock() else {
                return Err(ControllerError::Poisoned);
            };
            pending
                .remove(config_id)
                .ok_or_else(|| ControllerError::Approval("no approval on file".to_string()))?
        };
        let record = self
            .nib
            .get_config(config_id)
            .map_err(|err| ControllerError::Store(err.to_string()))?
            .ok_or_else(|| ControllerError::Store(format!("config {config_id} not found")))?;
        let device_id = record.device_id.clone();

        // Exclude concurrent controllers across the approve-and-execute span.
        let lock = self
            .nib
            .acquire_lock(
                config_id.as_str(),
                LockType::ConfigApproval,
                &self.current_id(),
                self.config.execution_lock_ttl_seconds,
                self.clock.now(),
            )
            .map_err(|err| ControllerError::Store(err.to_string()))?;

        let verification = self.tokens.verify(&pending.token, Some(&device_id));
        if let Err(err) = verification {
            let mut details = Map::new();
            details.insert("reason".to_string(), json!(err.to_string()));
            let _ = self.audit.log(
                AuditEventKind::TokenRejected,
                &self.current_id(),
                "execution_token",
                pending.token.token_id.as_str(),
                "verify",
                AuditResult::Failure,
                details,
            );
            let _ = self.nib.release_lock(&lock.lock_id, &self.current_id());
            return Err(ControllerError::Token(err.to_string()));
        }
        let _ = self.audit.log(
            AuditEventKind::TokenVerified,
            &self.current_id(),
            "execution_token",
            pending.token.token_id.as_str(),
            "verify",
            AuditResult::Success,
            Map::new(),
        );

        let outcome = self.execute_under_lock(config_id, &device_id, &record, &pending, adapter);
        let _ = self.nib.release_lock(&lock.lock_id, &self.current_id());
        outcome
    }

    /// Body of the execution workflow, run while holding the NIB lock.
    fn execute_under_lock(
        &self,
        config_id: &ConfigId,
        device_id: &DeviceId,
        record: &ConfigRecord,
        pending: &PendingExecution,
        adapter: &mut dyn DeviceAdapter,
    ) -> Result<ExecutionReport, ControllerError> {
        // Pre-execution backup of the device's running configuration.
        let running = adapter
            .get_running_config()
            .map_err(|err| ControllerError::Adapter(err.to_string()))?;
        let mut backup_metadata = Map::new();
        backup_metadata.insert("config_id".to_string(), json!(config_id.as_str()));
        let backup = self.rollback.create_backup(device_id, running, backup_metadata);
        let _ = self.audit.log(
            AuditEventKind::BackupCreated,
            &self.current_id(),
            "backup",
            backup.backup_id.as_str(),
            "create",
            AuditResult::Success,
            Map::new(),
        );
        self.update_record(config_id, |stored| {
            stored.backup_id = Some(backup.backup_id.clone());
        })?;

        self.walk(config_id, ConfigState::Executing, None)?;

        let applied = adapter
            .apply_config(&record.config_lines)
            .map_err(|err| ControllerError::Adapter(err.to_string()))?;

        if applied.success {
            self.walk(config_id, ConfigState::Executed, None)?;
            let mut details = Map::new();
            details.insert("device_id".to_string(), json!(device_id.as_str()));
            details.insert("token_id".to_string(), json!(pending.token.token_id.as_str()));
            details.insert("request_id".to_string(), json!(pending.request_id.as_str()));
            let _ = self.audit.log(
                AuditEventKind::ConfigExecuted,
                &self.current_id(),
                "configuration",
                config_id.as_str(),
                "execute",
                AuditResult::Success,
                details,
            );
            self.update_record(config_id, |stored| {
                stored.state = ConfigState::Executed;
                let mut result = Map::new();
                result.insert("success".to_string(), json!(true));
                result.insert("output".to_string(), json!(applied.output));
                stored.execution_result = Some(result);
            })?;
            return Ok(ExecutionReport {
                config_id: config_id.clone(),
                success: true,
                rolled_back: false,
                detail: None,
            });
        }

        // Device rejected the change: record the failure and revert.
        let failure = applied.error.clone().unwrap_or_else(|| "device rejected change".to_string());
        self.walk(config_id, ConfigState::Failed, Some(failure.clone()))?;
        let mut details = Map::new();
        details.insert("device_id".to_string(), json!(device_id.as_str()));
        details.insert("error".to_string(), json!(failure));
        let _ = self.audit.log(
            AuditEventKind::ConfigFailed,
            &self.current_id(),
            "configuration",
            config_id.as_str(),
            "execute",
            AuditResult::Failure,
            details,
        );

        let rollback_event = self.rollback.auto_rollback(config_id, device_id, &failure, adapter);
        let rolled_back = rollback_event.as_ref().is_some_and(|event| event.success);
        if rolled_back {
            self.walk(config_id, ConfigState::RolledBack, Some(failure.clone()))?;
            let _ = self.audit.log(
                AuditEventKind::ConfigRolledBack,
                &self.current_id(),
                "configuration",
                config_id.as_str(),
                "rollback",
                AuditResult::Success,
                Map::new(),
            );
        }
        self.update_record(config_id, |stored| {
            stored.state =
                if rolled_back { ConfigState::RolledBack } else { ConfigState::Failed };
            let mut result = Map::new();
            result.insert("success".to_string(), json!(false));
            result.insert("error".to_string(), json!(failure));
            stored.execution_result = Some(result);
        })?;

        Ok(ExecutionReport {
            config_id: config_id.clone(),
            success: false,
            rolled_back,
            detail: Some(failure),
        })
    }

    /// Applies one state-machine transition for a configuration.
    fn walk(
        &self,
        config_id: &ConfigId,
        to: ConfigState,
        reason: Option<String>,
    ) -> Result<(), ControllerError> {
        let mut machines = self.machines.lock().map_err(|_| ControllerError::Poisoned)?;
        let machine = machines
            .get_mut(config_id)
            .ok_or_else(|| ControllerError::State(format!("no state machine for {config_id}")))?;
        machine
            .transition(to, &self.current_id(), reason, self.clock.now())
            .map_err(|err| ControllerError::State(err.to_string()))
    }

    /// Read-modify-writes a config record through the NIB CAS interface.
    fn update_record(
        &self,
        config_id: &ConfigId,
        mutate: impl FnOnce(&mut ConfigRecord),
    ) -> Result<(), ControllerError> {
        let mut record = self
            .nib
            .get_config(config_id)
            .map_err(|err| ControllerError::Store(err.to_string()))?
            .ok_or_else(|| ControllerError::Store(format!("config {config_id} not found")))?;
        mutate(&mut record);
        self.nib.upsert_config(&record).map_err(|err| ControllerError::Store(err.to_string()))?;
        Ok(())
    }

    /// Subscribes to the region's policy topic; each accepted update is
    /// stored and acknowledged to the regional controller over the bus.
    pub fn subscribe_policy(self: &Arc<Self>, pubsub: &PubSubBus, bus: &Arc<RequestBus>) {
        let runtime = self.clone();
        let bus = bus.clone();
        let topic = topics::policy_topic(&self.config.region);
        let outcome = pubsub.subscribe(
            &topic,
            Arc::new(move |_topic, envelope| {
                runtime.accept_policy(&envelope.payload, &envelope.message_id);
                let mut ack = Map::new();
                ack.insert(
                    "policy_id".to_string(),
                    envelope.payload.get("policy_id").cloned().unwrap_or(Value::Null),
                );
                bus.send(
                    &runtime.current_id(),
                    &runtime.config.parent_regional,
                    MessageType::PolicyAck,
                    ack,
                    Some(envelope.message_id.clone()),
                )
                .map(|_| ())
                .map_err(|err| err.to_string())
            }),
        );
        if let Err(err) = outcome {
            warn!(topic, error = %err, "policy subscription failed");
        }
    }

    /// Stores a policy update once per message id.
    fn accept_policy(&self, payload: &Map<String, Value>, message_id: &pdsno_core::MessageId) {
        if !self.dedup.first_sighting(message_id) {
            return;
        }
        if let Ok(mut policy) = self.policy.lock() {
            *policy = Some(payload.clone());
        }
        info!(
            policy = payload.get("policy_id").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "policy update accepted"
        );
    }
}
