// crates/pdsno-approval/src/engine.rs
// ============================================================================
// Module: Approval Engine
// Description: Hierarchical approval lifecycle for configuration changes.
// Purpose: Auto-approve LOW, route MEDIUM and HIGH to the right authority,
// and expire stale requests.
// Dependencies: pdsno-core, pdsno-security, serde, thiserror, uuid
// ============================================================================

//! ## Overview
//! Requests walk `DRAFT → PENDING_APPROVAL → APPROVED | REJECTED |
//! EXPIRED`. A LOW request auto-approves on submit; MEDIUM and HIGH wait
//! for an approver whose authority covers the tier (local approves only
//! LOW, regional up to MEDIUM, global everything). Authority defaults to
//! role inference from the approver id and upgrades to an RBAC lookup when
//! a manager is injected. Requests expire after a configurable timeout,
//! swept on access and by the periodic sweep.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use pdsno_core::Clock;
use pdsno_core::ControllerId;
use pdsno_core::ControllerRole;
use pdsno_core::DeviceId;
use pdsno_core::RequestId;
use pdsno_core::SensitivityLevel;
use pdsno_core::UtcTimestamp;
use pdsno_security::RbacManager;
use pdsno_security::rbac::Action;
use pdsno_security::rbac::Resource;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default approval timeout (60 minutes, in seconds).
pub const DEFAULT_APPROVAL_TIMEOUT_SECONDS: i64 = 60 * 60;

// ============================================================================
// SECTION: States and Records
// ============================================================================

/// Approval request lifecycle states.
///
/// # Invariants
/// - Wire labels are stable SCREAMING_SNAKE strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalState {
    /// Being prepared.
    Draft,
    /// Awaiting an authorized approver.
    PendingApproval,
    /// Approved; execution may proceed.
    Approved,
    /// Rejected with a reason.
    Rejected,
    /// Timed out before a decision.
    Expired,
}

impl ApprovalState {
    /// Returns the stable wire label for the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::PendingApproval => "PENDING_APPROVAL",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }
}

/// One configuration change awaiting approval.
///
/// # Invariants
/// - `approvers` is append-only.
/// - Timestamps are set when the corresponding state is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request identifier.
    pub request_id: RequestId,
    /// Target device.
    pub device_id: DeviceId,
    /// Proposed command lines.
    pub config_lines: Vec<String>,
    /// Sensitivity classification.
    pub sensitivity: SensitivityLevel,
    /// Proposing controller.
    pub requester_id: ControllerId,
    /// Lifecycle state.
    pub state: ApprovalState,
    /// Approvers in decision order.
    pub approvers: Vec<ControllerId>,
    /// Rejector, when rejected.
    pub rejector: Option<ControllerId>,
    /// Rejection reason, when rejected.
    pub rejection_reason: Option<String>,
    /// Creation time.
    pub created_at: UtcTimestamp,
    /// Submission time.
    pub submitted_at: Option<UtcTimestamp>,
    /// Approval time.
    pub approved_at: Option<UtcTimestamp>,
    /// Execution time, filled by the executor.
    pub executed_at: Option<UtcTimestamp>,
    /// Linked execution token, once issued.
    pub execution_token_id: Option<pdsno_core::TokenId>,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the approval lifecycle.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    /// Request id is unknown.
    #[error("request not found: {0}")]
    NotFound(String),
    /// Operation is illegal in the request's current state.
    #[error("request {request} is {state}, not {expected}")]
    InvalidState {
        /// Request id.
        request: String,
        /// Current state label.
        state: &'static str,
        /// Required state label.
        expected: &'static str,
    },
    /// Approver lacks authority for the request's tier.
    #[error("{approver} lacks authority to decide a {tier} request")]
    NotAuthorized {
        /// Deciding controller.
        approver: String,
        /// Sensitivity tier label.
        tier: &'static str,
    },
    /// The request timed out before the decision.
    #[error("request expired before decision")]
    Expired,
    /// Internal synchronization failure.
    #[error("approval state mutex poisoned")]
    Poisoned,
}

// ============================================================================
// SECTION: Engine
// ============================================================================

/// Approval workflow engine owned by one controller.
///
/// # Invariants
/// - A LOW request is `Approved` immediately after `submit`.
/// - Authority follows the role table; RBAC overrides when injected.
pub struct ApprovalEngine {
    /// Owning controller.
    controller_id: ControllerId,
    /// Request expiry in seconds after submission.
    approval_timeout_seconds: i64,
    /// Live requests by id.
    requests: Mutex<HashMap<RequestId, ApprovalRequest>>,
    /// Optional RBAC authority source.
    rbac: Option<Arc<RbacManager>>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl ApprovalEngine {
    /// Creates an engine with the default timeout.
    #[must_use]
    pub fn new(
        controller_id: ControllerId,
        rbac: Option<Arc<RbacManager>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_timeout(controller_id, rbac, clock, DEFAULT_APPROVAL_TIMEOUT_SECONDS)
    }

    /// Creates an engine with an explicit timeout.
    #[must_use]
    pub fn with_timeout(
        controller_id: ControllerId,
        rbac: Option<Arc<RbacManager>>,
        clock: Arc<dyn Clock>,
        approval_timeout_seconds: i64,
    ) -> Self {
        Self {
            controller_id,
            approval_timeout_seconds,
            requests: Mutex::new(HashMap::new()),
            rbac,
            clock,
        }
    }

    /// Creates a new request in `DRAFT`.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Poisoned`] on internal synchronization
    /// failure.
    pub fn create_request(
        &self,
        device_id: DeviceId,
        config_lines: Vec<String>,
        sensitivity: SensitivityLevel,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let request = ApprovalRequest {
            request_id: RequestId::new(Uuid::new_v4().to_string()),
            device_id,
            config_lines,
            sensitivity,
            requester_id: self.controller_id.clone(),
            state: ApprovalState::Draft,
            approvers: Vec::new(),
            rejector: None,
            rejection_reason: None,
            created_at: self.clock.now(),
            submitted_at: None,
            approved_at: None,
            executed_at: None,
            execution_token_id: None,
        };
        info!(
            request = %request.request_id,
            device = %request.device_id,
            tier = sensitivity.as_str(),
            "created approval request"
        );
        self.guard()?.insert(request.request_id.clone(), request.clone());
        Ok(request)
    }

    /// Submits a request for approval; LOW auto-approves.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`] or [`ApprovalError::InvalidState`].
    pub fn submit(&self, request_id: &RequestId) -> Result<ApprovalState, ApprovalError> {
        let now = self.clock.now();
        let auto_approve = {
            let mut requests = self.guard()?;
            let request = requests
                .get_mut(request_id)
                .ok_or_else(|| ApprovalError::NotFound(request_id.as_str().to_string()))?;
            if request.state != ApprovalState::Draft {
                return Err(ApprovalError::InvalidState {
                    request: request_id.as_str().to_string(),
                    state: request.state.as_str(),
                    expected: ApprovalState::Draft.as_str(),
                });
            }
            request.state = ApprovalState::PendingApproval;
            request.submitted_at = Some(now);
            request.sensitivity == SensitivityLevel::Low
        };

        if auto_approve {
            info!(request = %request_id, "auto-approving LOW request");
            let approver = self.controller_id.clone();
            self.approve(request_id, &approver)?;
            return Ok(ApprovalState::Approved);
        }
        info!(request = %request_id, "submitted for approval");
        Ok(ApprovalState::PendingApproval)
    }

    /// Approves a pending request.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotAuthorized`] when the approver's
    /// authority does not cover the tier, [`ApprovalError::Expired`] for
    /// timed-out requests, and state errors otherwise.
    pub fn approve(
        &self,
        request_id: &RequestId,
        approver: &ControllerId,
    ) -> Result<(), ApprovalError> {
        let now = self.clock.now();
        let mut requests = self.guard()?;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| ApprovalError::NotFound(request_id.as_str().to_string()))?;
        if request.state != ApprovalState::PendingApproval {
            return Err(ApprovalError::InvalidState {
                request: request_id.as_str().to_string(),
                state: request.state.as_str(),
                expected: ApprovalState::PendingApproval.as_str(),
            });
        }
        if !self.can_decide(approver, request.sensitivity) {
            warn!(approver = %approver, tier = request.sensitivity.as_str(), "approval refused");
            return Err(ApprovalError::NotAuthorized {
                approver: approver.as_str().to_string(),
                tier: request.sensitivity.as_str(),
            });
        }
        if self.is_expired(request, now) {
            request.state = ApprovalState::Expired;
            warn!(request = %request_id, "request expired before approval");
            return Err(ApprovalError::Expired);
        }

        request.state = ApprovalState::Approved;
        request.approved_at = Some(now);
        request.approvers.push(approver.clone());
        info!(request = %request_id, approver = %approver, "request approved");
        Ok(())
    }

    /// Rejects a pending request with a reason.
    ///
    /// # Errors
    ///
    /// Mirrors [`ApprovalEngine::approve`].
    pub fn reject(
        &self,
        request_id: &RequestId,
        rejector: &ControllerId,
        reason: &str,
    ) -> Result<(), ApprovalError> {
        let mut requests = self.guard()?;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| ApprovalError::NotFound(request_id.as_str().to_string()))?;
        if request.state != ApprovalState::PendingApproval {
            return Err(ApprovalError::InvalidState {
                request: request_id.as_str().to_string(),
                state: request.state.as_str(),
                expected: ApprovalState::PendingApproval.as_str(),
            });
        }
        if !self.can_decide(rejector, request.sensitivity) {
            return Err(ApprovalError::NotAuthorized {
                approver: rejector.as_str().to_string(),
                tier: request.sensitivity.as_str(),
            });
        }

        request.state = ApprovalState::Rejected;
        request.rejector = Some(rejector.clone());
        request.rejection_reason = Some(reason.to_string());
        info!(request = %request_id, rejector = %rejector, reason, "request rejected");
        Ok(())
    }

    /// Returns a snapshot of a request.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Poisoned`] on internal synchronization
    /// failure.
    pub fn get(&self, request_id: &RequestId) -> Result<Option<ApprovalRequest>, ApprovalError> {
        Ok(self.guard()?.get(request_id).cloned())
    }

    /// Records the execution linkage on an approved request.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`] for unknown ids.
    pub fn mark_executed(
        &self,
        request_id: &RequestId,
        token_id: &pdsno_core::TokenId,
    ) -> Result<(), ApprovalError> {
        let now = self.clock.now();
        let mut requests = self.guard()?;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| ApprovalError::NotFound(request_id.as_str().to_string()))?;
        request.executed_at = Some(now);
        request.execution_token_id = Some(token_id.clone());
        Ok(())
    }

    /// Lists requests currently pending approval.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Poisoned`] on internal synchronization
    /// failure.
    pub fn pending(&self) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        Ok(self
            .guard()?
            .values()
            .filter(|request| request.state == ApprovalState::PendingApproval)
            .cloned()
            .collect())
    }

    /// Marks every timed-out pending request expired; returns the count.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Poisoned`] on internal synchronization
    /// failure.
    pub fn sweep_expired(&self) -> Result<usize, ApprovalError> {
        let now = self.clock.now();
        let mut swept = 0;
        let mut requests = self.guard()?;
        for request in requests.values_mut() {
            if request.state == ApprovalState::PendingApproval
                && request
                    .submitted_at
                    .is_some_and(|at| now.seconds_since(&at) > self.approval_timeout_seconds as f64)
            {
                request.state = ApprovalState::Expired;
                swept += 1;
                info!(request = %request.request_id, "request expired");
            }
        }
        Ok(swept)
    }

    /// Returns true when the approver may decide the tier.
    ///
    /// Uses RBAC when injected; otherwise infers the role from the id.
    fn can_decide(&self, approver: &ControllerId, tier: SensitivityLevel) -> bool {
        if let Some(rbac) = &self.rbac {
            let mut context = std::collections::BTreeMap::new();
            context.insert("sensitivity".to_string(), tier.as_str().to_string());
            return rbac.check_permission(
                approver.as_str(),
                Resource::Config,
                Action::Approve,
                Some(&context),
            );
        }
        let role = infer_role(approver);
        match tier {
            SensitivityLevel::Low => true,
            SensitivityLevel::Medium => {
                matches!(role, ControllerRole::Regional | ControllerRole::Global)
            }
            SensitivityLevel::High => role == ControllerRole::Global,
        }
    }

    /// Returns true when the request's submission has timed out.
    fn is_expired(&self, request: &ApprovalRequest, now: UtcTimestamp) -> bool {
        request
            .submitted_at
            .is_some_and(|at| now.seconds_since(&at) > self.approval_timeout_seconds as f64)
    }

    /// Acquires the request mutex.
    fn guard(&self) -> Result<MutexGuard<'_, HashMap<RequestId, ApprovalRequest>>, ApprovalError> {
        self.requests.lock().map_err(|_| ApprovalError::Poisoned)
    }
}

/// Infers a controller role from its id shape.
fn infer_role(controller_id: &ControllerId) -> ControllerRole {
    let id = controller_id.as_str().to_ascii_lowercase();
    if id.contains("global") {
        ControllerRole::Global
    } else if id.contains("regional") {
        ControllerRole::Regional
    } else {
        ControllerRole::Local
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
