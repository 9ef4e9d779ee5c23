// crates/pdsno-approval/src/lib.rs
// ============================================================================
// Module: PDSNO Approval
// Description: Configuration governance from classification to rollback.
// Purpose: Decide who may change what, prove the authorization, and undo
// failures.
// Dependencies: pdsno-core, pdsno-security, regex, serde, thiserror, uuid
// ============================================================================

//! ## Overview
//! A configuration change flows through this crate end to end: the
//! [`SensitivityClassifier`] maps its command lines to a tier, the
//! [`ApprovalEngine`] runs the hierarchical approval lifecycle, the
//! [`ConfigStateMachine`] enforces legal state walks, the
//! [`ExecutionTokenManager`] issues and verifies single-use signed
//! execution authorizations, the [`RollbackManager`] keeps pre-execution
//! backups and reverts failures, and the [`AuditTrail`] records every
//! decision.
//!
//! Security posture: tokens and audit tags are HMAC-SHA256 over canonical
//! JSON and compared in constant time; the audit trail exposes no update or
//! delete path.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod audit;
pub mod classifier;
pub mod engine;
pub mod rollback;
pub mod state;
pub mod token;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use audit::AuditError;
pub use audit::AuditEventKind;
pub use audit::AuditRecord;
pub use audit::AuditResult;
pub use audit::AuditSummary;
pub use audit::AuditTrail;
pub use classifier::Classification;
pub use classifier::ClassifierError;
pub use classifier::SensitivityClassifier;
pub use engine::ApprovalEngine;
pub use engine::ApprovalError;
pub use engine::ApprovalRequest;
pub use engine::ApprovalState;
pub use rollback::ConfigBackup;
pub use rollback::RollbackEvent;
pub use rollback::RollbackManager;
pub use state::ConfigStateMachine;
pub use state::ConfigTransition;
pub use state::TransitionError;
pub use token::ExecutionToken;
pub use token::ExecutionTokenManager;
pub use token::TokenError;
