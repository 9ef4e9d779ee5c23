// crates/pdsno-controller/src/lib.rs
// ============================================================================
// Module: PDSNO Controllers
// Description: Global, regional, and local controller runtimes.
// Purpose: Wire admission, discovery, approval, execution, and reporting
// into the three hierarchy tiers.
// Dependencies: pdsno-core, pdsno-bus, pdsno-security, pdsno-approval,
// pdsno-discovery, tokio
// ============================================================================

//! ## Overview
//! Three runtimes live here. The [`GlobalController`] is the root of trust:
//! it admits regional controllers, decides HIGH-sensitivity approvals, and
//! answers heartbeats and sync requests. The [`RegionalController`] earns
//! its identity from the Global, admits local controllers under its
//! delegation credential, routes approvals by sensitivity, issues execution
//! tokens, aggregates discovery reports, and fans policy out to its region.
//! The [`LocalController`] earns its identity from its Regional, drives the
//! discovery loop, proposes configuration changes, and executes approved
//! ones under a verified single-use token with backup and auto-rollback.
//!
//! Every controller takes an explicit configuration value and its
//! collaborators at construction; optional subsystems are injected by the
//! caller rather than conjured internally.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod common;
pub mod global_ctl;
pub mod local;
pub mod regional;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use common::AuthenticatorGuard;
pub use common::ControllerError;
pub use common::SharedSecrets;
pub use global_ctl::GlobalConfig;
pub use global_ctl::GlobalController;
pub use local::ExecutionReport;
pub use local::LocalConfig;
pub use local::LocalController;
pub use regional::RegionalConfig;
pub use regional::RegionalController;
