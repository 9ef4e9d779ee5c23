// crates/pdsno-discovery/src/lib.rs
// ============================================================================
// Module: PDSNO Discovery
// Description: Subnet scanning pipeline feeding the NIB and delta reports.
// Purpose: Find devices, enrich them, detect changes, and report deltas.
// Dependencies: pdsno-core, async-trait, tokio, serde, thiserror, tracing
// ============================================================================

//! ## Overview
//! A discovery cycle fans ARP probes out across the configured CIDR, pings
//! the responders, enriches them over SNMP on a best-effort basis, merges
//! the three result sets by MAC, diffs against the previous cycle's cache,
//! writes current devices to the NIB, and produces a delta-only report.
//! Cycles for one subnet never overlap; a cycle that begins while another
//! is in flight is dropped.
//!
//! Raw packet I/O lives behind the probe traits; production deployments
//! supply privileged implementations while tests and demo runs use the
//! table-driven probes in [`probe`].

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod pipeline;
pub mod probe;
pub mod scanner;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use pipeline::CycleError;
pub use pipeline::CycleSummary;
pub use pipeline::DeltaCache;
pub use pipeline::DeltaReport;
pub use pipeline::DiscoveryPipeline;
pub use pipeline::MergedDevice;
pub use probe::ArpObservation;
pub use probe::ArpProbe;
pub use probe::IcmpObservation;
pub use probe::IcmpProbe;
pub use probe::PingCommandProbe;
pub use probe::SnmpObservation;
pub use probe::SnmpProbe;
pub use probe::StaticArpProbe;
pub use probe::StaticIcmpProbe;
pub use probe::StaticSnmpProbe;
pub use scanner::Cidr;
pub use scanner::CidrError;
