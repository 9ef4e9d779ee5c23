// crates/pdsno-core/src/runtime/mod.rs
// ============================================================================
// Module: Core Runtime
// Description: Reference implementations shipped with the core crate.
// Purpose: Provide the in-memory NIB used by tests and single-process runs.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! The durable store lives in `pdsno-store-sqlite`; this module carries the
//! in-memory reference implementation of the same contract so higher layers
//! can be exercised without a database file.

mod memory;

pub use memory::InMemoryNib;
pub use memory::parse_admission_sequence;
