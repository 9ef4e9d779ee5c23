// crates/pdsno-store-sqlite/src/lib.rs
// ============================================================================
// Module: PDSNO SQLite Store
// Description: Durable Network Information Base backed by SQLite.
// Purpose: Persist devices, controllers, configs, policies, events, and locks.
// Dependencies: pdsno-core, rusqlite, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! This crate implements the [`pdsno_core::NibStore`] contract on SQLite.
//! Versioned entities use atomic compare-and-swap updates; the event log is
//! enforced append-only by schema triggers so tampering requires going
//! around the database entirely, which the per-row HMAC tag then exposes.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod store;

pub use store::SqliteNib;
pub use store::SqliteNibConfig;
pub use store::SqliteStoreError;
