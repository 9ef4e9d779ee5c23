// crates/pdsno-core/src/lib.rs
// ============================================================================
// Module: PDSNO Core
// Description: Shared data model, envelope format, and storage interfaces.
// Purpose: Provide the canonical types every PDSNO subsystem builds on.
// Dependencies: serde, serde_json, serde_jcs, sha2, hmac, subtle, time, uuid
// ============================================================================

//! ## Overview
//! `pdsno-core` defines the entities held in the Network Information Base,
//! the inter-controller message envelope, canonical serialization and HMAC
//! helpers, and the [`NibStore`] and [`DeviceAdapter`] seams the rest of the
//! workspace implements or consumes. The crate is transport- and
//! storage-agnostic; durable persistence lives in `pdsno-store-sqlite`.
//!
//! Security posture: all wire input (envelopes, payloads, stored rows) is
//! untrusted until verified by the authenticator or the store.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use crate::core::entity::ConfigRecord;
pub use crate::core::entity::ConfigState;
pub use crate::core::entity::Controller;
pub use crate::core::entity::ControllerRole;
pub use crate::core::entity::ControllerStatus;
pub use crate::core::entity::Device;
pub use crate::core::entity::DeviceStatus;
pub use crate::core::entity::LockType;
pub use crate::core::entity::NibEvent;
pub use crate::core::entity::NibLock;
pub use crate::core::entity::Policy;
pub use crate::core::entity::SensitivityLevel;
pub use crate::core::envelope::EnvelopeError;
pub use crate::core::envelope::MessageEnvelope;
pub use crate::core::envelope::MessageType;
pub use crate::core::envelope::SIGNATURE_ALGORITHM;
pub use crate::core::hashing;
pub use crate::core::identifiers::BackupId;
pub use crate::core::identifiers::ChallengeId;
pub use crate::core::identifiers::ConfigId;
pub use crate::core::identifiers::ControllerId;
pub use crate::core::identifiers::DeviceId;
pub use crate::core::identifiers::EventId;
pub use crate::core::identifiers::KeyId;
pub use crate::core::identifiers::LockId;
pub use crate::core::identifiers::MacAddress;
pub use crate::core::identifiers::MessageId;
pub use crate::core::identifiers::Region;
pub use crate::core::identifiers::RequestId;
pub use crate::core::identifiers::TokenId;
pub use crate::core::time::Clock;
pub use crate::core::time::SKEW_TOLERANCE_SECONDS;
pub use crate::core::time::ManualClock;
pub use crate::core::time::SystemClock;
pub use crate::core::time::TimeError;
pub use crate::core::time::UtcTimestamp;
pub use interfaces::AdapterError;
pub use interfaces::ApplyOutcome;
pub use interfaces::DeviceAdapter;
pub use interfaces::NibError;
pub use interfaces::NibStore;
pub use interfaces::UpsertReceipt;
pub use runtime::InMemoryNib;
pub use runtime::parse_admission_sequence;
