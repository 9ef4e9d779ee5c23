// crates/pdsno-approval/src/state.rs
// ============================================================================
// Module: Configuration State Machine
// Description: Transition-table enforcement for configuration lifecycles.
// Purpose: Make every realized state sequence a legal walk with history.
// Dependencies: pdsno-core, serde, thiserror
// ============================================================================

//! ## Overview
//! The state machine owns one configuration's lifecycle. Transitions are
//! validated against a fixed table; an invalid request fails without
//! changing state, and every accepted transition is recorded with its
//! trigger and reason. `CANCELLED` is terminal.

// ============================================================================
// SECTION: Imports
// ============================================================================

use pdsno_core::ConfigId;
use pdsno_core::ConfigState;
use pdsno_core::ControllerId;
use pdsno_core::UtcTimestamp;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing::warn;

// ============================================================================
// SECTION: Transition Table
// ============================================================================

/// Returns the legal successor states of a state.
#[must_use]
pub const fn valid_transitions(from: ConfigState) -> &'static [ConfigState] {
    match from {
        ConfigState::Draft => &[ConfigState::PendingApproval, ConfigState::Cancelled],
        ConfigState::PendingApproval => {
            &[ConfigState::Approved, ConfigState::Cancelled, ConfigState::Draft]
        }
        ConfigState::Approved => &[ConfigState::Executing, ConfigState::Cancelled],
        ConfigState::Executing => &[ConfigState::Executed, ConfigState::Failed],
        ConfigState::Executed => &[ConfigState::RolledBack],
        ConfigState::Failed => &[ConfigState::RolledBack, ConfigState::Draft],
        ConfigState::RolledBack => &[ConfigState::Draft],
        ConfigState::Cancelled => &[],
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by transition requests.
///
/// # Invariants
/// - A failed transition leaves the current state untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// The requested edge is not in the transition table.
    #[error("invalid transition: {} -> {}", .from.as_str(), .to.as_str())]
    Invalid {
        /// Current state.
        from: ConfigState,
        /// Requested state.
        to: ConfigState,
    },
}

// ============================================================================
// SECTION: Records
// ============================================================================

/// One accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigTransition {
    /// State before.
    pub from_state: ConfigState,
    /// State after.
    pub to_state: ConfigState,
    /// When the transition happened.
    pub timestamp: UtcTimestamp,
    /// Actor that requested it.
    pub triggered_by: ControllerId,
    /// Optional reason.
    pub reason: Option<String>,
}

// ============================================================================
// SECTION: State Machine
// ============================================================================

/// State machine for one configuration record.
///
/// # Invariants
/// - `history` lists every accepted transition in order.
/// - The realized state sequence is a walk on the transition table starting
///   at `DRAFT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigStateMachine {
    /// Owned configuration.
    pub config_id: ConfigId,
    /// Current state.
    current: ConfigState,
    /// When the current state was entered.
    entered_at: UtcTimestamp,
    /// Accepted transitions in order.
    history: Vec<ConfigTransition>,
}

impl ConfigStateMachine {
    /// Creates a machine in `DRAFT`.
    #[must_use]
    pub fn new(config_id: ConfigId, now: UtcTimestamp) -> Self {
        Self {
            config_id,
            current: ConfigState::Draft,
            entered_at: now,
            history: Vec::new(),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn current(&self) -> ConfigState {
        self.current
    }

    /// Returns when the current state was entered.
    #[must_use]
    pub const fn entered_at(&self) -> UtcTimestamp {
        self.entered_at
    }

    /// Returns true when the edge to `to` is legal from the current state.
    #[must_use]
    pub fn can_transition_to(&self, to: ConfigState) -> bool {
        valid_transitions(self.current).contains(&to)
    }

    /// Applies a transition.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Invalid`] and leaves the state unchanged
    /// when the edge is not in the table.
    pub fn transition(
        &mut self,
        to: ConfigState,
        triggered_by: &ControllerId,
        reason: Option<String>,
        now: UtcTimestamp,
    ) -> Result<(), TransitionError> {
        if !self.can_transition_to(to) {
            warn!(
                config = %self.config_id,
                from = self.current.as_str(),
                to = to.as_str(),
                "invalid transition refused"
            );
            return Err(TransitionError::Invalid {
                from: self.current,
                to,
            });
        }
        self.history.push(ConfigTransition {
            from_state: self.current,
            to_state: to,
            timestamp: now,
            triggered_by: triggered_by.clone(),
            reason,
        });
        info!(
            config = %self.config_id,
            from = self.current.as_str(),
            to = to.as_str(),
            by = %triggered_by,
            "state transition"
        );
        self.current = to;
        self.entered_at = now;
        Ok(())
    }

    /// Returns the transition history.
    #[must_use]
    pub fn history(&self) -> &[ConfigTransition] {
        &self.history
    }

    /// Returns seconds spent in the current state as of `now`.
    #[must_use]
    pub fn state_duration_seconds(&self, now: &UtcTimestamp) -> f64 {
        now.seconds_since(&self.entered_at)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
