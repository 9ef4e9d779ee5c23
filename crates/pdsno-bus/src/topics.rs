// crates/pdsno-bus/src/topics.rs
// ============================================================================
// Module: Topic Scheme
// Description: Canonical topic names for discovery, policy, and events.
// Purpose: Keep publishers and subscribers on the same topic layout.
// Dependencies: pdsno-core
// ============================================================================

//! ## Overview
//! The broker topic layout is fixed: local controllers publish discovery
//! reports under their region and id, regional controllers publish policy
//! per region, and audit broadcasts fan out under the events prefix. The
//! helpers here are the only place topic strings are assembled.

// ============================================================================
// SECTION: Imports
// ============================================================================

use pdsno_core::ControllerId;
use pdsno_core::Region;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Wildcard pattern covering the broadcast audit channel.
pub const EVENTS_PATTERN: &str = "pdsno/events/#";

// ============================================================================
// SECTION: Topic Builders
// ============================================================================

/// Topic a local controller publishes discovery reports to.
#[must_use]
pub fn discovery_topic(region: &Region, local_controller: &ControllerId) -> String {
    format!("pdsno/discovery/{region}/{local_controller}")
}

/// Pattern a regional controller subscribes to for its region's reports.
#[must_use]
pub fn discovery_pattern(region: &Region) -> String {
    format!("pdsno/discovery/{region}/+")
}

/// Topic a regional controller publishes policy updates to.
#[must_use]
pub fn policy_topic(region: &Region) -> String {
    format!("pdsno/policy/{region}")
}

/// Topic for one audit event category on the broadcast channel.
#[must_use]
pub fn events_topic(category: &str) -> String {
    format!("pdsno/events/{category}")
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use pdsno_core::ControllerId;
    use pdsno_core::Region;

    use super::discovery_pattern;
    use super::discovery_topic;
    use super::policy_topic;
    use crate::pubsub::TopicPattern;

    #[test]
    fn regional_pattern_covers_every_local_in_the_region() {
        let region = Region::new("zone-A");
        let topic = discovery_topic(&region, &ControllerId::new("local_cntl_zone-A_1"));
        let pattern = TopicPattern::compile(&discovery_pattern(&region)).unwrap();
        assert!(pattern.matches(&topic));
        assert!(!pattern.matches(&policy_topic(&region)));
    }
}
