// crates/pdsno-bus/src/pubsub.rs
// ============================================================================
// Module: Pub/Sub Bus
// Description: Topic dispatch with MQTT-style wildcard patterns.
// Purpose: Fan out reports and policy updates without naming recipients.
// Dependencies: pdsno-core, thiserror, tracing
// ============================================================================

//! ## Overview
//! Subscriptions pair a topic pattern with a handler. `+` matches exactly
//! one segment; `#` matches zero or more trailing segments and must be the
//! final segment. Publication looks for an exact pattern match first, then
//! scans compiled patterns in subscription order and invokes the first that
//! matches. Handler failures are logged and contained so one bad handler
//! cannot affect others.
//!
//! Delivery is at-least-once under a real broker, so handlers deduplicate
//! by message id; [`MessageDedup`] implements the bookkeeping.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use pdsno_core::MessageEnvelope;
use pdsno_core::MessageId;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

// ============================================================================
// SECTION: Patterns
// ============================================================================

/// Errors raised while compiling topic patterns.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    /// `#` appeared somewhere other than the final segment.
    #[error("multi-level wildcard must be the final segment")]
    HashNotLast,
    /// Pattern was empty.
    #[error("empty topic pattern")]
    Empty,
}

/// One compiled pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Literal segment text.
    Literal(String),
    /// `+`: exactly one segment.
    SingleLevel,
    /// `#`: zero or more trailing segments.
    MultiLevel,
}

/// Compiled topic pattern.
///
/// # Invariants
/// - A `MultiLevel` segment only ever appears last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    /// Source pattern text.
    source: String,
    /// Compiled segments.
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Compiles a pattern string.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] for empty patterns or a misplaced `#`.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }
        let raw: Vec<&str> = pattern.split('/').collect();
        let mut segments = Vec::with_capacity(raw.len());
        for (index, part) in raw.iter().enumerate() {
            let segment = match *part {
                "+" => Segment::SingleLevel,
                "#" => {
                    if index + 1 != raw.len() {
                        return Err(PatternError::HashNotLast);
                    }
                    Segment::MultiLevel
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }
        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    /// Returns the source pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true when the pattern matches a concrete topic.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let topic_segments: Vec<&str> = topic.split('/').collect();
        let mut index = 0;
        for segment in &self.segments {
            match segment {
                Segment::MultiLevel => return true,
                Segment::SingleLevel => {
                    if index >= topic_segments.len() {
                        return false;
                    }
                    index += 1;
                }
                Segment::Literal(literal) => {
                    if topic_segments.get(index) != Some(&literal.as_str()) {
                        return false;
                    }
                    index += 1;
                }
            }
        }
        index == topic_segments.len()
    }
}

// ============================================================================
// SECTION: Dedup Helper
// ============================================================================

/// Bounded seen-set for at-least-once handlers keyed by message id.
///
/// # Invariants
/// - Holds at most `capacity` ids, evicting the oldest first.
pub struct MessageDedup {
    /// Seen ids with insertion order.
    inner: Mutex<DedupState>,
    /// Maximum retained ids.
    capacity: usize,
}

/// Seen-set bookkeeping.
#[derive(Debug, Default)]
struct DedupState {
    /// Membership set.
    seen: HashSet<String>,
    /// Eviction order.
    order: VecDeque<String>,
}

impl MessageDedup {
    /// Creates a dedup window of the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(DedupState::default()),
            capacity,
        }
    }

    /// Records an id; returns true when it was not seen before.
    #[must_use]
    pub fn first_sighting(&self, message_id: &MessageId) -> bool {
        let Ok(mut state) = self.inner.lock() else {
            return true;
        };
        if state.seen.contains(message_id.as_str()) {
            return false;
        }
        state.seen.insert(message_id.as_str().to_string());
        state.order.push_back(message_id.as_str().to_string());
        while state.order.len() > self.capacity {
            if let Some(evicted) = state.order.pop_front() {
                state.seen.remove(&evicted);
            }
        }
        true
    }
}

// ============================================================================
// SECTION: Pub/Sub Bus
// ============================================================================

/// Handler invoked for a matching publication.
///
/// Failures are logged and contained by the bus.
pub type SubscribeHandler =
    Arc<dyn Fn(&str, &MessageEnvelope) -> Result<(), String> + Send + Sync>;

/// One subscription entry.
#[derive(Clone)]
struct Subscription {
    /// Compiled pattern.
    pattern: TopicPattern,
    /// Handler to invoke.
    handler: SubscribeHandler,
}

/// In-process wildcard pub/sub dispatcher.
///
/// # Invariants
/// - Exact pattern matches win over wildcard scans.
/// - At most one handler is invoked per publication.
pub struct PubSubBus {
    /// Subscriptions in registration order.
    subscriptions: RwLock<Vec<Subscription>>,
}

impl Default for PubSubBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSubBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes a handler under a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] for invalid patterns.
    pub fn subscribe(&self, pattern: &str, handler: SubscribeHandler) -> Result<(), PatternError> {
        let compiled = TopicPattern::compile(pattern)?;
        if let Ok(mut subscriptions) = self.subscriptions.write() {
            debug!(pattern, "subscribed");
            subscriptions.push(Subscription {
                pattern: compiled,
                handler,
            });
        }
        Ok(())
    }

    /// Removes every subscription with the exact pattern text.
    pub fn unsubscribe(&self, pattern: &str) {
        if let Ok(mut subscriptions) = self.subscriptions.write() {
            subscriptions.retain(|subscription| subscription.pattern.as_str() != pattern);
        }
    }

    /// Publishes an envelope to a topic; returns true when a handler ran.
    ///
    /// The first matching handler is invoked: exact pattern matches first,
    /// then wildcard patterns in subscription order. Handler failures are
    /// contained and logged.
    pub fn publish(&self, topic: &str, envelope: &MessageEnvelope) -> bool {
        let selected = {
            let Ok(subscriptions) = self.subscriptions.read() else {
                return false;
            };
            subscriptions
                .iter()
                .find(|subscription| subscription.pattern.as_str() == topic)
                .or_else(|| {
                    subscriptions.iter().find(|subscription| subscription.pattern.matches(topic))
                })
                .map(|subscription| (subscription.pattern.as_str().to_string(), subscription.handler.clone()))
        };

        let Some((pattern, handler)) = selected else {
            debug!(topic, "no subscriber for topic");
            return false;
        };

        match handler(topic, envelope) {
            Ok(()) => {
                debug!(topic, pattern, message_id = %envelope.message_id, "published");
                true
            }
            Err(detail) => {
                warn!(topic, pattern, detail, "subscriber handler failed");
                true
            }
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use pdsno_core::ControllerId;
    use pdsno_core::MessageEnvelope;
    use pdsno_core::MessageType;
    use pdsno_core::UtcTimestamp;
    use serde_json::Map;

    use super::MessageDedup;
    use super::PatternError;
    use super::PubSubBus;
    use super::TopicPattern;

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::new(
            ControllerId::new("local_cntl_zone-A_1"),
            ControllerId::new("broadcast"),
            MessageType::DiscoveryReport,
            Map::new(),
            None,
            UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap(),
        )
    }

    #[test]
    fn plus_matches_exactly_one_segment() {
        let pattern = TopicPattern::compile("pdsno/discovery/+/lc-1").unwrap();
        assert!(pattern.matches("pdsno/discovery/zone-A/lc-1"));
        assert!(!pattern.matches("pdsno/discovery/zone-A/extra/lc-1"));
        assert!(!pattern.matches("pdsno/discovery/lc-1"));
    }

    #[test]
    fn hash_matches_zero_or_more_trailing_segments() {
        let pattern = TopicPattern::compile("pdsno/events/#").unwrap();
        assert!(pattern.matches("pdsno/events"));
        assert!(pattern.matches("pdsno/events/config"));
        assert!(pattern.matches("pdsno/events/config/executed"));
        assert!(!pattern.matches("pdsno/policy/zone-A"));
    }

    #[test]
    fn hash_must_be_the_final_segment() {
        assert_eq!(TopicPattern::compile("pdsno/#/events"), Err(PatternError::HashNotLast));
        assert_eq!(TopicPattern::compile(""), Err(PatternError::Empty));
    }

    #[test]
    fn exact_subscription_wins_over_wildcards() {
        let bus = PubSubBus::new();
        let wildcard_hits = Arc::new(AtomicUsize::new(0));
        let exact_hits = Arc::new(AtomicUsize::new(0));

        let hits = wildcard_hits.clone();
        bus.subscribe(
            "pdsno/discovery/+/+",
            Arc::new(move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

        let hits = exact_hits.clone();
        bus.subscribe(
            "pdsno/discovery/zone-A/lc-1",
            Arc::new(move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

        assert!(bus.publish("pdsno/discovery/zone-A/lc-1", &envelope()));
        assert_eq!(exact_hits.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_failures_are_contained() {
        let bus = PubSubBus::new();
        bus.subscribe("pdsno/policy/+", Arc::new(|_, _| Err("store offline".to_string())))
            .unwrap();
        assert!(bus.publish("pdsno/policy/zone-A", &envelope()));
        assert!(!bus.publish("pdsno/other", &envelope()));
    }

    #[test]
    fn dedup_reports_first_sighting_once() {
        let dedup = MessageDedup::new(2);
        let message = envelope();
        assert!(dedup.first_sighting(&message.message_id));
        assert!(!dedup.first_sighting(&message.message_id));

        // Capacity eviction forgets the oldest id.
        let second = envelope();
        let third = envelope();
        assert!(dedup.first_sighting(&second.message_id));
        assert!(dedup.first_sighting(&third.message_id));
        assert!(dedup.first_sighting(&message.message_id));
    }
}
