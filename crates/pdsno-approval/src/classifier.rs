// crates/pdsno-approval/src/classifier.rs
// ============================================================================
// Module: Sensitivity Classifier
// Description: Pattern-based mapping of command lines to sensitivity tiers.
// Purpose: Route each configuration change to the right approval authority.
// Dependencies: pdsno-core, regex
// ============================================================================

//! ## Overview
//! Classification is a strict tier walk: if any line matches a HIGH pattern
//! the whole change is HIGH, else any MEDIUM match makes it MEDIUM, else it
//! is LOW. Patterns are case-insensitive and extendable at runtime per
//! tier. The detailed form reports which patterns matched and a short
//! reason string for the audit trail.

// ============================================================================
// SECTION: Imports
// ============================================================================

use pdsno_core::SensitivityLevel;
use regex::Regex;
use regex::RegexBuilder;
use thiserror::Error;

// ============================================================================
// SECTION: Pattern Tables
// ============================================================================

/// Patterns forcing HIGH sensitivity: routing, security, and critical
/// service changes.
const HIGH_PATTERNS: &[&str] = &[
    r"router\s+(bgp|ospf|eigrp)",
    r"ip\s+route",
    r"access-list\s+\d+",
    r"firewall",
    r"crypto",
    r"spanning-tree",
    r"interface\s+loopback",
    r"no\s+ip\s+routing",
    r"shutdown.*interface\s+(gigabitethernet|tengigabitethernet)",
    r"delete\s+vlan",
    r"aaa\s+",
    r"snmp-server\s+community",
];

/// Patterns forcing MEDIUM sensitivity: VLAN, interface, and QoS changes.
const MEDIUM_PATTERNS: &[&str] = &[
    r"vlan\s+\d+",
    r"interface\s+vlan",
    r"switchport\s+mode",
    r"switchport\s+access\s+vlan",
    r"qos",
    r"bandwidth",
    r"storm-control",
    r"port-security",
    r"interface\s+(fastethernet|ethernet)",
];

/// Recognized LOW patterns; informational only since LOW is the default.
const LOW_PATTERNS: &[&str] = &[
    r"description\s+",
    r"hostname\s+",
    r"logging\s+",
    r"snmp-server\s+location",
    r"snmp-server\s+contact",
    r"banner\s+",
    r"alias\s+",
];

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while compiling classification patterns.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// Pattern failed to compile.
    #[error("invalid pattern {pattern}: {detail}")]
    Pattern {
        /// Offending pattern source.
        pattern: String,
        /// Compiler diagnostic.
        detail: String,
    },
}

// ============================================================================
// SECTION: Classification
// ============================================================================

/// Detailed classification outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Final tier.
    pub sensitivity: SensitivityLevel,
    /// Patterns that matched at the deciding tier.
    pub matched_patterns: Vec<String>,
    /// Short reason string for audit details.
    pub reasoning: String,
}

/// Tier-ordered pattern classifier.
///
/// # Invariants
/// - Evaluation order is HIGH, then MEDIUM, then the LOW default.
/// - All matching is case-insensitive.
pub struct SensitivityClassifier {
    /// HIGH tier patterns.
    high: Vec<Regex>,
    /// MEDIUM tier patterns.
    medium: Vec<Regex>,
    /// LOW tier patterns (informational).
    low: Vec<Regex>,
}

impl SensitivityClassifier {
    /// Builds the classifier with the stock pattern tables.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifierError::Pattern`] when a stock pattern fails to
    /// compile (only possible after a source edit).
    pub fn new() -> Result<Self, ClassifierError> {
        Ok(Self {
            high: compile_all(HIGH_PATTERNS)?,
            medium: compile_all(MEDIUM_PATTERNS)?,
            low: compile_all(LOW_PATTERNS)?,
        })
    }

    /// Registers a custom pattern under a tier at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifierError::Pattern`] for invalid regular expressions.
    pub fn add_custom_pattern(
        &mut self,
        pattern: &str,
        sensitivity: SensitivityLevel,
    ) -> Result<(), ClassifierError> {
        let compiled = compile(pattern)?;
        match sensitivity {
            SensitivityLevel::High => self.high.push(compiled),
            SensitivityLevel::Medium => self.medium.push(compiled),
            SensitivityLevel::Low => self.low.push(compiled),
        }
        Ok(())
    }

    /// Returns the highest tier matched by any line.
    #[must_use]
    pub fn classify(&self, config_lines: &[String]) -> SensitivityLevel {
        self.classify_detailed(config_lines).sensitivity
    }

    /// Classifies with matched patterns and a reason string.
    #[must_use]
    pub fn classify_detailed(&self, config_lines: &[String]) -> Classification {
        let text = config_lines.join("\n");

        let high_matches = matching_patterns(&self.high, &text);
        if !high_matches.is_empty() {
            return Classification {
                sensitivity: SensitivityLevel::High,
                matched_patterns: high_matches,
                reasoning: "contains high-impact commands affecting routing, security, or \
                            critical services"
                    .to_string(),
            };
        }

        let medium_matches = matching_patterns(&self.medium, &text);
        if !medium_matches.is_empty() {
            return Classification {
                sensitivity: SensitivityLevel::Medium,
                matched_patterns: medium_matches,
                reasoning: "contains moderate-impact commands affecting VLANs, interfaces, or QoS"
                    .to_string(),
            };
        }

        Classification {
            sensitivity: SensitivityLevel::Low,
            matched_patterns: matching_patterns(&self.low, &text),
            reasoning: "contains only low-impact commands".to_string(),
        }
    }
}

/// Compiles one case-insensitive pattern.
fn compile(pattern: &str) -> Result<Regex, ClassifierError> {
    RegexBuilder::new(pattern).case_insensitive(true).build().map_err(|err| {
        ClassifierError::Pattern {
            pattern: pattern.to_string(),
            detail: err.to_string(),
        }
    })
}

/// Compiles a pattern table.
fn compile_all(patterns: &[&str]) -> Result<Vec<Regex>, ClassifierError> {
    patterns.iter().map(|pattern| compile(pattern)).collect()
}

/// Returns the source text of every pattern matching the input.
fn matching_patterns(patterns: &[Regex], text: &str) -> Vec<String> {
    patterns
        .iter()
        .filter(|pattern| pattern.is_match(text))
        .map(|pattern| pattern.as_str().to_string())
        .collect()
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use pdsno_core::SensitivityLevel;

    use super::SensitivityClassifier;

    fn lines(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|line| (*line).to_string()).collect()
    }

    #[test]
    fn routing_commands_classify_high() {
        let classifier = SensitivityClassifier::new().unwrap();
        let config = lines(&[
            "router bgp 65001",
            "neighbor 10.0.0.1 remote-as 65002",
        ]);
        assert_eq!(classifier.classify(&config), SensitivityLevel::High);
    }

    #[test]
    fn vlan_creation_classifies_medium() {
        let classifier = SensitivityClassifier::new().unwrap();
        let config = lines(&["vlan 100", "name Engineering"]);
        assert_eq!(classifier.classify(&config), SensitivityLevel::Medium);
    }

    #[test]
    fn descriptions_classify_low_and_empty_input_is_low() {
        let classifier = SensitivityClassifier::new().unwrap();
        let config = lines(&["interface gigabitethernet0/1", "description Uplink to Core"]);
        assert_eq!(classifier.classify(&config), SensitivityLevel::Low);
        assert_eq!(classifier.classify(&[]), SensitivityLevel::Low);
    }

    #[test]
    fn highest_tier_wins_across_lines() {
        let classifier = SensitivityClassifier::new().unwrap();
        let config = lines(&["vlan 100", "description Floor 3", "crypto key generate rsa"]);
        assert_eq!(classifier.classify(&config), SensitivityLevel::High);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let classifier = SensitivityClassifier::new().unwrap();
        let config = lines(&["ROUTER OSPF 10"]);
        assert_eq!(classifier.classify(&config), SensitivityLevel::High);
    }

    #[test]
    fn custom_patterns_extend_a_tier_at_runtime() {
        let mut classifier = SensitivityClassifier::new().unwrap();
        classifier.add_custom_pattern(r"ntp\s+server", SensitivityLevel::Medium).unwrap();
        let config = lines(&["ntp server 10.0.0.5"]);
        assert_eq!(classifier.classify(&config), SensitivityLevel::Medium);
        assert!(classifier.add_custom_pattern("(((", SensitivityLevel::Low).is_err());
    }

    #[test]
    fn detailed_classification_reports_matches() {
        let classifier = SensitivityClassifier::new().unwrap();
        let details = classifier.classify_detailed(&lines(&["snmp-server community private rw"]));
        assert_eq!(details.sensitivity, SensitivityLevel::High);
        assert!(details.matched_patterns.iter().any(|p| p.contains("snmp-server")));
        assert!(!details.reasoning.is_empty());
    }
}
