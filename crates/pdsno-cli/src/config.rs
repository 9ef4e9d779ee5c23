// crates/pdsno-cli/src/config.rs
// ============================================================================
// Module: CLI Runtime Configuration
// Description: TOML configuration file merged with command-line flags.
// Purpose: Carry deployment-specific policy without baking it into flags.
// Dependencies: serde, toml
// ============================================================================

//! ## Overview
//! The optional `--config` file supplies admission policy (region allow-list
//! and quota) and discovery tuning (fan-out bound, miss budget, and a demo
//! ARP table for lab topologies where raw ARP probing is unavailable).
//! Every section has defaults so the file is optional.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while loading the configuration file.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("config read failure: {0}")]
    Read(String),
    /// File did not parse as the expected TOML shape.
    #[error("config parse failure: {0}")]
    Parse(String),
}

// ============================================================================
// SECTION: Sections
// ============================================================================

/// Admission policy knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionSection {
    /// Regions candidates may request.
    #[serde(default = "default_regions")]
    pub allowed_regions: Vec<String>,
    /// Maximum active controllers per role in one region.
    #[serde(default = "default_region_quota")]
    pub region_quota: usize,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            allowed_regions: default_regions(),
            region_quota: default_region_quota(),
        }
    }
}

/// Discovery tuning knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    /// Maximum outstanding probes per scan.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Consecutive absences tolerated before a device goes inactive.
    #[serde(default = "default_miss_budget")]
    pub miss_budget: u32,
    /// Per-address ICMP timeout in seconds.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_seconds: u64,
    /// Lab topology: IP to MAC responder table used where raw ARP probing
    /// is unavailable.
    #[serde(default)]
    pub demo_arp: BTreeMap<String, String>,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            miss_budget: default_miss_budget(),
            ping_timeout_seconds: default_ping_timeout(),
            demo_arp: BTreeMap::new(),
        }
    }
}

/// Top-level configuration file shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CliConfig {
    /// Admission policy.
    #[serde(default)]
    pub admission: AdmissionSection,
    /// Discovery tuning.
    #[serde(default)]
    pub discovery: DiscoverySection,
}

impl CliConfig {
    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path).map_err(|err| ConfigError::Read(err.to_string()))?;
        toml::from_str(&text).map_err(|err| ConfigError::Parse(err.to_string()))
    }
}

// ============================================================================
// SECTION: Defaults
// ============================================================================

/// Default region allow-list.
fn default_regions() -> Vec<String> {
    vec!["zone-A".to_string(), "zone-B".to_string(), "zone-C".to_string()]
}

/// Default per-region controller quota.
const fn default_region_quota() -> usize {
    16
}

/// Default probe fan-out bound.
const fn default_max_in_flight() -> usize {
    64
}

/// Default discovery miss budget.
const fn default_miss_budget() -> u32 {
    3
}

/// Default ICMP timeout.
const fn default_ping_timeout() -> u64 {
    1
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::CliConfig;

    #[test]
    fn empty_document_yields_defaults() {
        let config: CliConfig = toml::from_str("").unwrap();
        assert_eq!(config.admission.region_quota, 16);
        assert_eq!(config.discovery.miss_budget, 3);
        assert!(config.discovery.demo_arp.is_empty());
    }

    #[test]
    fn sections_override_defaults() {
        let text = r#"
            [admission]
            allowed_regions = ["zone-X"]
            region_quota = 2

            [discovery]
            max_in_flight = 8
            [discovery.demo_arp]
            "192.168.1.5" = "aa:bb:cc:dd:ee:05"
        "#;
        let config: CliConfig = toml::from_str(text).unwrap();
        assert_eq!(config.admission.allowed_regions, vec!["zone-X".to_string()]);
        assert_eq!(config.admission.region_quota, 2);
        assert_eq!(config.discovery.max_in_flight, 8);
        assert_eq!(
            config.discovery.demo_arp.get("192.168.1.5").map(String::as_str),
            Some("aa:bb:cc:dd:ee:05")
        );
    }
}
