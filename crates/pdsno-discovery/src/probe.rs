// crates/pdsno-discovery/src/probe.rs
// ============================================================================
// Module: Discovery Probes
// Description: ARP, ICMP, and SNMP probe interfaces and stock implementations.
// Purpose: Isolate raw network I/O behind per-protocol seams.
// Dependencies: pdsno-core, async-trait, tokio
// ============================================================================

//! ## Overview
//! Each protocol gets its own single-address probe trait; the scanner fans
//! them out concurrently with a bounded worker pool. [`PingCommandProbe`]
//! shells out to the system `ping` for ICMP reachability and RTT. ARP and
//! SNMP require raw sockets or an SNMP stack, so their production
//! implementations are supplied by the deployment; the `Static*` probes
//! serve tests and demo topologies from fixed tables.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pdsno_core::Clock;
use pdsno_core::MacAddress;
use pdsno_core::UtcTimestamp;
use tokio::process::Command;
use tracing::debug;

// ============================================================================
// SECTION: Observations
// ============================================================================

/// One ARP responder sighting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpObservation {
    /// Responding address.
    pub ip: Ipv4Addr,
    /// Responder's hardware address.
    pub mac: MacAddress,
    /// Sighting time.
    pub observed_at: UtcTimestamp,
}

/// One ICMP echo result.
#[derive(Debug, Clone, PartialEq)]
pub struct IcmpObservation {
    /// Reachable address.
    pub ip: Ipv4Addr,
    /// Measured round-trip time in milliseconds.
    pub rtt_ms: f64,
}

/// One SNMP enrichment result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnmpObservation {
    /// Hostname from sysName.
    pub hostname: Option<String>,
    /// Vendor parsed from sysDescr.
    pub vendor: Option<String>,
    /// Model parsed from sysDescr.
    pub model: Option<String>,
    /// Uptime in seconds from sysUpTime.
    pub uptime_seconds: Option<u64>,
}

// ============================================================================
// SECTION: Probe Traits
// ============================================================================

/// Single-address ARP probe.
#[async_trait]
pub trait ArpProbe: Send + Sync {
    /// Probes one address; `None` when there is no responder.
    async fn probe(&self, ip: Ipv4Addr) -> Option<ArpObservation>;
}

/// Single-address ICMP echo probe.
#[async_trait]
pub trait IcmpProbe: Send + Sync {
    /// Pings one address; `None` when unreachable.
    async fn probe(&self, ip: Ipv4Addr) -> Option<IcmpObservation>;
}

/// Single-address SNMP enrichment probe.
#[async_trait]
pub trait SnmpProbe: Send + Sync {
    /// Queries one address; `None` when SNMP does not answer. Failures are
    /// expected and never fail a cycle.
    async fn probe(&self, ip: Ipv4Addr) -> Option<SnmpObservation>;
}

// ============================================================================
// SECTION: Ping Command Probe
// ============================================================================

/// ICMP probe shelling out to the system `ping` binary.
///
/// # Invariants
/// - One echo request per probe; the timeout bounds the subprocess.
pub struct PingCommandProbe {
    /// Per-probe timeout in whole seconds.
    timeout_seconds: u64,
}

impl PingCommandProbe {
    /// Creates a probe with the given per-address timeout.
    #[must_use]
    pub const fn new(timeout_seconds: u64) -> Self {
        Self {
            timeout_seconds,
        }
    }
}

#[async_trait]
impl IcmpProbe for PingCommandProbe {
    async fn probe(&self, ip: Ipv4Addr) -> Option<IcmpObservation> {
        let output = tokio::time::timeout(
            Duration::from_secs(self.timeout_seconds + 1),
            Command::new("ping")
                .arg("-c")
                .arg("1")
                .arg("-W")
                .arg(self.timeout_seconds.to_string())
                .arg(ip.to_string())
                .output(),
        )
        .await
        .ok()?
        .ok()?;

        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let rtt_ms = parse_rtt_ms(&stdout).unwrap_or(1.0);
        debug!(%ip, rtt_ms, "icmp responder");
        Some(IcmpObservation {
            ip,
            rtt_ms,
        })
    }
}

/// Extracts the first `time=<value> ms` figure from ping output.
fn parse_rtt_ms(output: &str) -> Option<f64> {
    let start = output.find("time=")? + "time=".len();
    let rest = &output[start..];
    let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    rest[..end].parse().ok()
}

// ============================================================================
// SECTION: Table-Driven Probes
// ============================================================================

/// ARP probe answering from a swappable address table.
///
/// # Invariants
/// - Addresses absent from the table never respond.
pub struct StaticArpProbe {
    /// Responder table, swappable between cycles.
    entries: Mutex<HashMap<Ipv4Addr, MacAddress>>,
    /// Time source for sighting stamps.
    clock: Arc<dyn Clock>,
}

impl StaticArpProbe {
    /// Creates a probe over a responder table.
    #[must_use]
    pub fn new(entries: HashMap<Ipv4Addr, MacAddress>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(entries),
            clock,
        }
    }

    /// Replaces the responder table (e.g. between simulated cycles).
    pub fn set_entries(&self, entries: HashMap<Ipv4Addr, MacAddress>) {
        if let Ok(mut table) = self.entries.lock() {
            *table = entries;
        }
    }
}

#[async_trait]
impl ArpProbe for StaticArpProbe {
    async fn probe(&self, ip: Ipv4Addr) -> Option<ArpObservation> {
        let mac = self.entries.lock().ok()?.get(&ip).cloned()?;
        Some(ArpObservation {
            ip,
            mac,
            observed_at: self.clock.now(),
        })
    }
}

/// ICMP probe answering from a fixed reachability table.
pub struct StaticIcmpProbe {
    /// Reachable addresses with their RTTs.
    reachable: HashMap<Ipv4Addr, f64>,
}

impl StaticIcmpProbe {
    /// Creates a probe over a fixed reachability table.
    #[must_use]
    pub fn new(reachable: HashMap<Ipv4Addr, f64>) -> Self {
        Self {
            reachable,
        }
    }
}

#[async_trait]
impl IcmpProbe for StaticIcmpProbe {
    async fn probe(&self, ip: Ipv4Addr) -> Option<IcmpObservation> {
        self.reachable.get(&ip).map(|rtt_ms| IcmpObservation {
            ip,
            rtt_ms: *rtt_ms,
        })
    }
}

/// SNMP probe answering from a fixed enrichment table.
pub struct StaticSnmpProbe {
    /// Enrichment by address.
    info: HashMap<Ipv4Addr, SnmpObservation>,
}

impl StaticSnmpProbe {
    /// Creates a probe over a fixed enrichment table.
    #[must_use]
    pub fn new(info: HashMap<Ipv4Addr, SnmpObservation>) -> Self {
        Self {
            info,
        }
    }

    /// Creates a probe that never answers.
    #[must_use]
    pub fn silent() -> Self {
        Self {
            info: HashMap::new(),
        }
    }
}

#[async_trait]
impl SnmpProbe for StaticSnmpProbe {
    async fn probe(&self, ip: Ipv4Addr) -> Option<SnmpObservation> {
        self.info.get(&ip).cloned()
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::parse_rtt_ms;

    #[test]
    fn rtt_parses_from_typical_ping_output() {
        let output = "64 bytes from 192.168.1.7: icmp_seq=1 ttl=64 time=0.482 ms\n";
        assert_eq!(parse_rtt_ms(output), Some(0.482));
        assert_eq!(parse_rtt_ms("no time here"), None);
    }
}
