// crates/pdsno-discovery/src/scanner.rs
// ============================================================================
// Module: Subnet Scanner
// Description: CIDR parsing and bounded concurrent probe fan-out.
// Purpose: Probe every host address without unbounded outstanding requests.
// Dependencies: pdsno-core, tokio, thiserror
// ============================================================================

//! ## Overview
//! [`Cidr`] parses `a.b.c.d/prefix` notation and enumerates host addresses
//! (network and broadcast excluded below /31). The fan-out helpers spawn one
//! task per address with a semaphore capping outstanding probes, then join
//! everything; per-address failures simply drop out of the result set.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::probe::ArpObservation;
use crate::probe::ArpProbe;
use crate::probe::IcmpObservation;
use crate::probe::IcmpProbe;
use crate::probe::SnmpObservation;
use crate::probe::SnmpProbe;

// ============================================================================
// SECTION: CIDR
// ============================================================================

/// Errors raised while parsing CIDR notation.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    /// Input was not `address/prefix`.
    #[error("invalid cidr notation: {0}")]
    Notation(String),
    /// Prefix length outside 0..=32.
    #[error("invalid prefix length: {0}")]
    Prefix(u8),
}

/// IPv4 subnet in CIDR notation.
///
/// # Invariants
/// - The stored address is the network address (host bits cleared).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    /// Network address.
    network: Ipv4Addr,
    /// Prefix length.
    prefix: u8,
}

impl Cidr {
    /// Parses `a.b.c.d/prefix` notation; host bits are cleared.
    ///
    /// # Errors
    ///
    /// Returns [`CidrError`] for malformed notation or an out-of-range
    /// prefix.
    pub fn parse(input: &str) -> Result<Self, CidrError> {
        let (address_text, prefix_text) = input
            .split_once('/')
            .ok_or_else(|| CidrError::Notation(input.to_string()))?;
        let address = Ipv4Addr::from_str(address_text)
            .map_err(|_| CidrError::Notation(input.to_string()))?;
        let prefix: u8 =
            prefix_text.parse().map_err(|_| CidrError::Notation(input.to_string()))?;
        if prefix > 32 {
            return Err(CidrError::Prefix(prefix));
        }
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) };
        let network = Ipv4Addr::from(u32::from(address) & mask);
        Ok(Self {
            network,
            prefix,
        })
    }

    /// Returns the host addresses in the subnet. Network and broadcast
    /// addresses are excluded for prefixes below /31.
    #[must_use]
    pub fn hosts(&self) -> Vec<Ipv4Addr> {
        let base = u32::from(self.network);
        let span = 1_u64 << (32 - u32::from(self.prefix));
        match self.prefix {
            32 => vec![self.network],
            31 => vec![Ipv4Addr::from(base), Ipv4Addr::from(base + 1)],
            _ => (1..span.saturating_sub(1))
                .map(|offset| Ipv4Addr::from(base.wrapping_add(offset as u32)))
                .collect(),
        }
    }

    /// Returns the number of probe targets.
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.hosts().len()
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

// ============================================================================
// SECTION: Fan-Out
// ============================================================================

/// Probes every target over ARP with at most `max_in_flight` outstanding.
pub async fn arp_scan(
    probe: Arc<dyn ArpProbe>,
    targets: Vec<Ipv4Addr>,
    max_in_flight: usize,
) -> Vec<ArpObservation> {
    let semaphore = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut tasks = JoinSet::new();
    for ip in targets {
        let probe = probe.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            probe.probe(ip).await
        });
    }
    let mut observations = Vec::new();
    while let Some(result) = tasks.join_next().await {
        if let Ok(Some(observation)) = result {
            observations.push(observation);
        }
    }
    observations.sort_by_key(|observation| observation.ip);
    observations
}

/// Pings every target with at most `max_in_flight` outstanding.
pub async fn icmp_scan(
    probe: Arc<dyn IcmpProbe>,
    targets: Vec<Ipv4Addr>,
    max_in_flight: usize,
) -> Vec<IcmpObservation> {
    let semaphore = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut tasks = JoinSet::new();
    for ip in targets {
        let probe = probe.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            probe.probe(ip).await
        });
    }
    let mut observations = Vec::new();
    while let Some(result) = tasks.join_next().await {
        if let Ok(Some(observation)) = result {
            observations.push(observation);
        }
    }
    observations.sort_by_key(|observation| observation.ip);
    observations
}

/// Queries every target over SNMP with at most `max_in_flight` outstanding.
///
/// Results are keyed by address because enrichment attaches by IP during
/// the merge.
pub async fn snmp_scan(
    probe: Arc<dyn SnmpProbe>,
    targets: Vec<Ipv4Addr>,
    max_in_flight: usize,
) -> Vec<(Ipv4Addr, SnmpObservation)> {
    let semaphore = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut tasks = JoinSet::new();
    for ip in targets {
        let probe = probe.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            probe.probe(ip).await.map(|observation| (ip, observation))
        });
    }
    let mut observations = Vec::new();
    while let Some(result) = tasks.join_next().await {
        if let Ok(Some(observation)) = result {
            observations.push(observation);
        }
    }
    observations.sort_by_key(|(ip, _)| *ip);
    observations
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::Cidr;
    use super::CidrError;

    #[test]
    fn slash_24_excludes_network_and_broadcast() {
        let cidr = Cidr::parse("192.168.1.0/24").unwrap();
        let hosts = cidr.hosts();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn host_bits_are_cleared() {
        let cidr = Cidr::parse("10.0.0.77/30").unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.76/30");
        assert_eq!(cidr.host_count(), 2);
    }

    #[test]
    fn slash_31_and_32_are_point_links() {
        assert_eq!(Cidr::parse("10.0.0.0/31").unwrap().host_count(), 2);
        assert_eq!(Cidr::parse("10.0.0.9/32").unwrap().host_count(), 1);
    }

    #[test]
    fn malformed_notation_is_rejected() {
        assert!(matches!(Cidr::parse("10.0.0.0"), Err(CidrError::Notation(_))));
        assert!(matches!(Cidr::parse("10.0.0.0/40"), Err(CidrError::Prefix(40))));
        assert!(matches!(Cidr::parse("not-an-ip/24"), Err(CidrError::Notation(_))));
    }
}
