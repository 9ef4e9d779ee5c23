// crates/pdsno-discovery/src/pipeline.rs
// ============================================================================
// Module: Discovery Pipeline
// Description: Cycle orchestration, merge-by-MAC, delta cache, NIB writes.
// Purpose: Turn raw probe results into NIB state and delta-only reports.
// Dependencies: pdsno-core, serde, serde_json, thiserror, tokio, tracing,
// crate::{probe, scanner}
// ============================================================================

//! ## Overview
//! One cycle runs ARP over the subnet, then ICMP and SNMP concurrently over
//! the responders, merges everything by MAC, diffs the MAC set against the
//! previous cycle's cache, and upserts each sighted device (status `active`
//! when reachable, `quarantined` otherwise). Devices absent for more than
//! the miss budget are marked `inactive` in the NIB. Per-device write
//! failures are logged and never abort the cycle.
//!
//! The cycle returns a summary plus the delta-only report payload (when any
//! of new/updated/inactive is non-empty); the owning controller decides
//! whether to publish it over pub/sub or send it unicast.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use pdsno_core::Clock;
use pdsno_core::ControllerId;
use pdsno_core::Device;
use pdsno_core::DeviceId;
use pdsno_core::DeviceStatus;
use pdsno_core::MacAddress;
use pdsno_core::NibStore;
use pdsno_core::Region;
use pdsno_core::UtcTimestamp;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::probe::ArpObservation;
use crate::probe::ArpProbe;
use crate::probe::IcmpObservation;
use crate::probe::IcmpProbe;
use crate::probe::SnmpObservation;
use crate::probe::SnmpProbe;
use crate::scanner;
use crate::scanner::Cidr;

// ============================================================================
// SECTION: Merged Devices
// ============================================================================

/// One device after merging ARP, ICMP, and SNMP results by MAC.
///
/// # Invariants
/// - `reachable` is true iff an ICMP observation existed for the IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedDevice {
    /// Current address.
    pub ip: Ipv4Addr,
    /// Identity key.
    pub mac: MacAddress,
    /// Sighting time from the ARP pass.
    pub last_seen: UtcTimestamp,
    /// ICMP reachability.
    pub reachable: bool,
    /// Round-trip time when reachable.
    pub rtt_ms: Option<f64>,
    /// Hostname from SNMP.
    pub hostname: Option<String>,
    /// Vendor from SNMP.
    pub vendor: Option<String>,
    /// Model from SNMP.
    pub model: Option<String>,
    /// Uptime from SNMP.
    pub uptime_seconds: Option<u64>,
}

/// Merges the three scan result sets, keyed by MAC.
#[must_use]
pub fn merge_by_mac(
    arp: &[ArpObservation],
    icmp: &[IcmpObservation],
    snmp: &[(Ipv4Addr, SnmpObservation)],
) -> Vec<MergedDevice> {
    let icmp_by_ip: HashMap<Ipv4Addr, &IcmpObservation> =
        icmp.iter().map(|observation| (observation.ip, observation)).collect();
    let snmp_by_ip: HashMap<Ipv4Addr, &SnmpObservation> =
        snmp.iter().map(|(ip, observation)| (*ip, observation)).collect();

    arp.iter()
        .map(|sighting| {
            let reachability = icmp_by_ip.get(&sighting.ip);
            let enrichment = snmp_by_ip.get(&sighting.ip);
            MergedDevice {
                ip: sighting.ip,
                mac: sighting.mac.clone(),
                last_seen: sighting.observed_at,
                reachable: reachability.is_some(),
                rtt_ms: reachability.map(|observation| observation.rtt_ms),
                hostname: enrichment.and_then(|observation| observation.hostname.clone()),
                vendor: enrichment.and_then(|observation| observation.vendor.clone()),
                model: enrichment.and_then(|observation| observation.model.clone()),
                uptime_seconds: enrichment.and_then(|observation| observation.uptime_seconds),
            }
        })
        .collect()
}

// ============================================================================
// SECTION: Delta Cache
// ============================================================================

/// Salient fields cached per MAC for change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedSighting {
    /// Last known address.
    ip: Ipv4Addr,
    /// Last known hostname.
    hostname: Option<String>,
    /// Last known vendor.
    vendor: Option<String>,
    /// Consecutive cycles the device has been absent.
    misses: u32,
}

/// Delta of one cycle against the previous one.
///
/// # Invariants
/// - The four lists partition the union of current and previously seen MACs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaReport {
    /// Devices never seen before.
    pub new: Vec<MergedDevice>,
    /// Devices whose salient fields changed.
    pub updated: Vec<MergedDevice>,
    /// MACs seen previously but absent this cycle.
    pub inactive: Vec<InactiveDevice>,
    /// Devices present with identical salient fields.
    pub unchanged: Vec<MergedDevice>,
}

impl DeltaReport {
    /// Returns true when nothing changed this cycle.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.new.is_empty() && self.updated.is_empty() && self.inactive.is_empty()
    }
}

/// One device absent this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InactiveDevice {
    /// Identity key.
    pub mac: MacAddress,
    /// Last known address.
    pub ip: Ipv4Addr,
    /// Last known hostname.
    pub hostname: Option<String>,
}

/// Per-controller cache of the previous cycle's sightings.
///
/// # Invariants
/// - Miss counters reset to zero on every sighting.
#[derive(Debug, Default)]
pub struct DeltaCache {
    /// Cached salient fields by MAC.
    entries: HashMap<MacAddress, CachedSighting>,
}

impl DeltaCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Diffs the current cycle against the cache and updates it in place.
    /// Returns the delta plus the MACs whose consecutive misses now exceed
    /// the budget.
    pub fn apply_cycle(
        &mut self,
        current: &[MergedDevice],
        miss_budget: u32,
    ) -> (DeltaReport, Vec<MacAddress>) {
        let current_by_mac: HashMap<&MacAddress, &MergedDevice> =
            current.iter().map(|device| (&device.mac, device)).collect();

        let mut delta = DeltaReport::default();
        for device in current {
            match self.entries.get(&device.mac) {
                None => delta.new.push(device.clone()),
                Some(cached) => {
                    let changed = cached.ip != device.ip
                        || cached.hostname != device.hostname
                        || cached.vendor != device.vendor;
                    if changed {
                        delta.updated.push(device.clone());
                    } else {
                        delta.unchanged.push(device.clone());
                    }
                }
            }
        }

        let mut over_budget = Vec::new();
        for (mac, cached) in &mut self.entries {
            if current_by_mac.contains_key(mac) {
                continue;
            }
            delta.inactive.push(InactiveDevice {
                mac: mac.clone(),
                ip: cached.ip,
                hostname: cached.hostname.clone(),
            });
            cached.misses += 1;
            if cached.misses > miss_budget {
                over_budget.push(mac.clone());
            }
        }

        for device in current {
            self.entries.insert(
                device.mac.clone(),
                CachedSighting {
                    ip: device.ip,
                    hostname: device.hostname.clone(),
                    vendor: device.vendor.clone(),
                    misses: 0,
                },
            );
        }

        (delta, over_budget)
    }
}

// ============================================================================
// SECTION: Cycle Results
// ============================================================================

/// Errors raised by cycle orchestration.
///
/// # Invariants
/// - Per-device NIB failures are logged, not raised; only whole-cycle
///   conditions appear here.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CycleError {
    /// A cycle is already running for this subnet; the new one is dropped.
    #[error("discovery cycle already in progress")]
    InProgress,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    /// Devices sighted this cycle.
    pub devices_found: usize,
    /// Never-seen devices.
    pub new_devices: usize,
    /// Devices with changed salient fields.
    pub updated_devices: usize,
    /// Devices absent this cycle.
    pub inactive_devices: usize,
    /// Devices with no changes.
    pub unchanged_devices: usize,
    /// Wall-clock duration of the cycle in seconds.
    pub duration_seconds: f64,
    /// Delta-only report payload; `None` when the cycle was quiet.
    pub report: Option<Map<String, Value>>,
}

// ============================================================================
// SECTION: Pipeline
// ============================================================================

/// Clears the in-flight flag when a cycle ends by any path.
struct CycleGuard {
    /// Shared in-flight flag.
    flag: Arc<AtomicBool>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Discovery pipeline owned by one local controller.
///
/// # Invariants
/// - Cycles never overlap for the same pipeline instance.
/// - The delta cache is private to this pipeline.
pub struct DiscoveryPipeline {
    /// Owning local controller.
    controller_id: ControllerId,
    /// Region the controller governs.
    region: Region,
    /// Scanned subnet.
    subnet: Cidr,
    /// ARP probe.
    arp: Arc<dyn ArpProbe>,
    /// ICMP probe.
    icmp: Arc<dyn IcmpProbe>,
    /// SNMP probe.
    snmp: Arc<dyn SnmpProbe>,
    /// Destination store.
    nib: Arc<dyn NibStore>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Previous-cycle cache.
    cache: Mutex<DeltaCache>,
    /// Overlap guard.
    in_flight: Arc<AtomicBool>,
    /// Maximum outstanding probes per scan.
    max_in_flight: usize,
    /// Consecutive absences tolerated before a device goes inactive.
    miss_budget: u32,
}

impl DiscoveryPipeline {
    /// Creates a pipeline for one subnet.
    #[must_use]
    #[allow(clippy::too_many_arguments, reason = "Constructor wires every collaborator once.")]
    pub fn new(
        controller_id: ControllerId,
        region: Region,
        subnet: Cidr,
        arp: Arc<dyn ArpProbe>,
        icmp: Arc<dyn IcmpProbe>,
        snmp: Arc<dyn SnmpProbe>,
        nib: Arc<dyn NibStore>,
        clock: Arc<dyn Clock>,
        max_in_flight: usize,
        miss_budget: u32,
    ) -> Self {
        Self {
            controller_id,
            region,
            subnet,
            arp,
            icmp,
            snmp,
            nib,
            clock,
            cache: Mutex::new(DeltaCache::new()),
            in_flight: Arc::new(AtomicBool::new(false)),
            max_in_flight,
            miss_budget,
        }
    }

    /// Runs one discovery cycle.
    ///
    /// # Errors
    ///
    /// Returns [`CycleError::InProgress`] when a cycle is already running;
    /// the new cycle is dropped, not queued.
    pub async fn run_cycle(&self) -> Result<CycleSummary, CycleError> {
        if self.in_flight.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err()
        {
            warn!(subnet = %self.subnet, "cycle dropped: previous cycle still running");
            return Err(CycleError::InProgress);
        }
        let _guard = CycleGuard {
            flag: self.in_flight.clone(),
        };

        let started = self.clock.now();
        info!(subnet = %self.subnet, "discovery cycle started");

        let targets = self.subnet.hosts();
        let arp_results =
            scanner::arp_scan(self.arp.clone(), targets, self.max_in_flight).await;
        debug!(responders = arp_results.len(), "arp pass complete");

        let responder_ips: Vec<Ipv4Addr> =
            arp_results.iter().map(|observation| observation.ip).collect();
        let (icmp_results, snmp_results) = tokio::join!(
            scanner::icmp_scan(self.icmp.clone(), responder_ips.clone(), self.max_in_flight),
            scanner::snmp_scan(self.snmp.clone(), responder_ips, self.max_in_flight),
        );
        debug!(
            reachable = icmp_results.len(),
            enriched = snmp_results.len(),
            "icmp and snmp passes complete"
        );

        let merged = merge_by_mac(&arp_results, &icmp_results, &snmp_results);
        let (delta, over_budget) = match self.cache.lock() {
            Ok(mut cache) => cache.apply_cycle(&merged, self.miss_budget),
            // A poisoned cache only degrades delta quality; everything reads as new.
            Err(_) => DeltaCache::new().apply_cycle(&merged, self.miss_budget),
        };

        self.write_devices(&merged);
        self.retire_devices(&over_budget);

        let report = if delta.is_quiet() { None } else { Some(self.report_payload(&delta)) };
        let finished = self.clock.now();
        let summary = CycleSummary {
            devices_found: merged.len(),
            new_devices: delta.new.len(),
            updated_devices: delta.updated.len(),
            inactive_devices: delta.inactive.len(),
            unchanged_devices: delta.unchanged.len(),
            duration_seconds: finished.seconds_since(&started),
            report,
        };
        info!(
            devices = summary.devices_found,
            new = summary.new_devices,
            updated = summary.updated_devices,
            inactive = summary.inactive_devices,
            "discovery cycle complete"
        );
        Ok(summary)
    }

    /// Upserts every sighted device; failures are logged per device.
    fn write_devices(&self, merged: &[MergedDevice]) {
        for device in merged {
            let status =
                if device.reachable { DeviceStatus::Active } else { DeviceStatus::Quarantined };
            let mut metadata = Map::new();
            if let Some(rtt_ms) = device.rtt_ms {
                metadata.insert("rtt_ms".to_string(), json!(rtt_ms));
            }
            if let Some(uptime) = device.uptime_seconds {
                metadata.insert("uptime_seconds".to_string(), json!(uptime));
            }

            let existing = match self.nib.get_device_by_mac(&device.mac) {
                Ok(existing) => existing,
                Err(err) => {
                    warn!(mac = %device.mac, error = %err, "device lookup failed");
                    continue;
                }
            };
            let record = Device {
                device_id: existing
                    .as_ref()
                    .map_or_else(|| DeviceId::new(""), |found| found.device_id.clone()),
                temp_scan_id: existing.as_ref().and_then(|found| found.temp_scan_id.clone()),
                ip_address: device.ip,
                mac_address: device.mac.clone(),
                hostname: device.hostname.clone(),
                vendor: device.vendor.clone(),
                device_type: device.model.clone(),
                status,
                first_seen: existing
                    .as_ref()
                    .and_then(|found| found.first_seen)
                    .or(Some(device.last_seen)),
                last_seen: Some(device.last_seen),
                managed_by: Some(self.controller_id.clone()),
                region: Some(self.region.clone()),
                version: existing.as_ref().map_or(0, |found| found.version),
                metadata,
            };
            if let Err(err) = self.nib.upsert_device(&record) {
                warn!(mac = %device.mac, error = %err, "device upsert failed");
            }
        }
    }

    /// Marks devices over the miss budget as inactive in the NIB.
    fn retire_devices(&self, over_budget: &[MacAddress]) {
        for mac in over_budget {
            let existing = match self.nib.get_device_by_mac(mac) {
                Ok(Some(existing)) => existing,
                Ok(None) => continue,
                Err(err) => {
                    warn!(mac = %mac, error = %err, "retire lookup failed");
                    continue;
                }
            };
            if existing.status == DeviceStatus::Inactive {
                continue;
            }
            let mut retired = existing;
            retired.status = DeviceStatus::Inactive;
            if let Err(err) = self.nib.upsert_device(&retired) {
                warn!(mac = %mac, error = %err, "retire upsert failed");
            } else {
                info!(mac = %mac, "device marked inactive after miss budget");
            }
        }
    }

    /// Builds the delta-only report payload.
    fn report_payload(&self, delta: &DeltaReport) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("lc_id".to_string(), json!(self.controller_id.as_str()));
        payload.insert("subnet".to_string(), json!(self.subnet.to_string()));
        payload.insert("region".to_string(), json!(self.region.as_str()));
        if let Ok(stamp) = self.clock.now().to_rfc3339() {
            payload.insert("timestamp".to_string(), json!(stamp));
        }
        payload.insert("new_devices".to_string(), json!(delta.new));
        payload.insert("updated_devices".to_string(), json!(delta.updated));
        payload.insert("inactive_devices".to_string(), json!(delta.inactive));
        payload
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pdsno_core::MacAddress;
    use pdsno_core::UtcTimestamp;

    use super::DeltaCache;
    use super::MergedDevice;
    use super::merge_by_mac;
    use crate::probe::ArpObservation;
    use crate::probe::IcmpObservation;
    use crate::probe::SnmpObservation;

    fn merged(mac: &str, last_octet: u8) -> MergedDevice {
        MergedDevice {
            ip: Ipv4Addr::new(10, 0, 0, last_octet),
            mac: MacAddress::new(mac),
            last_seen: UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap(),
            reachable: true,
            rtt_ms: Some(1.0),
            hostname: None,
            vendor: None,
            model: None,
            uptime_seconds: None,
        }
    }

    #[test]
    fn merge_attaches_reachability_and_enrichment_by_ip() {
        let when = UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap();
        let arp = vec![
            ArpObservation {
                ip: Ipv4Addr::new(10, 0, 0, 1),
                mac: MacAddress::new("aa:aa:aa:aa:aa:01"),
                observed_at: when,
            },
            ArpObservation {
                ip: Ipv4Addr::new(10, 0, 0, 2),
                mac: MacAddress::new("aa:aa:aa:aa:aa:02"),
                observed_at: when,
            },
        ];
        let icmp = vec![IcmpObservation {
            ip: Ipv4Addr::new(10, 0, 0, 1),
            rtt_ms: 0.7,
        }];
        let snmp = vec![(
            Ipv4Addr::new(10, 0, 0, 1),
            SnmpObservation {
                hostname: Some("sw-1".to_string()),
                vendor: Some("Cisco".to_string()),
                model: Some("C9300".to_string()),
                uptime_seconds: Some(86_400),
            },
        )];

        let merged = merge_by_mac(&arp, &icmp, &snmp);
        assert_eq!(merged.len(), 2);
        assert!(merged[0].reachable);
        assert_eq!(merged[0].rtt_ms, Some(0.7));
        assert_eq!(merged[0].hostname.as_deref(), Some("sw-1"));
        assert!(!merged[1].reachable);
        assert!(merged[1].hostname.is_none());
    }

    #[test]
    fn delta_classifies_new_updated_inactive_unchanged() {
        let mut cache = DeltaCache::new();

        // Cycle 1: A and B are new.
        let cycle_one = vec![merged("aa:aa:aa:aa:aa:0a", 1), merged("aa:aa:aa:aa:aa:0b", 2)];
        let (delta, over) = cache.apply_cycle(&cycle_one, 3);
        assert_eq!(delta.new.len(), 2);
        assert!(delta.inactive.is_empty());
        assert!(over.is_empty());

        // Cycle 2: A unchanged, C new, B missing.
        let cycle_two = vec![merged("aa:aa:aa:aa:aa:0a", 1), merged("aa:aa:aa:aa:aa:0c", 3)];
        let (delta, over) = cache.apply_cycle(&cycle_two, 3);
        assert_eq!(delta.new.len(), 1);
        assert_eq!(delta.new[0].mac, MacAddress::new("aa:aa:aa:aa:aa:0c"));
        assert_eq!(delta.unchanged.len(), 1);
        assert_eq!(delta.inactive.len(), 1);
        assert_eq!(delta.inactive[0].mac, MacAddress::new("aa:aa:aa:aa:aa:0b"));
        assert!(over.is_empty());

        // Cycle 3: A moves address, which counts as updated.
        let cycle_three = vec![merged("aa:aa:aa:aa:aa:0a", 9), merged("aa:aa:aa:aa:aa:0c", 3)];
        let (delta, _) = cache.apply_cycle(&cycle_three, 3);
        assert_eq!(delta.updated.len(), 1);
        assert_eq!(delta.updated[0].mac, MacAddress::new("aa:aa:aa:aa:aa:0a"));
    }

    #[test]
    fn miss_budget_flags_devices_for_retirement() {
        let mut cache = DeltaCache::new();
        let (_, _) = cache.apply_cycle(&[merged("aa:aa:aa:aa:aa:0d", 4)], 1);

        let (_, over) = cache.apply_cycle(&[], 1);
        assert!(over.is_empty());
        let (delta, over) = cache.apply_cycle(&[], 1);
        assert_eq!(over, vec![MacAddress::new("aa:aa:aa:aa:aa:0d")]);
        assert_eq!(delta.inactive.len(), 1);
    }

    #[test]
    fn returning_device_resets_its_miss_counter() {
        let mut cache = DeltaCache::new();
        cache.apply_cycle(&[merged("aa:aa:aa:aa:aa:0e", 5)], 2);
        cache.apply_cycle(&[], 2);
        let (delta, _) = cache.apply_cycle(&[merged("aa:aa:aa:aa:aa:0e", 5)], 2);
        assert_eq!(delta.unchanged.len(), 1);

        cache.apply_cycle(&[], 2);
        let (_, over) = cache.apply_cycle(&[], 2);
        assert!(over.is_empty());
        let (_, over) = cache.apply_cycle(&[], 2);
        assert_eq!(over.len(), 1);
    }
}
