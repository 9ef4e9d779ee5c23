// crates/pdsno-discovery/tests/discovery_cycles.rs
// ============================================================================
// Module: Discovery Cycle Tests
// Description: End-to-end cycles over table-driven probes and an in-memory NIB.
// ============================================================================
//! ## Overview
//! Drives full discovery cycles and validates delta reporting, NIB status
//! assignment, identity stability across IP changes, and miss-budget
//! retirement.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use pdsno_core::ControllerId;
use pdsno_core::DeviceStatus;
use pdsno_core::InMemoryNib;
use pdsno_core::MacAddress;
use pdsno_core::ManualClock;
use pdsno_core::NibStore;
use pdsno_core::Region;
use pdsno_core::UtcTimestamp;
use pdsno_discovery::Cidr;
use pdsno_discovery::DiscoveryPipeline;
use pdsno_discovery::SnmpObservation;
use pdsno_discovery::StaticArpProbe;
use pdsno_discovery::StaticIcmpProbe;
use pdsno_discovery::StaticSnmpProbe;
use serde_json::Value;

/// Test rig bundling the pipeline with its swappable ARP table.
struct Rig {
    pipeline: DiscoveryPipeline,
    arp: Arc<StaticArpProbe>,
    nib: Arc<InMemoryNib>,
}

fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 1, last)
}

fn mac(last: &str) -> MacAddress {
    MacAddress::new(format!("aa:aa:aa:aa:aa:{last}"))
}

fn rig(reachable: &[(u8, f64)], miss_budget: u32) -> Rig {
    let clock = Arc::new(ManualClock::starting_at(
        UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap(),
    ));
    let nib = Arc::new(InMemoryNib::new(*b"0123456789abcdef0123456789abcdef"));
    let arp = Arc::new(StaticArpProbe::new(HashMap::new(), clock.clone()));

    let mut icmp_table = HashMap::new();
    for (last, rtt) in reachable {
        icmp_table.insert(ip(*last), *rtt);
    }
    let mut snmp_table = HashMap::new();
    snmp_table.insert(
        ip(1),
        SnmpObservation {
            hostname: Some("sw-core-1".to_string()),
            vendor: Some("Cisco".to_string()),
            model: Some("C9300".to_string()),
            uptime_seconds: Some(86_400),
        },
    );

    let pipeline = DiscoveryPipeline::new(
        ControllerId::new("local_cntl_zone-A_1"),
        Region::new("zone-A"),
        Cidr::parse("192.168.1.0/28").unwrap(),
        arp.clone(),
        Arc::new(StaticIcmpProbe::new(icmp_table)),
        Arc::new(StaticSnmpProbe::new(snmp_table)),
        nib.clone(),
        clock,
        8,
        miss_budget,
    );
    Rig {
        pipeline,
        arp,
        nib,
    }
}

/// Cycle 1 sees {A, B}; cycle 2 sees {A, C}: new {C}, inactive {B},
/// unchanged {A}; both cycles emit a report.
#[tokio::test]
async fn two_cycles_produce_the_expected_deltas() {
    let rig = rig(&[(1, 0.5), (2, 0.9), (3, 1.4)], 3);

    let mut table = HashMap::new();
    table.insert(ip(1), mac("0a"));
    table.insert(ip(2), mac("0b"));
    rig.arp.set_entries(table);

    let first = rig.pipeline.run_cycle().await.unwrap();
    assert_eq!(first.devices_found, 2);
    assert_eq!(first.new_devices, 2);
    assert!(first.report.is_some());

    let mut table = HashMap::new();
    table.insert(ip(1), mac("0a"));
    table.insert(ip(3), mac("0c"));
    rig.arp.set_entries(table);

    let second = rig.pipeline.run_cycle().await.unwrap();
    assert_eq!(second.new_devices, 1);
    assert_eq!(second.inactive_devices, 1);
    assert_eq!(second.unchanged_devices, 1);

    let report = second.report.unwrap();
    let new_devices = report.get("new_devices").and_then(Value::as_array).unwrap();
    assert_eq!(new_devices.len(), 1);
    let inactive = report.get("inactive_devices").and_then(Value::as_array).unwrap();
    assert_eq!(inactive[0].get("mac").and_then(Value::as_str), Some("aa:aa:aa:aa:aa:0b"));
    assert!(report.get("unchanged_devices").is_none());
}

/// A quiet cycle (identical sightings) produces no report.
#[tokio::test]
async fn quiet_cycle_emits_no_report() {
    let rig = rig(&[(1, 0.5)], 3);
    let mut table = HashMap::new();
    table.insert(ip(1), mac("0a"));
    rig.arp.set_entries(table);

    assert!(rig.pipeline.run_cycle().await.unwrap().report.is_some());
    let quiet = rig.pipeline.run_cycle().await.unwrap();
    assert_eq!(quiet.unchanged_devices, 1);
    assert!(quiet.report.is_none());
}

/// Reachable devices land active, unreachable ones quarantined, and SNMP
/// enrichment flows into the record.
#[tokio::test]
async fn nib_records_reflect_reachability_and_enrichment() {
    let rig = rig(&[(1, 0.5)], 3);
    let mut table = HashMap::new();
    table.insert(ip(1), mac("0a"));
    table.insert(ip(2), mac("0b"));
    rig.arp.set_entries(table);

    rig.pipeline.run_cycle().await.unwrap();

    let active = rig.nib.get_device_by_mac(&mac("0a")).unwrap().unwrap();
    assert_eq!(active.status, DeviceStatus::Active);
    assert_eq!(active.hostname.as_deref(), Some("sw-core-1"));
    assert_eq!(active.vendor.as_deref(), Some("Cisco"));
    assert_eq!(active.device_type.as_deref(), Some("C9300"));
    assert_eq!(active.metadata.get("rtt_ms"), Some(&Value::from(0.5)));
    assert_eq!(active.managed_by, Some(ControllerId::new("local_cntl_zone-A_1")));

    let quarantined = rig.nib.get_device_by_mac(&mac("0b")).unwrap().unwrap();
    assert_eq!(quarantined.status, DeviceStatus::Quarantined);
}

/// An IP change updates the same NIB row and reports the device as updated.
#[tokio::test]
async fn ip_change_keeps_identity_and_reports_updated() {
    let rig = rig(&[(1, 0.5), (4, 0.8)], 3);
    let mut table = HashMap::new();
    table.insert(ip(1), mac("0a"));
    rig.arp.set_entries(table);
    rig.pipeline.run_cycle().await.unwrap();
    let before = rig.nib.get_device_by_mac(&mac("0a")).unwrap().unwrap();

    let mut table = HashMap::new();
    table.insert(ip(4), mac("0a"));
    rig.arp.set_entries(table);
    let summary = rig.pipeline.run_cycle().await.unwrap();
    assert_eq!(summary.updated_devices, 1);

    let after = rig.nib.get_device_by_mac(&mac("0a")).unwrap().unwrap();
    assert_eq!(after.device_id, before.device_id);
    assert_eq!(after.ip_address, ip(4));
    assert_eq!(after.version, before.version + 1);
    assert_eq!(after.first_seen, before.first_seen);
}

/// Devices absent beyond the miss budget are retired to inactive.
#[tokio::test]
async fn miss_budget_retires_devices_in_the_nib() {
    let rig = rig(&[(1, 0.5)], 1);
    let mut table = HashMap::new();
    table.insert(ip(1), mac("0a"));
    rig.arp.set_entries(table);
    rig.pipeline.run_cycle().await.unwrap();

    rig.arp.set_entries(HashMap::new());
    rig.pipeline.run_cycle().await.unwrap();
    let after_one_miss = rig.nib.get_device_by_mac(&mac("0a")).unwrap().unwrap();
    assert_eq!(after_one_miss.status, DeviceStatus::Active);

    rig.pipeline.run_cycle().await.unwrap();
    let after_two_misses = rig.nib.get_device_by_mac(&mac("0a")).unwrap().unwrap();
    assert_eq!(after_two_misses.status, DeviceStatus::Inactive);
}
