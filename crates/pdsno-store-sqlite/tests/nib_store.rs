// crates/pdsno-store-sqlite/tests/nib_store.rs
// ============================================================================
// Module: SQLite NIB Tests
// Description: Optimistic concurrency, event immutability, and lock tests.
// ============================================================================
//! ## Overview
//! Validates the store contract against a real database file: version CAS,
//! schema-enforced event immutability, tamper detection, and lock TTLs.

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

use pdsno_core::Controller;
use pdsno_core::ControllerId;
use pdsno_core::ControllerRole;
use pdsno_core::ControllerStatus;
use pdsno_core::Device;
use pdsno_core::DeviceId;
use pdsno_core::DeviceStatus;
use pdsno_core::EventId;
use pdsno_core::LockType;
use pdsno_core::MacAddress;
use pdsno_core::NibError;
use pdsno_core::NibEvent;
use pdsno_core::NibStore;
use pdsno_core::Region;
use pdsno_core::UtcTimestamp;
use pdsno_store_sqlite::SqliteNib;
use pdsno_store_sqlite::SqliteNibConfig;
use serde_json::Map;
use serde_json::json;
use tempfile::TempDir;

const EVENT_SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

fn open_store(dir: &TempDir) -> SqliteNib {
    let config = SqliteNibConfig::at_path(dir.path().join("nib.db"));
    SqliteNib::open(&config, EVENT_SECRET).unwrap()
}

fn sample_device(mac: &str, last_octet: u8) -> Device {
    Device {
        device_id: DeviceId::new(""),
        temp_scan_id: Some("scan-001".to_string()),
        ip_address: [192, 168, 1, last_octet].into(),
        mac_address: MacAddress::new(mac),
        hostname: None,
        vendor: None,
        device_type: None,
        status: DeviceStatus::Active,
        first_seen: Some(UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap()),
        last_seen: Some(UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap()),
        managed_by: Some(ControllerId::new("local_cntl_zone-A_1")),
        region: Some(Region::new("zone-A")),
        version: 0,
        metadata: Map::new(),
    }
}

/// Two readers at the same version: first upsert wins, second conflicts.
#[test]
fn optimistic_conflict_has_a_single_winner() {
    let dir = TempDir::new().unwrap();
    let nib = open_store(&dir);
    nib.upsert_device(&sample_device("aa:bb:cc:00:00:10", 10)).unwrap();

    let reader_a = nib.get_device_by_mac(&MacAddress::new("aa:bb:cc:00:00:10")).unwrap().unwrap();
    let reader_b = reader_a.clone();

    let mut update_a = reader_a;
    update_a.hostname = Some("sw-a".to_string());
    let receipt = nib.upsert_device(&update_a).unwrap();
    assert_eq!(receipt.version, 1);

    let mut update_b = reader_b;
    update_b.hostname = Some("sw-b".to_string());
    assert!(matches!(nib.upsert_device(&update_b), Err(NibError::Conflict)));
}

/// The MAC is the identity key: an IP change updates the same row.
#[test]
fn ip_change_does_not_change_identity() {
    let dir = TempDir::new().unwrap();
    let nib = open_store(&dir);
    let receipt = nib.upsert_device(&sample_device("aa:bb:cc:00:00:20", 20)).unwrap();

    let mut moved = sample_device("aa:bb:cc:00:00:20", 21);
    moved.version = 0;
    let second = nib.upsert_device(&moved).unwrap();
    assert_eq!(second.entity_id, receipt.entity_id);
    assert_eq!(second.version, 1);

    let stored = nib.get_device_by_mac(&MacAddress::new("aa:bb:cc:00:00:20")).unwrap().unwrap();
    assert_eq!(stored.ip_address, std::net::Ipv4Addr::new(192, 168, 1, 21));
}

/// Schema triggers reject both UPDATE and DELETE against the event log.
#[test]
fn event_log_is_immutable_at_the_storage_layer() {
    let dir = TempDir::new().unwrap();
    let nib = open_store(&dir);
    let mut details = Map::new();
    details.insert("assigned_id".to_string(), json!("regional_cntl_zone-A_1"));
    let event = NibEvent {
        event_id: EventId::new(""),
        event_type: "CONTROLLER_VALIDATED".to_string(),
        controller_id: ControllerId::new("global_cntl_1"),
        timestamp: UtcTimestamp::from_unix_seconds(1_700_000_100).unwrap(),
        details,
        signature: None,
    };
    let event_id = nib.write_event(&event).unwrap();
    drop(nib);

    let raw = rusqlite::Connection::open(dir.path().join("nib.db")).unwrap();
    let update = raw.execute(
        "UPDATE events SET event_type = 'FORGED' WHERE event_id = ?1",
        rusqlite::params![event_id.as_str()],
    );
    assert!(update.is_err());
    let delete =
        raw.execute("DELETE FROM events WHERE event_id = ?1", rusqlite::params![event_id.as_str()]);
    assert!(delete.is_err());
}

/// Stored events verify; an out-of-band field change breaks the tag.
#[test]
fn event_tags_expose_tampering() {
    let dir = TempDir::new().unwrap();
    let nib = open_store(&dir);
    let event = NibEvent {
        event_id: EventId::new(""),
        event_type: "CONFIG_EXECUTED".to_string(),
        controller_id: ControllerId::new("local_cntl_zone-A_1"),
        timestamp: UtcTimestamp::from_unix_seconds(1_700_000_200).unwrap(),
        details: Map::new(),
        signature: None,
    };
    nib.write_event(&event).unwrap();

    let stored = nib.events_by_type("CONFIG_EXECUTED").unwrap().remove(0);
    assert!(nib.verify_event(&stored).unwrap());

    let mut forged = stored;
    forged.controller_id = ControllerId::new("intruder");
    assert!(!nib.verify_event(&forged).unwrap());
}

/// Lock acquisition excludes a second holder until the TTL passes.
#[test]
fn locks_exclude_until_expiry() {
    let dir = TempDir::new().unwrap();
    let nib = open_store(&dir);
    let now = UtcTimestamp::from_unix_seconds(1_700_000_300).unwrap();
    let holder_a = ControllerId::new("regional_cntl_zone-A_1");
    let holder_b = ControllerId::new("regional_cntl_zone-A_2");

    nib.acquire_lock("config-7", LockType::ConfigApproval, &holder_a, 120, now).unwrap();
    let denied = nib.acquire_lock("config-7", LockType::ConfigApproval, &holder_b, 120, now);
    assert!(matches!(denied, Err(NibError::Locked { .. })));

    let later = now.plus_seconds(121);
    assert!(nib.check_lock("config-7", LockType::ConfigApproval, later).unwrap().is_none());
    assert!(nib.acquire_lock("config-7", LockType::ConfigApproval, &holder_b, 120, later).is_ok());
}

/// Controllers persist across a close/reopen cycle and seed the sequence.
#[test]
fn controllers_persist_and_seed_admission_sequence() {
    let dir = TempDir::new().unwrap();
    {
        let nib = open_store(&dir);
        let controller = Controller {
            controller_id: ControllerId::new("regional_cntl_zone-A_4"),
            role: ControllerRole::Regional,
            region: Some(Region::new("zone-A")),
            status: ControllerStatus::Active,
            validated_by: Some(ControllerId::new("global_cntl_1")),
            validated_at: Some(UtcTimestamp::from_unix_seconds(1_700_000_400).unwrap()),
            public_key: Some("pk".to_string()),
            certificate: Some("{}".to_string()),
            capabilities: vec!["discovery".to_string()],
            metadata: Map::new(),
            version: 0,
        };
        nib.upsert_controller(&controller).unwrap();
    }

    let reopened = open_store(&dir);
    assert_eq!(reopened.max_sequence_for_role(ControllerRole::Regional).unwrap(), 4);
    let listed = reopened.controllers_by_region(&Region::new("zone-A")).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].capabilities, vec!["discovery".to_string()]);
}
