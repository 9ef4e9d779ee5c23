// crates/pdsno-controller/tests/hierarchy_flow.rs
// ============================================================================
// Module: Hierarchy Flow Tests
// Description: Admission, approval/execution, discovery, and policy flows
// across the three controller tiers.
// ============================================================================
//! ## Overview
//! Boots a Global, a Regional, and a Local controller on one bus with an
//! in-memory NIB and drives the full lifecycles: regional and local
//! admission, MEDIUM approval with token issuance and execution, failure
//! with auto-rollback, discovery aggregation over pub/sub, and policy
//! fan-out with acknowledgements.

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

use pdsno_approval::AuditEventKind;
use pdsno_bus::PubSubBus;
use pdsno_bus::RequestBus;
use pdsno_controller::ControllerError;
use pdsno_controller::GlobalConfig;
use pdsno_controller::GlobalController;
use pdsno_controller::LocalConfig;
use pdsno_controller::LocalController;
use pdsno_controller::RegionalConfig;
use pdsno_controller::RegionalController;
use pdsno_controller::SharedSecrets;
use pdsno_core::AdapterError;
use pdsno_core::ApplyOutcome;
use pdsno_core::ConfigState;
use pdsno_core::ControllerId;
use pdsno_core::ControllerRole;
use pdsno_core::ControllerStatus;
use pdsno_core::Device;
use pdsno_core::DeviceAdapter;
use pdsno_core::DeviceId;
use pdsno_core::DeviceStatus;
use pdsno_core::InMemoryNib;
use pdsno_core::MacAddress;
use pdsno_core::ManualClock;
use pdsno_core::NibStore;
use pdsno_core::Policy;
use pdsno_core::Region;
use pdsno_core::UtcTimestamp;
use pdsno_discovery::Cidr;
use pdsno_discovery::StaticArpProbe;
use pdsno_discovery::StaticIcmpProbe;
use pdsno_discovery::StaticSnmpProbe;
use pdsno_security::AdmissionPolicy;
use pdsno_security::BootstrapAuthority;
use serde_json::Map;
use serde_json::Value;

const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

/// Scripted adapter that rejects a set number of applies, then accepts.
struct ScriptedAdapter {
    failures_remaining: usize,
    running: Vec<String>,
    applied: Vec<Vec<String>>,
}

impl ScriptedAdapter {
    fn accepting() -> Self {
        Self {
            failures_remaining: 0,
            running: vec!["hostname switch-01".to_string()],
            applied: Vec::new(),
        }
    }

    fn failing_once() -> Self {
        Self {
            failures_remaining: 1,
            running: vec!["hostname switch-01".to_string()],
            applied: Vec::new(),
        }
    }
}

impl DeviceAdapter for ScriptedAdapter {
    fn connect(&mut self, _device: &Device) -> Result<(), AdapterError> {
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn translate_intent(&self, _intent: &Value) -> Result<Vec<String>, AdapterError> {
        Ok(Vec::new())
    }

    fn apply_config(&mut self, commands: &[String]) -> Result<ApplyOutcome, AdapterError> {
        self.applied.push(commands.to_vec());
        if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            Ok(ApplyOutcome {
                success: false,
                output: String::new(),
                error: Some("invalid input detected".to_string()),
            })
        } else {
            self.running = commands.to_vec();
            Ok(ApplyOutcome {
                success: true,
                output: "applied".to_string(),
                error: None,
            })
        }
    }

    fn get_running_config(&mut self) -> Result<Vec<String>, AdapterError> {
        Ok(self.running.clone())
    }

    fn verify_config(&mut self, _intent: &Value) -> Result<bool, AdapterError> {
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Three-tier rig on one bus. The Global stays alive through the handler
/// closures registered on the bus; locals are created per test.
struct Rig {
    clock: Arc<ManualClock>,
    nib: Arc<InMemoryNib>,
    bus: Arc<RequestBus>,
    pubsub: PubSubBus,
    regional: Arc<RegionalController>,
}

fn secrets() -> SharedSecrets {
    SharedSecrets::uniform(SECRET)
}

fn mint(temp_id: &str, role: ControllerRole) -> String {
    BootstrapAuthority::new(SECRET).mint(temp_id, &Region::new("zone-A"), role).unwrap()
}

fn rig() -> Rig {
    let clock = Arc::new(ManualClock::starting_at(
        UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap(),
    ));
    let nib = Arc::new(InMemoryNib::new(SECRET));
    let bus = Arc::new(RequestBus::new(clock.clone()));
    let pubsub = PubSubBus::new();

    let global = GlobalController::new(
        GlobalConfig {
            controller_id: ControllerId::new("global_cntl_1"),
            admission_policy: AdmissionPolicy::default(),
            secrets: secrets(),
        },
        nib.clone(),
        clock.clone(),
    )
    .unwrap();
    global.register(&bus);

    let regional = RegionalController::new(
        RegionalConfig {
            temp_id: ControllerId::new("temp-rc-001"),
            region: Region::new("zone-A"),
            parent_global: ControllerId::new("global_cntl_1"),
            metadata: Map::new(),
            secrets: secrets(),
        },
        nib.clone(),
        clock.clone(),
    )
    .unwrap();
    regional.register(&bus);

    Rig {
        clock,
        nib,
        bus,
        pubsub,
        regional,
    }
}

/// Admits the regional, then the local (against the promoted regional).
fn admit_both(rig: &Rig) -> (ControllerId, ControllerId) {
    let rc_id = rig
        .regional
        .request_admission(&rig.bus, &mint("temp-rc-001", ControllerRole::Regional))
        .unwrap();

    // The local points at the promoted regional identity.
    let local = LocalController::new(
        LocalConfig {
            temp_id: ControllerId::new("temp-lc-001"),
            region: Region::new("zone-A"),
            parent_regional: rc_id.clone(),
            subnet: Cidr::parse("192.168.1.0/28").unwrap(),
            metadata: Map::new(),
            secrets: secrets(),
            max_in_flight: 8,
            miss_budget: 2,
            execution_lock_ttl_seconds: 300,
        },
        rig.nib.clone(),
        rig.clock.clone(),
    )
    .unwrap();
    local.register(&rig.bus);
    let lc_id =
        local.request_admission(&rig.bus, &mint("temp-lc-001", ControllerRole::Local)).unwrap();
    (rc_id, lc_id)
}

fn seed_device(rig: &Rig) -> DeviceId {
    let device = Device {
        device_id: DeviceId::new("switch-01"),
        temp_scan_id: None,
        ip_address: Ipv4Addr::new(192, 168, 1, 7),
        mac_address: MacAddress::new("aa:bb:cc:dd:ee:01"),
        hostname: Some("switch-01".to_string()),
        vendor: None,
        device_type: None,
        status: DeviceStatus::Active,
        first_seen: None,
        last_seen: None,
        managed_by: None,
        region: Some(Region::new("zone-A")),
        version: 0,
        metadata: Map::new(),
    };
    rig.nib.upsert_device(&device).unwrap();
    DeviceId::new("switch-01")
}

/// S1: a regional candidate walks the full admission flow and lands in the
/// NIB as an active controller with an audit event.
#[test]
fn regional_admission_happy_path() {
    let rig = rig();
    let assigned = rig
        .regional
        .request_admission(&rig.bus, &mint("temp-rc-001", ControllerRole::Regional))
        .unwrap();
    assert_eq!(assigned.as_str(), "regional_cntl_zone-A_1");
    assert_eq!(rig.regional.current_id(), assigned);

    let record = rig.nib.get_controller(&assigned).unwrap().unwrap();
    assert_eq!(record.status, ControllerStatus::Active);
    assert_eq!(record.validated_by, Some(ControllerId::new("global_cntl_1")));
    assert!(record.validated_at.is_some());

    let events = rig.nib.events_by_type("CONTROLLER_VALIDATED").unwrap();
    assert_eq!(events.len(), 1);
    assert!(rig.nib.verify_event(&events[0]).unwrap());
}

/// A wrong bootstrap token is rejected and writes nothing to the NIB.
#[test]
fn regional_admission_rejects_bad_bootstrap_token() {
    let rig = rig();
    let result = rig.regional.request_admission(&rig.bus, &"0".repeat(64));
    assert!(matches!(result, Err(ControllerError::Admission(reason))
        if reason == "INVALID_BOOTSTRAP_TOKEN"));
    assert!(rig.nib.recent_events(10).unwrap().is_empty());
}

/// Local admission runs under the regional's delegated authority.
#[test]
fn local_admission_under_delegation() {
    let rig = rig();
    let (rc_id, lc_id) = admit_both(&rig);
    assert_eq!(rc_id.as_str(), "regional_cntl_zone-A_1");
    assert_eq!(lc_id.as_str(), "local_cntl_zone-A_1");

    let record = rig.nib.get_controller(&lc_id).unwrap().unwrap();
    assert_eq!(record.validated_by, Some(rc_id));
}

/// S4: a MEDIUM config walks propose → regional approval → token issue →
/// verified execution, with the audit trail recording each step in order.
#[test]
fn medium_config_approval_and_execution() {
    let rig = rig();
    let (_, lc_id) = admit_both(&rig);
    let device = seed_device(&rig);

    let local = admitted_local(&rig, &lc_id);

    let config_id = local
        .propose_config(
            &rig.bus,
            &device,
            vec!["vlan 100".to_string(), "name Engineering".to_string()],
        )
        .unwrap();

    let stored = rig.nib.get_config(&config_id).unwrap().unwrap();
    assert_eq!(stored.state, ConfigState::Approved);
    assert!(stored.execution_token_id.is_some());

    let mut adapter = ScriptedAdapter::accepting();
    let report = local.execute_config(&config_id, &mut adapter).unwrap();
    assert!(report.success);
    assert!(!report.rolled_back);
    assert_eq!(adapter.applied.len(), 1);

    let stored = rig.nib.get_config(&config_id).unwrap().unwrap();
    assert_eq!(stored.state, ConfigState::Executed);
    assert!(stored.backup_id.is_some());

    let kinds: Vec<AuditEventKind> = local
        .audit()
        .by_resource(config_id.as_str())
        .iter()
        .map(|record| record.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            AuditEventKind::ConfigCreated,
            AuditEventKind::ConfigSubmitted,
            AuditEventKind::ConfigApproved,
            AuditEventKind::ConfigExecuted,
        ]
    );
    assert_eq!(local.audit().by_kind(AuditEventKind::TokenVerified).len(), 1);
    assert_eq!(rig.regional.audit().by_kind(AuditEventKind::TokenIssued).len(), 1);
}

/// A failed apply triggers auto-rollback to the pre-execution backup.
#[test]
fn failed_execution_rolls_back_from_backup() {
    let rig = rig();
    let (_, lc_id) = admit_both(&rig);
    let device = seed_device(&rig);
    let local = admitted_local(&rig, &lc_id);

    let config_id = local
        .propose_config(&rig.bus, &device, vec!["vlan 200".to_string()])
        .unwrap();

    let mut adapter = ScriptedAdapter::failing_once();
    let report = local.execute_config(&config_id, &mut adapter).unwrap();
    assert!(!report.success);
    assert!(report.rolled_back);

    // The rollback re-applied the pre-execution running config.
    assert_eq!(adapter.applied.len(), 2);
    assert_eq!(adapter.applied[1], vec!["hostname switch-01".to_string()]);

    let stored = rig.nib.get_config(&config_id).unwrap().unwrap();
    assert_eq!(stored.state, ConfigState::RolledBack);
    assert_eq!(local.audit().by_kind(AuditEventKind::ConfigRolledBack).len(), 1);
}

/// A second execution of the same config finds no approval on file.
#[test]
fn execution_is_single_shot_per_approval() {
    let rig = rig();
    let (_, lc_id) = admit_both(&rig);
    let device = seed_device(&rig);
    let local = admitted_local(&rig, &lc_id);

    let config_id =
        local.propose_config(&rig.bus, &device, vec!["vlan 300".to_string()]).unwrap();
    let mut adapter = ScriptedAdapter::accepting();
    local.execute_config(&config_id, &mut adapter).unwrap();

    let second = local.execute_config(&config_id, &mut adapter);
    assert!(matches!(second, Err(ControllerError::Approval(_))));
}

/// Discovery reports flow over pub/sub into the regional aggregate and on
/// to the global as a summary.
#[tokio::test]
async fn discovery_reports_aggregate_regionally() {
    let rig = rig();
    let (_, lc_id) = admit_both(&rig);
    let local = admitted_local(&rig, &lc_id);
    rig.regional.subscribe_discovery(&rig.pubsub);

    let mut arp_entries = HashMap::new();
    arp_entries.insert(Ipv4Addr::new(192, 168, 1, 1), MacAddress::new("aa:aa:aa:aa:aa:01"));
    let mut reachable = HashMap::new();
    reachable.insert(Ipv4Addr::new(192, 168, 1, 1), 0.6);
    local.init_discovery(
        Arc::new(StaticArpProbe::new(arp_entries, rig.clock.clone())),
        Arc::new(StaticIcmpProbe::new(reachable)),
        Arc::new(StaticSnmpProbe::silent()),
    );

    let summary =
        local.run_discovery_cycle(Some(&rig.pubsub), Some(rig.bus.as_ref())).await.unwrap();
    assert_eq!(summary.new_devices, 1);

    let reports = rig.regional.discovery_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].get("lc_id").and_then(Value::as_str),
        Some("local_cntl_zone-A_1")
    );

    rig.regional.send_summary(&rig.bus).unwrap();
}

/// Policy updates fan out over the region topic and come back as acks.
#[test]
fn policy_updates_are_acknowledged() {
    let rig = rig();
    let (_, lc_id) = admit_both(&rig);
    let local = admitted_local(&rig, &lc_id);
    local.subscribe_policy(&rig.pubsub, &rig.bus);

    let policy = Policy {
        policy_id: "policy-001".to_string(),
        name: "quarantine-unknown".to_string(),
        rule_set: serde_json::json!({"quarantine_unknown_devices": true}),
        scope: "zone-A".to_string(),
        active: true,
        created_by: rig.regional.current_id(),
        created_at: None,
        updated_at: None,
        version: 0,
    };
    assert!(rig.regional.publish_policy(&rig.pubsub, &policy).unwrap());

    let received = local.current_policy().unwrap();
    assert_eq!(received.get("policy_id").and_then(Value::as_str), Some("policy-001"));
    assert_eq!(rig.regional.policy_acks(), vec![lc_id]);
}

/// Rebuilds a handle to the local controller admitted in `admit_both`.
fn admitted_local(rig: &Rig, lc_id: &ControllerId) -> Arc<LocalController> {
    // `admit_both` created and admitted a fresh local; recreate an
    // equivalent runtime bound to the assigned id for driving the flows.
    let local = LocalController::new(
        LocalConfig {
            temp_id: lc_id.clone(),
            region: Region::new("zone-A"),
            parent_regional: ControllerId::new("regional_cntl_zone-A_1"),
            subnet: Cidr::parse("192.168.1.0/28").unwrap(),
            metadata: Map::new(),
            secrets: secrets(),
            max_in_flight: 8,
            miss_budget: 2,
            execution_lock_ttl_seconds: 300,
        },
        rig.nib.clone(),
        rig.clock.clone(),
    )
    .unwrap();
    local.register(&rig.bus);
    local
}
