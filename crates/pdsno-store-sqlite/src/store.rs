// crates/pdsno-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite NIB Store
// Description: Durable NibStore backed by SQLite with CAS versioning.
// Purpose: Persist network state with conflict detection and an immutable
// event log.
// Dependencies: pdsno-core, rusqlite, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! [`SqliteNib`] implements [`NibStore`] over a single SQLite database.
//! Optimistic concurrency uses `UPDATE … WHERE id = ? AND version = ?`;
//! zero matched rows surfaces [`NibError::Conflict`] and the caller decides
//! whether to re-read and retry. Schema triggers reject every UPDATE and
//! DELETE against the `events` table, and each event row carries an
//! HMAC-SHA256 tag so out-of-band edits are detectable.
//!
//! Security posture: database contents are untrusted on load; event tags
//! must be re-verified before trusting historical records.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use pdsno_core::ConfigId;
use pdsno_core::ConfigRecord;
use pdsno_core::ConfigState;
use pdsno_core::Controller;
use pdsno_core::ControllerId;
use pdsno_core::ControllerRole;
use pdsno_core::ControllerStatus;
use pdsno_core::Device;
use pdsno_core::DeviceId;
use pdsno_core::DeviceStatus;
use pdsno_core::EventId;
use pdsno_core::LockId;
use pdsno_core::LockType;
use pdsno_core::MacAddress;
use pdsno_core::NibError;
use pdsno_core::NibEvent;
use pdsno_core::NibLock;
use pdsno_core::NibStore;
use pdsno_core::Policy;
use pdsno_core::Region;
use pdsno_core::SensitivityLevel;
use pdsno_core::UpsertReceipt;
use pdsno_core::UtcTimestamp;
use pdsno_core::hashing;
use pdsno_core::parse_admission_sequence;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;
use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Schema version stamped into `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout applied to the connection (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// NIB schema: versioned entity tables, the immutable event log, and
/// coordination locks, with the indexes the query surface relies on.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY,
    temp_scan_id TEXT,
    ip_address TEXT NOT NULL,
    mac_address TEXT UNIQUE NOT NULL,
    hostname TEXT,
    vendor TEXT,
    device_type TEXT,
    status TEXT NOT NULL DEFAULT 'discovered',
    first_seen TEXT,
    last_seen TEXT,
    managed_by_lc TEXT,
    region TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS controllers (
    controller_id TEXT PRIMARY KEY,
    role TEXT NOT NULL,
    region TEXT,
    status TEXT NOT NULL DEFAULT 'validating',
    validated_by TEXT,
    validated_at TEXT,
    public_key TEXT,
    certificate TEXT,
    capabilities TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    version INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS configs (
    config_id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    config_lines TEXT NOT NULL,
    requester TEXT NOT NULL,
    sensitivity TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'DRAFT',
    approval_request_id TEXT,
    execution_token_id TEXT,
    backup_id TEXT,
    execution_result TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (device_id) REFERENCES devices(device_id)
);

CREATE TABLE IF NOT EXISTS policies (
    policy_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    rule_set TEXT NOT NULL,
    scope TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_by TEXT NOT NULL,
    created_at TEXT,
    updated_at TEXT,
    version INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    controller_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    details TEXT NOT NULL,
    signature TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS prevent_event_update
BEFORE UPDATE ON events
BEGIN
    SELECT RAISE(FAIL, 'event log is immutable: updates not allowed');
END;

CREATE TRIGGER IF NOT EXISTS prevent_event_delete
BEFORE DELETE ON events
BEGIN
    SELECT RAISE(FAIL, 'event log is immutable: deletions not allowed');
END;

CREATE TABLE IF NOT EXISTS locks (
    lock_id TEXT PRIMARY KEY,
    subject_id TEXT NOT NULL,
    lock_type TEXT NOT NULL,
    held_by TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_devices_mac ON devices(mac_address);
CREATE INDEX IF NOT EXISTS idx_devices_region ON devices(region);
CREATE INDEX IF NOT EXISTS idx_controllers_region ON controllers(region);
CREATE INDEX IF NOT EXISTS idx_configs_device ON configs(device_id);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_controller ON events(controller_id);
CREATE INDEX IF NOT EXISTS idx_locks_subject ON locks(subject_id, lock_type);
";

// ============================================================================
// SECTION: Config
// ============================================================================

/// SQLite journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to SQLite `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteJournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteJournalMode {
    /// Returns the SQLite pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// Configuration for the SQLite NIB store.
///
/// # Invariants
/// - `path` must resolve to a file path (not a directory).
/// - `busy_timeout_ms` is interpreted as milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteNibConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// SQLite journal mode.
    #[serde(default)]
    pub journal_mode: SqliteJournalMode,
}

impl SqliteNibConfig {
    /// Builds a config with defaults for the given database path.
    #[must_use]
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteJournalMode::default(),
        }
    }
}

/// Returns the default busy timeout for SQLite connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while opening or migrating the store.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Database could not be opened.
    #[error("open failure: {0}")]
    Open(String),
    /// The on-disk schema version is not supported by this build.
    #[error("unsupported schema version {found} (expected {expected})")]
    SchemaVersion {
        /// Version found in the database.
        found: i64,
        /// Version this build writes.
        expected: i64,
    },
    /// Schema migration failed.
    #[error("migration failure: {0}")]
    Migration(String),
}

/// Returns `len` lowercase hex characters of fresh random material for
/// store-assigned identifiers.
fn short_uuid(len: usize) -> String {
    hashing::random_hex(len.div_ceil(2)).chars().take(len).collect()
}

/// Maps a rusqlite error to the store contract error taxonomy.
fn map_sql_error(err: &rusqlite::Error) -> NibError {
    let text = err.to_string();
    if text.contains("immutable") || text.contains("UNIQUE constraint") || text.contains("FOREIGN KEY") {
        NibError::ConstraintViolation(text)
    } else {
        NibError::Storage(text)
    }
}

// ============================================================================
// SECTION: Row Codecs
// ============================================================================

/// Serializes a value to a JSON column.
fn to_json_column<T: serde::Serialize>(value: &T) -> Result<String, NibError> {
    serde_json::to_string(value).map_err(|err| NibError::Storage(err.to_string()))
}

/// Deserializes a JSON column.
fn from_json_column<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, NibError> {
    serde_json::from_str(text).map_err(|err| NibError::Storage(err.to_string()))
}

/// Formats an optional timestamp as an RFC 3339 column value.
fn opt_ts_column(value: Option<UtcTimestamp>) -> Result<Option<String>, NibError> {
    value.map(|ts| ts.to_rfc3339().map_err(|err| NibError::Storage(err.to_string()))).transpose()
}

/// Formats a required timestamp as an RFC 3339 column value.
fn ts_column(value: UtcTimestamp) -> Result<String, NibError> {
    value.to_rfc3339().map_err(|err| NibError::Storage(err.to_string()))
}

/// Parses an optional RFC 3339 column value.
fn opt_ts_value(text: Option<String>) -> Result<Option<UtcTimestamp>, NibError> {
    text.map(|raw| {
        UtcTimestamp::parse_rfc3339(&raw).map_err(|err| NibError::Storage(err.to_string()))
    })
    .transpose()
}

/// Parses a required RFC 3339 column value.
fn ts_value(text: &str) -> Result<UtcTimestamp, NibError> {
    UtcTimestamp::parse_rfc3339(text).map_err(|err| NibError::Storage(err.to_string()))
}

/// Converts a device row into the entity form.
fn row_to_device(row: &Row<'_>) -> Result<Device, NibError> {
    let ip_text: String = row.get("ip_address").map_err(|err| map_sql_error(&err))?;
    let ip_address: Ipv4Addr = ip_text
        .parse()
        .map_err(|_| NibError::Storage(format!("invalid stored ip address {ip_text}")))?;
    let status_text: String = row.get("status").map_err(|err| map_sql_error(&err))?;
    let status = DeviceStatus::from_label(&status_text)
        .ok_or_else(|| NibError::Storage(format!("unknown device status {status_text}")))?;
    let metadata_text: String = row.get("metadata").map_err(|err| map_sql_error(&err))?;
    Ok(Device {
        device_id: DeviceId::new(
            row.get::<_, String>("device_id").map_err(|err| map_sql_error(&err))?,
        ),
        temp_scan_id: row.get("temp_scan_id").map_err(|err| map_sql_error(&err))?,
        ip_address,
        mac_address: MacAddress::new(
            row.get::<_, String>("mac_address").map_err(|err| map_sql_error(&err))?,
        ),
        hostname: row.get("hostname").map_err(|err| map_sql_error(&err))?,
        vendor: row.get("vendor").map_err(|err| map_sql_error(&err))?,
        device_type: row.get("device_type").map_err(|err| map_sql_error(&err))?,
        status,
        first_seen: opt_ts_value(row.get("first_seen").map_err(|err| map_sql_error(&err))?)?,
        last_seen: opt_ts_value(row.get("last_seen").map_err(|err| map_sql_error(&err))?)?,
        managed_by: row
            .get::<_, Option<String>>("managed_by_lc")
            .map_err(|err| map_sql_error(&err))?
            .map(ControllerId::new),
        region: row
            .get::<_, Option<String>>("region")
            .map_err(|err| map_sql_error(&err))?
            .map(Region::new),
        version: row.get("version").map_err(|err| map_sql_error(&err))?,
        metadata: from_json_column(&metadata_text)?,
    })
}

/// Converts a controller row into the entity form.
fn row_to_controller(row: &Row<'_>) -> Result<Controller, NibError> {
    let role_text: String = row.get("role").map_err(|err| map_sql_error(&err))?;
    let role = ControllerRole::from_label(&role_text)
        .ok_or_else(|| NibError::Storage(format!("unknown controller role {role_text}")))?;
    let status_text: String = row.get("status").map_err(|err| map_sql_error(&err))?;
    let status = ControllerStatus::from_label(&status_text)
        .ok_or_else(|| NibError::Storage(format!("unknown controller status {status_text}")))?;
    let capabilities_text: String = row.get("capabilities").map_err(|err| map_sql_error(&err))?;
    let metadata_text: String = row.get("metadata").map_err(|err| map_sql_error(&err))?;
    Ok(Controller {
        controller_id: ControllerId::new(
            row.get::<_, String>("controller_id").map_err(|err| map_sql_error(&err))?,
        ),
        role,
        region: row
            .get::<_, Option<String>>("region")
            .map_err(|err| map_sql_error(&err))?
            .map(Region::new),
        status,
        validated_by: row
            .get::<_, Option<String>>("validated_by")
            .map_err(|err| map_sql_error(&err))?
            .map(ControllerId::new),
        validated_at: opt_ts_value(row.get("validated_at").map_err(|err| map_sql_error(&err))?)?,
        public_key: row.get("public_key").map_err(|err| map_sql_error(&err))?,
        certificate: row.get("certificate").map_err(|err| map_sql_error(&err))?,
        capabilities: from_json_column(&capabilities_text)?,
        metadata: from_json_column(&metadata_text)?,
        version: row.get("version").map_err(|err| map_sql_error(&err))?,
    })
}

/// Converts a config row into the entity form.
fn row_to_config(row: &Row<'_>) -> Result<ConfigRecord, NibError> {
    let lines_text: String = row.get("config_lines").map_err(|err| map_sql_error(&err))?;
    let sensitivity_text: String = row.get("sensitivity").map_err(|err| map_sql_error(&err))?;
    let sensitivity: SensitivityLevel =
        serde_json::from_value(serde_json::Value::String(sensitivity_text.clone()))
            .map_err(|_| NibError::Storage(format!("unknown sensitivity {sensitivity_text}")))?;
    let state_text: String = row.get("state").map_err(|err| map_sql_error(&err))?;
    let state: ConfigState = serde_json::from_value(serde_json::Value::String(state_text.clone()))
        .map_err(|_| NibError::Storage(format!("unknown config state {state_text}")))?;
    let result_text: Option<String> =
        row.get("execution_result").map_err(|err| map_sql_error(&err))?;
    Ok(ConfigRecord {
        config_id: ConfigId::new(
            row.get::<_, String>("config_id").map_err(|err| map_sql_error(&err))?,
        ),
        device_id: DeviceId::new(
            row.get::<_, String>("device_id").map_err(|err| map_sql_error(&err))?,
        ),
        config_lines: from_json_column(&lines_text)?,
        requester: ControllerId::new(
            row.get::<_, String>("requester").map_err(|err| map_sql_error(&err))?,
        ),
        sensitivity,
        state,
        approval_request_id: row
            .get::<_, Option<String>>("approval_request_id")
            .map_err(|err| map_sql_error(&err))?
            .map(pdsno_core::RequestId::new),
        execution_token_id: row
            .get::<_, Option<String>>("execution_token_id")
            .map_err(|err| map_sql_error(&err))?
            .map(pdsno_core::TokenId::new),
        backup_id: row
            .get::<_, Option<String>>("backup_id")
            .map_err(|err| map_sql_error(&err))?
            .map(pdsno_core::BackupId::new),
        execution_result: result_text.as_deref().map(from_json_column).transpose()?,
        version: row.get("version").map_err(|err| map_sql_error(&err))?,
    })
}

/// Converts a policy row into the entity form.
fn row_to_policy(row: &Row<'_>) -> Result<Policy, NibError> {
    let rules_text: String = row.get("rule_set").map_err(|err| map_sql_error(&err))?;
    Ok(Policy {
        policy_id: row.get("policy_id").map_err(|err| map_sql_error(&err))?,
        name: row.get("name").map_err(|err| map_sql_error(&err))?,
        rule_set: from_json_column(&rules_text)?,
        scope: row.get("scope").map_err(|err| map_sql_error(&err))?,
        active: row.get::<_, i64>("active").map_err(|err| map_sql_error(&err))? != 0,
        created_by: ControllerId::new(
            row.get::<_, String>("created_by").map_err(|err| map_sql_error(&err))?,
        ),
        created_at: opt_ts_value(row.get("created_at").map_err(|err| map_sql_error(&err))?)?,
        updated_at: opt_ts_value(row.get("updated_at").map_err(|err| map_sql_error(&err))?)?,
        version: row.get("version").map_err(|err| map_sql_error(&err))?,
    })
}

/// Converts an event row into the entity form.
fn row_to_event(row: &Row<'_>) -> Result<NibEvent, NibError> {
    let timestamp_text: String = row.get("timestamp").map_err(|err| map_sql_error(&err))?;
    let details_text: String = row.get("details").map_err(|err| map_sql_error(&err))?;
    Ok(NibEvent {
        event_id: EventId::new(
            row.get::<_, String>("event_id").map_err(|err| map_sql_error(&err))?,
        ),
        event_type: row.get("event_type").map_err(|err| map_sql_error(&err))?,
        controller_id: ControllerId::new(
            row.get::<_, String>("controller_id").map_err(|err| map_sql_error(&err))?,
        ),
        timestamp: ts_value(&timestamp_text)?,
        details: from_json_column(&details_text)?,
        signature: Some(row.get::<_, String>("signature").map_err(|err| map_sql_error(&err))?),
    })
}

/// Converts a lock row into the entity form.
fn row_to_lock(row: &Row<'_>) -> Result<NibLock, NibError> {
    let type_text: String = row.get("lock_type").map_err(|err| map_sql_error(&err))?;
    let lock_type = LockType::from_label(&type_text)
        .ok_or_else(|| NibError::Storage(format!("unknown lock type {type_text}")))?;
    let acquired_text: String = row.get("acquired_at").map_err(|err| map_sql_error(&err))?;
    let expires_text: String = row.get("expires_at").map_err(|err| map_sql_error(&err))?;
    Ok(NibLock {
        lock_id: LockId::new(row.get::<_, String>("lock_id").map_err(|err| map_sql_error(&err))?),
        subject_id: row.get("subject_id").map_err(|err| map_sql_error(&err))?,
        lock_type,
        held_by: ControllerId::new(
            row.get::<_, String>("held_by").map_err(|err| map_sql_error(&err))?,
        ),
        acquired_at: ts_value(&acquired_text)?,
        expires_at: ts_value(&expires_text)?,
    })
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// Durable [`NibStore`] backed by SQLite.
///
/// # Invariants
/// - A single guarded connection serializes writers; the busy timeout covers
///   cross-process contention on the database file.
/// - The event log only ever grows; triggers enforce this in-schema.
pub struct SqliteNib {
    /// Guarded database connection.
    conn: Mutex<Connection>,
    /// Secret used for event tamper-evidence tags.
    event_secret: Vec<u8>,
}

impl SqliteNib {
    /// Opens (and if necessary creates) the store at the configured path.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the database cannot be opened, the
    /// schema cannot be installed, or the on-disk version is unsupported.
    pub fn open(
        config: &SqliteNibConfig,
        event_secret: impl Into<Vec<u8>>,
    ) -> Result<Self, SqliteStoreError> {
        let conn = Connection::open(&config.path)
            .map_err(|err| SqliteStoreError::Open(err.to_string()))?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(|err| SqliteStoreError::Open(err.to_string()))?;
        conn.pragma_update(None, "journal_mode", config.journal_mode.pragma_value())
            .map_err(|err| SqliteStoreError::Open(err.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "on")
            .map_err(|err| SqliteStoreError::Open(err.to_string()))?;

        let found: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|err| SqliteStoreError::Open(err.to_string()))?;
        if found != 0 && found != SCHEMA_VERSION {
            return Err(SqliteStoreError::SchemaVersion {
                found,
                expected: SCHEMA_VERSION,
            });
        }
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|err| SqliteStoreError::Migration(err.to_string()))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|err| SqliteStoreError::Migration(err.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
            event_secret: event_secret.into(),
        })
    }

    /// Acquires the connection mutex, mapping poisoning to a storage error.
    fn guard(&self) -> Result<MutexGuard<'_, Connection>, NibError> {
        self.conn.lock().map_err(|_| NibError::Storage("connection mutex poisoned".to_string()))
    }

    /// Fetches a device by MAC on an already-held connection.
    fn device_by_mac_on(conn: &Connection, mac: &MacAddress) -> Result<Option<Device>, NibError> {
        conn.query_row("SELECT * FROM devices WHERE mac_address = ?1", params![mac.as_str()], |row| {
            Ok(row_to_device(row))
        })
        .optional()
        .map_err(|err| map_sql_error(&err))?
        .transpose()
    }

    /// Fetches a controller by id on an already-held connection.
    fn controller_on(
        conn: &Connection,
        controller_id: &ControllerId,
    ) -> Result<Option<Controller>, NibError> {
        conn.query_row(
            "SELECT * FROM controllers WHERE controller_id = ?1",
            params![controller_id.as_str()],
            |row| Ok(row_to_controller(row)),
        )
        .optional()
        .map_err(|err| map_sql_error(&err))?
        .transpose()
    }
}

impl NibStore for SqliteNib {
    fn get_device(&self, device_id: &DeviceId) -> Result<Option<Device>, NibError> {
        let conn = self.guard()?;
        conn.query_row(
            "SELECT * FROM devices WHERE device_id = ?1",
            params![device_id.as_str()],
            |row| Ok(row_to_device(row)),
        )
        .optional()
        .map_err(|err| map_sql_error(&err))?
        .transpose()
    }

    fn get_device_by_mac(&self, mac: &MacAddress) -> Result<Option<Device>, NibError> {
        let conn = self.guard()?;
        Self::device_by_mac_on(&conn, mac)
    }

    fn upsert_device(&self, device: &Device) -> Result<UpsertReceipt, NibError> {
        let conn = self.guard()?;
        if let Some(existing) = Self::device_by_mac_on(&conn, &device.mac_address)? {
            let changed = conn
                .execute(
                    "UPDATE devices SET
                        ip_address = ?1, hostname = ?2, vendor = ?3, device_type = ?4,
                        status = ?5, last_seen = ?6, managed_by_lc = ?7, region = ?8,
                        metadata = ?9, version = version + 1
                     WHERE mac_address = ?10 AND version = ?11",
                    params![
                        device.ip_address.to_string(),
                        device.hostname,
                        device.vendor,
                        device.device_type,
                        device.status.as_str(),
                        opt_ts_column(device.last_seen)?,
                        device.managed_by.as_ref().map(|id| id.as_str().to_string()),
                        device.region.as_ref().map(|region| region.as_str().to_string()),
                        to_json_column(&device.metadata)?,
                        device.mac_address.as_str(),
                        device.version,
                    ],
                )
                .map_err(|err| map_sql_error(&err))?;
            if changed == 0 {
                return Err(NibError::Conflict);
            }
            return Ok(UpsertReceipt {
                entity_id: existing.device_id.as_str().to_string(),
                version: existing.version + 1,
            });
        }

        let device_id = if device.device_id.as_str().is_empty() {
            format!("nib-dev-{}", short_uuid(8))
        } else {
            device.device_id.as_str().to_string()
        };
        conn.execute(
            "INSERT INTO devices (
                device_id, temp_scan_id, ip_address, mac_address, hostname,
                vendor, device_type, status, first_seen, last_seen,
                managed_by_lc, region, version, metadata
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13)",
            params![
                device_id,
                device.temp_scan_id,
                device.ip_address.to_string(),
                device.mac_address.as_str(),
                device.hostname,
                device.vendor,
                device.device_type,
                device.status.as_str(),
                opt_ts_column(device.first_seen)?,
                opt_ts_column(device.last_seen)?,
                device.managed_by.as_ref().map(|id| id.as_str().to_string()),
                device.region.as_ref().map(|region| region.as_str().to_string()),
                to_json_column(&device.metadata)?,
            ],
        )
        .map_err(|err| map_sql_error(&err))?;
        Ok(UpsertReceipt {
            entity_id: device_id,
            version: 0,
        })
    }

    fn active_devices(&self) -> Result<Vec<Device>, NibError> {
        let conn = self.guard()?;
        let mut statement = conn
            .prepare("SELECT * FROM devices WHERE status = 'active'")
            .map_err(|err| map_sql_error(&err))?;
        let rows = statement
            .query_map([], |row| Ok(row_to_device(row)))
            .map_err(|err| map_sql_error(&err))?;
        let mut devices = Vec::new();
        for row in rows {
            devices.push(row.map_err(|err| map_sql_error(&err))??);
        }
        Ok(devices)
    }

    fn get_controller(&self, controller_id: &ControllerId) -> Result<Option<Controller>, NibError> {
        let conn = self.guard()?;
        Self::controller_on(&conn, controller_id)
    }

    fn controllers_by_region(&self, region: &Region) -> Result<Vec<Controller>, NibError> {
        let conn = self.guard()?;
        let mut statement = conn
            .prepare("SELECT * FROM controllers WHERE region = ?1 AND status = 'active'")
            .map_err(|err| map_sql_error(&err))?;
        let rows = statement
            .query_map(params![region.as_str()], |row| Ok(row_to_controller(row)))
            .map_err(|err| map_sql_error(&err))?;
        let mut controllers = Vec::new();
        for row in rows {
            controllers.push(row.map_err(|err| map_sql_error(&err))??);
        }
        Ok(controllers)
    }

    fn upsert_controller(&self, controller: &Controller) -> Result<UpsertReceipt, NibError> {
        let conn = self.guard()?;
        if let Some(existing) = Self::controller_on(&conn, &controller.controller_id)? {
            let changed = conn
                .execute(
                    "UPDATE controllers SET
                        role = ?1, region = ?2, status = ?3, validated_by = ?4,
                        validated_at = ?5, public_key = ?6, certificate = ?7,
                        capabilities = ?8, metadata = ?9, version = version + 1
                     WHERE controller_id = ?10 AND version = ?11",
                    params![
                        controller.role.as_str(),
                        controller.region.as_ref().map(|region| region.as_str().to_string()),
                        controller.status.as_str(),
                        controller.validated_by.as_ref().map(|id| id.as_str().to_string()),
                        opt_ts_column(controller.validated_at)?,
                        controller.public_key,
                        controller.certificate,
                        to_json_column(&controller.capabilities)?,
                        to_json_column(&controller.metadata)?,
                        controller.controller_id.as_str(),
                        controller.version,
                    ],
                )
                .map_err(|err| map_sql_error(&err))?;
            if changed == 0 {
                return Err(NibError::Conflict);
            }
            return Ok(UpsertReceipt {
                entity_id: existing.controller_id.as_str().to_string(),
                version: existing.version + 1,
            });
        }

        conn.execute(
            "INSERT INTO controllers (
                controller_id, role, region, status, validated_by,
                validated_at, public_key, certificate, capabilities, metadata, version
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
            params![
                controller.controller_id.as_str(),
                controller.role.as_str(),
                controller.region.as_ref().map(|region| region.as_str().to_string()),
                controller.status.as_str(),
                controller.validated_by.as_ref().map(|id| id.as_str().to_string()),
                opt_ts_column(controller.validated_at)?,
                controller.public_key,
                controller.certificate,
                to_json_column(&controller.capabilities)?,
                to_json_column(&controller.metadata)?,
            ],
        )
        .map_err(|err| map_sql_error(&err))?;
        Ok(UpsertReceipt {
            entity_id: controller.controller_id.as_str().to_string(),
            version: 0,
        })
    }

    fn max_sequence_for_role(&self, role: ControllerRole) -> Result<u64, NibError> {
        let conn = self.guard()?;
        let mut statement = conn
            .prepare("SELECT controller_id FROM controllers WHERE role = ?1")
            .map_err(|err| map_sql_error(&err))?;
        let rows = statement
            .query_map(params![role.as_str()], |row| row.get::<_, String>(0))
            .map_err(|err| map_sql_error(&err))?;
        let mut max = 0;
        for row in rows {
            let id = ControllerId::new(row.map_err(|err| map_sql_error(&err))?);
            if let Some(seq) = parse_admission_sequence(&id, role) {
                max = max.max(seq);
            }
        }
        Ok(max)
    }

    fn get_config(&self, config_id: &ConfigId) -> Result<Option<ConfigRecord>, NibError> {
        let conn = self.guard()?;
        conn.query_row(
            "SELECT * FROM configs WHERE config_id = ?1",
            params![config_id.as_str()],
            |row| Ok(row_to_config(row)),
        )
        .optional()
        .map_err(|err| map_sql_error(&err))?
        .transpose()
    }

    fn upsert_config(&self, config: &ConfigRecord) -> Result<UpsertReceipt, NibError> {
        let conn = self.guard()?;
        let existing_version: Option<i64> = conn
            .query_row(
                "SELECT version FROM configs WHERE config_id = ?1",
                params![config.config_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| map_sql_error(&err))?;
        if let Some(version) = existing_version {
            let changed = conn
                .execute(
                    "UPDATE configs SET
                        device_id = ?1, config_lines = ?2, requester = ?3, sensitivity = ?4,
                        state = ?5, approval_request_id = ?6, execution_token_id = ?7,
                        backup_id = ?8, execution_result = ?9, version = version + 1
                     WHERE config_id = ?10 AND version = ?11",
                    params![
                        config.device_id.as_str(),
                        to_json_column(&config.config_lines)?,
                        config.requester.as_str(),
                        config.sensitivity.as_str(),
                        config.state.as_str(),
                        config.approval_request_id.as_ref().map(|id| id.as_str().to_string()),
                        config.execution_token_id.as_ref().map(|id| id.as_str().to_string()),
                        config.backup_id.as_ref().map(|id| id.as_str().to_string()),
                        config.execution_result.as_ref().map(to_json_column).transpose()?,
                        config.config_id.as_str(),
                        config.version,
                    ],
                )
                .map_err(|err| map_sql_error(&err))?;
            if changed == 0 {
                return Err(NibError::Conflict);
            }
            return Ok(UpsertReceipt {
                entity_id: config.config_id.as_str().to_string(),
                version: version + 1,
            });
        }

        conn.execute(
            "INSERT INTO configs (
                config_id, device_id, config_lines, requester, sensitivity,
                state, approval_request_id, execution_token_id, backup_id,
                execution_result, version
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
            params![
                config.config_id.as_str(),
                config.device_id.as_str(),
                to_json_column(&config.config_lines)?,
                config.requester.as_str(),
                config.sensitivity.as_str(),
                config.state.as_str(),
                config.approval_request_id.as_ref().map(|id| id.as_str().to_string()),
                config.execution_token_id.as_ref().map(|id| id.as_str().to_string()),
                config.backup_id.as_ref().map(|id| id.as_str().to_string()),
                config.execution_result.as_ref().map(to_json_column).transpose()?,
            ],
        )
        .map_err(|err| map_sql_error(&err))?;
        Ok(UpsertReceipt {
            entity_id: config.config_id.as_str().to_string(),
            version: 0,
        })
    }

    fn get_policy(&self, policy_id: &str) -> Result<Option<Policy>, NibError> {
        let conn = self.guard()?;
        conn.query_row("SELECT * FROM policies WHERE policy_id = ?1", params![policy_id], |row| {
            Ok(row_to_policy(row))
        })
        .optional()
        .map_err(|err| map_sql_error(&err))?
        .transpose()
    }

    fn upsert_policy(&self, policy: &Policy) -> Result<UpsertReceipt, NibError> {
        let conn = self.guard()?;
        let existing_version: Option<i64> = conn
            .query_row(
                "SELECT version FROM policies WHERE policy_id = ?1",
                params![policy.policy_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| map_sql_error(&err))?;
        if let Some(version) = existing_version {
            let changed = conn
                .execute(
                    "UPDATE policies SET
                        name = ?1, rule_set = ?2, scope = ?3, active = ?4,
                        created_by = ?5, created_at = ?6, updated_at = ?7,
                        version = version + 1
                     WHERE policy_id = ?8 AND version = ?9",
                    params![
                        policy.name,
                        to_json_column(&policy.rule_set)?,
                        policy.scope,
                        i64::from(policy.active),
                        policy.created_by.as_str(),
                        opt_ts_column(policy.created_at)?,
                        opt_ts_column(policy.updated_at)?,
                        policy.policy_id,
                        policy.version,
                    ],
                )
                .map_err(|err| map_sql_error(&err))?;
            if changed == 0 {
                return Err(NibError::Conflict);
            }
            return Ok(UpsertReceipt {
                entity_id: policy.policy_id.clone(),
                version: version + 1,
            });
        }

        conn.execute(
            "INSERT INTO policies (
                policy_id, name, rule_set, scope, active, created_by,
                created_at, updated_at, version
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                policy.policy_id,
                policy.name,
                to_json_column(&policy.rule_set)?,
                policy.scope,
                i64::from(policy.active),
                policy.created_by.as_str(),
                opt_ts_column(policy.created_at)?,
                opt_ts_column(policy.updated_at)?,
            ],
        )
        .map_err(|err| map_sql_error(&err))?;
        Ok(UpsertReceipt {
            entity_id: policy.policy_id.clone(),
            version: 0,
        })
    }

    fn write_event(&self, event: &NibEvent) -> Result<EventId, NibError> {
        let mut stored = event.clone();
        if stored.event_id.as_str().is_empty() {
            stored.event_id = EventId::new(format!("evt-{}", short_uuid(12)));
        }
        let signature = stored
            .compute_tag(&self.event_secret)
            .map_err(|err| NibError::Storage(err.to_string()))?;
        let conn = self.guard()?;
        conn.execute(
            "INSERT INTO events (event_id, event_type, controller_id, timestamp, details, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                stored.event_id.as_str(),
                stored.event_type,
                stored.controller_id.as_str(),
                ts_column(stored.timestamp)?,
                to_json_column(&stored.details)?,
                signature,
            ],
        )
        .map_err(|err| map_sql_error(&err))?;
        Ok(stored.event_id)
    }

    fn verify_event(&self, event: &NibEvent) -> Result<bool, NibError> {
        let expected =
            event.compute_tag(&self.event_secret).map_err(|err| NibError::Storage(err.to_string()))?;
        Ok(event
            .signature
            .as_ref()
            .is_some_and(|tag| hashing::constant_time_eq(tag.as_bytes(), expected.as_bytes())))
    }

    fn events_by_type(&self, event_type: &str) -> Result<Vec<NibEvent>, NibError> {
        let conn = self.guard()?;
        let mut statement = conn
            .prepare("SELECT * FROM events WHERE event_type = ?1 ORDER BY rowid DESC")
            .map_err(|err| map_sql_error(&err))?;
        let rows = statement
            .query_map(params![event_type], |row| Ok(row_to_event(row)))
            .map_err(|err| map_sql_error(&err))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(|err| map_sql_error(&err))??);
        }
        Ok(events)
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<NibEvent>, NibError> {
        let conn = self.guard()?;
        let mut statement = conn
            .prepare("SELECT * FROM events ORDER BY rowid DESC LIMIT ?1")
            .map_err(|err| map_sql_error(&err))?;
        let rows = statement
            .query_map(params![limit as i64], |row| Ok(row_to_event(row)))
            .map_err(|err| map_sql_error(&err))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(|err| map_sql_error(&err))??);
        }
        Ok(events)
    }

    fn acquire_lock(
        &self,
        subject_id: &str,
        lock_type: LockType,
        held_by: &ControllerId,
        ttl_seconds: i64,
        now: UtcTimestamp,
    ) -> Result<NibLock, NibError> {
        let conn = self.guard()?;
        let now_text = ts_column(now)?;
        conn.execute("DELETE FROM locks WHERE expires_at < ?1", params![now_text])
            .map_err(|err| map_sql_error(&err))?;

        let holder: Option<String> = conn
            .query_row(
                "SELECT held_by FROM locks WHERE subject_id = ?1 AND lock_type = ?2",
                params![subject_id, lock_type.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| map_sql_error(&err))?;
        if let Some(holder) = holder {
            return Err(NibError::Locked {
                holder,
            });
        }

        let lock = NibLock {
            lock_id: LockId::new(format!("lock-{}", short_uuid(12))),
            subject_id: subject_id.to_string(),
            lock_type,
            held_by: held_by.clone(),
            acquired_at: now,
            expires_at: now.plus_seconds(ttl_seconds),
        };
        conn.execute(
            "INSERT INTO locks (lock_id, subject_id, lock_type, held_by, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                lock.lock_id.as_str(),
                lock.subject_id,
                lock.lock_type.as_str(),
                lock.held_by.as_str(),
                now_text,
                ts_column(lock.expires_at)?,
            ],
        )
        .map_err(|err| map_sql_error(&err))?;
        Ok(lock)
    }

    fn release_lock(&self, lock_id: &LockId, held_by: &ControllerId) -> Result<(), NibError> {
        let conn = self.guard()?;
        let removed = conn
            .execute(
                "DELETE FROM locks WHERE lock_id = ?1 AND held_by = ?2",
                params![lock_id.as_str(), held_by.as_str()],
            )
            .map_err(|err| map_sql_error(&err))?;
        if removed == 0 {
            return Err(NibError::NotFound(format!("lock {lock_id} held by {held_by}")));
        }
        Ok(())
    }

    fn check_lock(
        &self,
        subject_id: &str,
        lock_type: LockType,
        now: UtcTimestamp,
    ) -> Result<Option<NibLock>, NibError> {
        let conn = self.guard()?;
        conn.query_row(
            "SELECT * FROM locks WHERE subject_id = ?1 AND lock_type = ?2 AND expires_at > ?3",
            params![subject_id, lock_type.as_str(), ts_column(now)?],
            |row| Ok(row_to_lock(row)),
        )
        .optional()
        .map_err(|err| map_sql_error(&err))?
        .transpose()
    }
}
