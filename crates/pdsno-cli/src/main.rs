// crates/pdsno-cli/src/main.rs
// ============================================================================
// Module: PDSNO CLI Entry Point
// Description: Command dispatcher for running controllers and operator tasks.
// Purpose: Start Global, Regional, or Local controllers, initialize the NIB,
// check peer health, and mint bootstrap tokens.
// Dependencies: clap, pdsno-controller, pdsno-store-sqlite, pdsno-transport,
// tokio, tracing-subscriber
// ============================================================================

//! ## Overview
//! `pdsno run --type {global|regional|local}` boots one controller process:
//! it opens the SQLite NIB, wires the bus and HTTP transport, performs
//! admission against the parent (over HTTP when `--parent-url` is given),
//! and for local controllers drives the discovery loop on the configured
//! interval. `init-db` installs the schema, `health-check` probes a peer's
//! `/health`, and `gen-token` mints bootstrap tokens for provisioning.
//!
//! Exit codes: 0 on success, 1 on runtime failure, 2 on invalid arguments.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod config;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use pdsno_bus::PubSubBus;
use pdsno_bus::RequestBus;
use pdsno_controller::AuthenticatorGuard;
use pdsno_controller::ControllerError;
use pdsno_controller::GlobalConfig;
use pdsno_controller::GlobalController;
use pdsno_controller::LocalConfig;
use pdsno_controller::LocalController;
use pdsno_controller::RegionalConfig;
use pdsno_controller::RegionalController;
use pdsno_controller::SharedSecrets;
use pdsno_core::Clock;
use pdsno_core::ControllerId;
use pdsno_core::ControllerRole;
use pdsno_core::MacAddress;
use pdsno_core::MessageEnvelope;
use pdsno_core::MessageType;
use pdsno_core::Region;
use pdsno_core::SystemClock;
use pdsno_discovery::Cidr;
use pdsno_discovery::PingCommandProbe;
use pdsno_discovery::StaticArpProbe;
use pdsno_discovery::StaticSnmpProbe;
use pdsno_security::BootstrapAuthority;
use pdsno_security::MessageAuthenticator;
use pdsno_store_sqlite::SqliteNib;
use pdsno_store_sqlite::SqliteNibConfig;
use pdsno_transport::HttpEnvelopeClient;
use pdsno_transport::HttpTransport;
use serde_json::Map;
use serde_json::Value;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::config::CliConfig;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Development fallback secret; production deployments pass `--secret-file`.
const DEV_SECRET: &[u8] = b"pdsno-dev-secret-change-in-production";

// ============================================================================
// SECTION: Arguments
// ============================================================================

/// PDSNO hierarchical SDN orchestrator.
#[derive(Parser)]
#[command(name = "pdsno", version, about = "Partially distributed smart network orchestrator")]
struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Top-level subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run a controller process.
    Run(RunArgs),
    /// Create or migrate the NIB database schema.
    InitDb(InitDbArgs),
    /// Probe a controller's health endpoint.
    HealthCheck(HealthArgs),
    /// Mint bootstrap tokens for controller provisioning.
    GenToken(GenTokenArgs),
}

/// Controller tier selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ControllerType {
    /// Root of trust.
    Global,
    /// Zone governance.
    Regional,
    /// Subnet discovery and execution.
    Local,
}

/// Arguments for `run`.
#[derive(Args)]
struct RunArgs {
    /// Controller tier.
    #[arg(long = "type", value_enum)]
    controller_type: ControllerType,
    /// Controller id (auto-generated temporary id when omitted).
    #[arg(long)]
    id: Option<String>,
    /// Region name (required for regional and local controllers).
    #[arg(long)]
    region: Option<String>,
    /// Parent controller id (required for regional and local controllers).
    #[arg(long)]
    parent: Option<String>,
    /// Parent controller base URL for admission over HTTP.
    #[arg(long)]
    parent_url: Option<String>,
    /// HTTP transport port.
    #[arg(long, default_value_t = 8001)]
    port: u16,
    /// Broker host for pub/sub delivery (reserved; in-process bus is used
    /// until a broker transport is deployed).
    #[arg(long)]
    mqtt_broker: Option<String>,
    /// Terminate TLS in this process (requires --cert and --key).
    #[arg(long)]
    enable_tls: bool,
    /// TLS certificate path.
    #[arg(long)]
    cert: Option<PathBuf>,
    /// TLS private key path.
    #[arg(long)]
    key: Option<PathBuf>,
    /// Runtime configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// NIB database path.
    #[arg(long, default_value = "config/pdsno.db")]
    db: PathBuf,
    /// Subnet to discover in CIDR notation (local controllers).
    #[arg(long)]
    subnet: Option<String>,
    /// Discovery interval in seconds.
    #[arg(long, default_value_t = 300)]
    discovery_interval: u64,
    /// Bootstrap token presented at admission.
    #[arg(long)]
    bootstrap_token: Option<String>,
    /// Secret material file (minimum 32 bytes).
    #[arg(long)]
    secret_file: Option<PathBuf>,
    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

/// Arguments for `init-db`.
#[derive(Args)]
struct InitDbArgs {
    /// NIB database path.
    #[arg(long, default_value = "config/pdsno.db")]
    db: PathBuf,
    /// Secret material file (minimum 32 bytes).
    #[arg(long)]
    secret_file: Option<PathBuf>,
}

/// Arguments for `health-check`.
#[derive(Args)]
struct HealthArgs {
    /// Controller base URL.
    #[arg(long, default_value = "http://localhost:8001")]
    url: String,
    /// Request timeout in seconds.
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

/// Arguments for `gen-token`.
#[derive(Args)]
struct GenTokenArgs {
    /// Candidate region.
    #[arg(long)]
    region: String,
    /// Candidate tier (`regional` or `local`).
    #[arg(long = "type")]
    controller_type: String,
    /// Candidate temporary id (auto-generated when omitted).
    #[arg(long)]
    temp_id: Option<String>,
    /// Number of tokens to mint.
    #[arg(long, default_value_t = 1)]
    count: u32,
    /// Secret material file (minimum 32 bytes).
    #[arg(long)]
    secret_file: Option<PathBuf>,
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_controller(args).await,
        Command::InitDb(args) => init_db(&args),
        Command::HealthCheck(args) => health_check(args).await,
        Command::GenToken(args) => gen_token(&args),
    }
}

/// Initializes process-wide logging.
fn init_logging(debug: bool) {
    let filter = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

/// Loads secret material from the file or falls back to the dev secret.
fn load_secrets(path: Option<&PathBuf>) -> Result<SharedSecrets, String> {
    let secret = match path {
        Some(path) => {
            let bytes =
                std::fs::read(path).map_err(|err| format!("secret file read failure: {err}"))?;
            if bytes.len() < 32 {
                return Err("secret file must hold at least 32 bytes".to_string());
            }
            bytes
        }
        None => {
            warn!("no --secret-file supplied, using the development secret");
            DEV_SECRET.to_vec()
        }
    };
    Ok(SharedSecrets::uniform(&secret))
}

/// Validates argument combinations for `run`.
fn validate_run(args: &RunArgs) -> Result<(), String> {
    if matches!(args.controller_type, ControllerType::Regional | ControllerType::Local) {
        if args.region.is_none() {
            return Err("regional and local controllers require --region".to_string());
        }
        if args.parent.is_none() {
            return Err("regional and local controllers require --parent".to_string());
        }
    }
    if args.controller_type == ControllerType::Local && args.subnet.is_none() {
        return Err("local controllers require --subnet for discovery".to_string());
    }
    if args.enable_tls && (args.cert.is_none() || args.key.is_none()) {
        return Err("--enable-tls requires both --cert and --key".to_string());
    }
    Ok(())
}

// ============================================================================
// SECTION: Run
// ============================================================================

/// Runs one controller process until interrupted.
async fn run_controller(args: RunArgs) -> ExitCode {
    init_logging(args.debug);
    if let Err(reason) = validate_run(&args) {
        error!(reason, "invalid arguments");
        return ExitCode::from(2);
    }
    if args.enable_tls {
        // TLS termination is delegated to the fronting proxy in this
        // deployment shape; the flags are accepted for interface parity.
        warn!("TLS flags accepted; terminate TLS at the fronting proxy");
    }
    if let Some(broker) = &args.mqtt_broker {
        info!(broker, "broker configured; pub/sub remains in-process until a broker transport is deployed");
    }

    let runtime_config = match &args.config {
        Some(path) => match CliConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                error!(error = %err, "configuration file rejected");
                return ExitCode::from(2);
            }
        },
        None => CliConfig::default(),
    };
    let secrets = match load_secrets(args.secret_file.as_ref()) {
        Ok(secrets) => secrets,
        Err(reason) => {
            error!(reason, "secret loading failed");
            return ExitCode::from(1);
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let nib = match SqliteNib::open(
        &SqliteNibConfig::at_path(args.db.clone()),
        secrets.event_secret.clone(),
    ) {
        Ok(nib) => Arc::new(nib),
        Err(err) => {
            error!(error = %err, db = %args.db.display(), "NIB open failed");
            return ExitCode::from(1);
        }
    };
    let bus = Arc::new(RequestBus::new(clock.clone()));
    let pubsub = Arc::new(PubSubBus::new());

    let outcome = match args.controller_type {
        ControllerType::Global => {
            run_global(&args, &runtime_config, secrets, nib, bus, clock).await
        }
        ControllerType::Regional => {
            run_regional(&args, secrets, nib, bus, pubsub, clock).await
        }
        ControllerType::Local => {
            run_local(&args, &runtime_config, secrets, nib, bus, pubsub, clock).await
        }
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(reason) => {
            error!(reason, "controller terminated");
            ExitCode::from(1)
        }
    }
}

/// Boots the Global controller and serves until ctrl-c.
async fn run_global(
    args: &RunArgs,
    runtime_config: &CliConfig,
    secrets: SharedSecrets,
    nib: Arc<SqliteNib>,
    bus: Arc<RequestBus>,
    clock: Arc<dyn Clock>,
) -> Result<(), String> {
    let controller_id =
        ControllerId::new(args.id.clone().unwrap_or_else(|| "global_cntl_1".to_string()));
    let policy = pdsno_security::AdmissionPolicy {
        allowed_regions: runtime_config.admission.allowed_regions.iter().map(Region::new).collect(),
        region_quota: runtime_config.admission.region_quota,
        ..pdsno_security::AdmissionPolicy::default()
    };

    let global = GlobalController::new(
        GlobalConfig {
            controller_id: controller_id.clone(),
            admission_policy: policy,
            secrets,
        },
        nib,
        clock.clone(),
    )
    .map_err(|err| err.to_string())?;
    global.register(&bus);

    serve_until_interrupt(controller_id, bus, clock, args.port).await
}

/// Boots a Regional controller, admits it against the parent, and serves.
async fn run_regional(
    args: &RunArgs,
    secrets: SharedSecrets,
    nib: Arc<SqliteNib>,
    bus: Arc<RequestBus>,
    pubsub: Arc<PubSubBus>,
    clock: Arc<dyn Clock>,
) -> Result<(), String> {
    let temp_id = ControllerId::new(
        args.id.clone().unwrap_or_else(|| format!("temp-rc-{}", short_uuid())),
    );
    let region = Region::new(args.region.clone().unwrap_or_default());
    let parent = ControllerId::new(args.parent.clone().unwrap_or_default());

    let regional = RegionalController::new(
        RegionalConfig {
            temp_id: temp_id.clone(),
            region,
            parent_global: parent.clone(),
            metadata: Map::new(),
            secrets: secrets.clone(),
        },
        nib,
        clock.clone(),
    )
    .map_err(|err| err.to_string())?;
    regional.register(&bus);
    regional.subscribe_discovery(&pubsub);

    if let (Some(parent_url), Some(token)) = (&args.parent_url, &args.bootstrap_token) {
        let send = remote_sender(parent_url, &temp_id, &parent, &secrets, &clock)?;
        let assigned = regional
            .request_admission_with(&bus, token, send.as_ref())
            .map_err(|err| err.to_string())?;
        info!(assigned = %assigned, "admitted by parent");
    } else {
        warn!("running unvalidated: supply --parent-url and --bootstrap-token to admit");
    }

    serve_until_interrupt(regional.current_id(), bus, clock, args.port).await
}

/// Boots a Local controller, admits it, and drives the discovery loop.
#[allow(clippy::too_many_arguments, reason = "Process wiring happens once, here.")]
async fn run_local(
    args: &RunArgs,
    runtime_config: &CliConfig,
    secrets: SharedSecrets,
    nib: Arc<SqliteNib>,
    bus: Arc<RequestBus>,
    pubsub: Arc<PubSubBus>,
    clock: Arc<dyn Clock>,
) -> Result<(), String> {
    let temp_id = ControllerId::new(
        args.id.clone().unwrap_or_else(|| format!("temp-lc-{}", short_uuid())),
    );
    let region = Region::new(args.region.clone().unwrap_or_default());
    let parent = ControllerId::new(args.parent.clone().unwrap_or_default());
    let subnet = Cidr::parse(args.subnet.as_deref().unwrap_or_default())
        .map_err(|err| err.to_string())?;

    let local = LocalController::new(
        LocalConfig {
            temp_id: temp_id.clone(),
            region,
            parent_regional: parent.clone(),
            subnet,
            metadata: Map::new(),
            secrets: secrets.clone(),
            max_in_flight: runtime_config.discovery.max_in_flight,
            miss_budget: runtime_config.discovery.miss_budget,
            execution_lock_ttl_seconds: 300,
        },
        nib,
        clock.clone(),
    )
    .map_err(|err| err.to_string())?;
    local.register(&bus);
    local.subscribe_policy(&pubsub, &bus);

    if let (Some(parent_url), Some(token)) = (&args.parent_url, &args.bootstrap_token) {
        let send = remote_sender(parent_url, &temp_id, &parent, &secrets, &clock)?;
        let assigned = local
            .request_admission_with(&bus, token, send.as_ref())
            .map_err(|err| err.to_string())?;
        info!(assigned = %assigned, "admitted by parent");
    } else {
        warn!("running unvalidated: supply --parent-url and --bootstrap-token to admit");
    }

    local.init_discovery(
        Arc::new(StaticArpProbe::new(
            demo_arp_table(runtime_config),
            clock.clone(),
        )),
        Arc::new(PingCommandProbe::new(runtime_config.discovery.ping_timeout_seconds)),
        Arc::new(StaticSnmpProbe::silent()),
    );

    let loop_local = local.clone();
    let loop_pubsub = pubsub.clone();
    let interval_seconds = args.discovery_interval.max(1);
    let _discovery_loop = tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_seconds));
        loop {
            ticker.tick().await;
            match loop_local.run_discovery_cycle(Some(loop_pubsub.as_ref()), None).await {
                Ok(summary) => info!(
                    devices = summary.devices_found,
                    new = summary.new_devices,
                    inactive = summary.inactive_devices,
                    "discovery cycle finished"
                ),
                Err(err) => warn!(error = %err, "discovery cycle skipped"),
            }
        }
    });

    serve_until_interrupt(local.current_id(), bus, clock, args.port).await
}

/// Parses the demo ARP table from the runtime configuration.
fn demo_arp_table(runtime_config: &CliConfig) -> HashMap<Ipv4Addr, MacAddress> {
    let mut table = HashMap::new();
    for (ip_text, mac_text) in &runtime_config.discovery.demo_arp {
        match ip_text.parse::<Ipv4Addr>() {
            Ok(ip) => {
                table.insert(ip, MacAddress::new(mac_text.clone()));
            }
            Err(_) => warn!(ip = ip_text.as_str(), "ignoring invalid demo ARP entry"),
        }
    }
    table
}

/// Builds a send closure that delivers admission envelopes to the parent
/// over HTTP, blocking the worker thread for each exchange.
fn remote_sender(
    parent_url: &str,
    temp_id: &ControllerId,
    parent: &ControllerId,
    secrets: &SharedSecrets,
    clock: &Arc<dyn Clock>,
) -> Result<
    Box<
        dyn Fn(
            MessageType,
            Map<String, Value>,
        ) -> Result<Option<MessageEnvelope>, ControllerError>,
    >,
    String,
> {
    let authenticator = Arc::new(
        MessageAuthenticator::new(secrets.bus_secret.clone(), temp_id.clone(), clock.clone())
            .map_err(|err| err.to_string())?,
    );
    let client = Arc::new(
        HttpEnvelopeClient::new(
            parent_url,
            Some(Arc::new(AuthenticatorGuard::new(authenticator))),
        )
        .map_err(|err| err.to_string())?,
    );
    let temp_id = temp_id.clone();
    let parent = parent.clone();
    let clock = clock.clone();
    Ok(Box::new(move |message_type, payload| {
        let envelope = MessageEnvelope::new(
            temp_id.clone(),
            parent.clone(),
            message_type,
            payload,
            None,
            clock.now(),
        );
        let client = client.clone();
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current()
                .block_on(client.send(envelope))
                .map_err(|err| ControllerError::Bus(err.to_string()))
        })
    }))
}

/// Serves the HTTP transport until ctrl-c arrives.
async fn serve_until_interrupt(
    controller_id: ControllerId,
    bus: Arc<RequestBus>,
    clock: Arc<dyn Clock>,
    port: u16,
) -> Result<(), String> {
    let transport = HttpTransport::new(controller_id.clone(), bus, clock);
    let address = SocketAddr::from(([0, 0, 0, 0], port));
    info!(controller = %controller_id, %address, "serving");
    tokio::select! {
        served = transport.serve(address) => served.map_err(|err| err.to_string()),
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|err| err.to_string())?;
            info!("interrupt received, shutting down");
            Ok(())
        }
    }
}

// ============================================================================
// SECTION: Operator Commands
// ============================================================================

/// Creates or migrates the NIB schema.
fn init_db(args: &InitDbArgs) -> ExitCode {
    init_logging(false);
    let secrets = match load_secrets(args.secret_file.as_ref()) {
        Ok(secrets) => secrets,
        Err(reason) => {
            error!(reason, "secret loading failed");
            return ExitCode::from(1);
        }
    };
    if let Some(parent) = args.db.parent()
        && !parent.as_os_str().is_empty()
        && let Err(err) = std::fs::create_dir_all(parent)
    {
        error!(error = %err, "database directory creation failed");
        return ExitCode::from(1);
    }
    match SqliteNib::open(&SqliteNibConfig::at_path(args.db.clone()), secrets.event_secret) {
        Ok(_) => {
            info!(db = %args.db.display(), "NIB schema ready");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "NIB initialization failed");
            ExitCode::from(1)
        }
    }
}

/// Probes a controller's `/health` endpoint.
async fn health_check(args: HealthArgs) -> ExitCode {
    init_logging(false);
    let client = match HttpEnvelopeClient::with_deadline(&args.url, None, args.timeout) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "client construction failed");
            return ExitCode::from(2);
        }
    };
    match client.health().await {
        Ok(health) => {
            info!(
                status = health.status,
                controller = health.controller_id,
                timestamp = health.timestamp,
                "controller healthy"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, url = args.url, "health check failed");
            ExitCode::from(1)
        }
    }
}

/// Mints bootstrap tokens for provisioning.
#[allow(clippy::print_stdout, reason = "Token output is consumed by provisioning pipelines.")]
fn gen_token(args: &GenTokenArgs) -> ExitCode {
    init_logging(false);
    let Some(role) = ControllerRole::from_label(&args.controller_type) else {
        error!(requested = args.controller_type, "unknown controller type");
        return ExitCode::from(2);
    };
    if role == ControllerRole::Global {
        error!("bootstrap tokens exist only for regional and local candidates");
        return ExitCode::from(2);
    }
    let secrets = match load_secrets(args.secret_file.as_ref()) {
        Ok(secrets) => secrets,
        Err(reason) => {
            error!(reason, "secret loading failed");
            return ExitCode::from(1);
        }
    };
    let authority = BootstrapAuthority::new(secrets.bootstrap_secret);
    let region = Region::new(args.region.clone());

    for index in 0..args.count.max(1) {
        let temp_id = match (&args.temp_id, index) {
            (Some(temp_id), 0) => temp_id.clone(),
            (Some(temp_id), _) => format!("{temp_id}-{index}"),
            (None, _) => format!("temp-{}-{}", role.as_str(), short_uuid()),
        };
        match authority.mint(&temp_id, &region, role) {
            Ok(token) => println!("{temp_id} {token}"),
            Err(err) => {
                error!(error = %err, "token computation failed");
                return ExitCode::from(1);
            }
        }
    }
    ExitCode::SUCCESS
}

/// Returns an 8-character lowercase hex id fragment.
fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string().chars().take(8).collect()
}
