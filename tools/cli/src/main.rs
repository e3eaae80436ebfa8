//! Buddy sync CLI - inspect and exercise the local sync log.
//!
//! This tool records changes into a device's SQLite sync log, reports its
//! status, and runs a two-device convergence demo against in-memory stores.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use buddy_common::{DeviceInfo, DeviceType, OperationType, RecordKey, SyncStatus};
use buddy_storage::{LocalStore, MemoryLocalStore, MemoryRemoteStore, RemoteStore, SqliteLocalStore};
use buddy_sync::{
    ChangeRequest, ChangeTracker, EventBus, NetworkQuality, SyncConfig, SyncContext, SyncEngine,
    SyncScheduler, TrackOutcome,
};

#[derive(Parser)]
#[command(name = "buddy-sync")]
#[command(about = "Buddy - offline-first device sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the sync database and configuration.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file (default: <data-dir>/config.json when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Identity of this device.
    #[arg(long, global = true, default_value = "cli")]
    device_id: String,

    /// Owner of this device.
    #[arg(long, global = true, default_value = "local")]
    user_id: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a change and queue it for sync.
    Track {
        /// Table the record belongs to.
        #[arg(short, long)]
        table: String,

        /// Record identifier.
        #[arg(short, long)]
        id: String,

        /// CREATE, UPDATE, DELETE or UPSERT.
        #[arg(short, long, default_value = "UPDATE")]
        op: OperationType,

        /// Record payload as JSON.
        #[arg(short, long, default_value = "{}")]
        data: String,
    },

    /// Show sync status as JSON.
    Status,

    /// List records waiting to be pushed.
    Pending {
        /// Only this table.
        #[arg(short, long)]
        table: Option<String>,
    },

    /// List conflict audit entries.
    Conflicts {
        /// Only this table.
        #[arg(short, long, requires = "id")]
        table: Option<String>,

        /// Only this record.
        #[arg(short, long, requires = "table")]
        id: Option<String>,
    },

    /// Run a desktop/watch conflict demo against in-memory stores.
    Simulate {
        /// Value the desktop writes.
        #[arg(long, default_value = "solarized")]
        desktop_value: String,

        /// Value the watch writes.
        #[arg(long, default_value = "high-contrast")]
        watch_value: String,
    },

    /// Print the effective configuration.
    Config {
        /// Write it to the configuration file as well.
        #[arg(short, long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG takes precedence over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::data_dir()
            .context("No data directory on this platform; pass --data-dir")?
            .join("buddy"),
    };
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join("config.json"));

    match cli.command {
        Commands::Track {
            table,
            id,
            op,
            data,
        } => {
            let data: Value = serde_json::from_str(&data).context("Payload is not valid JSON")?;
            let node = Node::open(&data_dir, &config_path, &cli.device_id, &cli.user_id).await?;
            cmd_track(&node, &table, &id, op, data).await
        }

        Commands::Status => {
            let node = Node::open(&data_dir, &config_path, &cli.device_id, &cli.user_id).await?;
            let status = node.scheduler.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }

        Commands::Pending { table } => cmd_pending(&data_dir, table.as_deref()).await,

        Commands::Conflicts { table, id } => cmd_conflicts(&data_dir, table.zip(id)).await,

        Commands::Simulate {
            desktop_value,
            watch_value,
        } => cmd_simulate(&desktop_value, &watch_value).await,

        Commands::Config { write } => cmd_config(&config_path, write),
    }
}

fn load_config(path: &Path) -> Result<SyncConfig> {
    if path.exists() {
        SyncConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
    } else {
        Ok(SyncConfig::default())
    }
}

fn open_store(data_dir: &Path) -> Result<Arc<SqliteLocalStore>> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let store = SqliteLocalStore::open(data_dir.join("sync.db")).context("Failed to open sync database")?;
    Ok(Arc::new(store))
}

/// A device backed by the on-disk log. No transport ships with this tool, so
/// the remote is unreachable and everything stays queued.
struct Node {
    scheduler: Arc<SyncScheduler>,
    tracker: ChangeTracker,
}

impl Node {
    async fn open(data_dir: &Path, config_path: &Path, device_id: &str, user_id: &str) -> Result<Self> {
        let config = load_config(config_path)?;
        let local: Arc<dyn LocalStore> = open_store(data_dir)?;
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_reachable(false);

        let (events, _) = EventBus::channel(config.event_capacity);
        let engine = SyncEngine::new(&config, device_id, user_id, local, remote, events.clone())
            .await
            .context("Failed to start sync engine")?;
        if engine.registry().device(device_id).await.is_none() {
            engine
                .register_device(DeviceInfo::new(device_id, user_id, DeviceType::Desktop, device_id))
                .await
                .context("Failed to register device")?;
        }

        let context = SyncContext::for_device(DeviceType::Desktop).with_network(NetworkQuality::Offline);
        let scheduler = SyncScheduler::new(
            engine.clone(),
            config.scheduler.clone(),
            config.retry.clone(),
            context,
            events.clone(),
        );
        scheduler.restore().await.context("Failed to restore queue")?;
        let tracker = ChangeTracker::new(engine, scheduler.clone(), config.tracker, events);
        Ok(Self { scheduler, tracker })
    }
}

/// Record one change.
async fn cmd_track(node: &Node, table: &str, id: &str, op: OperationType, data: Value) -> Result<()> {
    info!("Tracking {} {}/{}", op, table, id);

    let outcome = node
        .tracker
        .track_change(ChangeRequest::new(table, id, op, data))
        .await
        .context("Failed to track change")?;

    match outcome {
        TrackOutcome::Ignored => println!("Table '{}' is not synced; change ignored.", table),
        TrackOutcome::Unchanged => println!("No change to {}/{}.", table, id),
        TrackOutcome::Queued { priority } => println!("Queued {}/{} at {} priority.", table, id, priority),
        TrackOutcome::Deferred => println!("Recorded {}/{}; the queue is full.", table, id),
        TrackOutcome::Rejected { reason } => anyhow::bail!("Change rejected: {}", reason),
    }
    Ok(())
}

/// List pending records.
async fn cmd_pending(data_dir: &Path, table: Option<&str>) -> Result<()> {
    let store = open_store(data_dir)?;
    let pending = store
        .list_pending(table)
        .await
        .context("Failed to read sync log")?;

    if pending.is_empty() {
        println!("Nothing pending.");
        return Ok(());
    }

    println!("{:<16} {:<24} {:<8} {:<8} {:>7}", "TABLE", "RECORD", "OP", "STATUS", "VERSION");
    println!("{}", "-".repeat(67));
    for record in pending {
        println!(
            "{:<16} {:<24} {:<8} {:<8} {:>7}",
            record.table_name,
            record.record_id,
            record.operation.to_string(),
            record.status.as_str(),
            record.sync_version
        );
    }
    Ok(())
}

/// List conflict audits.
async fn cmd_conflicts(data_dir: &Path, filter: Option<(String, String)>) -> Result<()> {
    let store = open_store(data_dir)?;
    let key = filter
        .map(|(table, id)| RecordKey::new(table, id))
        .transpose()
        .context("Invalid record key")?;
    let audits = store
        .list_conflict_audits(key.as_ref())
        .await
        .context("Failed to read conflict audits")?;
    println!("{}", serde_json::to_string_pretty(&audits)?);
    Ok(())
}

/// Two devices edit the same preference offline, then converge.
async fn cmd_simulate(desktop_value: &str, watch_value: &str) -> Result<()> {
    let remote = Arc::new(MemoryRemoteStore::new());
    let desktop = SimDevice::start("desktop-1", DeviceType::Desktop, remote.clone()).await?;
    let watch = SimDevice::start("watch-1", DeviceType::Watch, remote.clone()).await?;

    info!("Both devices go offline and edit preferences/theme");
    remote.set_reachable(false);
    desktop.set_network(NetworkQuality::Offline).await;
    watch.set_network(NetworkQuality::Offline).await;
    desktop.track(desktop_value).await?;
    watch.track(watch_value).await?;

    info!("Back online: desktop syncs first, then the watch");
    remote.set_reachable(true);
    desktop.set_network(NetworkQuality::Good).await;
    watch.set_network(NetworkQuality::Good).await;
    desktop.cycle().await?;
    watch.cycle().await?;
    desktop.cycle().await?;

    let key = RecordKey::new("preferences", "theme")?;
    let stored = remote
        .get_record(&key)
        .await?
        .context("Remote has no theme record")?;
    println!("Remote:  {} (v{})", stored.data["value"], stored.sync_version);
    for device in [&desktop, &watch] {
        let row = device.local.get_record(&key).await?;
        let record = device.scheduler_record(&key).await;
        match row {
            Some(row) => println!(
                "{:<8} {} (v{}, {})",
                format!("{}:", device.name),
                row.data["value"],
                row.sync_version,
                record.map(|s| s.as_str()).unwrap_or("untracked")
            ),
            None => println!("{:<8} <missing>", format!("{}:", device.name)),
        }
    }

    let audits = watch.local.list_conflict_audits(Some(&key)).await?;
    println!("Conflict audits on watch: {}", audits.len());
    Ok(())
}

struct SimDevice {
    name: &'static str,
    engine: Arc<SyncEngine>,
    scheduler: Arc<SyncScheduler>,
    tracker: ChangeTracker,
    local: Arc<MemoryLocalStore>,
}

impl SimDevice {
    async fn start(device_id: &str, device_type: DeviceType, remote: Arc<MemoryRemoteStore>) -> Result<Self> {
        let mut config = SyncConfig::default();
        config.engine.immediate_sync = false;
        config.scheduler.immediate_sync = false;

        let local = Arc::new(MemoryLocalStore::new());
        let (events, _) = EventBus::channel(config.event_capacity);
        let engine = SyncEngine::new(&config, device_id, "demo-user", local.clone(), remote, events.clone()).await?;
        engine
            .register_device(DeviceInfo::new(device_id, "demo-user", device_type, device_id))
            .await?;
        let scheduler = SyncScheduler::new(
            engine.clone(),
            config.scheduler.clone(),
            config.retry.clone(),
            SyncContext::for_device(device_type),
            events.clone(),
        );
        let tracker = ChangeTracker::new(engine.clone(), scheduler.clone(), config.tracker, events);
        Ok(Self {
            name: device_type.as_str(),
            engine,
            scheduler,
            tracker,
            local,
        })
    }

    async fn set_network(&self, quality: NetworkQuality) {
        self.scheduler
            .update_context(|ctx| ctx.network_quality = quality)
            .await;
    }

    async fn track(&self, value: &str) -> Result<()> {
        let outcome = self
            .tracker
            .track_change(ChangeRequest::new(
                "preferences",
                "theme",
                OperationType::Update,
                serde_json::json!({ "value": value }),
            ))
            .await?;
        info!("{} tracked theme={}: {:?}", self.name, value, outcome);
        Ok(())
    }

    async fn cycle(&self) -> Result<()> {
        if let Some(report) = self.scheduler.sync_cycle().await? {
            info!(
                "{} cycle: {} pushed, {} conflicts, {} pulled",
                self.name, report.completed, report.conflicts, report.pulled
            );
        }
        Ok(())
    }

    async fn scheduler_record(&self, key: &RecordKey) -> Option<SyncStatus> {
        self.engine.record(key).await.map(|r| r.status)
    }
}

/// Print, and optionally save, the configuration.
fn cmd_config(path: &Path, write: bool) -> Result<()> {
    let config = load_config(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    if write {
        config
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Configuration written to {}", path.display());
    }
    Ok(())
}
