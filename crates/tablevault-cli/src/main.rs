use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tablevault_api::{BackupOptions, RestoreOptions, TableVaultApi, VaultConfig};
use tablevault_core::{RestoreOutcome, RestoreRecord, SnapshotId, TableTransport};
use tablevault_transport::{DirectoryTransport, RestTransport};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_FILTER_ENV: &str = "TABLEVAULT_LOG";

#[derive(Debug, Parser)]
#[command(name = "tv")]
#[command(about = "TableVault snapshot and safe-restore CLI")]
struct Cli {
    /// YAML configuration file.
    #[arg(long, env = "TABLEVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the configuration file.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, env = "TABLEVAULT_URL")]
    url: Option<String>,

    #[arg(long, env = "TABLEVAULT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Read and write tables as JSON files in this directory instead of a remote store.
    #[arg(long)]
    source_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Backup(BackupArgs),
    List,
    Restore(RestoreArgs),
    Rollback(RollbackArgs),
    ListSafety,
    History(HistoryArgs),
    Tables,
}

#[derive(Debug, Args)]
struct BackupArgs {
    #[arg(long, default_value_t = false)]
    force_full: bool,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, default_value_t = false)]
    no_compress: bool,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(long)]
    snapshot: String,
    /// Capture the live tables before writing.
    #[arg(long, default_value_t = false)]
    safe: bool,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, default_value_t = false)]
    yes: bool,
}

#[derive(Debug, Args)]
struct RollbackArgs {
    safety_id: String,
    #[arg(long, default_value_t = false)]
    yes: bool,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert("contract_version".to_string(), Value::String(CLI_CONTRACT_VERSION.to_string()));
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Command::Backup(args) => run_backup(&connect(&cli, config)?, args),
        Command::List => {
            let snapshots = TableVaultApi::offline(config).list_snapshots()?;
            emit_json(json!({ "snapshots": snapshots }))
        }
        Command::Restore(args) => run_restore(&connect(&cli, config)?, args),
        Command::Rollback(args) => run_rollback(&connect(&cli, config)?, args),
        Command::ListSafety => {
            let captures = TableVaultApi::offline(config).list_safety_captures()?;
            emit_json(json!({ "safety_captures": captures }))
        }
        Command::History(args) => {
            let api = TableVaultApi::offline(config);
            emit_json(json!({
                "restores": api.list_restore_records(args.limit)?,
                "backups": api.list_backup_summaries(args.limit)?
            }))
        }
        Command::Tables => {
            let tables = connect(&cli, config)?.discover_tables()?;
            emit_json(json!({ "tables": tables }))
        }
    }
}

fn load_config(cli: &Cli) -> Result<VaultConfig> {
    let mut config = match &cli.config {
        Some(path) => VaultConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => VaultConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir.clone_from(dir);
    }
    config.validate()?;
    Ok(config)
}

fn connect(cli: &Cli, config: VaultConfig) -> Result<TableVaultApi> {
    let transport: Arc<dyn TableTransport> = if let Some(dir) = &cli.source_dir {
        Arc::new(DirectoryTransport::open(dir)?)
    } else {
        let (Some(url), Some(api_key)) = (&cli.url, &cli.api_key) else {
            bail!("a table transport is required: pass --source-dir, or --url together with --api-key");
        };
        let mut rest = RestTransport::new(url, api_key, Duration::from_secs(cli.timeout_secs))
            .with_default_order_column(&config.primary_key);
        for (table, key) in &config.primary_keys {
            rest = rest.with_order_column(table, key);
        }
        Arc::new(rest)
    };
    Ok(TableVaultApi::new(config, transport))
}

fn run_backup(api: &TableVaultApi, args: &BackupArgs) -> Result<()> {
    let report = api.run_backup(BackupOptions {
        force_full: args.force_full,
        workers: args.workers,
        compress: args.no_compress.then_some(false),
    })?;
    emit_json(json!({
        "snapshot": report.summary,
        "failed_tables": report.summary.failed_tables(),
        "retention": report.retention
    }))
}

fn run_restore(api: &TableVaultApi, args: &RestoreArgs) -> Result<()> {
    if !args.yes {
        bail!("restore overwrites live tables; re-run with --yes to confirm");
    }
    let snapshot_id = SnapshotId::parse(&args.snapshot)?;
    let record = api.run_restore(snapshot_id, RestoreOptions { safe: args.safe, workers: args.workers })?;
    emit_restore(&record)
}

fn run_rollback(api: &TableVaultApi, args: &RollbackArgs) -> Result<()> {
    if !args.yes {
        bail!("rollback overwrites and prunes live tables; re-run with --yes to confirm");
    }
    let safety_id = SnapshotId::parse(&args.safety_id)?;
    let record = api.run_rollback(safety_id)?;
    emit_restore(&record)
}

fn emit_restore(record: &RestoreRecord) -> Result<()> {
    emit_json(json!({ "restore": record }))?;
    if record.outcome == RestoreOutcome::FailedNeedsManualRollback {
        match record.safety_capture_id {
            Some(capture) => bail!(
                "restore {} left tables inconsistent; roll back with `tv rollback {capture} --yes`",
                record.restore_id
            ),
            None => bail!("restore {} left tables inconsistent and has no safety capture", record.restore_id),
        }
    }
    Ok(())
}
