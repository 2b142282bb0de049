use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use metric_ledger_api::{
    build_source, list_registry, migrate_history_pass, open_store, register_user, run_update_cycle,
    show_dataset, LedgerConfig, RegisterRequest, StoreBackend,
};
use metric_ledger_core::{parse_calendar_date, Cadence, MetricKind};
use metric_ledger_sources::{JsonFileSource, MetricSource};
use metric_ledger_store::SqliteSnapshotStore;
use serde_json::Value;
use time::{OffsetDateTime, PrimitiveDateTime, Time};

mod logging;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ml")]
#[command(about = "Metric Ledger CLI")]
struct Cli {
    /// YAML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path; overrides config and `METRIC_LEDGER_DB`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Remote KV worker URL; selects the worker backend.
    #[arg(long, global = true)]
    worker_url: Option<String>,

    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Update(UpdateArgs),
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    Registry {
        #[command(subcommand)]
        command: RegistryCommand,
    },
    Dataset {
        #[command(subcommand)]
        command: DatasetCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MetricArg {
    LeetcodeProblems,
    LeetcodeRating,
    GithubContributions,
}

impl From<MetricArg> for MetricKind {
    fn from(value: MetricArg) -> Self {
        match value {
            MetricArg::LeetcodeProblems => Self::LeetcodeProblems,
            MetricArg::LeetcodeRating => Self::LeetcodeRating,
            MetricArg::GithubContributions => Self::GithubContributions,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CadenceArg {
    Daily,
    Weekly,
}

impl From<CadenceArg> for Cadence {
    fn from(value: CadenceArg) -> Self {
        match value {
            CadenceArg::Daily => Self::Daily,
            CadenceArg::Weekly => Self::Weekly,
        }
    }
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[arg(long)]
    metric: MetricArg,
    #[arg(long)]
    cadence: CadenceArg,
    /// RFC3339 UTC cycle timestamp; defaults to now.
    #[arg(long)]
    at: Option<String>,
    /// Contest name; reads predicted ratings instead of the LeetCode profile rating.
    #[arg(long)]
    contest: Option<String>,
    /// Replay values from a `{username: integer | null}` JSON file instead of fetching.
    #[arg(long)]
    values_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    Migrate(HistoryMigrateArgs),
}

#[derive(Debug, Args)]
struct HistoryMigrateArgs {
    #[arg(long)]
    metric: MetricArg,
    /// Date given to the most recent legacy value (YYYY-MM-DD); defaults to today (UTC).
    #[arg(long)]
    reference_date: Option<String>,
    #[arg(long)]
    interval_days: Option<u32>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum RegistryCommand {
    Add(RegistryAddArgs),
    List,
}

#[derive(Debug, Args)]
struct RegistryAddArgs {
    #[arg(long)]
    leetcode: String,
    #[arg(long)]
    github: String,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum DatasetCommand {
    Show(DatasetShowArgs),
}

#[derive(Debug, Args)]
struct DatasetShowArgs {
    #[arg(long)]
    metric: MetricArg,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<LedgerConfig> {
    let mut config = LedgerConfig::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.store.sqlite_path.clone_from(db);
    }
    if let Some(url) = &cli.worker_url {
        config.store.backend = StoreBackend::Worker;
        config.store.worker_url = Some(url.clone());
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose)?;
    let config = resolve_config(&cli)?;

    match cli.command {
        Command::Update(args) => run_update(&config, &args),
        Command::History { command: HistoryCommand::Migrate(args) } => {
            run_history_migrate(&config, &args)
        }
        Command::Registry { command } => run_registry(&config, command),
        Command::Dataset { command: DatasetCommand::Show(args) } => run_dataset_show(&config, &args),
        Command::Db { command } => run_db(&config, &command),
    }
}

fn run_update(config: &LedgerConfig, args: &UpdateArgs) -> Result<()> {
    let metric = MetricKind::from(args.metric);
    let at = parse_cycle_timestamp(args.at.as_deref())?;
    let source: Box<dyn MetricSource> = match &args.values_file {
        Some(path) => Box::new(JsonFileSource::from_path(path, metric)?),
        None => build_source(config, metric, args.contest.as_deref())?,
    };

    let mut store = open_store(config)?;
    let report =
        run_update_cycle(store.as_mut(), &config.keys, source.as_ref(), args.cadence.into(), at)?;
    emit_json(serde_json::to_value(&report).context("failed to serialize cycle report")?)
}

fn run_history_migrate(config: &LedgerConfig, args: &HistoryMigrateArgs) -> Result<()> {
    let metric = MetricKind::from(args.metric);
    let reference_date = match args.reference_date.as_deref() {
        Some(raw) => parse_calendar_date(raw)?,
        None => OffsetDateTime::now_utc().date(),
    };
    let interval_days = args.interval_days.unwrap_or(config.history.interval_days);

    let mut store = open_store(config)?;
    let report = migrate_history_pass(
        store.as_mut(),
        config.keys.dataset(metric),
        reference_date,
        interval_days,
        args.dry_run,
    )?;
    emit_json(serde_json::to_value(&report).context("failed to serialize migration report")?)
}

fn run_registry(config: &LedgerConfig, command: RegistryCommand) -> Result<()> {
    let mut store = open_store(config)?;
    match command {
        RegistryCommand::Add(args) => {
            let at = parse_optional_rfc3339(args.at.as_deref())?;
            let registration = register_user(
                store.as_mut(),
                &config.keys,
                RegisterRequest {
                    leetcode_username: Some(args.leetcode),
                    github_username: Some(args.github),
                    display_name: args.display_name,
                },
                at,
            )?;
            emit_json(serde_json::json!({
                "registry_key": config.keys.registry,
                "registration": registration
            }))
        }
        RegistryCommand::List => {
            let users = list_registry(store.as_ref(), &config.keys)?;
            emit_json(serde_json::json!({
                "registry_key": config.keys.registry,
                "count": users.len(),
                "users": users
            }))
        }
    }
}

fn run_dataset_show(config: &LedgerConfig, args: &DatasetShowArgs) -> Result<()> {
    let store = open_store(config)?;
    let view = show_dataset(store.as_ref(), config.keys.dataset(args.metric.into()))?;
    emit_json(serde_json::to_value(&view).context("failed to serialize dataset view")?)
}

fn run_db(config: &LedgerConfig, command: &DbCommand) -> Result<()> {
    if config.store.backend != StoreBackend::Sqlite {
        return Err(anyhow!("db commands require the sqlite store backend"));
    }
    let mut store = SqliteSnapshotStore::open(&config.store.sqlite_path)?;

    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions,
                    "inferred_from_legacy": before.inferred_from_legacy
                }));
            }

            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "target_version": after.target_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
    }
}

fn parse_cycle_timestamp(value: Option<&str>) -> Result<PrimitiveDateTime> {
    let at = parse_optional_rfc3339(value)?;
    let time = Time::from_hms(at.hour(), at.minute(), at.second())
        .map_err(|err| anyhow!("invalid cycle time: {err}"))?;
    Ok(PrimitiveDateTime::new(at.date(), time))
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => parse_rfc3339(raw),
        None => Ok(OffsetDateTime::now_utc()),
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
