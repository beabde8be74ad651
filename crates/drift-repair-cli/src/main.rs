use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use drift_repair_catalog_sqlite::{SqliteCatalog, DEFAULT_TABLE};
use drift_repair_core::{
    CancelToken, KeyFilter, KeyKind, ReconcileOptions, RepairReport, RetryPolicy, RunOutcome,
    StoreHandle, TtlReconciler, ValueReconciler, REPORT_CONTRACT_VERSION,
};
use drift_repair_resp::{EndpointConfig, RespStore};
use serde_json::Value;

mod config;

use config::{FileConfig, OptionsConfig};

const CHECK_CONTRACT_VERSION: &str = "check.v1";

#[derive(Debug, Parser)]
#[command(name = "drift-repair")]
#[command(about = "Repair expiration and value drift between a source and a target cache")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// YAML config file; flags and environment override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Source of truth, `redis://[user:password@]host[:port][/db]`.
    #[arg(long, env = "DRIFT_REPAIR_SOURCE_URL", global = true, hide_env_values = true)]
    source: Option<String>,

    /// Store being repaired.
    #[arg(long, env = "DRIFT_REPAIR_TARGET_URL", global = true, hide_env_values = true)]
    target: Option<String>,

    /// Read and compare everything, write nothing.
    #[arg(long, default_value_t = false, global = true)]
    dry_run: bool,

    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Retries per store call after a timeout or connection error.
    #[arg(long, global = true)]
    retries: Option<u32>,

    #[arg(long, global = true)]
    connect_timeout_ms: Option<u64>,

    #[arg(long, global = true)]
    command_timeout_ms: Option<u64>,

    /// Key filter such as `abc*|efg|m*`; `*` only as a trailing prefix marker.
    #[arg(long, global = true)]
    filter: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Rewrite drifted expirations of string keys on the target.
    Ttl(TtlArgs),
    /// Copy catalogued mismatched values from the source to the target.
    Values(ValuesArgs),
    /// Check both stores answer and summarise the catalog.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct TtlArgs {
    #[arg(long)]
    page_size: Option<usize>,
    #[arg(long)]
    tolerance_ms: Option<u64>,
}

#[derive(Debug, Args)]
struct CatalogArgs {
    /// Full-check result database.
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Conflict table, e.g. `key` or `key_2` for a later comparison round.
    #[arg(long)]
    table: Option<String>,
    /// Only rows recorded for this logical database.
    #[arg(long)]
    db: Option<i64>,
}

#[derive(Debug, Args)]
struct ValuesArgs {
    #[command(flatten)]
    catalog: CatalogArgs,
    #[arg(long)]
    slice_size: Option<usize>,
    /// Restrict to these kinds; repeatable. Defaults to all three.
    #[arg(long = "kind", value_enum)]
    kinds: Vec<KindArg>,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[command(flatten)]
    catalog: CatalogArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    String,
    Set,
    Hash,
}

impl From<KindArg> for KeyKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::String => KeyKind::String,
            KindArg::Set => KeyKind::Set,
            KindArg::Hash => KeyKind::Hash,
        }
    }
}

fn with_contract_version(value: Value, version: &str) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert("contract_version".to_string(), Value::String(version.to_string()));
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": version,
            "payload": other
        }),
    }
}

fn emit_json(value: Value, version: &str) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value, version))?);
    Ok(())
}

fn init_tracing() {
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Cancel `token` on Ctrl-C. Listens from a helper thread on a
/// current-thread runtime.
fn install_interrupt_handler(token: CancelToken) {
    let spawned = std::thread::Builder::new().name("interrupt".to_string()).spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build();
        match runtime {
            Ok(runtime) => runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; finishing in-flight work");
                    token.cancel();
                }
            }),
            Err(err) => tracing::warn!(error = %err, "interrupt handler unavailable"),
        }
    });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "interrupt handler unavailable");
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() { ExitCode::from(1) } else { ExitCode::SUCCESS };
        }
    };
    init_tracing();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "drift-repair failed");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let file = match &cli.global.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    match cli.command {
        Command::Ttl(args) => run_ttl(&cli.global, &args, &file),
        Command::Values(args) => run_values(&cli.global, &args, &file),
        Command::Check(args) => run_check(&cli.global, &args, &file),
    }
}

fn run_ttl(global: &GlobalArgs, args: &TtlArgs, file: &FileConfig) -> Result<ExitCode> {
    let mut options = resolve_options(global, &file.options);
    if let Some(page_size) = args.page_size {
        options.page_size = page_size;
    }
    if let Some(tolerance_ms) = args.tolerance_ms {
        options.tolerance_ms = tolerance_ms;
    }
    options.validate()?;
    let (source, target) = open_stores(global, file)?;

    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());
    let report = TtlReconciler::new(&source, &target, &options).with_cancel(cancel).run();
    emit_report(&report)
}

fn run_values(global: &GlobalArgs, args: &ValuesArgs, file: &FileConfig) -> Result<ExitCode> {
    let mut options = resolve_options(global, &file.options);
    if let Some(slice_size) = args.slice_size {
        options.slice_size = slice_size;
    }
    options.validate()?;
    let kinds = if args.kinds.is_empty() {
        KeyKind::ALL.to_vec()
    } else {
        args.kinds.iter().copied().map(KeyKind::from).collect()
    };
    let (source, target) = open_stores(global, file)?;

    let catalog = match open_catalog(&args.catalog, file) {
        Ok(Some(catalog)) => catalog,
        Ok(None) => {
            return Err(anyhow!(
                "no catalog configured; pass --catalog or set `catalog.path` in the config file"
            ))
        }
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "catalog unreadable");
            let report = RepairReport::aborted_before_start(
                drift_repair_core::PassKind::Values,
                options.dry_run,
                format!("catalog unreadable: {err:#}"),
            );
            return emit_report(&report);
        }
    };

    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());
    let report = ValueReconciler::new(&source, &target, &catalog, &options)
        .with_cancel(cancel)
        .run_kinds(&kinds);
    emit_report(&report)
}

fn run_check(global: &GlobalArgs, args: &CheckArgs, file: &FileConfig) -> Result<ExitCode> {
    let options = resolve_options(global, &file.options);
    let (source, target) = open_stores(global, file)?;

    let mut healthy = true;
    let mut stores = serde_json::Map::new();
    for (role, store) in [("source", &source), ("target", &target)] {
        let handle = StoreHandle::new(store, options.retry);
        let status = match handle.ping() {
            Ok(()) => serde_json::json!({ "endpoint": handle.endpoint(), "reachable": true }),
            Err(err) => {
                healthy = false;
                tracing::error!(role, endpoint = handle.endpoint(), error = %err, "store unreachable");
                serde_json::json!({
                    "endpoint": handle.endpoint(),
                    "reachable": false,
                    "error": err.to_string(),
                })
            }
        };
        stores.insert(role.to_string(), status);
    }

    let catalog = match open_catalog(&args.catalog, file).and_then(|catalog| {
        catalog.map(|catalog| catalog.summary()).transpose()
    }) {
        Ok(Some(summary)) => serde_json::to_value(summary)?,
        Ok(None) => Value::Null,
        Err(err) => {
            healthy = false;
            serde_json::json!({ "error": format!("{err:#}") })
        }
    };

    let mut payload = serde_json::Map::new();
    payload.insert("healthy".to_string(), Value::Bool(healthy));
    payload.extend(stores);
    payload.insert("catalog".to_string(), catalog);
    emit_json(Value::Object(payload), CHECK_CONTRACT_VERSION)?;
    Ok(if healthy { ExitCode::SUCCESS } else { ExitCode::from(1) })
}

fn emit_report(report: &RepairReport) -> Result<ExitCode> {
    let value = serde_json::to_value(report).context("failed to serialize report")?;
    emit_json(value, REPORT_CONTRACT_VERSION)?;
    Ok(match report.outcome() {
        RunOutcome::Complete => ExitCode::SUCCESS,
        RunOutcome::Partial => ExitCode::from(2),
        RunOutcome::Cancelled | RunOutcome::Aborted => ExitCode::from(1),
    })
}

/// Defaults, then the config file, then flags.
fn resolve_options(global: &GlobalArgs, file: &OptionsConfig) -> ReconcileOptions {
    let defaults = ReconcileOptions::default();
    let retry = RetryPolicy::new(
        global.retries.or(file.retries).unwrap_or(defaults.retry.retries),
        file.initial_backoff_ms.map_or(defaults.retry.initial_backoff, Duration::from_millis),
        file.max_backoff_ms.map_or(defaults.retry.max_backoff, Duration::from_millis),
    );
    let filter = global.filter.as_deref().or(file.filter.as_deref());
    ReconcileOptions {
        dry_run: global.dry_run || file.dry_run.unwrap_or(false),
        page_size: file.page_size.unwrap_or(defaults.page_size),
        tolerance_ms: file.tolerance_ms.unwrap_or(defaults.tolerance_ms),
        slice_size: file.slice_size.unwrap_or(defaults.slice_size),
        workers: global.workers.or(file.workers).unwrap_or(defaults.workers),
        retry,
        key_filter: filter.map(KeyFilter::parse).unwrap_or_default(),
    }
}

fn resolve_endpoint(
    role: &str,
    flag: Option<&str>,
    file: Option<&EndpointConfig>,
    global: &GlobalArgs,
) -> Result<EndpointConfig> {
    let mut config = match (flag, file) {
        (Some(url), Some(file)) => EndpointConfig { url: url.to_string(), ..file.clone() },
        (Some(url), None) => EndpointConfig::with_url(url),
        (None, Some(file)) => file.clone(),
        (None, None) => {
            return Err(anyhow!(
                "no {role} endpoint configured; pass --{role}, set DRIFT_REPAIR_{}_URL, or add `{role}.url` to the config file",
                role.to_uppercase()
            ))
        }
    };
    if let Some(ms) = global.connect_timeout_ms {
        config.connect_timeout_ms = ms;
    }
    if let Some(ms) = global.command_timeout_ms {
        config.command_timeout_ms = ms;
    }
    Ok(config)
}

fn open_stores(global: &GlobalArgs, file: &FileConfig) -> Result<(RespStore, RespStore)> {
    let source = resolve_endpoint("source", global.source.as_deref(), file.source.as_ref(), global)?;
    let target = resolve_endpoint("target", global.target.as_deref(), file.target.as_ref(), global)?;
    let source = RespStore::new(&source).context("invalid source endpoint")?;
    let target = RespStore::new(&target).context("invalid target endpoint")?;
    Ok((source, target))
}

fn open_catalog(args: &CatalogArgs, file: &FileConfig) -> Result<Option<SqliteCatalog>> {
    let Some(path) = args.catalog.as_ref().or(file.catalog.path.as_ref()) else {
        return Ok(None);
    };
    let table = args.table.as_deref().or(file.catalog.table.as_deref()).unwrap_or(DEFAULT_TABLE);
    let catalog = SqliteCatalog::open(path, table)?.with_db_filter(args.db.or(file.catalog.db))?;
    Ok(Some(catalog))
}
