use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use ferry_core::{JobId, JobLedger, JobSummary};
use ferry_import::{
    AuditFilter, AuditLog, ImportExecutor, ImportFailure, ImportOptions, ImportReport,
    RampConfig, read_tuple_file,
};
use ferry_store::{FerryConfig, ImportConfig, LedgerStore, load_or_init_config};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let cancel = cancellation_token(cli.timeout_seconds);
    match cli.command {
        Command::Import(command) => match command {
            ImportCommand::Create(args) => import_create(&cli.datastore, args, &cancel).await,
            ImportCommand::Status(args) => import_status(&cli.datastore, args).await,
            ImportCommand::Retry(args) => import_retry(&cli.datastore, args, &cancel).await,
            ImportCommand::List => import_list(&cli.datastore).await,
        },
        Command::Tuple(command) => match command {
            TupleCommand::Write(args) => tuple_apply(&cli.datastore, args, Mode::Write, &cancel).await,
            TupleCommand::Delete(args) => {
                tuple_apply(&cli.datastore, args, Mode::Delete, &cancel).await
            }
            TupleCommand::Read(args) => tuple_read(&cli.datastore, args).await,
        },
    }
}

#[derive(Parser)]
#[command(
    name = "ferry",
    author,
    version,
    about = "Durable, rate-controlled bulk import of relationship tuples"
)]
struct Cli {
    /// Directory holding ferry.json and the default SQLite ledger.
    #[arg(long, global = true, default_value = ".ferry")]
    datastore: PathBuf,
    /// Stop dispatching new batches after this many seconds.
    #[arg(long, global = true)]
    timeout_seconds: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Durable import jobs backed by the ledger.
    #[command(subcommand)]
    Import(ImportCommand),
    /// Write, delete or read tuples directly, without a job.
    #[command(subcommand)]
    Tuple(TupleCommand),
}

#[derive(Subcommand)]
enum ImportCommand {
    /// Record a tuple file as a new job and run it.
    Create(CreateArgs),
    /// Show progress counts for a job.
    Status(StatusArgs),
    /// Reset failed tuples of a job to pending and run the job again.
    Retry(RetryArgs),
    /// List every job in the ledger.
    List,
}

#[derive(Subcommand)]
enum TupleCommand {
    /// Write every tuple of a file.
    Write(ApplyArgs),
    /// Delete every tuple of a file.
    Delete(ApplyArgs),
    /// Print the tuples stored for a store.
    Read(ReadArgs),
}

#[derive(Args, Clone, Debug, Default)]
struct RateArgs {
    /// Requests per second at the start of the ramp.
    #[arg(long)]
    initial_request_rate: Option<u32>,
    /// Requests per second once the ramp completes.
    #[arg(long)]
    max_requests: Option<u32>,
    /// Seconds over which the rate grows from initial to maximum.
    #[arg(long)]
    ramp_interval_seconds: Option<u64>,
    /// Tuples sent per write call.
    #[arg(long)]
    max_tuples_per_write: Option<usize>,
    /// Write calls allowed in flight at once.
    #[arg(long)]
    max_parallel_requests: Option<usize>,
}

#[derive(Args, Clone, Debug, Default)]
struct OutputArgs {
    /// Append each outcome to this file (.json/.jsonl, .yaml/.yml or .csv).
    #[arg(long)]
    output_file: Option<PathBuf>,
    /// Only record failed tuples in the output file.
    #[arg(long, default_value_t = false)]
    failed_only: bool,
    /// Print failed tuples and their reasons as JSON.
    #[arg(long, default_value_t = false)]
    show_failures: bool,
}

#[derive(Args)]
struct CreateArgs {
    /// Tuple file (.json, .yaml/.yml or .csv).
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    store_id: String,
    #[command(flatten)]
    rate: RateArgs,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    job_id: JobId,
}

#[derive(Args)]
struct RetryArgs {
    #[arg(long)]
    job_id: JobId,
    #[command(flatten)]
    rate: RateArgs,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct ApplyArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    store_id: String,
    #[command(flatten)]
    rate: RateArgs,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct ReadArgs {
    #[arg(long)]
    store_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Write,
    Delete,
}

/// Cancel on Ctrl-C or when the optional deadline passes.
fn cancellation_token(timeout_seconds: Option<u64>) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let deadline = async {
            match timeout_seconds {
                Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::warn!("cli: interrupted; waiting for in-flight batches");
            }
            _ = deadline => {
                log::warn!("cli: timeout reached; waiting for in-flight batches");
            }
        }
        trigger.cancel();
    });
    token
}

fn import_options(config: &FerryConfig, rate: &RateArgs) -> Result<ImportOptions> {
    let defaults = config.import_defaults();
    build_options(&defaults, rate)
}

fn build_options(defaults: &ImportConfig, rate: &RateArgs) -> Result<ImportOptions> {
    let fallback = ImportConfig::with_defaults();
    let tick_ms = defaults.tick_ms.or(fallback.tick_ms).unwrap_or(1_000).max(1);
    let ramp_period = match rate.ramp_interval_seconds {
        Some(seconds) => u32::try_from(seconds.saturating_mul(1_000) / tick_ms)
            .context("ramp interval is too long")?,
        None => defaults.ramp_period_ticks.unwrap_or(0),
    };
    let max_rps = rate.max_requests.or(defaults.max_rps).unwrap_or(10);
    // An explicit floor is validated as given; a configured one yields to a lower ceiling.
    let min_rps = match rate.initial_request_rate {
        Some(initial) => initial,
        None => defaults.min_rps.unwrap_or(1).min(max_rps),
    };
    let options = ImportOptions {
        max_tuples_per_write: rate
            .max_tuples_per_write
            .or(defaults.max_tuples_per_write)
            .unwrap_or(1),
        ramp: RampConfig {
            min_rps,
            max_rps,
            ramp_period,
            tick: Duration::from_millis(tick_ms),
            max_in_flight: rate
                .max_parallel_requests
                .or(defaults.max_parallel_requests)
                .unwrap_or(4),
        },
    };
    options.validate()?;
    Ok(options)
}

async fn open(datastore: &Path) -> Result<(FerryConfig, LedgerStore)> {
    let config = load_or_init_config(datastore)
        .with_context(|| format!("load config under {}", datastore.display()))?;
    let ledger = LedgerStore::connect(&config, datastore)
        .await
        .with_context(|| format!("open ledger under {}", datastore.display()))?;
    Ok((config, ledger))
}

fn build_executor(
    ledger: &LedgerStore,
    options: ImportOptions,
    output: &OutputArgs,
) -> Result<ImportExecutor> {
    let writer = Arc::new(ledger.tuple_store());
    let mut executor = ImportExecutor::new(Arc::new(ledger.clone()), writer, options)?;
    if let Some(path) = &output.output_file {
        let filter = if output.failed_only {
            AuditFilter::FailedOnly
        } else {
            AuditFilter::All
        };
        let audit = AuditLog::open(path, filter)
            .with_context(|| format!("open output file {}", path.display()))?;
        executor = executor.with_audit(audit);
    }
    Ok(executor)
}

async fn import_create(
    datastore: &Path,
    args: CreateArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let (config, ledger) = open(datastore).await?;
    let options = import_options(&config, &args.rate)?;
    let tuples = read_tuple_file(&args.file)
        .with_context(|| format!("read tuples from {}", args.file.display()))?;
    let job_id = ledger.create_job(&args.store_id, tuples).await?;
    println!("created job {job_id} for store {}", args.store_id);

    let executor = build_executor(&ledger, options, &args.output)?;
    let outcome = executor.run_job(job_id, cancel).await;
    settle(Some(job_id), outcome, &args.output)
}

async fn import_status(datastore: &Path, args: StatusArgs) -> Result<()> {
    let (_, ledger) = open(datastore).await?;
    let summary = ledger
        .get_job(args.job_id)
        .await?
        .ok_or_else(|| anyhow!("job {} not found", args.job_id))?;
    let (remaining, done) = ledger.get_total_and_remaining_tuples(args.job_id).await?;
    println!("{}", describe_job(&summary)?);
    if remaining == 0 {
        println!("complete: {done} of {done} tuples processed");
    } else {
        println!("in progress: {done} processed, {remaining} remaining");
    }
    Ok(())
}

async fn import_retry(
    datastore: &Path,
    args: RetryArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let (config, ledger) = open(datastore).await?;
    let options = import_options(&config, &args.rate)?;
    let executor = build_executor(&ledger, options, &args.output)?;
    let outcome = executor.retry_job(args.job_id, cancel).await;
    settle(Some(args.job_id), outcome, &args.output)
}

async fn import_list(datastore: &Path) -> Result<()> {
    let (_, ledger) = open(datastore).await?;
    let jobs = ledger.list_jobs().await?;
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }
    for job in &jobs {
        println!("{}", describe_job(job)?);
    }
    Ok(())
}

async fn tuple_apply(
    datastore: &Path,
    args: ApplyArgs,
    mode: Mode,
    cancel: &CancellationToken,
) -> Result<()> {
    let (config, ledger) = open(datastore).await?;
    let options = import_options(&config, &args.rate)?;
    let tuples = read_tuple_file(&args.file)
        .with_context(|| format!("read tuples from {}", args.file.display()))?;
    let (writes, deletes) = match mode {
        Mode::Write => (tuples, Vec::new()),
        Mode::Delete => (Vec::new(), tuples),
    };
    let executor = build_executor(&ledger, options, &args.output)?;
    let outcome = executor
        .run_tuples(&args.store_id, writes, deletes, cancel)
        .await;
    settle(None, outcome, &args.output)
}

async fn tuple_read(datastore: &Path, args: ReadArgs) -> Result<()> {
    let (_, ledger) = open(datastore).await?;
    let tuples = ledger.tuple_store().list_tuples(&args.store_id).await?;
    println!("{}", serde_json::to_string_pretty(&tuples)?);
    Ok(())
}

/// Print the counts of a run, including a run that stopped early.
fn settle(
    job_id: Option<JobId>,
    outcome: Result<ImportReport, ImportFailure>,
    output: &OutputArgs,
) -> Result<()> {
    let failure = match outcome {
        Ok(report) => return finish_report(job_id, &report, output),
        Err(failure) => failure,
    };
    if let Some(partial) = &failure.partial {
        print_report(job_id, partial, output)?;
    }
    Err(match job_id {
        Some(job_id) => anyhow!(
            "job {job_id} stopped: {}; resume with `ferry import retry --job-id {job_id}`",
            failure.error
        ),
        None => anyhow!("run stopped: {}", failure.error),
    })
}

fn finish_report(job_id: Option<JobId>, report: &ImportReport, output: &OutputArgs) -> Result<()> {
    print_report(job_id, report, output)?;
    let failed = report.result.failure_count();
    if failed > 0 {
        return Err(anyhow!("{failed} tuples failed"));
    }
    Ok(())
}

fn print_report(job_id: Option<JobId>, report: &ImportReport, output: &OutputArgs) -> Result<()> {
    let result = &report.result;
    match (job_id, report.progress) {
        (Some(job_id), Some(progress)) => println!(
            "job {job_id}: {} succeeded, {} failed this run; ledger totals: {} inserted, {} failed, {} pending",
            result.success_count(),
            result.failure_count(),
            progress.inserted,
            progress.failed,
            progress.pending
        ),
        _ => println!(
            "{} succeeded, {} failed",
            result.success_count(),
            result.failure_count()
        ),
    }
    if output.show_failures && !result.failed.is_empty() {
        println!("{}", serde_json::to_string_pretty(&result.failed)?);
    }
    if let Some(path) = &output.output_file {
        println!("outcomes recorded in {}", path.display());
    }
    Ok(())
}

fn describe_job(job: &JobSummary) -> Result<String> {
    let progress = &job.progress;
    Ok(format!(
        "{}  store={}  created={}  total={} inserted={} failed={} pending={}",
        job.job_id,
        job.store_id,
        format_millis(job.created_at)?,
        progress.total(),
        progress.inserted,
        progress.failed,
        progress.pending
    ))
}

fn format_millis(millis: i64) -> Result<String> {
    let timestamp = OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .context("timestamp out of range")?;
    Ok(timestamp.format(&Rfc3339)?)
}
