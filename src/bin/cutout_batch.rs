use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use cutout_batch::client::{Credentials, CutoutHttpClient};
use cutout_batch::config::{Config, ConfigLoader};
use cutout_batch::domain::Catalog;
use cutout_batch::error::CutoutError;
use cutout_batch::output::{JsonOutput, LogProgress, OutputMode};
use cutout_batch::pipeline::{Pipeline, ProgressSink, RunOptions, RunReport, UnitRange};
use cutout_batch::retry::CancelToken;
use cutout_batch::state::{StateStore, SubmissionState, UnitRecord};
use cutout_batch::store::Store;

#[derive(Parser)]
#[command(name = "cutout-batch")]
#[command(about = "Fetch survey image cutouts for a catalog and file them under catalog identity")]
#[command(version, author)]
struct Cli {
    /// Print results as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Chunk the catalog, download, extract and reconcile every unit")]
    Run(RunArgs),
    #[command(about = "Show the recorded state of every unit")]
    Status(StatusArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    catalog: Option<String>,

    /// Unit indices to process: `start..end`, `start..` or a single index.
    #[arg(long)]
    units: Option<UnitRange>,

    #[arg(long)]
    download_workers: Option<usize>,

    #[arg(long)]
    extract_workers: Option<usize>,

    /// Resubmit units the service rejected on an earlier run.
    #[arg(long)]
    retry_failed: bool,

    #[arg(long)]
    keep_archives: bool,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    config: Option<String>,
}

enum Outcome {
    Clean,
    Failures,
}

fn main() -> ExitCode {
    match run() {
        Ok(Outcome::Clean) => ExitCode::SUCCESS,
        Ok(Outcome::Failures) => ExitCode::from(4),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<CutoutError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &CutoutError) -> u8 {
    match error {
        CutoutError::MissingCatalog
        | CutoutError::CatalogRead(_)
        | CutoutError::CatalogParse { .. }
        | CutoutError::DuplicateObject(_)
        | CutoutError::InvalidObjectId(_)
        | CutoutError::InvalidBand(_)
        | CutoutError::ConfigRead(_)
        | CutoutError::ConfigParse(_)
        | CutoutError::ConfigInvalid(_) => 2,
        CutoutError::ServiceHttp(_)
        | CutoutError::ServiceStatus { .. }
        | CutoutError::RetriesExhausted { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<Outcome> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Run(args) => run_batch(args, output_mode),
        Commands::Status(args) => run_status(args, output_mode),
    }
}

fn run_batch(args: RunArgs, output_mode: OutputMode) -> miette::Result<Outcome> {
    let mut config = ConfigLoader::load(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    let resolved = ConfigLoader::resolve_config(config)?;

    let catalog = Catalog::load(
        resolved.catalog.path.as_std_path(),
        resolved.catalog.delimiter,
        resolved.catalog.has_header,
    )?;
    tracing::info!(path = %resolved.catalog.path, rows = catalog.len(), "catalog loaded");

    let client = CutoutHttpClient::new(
        resolved.service.url.clone(),
        Credentials::discover()?,
        resolved.service.expected_archive_bytes,
        resolved.service.timeout,
    )?;
    let store = Store::new_with_paths(resolved.work_dir.clone(), resolved.output_dir.clone());
    let pipeline = Pipeline::new(store, client, &resolved)?;

    let options = RunOptions {
        units: args.units,
        dry_run: args.dry_run,
        retry_failed: args.retry_failed,
    };
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &LogProgress,
    };
    let cancel = CancelToken::new();
    install_shutdown_handler(&cancel);
    let report = pipeline.run(&catalog, &options, sink, &cancel)?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_report(&report).into_diagnostic()?,
        OutputMode::Human => print_run_summary(&report),
    }

    if report.has_failures() {
        Ok(Outcome::Failures)
    } else {
        Ok(Outcome::Clean)
    }
}

/// Ctrl-C and SIGTERM stop new submissions and cut backoff sleeps short;
/// interrupted units are recorded and resume on the next run.
fn install_shutdown_handler(cancel: &CancelToken) {
    let cancel = cancel.clone();
    let installed = ctrlc::set_handler(move || {
        tracing::warn!("shutdown requested; finishing in-flight units");
        cancel.cancel();
    });
    if let Err(err) = installed {
        tracing::warn!(error = %err, "failed to install shutdown handler");
    }
}

fn run_status(args: StatusArgs, output_mode: OutputMode) -> miette::Result<Outcome> {
    let resolved = ConfigLoader::resolve_config(status_config(args.config.as_deref())?)?;
    let store = Store::new_with_paths(resolved.work_dir.clone(), resolved.output_dir.clone());
    let records = StateStore::new(&store).list()?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_status(&records).into_diagnostic()?,
        OutputMode::Human => print_status(&records),
    }
    Ok(Outcome::Clean)
}

/// Status only reads the work area, so a config without a catalog is fine.
fn status_config(path: Option<&str>) -> Result<Config, CutoutError> {
    let mut config = ConfigLoader::load(path)?;
    config
        .catalog
        .path
        .get_or_insert_with(|| "catalog.txt".to_string());
    Ok(config)
}

fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(catalog) = &args.catalog {
        config.catalog.path = Some(catalog.clone());
    }
    if let Some(workers) = args.download_workers {
        config.batch.download_workers = Some(workers);
    }
    if let Some(workers) = args.extract_workers {
        config.batch.extract_workers = Some(workers);
    }
    if args.keep_archives {
        config.keep_archives = Some(true);
    }
}

fn print_run_summary(report: &RunReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    let title = if report.dry_run {
        "cutout-batch plan"
    } else {
        "cutout-batch summary"
    };
    println!("{cyan}{title}{reset}");
    println!("{green}Reconciled files: {}{reset}", report.reconciled.len());
    println!("{cyan}Archives downloaded: {}{reset}", report.downloads);
    let color = if report.has_failures() { red } else { green };
    println!("{color}Failed requests: {}{reset}", report.failures.len());

    for unit in &report.units {
        let color = match unit.state {
            SubmissionState::Done => green,
            SubmissionState::Failed(_) => red,
            _ => yellow,
        };
        println!(
            "{color}  unit {:>4}  {:<24} rows={} reconciled={} missing={}{reset}",
            unit.index,
            unit.state.label(),
            unit.rows,
            unit.reconciled,
            unit.failures
        );
    }
}

fn print_status(records: &[UnitRecord]) {
    if records.is_empty() {
        println!("no units recorded yet");
        return;
    }
    for record in records {
        println!(
            "unit {:>4}  {:<24} rows={} attempts={} reconciled={} missing={}  {}",
            record.index,
            record.state.label(),
            record.rows,
            record.attempts,
            record.reconciled,
            record.failures.len(),
            record.updated_at
        );
    }
}
