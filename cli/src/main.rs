//! Thin CLI shell over `mobilecombackup-core`: argument parsing, exit-code
//! translation, and user-facing text live here and nowhere else (§1, §9).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use mobilecombackup_core::cancel::CancellationToken;
use mobilecombackup_core::fs::{FileSystem, RealFs};
use mobilecombackup_core::importer::{self, ExitClass, ImportOptions, RecordFilter};
use mobilecombackup_core::progress::LoggingProgressSink;
use mobilecombackup_core::repo::{self, RepoLock, RepoPaths};
use mobilecombackup_core::validate::{self, ValidateOptions};

const REPO_ROOT_ENV: &str = "MB_REPO_ROOT";

#[derive(Parser)]
#[command(name = "mobilecombackup", about = "Ingest and validate a mobile-backup call/SMS repository")]
struct Cli {
    /// Repository root. Falls back to the MB_REPO_ROOT environment
    /// variable if not given.
    #[arg(long, global = true)]
    repo_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new, empty repository at the repository root.
    Init,
    /// Import calls/SMS/MMS exports into the repository.
    Import {
        /// Files or directories to scan for calls*.xml / sms*.xml inputs.
        inputs: Vec<PathBuf>,
        #[arg(long)]
        calls_only: bool,
        #[arg(long)]
        sms_only: bool,
        /// Run the full pipeline without writing anything.
        #[arg(long)]
        dry_run: bool,
        /// Re-validate the repository after a successful commit.
        #[arg(long)]
        post_validate: bool,
    },
    /// Run the five-phase validator and report violations.
    Validate {
        /// Apply the safe, mechanical fixes the validator can suggest.
        #[arg(long)]
        fix: bool,
    },
    /// Print the repository's summary.yaml.
    Info,
}

fn main() -> ExitCode {
    env_logger::Builder::new().filter(None, LevelFilter::Info).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

fn resolve_repo_root(arg: Option<PathBuf>) -> Result<PathBuf> {
    arg.or_else(|| std::env::var_os(REPO_ROOT_ENV).map(PathBuf::from))
        .ok_or_else(|| anyhow!("repository root required: pass --repo-root or set {REPO_ROOT_ENV}"))
}

fn run(cli: Cli) -> Result<ExitCode> {
    let root = resolve_repo_root(cli.repo_root)?;
    let fs: Arc<dyn FileSystem> = Arc::new(RealFs);
    let paths = RepoPaths::new(root);

    match cli.command {
        Command::Init => {
            repo::init(&fs, &paths, "mobilecombackup-cli", chrono::Utc::now()).context("initializing repository")?;
            println!("initialized repository at {}", paths.root.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Import { inputs, calls_only, sms_only, dry_run, post_validate } => {
            run_import(&fs, &paths, inputs, calls_only, sms_only, dry_run, post_validate)
        }
        Command::Validate { fix } => run_validate(&fs, &paths, fix),
        Command::Info => run_info(&fs, &paths),
    }
}

fn run_import(
    fs: &Arc<dyn FileSystem>,
    paths: &RepoPaths,
    inputs: Vec<PathBuf>,
    calls_only: bool,
    sms_only: bool,
    dry_run: bool,
    post_validate: bool,
) -> Result<ExitCode> {
    if calls_only && sms_only {
        return Err(anyhow!("--calls-only and --sms-only are mutually exclusive"));
    }
    let filter = if calls_only {
        RecordFilter::CallsOnly
    } else if sms_only {
        RecordFilter::SmsOnly
    } else {
        RecordFilter::All
    };

    let _lock = if dry_run { None } else { Some(RepoLock::acquire(fs.clone(), paths).context("acquiring repository lock")?) };

    let resolved = importer::discover_inputs(fs, &paths.root, &inputs).context("scanning input paths")?;
    if resolved.is_empty() {
        log::warn!("no calls*.xml / sms*.xml inputs found");
    }

    let opts = ImportOptions {
        filter,
        dry_run,
        post_validate,
        cancel: CancellationToken::new(),
        progress: Arc::new(LoggingProgressSink),
        ..ImportOptions::default()
    };

    let report = importer::run(fs, paths, &resolved, &opts).context("importing backup files")?;
    println!(
        "calls: +{} ~{} (loaded {}); sms/mms: +{} ~{} (loaded {}); attachments stored: {}; rejected records: {} across {} file(s)",
        report.calls.added,
        report.calls.duplicates,
        report.calls.loaded,
        report.sms.added,
        report.sms.duplicates,
        report.sms.loaded,
        report.attachments_stored,
        report.rejected_records,
        report.rejected_files,
    );

    match report.exit_class() {
        ExitClass::Clean => Ok(ExitCode::SUCCESS),
        ExitClass::RejectsPresent => Ok(ExitCode::from(1)),
    }
}

fn run_validate(fs: &Arc<dyn FileSystem>, paths: &RepoPaths, fix: bool) -> Result<ExitCode> {
    let opts = ValidateOptions { cancel: CancellationToken::new() };
    let report = validate::run(fs, paths, &opts).context("validating repository")?;

    for violation in &report.violations {
        println!("{:?}: {} ({})", violation.severity(), violation.file, violation.message);
    }
    let (errors, warnings) = report.summary_counts();
    println!("{errors} error(s), {warnings} warning(s)");

    if fix {
        let fixed = validate::autofix(fs, paths, &report).context("applying autofix")?;
        println!("applied {fixed} fix(es)");
    }

    if report.has_fatal() {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn run_info(fs: &Arc<dyn FileSystem>, paths: &RepoPaths) -> Result<ExitCode> {
    let path = paths.summary_yaml();
    if !fs.exists(&path) {
        return Err(anyhow!("no summary.yaml at {}; has this repository been imported into yet?", path.display()));
    }
    let bytes = fs.read(&path).context("reading summary.yaml")?;
    print!("{}", String::from_utf8_lossy(&bytes));
    Ok(ExitCode::SUCCESS)
}
