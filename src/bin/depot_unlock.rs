use std::collections::HashMap;
use std::fs;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use depot_unlocker::config::{ConfigLoader, RepoLocation, ResolvedConfig, StrategyPreference};
use depot_unlocker::domain::{FileHint, TitleId, parse_hint_map};
use depot_unlocker::error::UnlockError;
use depot_unlocker::github::{ContentSource, GithubSource};
use depot_unlocker::installer::Installer;
use depot_unlocker::local_repo::LocalGitSource;
use depot_unlocker::orchestrator::{BatchControl, Orchestrator};
use depot_unlocker::output::{
    JsonOutput, OutputMode, StderrProgress, batch_summary, scan_lines, scan_totals,
};
use depot_unlocker::progress::ProgressSink;
use depot_unlocker::resolver::{BranchSource, LocalBranches, RemoteHeads};
use depot_unlocker::scanner::{DEFAULT_BATCH_SIZE, StateScanner};

#[derive(Parser)]
#[command(name = "depot-unlock")]
#[command(about = "Batch-install title unlock scripts and depot manifests from a branch-per-title repo")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true, help = "Config file (defaults to depot-unlock.json)")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download and install unlock files for titles")]
    Fetch(FetchArgs),
    #[command(about = "List installed titles and their state")]
    Scan(ScanArgs),
    #[command(about = "Move a title's script into the disabled directory")]
    Disable(TitleArgs),
    #[command(about = "Restore a disabled title's script")]
    Enable(TitleArgs),
    #[command(about = "Delete a title's script and AppList entries")]
    Remove(TitleArgs),
}

#[derive(Args)]
struct FetchArgs {
    #[arg(required = true)]
    titles: Vec<String>,

    #[arg(long, help = "JSON object mapping title ids to <depot>_<manifest> hints")]
    hints: Option<String>,

    #[arg(long, value_enum)]
    strategy: Option<StrategyPreference>,

    #[arg(long, help = "Leave out titles whose script is already active")]
    skip_installed: bool,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ScanArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct TitleArgs {
    title: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<UnlockError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &UnlockError) -> u8 {
    match error {
        UnlockError::InvalidTitleId(_)
        | UnlockError::InvalidHint(_)
        | UnlockError::MissingConfig
        | UnlockError::ConfigRead(_)
        | UnlockError::ConfigParse(_)
        | UnlockError::MissingSetting(_)
        | UnlockError::InvalidSetting { .. } => 2,
        UnlockError::GithubHttp(_)
        | UnlockError::GithubStatus { .. }
        | UnlockError::GitCommand(_)
        | UnlockError::GitTimeout(_)
        | UnlockError::External(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Fetch(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .into_diagnostic()?;
            runtime.block_on(run_fetch(args, config))
        }
        Commands::Scan(args) => run_scan(args, &config),
        Commands::Disable(args) => {
            let title: TitleId = args.title.parse()?;
            let moved = Installer::new(config.dirs.clone()).disable(&title)?;
            print_toggle(&title, moved, "disabled", "no active script");
            Ok(())
        }
        Commands::Enable(args) => {
            let title: TitleId = args.title.parse()?;
            let moved = Installer::new(config.dirs.clone()).enable(&title)?;
            print_toggle(&title, moved, "enabled", "no disabled script");
            Ok(())
        }
        Commands::Remove(args) => {
            let title: TitleId = args.title.parse()?;
            let removed = Installer::new(config.dirs.clone()).remove(&title)?;
            println!("{title}: removed {removed} file(s)");
            Ok(())
        }
    }
}

fn print_toggle(title: &TitleId, moved: bool, done: &str, missing: &str) {
    if moved {
        println!("{title}: {done}");
    } else {
        println!("{title}: {missing}");
    }
}

async fn run_fetch(args: FetchArgs, mut config: ResolvedConfig) -> miette::Result<()> {
    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    let mut titles = args
        .titles
        .iter()
        .map(|title| title.parse())
        .collect::<Result<Vec<TitleId>, _>>()?;
    let hints = match &args.hints {
        Some(path) => load_hints(path)?,
        None => HashMap::new(),
    };

    if args.skip_installed {
        let report = StateScanner::new(&config.dirs).scan()?;
        let before = titles.len();
        titles = report.pending(&titles);
        info!(skipped = before - titles.len(), "already active titles left out");
    }

    let mode = if args.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let control = BatchControl::new();
    let signal_control = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling batch");
            signal_control.cancel_all();
        }
    });

    match &config.repo {
        RepoLocation::Local(path) => {
            let orchestrator = Orchestrator::new(
                &config,
                LocalGitSource::new(path.clone()),
                LocalBranches::new(path.clone()),
            );
            fetch_with(orchestrator, titles, &hints, mode, &control).await
        }
        RepoLocation::Github { .. } => {
            let source = GithubSource::from_config(&config)?;
            let branches = RemoteHeads::new(config.repo.clone_url());
            let orchestrator = Orchestrator::new(&config, source, branches);
            fetch_with(orchestrator, titles, &hints, mode, &control).await
        }
    }
}

async fn fetch_with<S, B>(
    orchestrator: Orchestrator<S, B>,
    titles: Vec<TitleId>,
    hints: &HashMap<TitleId, Vec<FileHint>>,
    mode: OutputMode,
    control: &BatchControl,
) -> miette::Result<()>
where
    S: ContentSource + 'static,
    B: BranchSource + 'static,
{
    let sink: &dyn ProgressSink = match mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &StderrProgress,
    };
    let result = orchestrator
        .download_batch(titles, hints, sink, control)
        .await?;

    match mode {
        OutputMode::Json => JsonOutput::print_batch(&result).into_diagnostic()?,
        OutputMode::Human => print!("{}", batch_summary(&result)),
    }
    if result.cancelled {
        return Err(UnlockError::Cancelled.into());
    }
    Ok(())
}

fn load_hints(path: &str) -> Result<HashMap<TitleId, Vec<FileHint>>, UnlockError> {
    let content =
        fs::read_to_string(path).map_err(|err| UnlockError::Filesystem(format!("{path}: {err}")))?;
    let raw: HashMap<String, Vec<String>> = serde_json::from_str(&content)
        .map_err(|err| UnlockError::ConfigParse(format!("{path}: {err}")))?;
    parse_hint_map(raw)
}

fn run_scan(args: ScanArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let scanner = StateScanner::new(&config.dirs);
    if args.json {
        let report = scanner.scan()?;
        JsonOutput::print_scan(&report).into_diagnostic()?;
        return Ok(());
    }
    let report = scanner.scan_with(
        DEFAULT_BATCH_SIZE,
        |batch| print!("{}", scan_lines(batch)),
        |message| tracing::debug!(message, "scan progress"),
    )?;
    println!("{}", scan_totals(&report));
    Ok(())
}
