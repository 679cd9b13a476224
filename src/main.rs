// src/main.rs

use anyhow::{Context, Result};
use canvasdl::config::{expand_home, AppConfig, ConfigStore};
use canvasdl::prelude::*;
use canvasdl::state_manager::StateManager;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const TOKEN_VAR: &str = "CANVAS_TOKEN";

/// Bulk, resumable downloads of Canvas course content.
#[derive(Parser)]
#[command(name = "canvasdl", version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and run downloads, or resume a previous run
    Download {
        #[command(subcommand)]
        command: DownloadCommand,
    },
    /// Show or change stored settings
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum DownloadCommand {
    /// Download content from one or more courses
    ///
    /// Examples:
    ///   canvasdl download run --course 12345
    ///   canvasdl download run --course MSDS-697 --source files --source pages
    Run {
        /// Course id or course code (repeatable)
        #[arg(long = "course", required = true)]
        courses: Vec<String>,
        /// files, assignments, discussions, pages or modules (default: all)
        #[arg(long = "source")]
        sources: Vec<SourceKind>,
        /// Destination root (default: configured path or ./downloads)
        #[arg(long)]
        dest: Option<PathBuf>,
        /// Concurrent downloads
        #[arg(long)]
        concurrency: Option<usize>,
        /// Replace files that already exist
        #[arg(long, visible_alias = "force")]
        overwrite: bool,
        #[arg(long)]
        base_url: Option<String>,
    },
    /// Retry the failed and pending entries of a saved run
    Resume {
        /// Manifest written by a previous run
        #[arg(long)]
        manifest: PathBuf,
        /// Must match the manifest's destination when given
        #[arg(long)]
        dest: Option<PathBuf>,
        #[arg(long)]
        base_url: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    Show,
    SetBaseUrl { url: String },
    SetDownloadPath { path: String },
    ClearDownloadPath,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let store = ConfigStore::default_location()?;
    match cli.command {
        Commands::Config { command } => {
            run_config(&store, command)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Download { command } => {
            let config = store.load()?;
            let cancel = CancellationToken::new();
            spawn_interrupt_handler(cancel.clone());
            run_download(command, &config, cancel).await
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "canvasdl=debug" } else { "canvasdl=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .init();
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing up and saving the manifest");
            cancel.cancel();
        }
    });
}

fn connect(config: &AppConfig, base_url: Option<&str>) -> Result<Arc<CanvasClient>> {
    let base_url = config.resolve_base_url(base_url)?;
    let token = std::env::var(TOKEN_VAR)
        .ok()
        .filter(|t| !t.trim().is_empty())
        .with_context(|| format!("{TOKEN_VAR} is not set"))?;
    let client = CanvasClient::new(&base_url, token.trim()).context("could not build HTTP client")?;
    Ok(Arc::new(client))
}

async fn run_download(
    command: DownloadCommand,
    config: &AppConfig,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    match command {
        DownloadCommand::Run {
            courses,
            sources,
            dest,
            concurrency,
            overwrite,
            base_url,
        } => {
            let run_config = RunConfig {
                concurrency: concurrency.unwrap_or(config.default_concurrency),
                overwrite,
            };
            run_config.validate()?;
            let cwd = std::env::current_dir()?;
            let dest =
                absolute_destination(&dest.unwrap_or_else(|| config.destination_path(&cwd)))?;
            let client = connect(config, base_url.as_deref())?;
            let engine = Engine::new(client, run_config).with_cancellation(cancel.clone());

            let plan = engine.plan(&courses, &sources, &dest).await?;
            for warning in &plan.warnings {
                println!("warning: {warning}");
            }
            println!("Planned {} item(s) into {}", plan.entries.len(), dest.display());

            let manifest_path = plan.default_path();
            let manifest = engine
                .execute(plan, run_config.concurrency, run_config.overwrite)
                .await?;
            Ok(report(&manifest, &manifest_path, cancel.is_cancelled()))
        }
        DownloadCommand::Resume {
            manifest,
            dest,
            base_url,
        } => {
            let dest = dest.as_deref().map(absolute_destination).transpose()?;
            // Prefer the instance the run was planned against over the config.
            let recorded = StateManager::new(&manifest)
                .load()
                .await
                .map_err(EngineError::from)?
                .base_url;
            let client = connect(config, base_url.as_deref().or(recorded.as_deref()))?;
            let engine =
                Engine::new(client, RunConfig::default()).with_cancellation(cancel.clone());
            let result = engine
                .resume_with_destination(&manifest, dest.as_deref())
                .await?;
            Ok(report(&result, &manifest, cancel.is_cancelled()))
        }
    }
}

fn absolute_destination(dest: &Path) -> Result<PathBuf> {
    let expanded = match dest.to_str() {
        Some(raw) => expand_home(raw),
        None => dest.to_path_buf(),
    };
    std::path::absolute(&expanded)
        .with_context(|| format!("cannot resolve destination {}", dest.display()))
}

fn report(manifest: &Manifest, path: &Path, cancelled: bool) -> ExitCode {
    let counts = manifest.status_counts();
    println!(
        "{} entries  success: {}  skipped: {}  failed: {}  pending: {}  interrupted: {}",
        counts.total(),
        counts.success,
        counts.skipped,
        counts.failed,
        counts.pending,
        counts.in_progress
    );
    for entry in manifest.entries.iter().filter(|e| e.status == EntryStatus::Failed) {
        println!(
            "failed: {} ({})",
            entry.target_path.display(),
            entry.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    println!("Manifest: {}", path.display());

    let unfinished = counts.failed + counts.pending + counts.in_progress;
    if unfinished > 0 {
        println!(
            "Resume with: canvasdl download resume --manifest {}",
            path.display()
        );
    }
    if manifest.has_failures() || cancelled {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run_config(store: &ConfigStore, command: ConfigCommand) -> Result<()> {
    let config = match command {
        ConfigCommand::Show => store.load()?,
        ConfigCommand::SetBaseUrl { url } => store.set_base_url(&url)?,
        ConfigCommand::SetDownloadPath { path } => store.set_default_destination(&path)?,
        ConfigCommand::ClearDownloadPath => store.clear_default_destination()?,
    };
    println!("config file:         {}", store.path().display());
    println!(
        "base_url:            {}",
        config.base_url.as_deref().unwrap_or("(not set)")
    );
    println!(
        "default_dest:        {}",
        config.default_dest.as_deref().unwrap_or("(not set, ./downloads)")
    );
    println!("default_concurrency: {}", config.default_concurrency);
    Ok(())
}
