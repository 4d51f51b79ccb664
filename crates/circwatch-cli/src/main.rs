use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use circwatch_storage::{ExistingFilePolicy, PersistenceMode};
use circwatch_sync::{
    build_scheduler, ConfigOverlay, KnownTitlePolicy, Renderer, SyncConfig, SyncPipeline,
    SyncRunSummary,
};
use clap::{Args, Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "circwatch")]
#[command(about = "Tracks newly published regulatory circulars and their PDFs")]
struct Cli {
    /// YAML config file; `CIRCWATCH_CONFIG` is used when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one batch pass and exit.
    Run {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run a pass on every tick of the configured cron schedule.
    Schedule,
    /// Print the effective configuration.
    ShowConfig,
}

#[derive(Debug, Args)]
struct Overrides {
    #[arg(long, global = true)]
    listing_url: Option<String>,
    #[arg(long, global = true)]
    max_entries: Option<usize>,
    #[arg(long, global = true)]
    mode: Option<PersistenceMode>,
    #[arg(long, global = true)]
    catalog_path: Option<PathBuf>,
    #[arg(long, global = true)]
    new_entries_path: Option<PathBuf>,
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,
    #[arg(long, global = true, conflicts_with = "no_download")]
    download: bool,
    #[arg(long, global = true)]
    no_download: bool,
    #[arg(long, global = true)]
    known_titles: Option<KnownTitlePolicy>,
    #[arg(long, global = true)]
    existing_files: Option<ExistingFilePolicy>,
    /// `browser` (headless Chromium, the default) or `http`.
    #[arg(long, global = true)]
    renderer: Option<Renderer>,
    #[arg(long, global = true)]
    browser_executable: Option<PathBuf>,
    #[arg(long, global = true)]
    source_commit: Option<String>,
    #[arg(long, global = true)]
    cron: Option<String>,
}

impl Overrides {
    fn into_overlay(self) -> ConfigOverlay {
        let download = match (self.download, self.no_download) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        ConfigOverlay {
            listing_url: self.listing_url,
            max_entries: self.max_entries,
            mode: self.mode,
            catalog_path: self.catalog_path,
            new_entries_path: self.new_entries_path,
            download_dir: self.download_dir,
            download,
            known_titles: self.known_titles,
            existing_files: self.existing_files,
            renderer: self.renderer,
            browser_executable: self.browser_executable,
            source_commit: self.source_commit,
            scheduler_cron: self.cron,
            ..Default::default()
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} mode={} candidates={} skipped={} recorded={} refreshed={} resolved={} downloaded={}",
        summary.run_id,
        summary.mode.as_str(),
        summary.candidates,
        summary.skipped,
        summary.recorded,
        summary.refreshed,
        summary.resolved,
        summary.downloaded,
    );
    println!(
        "catalog: {} ({} rows)",
        summary.catalog_path.display(),
        summary.catalog_rows
    );
    if let Some(path) = &summary.new_entries_path {
        println!("new entries: {}", path.display());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let overlay = SyncConfig::load_overlay(cli.config.as_deref())?
        .layered(cli.overrides.into_overlay());
    let config = SyncConfig::from_overlay(overlay)?;

    match cli.command.unwrap_or(Commands::Run { json: false }) {
        Commands::Run { json } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_once().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::Schedule => {
            let cron = config.scheduler_cron.clone();
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "scheduler started; waiting for ctrl-c");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
