//! CLI commands implementation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use tokio::sync::mpsc;

use crate::config::{Config, MAX_TIMEOUT_MS};
use crate::host::{DownloadHost, TabHost};
use crate::models::{FailureReason, TabFilter};
use crate::services::{BatchReport, DownloadEventBus, SessionController, SessionEvent};

use super::progress::BatchProgress;

#[derive(Parser)]
#[command(name = "tabsweep")]
#[command(about = "Click download buttons across browser tabs and confirm each download")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(clap::Args, Clone)]
struct TabSelection {
    /// Only tabs on this host (subdomains included)
    #[arg(long = "host")]
    host: Option<String>,
    /// Only tabs whose URL contains this text
    #[arg(long)]
    url_contains: Option<String>,
}

impl TabSelection {
    fn filter(&self) -> TabFilter {
        TabFilter {
            host: self.host.clone(),
            url_contains: self.url_contains.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List browser tabs that a batch would process
    Tabs {
        #[command(flatten)]
        selection: TabSelection,
    },

    /// Click the download trigger in every matching tab and close confirmed tabs
    Run {
        #[command(flatten)]
        selection: TabSelection,
        /// Tabs processed at once (1-50)
        #[arg(short = 'j', long, env = "TABSWEEP_MAX_CONCURRENCY")]
        concurrency: Option<usize>,
        /// Per-tab deadline for a matching download, in milliseconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_TIMEOUT_MS))]
        timeout_ms: Option<u64>,
        /// Automatic retry rounds for timeouts and script failures
        #[arg(short, long)]
        retries: Option<u32>,
        /// Disable the singleton fallback rule
        #[arg(long)]
        strict: bool,
        /// Hide the progress display
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show the effective configuration
    Config,
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::load_from_path(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().await,
    };

    match cli.command {
        Commands::Tabs { selection } => cmd_tabs(&config, &selection).await,
        Commands::Run {
            selection,
            concurrency,
            timeout_ms,
            retries,
            strict,
            quiet,
        } => {
            let mut config = config;
            if let Some(n) = concurrency {
                config.max_concurrency = n;
            }
            if let Some(ms) = timeout_ms {
                config.timeout_ms = ms;
            }
            if let Some(r) = retries {
                config.max_retries = r;
            }
            if strict {
                config.singleton_fallback = false;
            }
            cmd_run(&config, &selection, quiet).await
        }
        Commands::Config => cmd_config(&config),
    }
}

#[cfg(feature = "browser")]
async fn connect(config: &Config) -> anyhow::Result<(Arc<dyn TabHost>, Arc<dyn DownloadHost>)> {
    let host = crate::host::ChromiumHost::connect(&config.browser)
        .await
        .with_context(|| format!("Could not connect to browser at {}", config.browser.remote_url))?;
    let host = Arc::new(host);
    let tabs: Arc<dyn TabHost> = host.clone();
    let downloads: Arc<dyn DownloadHost> = host;
    Ok((tabs, downloads))
}

#[cfg(not(feature = "browser"))]
async fn connect(_config: &Config) -> anyhow::Result<(Arc<dyn TabHost>, Arc<dyn DownloadHost>)> {
    anyhow::bail!("tabsweep was built without the `browser` feature")
}

async fn cmd_tabs(config: &Config, selection: &TabSelection) -> anyhow::Result<()> {
    let (tabs, _) = connect(config).await?;
    let found = tabs.list_tabs(&selection.filter()).await?;

    if found.is_empty() {
        println!("{} No matching tabs", style("!").yellow());
        return Ok(());
    }

    println!("\n{}", style("Matching tabs").bold());
    println!("{}", "-".repeat(60));
    for tab in &found {
        println!(
            "{:<12} {}",
            style(truncate_id(tab.id.as_str())).dim(),
            tab.url
        );
        if let Some(ref title) = tab.title {
            println!("{:<12} {}", "", style(title).dim());
        }
    }
    println!("\n{} tabs", found.len());
    Ok(())
}

async fn cmd_run(config: &Config, selection: &TabSelection, quiet: bool) -> anyhow::Result<()> {
    config.validate().context("Invalid configuration")?;

    let (tabs, downloads) = connect(config).await?;
    let found = tabs.list_tabs(&selection.filter()).await?;
    if found.is_empty() {
        println!("{} No matching tabs", style("!").yellow());
        return Ok(());
    }

    let bus = DownloadEventBus::new(config.event_bus_capacity);
    let forwarder = bus
        .attach(downloads.clone(), config.poll_interval())
        .await
        .context("Could not subscribe to browser downloads")?;

    println!(
        "{} Processing {} tabs ({} at a time, {}s timeout)",
        style("→").cyan(),
        found.len(),
        config.max_concurrency,
        config.timeout().as_secs_f32()
    );

    // Event channel for progress updates
    let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(100);
    let session = SessionController::new(config, tabs, downloads, bus)?.with_events(event_tx);

    // Spawn event handler task (UI layer)
    let event_handler = tokio::spawn(async move {
        let progress = if quiet { None } else { Some(BatchProgress::new()) };
        while let Some(event) = event_rx.recv().await {
            if let Some(ref progress) = progress {
                progress.handle(&event);
            }
        }
        if let Some(progress) = progress {
            progress.finish();
        }
    });

    let first = session.run_batch(found).await?;
    let mut round = 0;
    while round < config.max_retries && has_retryable(&session.report()) {
        round += 1;
        println!(
            "{} Retry round {} of {}",
            style("→").cyan(),
            round,
            config.max_retries
        );
        let retried = session.retry_failed().await?;
        if retried.total() == 0 {
            break;
        }
    }

    let report = session.report();
    drop(session);
    let _ = event_handler.await;
    forwarder.abort();

    print_summary(&first, &report);
    Ok(())
}

fn has_retryable(report: &BatchReport) -> bool {
    report
        .failures()
        .any(|o| o.failure().is_some_and(FailureReason::is_retryable))
}

fn print_summary(first: &BatchReport, report: &BatchReport) {
    println!(
        "{} {} of {} downloads confirmed",
        style("✓").green(),
        report.succeeded,
        report.total()
    );
    if report.succeeded > first.succeeded {
        println!(
            "  {} {} recovered by retries",
            style("→").dim(),
            report.succeeded - first.succeeded
        );
    }

    if report.failed > 0 {
        println!("{} {} failed:", style("!").yellow(), report.failed);
        for outcome in report.failures() {
            let reason = outcome
                .failure()
                .map(|r| r.to_string())
                .unwrap_or_default();
            println!(
                "  {} {} {}",
                style("✗").red(),
                outcome.url,
                style(format!("({}, {} retries)", reason, outcome.retry_count)).dim()
            );
        }
    }
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    let source = config
        .source_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".to_string());
    eprintln!("{} Configuration from {}", style("→").dim(), source);

    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    println!("{}", rendered);

    if let Err(e) = config.validate() {
        eprintln!("{} {}", style("!").yellow(), e);
    }
    Ok(())
}

fn truncate_id(id: &str) -> &str {
    match id.char_indices().nth(10) {
        Some((i, _)) => &id[..i],
        None => id,
    }
}
