use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bankdownloader::browser::{BrowserOptions, BrowserSession};
use bankdownloader::config::{default_config_path, write_starter_config, ResolvedConfig};
use bankdownloader::download::DownloadCoordinator;
use bankdownloader::duration::{format_duration, parse_duration};
use bankdownloader::history::{HistoryLock, HistoryStore};
use bankdownloader::schedule::{ScheduleDecision, Strategy};
use bankdownloader::sync::{Orchestrator, Outcome, RunSummary, ScriptRegistry};

const DEFAULT_LOG_FILTER: &str =
    "info,chromiumoxide=warn,chromiumoxide::conn=off,chromiumoxide::handler=off";
const DEBUG_LOG_FILTER: &str =
    "info,bankdownloader=debug,chromiumoxide=warn,chromiumoxide::conn=off,chromiumoxide::handler=off";

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Parser, Debug)]
#[command(name = "bankdownloader", version)]
#[command(about = "Download bank transaction exports incrementally")]
struct Cli {
    /// Path to config file.
    #[arg(
        short,
        long,
        global = true,
        env = "BANKDOWNLOADER_CONFIG",
        default_value_os_t = default_config_path()
    )]
    config: PathBuf,

    /// Override the history file location.
    #[arg(long, global = true, env = "BANKDOWNLOADER_HISTORY")]
    history: Option<PathBuf>,

    /// Verbose logging for this crate.
    #[arg(long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download every account that is due
    Download {
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,

        /// Show the browser window.
        #[arg(long)]
        no_headless: bool,

        /// Launch Chromium with --no-sandbox (containers).
        #[arg(long)]
        no_sandbox: bool,

        /// Override the session timeout, e.g. "5m".
        #[arg(long, value_name = "DURATION", value_parser = parse_duration_arg)]
        timeout: Option<Duration>,
    },

    /// Show the next window for each account without downloading
    Plan {
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,
    },

    /// List recorded history events
    History,

    /// Show current configuration
    Config,

    /// Write a starter config file
    Init,
}

fn init_tracing(debug: bool, json: bool) {
    let default_filter = if debug {
        DEBUG_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    let registry = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
    );
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    if json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
}

fn load_config(cli: &Cli) -> Result<ResolvedConfig> {
    let config = ResolvedConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config: {}", cli.config.display()))?;
    Ok(match &cli.history {
        Some(path) => config.with_history_path(path),
        None => config,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.json);

    match &cli.command {
        Command::Download {
            strategy,
            no_headless,
            no_sandbox,
            timeout,
        } => {
            let config = load_config(&cli)?;
            let options = BrowserOptions {
                headless: config.headless && !no_headless,
                no_sandbox: *no_sandbox,
                chrome_executable: None,
            };
            let budget = timeout.unwrap_or(config.session_timeout);
            download(config, *strategy, options, budget).await
        }
        Command::Plan { strategy } => {
            let config = load_config(&cli)?;
            plan(config, *strategy)
        }
        Command::History => {
            let config = load_config(&cli)?;
            show_history(&config)
        }
        Command::Config => {
            let config = load_config(&cli)?;
            show_config(&cli.config, &config);
            Ok(())
        }
        Command::Init => {
            if write_starter_config(&cli.config)? {
                println!("Wrote starter config to {}", cli.config.display());
            } else {
                println!("Config already exists at {}", cli.config.display());
            }
            Ok(())
        }
    }
}

async fn download(
    config: ResolvedConfig,
    strategy: Option<Strategy>,
    options: BrowserOptions,
    budget: Duration,
) -> Result<()> {
    let _lock = HistoryLock::acquire(&config.history_path)?;
    let mut history = HistoryStore::load(&config.history_path)?;

    let mut orchestrator = Orchestrator::new(config.clone(), ScriptRegistry::builtin());
    if let Some(strategy) = strategy {
        orchestrator = orchestrator.with_strategy(strategy);
    }

    let due = orchestrator
        .plan(&history)
        .iter()
        .filter(|p| matches!(p.decision, Ok(ScheduleDecision::Fetch(_))))
        .count();
    if due == 0 {
        println!("Nothing to download.");
        return Ok(());
    }

    std::fs::create_dir_all(&config.download_dir).with_context(|| {
        format!(
            "Failed to create download directory: {}",
            config.download_dir.display()
        )
    })?;
    // Same filesystem as the targets so finished downloads can be renamed.
    let scratch = tempfile::Builder::new()
        .prefix(".scratch-")
        .tempdir_in(&config.download_dir)
        .context("Failed to create scratch download directory")?;

    let session = Arc::new(BrowserSession::launch(&options, budget).await?);
    let downloads = DownloadCoordinator::new(session.clone(), scratch.path(), session.deadline());

    let result = orchestrator
        .run(&mut history, session.as_ref(), &downloads)
        .await;
    if let Err(e) = session.close().await {
        tracing::warn!(error = %e, "Failed to close browser");
    }

    let summary = result?;
    print_summary(&summary);
    if summary.has_failures() {
        anyhow::bail!("{} of {} account(s) failed", summary.failed(), summary.attempted());
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    for entry in &summary.outcomes {
        let label = format!("{}/{} ({})", entry.source, entry.account_number, entry.account_name);
        match &entry.outcome {
            Outcome::Downloaded { path, window } => {
                println!("  ok      {label}: {window} -> {}", path.display())
            }
            Outcome::Skipped { reason } => println!("  skip    {label}: {reason}"),
            Outcome::Failed { stage, error } => println!("  FAILED  {label}: {stage}: {error}"),
        }
    }
    println!(
        "\n{} downloaded, {} skipped, {} failed",
        summary.succeeded(),
        summary.skipped(),
        summary.failed()
    );
}

fn plan(config: ResolvedConfig, strategy: Option<Strategy>) -> Result<()> {
    let history = HistoryStore::load(&config.history_path)?;
    let mut orchestrator = Orchestrator::new(config, ScriptRegistry::builtin());
    if let Some(strategy) = strategy {
        orchestrator = orchestrator.with_strategy(strategy);
    }

    for planned in orchestrator.plan(&history) {
        let label = format!(
            "{}/{} ({})",
            planned.source, planned.account_number, planned.account_name
        );
        match (&planned.decision, &planned.target) {
            (Ok(ScheduleDecision::Fetch(window)), Some(target)) => {
                println!("  fetch   {label}: {window} -> {}", target.display())
            }
            (Ok(ScheduleDecision::Fetch(window)), None) => println!("  fetch   {label}: {window}"),
            (Ok(ScheduleDecision::Skip(reason)), _) => println!("  skip    {label}: {reason}"),
            (Err(e), _) => println!("  ERROR   {label}: {e}"),
        }
    }
    Ok(())
}

fn show_history(config: &ResolvedConfig) -> Result<()> {
    let history = HistoryStore::load(&config.history_path)?;
    println!("History file: {}", config.history_path.display());
    if history.is_empty() {
        println!("No events recorded.");
        return Ok(());
    }
    for event in history.all() {
        match event {
            Ok(event) => println!(
                "  {}/{} fetched through {}",
                event.source, event.account_number, event.fetched_through
            ),
            Err(e) => println!("  {e}"),
        }
    }
    Ok(())
}

fn show_config(config_path: &std::path::Path, config: &ResolvedConfig) {
    println!("Config file: {}", config_path.display());
    println!("Data directory: {}", config.data_dir.display());
    println!("History file: {}", config.history_path.display());
    println!("Download directory: {}", config.download_dir.display());
    println!("Strategy: {}", config.strategy);
    println!("Minimum gap: {} day(s)", config.skip_policy.min_gap_days);
    println!("Headless: {}", config.headless);
    println!("Session timeout: {}", format_duration(config.session_timeout));

    let registry = ScriptRegistry::builtin();
    for source in &config.sources {
        let script_note = if registry.get(&source.script).is_some() {
            ""
        } else {
            " (not available in this build)"
        };
        println!("\nSource: {}", source.name);
        println!("  Script: {}{script_note}", source.script);
        if let Some(domain) = &source.domain {
            println!("  Domain: {domain}");
        }
        println!("  Days to fetch: {}", source.days_to_fetch);
        println!("  Export format: {}", source.export_format);
        println!("  Credentials: {}", source.credentials.kind());
        for account in &source.accounts {
            println!(
                "  Account: {} ({}) -> {}",
                account.name, account.number, account.template
            );
        }
    }
}
