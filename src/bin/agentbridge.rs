//! agentbridge - file-exchange bridge daemon
//!
//! Usage:
//!   agentbridge run --root /srv/bridge       → run the daemon until Ctrl-C
//!   agentbridge run --mode BRIDGE            → relay prompts and await completion
//!   agentbridge status [--json] [--write]    → agent table
//!   agentbridge resume <agent_id>            → request a resume now
//!   agentbridge dump-config                  → print the effective config as TOML
//!   agentbridge version                      → show version

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentbridge::status;
use agentbridge_core::ProcessingMode;
use agentbridge_daemon::agent_state::{AgentStateStore, ResumeController, ResumeOutcome};
use agentbridge_daemon::layout::BridgeLayout;
use agentbridge_daemon::validation::is_plain_name;
use agentbridge_daemon::{BridgeConfig, Daemon};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser)]
#[command(
    name = "agentbridge",
    about = "File-exchange bridge between coding agents and a chat service",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Bridge root directory (overrides paths.root in the config)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Path to config file (TOML). Default: <root>/agentbridge.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until interrupted
    Run {
        /// Processing mode: CORE, BRIDGE, DEBUG or PRODUCTION
        #[arg(short, long)]
        mode: Option<String>,

        /// Write logs to a file (in addition to stderr)
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Emit JSON logs on stderr
        #[arg(long, default_value_t = false)]
        json_logs: bool,
    },
    /// Show every known agent with its state and heartbeat
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Also write the markdown report to <root>/status.md
        #[arg(long, default_value_t = false)]
        write: bool,
    },
    /// Move an agent to `resuming` and emit a resume request
    Resume { agent_id: String },
    /// Print the effective config as TOML
    DumpConfig,
    /// Show version
    Version,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { mode, log_file, json_logs } => {
            let _guard = init_tracing(log_file.as_deref(), *json_logs)?;
            let mut config = load_config(&cli);
            if let Some(mode) = mode {
                let parsed: ProcessingMode = mode.parse()?;
                config.daemon.mode = parsed.to_string();
            }
            run(config).await?;
        }
        Commands::Status { json, write } => {
            let config = load_config(&cli);
            let layout = BridgeLayout::from_config(&config.paths);
            let now = chrono::Utc::now();
            let rows = status::collect(&layout, config.heartbeat.stale_threshold(), now).await?;
            let markdown = status::render_markdown(&rows, now);
            if *json {
                println!("{}", status::render_json(&rows)?);
            } else {
                print!("{markdown}");
            }
            if *write {
                let path = status::write_report(&layout, &markdown).await?;
                eprintln!("Wrote {}", path.display());
            }
        }
        Commands::Resume { agent_id } => {
            if !is_plain_name(agent_id) {
                bail!("'{agent_id}' is not a valid agent id");
            }
            let config = load_config(&cli);
            let store = Arc::new(AgentStateStore::new(BridgeLayout::from_config(&config.paths)));
            let outcome = ResumeController::new(store).resume_agent(agent_id).await?;
            println!("{agent_id}: {outcome}");
            if outcome == ResumeOutcome::InvalidState {
                bail!("agent {agent_id} has no valid state file");
            }
        }
        Commands::DumpConfig => {
            print!("{}", load_config(&cli).to_toml());
        }
        Commands::Version => {
            println!("agentbridge v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

/// Config file, then CLI overrides.
fn load_config(cli: &Cli) -> BridgeConfig {
    let root = cli.root.clone().unwrap_or_else(|| PathBuf::from("."));
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| root.join("agentbridge.toml"));
    let mut config = BridgeConfig::load(&path);
    if let Some(root) = &cli.root {
        config.paths.root = root.clone();
    }
    config
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let daemon = Daemon::new(config).context("invalid configuration")?;
    daemon.start().await?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Interrupt received, stopping");
    daemon.stop().await;

    let stats = daemon.stats();
    println!(
        "processed={} failed={} duplicates={} retries={}",
        stats.processed, stats.failed, stats.duplicates, stats.retries
    );
    Ok(())
}

/// stderr layer (text or JSON) plus an optional non-blocking file layer.
/// The returned guard flushes the file writer on drop.
fn init_tracing(log_file: Option<&Path>, json: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "agentbridge=info,agentbridge_daemon=info,agentbridge_core=info".into())
    };

    let stderr = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter())
            .boxed()
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("--log-file {} has no file name", path.display()))?;
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter())
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(stderr).with(file_layer).init();
    Ok(guard)
}
