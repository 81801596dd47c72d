//! ami-tracker: run the AMI call tracker against an Asterisk server
//!
//! Keeps one AMI session open, correlates call, agent and queue events, and
//! prints each call record as a JSON line on stdout. Logs go to stderr.

use ami_call_tracker::{ConnectionStatus, Directory, MemorySink, Supervisor, TrackerConfig};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod output;

use output::JsonLinesSink;

/// Asterisk AMI call tracker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Asterisk hostname or IP address
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// AMI port
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// AMI username
    #[arg(short, long)]
    user: Option<String>,

    /// AMI secret
    #[arg(short = 'p', long)]
    secret: Option<String>,

    /// Event classes to subscribe to (comma-separated)
    #[arg(short, long)]
    events: Option<String>,

    /// Tracker configuration file (JSON). Without it the ASTERISK_*
    /// environment variables are read.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Agent extensions and queues (JSON)
    #[arg(long)]
    directory: Option<PathBuf>,

    /// Keepalive interval in seconds
    #[arg(long)]
    keepalive: Option<u64>,

    /// Also print agent history, agent and queue updates
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(args.debug)?;

    let config = load_config(&args)?;
    let directory = match &args.directory {
        Some(path) => Directory::from_json_file(path)
            .with_context(|| format!("Failed to load directory {}", path.display()))?,
        None => {
            warn!("No directory given, agents and queues will not be resolved");
            Directory::new()
        }
    };
    info!(
        "Loaded {} agents and {} queues",
        directory.agents.len(),
        directory.queues.len()
    );

    let sink = Arc::new(JsonLinesSink::new(MemorySink::new(directory), args.verbose));
    let supervisor = Supervisor::new(config, sink.clone()).context("Invalid configuration")?;

    run(&supervisor).await?;

    info!("Stopping tracker...");
    supervisor.stop().await;
    eprintln!(
        "{} calls recorded, {} still open",
        sink.inner().calls().await.len(),
        supervisor.open_calls().await
    );

    Ok(())
}

/// Set up logging based on debug level; `RUST_LOG` wins when set
fn setup_logging(debug: bool) -> Result<()> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}

/// Config file or environment, then command-line overrides
fn load_config(args: &Args) -> Result<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TrackerConfig::from_env().context("Invalid ASTERISK_* environment")?,
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(user) = &args.user {
        config.username = user.clone();
    }
    if let Some(secret) = &args.secret {
        config.secret = secret.clone();
    }
    if let Some(events) = &args.events {
        config = config.with_events(events.clone());
    }
    if let Some(secs) = args.keepalive {
        config = config.with_keepalive_interval(Duration::from_secs(secs));
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Run until Ctrl-C, logging connection status changes
async fn run(supervisor: &Supervisor) -> Result<()> {
    let mut status = supervisor.subscribe_status();
    supervisor.start();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl-C")?;
                return Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = status.borrow_and_update().clone();
                match current {
                    ConnectionStatus::Disconnected(reason) => warn!("Disconnected: {:?}", reason),
                    ConnectionStatus::Stopped => {
                        warn!("Tracker stopped unexpectedly");
                        return Ok(());
                    }
                    other => info!("Status: {:?}", other),
                }
            }
        }
    }
}
