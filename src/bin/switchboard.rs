//! Operator command line for the Switchboard engine.
//!
//! Usage:
//!
//! ```text
//! switchboard [--config <path>] <command>
//! ```
//!
//! Commands:
//!
//! - `run`: connect auto-connect servers, start discovery and health
//!   monitoring, and serve until interrupted
//! - `list [--tag <tag>]...`: print registered servers
//! - `show <name>`: print one registration as JSON
//! - `discover`: run one discovery cycle and print per-source reports
//! - `catalog`: connect auto-connect servers and print the tool catalog
//!
//! A representative configuration file is:
//!
//! ```json
//! {
//!   "registry_path": "/var/lib/switchboard/registry.json",
//!   "health": { "probe_interval_ms": 60000, "failure_threshold": 3 },
//!   "discovery": [
//!     { "kind": "file_watch", "name": "local", "path": "servers.json" },
//!     { "kind": "http_polling", "name": "central",
//!       "url": "http://discovery:8080/discover", "tags": ["math"] }
//!   ]
//! }
//! ```
//!
//! Logging honours `RUST_LOG` and defaults to `info`.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use std::io::Write;
use switchboard::config::{ConfigError, HttpSwitchboard, SwitchboardConfig};
use switchboard::fleet::services::ServerQuery;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Boxed error type for the main result.
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures surfaced by the command line.
#[derive(Debug, Error)]
enum CliError {
    /// Configuration could not be loaded or the engine not assembled.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Writing to stdout failed.
    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
    /// Output could not be encoded as JSON.
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
    /// A named server could not be resolved.
    #[error("{0}")]
    Lookup(String),
}

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Registry, discovery, health monitoring and routing for remote tool servers")]
struct Args {
    /// JSON configuration file; built-in defaults apply when omitted
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine until interrupted
    Run,
    /// List registered servers
    List {
        /// Only servers carrying any of these tags
        #[arg(short, long = "tag", value_name = "TAG")]
        tags: Vec<String>,
    },
    /// Show one registration as JSON
    Show {
        /// Server name
        name: String,
    },
    /// Run one discovery cycle
    Discover,
    /// Connect auto-connect servers and print the tool catalog
    Catalog,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Utf8PathBuf>) -> Result<SwitchboardConfig, CliError> {
    Ok(path
        .map(|file| SwitchboardConfig::load(file))
        .transpose()?
        .unwrap_or_default())
}

async fn run(engine: &HttpSwitchboard) -> Result<(), CliError> {
    engine.start().await;
    let interrupted = tokio::signal::ctrl_c().await;
    if let Err(err) = &interrupted {
        tracing::error!(error = %err, "could not listen for interrupt, shutting down");
    }
    tracing::info!("shutdown requested");
    engine.shutdown().await;
    Ok(interrupted?)
}

async fn list(engine: &HttpSwitchboard, tags: Vec<String>) -> Result<(), CliError> {
    let servers = engine.list(&ServerQuery::all().with_tags(tags)).await;
    let mut out = std::io::stdout().lock();
    for server in servers {
        let labels: Vec<&str> = server.tags().iter().map(String::as_str).collect();
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}",
            server.name(),
            server.status(),
            server.priority(),
            server.url(),
            labels.join(",")
        )?;
    }
    Ok(())
}

async fn show(engine: &HttpSwitchboard, name: &str) -> Result<(), CliError> {
    let registration = engine
        .get(name)
        .await
        .map_err(|err| CliError::Lookup(err.to_string()))?
        .ok_or_else(|| CliError::Lookup(format!("server '{name}' is not registered")))?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(&registration)?)?;
    Ok(())
}

async fn discover(engine: &HttpSwitchboard) -> Result<(), CliError> {
    let reports = engine.discover_now().await;
    let mut out = std::io::stdout().lock();
    for report in reports {
        match report.outcome {
            Ok(summary) if !summary.document_changed => {
                writeln!(out, "{}\tunchanged", report.source)?;
            }
            Ok(summary) => writeln!(
                out,
                "{}\tseen={} rejected={} created={} updated={} connected={}/{}",
                report.source,
                summary.seen,
                summary.rejected,
                summary.created,
                summary.updated,
                summary.connected,
                summary.connect_attempts
            )?,
            Err(err) => writeln!(out, "{}\terror: {err}", report.source)?,
        }
    }
    Ok(())
}

async fn catalog(engine: &HttpSwitchboard) -> Result<(), CliError> {
    for (server, outcome) in engine.connect_all(&ServerQuery::all()).await {
        if let Err(err) = outcome {
            tracing::warn!(server = %server, error = %err, "connect failed");
        }
    }
    let snapshot = engine.catalog();
    let encoded = serde_json::to_string_pretty(snapshot.as_ref());
    engine.shutdown().await;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", encoded?)?;
    Ok(())
}

async fn execute(args: Args) -> Result<(), CliError> {
    let config = load_config(args.config.as_ref())?;
    let engine = config.build_switchboard().await?;
    match args.command {
        Command::Run => run(&engine).await,
        Command::List { tags } => list(&engine, tags).await,
        Command::Show { name } => show(&engine, &name).await,
        Command::Discover => discover(&engine).await,
        Command::Catalog => catalog(&engine).await,
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();
    let args = Args::parse();
    execute(args).await?;
    Ok(())
}
