//! Redline - SSE synchronization gateway for collaborative review sessions.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use redline_gateway::api::{ApiState, create_api_routes};
use redline_gateway::config::ConfigManager;
use redline_gateway::find_available_port;
use tokio::net::TcpListener;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Redline review synchronization gateway CLI
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Path to a configuration file (defaults to the per-user location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway (automatically finds a free port if the preferred
    /// one is occupied)
    Start {
        /// Preferred server port; overrides the configuration file
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Read one configuration key
    Get {
        /// Dotted key, e.g. sync.max_events_per_session
        key: String,
    },

    /// Write one configuration key and persist the file
    Set {
        /// Dotted key, e.g. sync.default_ttl_hours
        key: String,
        /// New value
        value: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ConfigManager> {
    match path {
        Some(path) => ConfigManager::load_with_path(path),
        None => ConfigManager::load(),
    }
}

async fn start_server(manager: &ConfigManager, preferred_port: Option<u16>) -> Result<()> {
    let config = manager.config().clone();
    let preferred = preferred_port.unwrap_or(config.server.port);

    let port = find_available_port(preferred)
        .await
        .context("Failed to find available port")?;
    if port != preferred {
        warn!(
            "Port {} was occupied, using port {} instead",
            preferred, port
        );
    }

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid bind host '{}'", config.server.host))?;
    let addr = SocketAddr::from((host, port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    let state = ApiState::new(config.sync.clone());
    spawn_maintenance(state.clone());
    let app = create_api_routes().with_state(state);

    info!("Redline gateway listening on http://{addr}");
    info!("Health endpoint: http://{addr}/stream/health");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

/// Background sweeps: TTL expiry, gap-history aging, idle-session purge.
/// Runs independently of request handling; each sweep only contends on the
/// per-session locks it touches.
fn spawn_maintenance(state: ApiState) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(state.config.prune_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let expired = state.log.prune_expired();
            let aged_out = state.gaps.prune_history();
            let purged = state
                .registry
                .purge_idle_sessions(state.config.session_idle_timeout());
            if expired + aged_out + purged > 0 {
                info!(expired, aged_out, purged, "maintenance sweep complete");
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Start { port } => {
            let manager = load_config(cli.config.as_ref())?;
            start_server(&manager, port).await?;
        }
        Commands::Get { key } => {
            let manager = load_config(cli.config.as_ref())?;
            match manager.get(&key) {
                Some(value) => println!("{value}"),
                None => anyhow::bail!("unknown configuration key: {key}"),
            }
        }
        Commands::Set { key, value } => {
            let mut manager = load_config(cli.config.as_ref())?;
            manager.set(&key, &value)?;
            manager.save()?;
            println!("{key} = {value}");
            info!("Configuration saved to {}", manager.path().display());
        }
    }

    Ok(())
}
