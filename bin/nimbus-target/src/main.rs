//! Nimbus target - storage target daemon
//!
//! Loads `/etc/nimbus/target.toml` (overridable with CLI flags), brings up
//! the mount paths, registers with the coordinator and serves the REST API
//! until interrupted or told to shut down.

use anyhow::Result;
use clap::Parser;
use nimbus_common::{Config, DaemonInfo};
use nimbus_target::{Registrar, Target, router};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "nimbus-target")]
#[command(about = "Nimbus storage target")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/nimbus/target.toml")]
    config: String,

    /// Listen address for the REST API
    #[arg(short, long)]
    listen: Option<String>,

    /// URL peers use to reach this target; derived from the listen address if unset
    #[arg(long)]
    direct_url: Option<String>,

    /// Mount paths to cache objects on
    #[arg(long)]
    fspaths: Vec<PathBuf>,

    /// Coordinator base URL
    #[arg(long, env = "NIMBUS_PROXY_URL")]
    proxy_url: Option<String>,

    /// Daemon identifier; derived from hostname and port if unset
    #[arg(long)]
    daemon_id: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|e| anyhow::anyhow!("Invalid config file {path}: {e}"))
}

/// Advertised URL: explicit value, else derived from the listen address
fn direct_url(explicit: Option<&str>, listen: &str) -> String {
    match explicit {
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => url.to_string(),
        Some(addr) => format!("http://{addr}"),
        None if listen.starts_with("0.0.0.0") => format!(
            "http://127.0.0.1:{}",
            listen.rsplit(':').next().unwrap_or("8081")
        ),
        None => format!("http://{listen}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.config)?;

    // CLI takes precedence over the config file
    if let Some(listen) = args.listen {
        config.target.listen = listen;
    }
    if let Some(url) = args.direct_url {
        config.target.direct_url = Some(url);
    }
    if !args.fspaths.is_empty() {
        config.storage.fspaths = args.fspaths;
    }
    if let Some(proxy_url) = args.proxy_url {
        config.target.proxy_url = proxy_url;
    }
    if let Some(daemon_id) = args.daemon_id {
        config.target.daemon_id = Some(daemon_id);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Nimbus target");
    info!("Config file: {}", args.config);

    let addr: SocketAddr = config.target.listen.parse().map_err(|e| {
        anyhow::anyhow!("Invalid listen address {}: {}", config.target.listen, e)
    })?;
    let daemon_id = config.target.daemon_id.clone().unwrap_or_else(|| {
        format!(
            "{}:{}",
            gethostname::gethostname().to_string_lossy(),
            addr.port()
        )
    });
    let daemon = DaemonInfo {
        daemon_id,
        direct_url: direct_url(config.target.direct_url.as_deref(), &config.target.listen),
    };
    info!("Daemon {} at {}", daemon.daemon_id, daemon.direct_url);

    let cloud = nimbus_cloud::from_config(&config.cloud)?;
    let proxy_url = config.target.proxy_url.clone();
    let target = Target::new(config, daemon.clone(), cloud)?;

    let registrar = if proxy_url.is_empty() {
        warn!("No coordinator configured, running standalone");
        None
    } else {
        let registrar = Registrar::new(reqwest::Client::new(), &proxy_url);
        registrar.register(&daemon).await?;
        Some(registrar)
    };

    let listener = TcpListener::bind(addr).await?;
    info!("Serving REST API on {}", addr);

    let (stopped_tx, stopped_rx) = tokio::sync::oneshot::channel();
    let shutdown_target = Arc::clone(&target);
    axum::serve(listener, router(Arc::clone(&target)).into_make_service())
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                () = shutdown_target.shutdown_token().cancelled() => {}
            }
            info!("Shutting down...");
            // Unregister while still serving so the coordinator stops routing here
            let was_running = shutdown_target.leave(registrar.as_ref()).await;
            stopped_tx.send(was_running).ok();
        })
        .await?;

    if stopped_rx.await.unwrap_or(false) {
        // Let aborted xactions observe the abort
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    info!("Target shut down gracefully");
    Ok(())
}
