//! loom daemon — runs the dispatch control plane: the scheduler tick loop,
//! the agent-result loop, and the periodic repo self-audit.

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use loom_core::config::{GeneralConfig, LoomConfig};
use loom_daemon::Daemon;

/// Wire up tracing from the `[general]` config section. `RUST_LOG` wins
/// over the configured level; `log_json = true` switches to JSON lines for
/// log shippers. Safe to call more than once.
fn init_logging(general: &GeneralConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(general.log_level.clone()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if general.log_json {
        builder.json().try_init().ok();
    } else {
        builder.try_init().ok();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // `--config <path>` overrides the default `~/.loom/config.toml`.
    let mut args = std::env::args().skip(1);
    let config_path = match args.next().as_deref() {
        Some("--config") => args.next(),
        _ => None,
    };

    let config = match config_path {
        Some(path) => LoomConfig::load_from(&path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => LoomConfig::load().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load config, using defaults");
            LoomConfig::default()
        }),
    };

    init_logging(&config.general);

    info!(version = env!("CARGO_PKG_VERSION"), "loom daemon starting");

    let daemon = Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
