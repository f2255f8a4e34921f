use anyhow::Context;
use candypack::config::{default_settings_path, Config};
use candypack::watchdog::{Watchdog, WatchdogExit};
use candypack::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candypack=debug".parse().expect("valid log directive")),
        )
        .init();

    let settings_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_settings_path);
    let config = Config::load(&settings_path)
        .with_context(|| format!("failed to load {}", settings_path.display()))?;

    let server_bin = match &config.watchdog.server_bin {
        Some(bin) => PathBuf::from(bin),
        None => sibling_server_bin()?,
    };
    info!(name = PKG_NAME, version = VERSION, server = %server_bin.display(), "Starting watchdog");

    let watchdog = Arc::new(Watchdog::new(
        config.paths(),
        config.watchdog.clone(),
        server_bin,
        vec![settings_path.display().to_string()],
    ));
    watchdog.prepare().context("failed to register watchdog")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(Arc::clone(&watchdog).run(shutdown_rx));

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    match run.await? {
        WatchdogExit::Stopped => {
            info!("Watchdog stopped");
            Ok(())
        }
        WatchdogExit::GaveUp { restarts } => {
            error!(restarts, "Control plane keeps crashing, watchdog exiting");
            std::process::exit(1);
        }
    }
}

/// The control-plane binary installed next to this one
fn sibling_server_bin() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate watchdog executable")?;
    let dir = exe
        .parent()
        .context("watchdog executable has no parent directory")?;
    Ok(dir.join(format!("candypack{}", std::env::consts::EXE_SUFFIX)))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}
