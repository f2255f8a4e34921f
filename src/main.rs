use candypack::certs::AcmeIssuer;
use candypack::config::{default_settings_path, Config};
use candypack::control::ControlLoop;
use candypack::dns::MemoryDns;
use candypack::store::ConfigStore;
use candypack::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candypack=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let settings_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_settings_path);

    let config = Config::load(&settings_path).map_err(|e| {
        error!(path = %settings_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let paths = config.paths();
    let store = ConfigStore::open(paths.clone()).map_err(|e| {
        error!(base = %paths.base().display(), error = %e, "Failed to open configuration store");
        e
    })?;

    let issuer = AcmeIssuer::new(&config.certs);
    let control = ControlLoop::new(config, Arc::clone(&store), Arc::new(MemoryDns::new()), issuer);

    control.record_server_start();
    if let Err(e) = control.certs().ensure_bootstrap() {
        error!(error = %e, "Failed to prepare bootstrap certificate");
    }
    control.start();

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or store reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading configuration store...");
                    store.reload();
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    control.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting control plane");
    info!(
        base_dir = %config.paths().base().display(),
        save_interval_ms = config.store.save_interval_ms,
        "Store settings"
    );
    info!(
        tick_interval_ms = config.supervisor.tick_interval_ms,
        max_error_count = config.supervisor.max_error_count,
        port_range_start = config.supervisor.port_range_start,
        interpreter = %config.supervisor.interpreter,
        "Supervisor settings"
    );
    info!(
        check_interval_secs = config.certs.check_interval_secs,
        renew_before_days = config.certs.renew_before_days,
        directory = %config.certs.directory_url(),
        "Certificate settings"
    );
}
