//! Wiring of the store, the supervisors and the certificate manager

use crate::certs::{CertificateIssuer, CertificateManager};
use crate::config::Config;
use crate::dns::DnsBackend;
use crate::model::{self, ServerInfo};
use crate::store::ConfigStore;
use crate::supervisor::{ResourceKind, Service, Supervisor, Website};
use crate::ticker::spawn_ticker;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Background tasks get this long to notice shutdown
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The running control plane
pub struct ControlLoop<I: CertificateIssuer + 'static> {
    store: Arc<ConfigStore>,
    websites: Arc<Supervisor<Website>>,
    services: Arc<Supervisor<Service>>,
    certs: Arc<CertificateManager<I>>,
    config: Config,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<I: CertificateIssuer + 'static> ControlLoop<I> {
    pub fn new(config: Config, store: Arc<ConfigStore>, dns: Arc<dyn DnsBackend>, issuer: I) -> Self {
        let websites = Supervisor::new(
            Website::new(config.supervisor.port_range_start),
            Arc::clone(&store),
            config.supervisor.clone(),
        );
        let services = Supervisor::new(Service, Arc::clone(&store), config.supervisor.clone());
        let certs = Arc::new(CertificateManager::new(
            Arc::clone(&store),
            dns,
            issuer,
            config.certs.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            store,
            websites,
            services,
            certs,
            config,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn websites(&self) -> &Arc<Supervisor<Website>> {
        &self.websites
    }

    pub fn services(&self) -> &Arc<Supervisor<Service>> {
        &self.services
    }

    pub fn certs(&self) -> &Arc<CertificateManager<I>> {
        &self.certs
    }

    /// Record this process in the `server` module
    pub fn record_server_start(&self) {
        let result = self.store.update(model::SERVER, |server: &mut ServerInfo| {
            let watchdog = server.watchdog;
            *server = ServerInfo {
                pid: Some(std::process::id()),
                started: Some(model::now_ms()),
                watchdog,
                ..ServerInfo::default()
            };
        });
        if let Err(e) = result {
            error!(error = %e, "Failed to record server start");
        }
    }

    /// Spawn every periodic task
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        let sup = &self.config.supervisor;

        tasks.push(supervise("website-check", &self.websites, sup.tick_interval(), self.shutdown_tx.subscribe()));
        tasks.push(supervise("service-check", &self.services, sup.tick_interval(), self.shutdown_tx.subscribe()));

        let websites = Arc::clone(&self.websites);
        let services = Arc::clone(&self.services);
        tasks.push(spawn_ticker(
            "log-flush",
            sup.log_flush_interval(),
            self.shutdown_tx.subscribe(),
            move || {
                let websites = Arc::clone(&websites);
                let services = Arc::clone(&services);
                async move {
                    websites.flush_logs().await;
                    services.flush_logs().await;
                }
            },
        ));

        let certs = Arc::clone(&self.certs);
        tasks.push(spawn_ticker(
            "cert-check",
            self.config.certs.check_interval(),
            self.shutdown_tx.subscribe(),
            move || {
                let certs = Arc::clone(&certs);
                async move { certs.check().await }
            },
        ));

        tasks.push(
            self.store
                .spawn_save_loop(self.config.store.save_interval(), self.shutdown_tx.subscribe()),
        );

        info!(tasks = tasks.len(), "Control loop started");
    }

    /// Stop tickers, stop supervised processes and persist everything
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let drained = tokio::time::timeout(TASK_DRAIN_TIMEOUT, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("Background tasks did not stop in time");
        }

        info!("Stopping supervised processes...");
        tokio::join!(self.websites.stop_all(), self.services.stop_all());
        tokio::join!(self.websites.flush_logs(), self.services.flush_logs());

        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.force_save()).await {
            Ok(report) if report.failed.is_empty() => {
                info!(written = report.written.len(), "Final save complete")
            }
            Ok(report) => error!(failed = ?report.failed, "Final save incomplete"),
            Err(e) => error!(error = %e, "Final save task panicked"),
        }
    }
}

fn supervise<K: ResourceKind>(
    name: &'static str,
    supervisor: &Arc<Supervisor<K>>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let supervisor = Arc::clone(supervisor);
    spawn_ticker(name, period, shutdown, move || {
        let supervisor = Arc::clone(&supervisor);
        async move {
            if let Err(e) = supervisor.check() {
                error!(kind = K::KIND, error = %e, "Cannot read resources");
            }
        }
    })
}
