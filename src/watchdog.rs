//! Meta-supervisor for the control-plane process
//!
//! The watchdog runs as its own process, launches the control plane, keeps
//! the most recent lines of its stdout and stderr on disk and relaunches it
//! after every exit until the crash-loop guard gives up.

use crate::atomic;
use crate::config::{Paths, WatchdogConfig};
use crate::error::StoreError;
use crate::logs::{LineRing, Stream};
use crate::model::{self, ServerInfo};
use crate::process;
use crate::ticker::spawn_ticker;
use chrono::SecondsFormat;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Rolling-window restart counter
#[derive(Debug, Clone)]
pub struct RestartGuard {
    window_ms: i64,
    max_restarts: u32,
    count: u32,
    last_restart: Option<i64>,
}

impl RestartGuard {
    pub fn new(window: Duration, max_restarts: u32) -> Self {
        Self {
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            max_restarts,
            count: 0,
            last_restart: None,
        }
    }

    /// Count a restart at `now` (epoch ms).
    ///
    /// The counter starts over when the previous restart is older than the
    /// window. Returns false once the counter reaches the limit.
    pub fn register_restart(&mut self, now: i64) -> bool {
        if let Some(last) = self.last_restart {
            if now - last > self.window_ms {
                self.count = 0;
            }
        }
        self.count += 1;
        self.last_restart = Some(now);
        self.count < self.max_restarts
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Why the watchdog stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    /// Shutdown was requested
    Stopped,
    /// The control plane crashed too often
    GaveUp { restarts: u32 },
}

/// Read the `server` module from whichever layout is on disk
pub fn read_server(paths: &Paths) -> ServerInfo {
    let module_file = paths.module_file(model::SERVER);
    let from_module = std::fs::read_to_string(&module_file)
        .ok()
        .and_then(|text| serde_json::from_str::<ServerInfo>(&text).ok());
    if let Some(server) = from_module {
        return server;
    }

    std::fs::read_to_string(paths.legacy_file())
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .and_then(|doc| doc.get(model::SERVER).cloned())
        .and_then(|server| serde_json::from_value(server).ok())
        .unwrap_or_default()
}

/// Write the `server` module back in the layout currently on disk
pub fn write_server(paths: &Paths, server: &ServerInfo) -> Result<(), StoreError> {
    let value = serde_json::to_value(server)?;
    let legacy = paths.legacy_file();

    if !paths.modules_dir().is_dir() && legacy.is_file() {
        let mut doc: Value = std::fs::read_to_string(&legacy)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Default::default()));
        doc[model::SERVER] = value;
        return atomic::write_json(&legacy, Some(&paths.legacy_backup()), &doc);
    }

    atomic::write_json(
        &paths.module_file(model::SERVER),
        Some(&paths.module_backup(model::SERVER)),
        &value,
    )
}

fn stamp(line: &str) -> String {
    format!(
        "[{}] {}",
        chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        line
    )
}

pub struct Watchdog {
    paths: Paths,
    settings: WatchdogConfig,
    server_bin: PathBuf,
    server_args: Vec<String>,
    stdout: Arc<Mutex<LineRing>>,
    stderr: Arc<Mutex<LineRing>>,
}

impl Watchdog {
    pub fn new(paths: Paths, settings: WatchdogConfig, server_bin: PathBuf, server_args: Vec<String>) -> Self {
        let lines = settings.log_lines;
        Self {
            paths,
            settings,
            server_bin,
            server_args,
            stdout: Arc::new(Mutex::new(LineRing::new(lines))),
            stderr: Arc::new(Mutex::new(LineRing::new(lines))),
        }
    }

    /// Terminate leftovers of a previous run and record our own pid
    pub fn prepare(&self) -> Result<(), StoreError> {
        self.paths
            .ensure()
            .map_err(|e| StoreError::io(self.paths.base(), e))?;

        let own = std::process::id();
        let mut server = read_server(&self.paths);
        for pid in [server.watchdog, server.pid].into_iter().flatten() {
            if pid != own && process::pid_alive(pid) {
                info!(pid, "Terminating stale process from a previous run");
                process::terminate_pid(pid);
            }
        }

        server.watchdog = Some(own);
        server.pid = None;
        write_server(&self.paths, &server)?;
        debug!(pid = own, "Watchdog registered");
        Ok(())
    }

    /// Write both captured streams to their log files
    pub async fn flush_logs(&self) {
        flush(&self.stdout, self.paths.server_log()).await;
        flush(&self.stderr, self.paths.server_err_log()).await;
    }

    fn capture(&self, stream: Stream, line: String) {
        let ring = match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        };
        ring.lock().push(stamp(&line));
    }

    /// Launch and relaunch the control plane until shutdown or a crash loop
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> WatchdogExit {
        let (flush_tx, flush_rx) = watch::channel(false);
        let flusher = {
            let watchdog = Arc::clone(&self);
            spawn_ticker(
                "watchdog-log-flush",
                self.settings.log_flush_interval(),
                flush_rx,
                move || {
                    let watchdog = Arc::clone(&watchdog);
                    async move { watchdog.flush_logs().await }
                },
            )
        };

        let mut guard = RestartGuard::new(self.settings.restart_window(), self.settings.max_restarts);
        let exit = loop {
            if *shutdown.borrow() {
                break WatchdogExit::Stopped;
            }

            let mut command = Command::new(&self.server_bin);
            command
                .args(&self.server_args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            match command.spawn() {
                Ok(mut child) => {
                    info!(pid = ?child.id(), bin = %self.server_bin.display(), "Control plane started");
                    let mut pumps = Vec::with_capacity(2);
                    if let Some(out) = child.stdout.take() {
                        let watchdog = Arc::clone(&self);
                        pumps.push(process::pump_lines(out, Stream::Stdout, move |s, l| watchdog.capture(s, l)));
                    }
                    if let Some(err) = child.stderr.take() {
                        let watchdog = Arc::clone(&self);
                        pumps.push(process::pump_lines(err, Stream::Stderr, move |s, l| watchdog.capture(s, l)));
                    }

                    tokio::select! {
                        status = child.wait() => {
                            match status {
                                Ok(status) => warn!(?status, "Control plane exited"),
                                Err(e) => warn!(error = %e, "Failed to wait for control plane"),
                            }
                        }
                        _ = shutdown.changed() => {
                            process::stop_child("control-plane", &mut child, STOP_GRACE_PERIOD).await;
                            for pump in pumps {
                                let _ = tokio::time::timeout(Duration::from_secs(1), pump).await;
                            }
                            break WatchdogExit::Stopped;
                        }
                    }
                    for pump in pumps {
                        let _ = tokio::time::timeout(Duration::from_secs(1), pump).await;
                    }
                }
                Err(e) => {
                    error!(bin = %self.server_bin.display(), error = %e, "Failed to start control plane");
                    self.capture(Stream::Stderr, format!("failed to start {}: {e}", self.server_bin.display()));
                }
            }

            if !guard.register_restart(model::now_ms()) {
                error!(
                    restarts = guard.count(),
                    window_secs = self.settings.restart_window_secs,
                    "Control plane is crash looping, giving up"
                );
                break WatchdogExit::GaveUp {
                    restarts: guard.count(),
                };
            }
            debug!(restarts = guard.count(), "Restarting control plane");
        };

        let _ = flush_tx.send(true);
        let _ = flusher.await;
        self.flush_logs().await;
        exit
    }
}

async fn flush(ring: &Mutex<LineRing>, path: PathBuf) {
    let Some(text) = ring.lock().take_dirty() else {
        return;
    };
    if let Err(e) = tokio::fs::write(&path, text).await {
        warn!(
            path = %path.display(),
            code = ?e.raw_os_error(),
            kind = ?e.kind(),
            error = %e,
            "Failed to flush watchdog log"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINUTE_MS: i64 = 60 * 1000;

    #[test]
    fn test_guard_stops_at_limit_within_window() {
        let mut guard = RestartGuard::new(Duration::from_secs(300), 100);
        for i in 0..99 {
            assert!(guard.register_restart(i * 100), "restart {} should be allowed", i + 1);
        }
        assert!(!guard.register_restart(99 * 100));
        assert_eq!(guard.count(), 100);
    }

    #[test]
    fn test_guard_resets_after_quiet_window() {
        let mut guard = RestartGuard::new(Duration::from_secs(300), 100);
        for i in 0..50 {
            guard.register_restart(i);
        }
        assert_eq!(guard.count(), 50);

        // Exactly five minutes is still inside the window
        guard.register_restart(49 + 5 * MINUTE_MS);
        assert_eq!(guard.count(), 51);

        assert!(guard.register_restart(49 + 10 * MINUTE_MS + 1));
        assert_eq!(guard.count(), 1);
    }

    fn settings(max_restarts: u32) -> WatchdogConfig {
        WatchdogConfig {
            max_restarts,
            log_flush_interval_ms: 50,
            ..Default::default()
        }
    }

    #[test]
    fn test_server_module_round_trip_modular_and_legacy() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path());

        let server = ServerInfo {
            watchdog: Some(42),
            ..Default::default()
        };
        write_server(&paths, &server).unwrap();
        assert!(paths.module_file(model::SERVER).is_file());
        assert_eq!(read_server(&paths).watchdog, Some(42));

        let legacy_dir = TempDir::new().unwrap();
        let legacy = Paths::new(legacy_dir.path());
        std::fs::write(
            legacy.legacy_file(),
            r#"{"server":{"pid":7},"websites":{"a.com":{"domain":"a.com","path":"/a"}}}"#,
        )
        .unwrap();
        assert_eq!(read_server(&legacy).pid, Some(7));

        write_server(&legacy, &server).unwrap();
        let doc: Value = serde_json::from_str(&std::fs::read_to_string(legacy.legacy_file()).unwrap()).unwrap();
        assert_eq!(doc["server"]["watchdog"], 42);
        assert_eq!(doc["websites"]["a.com"]["path"], "/a");
        assert!(!legacy.modules_dir().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prepare_terminates_stale_pids() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path());

        let mut stale = Command::new("sleep").arg("30").spawn().unwrap();
        let stale_pid = stale.id().unwrap();
        write_server(
            &paths,
            &ServerInfo {
                watchdog: Some(stale_pid),
                pid: Some(std::process::id()),
                ..Default::default()
            },
        )
        .unwrap();

        let watchdog = Watchdog::new(paths.clone(), settings(100), PathBuf::from("true"), Vec::new());
        watchdog.prepare().unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), stale.wait())
            .await
            .expect("stale watchdog should be terminated")
            .unwrap();
        assert!(!status.success());

        let server = read_server(&paths);
        assert_eq!(server.watchdog, Some(std::process::id()));
        assert!(server.pid.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gives_up_on_crash_loop_and_keeps_logs() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path());
        paths.ensure().unwrap();

        let watchdog = Arc::new(Watchdog::new(
            paths.clone(),
            settings(3),
            PathBuf::from("sh"),
            vec!["-c".to_string(), "echo starting; echo boom >&2; exit 1".to_string()],
        ));
        let (_tx, rx) = watch::channel(false);

        let exit = tokio::time::timeout(Duration::from_secs(10), watchdog.run(rx))
            .await
            .expect("watchdog should give up");
        assert_eq!(exit, WatchdogExit::GaveUp { restarts: 3 });

        let out = std::fs::read_to_string(paths.server_log()).unwrap();
        let err = std::fs::read_to_string(paths.server_err_log()).unwrap();
        assert_eq!(out.lines().filter(|l| l.ends_with("starting")).count(), 3);
        assert!(err.contains("boom"));
        assert!(err.starts_with('['));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_stops_control_plane() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path());
        paths.ensure().unwrap();

        let watchdog = Arc::new(Watchdog::new(
            paths.clone(),
            settings(100),
            PathBuf::from("sh"),
            vec!["-c".to_string(), "echo up; exec sleep 30".to_string()],
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&watchdog).run(rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("watchdog should stop")
            .unwrap();
        assert_eq!(exit, WatchdogExit::Stopped);
        assert!(std::fs::read_to_string(paths.server_log()).unwrap().contains("up"));
    }
}
