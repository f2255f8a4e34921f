//! Supervised-process lifecycle engine
//!
//! One [`Supervisor`] runs per resource kind. Each reconciliation tick walks
//! the kind's records in stored order, launches resources that should be
//! running and replaces any recorded pid that this engine did not spawn.
//! Exits and stderr output feed the per-resource error budget that gates
//! relaunches.

use crate::config::SupervisorConfig;
use crate::error::{StoreError, SupervisorError};
use crate::logs::{CaptureBuffer, Stream};
use crate::model::{
    self, LaunchGate, Lifecycle, Resource, ServiceRecord, Status, WebsiteRecord, Websites,
};
use crate::ports::PortAllocator;
use crate::process;
use crate::store::ConfigStore;
use dashmap::DashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A run at least this long resets the clean-exit streak
const STABLE_RUN: Duration = Duration::from_secs(60);

/// How long output pumps may keep draining after the child has exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const STOP_POLL: Duration = Duration::from_millis(50);

/// How to start the process of one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// A family of supervised resources persisted in one store module
pub trait ResourceKind: Send + Sync + 'static {
    type Record: Resource + Clone + Send + Sync + 'static;

    /// Human-readable kind used in logs and errors
    const KIND: &'static str;

    /// Every record with its key, in stored order
    fn records(store: &ConfigStore) -> Result<Vec<(String, Self::Record)>, StoreError>;

    /// Apply `f` to the record under `key`; `None` if there is no such record
    fn modify<R>(
        store: &ConfigStore,
        key: &str,
        f: impl FnOnce(&mut Self::Record) -> R,
    ) -> Result<Option<R>, StoreError>;

    /// Name of the capture buffer and log file
    fn log_name(record: &Self::Record) -> String;

    /// Build the command line, updating the record with anything assigned for this run
    fn launch_spec(
        &self,
        key: &str,
        record: &mut Self::Record,
        settings: &SupervisorConfig,
    ) -> Result<LaunchSpec, SupervisorError>;
}

/// Result of a launch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Started(u32),
    AlreadyRunning,
    /// Another launch of the same resource has not finished yet
    InFlight,
    /// The error budget does not allow a launch right now
    Deferred(LaunchGate),
    NotFound,
    Failed,
}

/// Removes the in-flight marker when the launch attempt ends
struct InFlight<'a> {
    map: &'a DashMap<String, ()>,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

pub struct Supervisor<K: ResourceKind> {
    kind: K,
    store: Arc<ConfigStore>,
    settings: SupervisorConfig,
    /// key -> pid of the live process this engine spawned
    live: DashMap<String, u32>,
    launching: DashMap<String, ()>,
    /// Keys whose current process is being stopped on purpose
    stopping: DashMap<String, ()>,
    /// Consecutive clean exits per key
    clean_exits: DashMap<String, u32>,
    /// log name -> captured output
    logs: DashMap<String, CaptureBuffer>,
}

impl<K: ResourceKind> Supervisor<K> {
    pub fn new(kind: K, store: Arc<ConfigStore>, settings: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            kind,
            store,
            settings,
            live: DashMap::new(),
            launching: DashMap::new(),
            stopping: DashMap::new(),
            clean_exits: DashMap::new(),
            logs: DashMap::new(),
        })
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn settings(&self) -> &SupervisorConfig {
        &self.settings
    }

    /// Pid of the live process spawned for `key`
    pub fn live_pid(&self, key: &str) -> Option<u32> {
        self.live.get(key).map(|pid| *pid)
    }

    fn owns(&self, key: &str, pid: u32) -> bool {
        self.live_pid(key) == Some(pid)
    }

    /// One reconciliation pass.
    ///
    /// Only a resource list that cannot be read is reported as an error;
    /// launch failures are recorded on the resource and retried later.
    pub fn check(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let records = K::records(&self.store)?;

        for (key, record) in records {
            if !record.should_run()
                || self.launching.contains_key(&key)
                || self.stopping.contains_key(&key)
            {
                continue;
            }

            match record.lifecycle().pid {
                None => {
                    self.launch(&key);
                }
                Some(pid) if self.owns(&key, pid) => {}
                Some(pid) => {
                    warn!(
                        kind = K::KIND,
                        key = %key,
                        pid,
                        "Recorded pid is not a process we spawned, replacing it"
                    );
                    process::terminate_pid(pid);
                    self.update_if_current(&key, pid, |lifecycle| lifecycle.pid = None);
                    self.launch(&key);
                }
            }
        }

        Ok(())
    }

    /// Start the process for `key` if its error budget allows it
    pub fn launch(self: &Arc<Self>, key: &str) -> LaunchOutcome {
        if self.launching.insert(key.to_string(), ()).is_some() {
            return LaunchOutcome::InFlight;
        }
        let _guard = InFlight {
            map: &self.launching,
            key: key.to_string(),
        };

        if self.live.contains_key(key) {
            return LaunchOutcome::AlreadyRunning;
        }

        let now = model::now_ms();
        let max_errors = self.settings.max_error_count;
        let prepared = K::modify(&self.store, key, |record| {
            let gate = record.lifecycle().launch_gate(now, max_errors);
            if gate != LaunchGate::Allowed {
                return Err(LaunchOutcome::Deferred(gate));
            }
            let log_name = K::log_name(record);
            match self.kind.launch_spec(key, record, &self.settings) {
                Ok(spec) => Ok((spec, log_name)),
                Err(e) => {
                    warn!(kind = K::KIND, key, error = %e, "Cannot prepare launch");
                    record.lifecycle_mut().mark_errored(now);
                    Err(LaunchOutcome::Failed)
                }
            }
        });

        let (spec, log_name) = match prepared {
            Ok(Some(Ok(prepared))) => prepared,
            Ok(Some(Err(outcome))) => {
                if let LaunchOutcome::Deferred(gate) = outcome {
                    debug!(kind = K::KIND, key, ?gate, "Launch deferred");
                }
                return outcome;
            }
            Ok(None) => return LaunchOutcome::NotFound,
            Err(e) => {
                error!(kind = K::KIND, key, error = %e, "Cannot read record for launch");
                return LaunchOutcome::Failed;
            }
        };

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let spawned = command.spawn().map_err(|source| SupervisorError::Spawn {
            key: key.to_string(),
            source,
        });
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(kind = K::KIND, key, program = %spec.program, error = %e, "Launch failed");
                self.append_log(&log_name, Stream::Stderr, &e.to_string());
                self.update_record(key, |lifecycle| lifecycle.mark_errored(now));
                return LaunchOutcome::Failed;
            }
        };

        let Some(pid) = child.id() else {
            warn!(kind = K::KIND, key, "Process exited before its pid could be read");
            self.update_record(key, |lifecycle| lifecycle.mark_errored(now));
            return LaunchOutcome::Failed;
        };

        self.update_record(key, |lifecycle| lifecycle.mark_running(pid, now));
        self.live.insert(key.to_string(), pid);
        info!(kind = K::KIND, key, pid, "Process started");

        self.watch(key.to_string(), pid, log_name, child);
        LaunchOutcome::Started(pid)
    }

    /// Capture output of a spawned child and account for its exit
    fn watch(self: &Arc<Self>, key: String, pid: u32, log_name: String, mut child: Child) {
        let supervisor = Arc::clone(self);

        tokio::spawn(async move {
            let started = Instant::now();
            let stderr_seen = Arc::new(AtomicBool::new(false));
            let mut pumps = Vec::with_capacity(2);

            if let Some(stdout) = child.stdout.take() {
                let sink = Arc::clone(&supervisor);
                let name = log_name.clone();
                pumps.push(process::pump_lines(stdout, Stream::Stdout, move |stream, line| {
                    sink.append_log(&name, stream, &line)
                }));
            }

            if let Some(stderr) = child.stderr.take() {
                let sink = Arc::clone(&supervisor);
                let name = log_name.clone();
                let key = key.clone();
                let seen = Arc::clone(&stderr_seen);
                pumps.push(process::pump_lines(stderr, Stream::Stderr, move |stream, line| {
                    sink.append_log(&name, stream, &line);
                    if !seen.swap(true, Ordering::SeqCst) {
                        let now = model::now_ms();
                        sink.update_if_current(&key, pid, |lifecycle| lifecycle.mark_errored(now));
                    }
                }));
            }

            let status = child.wait().await;
            for pump in pumps {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, pump).await;
            }

            supervisor.handle_exit(
                &key,
                pid,
                status,
                stderr_seen.load(Ordering::SeqCst),
                started.elapsed(),
            );
        });
    }

    fn handle_exit(
        &self,
        key: &str,
        pid: u32,
        status: std::io::Result<ExitStatus>,
        stderr_seen: bool,
        ran_for: Duration,
    ) {
        let deliberate = self.stopping.remove(key).is_some();
        let now = model::now_ms();
        let clean = matches!(&status, Ok(s) if s.success()) && !stderr_seen;

        let streak = if deliberate || !clean {
            self.clean_exits.remove(key);
            0
        } else {
            let mut streak = self.clean_exits.entry(key.to_string()).or_insert(0);
            if ran_for >= STABLE_RUN {
                *streak = 0;
            }
            *streak += 1;
            *streak
        };

        self.update_if_current(key, pid, |lifecycle| {
            lifecycle.pid = None;
            if deliberate || (clean && streak <= 1) {
                lifecycle.mark_stopped(now);
            } else if stderr_seen {
                // Already counted when the first stderr line arrived
                lifecycle.status = Status::Errored;
                lifecycle.updated = Some(now);
            } else {
                lifecycle.mark_errored(now);
            }
        });
        self.live.remove_if(key, |_, live| *live == pid);

        match status {
            Ok(status) if deliberate => {
                info!(kind = K::KIND, key, pid, ?status, "Process stopped")
            }
            Ok(status) if clean => {
                info!(kind = K::KIND, key, pid, ?status, streak, "Process exited")
            }
            Ok(status) => {
                warn!(kind = K::KIND, key, pid, ?status, stderr_seen, "Process failed")
            }
            Err(e) => {
                warn!(kind = K::KIND, key, pid, error = %e, "Failed to wait for process")
            }
        }
    }

    fn update_record(&self, key: &str, f: impl FnOnce(&mut Lifecycle)) {
        if let Err(e) = K::modify(&self.store, key, |record| f(record.lifecycle_mut())) {
            error!(kind = K::KIND, key, error = %e, "Failed to update record");
        }
    }

    /// Apply `f` only while the record still points at `pid`
    fn update_if_current(&self, key: &str, pid: u32, f: impl FnOnce(&mut Lifecycle)) {
        let result = K::modify(&self.store, key, |record| {
            if record.lifecycle().pid == Some(pid) {
                f(record.lifecycle_mut());
            }
        });
        if let Err(e) = result {
            error!(kind = K::KIND, key, pid, error = %e, "Failed to update record");
        }
    }

    /// SIGTERM our process for `key`, escalating to SIGKILL after the grace period
    async fn stop_process(&self, key: &str) -> bool {
        // Marked before the pid is read so an exit racing this call counts as deliberate
        self.stopping.insert(key.to_string(), ());
        let Some(pid) = self.live_pid(key) else {
            self.stopping.remove(key);
            return false;
        };
        info!(kind = K::KIND, key, pid, "Stopping process");
        process::terminate_pid(pid);

        let deadline = Instant::now() + self.settings.stop_grace_period();
        while self.owns(key, pid) && Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL).await;
        }

        if self.owns(key, pid) {
            warn!(
                kind = K::KIND,
                key,
                pid,
                grace_period_secs = self.settings.stop_grace_period_secs,
                "Grace period exceeded, sending SIGKILL"
            );
            process::kill_pid(pid);
            let deadline = Instant::now() + Duration::from_secs(2);
            while self.owns(key, pid) && Instant::now() < deadline {
                tokio::time::sleep(STOP_POLL).await;
            }
        }
        if !self.owns(key, pid) {
            self.stopping.remove(key);
        }
        true
    }

    /// Stop whatever runs for `key` and mark it stopped
    pub async fn stop_resource(&self, key: &str) -> Result<(), SupervisorError> {
        if self.stop_process(key).await {
            return Ok(());
        }

        // Nothing of ours is running; a recorded pid belongs to someone else
        let now = model::now_ms();
        let stale = K::modify(&self.store, key, |record| {
            let lifecycle = record.lifecycle_mut();
            let pid = lifecycle.pid.take();
            if lifecycle.status == Status::Running {
                lifecycle.mark_stopped(now);
            }
            pid
        })?
        .ok_or_else(|| SupervisorError::UnknownResource {
            kind: K::KIND,
            key: key.to_string(),
        })?;

        if let Some(pid) = stale {
            process::terminate_pid(pid);
        }
        Ok(())
    }

    /// Reset the error budget, stop the current process and launch a new one
    pub async fn restart_resource(self: &Arc<Self>, key: &str) -> Result<LaunchOutcome, SupervisorError> {
        K::modify(&self.store, key, |record| record.lifecycle_mut().reset_errors())?.ok_or_else(
            || SupervisorError::UnknownResource {
                kind: K::KIND,
                key: key.to_string(),
            },
        )?;
        self.clean_exits.remove(key);
        self.stop_resource(key).await?;
        Ok(self.launch(key))
    }

    /// Stop every live process without touching desired state
    pub async fn stop_all(self: &Arc<Self>) {
        let keys: Vec<String> = self.live.iter().map(|entry| entry.key().clone()).collect();
        let mut stops = JoinSet::new();
        for key in keys {
            let supervisor = Arc::clone(self);
            stops.spawn(async move {
                supervisor.stop_process(&key).await;
            });
        }
        while stops.join_next().await.is_some() {}
    }

    /// Captured output of a resource, falling back to its log file
    pub fn logs(&self, key: &str) -> Result<String, SupervisorError> {
        let name = K::modify(&self.store, key, |record| K::log_name(record))?.ok_or_else(|| {
            SupervisorError::UnknownResource {
                kind: K::KIND,
                key: key.to_string(),
            }
        })?;

        if let Some(buffer) = self.logs.get(&name) {
            return Ok(buffer.contents().to_string());
        }
        let path = self.store.paths().resource_log(&name);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(SupervisorError::Io { path, source }),
        }
    }

    fn append_log(&self, name: &str, stream: Stream, line: &str) {
        let now = model::now_ms();
        let limit = self.settings.log_buffer_chars;
        let path = self.store.paths().resource_log(name);
        self.logs
            .entry(name.to_string())
            .or_insert_with(|| match std::fs::read_to_string(&path) {
                Ok(existing) => CaptureBuffer::with_contents(limit, &existing),
                Err(_) => CaptureBuffer::new(limit),
            })
            .push(stream, line, now);
    }

    fn forget_logs(&self, name: &str) {
        self.logs.remove(name);
    }

    /// Write every buffer that changed since the last flush to its log file
    pub async fn flush_logs(&self) {
        let pending: Vec<(PathBuf, String)> = self
            .logs
            .iter_mut()
            .filter_map(|mut entry| {
                let path = self.store.paths().resource_log(entry.key());
                entry.value_mut().take_dirty().map(|text| (path, text))
            })
            .collect();

        for (path, text) in pending {
            if let Err(e) = tokio::fs::write(&path, text).await {
                warn!(
                    path = %path.display(),
                    code = ?e.raw_os_error(),
                    kind = ?e.kind(),
                    error = %e,
                    "Failed to flush log"
                );
            }
        }
    }
}

/// Websites: `<interpreter> <path>/index.js <port>` on an allocated loopback port
#[derive(Debug)]
pub struct Website {
    ports: PortAllocator,
}

impl Website {
    pub fn new(port_range_start: u16) -> Self {
        Self {
            ports: PortAllocator::new(port_range_start),
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }
}

impl ResourceKind for Website {
    type Record = WebsiteRecord;
    const KIND: &'static str = "website";

    fn records(store: &ConfigStore) -> Result<Vec<(String, WebsiteRecord)>, StoreError> {
        Ok(store.get_as::<Websites>(model::WEBSITES)?.into_iter().collect())
    }

    fn modify<R>(
        store: &ConfigStore,
        key: &str,
        f: impl FnOnce(&mut WebsiteRecord) -> R,
    ) -> Result<Option<R>, StoreError> {
        store.update(model::WEBSITES, |sites: &mut Websites| sites.get_mut(key).map(f))
    }

    fn log_name(record: &WebsiteRecord) -> String {
        record.domain.clone()
    }

    fn launch_spec(
        &self,
        key: &str,
        record: &mut WebsiteRecord,
        settings: &SupervisorConfig,
    ) -> Result<LaunchSpec, SupervisorError> {
        let port = self
            .ports
            .allocate(key, record.port)
            .ok_or(SupervisorError::NoFreePort)?;
        record.port = Some(port);

        let dir = PathBuf::from(&record.path);
        Ok(LaunchSpec {
            program: settings.interpreter.clone(),
            args: vec![dir.join("index.js").display().to_string(), port.to_string()],
            cwd: Some(dir),
            env: vec![("PORT".to_string(), port.to_string())],
        })
    }
}

/// Normalise user input to a bare lowercase host name
pub fn normalize_domain(input: &str) -> Result<String, SupervisorError> {
    let mut domain = input.trim().to_lowercase();
    for prefix in ["http://", "https://"] {
        if let Some(rest) = domain.strip_prefix(prefix) {
            domain = rest.to_string();
        }
    }
    if let Some(rest) = domain.strip_prefix("www.") {
        domain = rest.to_string();
    }
    let domain = domain.trim_end_matches('/').to_string();

    if domain.is_empty() {
        return Err(SupervisorError::Invalid("domain cannot be empty".to_string()));
    }
    if domain.len() > 253 {
        return Err(SupervisorError::Invalid("domain name too long".to_string()));
    }
    if domain.parse::<IpAddr>().is_ok() {
        return Ok(domain);
    }

    let valid_chars = domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid_chars || domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
        return Err(SupervisorError::Invalid(format!("invalid domain: {input}")));
    }

    Ok(domain)
}

/// IP literals and `localhost` get no default subdomains
fn is_bare_host(domain: &str) -> bool {
    domain == "localhost" || domain.parse::<IpAddr>().is_ok()
}

impl Supervisor<Website> {
    /// Register a new website serving from `path`
    pub fn create(&self, domain: &str, path: &str) -> Result<WebsiteRecord, SupervisorError> {
        let domain = normalize_domain(domain)?;
        if path.trim().is_empty() {
            return Err(SupervisorError::Invalid("website path cannot be empty".to_string()));
        }
        let dir = absolute(Path::new(path.trim()))?;
        std::fs::create_dir_all(&dir).map_err(|source| SupervisorError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut record = WebsiteRecord::new(&domain, &dir.display().to_string());
        if !is_bare_host(&domain) {
            record.subdomain = vec!["www".to_string()];
        }

        let inserted = self.store.update(model::WEBSITES, |sites: &mut Websites| {
            if sites.contains_key(&domain) {
                return false;
            }
            sites.insert(domain.clone(), record.clone());
            true
        })?;
        if !inserted {
            return Err(SupervisorError::AlreadyExists {
                kind: Website::KIND,
                key: domain,
            });
        }

        info!(domain = %domain, path = %dir.display(), "Website created");
        Ok(record)
    }

    /// Stop a website's process and remove its record
    pub async fn delete(&self, domain: &str) -> Result<(), SupervisorError> {
        let domain = normalize_domain(domain)?;
        self.stop_resource(&domain).await?;

        self.store.update(model::WEBSITES, |sites: &mut Websites| {
            sites.shift_remove(&domain);
        })?;
        self.kind.ports.release(&domain);
        self.clean_exits.remove(&domain);
        self.forget_logs(&domain);

        info!(domain = %domain, "Website deleted");
        Ok(())
    }

    pub async fn restart(self: &Arc<Self>, domain: &str) -> Result<LaunchOutcome, SupervisorError> {
        let domain = normalize_domain(domain)?;
        self.restart_resource(&domain).await
    }

    /// Websites in insertion order
    pub fn list(&self) -> Result<Vec<WebsiteRecord>, SupervisorError> {
        Ok(Website::records(&self.store)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }
}

/// Background services: `<interpreter> <file>` run from the file's directory
#[derive(Debug, Default)]
pub struct Service;

impl ResourceKind for Service {
    type Record = ServiceRecord;
    const KIND: &'static str = "service";

    fn records(store: &ConfigStore) -> Result<Vec<(String, ServiceRecord)>, StoreError> {
        Ok(store
            .get_as::<Vec<ServiceRecord>>(model::SERVICES)?
            .into_iter()
            .map(|service| (service.id.to_string(), service))
            .collect())
    }

    fn modify<R>(
        store: &ConfigStore,
        key: &str,
        f: impl FnOnce(&mut ServiceRecord) -> R,
    ) -> Result<Option<R>, StoreError> {
        store.update(model::SERVICES, |services: &mut Vec<ServiceRecord>| {
            services
                .iter_mut()
                .find(|service| service.id.to_string() == key)
                .map(f)
        })
    }

    fn log_name(record: &ServiceRecord) -> String {
        record.name.clone()
    }

    fn launch_spec(
        &self,
        _key: &str,
        record: &mut ServiceRecord,
        settings: &SupervisorConfig,
    ) -> Result<LaunchSpec, SupervisorError> {
        let file = PathBuf::from(&record.file);
        Ok(LaunchSpec {
            program: settings.interpreter.clone(),
            args: vec![record.file.clone()],
            cwd: file.parent().map(Path::to_path_buf),
            env: Vec::new(),
        })
    }
}

impl Supervisor<Service> {
    /// Resolve an id, a name or a file path to a service key
    pub fn resolve(&self, id_or_name: &str) -> Result<String, SupervisorError> {
        let wanted = id_or_name.trim();
        Service::records(&self.store)?
            .into_iter()
            .find(|(key, service)| key == wanted || service.name == wanted || service.file == wanted)
            .map(|(key, _)| key)
            .ok_or_else(|| SupervisorError::UnknownResource {
                kind: Service::KIND,
                key: wanted.to_string(),
            })
    }

    /// Register and activate a service script; an already registered file is restarted
    pub async fn add(self: &Arc<Self>, file: &str) -> Result<ServiceRecord, SupervisorError> {
        let path = absolute(Path::new(file.trim()))?;
        if !path.is_file() {
            return Err(SupervisorError::Invalid(format!(
                "service file not found: {}",
                path.display()
            )));
        }
        let file = path.display().to_string();

        let existing = Service::records(&self.store)?
            .into_iter()
            .find(|(_, service)| service.file == file);
        if let Some((key, _)) = existing {
            info!(file = %file, "Service already registered, restarting");
            Service::modify(&self.store, &key, |service| service.active = true)?;
            self.restart_resource(&key).await?;
            return self.find(&key);
        }

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| SupervisorError::Invalid(format!("invalid service file: {file}")))?;

        let record = self
            .store
            .update(model::SERVICES, |services: &mut Vec<ServiceRecord>| {
                let id = services.iter().map(|s| s.id + 1).max().unwrap_or(0);
                let record = ServiceRecord {
                    id,
                    name: name.clone(),
                    file: file.clone(),
                    active: true,
                    ..Default::default()
                };
                services.push(record.clone());
                record
            })?;

        info!(id = record.id, name = %record.name, file = %record.file, "Service added");
        Ok(record)
    }

    fn find(&self, key: &str) -> Result<ServiceRecord, SupervisorError> {
        Service::modify(&self.store, key, |service| service.clone())?.ok_or_else(|| {
            SupervisorError::UnknownResource {
                kind: Service::KIND,
                key: key.to_string(),
            }
        })
    }

    pub async fn start(self: &Arc<Self>, id_or_name: &str) -> Result<LaunchOutcome, SupervisorError> {
        let key = self.resolve(id_or_name)?;
        Service::modify(&self.store, &key, |service| {
            service.active = true;
            service.lifecycle.reset_errors();
        })?;
        self.clean_exits.remove(&key);
        Ok(self.launch(&key))
    }

    pub async fn stop(&self, id_or_name: &str) -> Result<(), SupervisorError> {
        let key = self.resolve(id_or_name)?;
        Service::modify(&self.store, &key, |service| service.active = false)?;
        self.stop_resource(&key).await
    }

    pub async fn restart(self: &Arc<Self>, id_or_name: &str) -> Result<LaunchOutcome, SupervisorError> {
        let key = self.resolve(id_or_name)?;
        Service::modify(&self.store, &key, |service| service.active = true)?;
        self.restart_resource(&key).await
    }

    /// Stop a service and remove its record
    pub async fn delete(&self, id_or_name: &str) -> Result<(), SupervisorError> {
        let key = self.resolve(id_or_name)?;
        let record = self.find(&key)?;
        Service::modify(&self.store, &key, |service| service.active = false)?;
        self.stop_resource(&key).await?;

        self.store
            .update(model::SERVICES, |services: &mut Vec<ServiceRecord>| {
                services.retain(|service| service.id.to_string() != key);
            })?;
        self.clean_exits.remove(&key);
        self.forget_logs(&record.name);

        info!(id = record.id, name = %record.name, "Service deleted");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ServiceRecord>, SupervisorError> {
        Ok(Service::records(&self.store)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }
}

fn absolute(path: &Path) -> Result<PathBuf, SupervisorError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|source| SupervisorError::Io {
            path: path.to_path_buf(),
            source,
        })
}
