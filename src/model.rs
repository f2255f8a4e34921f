//! Typed records persisted in the configuration store
//!
//! The store keeps every module as a JSON document; these types describe the
//! shape of the modules the control plane itself reads and writes.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SERVER: &str = "server";
pub const WEBSITES: &str = "websites";
pub const SERVICES: &str = "services";
pub const SSL: &str = "ssl";

/// Modules that always exist, in the order they are initialised
pub const CORE_MODULES: [&str; 4] = [SERVER, WEBSITES, SERVICES, SSL];

/// Current wall clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Typed default of a module
pub fn default_module(module: &str) -> Value {
    match module {
        SERVER => serde_json::to_value(ServerInfo::default()).unwrap_or_else(|_| Value::Object(Default::default())),
        SERVICES => Value::Array(Vec::new()),
        _ => Value::Object(Default::default()),
    }
}

/// Give a module its structural shape back if it lost it.
///
/// Returns true when the value was changed.
pub fn repair_module(module: &str, value: &mut Value) -> bool {
    match module {
        SERVER => {
            if !value.is_object() {
                *value = default_module(SERVER);
                return true;
            }
            let Some(fields) = value.as_object_mut() else {
                return false;
            };
            let mut changed = false;
            if let Value::Object(defaults) = default_module(SERVER) {
                for (key, default) in defaults {
                    if !fields.contains_key(&key) {
                        fields.insert(key, default);
                        changed = true;
                    }
                }
            }
            changed
        }
        SERVICES if !value.is_array() => {
            *value = default_module(SERVICES);
            true
        }
        WEBSITES | SSL if !value.is_object() => {
            *value = default_module(module);
            true
        }
        _ => false,
    }
}

/// Bookkeeping about the control-plane process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub started: Option<i64>,
    #[serde(default)]
    pub watchdog: Option<u32>,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            pid: None,
            started: None,
            watchdog: None,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Lifecycle status of a supervised resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    #[default]
    Stopped,
    Errored,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Errored => "errored",
        }
    }
}

/// Whether a resource may be launched right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchGate {
    Allowed,
    /// Errored too recently; wait this many more milliseconds
    CoolingDown { remaining_ms: i64 },
    /// Error count is past the ceiling; only a manual restart resets it
    Exhausted,
}

/// Process state shared by websites and services
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub started: Option<i64>,
    #[serde(default)]
    pub updated: Option<i64>,
    #[serde(default)]
    pub error_count: u32,
}

impl Lifecycle {
    /// Errored resources wait `error_count` seconds after their last status
    /// change; past `max_errors` they are not launched at all.
    pub fn launch_gate(&self, now: i64, max_errors: u32) -> LaunchGate {
        if self.error_count > max_errors {
            return LaunchGate::Exhausted;
        }
        if self.status == Status::Errored {
            let elapsed = now - self.updated.unwrap_or(0);
            let wait = i64::from(self.error_count) * 1000;
            if elapsed < wait {
                return LaunchGate::CoolingDown {
                    remaining_ms: wait - elapsed,
                };
            }
        }
        LaunchGate::Allowed
    }

    pub fn mark_running(&mut self, pid: u32, now: i64) {
        self.pid = Some(pid);
        self.status = Status::Running;
        self.started = Some(now);
        self.updated = Some(now);
    }

    pub fn mark_errored(&mut self, now: i64) {
        self.error_count = self.error_count.saturating_add(1);
        self.status = Status::Errored;
        self.updated = Some(now);
    }

    pub fn mark_stopped(&mut self, now: i64) {
        self.status = Status::Stopped;
        self.updated = Some(now);
    }

    pub fn reset_errors(&mut self) {
        self.error_count = 0;
        if self.status == Status::Errored {
            self.status = Status::Stopped;
        }
    }
}

/// Certificate files and expiry of a domain (or the bootstrap certificate)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBlock {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
    /// Expiry in epoch milliseconds
    #[serde(default)]
    pub expiry: Option<i64>,
}

/// The `ssl` module: the bootstrap self-signed certificate
pub type SslInfo = CertificateBlock;

/// A hosted website
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsiteRecord {
    pub domain: String,
    pub path: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub subdomain: Vec<String>,
    #[serde(default)]
    pub cert: Option<CertificateBlock>,
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
}

impl WebsiteRecord {
    pub fn new(domain: &str, path: &str) -> Self {
        Self {
            domain: domain.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// The domain followed by every `sub.domain`, deduplicated, in order
    pub fn certificate_names(&self) -> Vec<String> {
        let mut names = vec![self.domain.clone()];
        for sub in &self.subdomain {
            let sub = sub.trim().trim_end_matches('.');
            if sub.is_empty() {
                continue;
            }
            let name = format!("{}.{}", sub, self.domain);
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

/// The `websites` module: domain to record, in insertion order
pub type Websites = IndexMap<String, WebsiteRecord>;

/// A background service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    #[serde(default)]
    pub id: usize,
    pub name: String,
    pub file: String,
    /// Desired-running intent
    #[serde(default)]
    pub active: bool,
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
}

/// Records that carry a process lifecycle
pub trait Resource {
    fn lifecycle(&self) -> &Lifecycle;
    fn lifecycle_mut(&mut self) -> &mut Lifecycle;
    /// Whether the resource should currently have a live process
    fn should_run(&self) -> bool;
}

impl Resource for WebsiteRecord {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn should_run(&self) -> bool {
        true
    }
}

impl Resource for ServiceRecord {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn should_run(&self) -> bool {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_defaults() {
        assert_eq!(default_module(WEBSITES), serde_json::json!({}));
        assert_eq!(default_module(SERVICES), serde_json::json!([]));
        assert_eq!(default_module(SSL), serde_json::json!({}));
        let server = default_module(SERVER);
        assert!(server.get("pid").is_some());
        assert!(server.get("watchdog").is_some());
        assert_eq!(server["os"], std::env::consts::OS);
    }

    #[test]
    fn test_repair_server_shape() {
        let mut value = Value::Null;
        assert!(repair_module(SERVER, &mut value));
        assert!(value.is_object());

        let mut partial = serde_json::json!({"pid": 12});
        assert!(repair_module(SERVER, &mut partial));
        assert_eq!(partial["pid"], 12);
        assert!(partial.get("started").is_some());

        let mut services = serde_json::json!({});
        assert!(repair_module(SERVICES, &mut services));
        assert_eq!(services, serde_json::json!([]));
    }

    #[test]
    fn test_backoff_gate_grows_with_error_count() {
        let now = 1_000_000;
        let mut lifecycle = Lifecycle {
            status: Status::Errored,
            updated: Some(now),
            ..Default::default()
        };

        let mut previous = 0;
        for count in 1..=10 {
            lifecycle.error_count = count;
            let remaining = match lifecycle.launch_gate(now, 10) {
                LaunchGate::CoolingDown { remaining_ms } => remaining_ms,
                other => panic!("expected cooldown at {count}, got {other:?}"),
            };
            assert!(remaining >= previous);
            previous = remaining;
            assert_eq!(
                lifecycle.launch_gate(now + i64::from(count) * 1000, 10),
                LaunchGate::Allowed
            );
        }

        lifecycle.error_count = 11;
        assert_eq!(lifecycle.launch_gate(now + 3_600_000, 10), LaunchGate::Exhausted);
    }

    #[test]
    fn test_backoff_ignores_stopped_resources() {
        let lifecycle = Lifecycle {
            status: Status::Stopped,
            updated: Some(10),
            error_count: 5,
            ..Default::default()
        };
        assert_eq!(lifecycle.launch_gate(10, 10), LaunchGate::Allowed);
    }

    #[test]
    fn test_website_record_json_shape() {
        let mut record = WebsiteRecord::new("example.com", "/var/www/example.com");
        record.port = Some(60000);
        record.subdomain = vec!["www".to_string()];
        record.lifecycle.mark_running(4242, 5);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["pid"], 4242);
        assert_eq!(value["status"], "running");
        assert_eq!(value["errorCount"], 0);
        assert_eq!(value["port"], 60000);

        let back: WebsiteRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_service_record_accepts_sparse_json() {
        let record: ServiceRecord =
            serde_json::from_value(serde_json::json!({"name": "worker", "file": "/srv/worker.js"}))
                .unwrap();
        assert!(!record.active);
        assert_eq!(record.lifecycle.status, Status::Stopped);
        assert!(!record.should_run());
    }

    #[test]
    fn test_certificate_names_dedup() {
        let mut record = WebsiteRecord::new("example.com", "/srv");
        record.subdomain = vec!["www".into(), "api".into(), "www".into(), "".into()];
        assert_eq!(
            record.certificate_names(),
            vec!["example.com", "www.example.com", "api.example.com"]
        );
    }
}
