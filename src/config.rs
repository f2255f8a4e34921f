use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime settings for the control plane and the watchdog
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Filesystem layout
    #[serde(default)]
    pub paths: PathsConfig,

    /// Configuration store persistence
    #[serde(default)]
    pub store: StoreConfig,

    /// Supervised process settings (websites and services)
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Certificate lifecycle settings
    #[serde(default)]
    pub certs: CertsConfig,

    /// Meta-supervisor settings
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PathsConfig {
    /// Root of all persisted state (default: ~/.candypack)
    pub base_dir: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Interval between flushes of dirty modules in milliseconds
    #[serde(default = "default_save_interval")]
    pub save_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            save_interval_ms: default_save_interval(),
        }
    }
}

impl StoreConfig {
    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Reconciliation tick interval in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Interval for flushing captured output to log files in milliseconds
    #[serde(default = "default_log_flush_interval")]
    pub log_flush_interval_ms: u64,

    /// Maximum characters retained per resource log buffer
    #[serde(default = "default_log_buffer_chars")]
    pub log_buffer_chars: usize,

    /// Error count above which a resource is never relaunched automatically
    #[serde(default = "default_max_error_count")]
    pub max_error_count: u32,

    /// First port probed for website processes
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Program used to run website entry points and service scripts
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Grace period in seconds between SIGTERM and SIGKILL on deliberate stop
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            log_flush_interval_ms: default_log_flush_interval(),
            log_buffer_chars: default_log_buffer_chars(),
            max_error_count: default_max_error_count(),
            port_range_start: default_port_range_start(),
            interpreter: default_interpreter(),
            stop_grace_period_secs: default_stop_grace_period(),
        }
    }
}

impl SupervisorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertsConfig {
    /// Interval between certificate reconciliation passes in seconds
    #[serde(default = "default_cert_check_interval")]
    pub check_interval_secs: u64,

    /// Renew domain certificates this many days before expiry
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: i64,

    /// Validity recorded for freshly issued domain certificates
    #[serde(default = "default_validity_days")]
    pub validity_days: i64,

    /// Validity of the self-signed bootstrap certificate
    #[serde(default = "default_bootstrap_validity_days")]
    pub bootstrap_validity_days: i64,

    /// ACME directory URL (defaults to Let's Encrypt production)
    pub directory_url: Option<String>,

    /// TTL of challenge TXT records
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl: u32,

    /// Optional contact address for the ACME account
    pub contact_email: Option<String>,
}

impl Default for CertsConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_cert_check_interval(),
            renew_before_days: default_renew_before_days(),
            validity_days: default_validity_days(),
            bootstrap_validity_days: default_bootstrap_validity_days(),
            directory_url: None,
            challenge_ttl: default_challenge_ttl(),
            contact_email: None,
        }
    }
}

impl CertsConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn directory_url(&self) -> &str {
        self.directory_url
            .as_deref()
            .unwrap_or(instant_acme::LetsEncrypt::Production.url())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchdogConfig {
    /// Control-plane executable (default: `candypack` next to the watchdog binary)
    pub server_bin: Option<String>,

    /// Restart counter resets after this many seconds without a restart
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,

    /// Restarts within one window after which the watchdog gives up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Lines retained per captured stream
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,

    /// Interval for flushing captured output in milliseconds
    #[serde(default = "default_log_flush_interval")]
    pub log_flush_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            server_bin: None,
            restart_window_secs: default_restart_window(),
            max_restarts: default_max_restarts(),
            log_lines: default_log_lines(),
            log_flush_interval_ms: default_log_flush_interval(),
        }
    }
}

impl WatchdogConfig {
    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms)
    }
}

fn default_save_interval() -> u64 {
    500
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_log_flush_interval() -> u64 {
    1000
}

fn default_log_buffer_chars() -> usize {
    1_000_000
}

fn default_max_error_count() -> u32 {
    10
}

fn default_port_range_start() -> u16 {
    60000
}

fn default_interpreter() -> String {
    "node".to_string()
}

fn default_stop_grace_period() -> u64 {
    5
}

fn default_cert_check_interval() -> u64 {
    60
}

fn default_renew_before_days() -> i64 {
    30
}

fn default_validity_days() -> i64 {
    90
}

fn default_bootstrap_validity_days() -> i64 {
    365
}

fn default_challenge_ttl() -> u32 {
    100
}

fn default_restart_window() -> u64 {
    300
}

fn default_max_restarts() -> u32 {
    100
}

fn default_log_lines() -> usize {
    1000
}

impl Config {
    /// Load settings from a TOML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("store.save_interval_ms", self.store.save_interval_ms),
            ("supervisor.tick_interval_ms", self.supervisor.tick_interval_ms),
            ("supervisor.log_flush_interval_ms", self.supervisor.log_flush_interval_ms),
            ("certs.check_interval_secs", self.certs.check_interval_secs),
            ("watchdog.log_flush_interval_ms", self.watchdog.log_flush_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }
        if self.supervisor.interpreter.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "supervisor.interpreter must not be empty".to_string(),
            ));
        }
        if self.watchdog.max_restarts == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.max_restarts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the on-disk layout rooted at the configured base directory
    pub fn paths(&self) -> Paths {
        let base = self
            .paths
            .base_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_base_dir);
        Paths::new(base)
    }
}

fn default_base_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".candypack")
}

/// Default location of the settings file
pub fn default_settings_path() -> PathBuf {
    default_base_dir().join("candypack.toml")
}

/// Every persisted location, derived from one base directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory holding one JSON document per module
    pub fn modules_dir(&self) -> PathBuf {
        self.base.join("config")
    }

    pub fn module_file(&self, module: &str) -> PathBuf {
        self.modules_dir().join(format!("{}.json", module))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.base.join(".bak")
    }

    pub fn module_backup(&self, module: &str) -> PathBuf {
        self.backup_dir().join(format!("{}.json.bak", module))
    }

    /// Legacy single-file document
    /// Where the modular directory is moved when saves degrade to `config.json`
    pub fn degraded_modules_dir(&self) -> PathBuf {
        self.base.join("config.degraded")
    }

    pub fn legacy_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn legacy_backup(&self) -> PathBuf {
        self.backup_dir().join("config.json.bak")
    }

    pub fn pre_migration_backup(&self) -> PathBuf {
        self.backup_dir().join("config.json.pre-migration")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn resource_log(&self, name: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.log", name))
    }

    pub fn server_log(&self) -> PathBuf {
        self.logs_dir().join(".candypack.log")
    }

    pub fn server_err_log(&self) -> PathBuf {
        self.logs_dir().join(".candypack_err.log")
    }

    pub fn ssl_dir(&self) -> PathBuf {
        self.base.join("ssl")
    }

    pub fn bootstrap_key(&self) -> PathBuf {
        self.ssl_dir().join("candypack.key")
    }

    pub fn bootstrap_cert(&self) -> PathBuf {
        self.ssl_dir().join("candypack.crt")
    }

    pub fn domain_key(&self, domain: &str) -> PathBuf {
        self.ssl_dir().join(format!("{}.key", domain))
    }

    pub fn domain_cert(&self, domain: &str) -> PathBuf {
        self.ssl_dir().join(format!("{}.crt", domain))
    }

    /// Create the directories the control plane writes into
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.backup_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.ssl_dir())?;
        Ok(())
    }
}
