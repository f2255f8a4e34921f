//! Durable, crash-safe configuration store
//!
//! The configuration document is partitioned into named modules, each
//! persisted as its own JSON file under `config/`. Mutations go through an
//! explicit API that marks the owning module dirty; a background ticker
//! flushes only dirty modules. A module whose write fails stays dirty and is
//! retried on the next tick.
//!
//! On startup the store detects its on-disk format: an existing modular
//! directory is loaded directly, a legacy `config.json` is loaded and
//! migrated (see [`crate::migration`]), otherwise a fresh layout is created.

use crate::atomic;
use crate::config::Paths;
use crate::error::StoreError;
use crate::migration::{self, MigrationOutcome};
use crate::model::{self, CORE_MODULES};
use crate::ticker;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How the document is laid out on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// One file per module under `config/`
    Modular,
    /// The whole document in `config.json`
    Legacy,
}

/// Outcome of one save cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub written: Vec<String>,
    pub failed: Vec<String>,
    /// Another save was in flight
    pub skipped: bool,
    /// Every module failed and the store fell back to single-file mode
    pub degraded: bool,
}

/// Result of reading one JSON file from disk
enum ReadOutcome {
    Missing,
    Parsed(Value),
    Unusable(String),
}

struct Loaded {
    document: Map<String, Value>,
    mode: StorageMode,
    dirty: BTreeSet<String>,
}

/// The configuration store. Shared behind an `Arc`.
pub struct ConfigStore {
    paths: Paths,
    document: RwLock<Map<String, Value>>,
    dirty: Mutex<BTreeSet<String>>,
    mode: RwLock<StorageMode>,
    /// Held for the duration of a save; `save` skips when it is taken
    save_lock: Mutex<()>,
}

impl ConfigStore {
    /// Open the store rooted at `paths`, loading or initialising the document.
    ///
    /// Failing to create the base directory is the only fatal error.
    pub fn open(paths: Paths) -> Result<Arc<Self>, StoreError> {
        paths.ensure().map_err(|source| StoreError::BaseDir {
            path: paths.base().to_path_buf(),
            source,
        })?;

        let loaded = load(&paths);
        info!(
            base = %paths.base().display(),
            mode = ?loaded.mode,
            modules = loaded.document.len(),
            "Configuration store opened"
        );

        let store = Arc::new(Self {
            paths,
            document: RwLock::new(loaded.document),
            dirty: Mutex::new(loaded.dirty),
            mode: RwLock::new(loaded.mode),
            save_lock: Mutex::new(()),
        });

        if store.has_changes() {
            let report = store.save();
            if !report.failed.is_empty() {
                warn!(failed = ?report.failed, "Initial save incomplete, will retry");
            }
        }
        Ok(store)
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn mode(&self) -> StorageMode {
        *self.mode.read()
    }

    /// Names of all modules in the document
    pub fn modules(&self) -> Vec<String> {
        self.document.read().keys().cloned().collect()
    }

    /// A copy of a module's current value
    pub fn get(&self, module: &str) -> Option<Value> {
        self.document.read().get(module).cloned()
    }

    /// A module deserialised into its typed form; missing modules yield their default
    pub fn get_as<T: DeserializeOwned>(&self, module: &str) -> Result<T, StoreError> {
        let value = self
            .get(module)
            .unwrap_or_else(|| model::default_module(module));
        serde_json::from_value(value).map_err(|source| StoreError::Shape {
            module: module.to_string(),
            source,
        })
    }

    /// Replace a whole module
    pub fn set(&self, module: &str, value: Value) -> Result<(), StoreError> {
        validate_module_name(module)?;
        let mut doc = self.document.write();
        if doc.get(module) != Some(&value) {
            doc.insert(module.to_string(), value);
            self.mark_dirty(module);
        }
        Ok(())
    }

    /// Replace a whole module from a typed value
    pub fn set_as<T: Serialize>(&self, module: &str, value: &T) -> Result<(), StoreError> {
        self.set(module, serde_json::to_value(value)?)
    }

    /// Assign `value` at `path`, whose first segment names the module.
    ///
    /// Missing intermediate objects are created; numeric segments index into
    /// arrays. Segments are taken literally, so keys may contain dots.
    pub fn mutate<S: AsRef<str>>(&self, path: &[S], value: Value) -> Result<(), StoreError> {
        let (module, rest) = path
            .split_first()
            .ok_or_else(|| StoreError::InvalidPath("<empty path>".to_string()))?;
        let module: &str = module.as_ref();
        validate_module_name(module)?;

        let mut doc = self.document.write();
        let Some((last, parents)) = rest.split_last() else {
            if doc.get(module) != Some(&value) {
                doc.insert(module.to_string(), value);
                self.mark_dirty(module);
            }
            return Ok(());
        };

        let display = || {
            path.iter()
                .map(|s| s.as_ref())
                .collect::<Vec<&str>>()
                .join(" / ")
        };

        let mut cursor = doc
            .entry(module.to_string())
            .or_insert_with(|| model::default_module(module));
        for segment in parents {
            let segment: &str = segment.as_ref();
            cursor = match cursor {
                Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| items.get_mut(index))
                    .ok_or_else(|| StoreError::InvalidPath(display()))?,
                _ => return Err(StoreError::InvalidPath(display())),
            };
        }

        let last: &str = last.as_ref();
        let changed = match cursor {
            Value::Object(map) => {
                if map.get(last) == Some(&value) {
                    false
                } else {
                    map.insert(last.to_string(), value);
                    true
                }
            }
            Value::Array(items) => {
                let index = last
                    .parse::<usize>()
                    .map_err(|_| StoreError::InvalidPath(display()))?;
                match index.cmp(&items.len()) {
                    std::cmp::Ordering::Less => {
                        let changed = items[index] != value;
                        items[index] = value;
                        changed
                    }
                    std::cmp::Ordering::Equal => {
                        items.push(value);
                        true
                    }
                    std::cmp::Ordering::Greater => {
                        return Err(StoreError::InvalidPath(display()));
                    }
                }
            }
            _ => return Err(StoreError::InvalidPath(display())),
        };

        if changed {
            self.mark_dirty(module);
        }
        Ok(())
    }

    /// Apply `f` to the typed form of a module and write the result back.
    ///
    /// The module is only marked dirty when the closure actually changed it.
    pub fn update<T, R>(&self, module: &str, f: impl FnOnce(&mut T) -> R) -> Result<R, StoreError>
    where
        T: Serialize + DeserializeOwned,
    {
        validate_module_name(module)?;
        let mut doc = self.document.write();
        let current = doc
            .get(module)
            .cloned()
            .unwrap_or_else(|| model::default_module(module));
        let mut typed: T = serde_json::from_value(current).map_err(|source| StoreError::Shape {
            module: module.to_string(),
            source,
        })?;

        let result = f(&mut typed);

        let value = serde_json::to_value(&typed)?;
        if doc.get(module) != Some(&value) {
            doc.insert(module.to_string(), value);
            self.mark_dirty(module);
        }
        Ok(result)
    }

    pub fn mark_dirty(&self, module: &str) {
        self.dirty.lock().insert(module.to_string());
    }

    pub fn is_dirty(&self, module: &str) -> bool {
        self.dirty.lock().contains(module)
    }

    pub fn dirty_modules(&self) -> Vec<String> {
        self.dirty.lock().iter().cloned().collect()
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty.lock().is_empty()
    }

    /// Flush dirty modules. Skips when another save is in flight or nothing changed.
    pub fn save(&self) -> SaveReport {
        let Some(_guard) = self.save_lock.try_lock() else {
            debug!("Save already in progress, skipping");
            return SaveReport {
                skipped: true,
                ..Default::default()
            };
        };
        self.save_locked()
    }

    /// Mark every module dirty and write them all, waiting for an in-flight save.
    pub fn force_save(&self) -> SaveReport {
        let _guard = self.save_lock.lock();
        {
            let modules: Vec<String> = self.document.read().keys().cloned().collect();
            let mut dirty = self.dirty.lock();
            dirty.extend(modules);
        }
        self.save_locked()
    }

    fn save_locked(&self) -> SaveReport {
        let pending: BTreeSet<String> = std::mem::take(&mut *self.dirty.lock());
        if pending.is_empty() {
            return SaveReport::default();
        }

        match self.mode() {
            StorageMode::Modular => self.save_modules(pending),
            StorageMode::Legacy => self.save_legacy(pending),
        }
    }

    fn save_modules(&self, pending: BTreeSet<String>) -> SaveReport {
        let snapshot: Vec<(String, Value)> = {
            let doc = self.document.read();
            pending
                .iter()
                .filter_map(|module| doc.get(module).map(|v| (module.clone(), v.clone())))
                .collect()
        };

        let mut report = SaveReport::default();
        for (module, value) in snapshot {
            let target = self.paths.module_file(&module);
            let backup = self.paths.module_backup(&module);
            match atomic::write_json(&target, Some(&backup), &value) {
                Ok(()) => report.written.push(module),
                Err(e) => {
                    log_write_failure(&module, &e);
                    report.failed.push(module);
                }
            }
        }

        if !report.failed.is_empty() {
            let mut dirty = self.dirty.lock();
            dirty.extend(report.failed.iter().cloned());
        }

        if report.written.is_empty() && !report.failed.is_empty() {
            error!(
                failed = report.failed.len(),
                "Every module write failed, degrading to single-file mode"
            );
            *self.mode.write() = StorageMode::Legacy;
            report.degraded = true;
            let retry: BTreeSet<String> = std::mem::take(&mut *self.dirty.lock());
            let legacy = self.save_legacy(retry);
            if legacy.failed.is_empty() {
                self.set_aside_modules();
            }
            report.written = legacy.written;
            report.failed = legacy.failed;
        } else if !report.written.is_empty() {
            debug!(modules = ?report.written, "Modules saved");
        }
        report
    }

    fn save_legacy(&self, pending: BTreeSet<String>) -> SaveReport {
        let document = Value::Object(self.document.read().clone());
        let target = self.paths.legacy_file();
        let backup = self.paths.legacy_backup();

        let mut report = SaveReport::default();
        match atomic::write_json(&target, Some(&backup), &document) {
            Ok(()) => {
                report.written = pending.into_iter().collect();
                debug!(path = %target.display(), "Single-file config saved");
            }
            Err(e) => {
                log_write_failure("config", &e);
                report.failed = pending.iter().cloned().collect();
                self.dirty.lock().extend(pending);
            }
        }
        report
    }

    /// Move the modular directory out of the way so the next load reads `config.json`
    fn set_aside_modules(&self) {
        let dir = self.paths.modules_dir();
        let aside = self.paths.degraded_modules_dir();
        if aside.exists() {
            if let Err(e) = std::fs::remove_dir_all(&aside) {
                warn!(path = %aside.display(), error = %e, code = ?e.raw_os_error(), "Failed to remove previous degraded module directory");
            }
        }
        match std::fs::rename(&dir, &aside) {
            Ok(()) => warn!(path = %aside.display(), "Modular directory set aside, single-file config is authoritative"),
            Err(e) => error!(
                path = %dir.display(),
                error = %e,
                code = ?e.raw_os_error(),
                "Cannot set modular directory aside, next start will ignore single-file config"
            ),
        }
    }

    /// Discard in-memory state and load the document from disk again
    pub fn reload(&self) {
        let _guard = self.save_lock.lock();
        let loaded = load(&self.paths);
        *self.document.write() = loaded.document;
        *self.dirty.lock() = loaded.dirty;
        *self.mode.write() = loaded.mode;
        info!(mode = ?loaded.mode, "Configuration reloaded from disk");
    }

    /// Flush dirty modules every `interval` until shutdown
    pub fn spawn_save_loop(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        ticker::spawn_ticker("config-save", interval, shutdown, move || {
            let store = Arc::clone(&store);
            async move {
                if !store.has_changes() {
                    return;
                }
                if let Err(e) = tokio::task::spawn_blocking(move || store.save()).await {
                    error!(error = %e, "Save task panicked");
                }
            }
        })
    }
}

fn log_write_failure(module: &str, e: &StoreError) {
    match e {
        StoreError::Io { path, code, source } => {
            error!(
                module,
                path = %path.display(),
                code = ?code,
                kind = ?source.kind(),
                error = %source,
                "Failed to write config module"
            );
        }
        other => error!(module, error = %other, "Failed to write config module"),
    }
}

fn validate_module_name(module: &str) -> Result<(), StoreError> {
    let valid = !module.is_empty()
        && module
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidModule(module.to_string()))
    }
}

fn read_json(path: &Path) -> ReadOutcome {
    match std::fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => ReadOutcome::Unusable("file is empty".to_string()),
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => ReadOutcome::Parsed(value),
            Err(e) => ReadOutcome::Unusable(e.to_string()),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ReadOutcome::Missing,
        Err(e) => ReadOutcome::Unusable(format!("{} (os error {:?})", e, e.raw_os_error())),
    }
}

/// Keep a failing file for inspection instead of deleting it
fn preserve_corrupted(path: &Path) {
    let mut name = path.as_os_str().to_os_string();
    name.push(".corrupted");
    let target = PathBuf::from(name);
    match std::fs::rename(path, &target) {
        Ok(()) => warn!(path = %target.display(), "Corrupted file preserved"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to preserve corrupted file"),
    }
}

/// Read a document, falling back to its backup and finally to `default`.
///
/// Returns the value and whether it had to be recovered.
fn read_with_recovery(
    label: &str,
    primary: &Path,
    backup: &Path,
    default: impl FnOnce() -> Value,
) -> (Value, bool) {
    match read_json(primary) {
        ReadOutcome::Parsed(value) => return (value, false),
        ReadOutcome::Missing => {}
        ReadOutcome::Unusable(reason) => {
            warn!(module = label, path = %primary.display(), %reason, "Config file unreadable, trying backup");
            preserve_corrupted(primary);
        }
    }

    match read_json(backup) {
        ReadOutcome::Parsed(value) => {
            warn!(module = label, path = %backup.display(), "Recovered from backup");
            (value, true)
        }
        ReadOutcome::Missing => (default(), true),
        ReadOutcome::Unusable(reason) => {
            error!(module = label, path = %backup.display(), %reason, "Backup unreadable too, using defaults");
            preserve_corrupted(backup);
            (default(), true)
        }
    }
}

fn module_names_on_disk(paths: &Paths) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let Ok(entries) = std::fs::read_dir(paths.modules_dir()) else {
        return names;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if validate_module_name(stem).is_ok() {
                names.insert(stem.to_string());
            }
        }
    }
    names
}

fn load(paths: &Paths) -> Loaded {
    if paths.modules_dir().is_dir() {
        load_modular(paths)
    } else if paths.legacy_file().exists() || paths.legacy_backup().exists() {
        load_legacy(paths)
    } else {
        info!(base = %paths.base().display(), "No configuration found, initialising fresh layout");
        let document: Map<String, Value> = CORE_MODULES
            .iter()
            .map(|m| (m.to_string(), model::default_module(m)))
            .collect();
        let dirty = document.keys().cloned().collect();
        Loaded {
            document,
            mode: StorageMode::Modular,
            dirty,
        }
    }
}

fn load_modular(paths: &Paths) -> Loaded {
    let mut names = module_names_on_disk(paths);
    names.extend(CORE_MODULES.iter().map(|m| m.to_string()));

    let mut document = Map::new();
    let mut dirty = BTreeSet::new();
    for module in names {
        let (mut value, recovered) = read_with_recovery(
            &module,
            &paths.module_file(&module),
            &paths.module_backup(&module),
            || model::default_module(&module),
        );
        if model::repair_module(&module, &mut value) {
            warn!(module = %module, "Module shape repaired");
            dirty.insert(module.clone());
        }
        if recovered {
            dirty.insert(module.clone());
        }
        document.insert(module, value);
    }

    Loaded {
        document,
        mode: StorageMode::Modular,
        dirty,
    }
}

fn load_legacy(paths: &Paths) -> Loaded {
    let legacy = paths.legacy_file();
    let (value, recovered) = read_with_recovery(
        "config",
        &legacy,
        &paths.legacy_backup(),
        || Value::Object(Map::new()),
    );

    let mut document = match value {
        Value::Object(map) => map,
        other => {
            error!(found = ?other, "Legacy config is not an object, using defaults");
            Map::new()
        }
    };

    if recovered || !legacy.exists() {
        // Migration backs up the legacy file; it must hold what we loaded.
        if let Err(e) = atomic::write_json(&legacy, None, &Value::Object(document.clone())) {
            error!(error = %e, "Cannot rewrite recovered legacy config, staying in single-file mode");
            let dirty = document.keys().cloned().collect();
            return Loaded {
                document,
                mode: StorageMode::Legacy,
                dirty,
            };
        }
    }

    let mode = match migration::migrate_legacy(paths, &document) {
        MigrationOutcome::Migrated { .. } => StorageMode::Modular,
        MigrationOutcome::RolledBack { reason } => {
            warn!(%reason, "Continuing in single-file mode");
            StorageMode::Legacy
        }
    };

    let mut dirty = BTreeSet::new();
    for module in CORE_MODULES {
        if !document.contains_key(module) {
            document.insert(module.to_string(), model::default_module(module));
            dirty.insert(module.to_string());
        }
        if let Some(value) = document.get_mut(module) {
            if model::repair_module(module, value) {
                dirty.insert(module.to_string());
            }
        }
    }

    Loaded {
        document,
        mode,
        dirty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceRecord, Websites, SERVER, SERVICES, WEBSITES};
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, Arc<ConfigStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(Paths::new(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_fresh_layout_is_written() {
        let (dir, store) = open_temp();
        let paths = Paths::new(dir.path());

        assert_eq!(store.mode(), StorageMode::Modular);
        for module in CORE_MODULES {
            assert!(paths.module_file(module).exists(), "{module} not written");
        }
        assert!(!store.has_changes());
        assert!(store.get(SERVER).unwrap().is_object());
    }

    #[test]
    fn test_update_marks_only_owning_module_dirty() {
        let (_dir, store) = open_temp();

        store
            .update::<Websites, _>(WEBSITES, |sites| {
                sites.insert(
                    "example.com".to_string(),
                    crate::model::WebsiteRecord::new("example.com", "/srv/example.com"),
                );
            })
            .unwrap();

        assert_eq!(store.dirty_modules(), vec![WEBSITES.to_string()]);
    }

    #[test]
    fn test_update_without_change_stays_clean() {
        let (_dir, store) = open_temp();
        store.update::<Websites, _>(WEBSITES, |_| ()).unwrap();
        assert!(!store.has_changes());
    }

    #[test]
    fn test_mutate_nested_path_with_dotted_key() {
        let (_dir, store) = open_temp();

        store
            .mutate(&["websites", "example.com", "port"], json!(60000))
            .unwrap();
        assert_eq!(store.get(WEBSITES).unwrap()["example.com"]["port"], 60000);
        assert!(store.is_dirty(WEBSITES));
        assert!(!store.is_dirty(SERVICES));

        store.mutate(&["services", "0"], json!({"name": "a", "file": "/a.js"})).unwrap();
        assert_eq!(store.get(SERVICES).unwrap()[0]["name"], "a");

        assert!(store.mutate(&["services", "5"], json!(1)).is_err());
        assert!(store.mutate(&["../etc"], json!(1)).is_err());
    }

    #[test]
    fn test_save_writes_dirty_modules_and_backups() {
        let (dir, store) = open_temp();
        let paths = Paths::new(dir.path());

        store.mutate(&["websites", "a.com", "path"], json!("/srv/a")).unwrap();
        let report = store.save();
        assert_eq!(report.written, vec![WEBSITES.to_string()]);
        assert!(!store.has_changes());

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(paths.module_file(WEBSITES)).unwrap())
                .unwrap();
        assert_eq!(on_disk["a.com"]["path"], "/srv/a");

        let backup: Value =
            serde_json::from_str(&std::fs::read_to_string(paths.module_backup(WEBSITES)).unwrap())
                .unwrap();
        assert_eq!(backup, json!({}));
    }

    #[test]
    fn test_save_is_noop_when_clean() {
        let (_dir, store) = open_temp();
        assert_eq!(store.save(), SaveReport::default());
    }

    #[test]
    fn test_empty_module_recovers_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        {
            let store = ConfigStore::open(paths.clone()).unwrap();
            store.mutate(&["websites", "a.com", "path"], json!("/srv/a")).unwrap();
            store.save();
            store.mutate(&["websites", "b.com", "path"], json!("/srv/b")).unwrap();
            store.save();
        }
        std::fs::write(paths.module_file(WEBSITES), "").unwrap();

        let store = ConfigStore::open(paths.clone()).unwrap();
        let sites = store.get(WEBSITES).unwrap();
        assert_eq!(sites["a.com"]["path"], "/srv/a");
        assert!(sites.get("b.com").is_none());
        assert!(dir.path().join("config/websites.json.corrupted").exists());
    }

    #[test]
    fn test_empty_module_and_backup_fall_back_to_typed_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        drop(ConfigStore::open(paths.clone()).unwrap());

        std::fs::write(paths.module_file(WEBSITES), "").unwrap();
        std::fs::write(paths.module_backup(WEBSITES), "").unwrap();
        std::fs::write(paths.module_file(SERVICES), "").unwrap();
        std::fs::write(paths.module_backup(SERVICES), "").unwrap();

        let store = ConfigStore::open(paths.clone()).unwrap();
        assert_eq!(store.get(WEBSITES).unwrap(), json!({}));
        assert_eq!(store.get(SERVICES).unwrap(), json!([]));
        assert!(dir.path().join("config/websites.json.corrupted").exists());
        assert!(dir.path().join(".bak/websites.json.bak.corrupted").exists());
        assert!(dir.path().join(".bak/services.json.bak.corrupted").exists());
    }

    #[test]
    fn test_corrupted_server_module_keeps_shape() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        drop(ConfigStore::open(paths.clone()).unwrap());

        std::fs::write(paths.module_file(SERVER), "{\"pid\": 4").unwrap();
        let _ = std::fs::remove_file(paths.module_backup(SERVER));

        let store = ConfigStore::open(paths).unwrap();
        let server = store.get(SERVER).unwrap();
        assert!(server.is_object());
        assert!(server.get("pid").is_some());
        assert!(server.get("watchdog").is_some());
    }

    #[test]
    fn test_legacy_file_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let legacy = json!({
            "server": {"pid": 1, "started": 2, "watchdog": 3, "os": "linux", "arch": "x86_64"},
            "websites": {"a.com": {"domain": "a.com", "path": "/srv/a"}},
            "services": [{"id": 0, "name": "w", "file": "/w.js", "active": true}],
            "dns": {"a.com": {"A": []}}
        });
        std::fs::write(paths.legacy_file(), serde_json::to_vec(&legacy).unwrap()).unwrap();

        let store = ConfigStore::open(paths.clone()).unwrap();
        assert_eq!(store.mode(), StorageMode::Modular);
        assert!(paths.module_file("dns").exists());
        assert!(!paths.legacy_file().exists());

        let services: Vec<ServiceRecord> = store.get_as(SERVICES).unwrap();
        assert_eq!(services[0].name, "w");
        assert_eq!(store.get("dns").unwrap(), legacy["dns"]);
    }

    #[test]
    fn test_modular_directory_wins_over_legacy_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        drop(ConfigStore::open(paths.clone()).unwrap());
        std::fs::write(paths.legacy_file(), "{\"websites\": {\"old.com\": {}}}").unwrap();

        let store = ConfigStore::open(paths).unwrap();
        assert!(store.get(WEBSITES).unwrap().get("old.com").is_none());
    }

    #[test]
    fn test_reload_discards_unsaved_changes() {
        let (_dir, store) = open_temp();
        store.mutate(&["ssl", "expiry"], json!(5)).unwrap();
        store.reload();
        assert_eq!(store.get("ssl").unwrap(), json!({}));
        assert!(!store.has_changes());
    }

    #[test]
    fn test_force_save_rewrites_everything() {
        let (_dir, store) = open_temp();
        let report = store.force_save();
        assert_eq!(report.written.len(), CORE_MODULES.len());
    }

    #[cfg(unix)]
    #[test]
    fn test_all_writes_failing_degrades_to_single_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let store = ConfigStore::open(paths.clone()).unwrap();

        let modules_dir = paths.modules_dir();
        std::fs::set_permissions(&modules_dir, std::fs::Permissions::from_mode(0o500)).unwrap();

        // Root ignores directory permissions; nothing to observe then.
        let probe = modules_dir.join("probe");
        if std::fs::write(&probe, b"x").is_ok() {
            let _ = std::fs::remove_file(&probe);
            std::fs::set_permissions(&modules_dir, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        store.mutate(&["websites", "a.com", "path"], json!("/srv/a")).unwrap();
        let report = store.save();
        assert!(report.degraded);
        assert_eq!(store.mode(), StorageMode::Legacy);
        assert!(!store.is_dirty(WEBSITES));
        assert!(paths.legacy_file().exists());

        assert!(!modules_dir.exists());
        let aside = paths.degraded_modules_dir();
        std::fs::set_permissions(&aside, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_degraded_save_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let store = ConfigStore::open(paths.clone()).unwrap();

        // A directory where the module file should be makes every write fail
        let blocker = paths.module_file(WEBSITES);
        std::fs::remove_file(&blocker).unwrap();
        std::fs::create_dir_all(blocker.join("occupied")).unwrap();

        store.mutate(&["websites", "a.com", "path"], json!("/srv/a")).unwrap();
        let report = store.save();
        assert!(report.degraded);
        assert!(report.failed.is_empty());
        assert!(!paths.modules_dir().exists());
        assert!(paths.degraded_modules_dir().join("websites.json").is_dir());
        drop(store);

        let reopened = ConfigStore::open(paths.clone()).unwrap();
        assert_eq!(reopened.mode(), StorageMode::Modular);
        assert_eq!(reopened.get(WEBSITES).unwrap()["a.com"]["path"], "/srv/a");
        assert!(paths.module_file(WEBSITES).is_file());
    }
}
