//! Legacy single-file to modular layout migration
//!
//! Migration writes every module file, reads all of them back and compares
//! the rebuilt document with the original. Only a zero-difference comparison
//! commits; anything else removes the partial modular directory and restores
//! the legacy file from its pre-migration copy.

use crate::atomic;
use crate::config::Paths;
use crate::error::StoreError;
use serde_json::{Map, Value};
use std::fmt;
use tracing::{error, info, warn};

/// One structural mismatch between two JSON documents
#[derive(Debug, Clone, PartialEq)]
pub struct Difference {
    /// JSON-pointer-like location, `$` is the root
    pub path: String,
    pub kind: DifferenceKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DifferenceKind {
    Type { expected: &'static str, found: &'static str },
    Length { expected: usize, found: usize },
    MissingKey,
    ExtraKey,
    Value { expected: Value, found: Value },
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DifferenceKind::Type { expected, found } => {
                write!(f, "{}: expected {}, found {}", self.path, expected, found)
            }
            DifferenceKind::Length { expected, found } => {
                write!(f, "{}: expected {} elements, found {}", self.path, expected, found)
            }
            DifferenceKind::MissingKey => write!(f, "{}: missing", self.path),
            DifferenceKind::ExtraKey => write!(f, "{}: unexpected key", self.path),
            DifferenceKind::Value { expected, found } => {
                write!(f, "{}: expected {}, found {}", self.path, expected, found)
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Compare two documents field by field: type, array length and order,
/// null-equality and key-set equality. Object key order is not significant.
pub fn deep_compare(expected: &Value, found: &Value) -> Vec<Difference> {
    let mut differences = Vec::new();
    compare_at("$", expected, found, &mut differences);
    differences
}

fn compare_at(path: &str, expected: &Value, found: &Value, out: &mut Vec<Difference>) {
    match (expected, found) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, value) in a {
                let child = format!("{}.{}", path, key);
                match b.get(key) {
                    Some(other) => compare_at(&child, value, other, out),
                    None => out.push(Difference {
                        path: child,
                        kind: DifferenceKind::MissingKey,
                    }),
                }
            }
            for key in b.keys().filter(|k| !a.contains_key(*k)) {
                out.push(Difference {
                    path: format!("{}.{}", path, key),
                    kind: DifferenceKind::ExtraKey,
                });
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            if a.len() != b.len() {
                out.push(Difference {
                    path: path.to_string(),
                    kind: DifferenceKind::Length {
                        expected: a.len(),
                        found: b.len(),
                    },
                });
                return;
            }
            for (index, (x, y)) in a.iter().zip(b.iter()).enumerate() {
                compare_at(&format!("{}[{}]", path, index), x, y, out);
            }
        }
        (a, b) if std::mem::discriminant(a) != std::mem::discriminant(b) => {
            out.push(Difference {
                path: path.to_string(),
                kind: DifferenceKind::Type {
                    expected: type_name(a),
                    found: type_name(b),
                },
            });
        }
        (a, b) => {
            if a != b {
                out.push(Difference {
                    path: path.to_string(),
                    kind: DifferenceKind::Value {
                        expected: a.clone(),
                        found: b.clone(),
                    },
                });
            }
        }
    }
}

/// Result of a migration attempt
#[derive(Debug)]
pub enum MigrationOutcome {
    Migrated { modules: usize },
    RolledBack { reason: String },
}

/// Read every `<module>.json` in the modular directory back into one document
pub fn read_modules(paths: &Paths) -> Result<Map<String, Value>, StoreError> {
    let dir = paths.modules_dir();
    let mut document = Map::new();
    let entries = std::fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
    let mut files: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();

    for path in files {
        let Some(module) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let content = std::fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        let value: Value = serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        document.insert(module.to_string(), value);
    }
    Ok(document)
}

/// Migrate the legacy single-file document into per-module files.
///
/// `document` is the legacy document as currently held in memory.
pub fn migrate_legacy(paths: &Paths, document: &Map<String, Value>) -> MigrationOutcome {
    let legacy = paths.legacy_file();
    let pre_migration = paths.pre_migration_backup();

    if let Err(e) = std::fs::create_dir_all(paths.backup_dir())
        .and_then(|_| std::fs::copy(&legacy, &pre_migration).map(|_| ()))
    {
        // Without a pre-migration copy there is nothing to roll back to.
        warn!(path = %pre_migration.display(), error = %e, code = ?e.raw_os_error(), "Cannot back up legacy config, staying in single-file mode");
        return MigrationOutcome::RolledBack {
            reason: format!("pre-migration backup failed: {}", e),
        };
    }

    let verified = write_modules(paths, document).and_then(|_| {
        let rebuilt = read_modules(paths)?;
        let differences =
            deep_compare(&Value::Object(document.clone()), &Value::Object(rebuilt));
        if differences.is_empty() {
            Ok(())
        } else {
            for difference in differences.iter().take(20) {
                warn!(%difference, "Migration verification mismatch");
            }
            Err(StoreError::MigrationMismatch(differences.len()))
        }
    });

    match verified {
        Ok(()) => {
            let migrated = paths.backup_dir().join("config.json.migrated");
            if let Err(e) = std::fs::rename(&legacy, &migrated) {
                warn!(path = %legacy.display(), error = %e, "Failed to move legacy config aside after migration");
            }
            info!(modules = document.len(), "Legacy config migrated to modular layout");
            MigrationOutcome::Migrated {
                modules: document.len(),
            }
        }
        Err(e) => {
            error!(error = %e, "Migration failed, rolling back to single-file mode");
            rollback(paths);
            MigrationOutcome::RolledBack {
                reason: e.to_string(),
            }
        }
    }
}

fn write_modules(paths: &Paths, document: &Map<String, Value>) -> Result<(), StoreError> {
    let dir = paths.modules_dir();
    std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
    for (module, value) in document {
        atomic::write_json(&paths.module_file(module), None, value)?;
    }
    Ok(())
}

fn rollback(paths: &Paths) {
    let dir = paths.modules_dir();
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            error!(path = %dir.display(), error = %e, "Failed to remove partial modular directory");
        }
    }
    let pre_migration = paths.pre_migration_backup();
    if let Err(e) = std::fs::copy(&pre_migration, paths.legacy_file()) {
        error!(path = %pre_migration.display(), error = %e, "Failed to restore legacy config from pre-migration backup");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_documents_have_no_differences() {
        let doc = json!({"a": [1, {"b": null}], "c": {"d": "x"}});
        assert!(deep_compare(&doc, &doc.clone()).is_empty());
    }

    #[test]
    fn test_key_order_is_not_significant() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert!(deep_compare(&a, &b).is_empty());
    }

    #[test]
    fn test_detects_each_kind_of_difference() {
        let expected = json!({"list": [1, 2], "order": [1, 2], "n": null, "gone": 1, "s": "a"});
        let found = json!({"list": [1], "order": [2, 1], "n": 0, "new": 1, "s": "b"});

        let diffs = deep_compare(&expected, &found);
        let paths: Vec<&str> = diffs.iter().map(|d| d.path.as_str()).collect();

        assert!(diffs.iter().any(|d| d.path == "$.list"
            && d.kind == DifferenceKind::Length { expected: 2, found: 1 }));
        assert!(paths.contains(&"$.order[0]"));
        assert!(paths.contains(&"$.order[1]"));
        assert!(diffs.iter().any(|d| d.path == "$.n"
            && d.kind == DifferenceKind::Type { expected: "null", found: "number" }));
        assert!(diffs.iter().any(|d| d.path == "$.gone" && d.kind == DifferenceKind::MissingKey));
        assert!(diffs.iter().any(|d| d.path == "$.new" && d.kind == DifferenceKind::ExtraKey));
        assert!(paths.contains(&"$.s"));
    }

    fn legacy_fixture(paths: &Paths) -> Map<String, Value> {
        let doc = json!({
            "server": {"pid": 10, "started": 1, "watchdog": null, "os": "linux", "arch": "x86_64"},
            "websites": {"example.com": {"domain": "example.com", "path": "/srv/example.com", "port": 60000, "subdomain": ["www"]}},
            "services": [{"id": 0, "name": "worker", "file": "/srv/worker.js", "active": true}],
            "mail": {"accounts": {}}
        });
        std::fs::create_dir_all(paths.base()).unwrap();
        std::fs::write(paths.legacy_file(), serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
        doc.as_object().unwrap().clone()
    }

    #[test]
    fn test_migration_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let document = legacy_fixture(&paths);

        let outcome = migrate_legacy(&paths, &document);
        assert!(matches!(outcome, MigrationOutcome::Migrated { modules: 4 }));
        assert!(!paths.legacy_file().exists());
        assert!(paths.module_file("mail").exists());

        let rebuilt = read_modules(&paths).unwrap();
        assert!(deep_compare(&Value::Object(document), &Value::Object(rebuilt)).is_empty());
    }

    #[test]
    fn test_migration_rolls_back_when_a_module_cannot_be_written() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let mut document = legacy_fixture(&paths);
        // A module name that cannot become a file inside the modular directory
        document.insert("nested/name".to_string(), json!({"k": 1}));
        let legacy_before = std::fs::read(paths.legacy_file()).unwrap();

        let outcome = migrate_legacy(&paths, &document);
        assert!(matches!(outcome, MigrationOutcome::RolledBack { .. }));
        assert!(!paths.modules_dir().exists());
        assert_eq!(std::fs::read(paths.legacy_file()).unwrap(), legacy_before);
    }
}
