//! Crash-safe file replacement
//!
//! Every persisted document is written to a temp file in the target's own
//! directory, the current target is copied aside as a backup, and the temp
//! file is renamed over the target. Readers only ever observe the old file or
//! the complete new one.

use crate::error::StoreError;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// New contents fully written next to their target, not yet visible
pub struct StagedWrite {
    tmp: NamedTempFile,
    target: PathBuf,
}

impl StagedWrite {
    /// Copy the current target to `backup` (if both exist) and atomically
    /// replace the target with the staged contents.
    pub fn commit(self, backup: Option<&Path>) -> Result<(), StoreError> {
        if let Some(backup) = backup {
            if self.target.exists() {
                if let Some(parent) = backup.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
                }
                std::fs::copy(&self.target, backup).map_err(|e| StoreError::io(backup, e))?;
            }
        }

        let target = self.target;
        self.tmp
            .persist(&target)
            .map_err(|e| StoreError::io(&target, e.error))?;
        debug!(path = %target.display(), "File replaced atomically");
        Ok(())
    }
}

/// Write `contents` to a temp file in the target's directory and flush it to disk
pub fn stage(target: &Path, contents: &[u8]) -> Result<StagedWrite, StoreError> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(contents).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;

    Ok(StagedWrite {
        tmp,
        target: target.to_path_buf(),
    })
}

/// Stage and commit in one step
pub fn write_atomic(target: &Path, backup: Option<&Path>, contents: &[u8]) -> Result<(), StoreError> {
    stage(target, contents)?.commit(backup)
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn write_json(
    target: &Path,
    backup: Option<&Path>,
    value: &serde_json::Value,
) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(value)?;
    write_atomic(target, backup, &data)
}
