//! Files persisted under the state directory.
//!
//! ```text
//! <state_dir>/
//!   last-backup.json   reference to the latest verified backup
//!   runs/<id>.json     archived runs
//!   events.jsonl       phase events
//!   resources.jsonl    resource samples (with --monitor)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::run::UpgradeRun;
use crate::types::BackupRecord;

const LAST_BACKUP_FILE: &str = "last-backup.json";
const RUNS_DIR: &str = "runs";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const RESOURCES_FILE: &str = "resources.jsonl";

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    pub fn resources_path(&self) -> PathBuf {
        self.dir.join(RESOURCES_FILE)
    }

    pub fn run_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(RUNS_DIR).join(format!("{id}.json"))
    }

    pub fn save_backup_reference(&self, record: &BackupRecord) -> Result<PathBuf> {
        let path = self.dir.join(LAST_BACKUP_FILE);
        write_json(&path, record)?;
        debug!(path = %path.display(), backup = %record.id, "Saved backup reference");
        Ok(path)
    }

    pub fn load_backup_reference(&self) -> Result<Option<BackupRecord>> {
        let path = self.dir.join(LAST_BACKUP_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let record = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(record))
    }

    pub fn archive_run(&self, run: &UpgradeRun) -> Result<PathBuf> {
        let path = self.run_path(run.id);
        write_json(&path, run)?;
        debug!(path = %path.display(), "Archived run");
        Ok(path)
    }
}

/// Write pretty JSON through a temporary file and rename it into place.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}
