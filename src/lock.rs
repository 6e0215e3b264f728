//! One run per instance at a time.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::UpgradeError;

/// Exclusive lock file `<state_dir>/<instance>.lock`, released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(state_dir: &Path, instance: &str, run_id: Uuid) -> Result<Self, UpgradeError> {
        fs::create_dir_all(state_dir).map_err(|e| {
            UpgradeError::Prerequisite(format!(
                "cannot create state directory {}: {e}",
                state_dir.display()
            ))
        })?;

        let path = state_dir.join(format!("{instance}.lock"));
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                return Err(UpgradeError::Prerequisite(format!(
                    "another run holds {} ({}); remove the file if that run is gone",
                    path.display(),
                    holder.trim()
                )));
            }
            Err(e) => {
                return Err(UpgradeError::Prerequisite(format!(
                    "cannot create lock {}: {e}",
                    path.display()
                )));
            }
        };

        if let Err(e) = writeln!(file, "run={run_id} pid={}", std::process::id()) {
            warn!("Failed to write lock holder to {}: {}", path.display(), e);
        }
        debug!(lock = %path.display(), "Run lock acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release run lock {}: {}", self.path.display(), e);
        }
    }
}
