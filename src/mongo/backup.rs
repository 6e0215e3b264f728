//! [`BackupStore`] built on mongodump and mongorestore.
//!
//! A backup is a `mongodump` directory on the host plus a manifest file
//! (`mup-backup.json`) that acts as the integrity marker. Restores run in a
//! one-shot container of the baseline image that owns the data volume.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::shell::MongoShell;
use crate::capability::{BackupStore, ContainerRuntime};
use crate::instance::{InstanceHandle, Mount};
use crate::types::{BackupRecord, RestoreTarget, TaskSpec};
use crate::version::Version;

pub const MANIFEST_FILE: &str = "mup-backup.json";

/// Scratch directory inside the instance container.
const STAGING_DIR: &str = "/tmp/mup-backup";

/// Where the backup is mounted inside the restore task.
const RESTORE_MOUNT: &str = "/restore";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub id: String,
    pub instance: String,
    pub baseline: Version,
    pub created_at: DateTime<Utc>,
}

pub struct MongoBackup {
    shell: Arc<MongoShell>,
    host_dir: PathBuf,
}

impl MongoBackup {
    pub fn new(shell: Arc<MongoShell>, host_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell,
            host_dir: host_dir.into(),
        }
    }

    fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        self.shell.runtime()
    }
}

pub fn backup_id(instance: &str, at: DateTime<Utc>) -> String {
    format!("{instance}-{}", at.format("%Y%m%dT%H%M%SZ"))
}

/// Shell script run by the restore task.
pub fn restore_script(data_dir: &str) -> String {
    format!(
        "set -e\n\
         find {data_dir} -mindepth 1 -delete\n\
         mongod --dbpath {data_dir} --bind_ip 127.0.0.1 --fork --logpath /tmp/mup-restore.log\n\
         mongorestore --quiet --drop {RESTORE_MOUNT}\n\
         mongod --dbpath {data_dir} --shutdown\n"
    )
}

/// Read the manifest and match it against the record.
pub fn check_manifest(record: &BackupRecord) -> Result<bool> {
    let path = record.path.join(MANIFEST_FILE);
    if !path.exists() {
        debug!(path = %path.display(), "Backup manifest missing");
        return Ok(false);
    }
    let content =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let manifest: BackupManifest = match serde_json::from_str(&content) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(path = %path.display(), "Backup manifest is unreadable: {}", e);
            return Ok(false);
        }
    };
    Ok(manifest.id == record.id && manifest.baseline == record.baseline && has_dump(&record.path)?)
}

/// True if the directory holds anything besides the manifest.
fn has_dump(dir: &Path) -> Result<bool> {
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        if entry?.file_name() != MANIFEST_FILE {
            return Ok(true);
        }
    }
    Ok(false)
}

#[async_trait]
impl BackupStore for MongoBackup {
    async fn create_backup(&self, handle: &InstanceHandle, baseline: &Version) -> Result<BackupRecord> {
        let created_at = Utc::now();
        let id = backup_id(&handle.name, created_at);
        let staging = format!("{STAGING_DIR}/{id}");

        let mut dump = vec!["mongodump".to_string(), "--quiet".to_string()];
        dump.extend(self.shell.auth_args(handle));
        dump.push(format!("--out={staging}"));
        self.runtime()
            .exec(handle, &dump)
            .await?
            .into_stdout("mongodump")?;

        fs::create_dir_all(&self.host_dir)
            .with_context(|| format!("Failed to create {}", self.host_dir.display()))?;
        let path = self.host_dir.join(&id);
        self.runtime().copy_out(handle, &staging, &path).await?;
        if !path.is_dir() {
            bail!("dump was not copied to {}", path.display());
        }

        let cleanup = vec!["rm".to_string(), "-rf".to_string(), staging];
        if let Err(e) = self.runtime().exec(handle, &cleanup).await {
            warn!("Failed to clean up staging dump: {}", e);
        }

        let manifest = BackupManifest {
            id: id.clone(),
            instance: handle.name.clone(),
            baseline: baseline.clone(),
            created_at,
        };
        let manifest_path = path.join(MANIFEST_FILE);
        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
            .with_context(|| format!("Failed to write {}", manifest_path.display()))?;

        Ok(BackupRecord {
            id,
            path,
            created_at,
            verified: false,
            baseline: baseline.clone(),
        })
    }

    async fn verify(&self, record: &BackupRecord) -> Result<bool> {
        check_manifest(record)
    }

    async fn restore(&self, record: &BackupRecord, target: &RestoreTarget) -> Result<()> {
        let mut mounts = vec![Mount {
            source: record.path.display().to_string(),
            target: RESTORE_MOUNT.to_string(),
        }];
        mounts.extend(target.mounts.iter().filter(|m| m.target != RESTORE_MOUNT).cloned());

        let task = TaskSpec {
            image: target.image.clone(),
            volume: target.volume.clone(),
            mounts,
            command: vec![
                "bash".to_string(),
                "-c".to_string(),
                restore_script(&target.volume.target),
            ],
        };
        self.runtime()
            .run_task(&task)
            .await?
            .into_stdout("restore task")
            .map(|_| ())
    }
}
