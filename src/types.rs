//! Shared value types exchanged with the capability adapters.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::{Mount, VolumeBinding};
use crate::version::Version;

/// Output of a command run inside (or as) a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout on success, an error carrying stderr otherwise.
    pub fn into_stdout(self, context: &str) -> Result<String> {
        if !self.success() {
            bail!(
                "{} exited with code {}: {}",
                context,
                self.exit_code,
                self.stderr.trim()
            );
        }
        Ok(self.stdout)
    }
}

/// One-shot container used for maintenance tasks such as restores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub image: String,
    pub volume: VolumeBinding,
    pub mounts: Vec<Mount>,
    pub command: Vec<String>,
}

/// Point-in-time resource usage of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub cpu_percent: f64,
    pub mem_percent: f64,
}

/// The backup a run can always roll back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    /// Backup location on the host.
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub verified: bool,
    pub baseline: Version,
}

/// Where a restore writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTarget {
    pub volume: VolumeBinding,
    /// Image of the baseline version whose tools perform the restore.
    pub image: String,
    pub mounts: Vec<Mount>,
}

/// Collection and document totals for one database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub collections: u64,
    pub documents: u64,
}

/// Result of the post-step diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub ok: bool,
    pub version: String,
    pub uptime_seconds: u64,
    pub databases: BTreeMap<String, DatabaseStats>,
    pub diagnostic: String,
}

impl HealthReport {
    pub fn total_collections(&self) -> u64 {
        self.databases.values().map(|d| d.collections).sum()
    }

    pub fn total_documents(&self) -> u64 {
        self.databases.values().map(|d| d.documents).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_output_into_stdout() {
        let ok = ExecOutput {
            exit_code: 0,
            stdout: "4.2.24\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(ok.into_stdout("db.version()").unwrap(), "4.2.24\n");

        let failed = ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "connection refused\n".to_string(),
        };
        let err = failed.into_stdout("db.version()").unwrap_err();
        assert_eq!(
            err.to_string(),
            "db.version() exited with code 1: connection refused"
        );
    }

    #[test]
    fn test_health_report_totals() {
        let mut databases = BTreeMap::new();
        databases.insert(
            "shop".to_string(),
            DatabaseStats {
                collections: 3,
                documents: 120,
            },
        );
        databases.insert(
            "audit".to_string(),
            DatabaseStats {
                collections: 1,
                documents: 5,
            },
        );
        let report = HealthReport {
            ok: true,
            version: "5.0.31".to_string(),
            uptime_seconds: 12,
            databases,
            diagnostic: String::new(),
        };
        assert_eq!(report.total_collections(), 4);
        assert_eq!(report.total_documents(), 125);
    }
}
