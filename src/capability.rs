//! Capabilities the upgrade core consumes.
//!
//! The orchestration code only talks to the outside world through these
//! traits. Production adapters live in [`crate::docker`] and [`crate::mongo`];
//! tests plug in an in-memory fake.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::instance::{InstanceDescriptor, InstanceHandle, LaunchSpec};
use crate::types::{BackupRecord, ExecOutput, HealthReport, InstanceStats, RestoreTarget, TaskSpec};
use crate::version::{CompatMarker, Version};

/// Container runtime hosting the managed instance.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Describe a container by name. `None` if it does not exist.
    async fn inspect(&self, name: &str) -> Result<Option<InstanceDescriptor>>;

    /// Create and start a container.
    async fn create(&self, spec: &LaunchSpec) -> Result<InstanceHandle>;

    /// Stop a container. Stopping an absent or stopped container succeeds.
    async fn stop(&self, handle: &InstanceHandle) -> Result<()>;

    /// Remove a container. Removing an absent container succeeds.
    async fn remove(&self, handle: &InstanceHandle) -> Result<()>;

    async fn is_running(&self, handle: &InstanceHandle) -> Result<bool>;

    async fn exec(&self, handle: &InstanceHandle, command: &[String]) -> Result<ExecOutput>;

    /// Last `tail` lines of the container log.
    async fn logs(&self, handle: &InstanceHandle, tail: usize) -> Result<String>;

    /// Run a one-shot container to completion and remove it.
    async fn run_task(&self, task: &TaskSpec) -> Result<ExecOutput>;

    /// Copy a path out of a container onto the host.
    async fn copy_out(&self, handle: &InstanceHandle, source: &str, dest: &Path) -> Result<()>;

    /// Resource usage of a running container, if the runtime reports it.
    async fn stats(&self, handle: &InstanceHandle) -> Result<Option<InstanceStats>>;
}

/// Administrative interface of the managed service.
#[async_trait]
pub trait AdminInterface: Send + Sync {
    async fn get_version(&self, handle: &InstanceHandle) -> Result<String>;

    async fn set_compatibility(
        &self,
        handle: &InstanceHandle,
        marker: CompatMarker,
        confirm: bool,
    ) -> Result<()>;

    async fn get_compatibility(&self, handle: &InstanceHandle) -> Result<CompatMarker>;

    async fn run_diagnostic(&self, handle: &InstanceHandle) -> Result<HealthReport>;

    /// Round-trip a no-op command and return its latency.
    async fn ping(&self, handle: &InstanceHandle) -> Result<Duration>;
}

/// Backup creation, verification and restore.
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn create_backup(&self, handle: &InstanceHandle, baseline: &Version) -> Result<BackupRecord>;

    /// Check the integrity marker of a backup. `Ok(false)` means the backup
    /// is corrupted or incomplete.
    async fn verify(&self, record: &BackupRecord) -> Result<bool>;

    /// Replace the contents of the target volume with the backup.
    async fn restore(&self, record: &BackupRecord, target: &RestoreTarget) -> Result<()>;
}

/// External services coupled to the managed instance.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Names of all currently running services.
    async fn list(&self) -> Result<Vec<String>>;

    async fn pause(&self, name: &str) -> Result<()>;

    async fn resume(&self, name: &str) -> Result<()>;
}
