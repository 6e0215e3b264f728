//! In-memory stand-in for every capability, used by the unit tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;

use crate::capability::{AdminInterface, BackupStore, ContainerRuntime, ServiceRegistry};
use crate::instance::{InstanceDescriptor, InstanceHandle, LaunchSpec, fixtures};
use crate::types::{
    BackupRecord, DatabaseStats, ExecOutput, HealthReport, InstanceStats, RestoreTarget, TaskSpec,
};
use crate::version::{CompatMarker, Version};

/// A container known to the fake runtime.
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub handle: InstanceHandle,
    pub running: bool,
    pub polls: u32,
}

impl FakeContainer {
    fn version(&self) -> String {
        tag_of(&self.handle.image)
    }
}

/// Mutable world of the fake, plus failure knobs set by tests.
#[derive(Debug)]
pub struct FakeState {
    pub container: Option<FakeContainer>,
    pub compat: CompatMarker,
    /// Version whose data currently sits on the volume.
    pub volume_version: String,
    pub services: BTreeMap<String, bool>,
    pub backups: u32,
    /// Mutating operations, in order.
    pub ops: Vec<String>,

    /// `is_running` polls before a new container reports running.
    pub ready_after: u32,
    /// Versions whose containers never become ready.
    pub never_ready: Vec<String>,
    /// Versions whose diagnostic faults.
    pub unhealthy: Vec<String>,
    /// Versions reporting something else than their image tag.
    pub misreport: BTreeMap<String, String>,
    pub compat_write_ignored: bool,
    pub backup_create_fails: bool,
    pub backup_corrupt: bool,
    pub restore_fails: bool,
    pub pause_fails: bool,
}

/// Fake runtime, admin interface, backup store and service registry sharing
/// one world, so cross-capability effects stay consistent.
pub struct FakeService {
    state: Mutex<FakeState>,
    next_id: Mutex<u32>,
}

fn tag_of(image: &str) -> String {
    image.rsplit(':').next().unwrap_or_default().to_string()
}

impl FakeService {
    /// A running `mongodb` container at `version` with two app services.
    pub fn new(version: &str) -> Arc<Self> {
        let descriptor = fixtures::descriptor(&format!("mongo:{version}"));
        let parsed: Version = version.parse().unwrap_or(Version::new(0, 0, 0));
        let mut services = BTreeMap::new();
        services.insert("app-api".to_string(), true);
        services.insert("app-worker".to_string(), true);
        services.insert("grafana".to_string(), true);

        Arc::new(Self {
            state: Mutex::new(FakeState {
                container: Some(FakeContainer {
                    handle: descriptor.handle(),
                    running: true,
                    polls: 0,
                }),
                compat: parsed.marker(),
                volume_version: version.to_string(),
                services,
                backups: 0,
                ops: Vec::new(),
                ready_after: 0,
                never_ready: Vec::new(),
                unhealthy: Vec::new(),
                misreport: BTreeMap::new(),
                compat_write_ignored: false,
                backup_create_fails: false,
                backup_corrupt: false,
                restore_fails: false,
                pause_fails: false,
            }),
            next_id: Mutex::new(0),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ops(&self) -> Vec<String> {
        self.state().ops.clone()
    }

    /// Version reported by the live container, if any.
    pub fn live_version(&self) -> Option<String> {
        let state = self.state();
        state
            .container
            .as_ref()
            .filter(|c| c.running)
            .map(FakeContainer::version)
    }

    pub fn compat(&self) -> CompatMarker {
        self.state().compat
    }

    fn record(&self, op: impl Into<String>) {
        self.state().ops.push(op.into());
    }

    fn running_container(&self, handle: &InstanceHandle) -> Result<FakeContainer> {
        let state = self.state();
        state
            .container
            .as_ref()
            .filter(|c| c.handle.name == handle.name && c.running)
            .cloned()
            .ok_or_else(|| anyhow!("container {} is not running", handle.name))
    }
}

#[async_trait]
impl ContainerRuntime for FakeService {
    async fn inspect(&self, name: &str) -> Result<Option<InstanceDescriptor>> {
        let state = self.state();
        Ok(state
            .container
            .as_ref()
            .filter(|c| c.handle.name == name)
            .map(|c| InstanceDescriptor {
                id: c.handle.id.clone(),
                name: c.handle.name.clone(),
                image: c.handle.image.clone(),
                running: c.running,
                volume: c.handle.volume.clone(),
                network: c.handle.network.clone(),
                env: c.handle.env.clone(),
                args: c.handle.args.clone(),
                mounts: c.handle.mounts.clone(),
            }))
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<InstanceHandle> {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            format!("fake-{next}")
        };
        let mut state = self.state();
        if state.container.is_some() {
            bail!("Conflict. The container name \"/{}\" is already in use", spec.name);
        }
        let mut env = spec.env.clone();
        env.insert("MONGO_VERSION".to_string(), tag_of(&spec.image));
        let handle = InstanceHandle {
            id,
            name: spec.name.clone(),
            image: spec.image.clone(),
            volume: Some(spec.volume.clone()),
            network: Some(spec.network.clone()),
            env,
            args: spec.args.clone(),
            mounts: spec.mounts.clone(),
        };
        state.container = Some(FakeContainer {
            handle: handle.clone(),
            running: true,
            polls: 0,
        });
        state.volume_version = tag_of(&spec.image);
        state.ops.push(format!("create {}", spec.image));
        Ok(handle)
    }

    async fn stop(&self, handle: &InstanceHandle) -> Result<()> {
        let mut state = self.state();
        if let Some(container) = state.container.as_mut() {
            container.running = false;
        }
        state.ops.push(format!("stop {}", handle.name));
        Ok(())
    }

    async fn remove(&self, handle: &InstanceHandle) -> Result<()> {
        let mut state = self.state();
        state.container = None;
        state.ops.push(format!("remove {}", handle.name));
        Ok(())
    }

    async fn is_running(&self, handle: &InstanceHandle) -> Result<bool> {
        let mut state = self.state();
        let ready_after = state.ready_after;
        let never_ready = state.never_ready.clone();
        let Some(container) = state
            .container
            .as_mut()
            .filter(|c| c.handle.name == handle.name)
        else {
            return Ok(false);
        };
        container.polls += 1;
        if never_ready.contains(&container.version()) {
            return Ok(false);
        }
        Ok(container.running && container.polls > ready_after)
    }

    async fn exec(&self, handle: &InstanceHandle, command: &[String]) -> Result<ExecOutput> {
        self.running_container(handle)?;
        self.record(format!("exec {}", command.join(" ")));
        Ok(ExecOutput::default())
    }

    async fn logs(&self, _handle: &InstanceHandle, tail: usize) -> Result<String> {
        Ok(format!("last {tail} lines: waiting for connections"))
    }

    async fn run_task(&self, task: &TaskSpec) -> Result<ExecOutput> {
        self.record(format!("task {}", task.image));
        Ok(ExecOutput::default())
    }

    async fn copy_out(&self, _handle: &InstanceHandle, source: &str, dest: &Path) -> Result<()> {
        self.record(format!("copy {source} {}", dest.display()));
        Ok(())
    }

    async fn stats(&self, handle: &InstanceHandle) -> Result<Option<InstanceStats>> {
        Ok(self.running_container(handle).ok().map(|_| InstanceStats {
            cpu_percent: 12.5,
            mem_percent: 40.0,
        }))
    }
}

#[async_trait]
impl AdminInterface for FakeService {
    async fn get_version(&self, handle: &InstanceHandle) -> Result<String> {
        let container = self.running_container(handle)?;
        let version = container.version();
        let state = self.state();
        Ok(state.misreport.get(&version).cloned().unwrap_or(version))
    }

    async fn set_compatibility(
        &self,
        handle: &InstanceHandle,
        marker: CompatMarker,
        confirm: bool,
    ) -> Result<()> {
        let container = self.running_container(handle)?;
        let binary: Version = container.version().parse()?;
        if marker > binary.marker() {
            bail!("cannot set marker {marker} on a {binary} binary");
        }
        if marker.requires_confirm() && !confirm {
            bail!("setFeatureCompatibilityVersion requires confirm: true");
        }
        let mut state = self.state();
        state.ops.push(format!("set_compat {marker}"));
        if !state.compat_write_ignored {
            state.compat = marker;
        }
        Ok(())
    }

    async fn get_compatibility(&self, handle: &InstanceHandle) -> Result<CompatMarker> {
        self.running_container(handle)?;
        Ok(self.state().compat)
    }

    async fn run_diagnostic(&self, handle: &InstanceHandle) -> Result<HealthReport> {
        let container = self.running_container(handle)?;
        let version = container.version();
        if self.state().unhealthy.contains(&version) {
            bail!("serverStatus failed: node is recovering");
        }
        let mut databases = BTreeMap::new();
        databases.insert(
            "shop".to_string(),
            DatabaseStats {
                collections: 3,
                documents: 42,
            },
        );
        Ok(HealthReport {
            ok: true,
            version,
            uptime_seconds: 5,
            databases,
            diagnostic: "{}".to_string(),
        })
    }

    async fn ping(&self, handle: &InstanceHandle) -> Result<Duration> {
        self.running_container(handle)?;
        Ok(Duration::from_millis(2))
    }
}

#[async_trait]
impl BackupStore for FakeService {
    async fn create_backup(&self, handle: &InstanceHandle, baseline: &Version) -> Result<BackupRecord> {
        self.running_container(handle)?;
        let mut state = self.state();
        if state.backup_create_fails {
            bail!("mongodump exited with code 1");
        }
        state.backups += 1;
        let id = format!("backup-{}", state.backups);
        state.ops.push(format!("backup {id}"));
        Ok(BackupRecord {
            path: PathBuf::from("/srv/backups").join(&id),
            id,
            created_at: Utc::now(),
            verified: false,
            baseline: baseline.clone(),
        })
    }

    async fn verify(&self, _record: &BackupRecord) -> Result<bool> {
        Ok(!self.state().backup_corrupt)
    }

    async fn restore(&self, record: &BackupRecord, target: &RestoreTarget) -> Result<()> {
        let mut state = self.state();
        if state.restore_fails {
            bail!("mongorestore exited with code 1");
        }
        if state.container.as_ref().is_some_and(|c| c.running) {
            bail!("volume {} is still in use", target.volume.source);
        }
        state.volume_version = record.baseline.to_string();
        state.compat = record.baseline.marker();
        state.ops.push(format!("restore {} with {}", record.id, target.image));
        Ok(())
    }
}

#[async_trait]
impl ServiceRegistry for FakeService {
    async fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .state()
            .services
            .iter()
            .filter(|(_, running)| **running)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn pause(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.pause_fails {
            bail!("cannot stop {name}");
        }
        state.services.insert(name.to_string(), false);
        state.ops.push(format!("pause {name}"));
        Ok(())
    }

    async fn resume(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.services.insert(name.to_string(), true);
        state.ops.push(format!("resume {name}"));
        Ok(())
    }
}
