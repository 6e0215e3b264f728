//! Resource sampling at phase transitions.
//!
//! The monitor runs as its own task. It receives phase transitions through
//! an [`EventSink`] and appends one JSON sample per transition (and per tick,
//! when an interval is set) to `resources.jsonl`. It never blocks or fails
//! the run it observes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capability::ContainerRuntime;
use crate::events::{EventSink, Phase, PhaseEvent};

/// Label of samples taken on the periodic tick.
const PERIODIC: &str = "periodic";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub host_cpu_percent: f32,
    pub host_mem_percent: f64,
    /// Usage of the filesystem holding the backup directory.
    pub host_disk_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_mem_percent: Option<f64>,
}

/// Host-level usage read through sysinfo.
struct HostSampler {
    system: System,
    disk_path: PathBuf,
}

impl HostSampler {
    fn new(disk_path: PathBuf) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system, disk_path }
    }

    fn cpu_percent(&mut self) -> f32 {
        self.system.refresh_cpu_usage();
        self.system.global_cpu_usage()
    }

    fn mem_percent(&mut self) -> f64 {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return 0.0;
        }
        self.system.used_memory() as f64 / total as f64 * 100.0
    }

    fn disk_percent(&self) -> f64 {
        disk_usage_percent(&self.disk_path)
    }
}

/// Usage of the disk whose mount point is the longest prefix of `path`.
fn disk_usage_percent(path: &Path) -> f64 {
    let disks = Disks::new_with_refreshed_list();
    let best = disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len());

    match best {
        Some(disk) if disk.total_space() > 0 => {
            let used = disk.total_space().saturating_sub(disk.available_space());
            used as f64 / disk.total_space() as f64 * 100.0
        }
        _ => 0.0,
    }
}

/// Sink forwarding phase transitions to a running monitor.
pub struct MonitorSink {
    tx: mpsc::UnboundedSender<Phase>,
}

impl EventSink for MonitorSink {
    fn emit(&self, event: &PhaseEvent) {
        // Send only fails once the monitor has stopped.
        let _ = self.tx.send(event.phase);
    }
}

pub struct ResourceMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    instance: String,
    output: PathBuf,
    disk_path: PathBuf,
    interval: Option<Duration>,
}

/// A spawned monitor.
pub struct MonitorHandle {
    sink: Arc<MonitorSink>,
    cancel: CancellationToken,
    task: JoinHandle<usize>,
}

impl MonitorHandle {
    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone()
    }

    /// Stop sampling after draining queued transitions. Returns the number
    /// of samples written.
    pub async fn stop(self) -> Result<usize> {
        self.cancel.cancel();
        drop(self.sink);
        self.task.await.context("Resource monitor task panicked")
    }
}

impl ResourceMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        instance: impl Into<String>,
        output: impl Into<PathBuf>,
        disk_path: impl Into<PathBuf>,
        interval: Option<Duration>,
    ) -> Self {
        Self {
            runtime,
            instance: instance.into(),
            output: output.into(),
            disk_path: disk_path.into(),
            interval,
        }
    }

    pub fn spawn(self) -> Result<MonitorHandle> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output)
            .with_context(|| format!("Failed to open {}", self.output.display()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(rx, cancel.clone(), file));

        Ok(MonitorHandle {
            sink: Arc::new(MonitorSink { tx }),
            cancel,
            task,
        })
    }

    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<Phase>,
        cancel: CancellationToken,
        mut file: File,
    ) -> usize {
        let mut sampler = HostSampler::new(self.disk_path.clone());
        let mut ticker = self.interval.map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        let mut written = 0;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                phase = rx.recv() => match phase {
                    Some(phase) => written += self.record(&mut sampler, &mut file, phase.label()).await,
                    None => break,
                },
                () = next_tick(ticker.as_mut()) => {
                    written += self.record(&mut sampler, &mut file, PERIODIC).await;
                }
            }
        }

        while let Ok(phase) = rx.try_recv() {
            written += self.record(&mut sampler, &mut file, phase.label()).await;
        }
        debug!(samples = written, "Resource monitor stopped");
        written
    }

    /// Take and append one sample. Returns 1 if it was written.
    async fn record(&self, sampler: &mut HostSampler, file: &mut File, phase: &str) -> usize {
        let (instance_cpu_percent, instance_mem_percent) = match self.instance_stats().await {
            Some(stats) => (Some(stats.cpu_percent), Some(stats.mem_percent)),
            None => (None, None),
        };
        let sample = ResourceSample {
            timestamp: Utc::now(),
            phase: phase.to_string(),
            host_cpu_percent: sampler.cpu_percent(),
            host_mem_percent: sampler.mem_percent(),
            host_disk_percent: sampler.disk_percent(),
            instance_cpu_percent,
            instance_mem_percent,
        };

        let written = serde_json::to_string(&sample)
            .map_err(anyhow::Error::from)
            .and_then(|line| writeln!(file, "{line}").map_err(anyhow::Error::from));
        match written {
            Ok(()) => 1,
            Err(e) => {
                warn!("Failed to append resource sample to {}: {}", self.output.display(), e);
                0
            }
        }
    }

    async fn instance_stats(&self) -> Option<crate::types::InstanceStats> {
        let descriptor = self.runtime.inspect(&self.instance).await.ok().flatten()?;
        if !descriptor.running {
            return None;
        }
        self.runtime.stats(&descriptor.handle()).await.ok().flatten()
    }
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
