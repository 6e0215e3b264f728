//! Phase transition events and the sinks that record them.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Named phase transitions emitted by the upgrade components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    RunStarted,
    ServicesPaused,
    BackupCreated,
    BackupVerified,
    StepStopping,
    StepLaunching,
    StepWaitingReady,
    StepVerifyingVersion,
    StepDone,
    StepFailed,
    CompatibilitySet,
    CompatibilitySkipped,
    HealthChecked,
    RollbackStarted,
    RollbackRestored,
    RollbackRelaunched,
    RollbackCompleted,
    RollbackFailed,
    ServicesResumed,
    RunFinished,
}

impl Phase {
    pub const fn label(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::ServicesPaused => "services_paused",
            Self::BackupCreated => "backup_created",
            Self::BackupVerified => "backup_verified",
            Self::StepStopping => "step_stopping",
            Self::StepLaunching => "step_launching",
            Self::StepWaitingReady => "step_waiting_ready",
            Self::StepVerifyingVersion => "step_verifying_version",
            Self::StepDone => "step_done",
            Self::StepFailed => "step_failed",
            Self::CompatibilitySet => "compatibility_set",
            Self::CompatibilitySkipped => "compatibility_skipped",
            Self::HealthChecked => "health_checked",
            Self::RollbackStarted => "rollback_started",
            Self::RollbackRestored => "rollback_restored",
            Self::RollbackRelaunched => "rollback_relaunched",
            Self::RollbackCompleted => "rollback_completed",
            Self::RollbackFailed => "rollback_failed",
            Self::ServicesResumed => "services_resumed",
            Self::RunFinished => "run_finished",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One recorded phase transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PhaseEvent {
    pub fn new(phase: Phase) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: None,
            phase,
            step: None,
            version: None,
            detail: None,
        }
    }

    pub const fn step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }

    pub fn version(mut self, version: impl ToString) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Append-only destination for phase events.
///
/// Sinks must never fail the caller; write problems are logged and dropped.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PhaseEvent);
}

/// Sink handle bound to a run, shared by every component of that run.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    run_id: Option<Uuid>,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink, run_id: None }
    }

    /// Emitter stamping every event with `run_id`.
    pub fn for_run(&self, run_id: Uuid) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            run_id: Some(run_id),
        }
    }

    pub fn emit(&self, mut event: PhaseEvent) {
        if event.run_id.is_none() {
            event.run_id = self.run_id;
        }
        self.sink.emit(&event);
    }
}

/// JSON-lines file sink.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open event log {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: &PhaseEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize event {}: {}", event.phase, e);
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(file, "{line}") {
            warn!("Failed to append to {}: {}", self.path.display(), e);
        }
    }
}

/// Sink forwarding events to the tracing log.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &PhaseEvent) {
        debug!(
            phase = %event.phase,
            step = event.step,
            version = event.version.as_deref(),
            detail = event.detail.as_deref(),
            "phase transition"
        );
    }
}

/// Sink broadcasting to several sinks in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &PhaseEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// In-memory sink for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<PhaseEvent>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn events(&self) -> Vec<PhaseEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.events().iter().map(|e| e.phase).collect()
    }
}

#[cfg(test)]
impl EventSink for MemorySink {
    fn emit(&self, event: &PhaseEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
