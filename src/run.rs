//! Upgrade run state: the ordered path and its guarded lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::UpgradeError;
use crate::version::{CompatMarker, Version};

/// One hop of the upgrade path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionStep {
    /// 1-based position in the path.
    pub position: usize,
    pub version: Version,
    /// Marker to set after the hop. `None` leaves the marker untouched.
    pub compatibility: Option<CompatMarker>,
}

impl VersionStep {
    pub const fn new(position: usize, version: Version, compatibility: Option<CompatMarker>) -> Self {
        Self {
            position,
            version,
            compatibility,
        }
    }
}

/// Build steps for a plain list of versions, declaring each hop's own
/// release series as its compatibility marker.
pub fn steps_from_versions(versions: Vec<Version>) -> Vec<VersionStep> {
    versions
        .into_iter()
        .enumerate()
        .map(|(i, version)| {
            let marker = version.marker();
            VersionStep::new(i + 1, version, Some(marker))
        })
        .collect()
}

/// Check that a path is well formed.
///
/// Positions must be consecutive from 1, versions strictly increasing and
/// above the baseline, and no marker may be set above the binary's own
/// release series.
pub fn validate_path(baseline: Option<&Version>, steps: &[VersionStep]) -> Result<(), UpgradeError> {
    let mut previous = baseline;
    for (i, step) in steps.iter().enumerate() {
        if step.position != i + 1 {
            return Err(UpgradeError::Configuration(format!(
                "step {} is declared at position {}",
                i + 1,
                step.position
            )));
        }
        if let Some(prev) = previous {
            if step.version <= *prev {
                return Err(UpgradeError::Configuration(format!(
                    "upgrade path is not strictly increasing: {} follows {}",
                    step.version, prev
                )));
            }
        }
        if let Some(marker) = step.compatibility {
            if marker > step.version.marker() {
                return Err(UpgradeError::Configuration(format!(
                    "step {} declares marker {} above its version {}",
                    step.position, marker, step.version
                )));
            }
        }
        previous = Some(&step.version);
    }
    Ok(())
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl RunStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::RolledBack)
    }

    /// Process exit code for a terminal status.
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::RolledBack => 2,
            Self::Pending | Self::Running | Self::Failed => 1,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::RolledBack => write!(f, "RolledBack"),
        }
    }
}

/// Rejected run state transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("run is already terminal ({0})")]
    Terminal(RunStatus),

    #[error("run is {0}, expected Running")]
    NotRunning(RunStatus),

    #[error("all {0} steps are already completed")]
    PathExhausted(usize),

    #[error("{0} is not a terminal status")]
    NotTerminal(RunStatus),
}

/// One orchestrated upgrade run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeRun {
    pub id: Uuid,
    pub instance: String,
    pub baseline: Version,
    pub steps: Vec<VersionStep>,
    current_step_index: usize,
    status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl UpgradeRun {
    pub fn new(instance: impl Into<String>, baseline: Version, steps: Vec<VersionStep>) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance: instance.into(),
            baseline,
            steps,
            current_step_index: 0,
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            message: None,
        }
    }

    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Number of steps fully completed (verified, marker applied, healthy).
    pub const fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The step to execute next, if any remain.
    pub fn next_step(&self) -> Option<&VersionStep> {
        self.steps.get(self.current_step_index)
    }

    /// Version of the last completed step, or the baseline.
    pub fn last_completed_version(&self) -> &Version {
        self.current_step_index
            .checked_sub(1)
            .and_then(|i| self.steps.get(i))
            .map_or(&self.baseline, |s| &s.version)
    }

    /// Move from Pending to Running.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        match self.status {
            RunStatus::Pending => {
                self.status = RunStatus::Running;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            s if s.is_terminal() => Err(TransitionError::Terminal(s)),
            s => Err(TransitionError::NotRunning(s)),
        }
    }

    /// Record the completion of the next step.
    pub fn advance(&mut self) -> Result<usize, TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }
        if self.status != RunStatus::Running {
            return Err(TransitionError::NotRunning(self.status));
        }
        if self.current_step_index >= self.steps.len() {
            return Err(TransitionError::PathExhausted(self.steps.len()));
        }
        self.current_step_index += 1;
        Ok(self.current_step_index)
    }

    /// Seal the run with a terminal status. A terminal run is immutable.
    pub fn finish(&mut self, status: RunStatus, message: Option<String>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }
        if !status.is_terminal() {
            return Err(TransitionError::NotTerminal(status));
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.message = message;
        Ok(())
    }
}
