//! Custom error types for mup.

use thiserror::Error;

/// Errors that terminate or redirect an upgrade run.
///
/// The variant decides what the orchestrator does next: configuration,
/// prerequisite and backup errors abort before anything is mutated, while
/// errors raised inside a step hand the run over to rollback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpgradeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Prerequisite not met: {0}")]
    Prerequisite(String),

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("Instance for {version} failed to launch: {details}")]
    StepLaunch { version: String, details: String },

    #[error("Version mismatch: expected {expected}, instance reports {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("Compatibility marker {marker} could not be applied: {details}")]
    Compatibility { marker: String, details: String },

    #[error("Health check failed at {version}: {details}")]
    HealthCheck { version: String, details: String },

    #[error("Run aborted by operator after {completed_steps} completed step(s)")]
    Aborted { completed_steps: usize },

    #[error("Rollback failed: {0}")]
    Rollback(String),
}

impl UpgradeError {
    /// Create a step launch error for the given target version.
    pub fn launch(version: impl ToString, details: impl Into<String>) -> Self {
        Self::StepLaunch {
            version: version.to_string(),
            details: details.into(),
        }
    }

    /// Create a health check error for the given target version.
    pub fn health(version: impl ToString, details: impl Into<String>) -> Self {
        Self::HealthCheck {
            version: version.to_string(),
            details: details.into(),
        }
    }

    /// Create a compatibility error for the given marker.
    pub fn compatibility(marker: impl ToString, details: impl Into<String>) -> Self {
        Self::Compatibility {
            marker: marker.to_string(),
            details: details.into(),
        }
    }

    /// Returns true if the instance may already have been mutated when this
    /// error was raised, so the run must be compensated by a rollback. An
    /// abort before the first step leaves the instance untouched.
    pub const fn triggers_rollback(&self) -> bool {
        match self {
            Self::StepLaunch { .. }
            | Self::VersionMismatch { .. }
            | Self::Compatibility { .. }
            | Self::HealthCheck { .. } => true,
            Self::Aborted { completed_steps } => *completed_steps > 0,
            _ => false,
        }
    }

    /// Short kind label used in events and reports.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::Prerequisite(_) => "PrerequisiteError",
            Self::Backup(_) => "BackupError",
            Self::StepLaunch { .. } => "StepLaunchError",
            Self::VersionMismatch { .. } => "VersionMismatchError",
            Self::Compatibility { .. } => "CompatibilityError",
            Self::HealthCheck { .. } => "HealthCheckError",
            Self::Aborted { .. } => "Aborted",
            Self::Rollback(_) => "RollbackError",
        }
    }
}
