//! Moving the instance to exactly one new version.
//!
//! Each step replaces the container: stop and remove the current one, launch
//! the next version with the same identity, wait until it accepts admin
//! commands and check it reports the expected version.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, WaitError, deadline};
use crate::capability::{AdminInterface, ContainerRuntime};
use crate::error::UpgradeError;
use crate::events::{EventEmitter, Phase, PhaseEvent};
use crate::instance::{InstanceHandle, LaunchSpec};
use crate::run::VersionStep;
use crate::version::Version;

/// Log lines attached to a launch failure.
const LOG_TAIL_LINES: usize = 20;

/// Per-step state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Stopping,
    Launching,
    WaitingReady,
    VerifyingVersion,
    Done,
    Failed,
}

impl StepState {
    const fn phase(self) -> Phase {
        match self {
            Self::Stopping => Phase::StepStopping,
            Self::Launching => Phase::StepLaunching,
            Self::WaitingReady => Phase::StepWaitingReady,
            Self::VerifyingVersion => Phase::StepVerifyingVersion,
            Self::Done => Phase::StepDone,
            Self::Failed => Phase::StepFailed,
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopping => write!(f, "Stopping"),
            Self::Launching => write!(f, "Launching"),
            Self::WaitingReady => write!(f, "WaitingReady"),
            Self::VerifyingVersion => write!(f, "VerifyingVersion"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Knobs shared by step execution and rollback relaunch.
#[derive(Debug, Clone)]
pub struct StepSettings {
    /// Image repository, e.g. `mongo`.
    pub repository: String,
    pub readiness: Backoff,
    /// Bound on every single admin command.
    pub admin_timeout: Duration,
    /// Show a spinner while waiting for readiness.
    pub show_progress: bool,
}

pub struct StepExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    admin: Arc<dyn AdminInterface>,
    settings: StepSettings,
    events: EventEmitter,
}

impl StepExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        admin: Arc<dyn AdminInterface>,
        settings: StepSettings,
        events: EventEmitter,
    ) -> Self {
        Self {
            runtime,
            admin,
            settings,
            events,
        }
    }

    /// Run one step to completion and return the handle of the new instance.
    pub async fn execute(
        &self,
        current: &InstanceHandle,
        step: &VersionStep,
        template: &LaunchSpec,
    ) -> Result<InstanceHandle, UpgradeError> {
        let mut state = StepState::Stopping;
        match self.drive(&mut state, current, step, template).await {
            Ok(handle) => {
                self.enter(&mut state, StepState::Done, step);
                info!(step = step.position, version = %step.version, "Step complete");
                Ok(handle)
            }
            Err(e) => {
                warn!(step = step.position, version = %step.version, %state, "Step failed: {}", e);
                self.events.emit(
                    PhaseEvent::new(Phase::StepFailed)
                        .step(step.position)
                        .version(&step.version)
                        .detail(format!("{state}: {e}")),
                );
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        state: &mut StepState,
        current: &InstanceHandle,
        step: &VersionStep,
        template: &LaunchSpec,
    ) -> Result<InstanceHandle, UpgradeError> {
        let version = &step.version;

        self.enter(state, StepState::Stopping, step);
        self.stop_instance(current)
            .await
            .map_err(|e| UpgradeError::launch(version, e))?;

        self.enter(state, StepState::Launching, step);
        let spec = template.for_version(&self.settings.repository, version);
        let handle = self
            .launch(&spec)
            .await
            .map_err(|e| UpgradeError::launch(version, e))?;

        self.enter(state, StepState::WaitingReady, step);
        self.wait_ready(&handle)
            .await
            .map_err(|e| UpgradeError::launch(version, e))?;

        self.enter(state, StepState::VerifyingVersion, step);
        self.verify_version(&handle, version).await?;

        Ok(handle)
    }

    fn enter(&self, state: &mut StepState, next: StepState, step: &VersionStep) {
        debug!(step = step.position, from = %state, to = %next, "Step transition");
        *state = next;
        self.events.emit(
            PhaseEvent::new(next.phase())
                .step(step.position)
                .version(&step.version),
        );
    }

    /// Stop and remove the instance, then make sure nothing holds its name.
    pub async fn stop_instance(&self, handle: &InstanceHandle) -> Result<(), String> {
        self.runtime
            .stop(handle)
            .await
            .map_err(|e| format!("failed to stop {}: {e:#}", handle.name))?;
        self.runtime
            .remove(handle)
            .await
            .map_err(|e| format!("failed to remove {}: {e:#}", handle.name))?;

        let leftover = self
            .runtime
            .inspect(&handle.name)
            .await
            .map_err(|e| format!("failed to inspect {}: {e:#}", handle.name))?;
        if leftover.is_some() {
            return Err(format!("container {} still exists after removal", handle.name));
        }
        Ok(())
    }

    /// Create an instance from `spec` and check it kept the identity.
    pub async fn launch(&self, spec: &LaunchSpec) -> Result<InstanceHandle, String> {
        info!(instance = %spec.name, image = %spec.image, "Launching instance");
        let handle = self
            .runtime
            .create(spec)
            .await
            .map_err(|e| format!("failed to create {} from {}: {e:#}", spec.name, spec.image))?;

        if let Some(drift) = handle.invariant_drift(spec) {
            return Err(format!("launched instance drifted from its template: {drift}"));
        }
        Ok(handle)
    }

    /// Poll until the instance runs and answers a ping.
    ///
    /// On exhaustion the error carries the tail of the instance log.
    pub async fn wait_ready(&self, handle: &InstanceHandle) -> Result<u32, String> {
        let pb = self.spinner(handle);
        let runtime = &self.runtime;
        let admin = &self.admin;
        let timeout = self.settings.admin_timeout;
        let readiness = self.settings.readiness;

        let result = readiness
            .poll(None, |attempt| {
                pb.set_message(format!(
                    "Waiting for {} to accept connections ({}/{})",
                    handle.image, attempt, readiness.max_attempts
                ));
                async move {
                    if !runtime.is_running(handle).await? {
                        return Ok(false);
                    }
                    deadline(timeout, "ping", admin.ping(handle)).await?;
                    Ok::<_, anyhow::Error>(true)
                }
            })
            .await;

        match result {
            Ok(attempts) => {
                pb.finish_and_clear();
                debug!(instance = %handle.name, attempts, "Instance ready");
                Ok(attempts)
            }
            Err(e) => {
                pb.abandon_with_message(format!("{} not ready", handle.image));
                Err(self.describe_wait_failure(handle, &e).await)
            }
        }
    }

    async fn describe_wait_failure(&self, handle: &InstanceHandle, error: &WaitError) -> String {
        match self.runtime.logs(handle, LOG_TAIL_LINES).await {
            Ok(tail) if !tail.trim().is_empty() => {
                format!("{error}; last log lines:\n{}", tail.trim_end())
            }
            Ok(_) => error.to_string(),
            Err(e) => format!("{error}; logs unavailable: {e:#}"),
        }
    }

    /// Check the instance reports exactly `expected`. Read-only.
    pub async fn verify_version(
        &self,
        handle: &InstanceHandle,
        expected: &Version,
    ) -> Result<(), UpgradeError> {
        let reported = deadline(
            self.settings.admin_timeout,
            "version query",
            self.admin.get_version(handle),
        )
        .await
        .map_err(|e| UpgradeError::VersionMismatch {
            expected: expected.to_string(),
            actual: format!("unknown ({e:#})"),
        })?;

        let reported = reported.trim();
        match reported.parse::<Version>() {
            Ok(actual) if actual == *expected => Ok(()),
            _ => Err(UpgradeError::VersionMismatch {
                expected: expected.to_string(),
                actual: reported.to_string(),
            }),
        }
    }

    fn spinner(&self, handle: &InstanceHandle) -> ProgressBar {
        if !self.settings.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("Starting {}", handle.image));
        pb.enable_steady_tick(Duration::from_millis(200));
        pb
    }
}
