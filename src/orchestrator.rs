//! Sequencing of one upgrade run.
//!
//! The orchestrator owns the run state. It gates every mutation on a
//! verified backup, walks the path one step at a time and hands any failure
//! after the first mutation to the rollback coordinator. A failed run is
//! never resumed; the whole path has to be run again.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::deadline;
use crate::capability::{AdminInterface, BackupStore, ContainerRuntime, ServiceRegistry};
use crate::config::RunConfig;
use crate::error::UpgradeError;
use crate::events::{EventEmitter, Phase, PhaseEvent};
use crate::instance::{InstanceDescriptor, InstanceHandle, LaunchSpec};
use crate::lock::RunLock;
use crate::output;
use crate::phases::{
    BackupCoordinator, CompatibilityController, DependentServiceController, HealthChecker,
    RollbackCoordinator, RollbackOutcome, ServiceMatcher, StepExecutor, StepSettings,
};
use crate::run::{RunStatus, UpgradeRun, VersionStep, validate_path};
use crate::state::StateStore;
use crate::types::BackupRecord;
use crate::version::{CompatMarker, Version};

/// The external systems a run acts on.
#[derive(Clone)]
pub struct Capabilities {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub admin: Arc<dyn AdminInterface>,
    pub backup: Arc<dyn BackupStore>,
    pub services: Arc<dyn ServiceRegistry>,
}

/// Result of the read-only prerequisite check.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub descriptor: InstanceDescriptor,
    /// Invariant identity every relaunch reuses.
    pub template: LaunchSpec,
    pub baseline: Version,
    pub steps: Vec<VersionStep>,
}

/// How compensation ended.
#[derive(Debug, Clone)]
pub enum RollbackReport {
    Completed(RollbackOutcome),
    Failed(UpgradeError),
}

/// Everything the operator needs to know about a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: UpgradeRun,
    /// The error that ended the upgrade, if any.
    pub error: Option<UpgradeError>,
    pub backup: Option<BackupRecord>,
    pub rollback: Option<RollbackReport>,
    /// Last marker applied by a completed step.
    pub final_marker: Option<CompatMarker>,
}

impl RunReport {
    fn new(run: UpgradeRun) -> Self {
        Self {
            run,
            error: None,
            backup: None,
            rollback: None,
            final_marker: None,
        }
    }

    pub const fn status(&self) -> RunStatus {
        self.run.status()
    }

    pub const fn exit_code(&self) -> i32 {
        self.run.status().exit_code()
    }

    /// Version the instance runs after the run.
    pub fn final_version(&self) -> &Version {
        match self.status() {
            RunStatus::RolledBack => &self.run.baseline,
            _ => self.run.last_completed_version(),
        }
    }
}

/// Components of one run, all emitting through the run's emitter.
struct RunParts {
    executor: Arc<StepExecutor>,
    services: Arc<DependentServiceController>,
    compat: CompatibilityController,
    health: HealthChecker,
    events: EventEmitter,
}

pub struct UpgradeOrchestrator {
    config: Arc<RunConfig>,
    caps: Capabilities,
    state: StateStore,
    events: EventEmitter,
    cancel: CancellationToken,
}

impl UpgradeOrchestrator {
    pub fn new(
        config: Arc<RunConfig>,
        caps: Capabilities,
        events: EventEmitter,
        cancel: CancellationToken,
    ) -> Self {
        let state = StateStore::new(config.state_dir.clone());
        Self {
            config,
            caps,
            state,
            events,
            cancel,
        }
    }

    /// Check prerequisites without changing anything.
    pub async fn preflight(&self) -> Result<Preflight, UpgradeError> {
        let config = &self.config;
        validate_path(Some(&config.baseline), &config.steps)?;

        let descriptor = self
            .caps
            .runtime
            .inspect(&config.container)
            .await
            .map_err(|e| {
                UpgradeError::Prerequisite(format!(
                    "cannot inspect container {}: {e:#}",
                    config.container
                ))
            })?
            .ok_or_else(|| {
                UpgradeError::Prerequisite(format!("container {} not found", config.container))
            })?;
        if !descriptor.running {
            return Err(UpgradeError::Prerequisite(format!(
                "container {} is not running",
                config.container
            )));
        }
        let template = LaunchSpec::from_descriptor(&descriptor)?;

        let reported = reported_version(
            self.caps.admin.as_ref(),
            &descriptor.handle(),
            config.admin_timeout,
        )
        .await?;
        if reported != config.baseline {
            return Err(UpgradeError::Prerequisite(format!(
                "container {} reports {reported}, expected baseline {}",
                config.container, config.baseline
            )));
        }

        Ok(Preflight {
            descriptor,
            template,
            baseline: config.baseline.clone(),
            steps: config.steps.clone(),
        })
    }

    /// Execute the whole run and return its terminal report.
    pub async fn run(&self) -> RunReport {
        let config = &self.config;
        let mut report = RunReport::new(UpgradeRun::new(
            config.container.clone(),
            config.baseline.clone(),
            config.steps.clone(),
        ));
        let events = self.events.for_run(report.run.id);

        let lock = validate_path(Some(&config.baseline), &config.steps)
            .and_then(|()| RunLock::acquire(&config.state_dir, &config.container, report.run.id));
        let status = match &lock {
            Ok(_) => self.drive(&mut report, &events).await,
            Err(e) => {
                report.error = Some(e.clone());
                RunStatus::Failed
            }
        };

        self.conclude(&mut report, status, &events);
        drop(lock);
        report
    }

    async fn drive(&self, report: &mut RunReport, events: &EventEmitter) -> RunStatus {
        let config = &self.config;
        if let Err(e) = report.run.start() {
            report.error = Some(UpgradeError::Configuration(e.to_string()));
            return RunStatus::Failed;
        }
        events.emit(
            PhaseEvent::new(Phase::RunStarted)
                .version(&config.baseline)
                .detail(format!("{} step(s) to {}", config.steps.len(), config.target())),
        );
        info!(
            container = %config.container,
            baseline = %config.baseline,
            target = %config.target(),
            steps = config.steps.len(),
            "Upgrade run started"
        );

        if config.steps.is_empty() && !config.backup_only {
            info!(version = %config.baseline, "Already at target, nothing to do");
            return RunStatus::Succeeded;
        }

        let parts = match self.parts(events) {
            Ok(parts) => parts,
            Err(e) => return fail(report, e),
        };
        let preflight = match self.preflight().await {
            Ok(preflight) => preflight,
            Err(e) => return fail(report, e),
        };

        if let Err(e) = parts.services.pause_all().await {
            return fail(report, e);
        }

        let backup = BackupCoordinator::new(Arc::clone(&self.caps.backup), events.clone());
        let record = match self.backup_gate(&backup, &preflight).await {
            Ok(record) => record,
            Err(e) => {
                resume(&parts.services).await;
                return fail(report, e);
            }
        };
        report.backup = Some(record.clone());

        if config.backup_only {
            resume(&parts.services).await;
            info!(backup = %record.id, "Backup complete, skipping upgrade");
            return RunStatus::Succeeded;
        }

        let Some(failure) = self.walk(report, &parts, &preflight).await else {
            resume(&parts.services).await;
            return RunStatus::Succeeded;
        };
        let (failed_target, e) = failure;

        if !e.triggers_rollback() {
            warn!(kind = e.kind(), "Instance was not changed by this failure, nothing to roll back");
            resume(&parts.services).await;
            return fail(report, e);
        }

        report.error = Some(e);
        report.final_marker = None;
        let coordinator = RollbackCoordinator::new(
            Arc::clone(&self.caps.runtime),
            Arc::clone(&self.caps.backup),
            Arc::clone(&parts.executor),
            Arc::clone(&parts.services),
            parts.events.clone(),
        );
        match coordinator
            .rollback(&failed_target, &record, &preflight.template)
            .await
        {
            Ok(outcome) => {
                report.rollback = Some(RollbackReport::Completed(outcome));
                RunStatus::RolledBack
            }
            Err(e) => {
                error!(
                    paused = ?parts.services.paused(),
                    "Rollback failed, dependent services stay paused"
                );
                report.rollback = Some(RollbackReport::Failed(e));
                RunStatus::Failed
            }
        }
    }

    /// Take, verify and record the backup.
    async fn backup_gate(
        &self,
        backup: &BackupCoordinator,
        preflight: &Preflight,
    ) -> Result<BackupRecord, UpgradeError> {
        let record = backup
            .gate(&preflight.descriptor.handle(), &preflight.baseline)
            .await?;
        self.state.save_backup_reference(&record).map_err(|e| {
            UpgradeError::Backup(format!("cannot record backup {}: {e:#}", record.id))
        })?;
        Ok(record)
    }

    /// Execute the remaining steps in order. Returns the failing target and
    /// the error that stopped the walk, or `None` once the path is complete.
    async fn walk(
        &self,
        report: &mut RunReport,
        parts: &RunParts,
        preflight: &Preflight,
    ) -> Option<(Version, UpgradeError)> {
        let total = report.run.steps.len();
        let mut current = preflight.descriptor.handle();

        while let Some(step) = report.run.next_step().cloned() {
            if self.cancel.is_cancelled() {
                let completed_steps = report.run.current_step_index();
                warn!(completed_steps, "Abort requested, stopping at step boundary");
                return Some((step.version, UpgradeError::Aborted { completed_steps }));
            }

            if self.config.show_progress {
                output::print_step_header(step.position, total, report.run.last_completed_version(), &step.version);
            }
            match self.step(parts, &current, &step, &preflight.template).await {
                Ok((handle, marker)) => {
                    current = handle;
                    if marker.is_some() {
                        report.final_marker = marker;
                    }
                    if let Err(e) = report.run.advance() {
                        return Some((step.version, UpgradeError::Configuration(e.to_string())));
                    }
                    if self.config.show_progress {
                        output::print_step_done(&step.version);
                    }
                }
                Err(e) => return Some((step.version, e)),
            }
        }
        None
    }

    /// One hop: replace the instance, move the marker, check health.
    async fn step(
        &self,
        parts: &RunParts,
        current: &InstanceHandle,
        step: &VersionStep,
        template: &LaunchSpec,
    ) -> Result<(InstanceHandle, Option<CompatMarker>), UpgradeError> {
        let handle = parts.executor.execute(current, step, template).await?;
        let marker = parts.compat.apply(&handle, step).await?;
        parts.health.check(&handle, &step.version).await?;
        Ok((handle, marker))
    }

    fn parts(&self, events: &EventEmitter) -> Result<RunParts, UpgradeError> {
        let config = &self.config;
        let matcher = config
            .dependent_pattern
            .as_deref()
            .map(|pattern| ServiceMatcher::new(pattern, config.container.clone()))
            .transpose()?;

        let settings = StepSettings {
            repository: config.repository.clone(),
            readiness: config.readiness,
            admin_timeout: config.admin_timeout,
            show_progress: config.show_progress,
        };
        Ok(RunParts {
            executor: Arc::new(StepExecutor::new(
                Arc::clone(&self.caps.runtime),
                Arc::clone(&self.caps.admin),
                settings,
                events.clone(),
            )),
            services: Arc::new(DependentServiceController::new(
                Arc::clone(&self.caps.services),
                matcher,
                events.clone(),
            )),
            compat: CompatibilityController::new(
                Arc::clone(&self.caps.admin),
                config.admin_timeout,
                events.clone(),
            ),
            health: HealthChecker::new(
                Arc::clone(&self.caps.admin),
                config.admin_timeout,
                events.clone(),
            ),
            events: events.clone(),
        })
    }

    /// Seal the run, archive it and emit the final event.
    fn conclude(&self, report: &mut RunReport, status: RunStatus, events: &EventEmitter) {
        let message = report.error.as_ref().map(ToString::to_string);
        if let Err(e) = report.run.finish(status, message) {
            warn!("Run already sealed: {}", e);
        }
        if let Err(e) = self.state.archive_run(&report.run) {
            warn!("Failed to archive run {}: {:#}", report.run.id, e);
        }

        let mut event = PhaseEvent::new(Phase::RunFinished)
            .step(report.run.current_step_index())
            .version(report.final_version())
            .detail(status.to_string());
        if let Some(e) = &report.error {
            event = event.detail(format!("{status}: {}", e.kind()));
        }
        events.emit(event);

        match status {
            RunStatus::Succeeded => info!(
                completed_steps = report.run.current_step_index(),
                version = %report.final_version(),
                "Run succeeded"
            ),
            _ => error!(
                %status,
                completed_steps = report.run.current_step_index(),
                error = report.error.as_ref().map(UpgradeError::kind),
                "Run did not succeed"
            ),
        }
    }
}

fn fail(report: &mut RunReport, e: UpgradeError) -> RunStatus {
    error!("{}", e);
    report.error = Some(e);
    RunStatus::Failed
}

async fn resume(services: &DependentServiceController) {
    if let Err(e) = services.resume_all().await {
        warn!("{}", e);
    }
}

/// Ask a running instance for its version.
async fn reported_version(
    admin: &dyn AdminInterface,
    handle: &InstanceHandle,
    timeout: std::time::Duration,
) -> Result<Version, UpgradeError> {
    let reported = deadline(timeout, "version query", admin.get_version(handle))
        .await
        .map_err(|e| {
            UpgradeError::Prerequisite(format!("cannot query version of {}: {e:#}", handle.name))
        })?;
    reported.trim().parse::<Version>().map_err(|_| {
        UpgradeError::Prerequisite(format!(
            "{} reports an unparseable version '{}'",
            handle.name,
            reported.trim()
        ))
    })
}

/// Version the named instance runs now, for runs without `--baseline`.
pub async fn detect_baseline(
    runtime: &dyn ContainerRuntime,
    admin: &dyn AdminInterface,
    name: &str,
    timeout: std::time::Duration,
) -> Result<Version, UpgradeError> {
    let descriptor = runtime
        .inspect(name)
        .await
        .map_err(|e| UpgradeError::Prerequisite(format!("cannot inspect container {name}: {e:#}")))?
        .ok_or_else(|| UpgradeError::Prerequisite(format!("container {name} not found")))?;
    if !descriptor.running {
        return Err(UpgradeError::Prerequisite(format!(
            "container {name} is not running"
        )));
    }
    reported_version(admin, &descriptor.handle(), timeout).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backoff::Backoff;
    use crate::events::MemorySink;
    use crate::run::steps_from_versions;
    use crate::testing::FakeService;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn caps(fake: &Arc<FakeService>) -> Capabilities {
        Capabilities {
            runtime: fake.clone(),
            admin: fake.clone(),
            backup: fake.clone(),
            services: fake.clone(),
        }
    }

    fn run_config(state_dir: &std::path::Path, baseline: &str, path: &[&str]) -> RunConfig {
        RunConfig {
            container: "mongodb".to_string(),
            repository: "mongo".to_string(),
            baseline: v(baseline),
            steps: steps_from_versions(path.iter().map(|s| v(s)).collect()),
            dependent_pattern: Some("^app-".to_string()),
            state_dir: state_dir.to_path_buf(),
            backup_dir: state_dir.join("backups"),
            readiness: Backoff::new(Duration::from_millis(1), 5),
            admin_timeout: Duration::from_secs(1),
            backup_only: false,
            show_progress: false,
        }
    }

    struct Harness {
        fake: Arc<FakeService>,
        memory: Arc<MemorySink>,
        orchestrator: UpgradeOrchestrator,
        cancel: CancellationToken,
        _dir: tempfile::TempDir,
    }

    fn harness(baseline: &str, path: &[&str], tweak: impl FnOnce(&mut RunConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeService::new(baseline);
        let memory = Arc::new(MemorySink::default());
        let mut config = run_config(dir.path(), baseline, path);
        tweak(&mut config);
        let cancel = CancellationToken::new();
        let orchestrator = UpgradeOrchestrator::new(
            Arc::new(config),
            caps(&fake),
            EventEmitter::new(memory.clone()),
            cancel.clone(),
        );
        Harness {
            fake,
            memory,
            orchestrator,
            cancel,
            _dir: dir,
        }
    }

    const FULL_PATH: &[&str] = &["4.2.24", "4.4.29", "5.0.31", "6.0.19", "7.0.2"];

    fn assert_step_index_monotonic(memory: &MemorySink) {
        let mut last = 0;
        for event in memory.events() {
            if event.phase == Phase::StepDone {
                let step = event.step.unwrap();
                assert_eq!(step, last + 1);
                last = step;
            }
        }
    }

    #[tokio::test]
    async fn test_scenario_a_full_chain_succeeds() {
        let h = harness("4.0.9", FULL_PATH, |_| {});
        let report = h.orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::Succeeded, "{:?}", report.error);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.run.current_step_index(), 5);
        assert_eq!(report.final_version(), &v("7.0.2"));
        assert_eq!(report.final_marker, Some(CompatMarker::new(7, 0)));
        assert!(report.backup.as_ref().unwrap().verified);
        assert!(report.rollback.is_none());

        assert_eq!(h.fake.live_version().as_deref(), Some("7.0.2"));
        assert_eq!(h.fake.compat(), CompatMarker::new(7, 0));
        assert!(h.fake.state().services.values().all(|running| *running));

        let ops = h.fake.ops();
        assert_eq!(&ops[..3], &["pause app-api", "pause app-worker", "backup backup-1"]);
        let creates: Vec<&String> = ops.iter().filter(|op| op.starts_with("create")).collect();
        assert_eq!(creates.len(), 5);
        assert_eq!(ops.iter().filter(|op| op.starts_with("set_compat")).count(), 5);
        assert_eq!(&ops[ops.len() - 2..], &["resume app-api", "resume app-worker"]);

        let phases = h.memory.phases();
        assert_eq!(phases.first(), Some(&Phase::RunStarted));
        assert_eq!(phases.last(), Some(&Phase::RunFinished));
        assert_eq!(phases.iter().filter(|p| **p == Phase::HealthChecked).count(), 5);
        assert_step_index_monotonic(&h.memory);

        let archived = std::fs::read_to_string(
            h.orchestrator.state.run_path(report.run.id),
        )
        .unwrap();
        assert!(archived.contains("Succeeded"));
        assert!(h.orchestrator.state.load_backup_reference().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scenario_b_unhealthy_hop_rolls_back() {
        let h = harness("4.4.29", &["5.0.31", "6.0.19"], |_| {});
        h.fake.state().unhealthy.push("5.0.31".to_string());

        let report = h.orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::RolledBack);
        assert_ne!(report.exit_code(), 0);
        assert_eq!(report.run.current_step_index(), 0);
        assert!(matches!(report.error, Some(UpgradeError::HealthCheck { .. })));
        match &report.rollback {
            Some(RollbackReport::Completed(outcome)) => {
                assert_eq!(outcome.restored_version, v("4.4.29"));
                assert_eq!(outcome.backup_id, "backup-1");
            }
            other => panic!("unexpected rollback report: {other:?}"),
        }
        assert_eq!(report.final_version(), &v("4.4.29"));
        assert_eq!(h.fake.live_version().as_deref(), Some("4.4.29"));
        assert_eq!(h.fake.compat(), CompatMarker::new(4, 4));
        assert!(h.fake.ops().contains(&"restore backup-1 with mongo:4.4.29".to_string()));
        assert!(!h.fake.ops().iter().any(|op| op == "create mongo:6.0.19"));
        assert!(h.fake.state().services.values().all(|running| *running));
    }

    #[tokio::test]
    async fn test_scenario_b_from_baseline_4_0_9() {
        let h = harness("4.0.9", FULL_PATH, |_| {});
        h.fake.state().unhealthy.push("5.0.31".to_string());

        let report = h.orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::RolledBack);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.run.current_step_index(), 2);
        assert_eq!(h.fake.live_version().as_deref(), Some("4.0.9"));
        assert_eq!(report.final_version(), &v("4.0.9"));
        assert_step_index_monotonic(&h.memory);
    }

    #[tokio::test]
    async fn test_scenario_c_corrupt_backup_fails_without_mutation() {
        let h = harness("4.0.9", FULL_PATH, |_| {});
        h.fake.state().backup_corrupt = true;

        let report = h.orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::Failed);
        assert_eq!(report.exit_code(), 1);
        assert!(matches!(report.error, Some(UpgradeError::Backup(_))));
        assert_eq!(report.run.current_step_index(), 0);
        assert!(report.rollback.is_none());
        assert!(report.backup.is_none());

        let ops = h.fake.ops();
        assert!(!ops.iter().any(|op| op.starts_with("stop") || op.starts_with("create")));
        assert!(!ops.iter().any(|op| op.starts_with("restore")));
        assert_eq!(h.fake.live_version().as_deref(), Some("4.0.9"));
        assert!(h.fake.state().services.values().all(|running| *running));
        assert!(!h.memory.phases().contains(&Phase::StepStopping));
    }

    #[tokio::test]
    async fn test_scenario_d_never_ready_rolls_back() {
        let h = harness("4.0.9", FULL_PATH, |_| {});
        h.fake.state().never_ready.push("4.2.24".to_string());

        let report = h.orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::RolledBack);
        assert!(matches!(report.error, Some(UpgradeError::StepLaunch { .. })));
        assert_eq!(report.run.current_step_index(), 0);
        assert!(matches!(report.rollback, Some(RollbackReport::Completed(_))));
        assert_eq!(h.fake.live_version().as_deref(), Some("4.0.9"));
    }

    #[tokio::test]
    async fn test_version_mismatch_mid_path_rolls_back() {
        let h = harness("4.0.9", FULL_PATH, |_| {});
        h.fake
            .state()
            .misreport
            .insert("4.4.29".to_string(), "4.4.28".to_string());

        let report = h.orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::RolledBack);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.run.current_step_index(), 1);
        match &report.error {
            Some(UpgradeError::VersionMismatch { expected, actual }) => {
                assert_eq!(expected, "4.4.29");
                assert_eq!(actual, "4.4.28");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(report.rollback, Some(RollbackReport::Completed(_))));
        assert_eq!(h.fake.live_version().as_deref(), Some("4.0.9"));
        assert_eq!(h.fake.compat(), CompatMarker::new(4, 0));
        assert!(!h.fake.ops().iter().any(|op| op == "create mongo:5.0.31"));
        assert!(h.fake.state().services.values().all(|running| *running));
        assert_step_index_monotonic(&h.memory);
    }

    #[tokio::test]
    async fn test_ignored_marker_write_mid_path_rolls_back() {
        let h = harness("4.0.9", FULL_PATH, |_| {});
        // The server starts ignoring marker writes once the second step is up.
        struct IgnoreMarkerFrom {
            fake: Arc<FakeService>,
            step: usize,
        }
        impl crate::events::EventSink for IgnoreMarkerFrom {
            fn emit(&self, event: &PhaseEvent) {
                if event.phase == Phase::StepDone && event.step == Some(self.step) {
                    self.fake.state().compat_write_ignored = true;
                }
            }
        }
        let orchestrator = UpgradeOrchestrator::new(
            Arc::clone(&h.orchestrator.config),
            caps(&h.fake),
            EventEmitter::new(Arc::new(crate::events::FanoutSink::new(vec![
                h.memory.clone(),
                Arc::new(IgnoreMarkerFrom {
                    fake: h.fake.clone(),
                    step: 2,
                }),
            ]))),
            h.cancel.clone(),
        );

        let report = orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::RolledBack);
        assert_eq!(report.run.current_step_index(), 1);
        assert!(matches!(report.error, Some(UpgradeError::Compatibility { .. })));
        assert_eq!(report.final_marker, None);
        assert_eq!(report.final_version(), &v("4.0.9"));
        assert_eq!(h.fake.live_version().as_deref(), Some("4.0.9"));
        assert_eq!(h.fake.compat(), CompatMarker::new(4, 0));
        assert_eq!(
            h.memory
                .phases()
                .iter()
                .filter(|p| **p == Phase::HealthChecked)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_empty_path_touches_nothing() {
        let h = harness("7.0.2", &[], |_| {});
        let report = h.orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::Succeeded);
        assert_eq!(report.run.current_step_index(), 0);
        assert!(h.fake.ops().is_empty());
        assert!(h.fake.state().container.as_ref().unwrap().polls == 0);
    }

    #[tokio::test]
    async fn test_non_monotonic_path_is_configuration_error() {
        let h = harness("4.0.9", &["4.4.29", "4.2.24"], |_| {});
        let report = h.orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::Failed);
        assert!(matches!(report.error, Some(UpgradeError::Configuration(_))));
        assert!(h.fake.ops().is_empty());
    }

    #[tokio::test]
    async fn test_lock_held_is_prerequisite_error() {
        let h = harness("4.0.9", FULL_PATH, |_| {});
        let _held = RunLock::acquire(
            &h.orchestrator.config.state_dir,
            "mongodb",
            uuid::Uuid::new_v4(),
        )
        .unwrap();

        let report = h.orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::Failed);
        assert!(matches!(report.error, Some(UpgradeError::Prerequisite(_))));
        assert!(h.fake.ops().is_empty());
    }

    #[tokio::test]
    async fn test_baseline_mismatch_is_prerequisite_error() {
        let h = harness("4.0.9", FULL_PATH, |c| c.baseline = v("4.0.8"));
        let err = h.orchestrator.preflight().await.unwrap_err();
        assert!(matches!(err, UpgradeError::Prerequisite(_)));
        assert!(h.fake.ops().is_empty());
    }

    #[tokio::test]
    async fn test_preflight_requires_running_instance() {
        let h = harness("4.0.9", FULL_PATH, |_| {});
        h.fake.state().container.as_mut().unwrap().running = false;
        assert!(matches!(
            h.orchestrator.preflight().await,
            Err(UpgradeError::Prerequisite(_))
        ));

        h.fake.state().container = None;
        assert!(matches!(
            h.orchestrator.preflight().await,
            Err(UpgradeError::Prerequisite(_))
        ));
    }

    #[tokio::test]
    async fn test_preflight_captures_template() {
        let h = harness("4.0.9", FULL_PATH, |_| {});
        let preflight = h.orchestrator.preflight().await.unwrap();
        assert_eq!(preflight.template.name, "mongodb");
        assert_eq!(preflight.template.volume.target, "/data/db");
        assert_eq!(preflight.steps.len(), 5);
        assert!(h.fake.ops().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_failure_ends_failed_with_services_paused() {
        let h = harness("4.0.9", FULL_PATH, |_| {});
        {
            let mut state = h.fake.state();
            state.unhealthy.push("4.4.29".to_string());
            state.restore_fails = true;
        }

        let report = h.orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::Failed);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.run.current_step_index(), 1);
        match &report.rollback {
            Some(RollbackReport::Failed(e)) => assert_eq!(e.kind(), "RollbackError"),
            other => panic!("unexpected rollback report: {other:?}"),
        }
        let state = h.fake.state();
        assert_eq!(state.services.get("app-api"), Some(&false));
        assert_eq!(state.services.get("grafana"), Some(&true));
    }

    #[tokio::test]
    async fn test_abort_after_first_step_rolls_back() {
        let h = harness("4.0.9", FULL_PATH, |_| {});
        // Cancel once the first step has been verified healthy.
        struct CancelOnHealth(CancellationToken);
        impl crate::events::EventSink for CancelOnHealth {
            fn emit(&self, event: &PhaseEvent) {
                if event.phase == Phase::HealthChecked {
                    self.0.cancel();
                }
            }
        }
        let orchestrator = UpgradeOrchestrator::new(
            Arc::clone(&h.orchestrator.config),
            caps(&h.fake),
            EventEmitter::new(Arc::new(crate::events::FanoutSink::new(vec![
                h.memory.clone(),
                Arc::new(CancelOnHealth(h.cancel.clone())),
            ]))),
            h.cancel.clone(),
        );

        let report = orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::RolledBack);
        assert_eq!(report.run.current_step_index(), 1);
        assert_eq!(
            report.error,
            Some(UpgradeError::Aborted { completed_steps: 1 })
        );
        assert_eq!(h.fake.live_version().as_deref(), Some("4.0.9"));
        assert!(!h.fake.ops().iter().any(|op| op == "create mongo:4.4.29"));
    }

    #[tokio::test]
    async fn test_abort_before_first_step_fails_without_rollback() {
        let h = harness("4.0.9", FULL_PATH, |_| {});
        h.cancel.cancel();

        let report = h.orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::Failed);
        assert_eq!(
            report.error,
            Some(UpgradeError::Aborted { completed_steps: 0 })
        );
        assert!(report.rollback.is_none());
        let ops = h.fake.ops();
        assert!(!ops.iter().any(|op| op.starts_with("stop") || op.starts_with("restore")));
        assert!(h.fake.state().services.values().all(|running| *running));
    }

    #[tokio::test]
    async fn test_backup_only_stops_after_gate() {
        let h = harness("4.0.9", FULL_PATH, |c| c.backup_only = true);
        let report = h.orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::Succeeded);
        assert_eq!(report.run.current_step_index(), 0);
        assert!(report.backup.is_some());
        assert_eq!(
            h.fake.ops(),
            vec![
                "pause app-api",
                "pause app-worker",
                "backup backup-1",
                "resume app-api",
                "resume app-worker",
            ]
        );
    }

    #[tokio::test]
    async fn test_skipped_marker_keeps_previous() {
        let h = harness("4.0.9", &["4.2.24", "4.4.29"], |c| {
            c.steps[1].compatibility = None;
        });
        let report = h.orchestrator.run().await;

        assert_eq!(report.status(), RunStatus::Succeeded);
        assert_eq!(report.final_marker, Some(CompatMarker::new(4, 2)));
        assert!(h.memory.phases().contains(&Phase::CompatibilitySkipped));
    }

    #[tokio::test]
    async fn test_second_run_after_terminal_starts_fresh() {
        let h = harness("4.0.9", &["4.2.24"], |_| {});
        let first = h.orchestrator.run().await;
        assert_eq!(first.status(), RunStatus::Succeeded);
        assert!(first.run.is_terminal());

        // The instance is now at 4.2.24, so the same plan no longer matches.
        let second = h.orchestrator.run().await;
        assert_ne!(second.run.id, first.run.id);
        assert_eq!(second.run.current_step_index(), 0);
        assert!(matches!(second.error, Some(UpgradeError::Prerequisite(_))));
    }

    #[tokio::test]
    async fn test_detect_baseline() {
        let fake = FakeService::new("5.0.31");
        let detected = detect_baseline(fake.as_ref(), fake.as_ref(), "mongodb", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(detected, v("5.0.31"));

        let err = detect_baseline(fake.as_ref(), fake.as_ref(), "other", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, UpgradeError::Prerequisite(_)));
    }
}
