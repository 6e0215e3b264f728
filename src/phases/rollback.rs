//! Restoring the instance to its baseline from the verified backup.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::capability::{BackupStore, ContainerRuntime};
use crate::error::UpgradeError;
use crate::events::{EventEmitter, Phase, PhaseEvent};
use crate::instance::{InstanceHandle, LaunchSpec};
use crate::phases::services::DependentServiceController;
use crate::phases::step::StepExecutor;
use crate::types::{BackupRecord, RestoreTarget};
use crate::version::Version;

/// What a successful rollback left behind.
#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub backup_id: String,
    pub restored_version: Version,
    pub handle: InstanceHandle,
    /// Dependent services resumed afterwards.
    pub resumed: Vec<String>,
}

pub struct RollbackCoordinator {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn BackupStore>,
    executor: Arc<StepExecutor>,
    services: Arc<DependentServiceController>,
    events: EventEmitter,
}

impl RollbackCoordinator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn BackupStore>,
        executor: Arc<StepExecutor>,
        services: Arc<DependentServiceController>,
        events: EventEmitter,
    ) -> Self {
        Self {
            runtime,
            store,
            executor,
            services,
            events,
        }
    }

    /// Bring the instance back to the backup's baseline.
    ///
    /// Removes whatever instance exists, restores the data volume, relaunches
    /// the baseline with the original identity and checks it reports the
    /// baseline version. Dependent services are resumed only on success.
    pub async fn rollback(
        &self,
        failed_target: &Version,
        record: &BackupRecord,
        template: &LaunchSpec,
    ) -> Result<RollbackOutcome, UpgradeError> {
        warn!(
            failed_target = %failed_target,
            backup = %record.id,
            baseline = %record.baseline,
            "Rolling back"
        );
        self.events.emit(
            PhaseEvent::new(Phase::RollbackStarted)
                .version(failed_target)
                .detail(record.id.clone()),
        );

        match self.restore_baseline(record, template).await {
            Ok(handle) => {
                let resumed = match self.services.resume_all().await {
                    Ok(resumed) => resumed,
                    Err(e) => {
                        warn!("{}", e);
                        Vec::new()
                    }
                };
                self.events.emit(
                    PhaseEvent::new(Phase::RollbackCompleted)
                        .version(&record.baseline)
                        .detail(record.id.clone()),
                );
                info!(baseline = %record.baseline, "Rollback complete");
                Ok(RollbackOutcome {
                    backup_id: record.id.clone(),
                    restored_version: record.baseline.clone(),
                    handle,
                    resumed,
                })
            }
            Err(e) => {
                error!(backup = %record.id, "Rollback failed: {}", e);
                self.events
                    .emit(PhaseEvent::new(Phase::RollbackFailed).detail(e.to_string()));
                Err(e)
            }
        }
    }

    async fn restore_baseline(
        &self,
        record: &BackupRecord,
        template: &LaunchSpec,
    ) -> Result<InstanceHandle, UpgradeError> {
        if !record.verified {
            return Err(UpgradeError::Rollback(format!(
                "backup {} was never verified, refusing to restore it",
                record.id
            )));
        }

        if let Some(existing) = self
            .runtime
            .inspect(&template.name)
            .await
            .map_err(|e| UpgradeError::Rollback(format!("failed to inspect {}: {e:#}", template.name)))?
        {
            self.executor
                .stop_instance(&existing.handle())
                .await
                .map_err(UpgradeError::Rollback)?;
        }

        // The template was captured from the baseline instance, image reference included.
        let baseline_spec = template;
        let target = RestoreTarget {
            volume: template.volume.clone(),
            image: baseline_spec.image.clone(),
            mounts: template.mounts.clone(),
        };
        self.store
            .restore(record, &target)
            .await
            .map_err(|e| UpgradeError::Rollback(format!("restore of {} failed: {e:#}", record.id)))?;
        self.events
            .emit(PhaseEvent::new(Phase::RollbackRestored).detail(record.id.clone()));

        let handle = self
            .executor
            .launch(baseline_spec)
            .await
            .map_err(UpgradeError::Rollback)?;
        self.executor
            .wait_ready(&handle)
            .await
            .map_err(|e| UpgradeError::Rollback(format!("baseline did not become ready: {e}")))?;
        self.events.emit(
            PhaseEvent::new(Phase::RollbackRelaunched).version(&record.baseline),
        );

        self.executor
            .verify_version(&handle, &record.baseline)
            .await
            .map_err(|e| UpgradeError::Rollback(e.to_string()))?;
        Ok(handle)
    }
}
