//! Backup gate: nothing is mutated until a verified backup exists.

use std::sync::Arc;

use tracing::{info, warn};

use crate::capability::BackupStore;
use crate::error::UpgradeError;
use crate::events::{EventEmitter, Phase, PhaseEvent};
use crate::instance::InstanceHandle;
use crate::types::BackupRecord;
use crate::version::Version;

pub struct BackupCoordinator {
    store: Arc<dyn BackupStore>,
    events: EventEmitter,
}

impl BackupCoordinator {
    pub fn new(store: Arc<dyn BackupStore>, events: EventEmitter) -> Self {
        Self { store, events }
    }

    /// Produce a full backup of the instance at its baseline version.
    pub async fn create_backup(
        &self,
        handle: &InstanceHandle,
        baseline: &Version,
    ) -> Result<BackupRecord, UpgradeError> {
        info!(instance = %handle.name, %baseline, "Creating backup");
        let record = self
            .store
            .create_backup(handle, baseline)
            .await
            .map_err(|e| UpgradeError::Backup(format!("{e:#}")))?;

        self.events.emit(
            PhaseEvent::new(Phase::BackupCreated)
                .version(baseline)
                .detail(record.path.display().to_string()),
        );
        info!(backup = %record.id, path = %record.path.display(), "Backup created");
        Ok(record)
    }

    /// Check the integrity marker of a backup. Not retried.
    pub async fn verify(&self, record: &BackupRecord) -> Result<bool, UpgradeError> {
        self.store
            .verify(record)
            .await
            .map_err(|e| UpgradeError::Backup(format!("verification of {} failed: {e:#}", record.id)))
    }

    /// Create and verify a backup. The returned record is always verified.
    pub async fn gate(
        &self,
        handle: &InstanceHandle,
        baseline: &Version,
    ) -> Result<BackupRecord, UpgradeError> {
        let mut record = self.create_backup(handle, baseline).await?;

        if !self.verify(&record).await? {
            warn!(backup = %record.id, "Backup failed verification");
            return Err(UpgradeError::Backup(format!(
                "backup {} is corrupted or incomplete (integrity marker missing)",
                record.id
            )));
        }

        record.verified = true;
        self.events
            .emit(PhaseEvent::new(Phase::BackupVerified).detail(record.id.clone()));
        info!(backup = %record.id, "Backup verified");
        Ok(record)
    }
}
