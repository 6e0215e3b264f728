//! Feature compatibility marker handling after each hop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::backoff::deadline;
use crate::capability::AdminInterface;
use crate::error::UpgradeError;
use crate::events::{EventEmitter, Phase, PhaseEvent};
use crate::instance::InstanceHandle;
use crate::run::VersionStep;
use crate::version::CompatMarker;

pub struct CompatibilityController {
    admin: Arc<dyn AdminInterface>,
    timeout: Duration,
    events: EventEmitter,
}

impl CompatibilityController {
    pub fn new(admin: Arc<dyn AdminInterface>, timeout: Duration, events: EventEmitter) -> Self {
        Self {
            admin,
            timeout,
            events,
        }
    }

    /// Set the marker declared by `step` and read it back.
    ///
    /// Returns the applied marker, or `None` when the step declares none.
    pub async fn apply(
        &self,
        handle: &InstanceHandle,
        step: &VersionStep,
    ) -> Result<Option<CompatMarker>, UpgradeError> {
        let Some(marker) = step.compatibility else {
            warn!(
                step = step.position,
                version = %step.version,
                "No compatibility marker declared for this step, leaving it unchanged"
            );
            self.events.emit(
                PhaseEvent::new(Phase::CompatibilitySkipped)
                    .step(step.position)
                    .version(&step.version),
            );
            return Ok(None);
        };

        let confirm = marker.requires_confirm();
        info!(step = step.position, %marker, confirm, "Setting compatibility marker");
        deadline(
            self.timeout,
            "setFeatureCompatibilityVersion",
            self.admin.set_compatibility(handle, marker, confirm),
        )
        .await
        .map_err(|e| UpgradeError::compatibility(marker, format!("{e:#}")))?;

        let observed = self
            .read(handle)
            .await
            .map_err(|e| UpgradeError::compatibility(marker, e))?;
        if observed != marker {
            return Err(UpgradeError::compatibility(
                marker,
                format!("instance reports {observed} after the write"),
            ));
        }

        self.events.emit(
            PhaseEvent::new(Phase::CompatibilitySet)
                .step(step.position)
                .version(&step.version)
                .detail(marker.to_string()),
        );
        Ok(Some(marker))
    }

    /// Current marker of the instance.
    pub async fn read(&self, handle: &InstanceHandle) -> Result<CompatMarker, String> {
        deadline(
            self.timeout,
            "featureCompatibilityVersion query",
            self.admin.get_compatibility(handle),
        )
        .await
        .map_err(|e| format!("{e:#}"))
    }
}
