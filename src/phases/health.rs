//! Post-step health diagnostic.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backoff::deadline;
use crate::capability::AdminInterface;
use crate::error::UpgradeError;
use crate::events::{EventEmitter, Phase, PhaseEvent};
use crate::instance::InstanceHandle;
use crate::types::HealthReport;
use crate::version::Version;

pub struct HealthChecker {
    admin: Arc<dyn AdminInterface>,
    timeout: Duration,
    events: EventEmitter,
}

impl HealthChecker {
    pub fn new(admin: Arc<dyn AdminInterface>, timeout: Duration, events: EventEmitter) -> Self {
        Self {
            admin,
            timeout,
            events,
        }
    }

    /// Run the diagnostic and judge it against the expected version.
    pub async fn check(
        &self,
        handle: &InstanceHandle,
        expected: &Version,
    ) -> Result<HealthReport, UpgradeError> {
        let report = deadline(self.timeout, "diagnostic", self.admin.run_diagnostic(handle))
            .await
            .map_err(|e| UpgradeError::health(expected, format!("{e:#}")))?;

        judge(&report, expected).map_err(|details| UpgradeError::health(expected, details))?;

        info!(
            version = %expected,
            databases = report.databases.len(),
            collections = report.total_collections(),
            documents = report.total_documents(),
            uptime_seconds = report.uptime_seconds,
            "Health check passed"
        );
        self.events.emit(
            PhaseEvent::new(Phase::HealthChecked)
                .version(expected)
                .detail(format!(
                    "{} database(s), {} collection(s), {} document(s)",
                    report.databases.len(),
                    report.total_collections(),
                    report.total_documents()
                )),
        );
        Ok(report)
    }
}

/// A report passes when it is ok and carries exactly the expected version.
pub fn judge(report: &HealthReport, expected: &Version) -> Result<(), String> {
    if !report.ok {
        return Err(format!("diagnostic reported a fault: {}", report.diagnostic));
    }
    let reported = report.version.trim();
    if reported.is_empty() {
        return Err("diagnostic carries no server version".to_string());
    }
    match reported.parse::<Version>() {
        Ok(actual) if actual == *expected => Ok(()),
        _ => Err(format!("diagnostic reports version {reported}")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::events::MemorySink;
    use crate::testing::FakeService;

    fn report(ok: bool, version: &str) -> HealthReport {
        HealthReport {
            ok,
            version: version.to_string(),
            uptime_seconds: 1,
            databases: BTreeMap::new(),
            diagnostic: "{\"ok\":0}".to_string(),
        }
    }

    #[test]
    fn test_judge() {
        let expected = Version::new(5, 0, 31);
        assert!(judge(&report(true, "5.0.31"), &expected).is_ok());
        assert!(judge(&report(false, "5.0.31"), &expected).unwrap_err().contains("fault"));
        assert!(judge(&report(true, ""), &expected).unwrap_err().contains("no server version"));
        assert!(judge(&report(true, "4.4.29"), &expected).unwrap_err().contains("4.4.29"));
    }

    #[tokio::test]
    async fn test_check_passes_on_healthy_instance() {
        let fake = FakeService::new("5.0.31");
        let memory = Arc::new(MemorySink::default());
        let checker = HealthChecker::new(fake.clone(), Duration::from_secs(1), EventEmitter::new(memory.clone()));
        let handle = fake.state().container.as_ref().unwrap().handle.clone();

        let report = checker.check(&handle, &Version::new(5, 0, 31)).await.unwrap();
        assert_eq!(report.total_documents(), 42);
        assert_eq!(memory.phases(), vec![Phase::HealthChecked]);
    }

    #[tokio::test]
    async fn test_check_maps_diagnostic_fault() {
        let fake = FakeService::new("5.0.31");
        fake.state().unhealthy.push("5.0.31".to_string());
        let checker = HealthChecker::new(
            fake.clone(),
            Duration::from_secs(1),
            EventEmitter::new(Arc::new(MemorySink::default())),
        );
        let handle = fake.state().container.as_ref().unwrap().handle.clone();

        let err = checker.check(&handle, &Version::new(5, 0, 31)).await.unwrap_err();
        assert_eq!(err.kind(), "HealthCheckError");
        assert!(err.to_string().contains("node is recovering"));
    }
}
