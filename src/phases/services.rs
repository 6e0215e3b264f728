//! Pausing and resuming the services that talk to the instance.

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use regex::Regex;
use tracing::{info, warn};

use crate::capability::ServiceRegistry;
use crate::error::UpgradeError;
use crate::events::{EventEmitter, Phase, PhaseEvent};

/// Selects dependent services by name, never the managed instance itself.
#[derive(Debug, Clone)]
pub struct ServiceMatcher {
    pattern: Regex,
    instance: String,
}

impl ServiceMatcher {
    pub fn new(pattern: &str, instance: impl Into<String>) -> Result<Self, UpgradeError> {
        let pattern = Regex::new(pattern).map_err(|e| {
            UpgradeError::Configuration(format!("invalid dependent service pattern '{pattern}': {e}"))
        })?;
        Ok(Self {
            pattern,
            instance: instance.into(),
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        name != self.instance && self.pattern.is_match(name)
    }
}

pub struct DependentServiceController {
    registry: Arc<dyn ServiceRegistry>,
    matcher: Option<ServiceMatcher>,
    paused: Mutex<Vec<String>>,
    events: EventEmitter,
}

impl DependentServiceController {
    /// Without a matcher the controller pauses nothing.
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        matcher: Option<ServiceMatcher>,
        events: EventEmitter,
    ) -> Self {
        Self {
            registry,
            matcher,
            paused: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Services paused by this controller and not yet resumed.
    pub fn paused(&self) -> Vec<String> {
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pause every running service the matcher selects.
    ///
    /// If one pause fails, the services paused so far are resumed again
    /// before the error is returned.
    pub async fn pause_all(&self) -> Result<Vec<String>, UpgradeError> {
        let Some(matcher) = &self.matcher else {
            return Ok(Vec::new());
        };

        let running = self
            .registry
            .list()
            .await
            .map_err(|e| UpgradeError::Prerequisite(format!("failed to list services: {e:#}")))?;
        let targets: Vec<String> = running.into_iter().filter(|n| matcher.matches(n)).collect();

        for name in &targets {
            if let Err(e) = self.registry.pause(name).await {
                let err = UpgradeError::Prerequisite(format!("failed to pause {name}: {e:#}"));
                if let Err(resume_err) = self.resume_all().await {
                    warn!("{}", resume_err);
                }
                return Err(err);
            }
            info!(service = %name, "Paused dependent service");
            self.paused
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(name.clone());
        }

        if !targets.is_empty() {
            self.events
                .emit(PhaseEvent::new(Phase::ServicesPaused).detail(targets.join(",")));
        }
        Ok(targets)
    }

    /// Resume every service this controller paused, concurrently. Each is
    /// resumed once; failures are collected and reported together.
    pub async fn resume_all(&self) -> Result<Vec<String>, UpgradeError> {
        let paused = std::mem::take(&mut *self.paused.lock().unwrap_or_else(PoisonError::into_inner));
        if paused.is_empty() {
            return Ok(Vec::new());
        }

        let results = join_all(paused.iter().map(|name| self.registry.resume(name))).await;

        let mut resumed = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in paused.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(service = %name, "Resumed dependent service");
                    resumed.push(name);
                }
                Err(e) => failures.push(format!("{name}: {e:#}")),
            }
        }

        self.events
            .emit(PhaseEvent::new(Phase::ServicesResumed).detail(resumed.join(",")));
        if failures.is_empty() {
            Ok(resumed)
        } else {
            Err(UpgradeError::Prerequisite(format!(
                "failed to resume dependent services: {}",
                failures.join("; ")
            )))
        }
    }
}
