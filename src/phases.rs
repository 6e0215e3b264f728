//! The components driving one upgrade run, one module per phase.

pub mod backup;
pub mod compat;
pub mod health;
pub mod rollback;
pub mod services;
pub mod step;

pub use backup::BackupCoordinator;
pub use compat::CompatibilityController;
pub use health::HealthChecker;
pub use rollback::{RollbackCoordinator, RollbackOutcome};
pub use services::{DependentServiceController, ServiceMatcher};
pub use step::{StepExecutor, StepSettings, StepState};
