//! CLI configuration and argument parsing.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::backoff::Backoff;
use crate::error::UpgradeError;
use crate::mongo::Credentials;
use crate::run::{VersionStep, steps_from_versions, validate_path};
use crate::version::{CompatMarker, Version, calculate_upgrade_path, parse_target};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Values that mean "somebody forgot to fill this in".
const PLACEHOLDERS: &[&str] = &["CHANGE_ME", "CHANGEME", "TODO", "xxx"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// MongoDB container upgrade tool.
///
/// Walks a containerized MongoDB server through every intermediate release
/// series to the target, behind a verified backup, and restores the
/// baseline if any hop fails.
#[derive(Parser, Debug, Clone)]
#[command(name = "mup")]
#[command(about = "Sequential MongoDB container upgrades with backup and rollback")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Name of the MongoDB container to upgrade
    #[arg(short, long, env = "MUP_CONTAINER")]
    pub container: Option<String>,

    /// Image repository used for every hop
    #[arg(long, env = "MUP_IMAGE")]
    pub image: Option<String>,

    /// Version the instance runs now (detected when omitted)
    #[arg(short, long)]
    pub baseline: Option<String>,

    /// Target series or version (e.g., 7.0 or 7.0.2)
    #[arg(short, long, conflicts_with = "path")]
    pub target: Option<String>,

    /// Explicit comma-separated upgrade path (e.g., 4.2.24,4.4.29)
    #[arg(long, value_delimiter = ',')]
    pub path: Vec<String>,

    /// YAML plan file; command line flags override its values
    #[arg(long, value_name = "FILE")]
    pub plan: Option<PathBuf>,

    /// Regex selecting dependent containers to pause during the upgrade
    #[arg(long, env = "MUP_DEPENDENT_PATTERN")]
    pub dependent_pattern: Option<String>,

    /// Directory for the lock, event log, samples and run archive
    #[arg(long, default_value = ".mup", env = "MUP_STATE_DIR")]
    pub state_dir: PathBuf,

    /// Host directory receiving backups
    #[arg(long, default_value = "backups", env = "MUP_BACKUP_DIR")]
    pub backup_dir: PathBuf,

    /// Seconds between readiness probes
    #[arg(long, default_value = "2")]
    pub ready_interval: u64,

    /// Readiness probes before a hop is declared failed
    #[arg(long, default_value = "60")]
    pub ready_attempts: u32,

    /// Timeout in seconds for each admin command
    #[arg(long, default_value = "30")]
    pub admin_timeout: u64,

    /// Check prerequisites and show the plan without executing
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// Take and verify a backup, then stop
    #[arg(long, default_value = "false")]
    pub backup_only: bool,

    /// Debug logging
    #[arg(short, long, default_value = "false")]
    pub verbose: bool,

    /// Record host and instance resource samples
    #[arg(long, default_value = "false")]
    pub monitor: bool,

    /// Also sample resources every N seconds
    #[arg(long, requires = "monitor")]
    pub monitor_interval: Option<u64>,

    /// Skip confirmation prompts (non-interactive mode)
    #[arg(short, long, default_value = "false")]
    pub yes: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MUP_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "MUP_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Username for admin commands (defaults to the container's root user)
    #[arg(long, env = "MUP_MONGO_USERNAME", hide_env_values = true)]
    pub username: Option<String>,

    /// Password for admin commands
    #[arg(long, env = "MUP_MONGO_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

/// One hop in a plan file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanStep {
    pub version: String,
    /// Marker to set after the hop; defaults to the version's series.
    #[serde(default)]
    pub compatibility: Option<String>,
    #[serde(default = "default_true")]
    pub set_compatibility: bool,
}

const fn default_true() -> bool {
    true
}

/// YAML plan file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    pub container: Option<String>,
    pub image: Option<String>,
    pub baseline: Option<String>,
    pub target: Option<String>,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    pub dependent_pattern: Option<String>,
}

impl PlanFile {
    pub fn load(path: &Path) -> Result<Self, UpgradeError> {
        let content = fs::read_to_string(path).map_err(|e| {
            UpgradeError::Configuration(format!("cannot read plan {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| UpgradeError::Configuration(format!("invalid plan {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}

/// How the upgrade path is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSource {
    /// Explicit hops, already numbered.
    Steps(Vec<VersionStep>),
    /// Target series or version, expanded against the release table.
    Target(String),
}

/// Application configuration derived from CLI args and the plan file.
#[derive(Debug)]
pub struct Config {
    pub container: String,
    pub repository: String,
    pub baseline: Option<Version>,
    pub path: PathSource,
    pub dependent_pattern: Option<String>,
    pub state_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub ready_interval: Duration,
    pub ready_attempts: u32,
    pub admin_timeout: Duration,
    pub dry_run: bool,
    pub backup_only: bool,
    pub monitor: bool,
    pub monitor_interval: Option<Duration>,
    pub yes: bool,
    pub log_level: String,
    pub log_format: LogFormat,
    pub credentials: Option<Credentials>,
}

/// Immutable settings of one run, shared by the orchestrator components.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub container: String,
    pub repository: String,
    pub baseline: Version,
    pub steps: Vec<VersionStep>,
    pub dependent_pattern: Option<String>,
    pub state_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub readiness: Backoff,
    pub admin_timeout: Duration,
    pub backup_only: bool,
    pub show_progress: bool,
}

impl RunConfig {
    /// Final version of the path, or the baseline for an empty one.
    pub fn target(&self) -> &Version {
        self.steps.last().map_or(&self.baseline, |s| &s.version)
    }
}

impl Config {
    /// Create config from CLI arguments, merging the plan file if given.
    pub fn from_args(args: Args) -> Result<Self, UpgradeError> {
        let plan = match &args.plan {
            Some(path) => PlanFile::load(path)?,
            None => PlanFile::default(),
        };
        Self::merge(args, plan)
    }

    fn merge(args: Args, plan: PlanFile) -> Result<Self, UpgradeError> {
        let container = args
            .container
            .or(plan.container)
            .ok_or_else(|| UpgradeError::Configuration("--container is required".to_string()))?;
        check_identifier("container", &container)?;

        let repository = args
            .image
            .or(plan.image)
            .unwrap_or_else(|| "mongo".to_string());
        check_identifier("image", &repository)?;

        let baseline = args
            .baseline
            .or(plan.baseline)
            .map(|b| b.parse::<Version>())
            .transpose()?;

        let path = if !args.path.is_empty() {
            let versions = args
                .path
                .iter()
                .map(|v| v.parse::<Version>())
                .collect::<Result<Vec<_>, _>>()?;
            PathSource::Steps(steps_from_versions(versions))
        } else if let Some(target) = args.target {
            PathSource::Target(target)
        } else if !plan.steps.is_empty() {
            if plan.target.is_some() {
                return Err(UpgradeError::Configuration(
                    "plan declares both target and steps".to_string(),
                ));
            }
            PathSource::Steps(plan_steps(&plan.steps)?)
        } else if let Some(target) = plan.target {
            PathSource::Target(target)
        } else {
            return Err(UpgradeError::Configuration(
                "one of --target, --path or a plan with steps is required".to_string(),
            ));
        };
        if let PathSource::Target(target) = &path {
            parse_target(target)?;
        }

        let dependent_pattern = args
            .dependent_pattern
            .or(plan.dependent_pattern)
            .filter(|p| !p.trim().is_empty());

        if args.ready_attempts == 0 {
            return Err(UpgradeError::Configuration(
                "--ready-attempts must be at least 1".to_string(),
            ));
        }
        if args.admin_timeout == 0 {
            return Err(UpgradeError::Configuration(
                "--admin-timeout must be at least 1 second".to_string(),
            ));
        }

        let credentials = match (args.username, args.password) {
            (Some(user), Some(password)) => {
                check_identifier("username", &user)?;
                Some(Credentials::new(user, password))
            }
            (None, None) => None,
            _ => {
                return Err(UpgradeError::Configuration(
                    "username and password must be given together".to_string(),
                ));
            }
        };

        let log_level = if args.verbose {
            "debug".to_string()
        } else {
            args.log_level
        };

        Ok(Self {
            container,
            repository,
            baseline,
            path,
            dependent_pattern,
            state_dir: args.state_dir,
            backup_dir: args.backup_dir,
            ready_interval: Duration::from_secs(args.ready_interval),
            ready_attempts: args.ready_attempts,
            admin_timeout: Duration::from_secs(args.admin_timeout),
            dry_run: args.dry_run,
            backup_only: args.backup_only,
            monitor: args.monitor,
            monitor_interval: args.monitor_interval.map(Duration::from_secs),
            yes: args.yes,
            log_level,
            log_format: args.log_format,
            credentials,
        })
    }

    /// Fix the baseline and expand the path into concrete steps.
    pub fn resolve(&self, baseline: Version) -> Result<RunConfig, UpgradeError> {
        let steps = match &self.path {
            PathSource::Steps(steps) => steps.clone(),
            PathSource::Target(target) => {
                steps_from_versions(calculate_upgrade_path(&baseline, target)?)
            }
        };
        validate_path(Some(&baseline), &steps)?;

        Ok(RunConfig {
            container: self.container.clone(),
            repository: self.repository.clone(),
            baseline,
            steps,
            dependent_pattern: self.dependent_pattern.clone(),
            state_dir: self.state_dir.clone(),
            backup_dir: self.backup_dir.clone(),
            readiness: Backoff::new(self.ready_interval, self.ready_attempts),
            admin_timeout: self.admin_timeout,
            backup_only: self.backup_only,
            show_progress: true,
        })
    }
}

fn plan_steps(steps: &[PlanStep]) -> Result<Vec<VersionStep>, UpgradeError> {
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let version: Version = step.version.parse()?;
            let compatibility = match (&step.compatibility, step.set_compatibility) {
                (_, false) => None,
                (Some(marker), true) => Some(marker.parse::<CompatMarker>()?),
                (None, true) => Some(version.marker()),
            };
            Ok(VersionStep::new(i + 1, version, compatibility))
        })
        .collect()
}

/// Reject unset or placeholder identifiers.
fn check_identifier(what: &str, value: &str) -> Result<(), UpgradeError> {
    let trimmed = value.trim();
    let placeholder = trimmed.is_empty()
        || PLACEHOLDERS.iter().any(|p| trimmed.eq_ignore_ascii_case(p))
        || (trimmed.starts_with('<') && trimmed.ends_with('>'));
    if placeholder {
        return Err(UpgradeError::Configuration(format!(
            "{what} is unset or a placeholder ('{value}')"
        )));
    }
    Ok(())
}
