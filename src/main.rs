//! mup - MongoDB container upgrade tool.
//!
//! Upgrades a MongoDB server running in a container one release series at a
//! time:
//! - Verified backup before anything changes
//! - Container replacement per hop, keeping volume, network and environment
//! - Feature compatibility marker and health check after every hop
//! - Restore and relaunch of the baseline when a hop fails

mod backoff;
mod capability;
mod config;
mod docker;
mod error;
mod events;
mod instance;
mod lock;
mod mongo;
mod monitor;
mod orchestrator;
mod output;
mod phases;
mod run;
mod state;
#[cfg(test)]
mod testing;
mod types;
mod version;

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use dialoguer::Input;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use capability::{AdminInterface, BackupStore, ContainerRuntime, ServiceRegistry};
use config::{Args, Config, LogFormat};
use docker::{DockerCli, DockerRuntime, DockerServices};
use events::{EventEmitter, EventSink, FanoutSink, JsonlSink, LogSink};
use mongo::{MongoAdmin, MongoBackup, MongoShell};
use monitor::ResourceMonitor;
use orchestrator::{Capabilities, UpgradeOrchestrator, detect_baseline};
use state::StateStore;

/// Data directory of the official image.
const DATA_DIR: &str = "/data/db";

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    if let Err(e) = init_tracing(&config.log_level, config.log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    debug!("Starting mup - MongoDB Upgrade Tool");

    match run(config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber.
fn init_tracing(log_level: &str, format: LogFormat) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {}", e))?;

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}

/// Step names.
const STEPS: &[&str] = &["Check Prerequisites", "Review Plan", "Execute Upgrade"];

/// Prints a step header in "Phase [current/total]: name" format.
fn print_step(index: usize) {
    println!();
    println!(
        "{}",
        format!("Phase [{}/{}]: {}", index + 1, STEPS.len(), STEPS[index])
            .cyan()
            .bold()
    );
}

/// Main application logic. Returns the process exit code.
async fn run(mut config: Config) -> Result<i32> {
    let cli = DockerCli::default();
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(cli.clone(), DATA_DIR));
    let shell = Arc::new(MongoShell::new(
        Arc::clone(&runtime),
        config.credentials.take(),
    ));
    let admin: Arc<dyn AdminInterface> = Arc::new(MongoAdmin::new(Arc::clone(&shell)));
    let backup: Arc<dyn BackupStore> = Arc::new(MongoBackup::new(shell, config.backup_dir.clone()));
    let services: Arc<dyn ServiceRegistry> = Arc::new(DockerServices::new(cli));
    let caps = Capabilities {
        runtime: Arc::clone(&runtime),
        admin: Arc::clone(&admin),
        backup,
        services,
    };

    // Step 1: Check Prerequisites
    print_step(0);
    let baseline = match &config.baseline {
        Some(baseline) => baseline.clone(),
        None => {
            let detected = detect_baseline(
                runtime.as_ref(),
                admin.as_ref(),
                &config.container,
                config.admin_timeout,
            )
            .await?;
            println!("Detected baseline: {}", detected.to_string().bold());
            detected
        }
    };
    let run_config = Arc::new(config.resolve(baseline)?);

    let cancel = CancellationToken::new();
    let checker = UpgradeOrchestrator::new(
        Arc::clone(&run_config),
        caps.clone(),
        EventEmitter::new(Arc::new(LogSink)),
        cancel.clone(),
    );
    let preflight = checker.preflight().await?;
    println!("  {} {} is running {}", "✓".green(), run_config.container, run_config.baseline);

    // Step 2: Review Plan
    print_step(1);
    output::print_plan(&run_config, &preflight);

    if config.dry_run {
        println!("{}", "[DRY RUN] Prerequisites passed, nothing was changed.".yellow());
        return Ok(0);
    }

    if !config.yes {
        println!(
            "{}",
            "This will replace the container and rewrite its compatibility marker."
                .yellow()
                .bold()
        );
        let confirmation: String = Input::new()
            .with_prompt(format!("Type {} to confirm", "Yes".green().bold()))
            .interact_text()?;
        if confirmation != "Yes" {
            println!(
                "{}",
                "Upgrade cancelled. You must type 'Yes' to proceed.".red()
            );
            return Ok(1);
        }
    }

    // Step 3: Execute Upgrade
    print_step(2);
    let state = StateStore::new(run_config.state_dir.clone());
    fs::create_dir_all(state.dir())
        .with_context(|| format!("Failed to create {}", state.dir().display()))?;

    let mut sinks: Vec<Arc<dyn EventSink>> = vec![
        Arc::new(JsonlSink::open(state.events_path())?),
        Arc::new(LogSink),
    ];
    let monitor = if config.monitor {
        fs::create_dir_all(&run_config.backup_dir).with_context(|| {
            format!("Failed to create {}", run_config.backup_dir.display())
        })?;
        let disk_path = fs::canonicalize(&run_config.backup_dir)
            .unwrap_or_else(|_| run_config.backup_dir.clone());
        let handle = ResourceMonitor::new(
            Arc::clone(&runtime),
            run_config.container.clone(),
            state.resources_path(),
            disk_path,
            config.monitor_interval,
        )
        .spawn()?;
        sinks.push(handle.sink());
        Some(handle)
    } else {
        None
    };

    let orchestrator = UpgradeOrchestrator::new(
        Arc::clone(&run_config),
        caps,
        EventEmitter::new(Arc::new(FanoutSink::new(sinks))),
        cancel.clone(),
    );

    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Abort requested, stopping after the current step");
            println!(
                "{}",
                "Abort requested. The current step finishes first, then the run rolls back."
                    .yellow()
            );
            cancel.cancel();
        }
    });

    let report = orchestrator.run().await;
    watcher.abort();

    if let Some(monitor) = monitor {
        match monitor.stop().await {
            Ok(samples) => debug!(samples, "Resource samples written"),
            Err(e) => warn!("{:#}", e),
        }
    }

    output::print_report(&report);
    Ok(report.exit_code())
}
