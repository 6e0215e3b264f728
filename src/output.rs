//! Console output for plans, step progress and run reports.

use colored::Colorize;

use crate::config::RunConfig;
use crate::orchestrator::{Preflight, RollbackReport, RunReport};
use crate::run::{RunStatus, VersionStep};
use crate::version::Version;

/// Rough wall time of one hop, for the plan estimate.
const MINUTES_PER_STEP: usize = 3;

/// Describe what happens after a step is healthy.
fn marker_label(step: &VersionStep) -> String {
    match step.compatibility {
        Some(marker) if marker.requires_confirm() => format!("compatibility {marker} (confirm)"),
        Some(marker) => format!("compatibility {marker}"),
        None => "compatibility unchanged".to_string(),
    }
}

/// Print the upgrade plan to console.
pub fn print_plan(config: &RunConfig, preflight: &Preflight) {
    println!(
        "{}",
        format!(
            "Upgrade Plan: {} ({} -> {})",
            config.container,
            config.baseline,
            config.target()
        )
        .bold()
    );
    println!("{}", "=".repeat(60));

    println!("{}", "Instance".cyan().bold());
    println!("  Image:   {}", preflight.descriptor.image);
    println!(
        "  Volume:  {} -> {}",
        preflight.template.volume.source, preflight.template.volume.target
    );
    println!("  Network: {}", preflight.template.network.network);
    for port in &preflight.template.network.ports {
        println!(
            "  Port:    {}:{} -> {}",
            port.host_ip.as_deref().unwrap_or("0.0.0.0"),
            port.host_port,
            port.container_port
        );
    }

    println!();
    println!("{}", "Phase 1: Backup".cyan().bold());
    println!("  Target directory: {}", config.backup_dir.display());
    match &config.dependent_pattern {
        Some(pattern) => println!("  Dependent services matching '{}' are paused", pattern),
        None => println!("  {}", "No dependent services selected".dimmed()),
    }

    println!();
    if config.backup_only || preflight.steps.is_empty() {
        println!("{}", "Phase 2: Upgrade Steps [SKIPPED]".cyan().bold());
        if preflight.steps.is_empty() {
            println!("  Current version: {} (no upgrade needed)", config.baseline);
        }
    } else {
        println!("{}", "Phase 2: Upgrade Steps".cyan().bold());
        let mut previous = &config.baseline;
        for step in &preflight.steps {
            println!(
                "  Step {}: {} -> {} ({})",
                step.position,
                previous,
                step.version,
                marker_label(step)
            );
            if step.compatibility.is_none() {
                println!(
                    "    {}",
                    "Warning: marker stays at the previous series".yellow()
                );
            }
            previous = &step.version;
        }
        println!();
        println!(
            "Estimated total time: ~{} min",
            preflight.steps.len() * MINUTES_PER_STEP
        );
    }
    println!();
}

/// Prints a step header in "[Step current/total] from -> to" format.
pub fn print_step_header(position: usize, total: usize, from: &Version, to: &Version) {
    println!();
    println!(
        "{}",
        format!("[Step {}/{}] {} -> {}", position, total, from, to).bold()
    );
}

pub fn print_step_done(version: &Version) {
    println!("  {} {} healthy", "✓".green(), version);
}

/// Print the terminal report of a run.
pub fn print_report(report: &RunReport) {
    let run = &report.run;
    println!();
    println!("{}", "=".repeat(60));

    let headline = format!(
        "{}: {} ({} of {} step(s) completed)",
        report.status(),
        run.instance,
        run.current_step_index(),
        run.steps.len()
    );
    match report.status() {
        RunStatus::Succeeded => println!("{}", headline.green().bold()),
        RunStatus::RolledBack => println!("{}", headline.yellow().bold()),
        _ => println!("{}", headline.red().bold()),
    }

    println!("  Baseline:      {}", run.baseline);
    println!("  Now running:   {}", report.final_version());
    if let Some(marker) = report.final_marker {
        println!("  Compatibility: {}", marker);
    }
    if let Some(backup) = &report.backup {
        println!("  Backup:        {} ({})", backup.id, backup.path.display());
    }
    if let Some(e) = &report.error {
        println!("  {} {}", format!("{}:", e.kind()).red(), e);
    }

    match &report.rollback {
        Some(RollbackReport::Completed(outcome)) => {
            println!(
                "  {} Rolled back to {} from backup {}",
                "↺".yellow(),
                outcome.restored_version,
                outcome.backup_id
            );
            if !outcome.resumed.is_empty() {
                println!("  Resumed: {}", outcome.resumed.join(", "));
            }
        }
        Some(RollbackReport::Failed(e)) => {
            println!("  {} {}", "Rollback failed:".red().bold(), e);
            println!(
                "  {}",
                "Dependent services are still paused. Restore manually from the backup above."
                    .yellow()
            );
        }
        None => {}
    }
    println!("{}", "=".repeat(60));
}
