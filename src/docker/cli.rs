//! Thin wrapper around the `docker` command line.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

use crate::types::ExecOutput;

/// Stderr fragments docker prints for missing containers.
const NOT_FOUND_MARKERS: &[&str] = &["No such container", "No such object"];

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run `docker <args>` and capture its output, whatever the exit code.
    pub async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<ExecOutput> {
        let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
        debug!(command = %format!("{} {}", self.binary, args.join(" ")), "Running docker");

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.binary))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and return stdout, failing on a non-zero exit code.
    pub async fn checked<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let context = format!(
            "docker {}",
            args.first().map(|a| a.as_ref()).unwrap_or_default()
        );
        self.run(args).await?.into_stdout(&context)
    }
}

/// Returns true if a failed docker call only says the container is absent.
pub fn is_not_found(output: &ExecOutput) -> bool {
    !output.success() && NOT_FOUND_MARKERS.iter().any(|m| output.stderr.contains(m))
}
