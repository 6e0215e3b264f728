//! [`ContainerRuntime`] over the docker CLI.

use std::path::Path;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::debug;

use super::cli::{DockerCli, is_not_found};
use super::inspect::{parse_inspect, parse_stats};
use crate::capability::ContainerRuntime;
use crate::instance::{InstanceDescriptor, InstanceHandle, LaunchSpec};
use crate::types::{ExecOutput, InstanceStats, TaskSpec};

/// Seconds docker waits for a graceful stop before killing.
const STOP_TIMEOUT_SECS: &str = "60";

pub struct DockerRuntime {
    cli: DockerCli,
    data_dir: String,
}

impl DockerRuntime {
    /// `data_dir` is where the data volume is mounted inside the container.
    pub fn new(cli: DockerCli, data_dir: impl Into<String>) -> Self {
        Self {
            cli,
            data_dir: data_dir.into(),
        }
    }
}

/// Arguments of `docker run` for a launch spec.
pub fn run_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--network".to_string(),
        spec.network.network.clone(),
        "--volume".to_string(),
        format!("{}:{}", spec.volume.source, spec.volume.target),
    ];
    for mount in &spec.mounts {
        args.push("--volume".to_string());
        args.push(format!("{}:{}", mount.source, mount.target));
    }
    for port in &spec.network.ports {
        let container_port = port.container_port.trim_end_matches("/tcp");
        let publish = match &port.host_ip {
            Some(ip) => format!("{ip}:{}:{container_port}", port.host_port),
            None => format!("{}:{container_port}", port.host_port),
        };
        args.push("--publish".to_string());
        args.push(publish);
    }
    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args.extend(spec.args.iter().cloned());
    args
}

/// Arguments of `docker run --rm` for a one-shot task.
pub fn task_args(task: &TaskSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--volume".to_string(),
        format!("{}:{}", task.volume.source, task.volume.target),
    ];
    for mount in &task.mounts {
        args.push("--volume".to_string());
        args.push(format!("{}:{}", mount.source, mount.target));
    }
    args.push(task.image.clone());
    args.extend(task.command.iter().cloned());
    args
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<InstanceDescriptor>> {
        let output = self.cli.run(&["container", "inspect", name]).await?;
        if is_not_found(&output) {
            return Ok(None);
        }
        let json = output.into_stdout("docker container inspect")?;
        parse_inspect(&json, &self.data_dir)
    }

    async fn create(&self, spec: &LaunchSpec) -> Result<InstanceHandle> {
        let id = self.cli.checked(&run_args(spec)).await?;
        debug!(container = %id.trim(), image = %spec.image, "Container created");

        match self.inspect(&spec.name).await? {
            Some(desc) => Ok(desc.handle()),
            None => bail!("container {} vanished right after creation", spec.name),
        }
    }

    async fn stop(&self, handle: &InstanceHandle) -> Result<()> {
        let output = self
            .cli
            .run(&["stop", "--time", STOP_TIMEOUT_SECS, handle.name.as_str()])
            .await?;
        if is_not_found(&output) {
            return Ok(());
        }
        output.into_stdout("docker stop").map(|_| ())
    }

    async fn remove(&self, handle: &InstanceHandle) -> Result<()> {
        let output = self.cli.run(&["rm", "--force", handle.name.as_str()]).await?;
        if is_not_found(&output) {
            return Ok(());
        }
        output.into_stdout("docker rm").map(|_| ())
    }

    async fn is_running(&self, handle: &InstanceHandle) -> Result<bool> {
        let output = self
            .cli
            .run(&[
                "container",
                "inspect",
                "--format",
                "{{.State.Running}}",
                handle.name.as_str(),
            ])
            .await?;
        if is_not_found(&output) {
            return Ok(false);
        }
        Ok(output.into_stdout("docker container inspect")?.trim() == "true")
    }

    async fn exec(&self, handle: &InstanceHandle, command: &[String]) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string(), handle.name.clone()];
        args.extend(command.iter().cloned());
        self.cli.run(&args).await
    }

    async fn logs(&self, handle: &InstanceHandle, tail: usize) -> Result<String> {
        let tail = tail.to_string();
        let output = self
            .cli
            .run(&["logs", "--tail", tail.as_str(), handle.name.as_str()])
            .await?;
        let mut logs = output.stdout;
        logs.push_str(&output.stderr);
        Ok(logs)
    }

    async fn run_task(&self, task: &TaskSpec) -> Result<ExecOutput> {
        self.cli.run(&task_args(task)).await
    }

    async fn copy_out(&self, handle: &InstanceHandle, source: &str, dest: &Path) -> Result<()> {
        let from = format!("{}:{}", handle.name, source);
        let to = dest.display().to_string();
        self.cli.checked(&["cp", from.as_str(), to.as_str()]).await.map(|_| ())
    }

    async fn stats(&self, handle: &InstanceHandle) -> Result<Option<InstanceStats>> {
        let output = self
            .cli
            .run(&[
                "stats",
                "--no-stream",
                "--format",
                "{{json .}}",
                handle.name.as_str(),
            ])
            .await?;
        if !output.success() {
            return Ok(None);
        }
        parse_stats(&output.stdout).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{LaunchSpec, Mount, VolumeBinding, fixtures};

    #[test]
    fn test_run_args_keep_identity() {
        let spec = LaunchSpec::from_descriptor(&fixtures::descriptor("mongo:4.0.9"))
            .unwrap()
            .for_version("mongo", &"4.2.24".parse().unwrap());
        let args = run_args(&spec);

        assert_eq!(&args[..4], ["run", "--detach", "--name", "mongodb"]);
        let joined = args.join(" ");
        assert!(joined.contains("--network backend"));
        assert!(joined.contains("--volume mongo-data:/data/db"));
        assert!(joined.contains("--volume /srv/backups:/backup"));
        assert!(joined.contains("--publish 27017:27017"));
        assert!(joined.contains("--env MONGO_INITDB_ROOT_USERNAME=root"));
        assert!(!joined.contains("MONGO_VERSION"));
        assert!(joined.ends_with("mongo:4.2.24 --bind_ip_all"));
    }

    #[test]
    fn test_task_args() {
        let task = TaskSpec {
            image: "mongo:4.0.9".to_string(),
            volume: VolumeBinding {
                source: "mongo-data".to_string(),
                target: "/data/db".to_string(),
            },
            mounts: vec![Mount {
                source: "/srv/backups".to_string(),
                target: "/backup".to_string(),
            }],
            command: vec!["bash".to_string(), "-c".to_string(), "true".to_string()],
        };
        assert_eq!(
            task_args(&task),
            vec![
                "run",
                "--rm",
                "--volume",
                "mongo-data:/data/db",
                "--volume",
                "/srv/backups:/backup",
                "mongo:4.0.9",
                "bash",
                "-c",
                "true",
            ]
        );
    }
}
