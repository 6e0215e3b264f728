//! [`ServiceRegistry`] over docker containers: pausing a service stops its
//! container, resuming starts it again.

use anyhow::Result;
use async_trait::async_trait;

use super::cli::DockerCli;
use crate::capability::ServiceRegistry;

pub struct DockerServices {
    cli: DockerCli,
}

impl DockerServices {
    pub fn new(cli: DockerCli) -> Self {
        Self { cli }
    }
}

fn parse_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ServiceRegistry for DockerServices {
    async fn list(&self) -> Result<Vec<String>> {
        let output = self.cli.checked(&["ps", "--format", "{{.Names}}"]).await?;
        Ok(parse_names(&output))
    }

    async fn pause(&self, name: &str) -> Result<()> {
        self.cli.checked(&["stop", name]).await.map(|_| ())
    }

    async fn resume(&self, name: &str) -> Result<()> {
        self.cli.checked(&["start", name]).await.map(|_| ())
    }
}
