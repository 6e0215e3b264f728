//! [`AdminInterface`] for MongoDB.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;

use super::shell::MongoShell;
use crate::capability::AdminInterface;
use crate::instance::InstanceHandle;
use crate::types::{DatabaseStats, HealthReport};
use crate::version::CompatMarker;

/// Per-database counts over every user database. Works in both shells.
const DIAGNOSTIC_SCRIPT: &str = r#"
var status = db.serverStatus();
var skip = ["admin", "config", "local"];
var out = { ok: status.ok === 1, version: status.version, uptime: Number(status.uptime), databases: {} };
db.adminCommand({ listDatabases: 1 }).databases.forEach(function (d) {
  if (skip.indexOf(d.name) !== -1) { return; }
  var sibling = db.getSiblingDB(d.name);
  var names = sibling.getCollectionNames();
  var documents = 0;
  names.forEach(function (c) { documents += Number(sibling.getCollection(c).countDocuments({})); });
  out.databases[d.name] = { collections: names.length, documents: documents };
});
print(JSON.stringify(out));
"#;

#[derive(Debug, Deserialize)]
struct CommandReply {
    ok: f64,
    #[serde(default)]
    errmsg: Option<String>,
}

impl CommandReply {
    fn check(self, command: &str) -> Result<()> {
        if self.ok == 1.0 {
            Ok(())
        } else {
            bail!(
                "{} failed: {}",
                command,
                self.errmsg.unwrap_or_else(|| "no error message".to_string())
            )
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeatureCompatibilityReply {
    feature_compatibility_version: FeatureCompatibilityVersion,
}

#[derive(Debug, Deserialize)]
struct FeatureCompatibilityVersion {
    version: String,
}

#[derive(Debug, Deserialize)]
struct DiagnosticOutput {
    ok: bool,
    #[serde(default)]
    version: String,
    #[serde(default)]
    uptime: f64,
    #[serde(default)]
    databases: BTreeMap<String, DatabaseStats>,
}

pub struct MongoAdmin {
    shell: Arc<MongoShell>,
}

impl MongoAdmin {
    pub fn new(shell: Arc<MongoShell>) -> Self {
        Self { shell }
    }
}

pub fn set_compatibility_script(marker: CompatMarker, confirm: bool) -> String {
    if confirm {
        format!(
            r#"JSON.stringify(db.adminCommand({{ setFeatureCompatibilityVersion: "{marker}", confirm: true }}))"#
        )
    } else {
        format!(r#"JSON.stringify(db.adminCommand({{ setFeatureCompatibilityVersion: "{marker}" }}))"#)
    }
}

const GET_COMPATIBILITY_SCRIPT: &str =
    "JSON.stringify(db.adminCommand({ getParameter: 1, featureCompatibilityVersion: 1 }))";

pub fn parse_compatibility(json: &str) -> Result<CompatMarker> {
    let reply: FeatureCompatibilityReply =
        serde_json::from_str(json).with_context(|| format!("Unexpected getParameter reply: {json}"))?;
    reply.feature_compatibility_version.version.parse().map_err(anyhow::Error::from)
}

pub fn parse_diagnostic(json: &str) -> Result<HealthReport> {
    let output: DiagnosticOutput =
        serde_json::from_str(json).with_context(|| format!("Unexpected diagnostic output: {json}"))?;
    Ok(HealthReport {
        ok: output.ok,
        version: output.version,
        uptime_seconds: output.uptime.max(0.0) as u64,
        databases: output.databases,
        diagnostic: json.to_string(),
    })
}

#[async_trait]
impl AdminInterface for MongoAdmin {
    async fn get_version(&self, handle: &InstanceHandle) -> Result<String> {
        self.shell.eval(handle, "db.version()").await
    }

    async fn set_compatibility(
        &self,
        handle: &InstanceHandle,
        marker: CompatMarker,
        confirm: bool,
    ) -> Result<()> {
        let reply: CommandReply = self
            .shell
            .eval_json(handle, &set_compatibility_script(marker, confirm))
            .await?;
        reply.check("setFeatureCompatibilityVersion")
    }

    async fn get_compatibility(&self, handle: &InstanceHandle) -> Result<CompatMarker> {
        let line = self.shell.eval(handle, GET_COMPATIBILITY_SCRIPT).await?;
        parse_compatibility(&line)
    }

    async fn run_diagnostic(&self, handle: &InstanceHandle) -> Result<HealthReport> {
        let line = self.shell.eval(handle, DIAGNOSTIC_SCRIPT).await?;
        parse_diagnostic(&line)
    }

    async fn ping(&self, handle: &InstanceHandle) -> Result<Duration> {
        let started = Instant::now();
        let reply = self
            .shell
            .eval(handle, "db.adminCommand({ ping: 1 }).ok")
            .await?;
        if reply != "1" {
            bail!("ping answered {reply}");
        }
        Ok(started.elapsed())
    }
}
