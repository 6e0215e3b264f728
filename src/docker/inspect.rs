//! Decoding `docker container inspect` output into typed descriptors.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::instance::{InstanceDescriptor, Mount, NetworkBinding, PortBinding, VolumeBinding};
use crate::types::InstanceStats;

/// Networks every container can see that are not a user attachment.
const IMPLICIT_NETWORKS: &[&str] = &["default", "bridge", "host", "none"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    id: String,
    name: String,
    config: InspectConfig,
    state: InspectState,
    host_config: InspectHostConfig,
    #[serde(default)]
    mounts: Vec<InspectMount>,
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    #[serde(default)]
    network_mode: Option<String>,
    #[serde(default)]
    port_bindings: Option<HashMap<String, Option<Vec<InspectHostPort>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostPort {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectMount {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    source: String,
    destination: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: Option<HashMap<String, serde_json::Value>>,
}

/// Parse inspect JSON. `data_dir` is the mount point of the data volume.
pub fn parse_inspect(json: &str, data_dir: &str) -> Result<Option<InstanceDescriptor>> {
    let containers: Vec<ContainerInspect> =
        serde_json::from_str(json).context("Failed to parse docker inspect output")?;
    Ok(containers
        .into_iter()
        .next()
        .map(|c| into_descriptor(c, data_dir)))
}

fn into_descriptor(c: ContainerInspect, data_dir: &str) -> InstanceDescriptor {
    let volume = c
        .mounts
        .iter()
        .find(|m| m.destination == data_dir)
        .map(|m| VolumeBinding {
            source: m.name.clone().unwrap_or_else(|| m.source.clone()),
            target: m.destination.clone(),
        });

    // Anonymous volumes declared by the image are recreated with the
    // container, so only bind mounts are part of the identity.
    let mounts = c
        .mounts
        .iter()
        .filter(|m| m.kind == "bind" && m.destination != data_dir)
        .map(|m| Mount {
            source: m.source.clone(),
            target: m.destination.clone(),
        })
        .collect();

    let network = attached_network(&c.host_config, &c.network_settings).map(|network| {
        NetworkBinding {
            network,
            ports: port_bindings(&c.host_config),
        }
    });

    let env = c
        .config
        .env
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect::<BTreeMap<_, _>>();

    InstanceDescriptor {
        id: c.id,
        name: c.name.trim_start_matches('/').to_string(),
        image: c.config.image,
        running: c.state.running,
        volume,
        network,
        env,
        args: c.config.cmd.unwrap_or_default(),
        mounts,
    }
}

fn attached_network(
    host: &InspectHostConfig,
    settings: &InspectNetworkSettings,
) -> Option<String> {
    if let Some(mode) = &host.network_mode {
        if !IMPLICIT_NETWORKS.contains(&mode.as_str()) && !mode.starts_with("container:") {
            return Some(mode.clone());
        }
    }
    let mut names: Vec<&String> = settings
        .networks
        .as_ref()
        .map(|n| n.keys().collect())
        .unwrap_or_default();
    names.sort();
    names
        .iter()
        .find(|n| !IMPLICIT_NETWORKS.contains(&n.as_str()))
        .or_else(|| names.first())
        .map(|n| (*n).clone())
}

fn port_bindings(host: &InspectHostConfig) -> Vec<PortBinding> {
    let mut ports: Vec<PortBinding> = host
        .port_bindings
        .iter()
        .flatten()
        .flat_map(|(container_port, bindings)| {
            bindings.iter().flatten().map(move |b| PortBinding {
                container_port: container_port.clone(),
                host_ip: Some(b.host_ip.clone()).filter(|ip| !ip.is_empty()),
                host_port: b.host_port.clone(),
            })
        })
        .collect();
    ports.sort_by(|a, b| a.container_port.cmp(&b.container_port));
    ports
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatsLine {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    mem_perc: String,
}

/// Parse one `docker stats --format '{{json .}}'` line.
pub fn parse_stats(line: &str) -> Result<InstanceStats> {
    let stats: StatsLine =
        serde_json::from_str(line.trim()).context("Failed to parse docker stats output")?;
    Ok(InstanceStats {
        cpu_percent: parse_percent(&stats.cpu_perc)?,
        mem_percent: parse_percent(&stats.mem_perc)?,
    })
}

fn parse_percent(value: &str) -> Result<f64> {
    value
        .trim()
        .trim_end_matches('%')
        .parse()
        .with_context(|| format!("Invalid percentage '{value}'"))
}
