//! Instance identity: descriptors from the runtime, launch specs and handles.
//!
//! A run keeps one logical service identity while the underlying container is
//! destroyed and recreated at every hop. Volume, network, arguments, mounts
//! and every non-version environment entry stay fixed; only the image (and
//! the environment the image itself provides for its version) may change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::UpgradeError;
use crate::version::Version;

/// Environment keys injected by server images that describe the packaged
/// version. They are dropped when relaunching so the new image provides its own.
const VERSION_ENV_KEYS: &[&str] = &[
    "MONGO_VERSION",
    "MONGO_MAJOR",
    "MONGO_PACKAGE",
    "MONGO_REPO",
    "GPG_KEYS",
    "GOSU_VERSION",
    "JSYAML_VERSION",
    "JSYAML_CHECKSUM",
];

/// Returns true if an environment key is version-selecting.
pub fn is_version_env(key: &str) -> bool {
    VERSION_ENV_KEYS.contains(&key)
}

/// Data volume bound to the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    /// Named volume or host path.
    pub source: String,
    /// Mount point inside the container.
    pub target: String,
}

/// Published port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: String,
    pub host_ip: Option<String>,
    pub host_port: String,
}

/// Network attachment of the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBinding {
    pub network: String,
    pub ports: Vec<PortBinding>,
}

/// Additional bind mount (e.g. the backup directory).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
}

/// Typed inspection result returned by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub volume: Option<VolumeBinding>,
    pub network: Option<NetworkBinding>,
    pub env: BTreeMap<String, String>,
    pub args: Vec<String>,
    pub mounts: Vec<Mount>,
}

impl InstanceDescriptor {
    /// Handle to the described instance.
    pub fn handle(&self) -> InstanceHandle {
        InstanceHandle {
            id: self.id.clone(),
            name: self.name.clone(),
            image: self.image.clone(),
            volume: self.volume.clone(),
            network: self.network.clone(),
            env: self.env.clone(),
            args: self.args.clone(),
            mounts: self.mounts.clone(),
        }
    }
}

/// Reference to a live (or last known) service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub id: String,
    pub name: String,
    pub image: String,
    pub volume: Option<VolumeBinding>,
    pub network: Option<NetworkBinding>,
    pub env: BTreeMap<String, String>,
    pub args: Vec<String>,
    pub mounts: Vec<Mount>,
}

impl InstanceHandle {
    /// Compare the invariant fields against the spec the instance was
    /// launched from. Returns a description of the first difference found.
    pub fn invariant_drift(&self, spec: &LaunchSpec) -> Option<String> {
        if self.name != spec.name {
            return Some(format!("name {} != {}", self.name, spec.name));
        }
        if self.volume.as_ref() != Some(&spec.volume) {
            return Some(format!(
                "volume binding changed ({:?} != {})",
                self.volume.as_ref().map(|v| &v.source),
                spec.volume.source
            ));
        }
        if self.network.as_ref() != Some(&spec.network) {
            return Some(format!(
                "network binding changed ({:?} != {})",
                self.network.as_ref().map(|n| &n.network),
                spec.network.network
            ));
        }
        if self.args != spec.args {
            return Some("command arguments changed".to_string());
        }
        if self.mounts != spec.mounts {
            return Some("bind mounts changed".to_string());
        }
        for (key, value) in &spec.env {
            if self.env.get(key) != Some(value) {
                return Some(format!("environment entry {key} changed"));
            }
        }
        None
    }
}

/// Everything needed to create an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub volume: VolumeBinding,
    pub network: NetworkBinding,
    /// Non-version environment only.
    pub env: BTreeMap<String, String>,
    pub args: Vec<String>,
    pub mounts: Vec<Mount>,
}

impl LaunchSpec {
    /// Capture the invariant part of a running instance.
    pub fn from_descriptor(desc: &InstanceDescriptor) -> Result<Self, UpgradeError> {
        let volume = desc.volume.clone().ok_or_else(|| {
            UpgradeError::Prerequisite(format!("instance {} has no data volume bound", desc.name))
        })?;
        let network = desc.network.clone().ok_or_else(|| {
            UpgradeError::Prerequisite(format!("instance {} is not attached to a network", desc.name))
        })?;
        let env = desc
            .env
            .iter()
            .filter(|(k, _)| !is_version_env(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            name: desc.name.clone(),
            image: desc.image.clone(),
            volume,
            network,
            env,
            args: desc.args.clone(),
            mounts: desc.mounts.clone(),
        })
    }

    /// Same instance identity pinned to another version of `repository`.
    pub fn for_version(&self, repository: &str, version: &Version) -> Self {
        Self {
            image: format!("{repository}:{}", version.image_tag()),
            ..self.clone()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::descriptor;
    use super::*;

    #[test]
    fn test_launch_spec_drops_version_env() {
        let spec = LaunchSpec::from_descriptor(&descriptor("mongo:4.0.9")).unwrap();
        assert!(spec.env.contains_key("MONGO_INITDB_ROOT_USERNAME"));
        assert!(!spec.env.contains_key("MONGO_VERSION"));
    }

    #[test]
    fn test_launch_spec_requires_volume_and_network() {
        let mut desc = descriptor("mongo:4.0.9");
        desc.volume = None;
        let err = LaunchSpec::from_descriptor(&desc).unwrap_err();
        assert!(matches!(err, UpgradeError::Prerequisite(_)));

        let mut desc = descriptor("mongo:4.0.9");
        desc.network = None;
        assert!(LaunchSpec::from_descriptor(&desc).is_err());
    }

    #[test]
    fn test_for_version_only_overrides_image() {
        let spec = LaunchSpec::from_descriptor(&descriptor("mongo:4.0.9")).unwrap();
        let next = spec.for_version("mongo", &Version::new(4, 2, 24));
        assert_eq!(next.image, "mongo:4.2.24");
        assert_eq!(next.volume, spec.volume);
        assert_eq!(next.network, spec.network);
        assert_eq!(next.env, spec.env);
        assert_eq!(next.args, spec.args);
    }

    #[test]
    fn test_invariant_drift_detects_volume_change() {
        let desc = descriptor("mongo:4.0.9");
        let spec = LaunchSpec::from_descriptor(&desc).unwrap();
        let mut handle = desc.handle();
        assert_eq!(handle.invariant_drift(&spec), None);

        handle.volume = Some(VolumeBinding {
            source: "other".to_string(),
            target: "/data/db".to_string(),
        });
        assert!(handle.invariant_drift(&spec).unwrap().contains("volume"));
    }

    #[test]
    fn test_invariant_drift_ignores_image_env() {
        let desc = descriptor("mongo:4.0.9");
        let spec = LaunchSpec::from_descriptor(&desc).unwrap();
        let mut handle = desc.handle();
        handle
            .env
            .insert("MONGO_VERSION".to_string(), "4.2.24".to_string());
        assert_eq!(handle.invariant_drift(&spec), None);

        handle.env.remove("MONGO_INITDB_ROOT_USERNAME");
        assert!(handle.invariant_drift(&spec).is_some());
    }
}
