//! Evaluating scripts with the mongo shell inside the instance container.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;

use crate::capability::ContainerRuntime;
use crate::instance::InstanceHandle;
use crate::version::Version;

const USERNAME_ENV: &str = "MONGO_INITDB_ROOT_USERNAME";
const PASSWORD_ENV: &str = "MONGO_INITDB_ROOT_PASSWORD";

/// Root credentials used for admin commands and dumps.
#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Credentials the official image was initialised with, if any.
    pub fn from_env(env: &BTreeMap<String, String>) -> Option<Self> {
        match (env.get(USERNAME_ENV), env.get(PASSWORD_ENV)) {
            (Some(user), Some(password)) if !user.is_empty() => {
                Some(Self::new(user.clone(), password.clone()))
            }
            _ => None,
        }
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "--username".to_string(),
            self.username.clone(),
            "--password".to_string(),
            self.password.expose_secret().to_string(),
            "--authenticationDatabase".to_string(),
            "admin".to_string(),
        ]
    }
}

/// Shell binary available in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    /// `mongosh`, the only shell from 6.0 on.
    Mongosh,
    /// The legacy `mongo` shell of 5.0 and older.
    Legacy,
}

impl ShellKind {
    /// Pick the shell from the major version at the start of the image tag.
    /// Tags without a leading number (`latest`) get `mongosh`.
    pub fn for_image(image: &str) -> Self {
        let tag = match image.rsplit_once(':') {
            Some((_, tag)) if !tag.contains('/') => tag,
            _ => "",
        };
        let digits: String = tag.chars().take_while(char::is_ascii_digit).collect();
        match digits.parse::<u64>() {
            Ok(major) => Self::for_version(&Version::new(major, 0, 0)),
            Err(_) => Self::Mongosh,
        }
    }

    pub const fn for_version(version: &Version) -> Self {
        if version.major() < 6 {
            Self::Legacy
        } else {
            Self::Mongosh
        }
    }

    pub const fn binary(self) -> &'static str {
        match self {
            Self::Mongosh => "mongosh",
            Self::Legacy => "mongo",
        }
    }
}

pub struct MongoShell {
    runtime: Arc<dyn ContainerRuntime>,
    credentials: Option<Credentials>,
}

impl MongoShell {
    /// Explicit credentials take precedence over the container environment.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, credentials: Option<Credentials>) -> Self {
        Self {
            runtime,
            credentials,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Authentication arguments for tools run inside `handle`.
    pub fn auth_args(&self, handle: &InstanceHandle) -> Vec<String> {
        match &self.credentials {
            Some(credentials) => credentials.args(),
            None => Credentials::from_env(&handle.env)
                .map(|c| c.args())
                .unwrap_or_default(),
        }
    }

    pub fn command(&self, handle: &InstanceHandle, script: &str) -> Vec<String> {
        let mut command = vec![
            ShellKind::for_image(&handle.image).binary().to_string(),
            "--quiet".to_string(),
        ];
        command.extend(self.auth_args(handle));
        command.push("--eval".to_string());
        command.push(script.to_string());
        command
    }

    /// Evaluate `script` and return the last line it printed.
    pub async fn eval(&self, handle: &InstanceHandle, script: &str) -> Result<String> {
        let output = self
            .runtime
            .exec(handle, &self.command(handle, script))
            .await?
            .into_stdout(ShellKind::for_image(&handle.image).binary())?;
        last_line(&output)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("shell printed nothing for: {script}"))
    }

    /// Evaluate a script printing JSON and decode it.
    pub async fn eval_json<T: DeserializeOwned>(&self, handle: &InstanceHandle, script: &str) -> Result<T> {
        let line = self.eval(handle, script).await?;
        serde_json::from_str(&line).with_context(|| format!("Unexpected shell output: {line}"))
    }
}

/// Last non-empty line. The legacy shell may print warnings first.
pub fn last_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).rev().find(|l| !l.is_empty())
}
