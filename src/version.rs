//! Server version parsing, compatibility markers and upgrade path calculation.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UpgradeError;

/// Release series the server must pass through, with the patch release used
/// for each hop. Upgrades may not skip a series.
pub const RELEASE_SERIES: &[&str] = &[
    "3.6.23", "4.0.28", "4.2.24", "4.4.29", "5.0.31", "6.0.19", "7.0.2", "8.0.4",
];

/// A full `major.minor.patch` server version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version(semver::Version);

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    pub const fn major(&self) -> u64 {
        self.0.major
    }

    pub const fn minor(&self) -> u64 {
        self.0.minor
    }

    /// The release series (and compatibility level) this version belongs to.
    pub const fn marker(&self) -> CompatMarker {
        CompatMarker::new(self.0.major, self.0.minor)
    }

    /// Image tag used to launch this version.
    pub fn image_tag(&self) -> String {
        self.to_string()
    }
}

impl FromStr for Version {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        semver::Version::parse(trimmed)
            .map(Self)
            .map_err(|e| UpgradeError::Configuration(format!("invalid version '{s}': {e}")))
    }
}

impl TryFrom<String> for Version {
    type Error = UpgradeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// Feature compatibility marker (`major.minor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CompatMarker {
    pub major: u64,
    pub minor: u64,
}

impl CompatMarker {
    pub const fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// Servers from 7.0 on refuse to change the marker without an explicit
    /// confirmation flag.
    pub const fn requires_confirm(&self) -> bool {
        self.major >= 7
    }
}

impl FromStr for CompatMarker {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UpgradeError::Configuration(format!("invalid compatibility marker '{s}'"));
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 2 {
            return Err(invalid());
        }
        let major = parts[0].parse().map_err(|_| invalid())?;
        let minor = parts[1].parse().map_err(|_| invalid())?;
        Ok(Self::new(major, minor))
    }
}

impl TryFrom<String> for CompatMarker {
    type Error = UpgradeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CompatMarker> for String {
    fn from(value: CompatMarker) -> Self {
        value.to_string()
    }
}

impl fmt::Display for CompatMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Parse an upgrade target given either as a series (`7.0`) or a full
/// version (`7.0.2`). Returns the series and the explicit version, if any.
pub fn parse_target(target: &str) -> Result<(CompatMarker, Option<Version>), UpgradeError> {
    let trimmed = target.trim().trim_start_matches('v');
    match trimmed.split('.').count() {
        2 => Ok((trimmed.parse()?, None)),
        3 => {
            let version: Version = trimmed.parse()?;
            Ok((version.marker(), Some(version)))
        }
        _ => Err(UpgradeError::Configuration(format!(
            "invalid target '{target}', expected MAJOR.MINOR or MAJOR.MINOR.PATCH"
        ))),
    }
}

/// Calculate the hop versions from `baseline` to `target`.
///
/// Every release series after the baseline's series up to and including the
/// target series is visited once. Within the baseline's own series an
/// explicit newer patch becomes a single hop. The path is empty only when the
/// baseline is already the target.
pub fn calculate_upgrade_path(baseline: &Version, target: &str) -> Result<Vec<Version>, UpgradeError> {
    let (target_series, explicit) = parse_target(target)?;
    let table: Vec<Version> = RELEASE_SERIES
        .iter()
        .map(|s| s.parse::<Version>())
        .collect::<Result<Vec<_>, _>>()?;

    let start = table
        .iter()
        .position(|v| v.marker() == baseline.marker())
        .ok_or_else(|| {
            UpgradeError::Configuration(format!(
                "baseline {baseline} is not in a supported release series"
            ))
        })?;
    let end = table
        .iter()
        .position(|v| v.marker() == target_series)
        .ok_or_else(|| {
            UpgradeError::Configuration(format!(
                "target {target} is not in a supported release series"
            ))
        })?;

    if end < start {
        return Err(UpgradeError::Configuration(format!(
            "target {target} is lower than baseline {baseline} (downgrade not supported)"
        )));
    }

    if end == start {
        return match explicit {
            Some(explicit) if explicit > *baseline => Ok(vec![explicit]),
            Some(explicit) if explicit < *baseline => Err(UpgradeError::Configuration(format!(
                "target {explicit} is lower than baseline {baseline} (downgrade not supported)"
            ))),
            _ => Ok(Vec::new()),
        };
    }

    let mut path: Vec<Version> = table[start + 1..=end].to_vec();
    if let (Some(last), Some(explicit)) = (path.last_mut(), explicit) {
        *last = explicit;
    }
    Ok(path)
}
