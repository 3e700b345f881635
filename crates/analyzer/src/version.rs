//! Instance version gate and api version selection.

use crate::api_versions;
use aioclone_arm::SessionCache;
use aioclone_common::{Error, Result};
use semver::Version;
use serde_json::Value;
use tracing::{debug, warn};

/// Oldest instance version this client can clone.
pub const MIN_SUPPORTED_VERSION: Version = Version::new(1, 0, 34);

/// First instance version this client can no longer clone.
pub const MAX_EXCLUSIVE_VERSION: Version = Version::new(1, 2, 0);

/// From this version on the instance family uses the newer api version.
const API_SPLIT_VERSION: Version = Version::new(1, 1, 0);

/// Outcome of the version gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: Version,
    /// Api version for the instance and its child resources.
    pub instance_api_version: &'static str,
    /// Whether `properties.features` is emitted on the instance.
    pub emit_features: bool,
    /// Set when an incompatible version was let through with `force`.
    pub forced: bool,
}

/// Parses instance versions, picks api versions and gates compatibility.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionGuru {
    force: bool,
}

impl VersionGuru {
    pub fn new(force: bool) -> Self {
        Self { force }
    }

    /// Gate an instance record (`properties.version`).
    ///
    /// Compatible versions are remembered in `session`, so repeated checks of
    /// the same instance within the staleness window skip the log line.
    pub fn check(&self, instance: &Value, session: &SessionCache) -> Result<VersionInfo> {
        let raw = instance
            .pointer("/properties/version")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Validation("Instance does not report properties.version.".to_string())
            })?;
        let version = parse_version(raw)?;

        let cache_key = format!(
            "version-check:{}",
            instance.get("id").and_then(Value::as_str).unwrap_or_default()
        );
        let mut forced = false;

        if session.get_fresh(&cache_key).as_deref() == Some(raw) {
            debug!("Instance version {} already checked", raw);
        } else if is_supported(&version) {
            debug!("Instance version {} is supported", raw);
            session.record(cache_key, raw);
        } else {
            let message = format!(
                "This clone client is not compatible with instance version {}. Supported range is >={},<{}.",
                raw, MIN_SUPPORTED_VERSION, MAX_EXCLUSIVE_VERSION
            );
            if !self.force {
                return Err(Error::Validation(message));
            }
            warn!("{} Continuing because force was set.", message);
            forced = true;
        }

        Ok(select(version, forced))
    }
}

/// Parse a semver string, tolerating a leading `v`.
pub fn parse_version(raw: &str) -> Result<Version> {
    Version::parse(raw.trim().trim_start_matches('v')).map_err(|e| {
        Error::Validation(format!("Unable to parse instance version '{}': {}", raw, e))
    })
}

/// Whether a version falls in the supported range. Pre-release tags are
/// compared by their release triple.
pub fn is_supported(version: &Version) -> bool {
    let release = release_of(version);
    release >= MIN_SUPPORTED_VERSION && release < MAX_EXCLUSIVE_VERSION
}

fn release_of(version: &Version) -> Version {
    Version::new(version.major, version.minor, version.patch)
}

fn select(version: Version, forced: bool) -> VersionInfo {
    let instance_api_version = if release_of(&version) < API_SPLIT_VERSION {
        api_versions::INSTANCE_2024_11
    } else {
        api_versions::INSTANCE_2025_04
    };
    VersionInfo {
        version,
        instance_api_version,
        emit_features: instance_api_version != api_versions::INSTANCE_2024_11,
        forced,
    }
}
