//! Module identities and version metadata.

use crate::error::{Error, Result};
use crate::version;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// A module path paired with a version (or the `latest` query).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleVersion {
    pub path: String,
    pub version: String,
}

impl ModuleVersion {
    /// Create a module version. The path must not be empty.
    pub fn new(path: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if path.is_empty() {
            return Err(Error::InvalidModulePath("empty module path".to_string()));
        }
        Ok(Self {
            path,
            version: version.into(),
        })
    }

    /// Returns true when the version is the `latest` query rather than a version.
    pub fn is_latest(&self) -> bool {
        self.version == version::LATEST
    }

    /// Returns true when the version is canonical.
    pub fn has_canonical_version(&self) -> bool {
        version::is_canonical(&self.version)
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.version)
    }
}

/// Version metadata served as `<version>.info` and `@latest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Info {
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    /// VCS origin reported by newer toolchains, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<serde_json::Value>,
}

impl Info {
    pub fn new(version: impl Into<String>, time: OffsetDateTime) -> Self {
        Self {
            version: version.into(),
            time,
            origin: None,
        }
    }

    /// Serialize to the JSON body served to clients.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}
