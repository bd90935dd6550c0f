//! Extension metadata, manifests and load failure verdicts.

use std::path::PathBuf;

use compact_str::CompactString;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::{AsRefStr, Display, EnumString};

use crate::error::HostResult;
use crate::version;

/// Contents of an extension's `info.json` file.
///
/// Every field is optional on disk; a missing or broken manifest is
/// replaced by [`Manifest::default`] and the directory name is used instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Human-readable extension name.
    #[serde(default)]
    pub name: String,

    /// Extension version (semver, leniently parsed).
    #[serde(default)]
    pub version: String,

    /// Stable identifier, overrides the directory name when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Translation namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Extension author.
    #[serde(default)]
    pub author: String,

    /// Short description.
    #[serde(default)]
    pub description: String,
}

impl Manifest {
    /// Parse a manifest from JSON text.
    pub fn from_json(input: &str) -> HostResult<Self> {
        Ok(serde_json::from_str(input)?)
    }

    /// Parsed version, `0.0.0` when missing or invalid.
    pub fn semver(&self) -> semver::Version {
        version::version_or_zero(&self.version)
    }

    /// The manifest name if it is non-empty.
    pub fn display_name(&self) -> Option<&str> {
        if self.name.trim().is_empty() {
            None
        } else {
            Some(self.name.as_str())
        }
    }
}

/// Identity of an extension attached to errors, listeners and reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtensionInfo {
    /// Registry name (unique).
    pub name: CompactString,

    /// Translation namespace.
    pub namespace: CompactString,

    /// Directory the extension was loaded from.
    pub path: PathBuf,

    /// Whether the extension was loaded from an extension root (not built in).
    pub dynamic: bool,

    /// Whether the extension ships with the host.
    pub official: bool,
}

impl ExtensionInfo {
    /// Create extension info for a built-in extension.
    pub fn builtin(name: impl Into<CompactString>) -> Self {
        let name = name.into();
        Self {
            namespace: name.clone(),
            name,
            path: PathBuf::new(),
            dynamic: false,
            official: true,
        }
    }

    /// Whether errors from this extension should be attributed to a third party.
    pub fn is_third_party(&self) -> bool {
        !self.official
    }
}

/// Durable per-extension state kept in the host's state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionState {
    /// Whether the extension is loaded at startup.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether the extension should be deleted at next startup.
    #[serde(default)]
    pub remove: bool,

    /// Last version the host has seen, used for migrations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for ExtensionState {
    fn default() -> Self {
        Self {
            enabled: true,
            remove: false,
            version: None,
        }
    }
}

/// Extension states keyed by extension id.
pub type ExtensionStates = IndexMap<String, ExtensionState>;

/// Reason an extension was not (fully) loaded.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FailureKind {
    /// Extension called a registration function the host does not know.
    UnsupportedApi,

    /// A required extension is not installed.
    MissingDependency,

    /// A required extension is installed in an incompatible version.
    VersionMismatch,

    /// The host version does not satisfy the extension's requirement.
    UnsupportedHostVersion,

    /// The extension failed while loading or registering.
    Exception,
}

/// One entry of an extension's compatibility verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadFailure {
    /// Kind of failure.
    pub kind: FailureKind,

    /// Details for display (dependency id, required range, message).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub args: serde_json::Value,
}

impl LoadFailure {
    /// Failure without details.
    pub fn new(kind: FailureKind) -> Self {
        Self {
            kind,
            args: serde_json::Value::Null,
        }
    }

    /// Registration function not in the known surface.
    pub fn unsupported_api(call: &str) -> Self {
        Self {
            kind: FailureKind::UnsupportedApi,
            args: json!({ "call": call }),
        }
    }

    /// Required extension missing.
    pub fn missing_dependency(dependency_id: &str) -> Self {
        Self {
            kind: FailureKind::MissingDependency,
            args: json!({ "dependencyId": dependency_id }),
        }
    }

    /// Required extension present in a version outside the range.
    pub fn version_mismatch(dependency_id: &str, range: &str, found: &str) -> Self {
        Self {
            kind: FailureKind::VersionMismatch,
            args: json!({ "dependencyId": dependency_id, "version": range, "found": found }),
        }
    }

    /// Host version outside the required range.
    pub fn unsupported_host_version(range: &str) -> Self {
        Self {
            kind: FailureKind::UnsupportedHostVersion,
            args: json!({ "version": range }),
        }
    }

    /// Extension threw during load or registration.
    pub fn exception(message: impl std::fmt::Display) -> Self {
        Self {
            kind: FailureKind::Exception,
            args: json!({ "message": message.to_string() }),
        }
    }
}

/// An optional dependency that is not installed. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionalDependency {
    /// Id of the missing extension.
    pub id: String,

    /// Version range that was requested, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Path of the extension that asked for it.
    pub extension_path: PathBuf,
}
