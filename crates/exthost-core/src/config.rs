//! Host configuration.

use std::path::{Path, PathBuf};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};
use crate::version;

/// A directory scanned for extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionRoot {
    /// Directory containing one subdirectory per extension.
    pub path: PathBuf,

    /// Whether extensions in this root ship with the host.
    #[serde(default)]
    pub bundled: bool,
}

impl ExtensionRoot {
    /// A user-writable root.
    pub fn user(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            bundled: false,
        }
    }

    /// A root of extensions shipped with the host.
    pub fn bundled(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            bundled: true,
        }
    }
}

/// Configuration for the extension host.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct HostConfig {
    /// Extension roots. User roots are scanned before bundled ones.
    #[builder(default = "default_roots()")]
    #[serde(default = "default_roots")]
    pub roots: Vec<ExtensionRoot>,

    /// Scratch directory holding crash quarantine markers.
    #[builder(default = "default_temp_dir()")]
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// File names marking a directory as an extension, in priority order.
    ///
    /// The host never reads these files. The embedding's `EntryResolver`
    /// decides how the chosen entry is run.
    #[builder(default = "default_entry_files()")]
    #[serde(default = "default_entry_files")]
    pub entry_files: Vec<String>,

    /// Time a ready hook may take before it is abandoned.
    #[builder(default = "60_000")]
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Persistor debounce used when an extension does not pass one.
    #[builder(default = "200")]
    #[serde(default = "default_debounce_ms")]
    pub default_debounce_ms: u64,

    /// Version of the host application, checked against `require_version`.
    #[builder(default = "default_host_version()")]
    #[serde(default = "default_host_version")]
    pub host_version: String,

    /// Whether `require_version` ranges are enforced.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub enforce_host_version: bool,

    /// Ready hooks slower than this are logged.
    #[builder(default = "1000")]
    #[serde(default = "default_slow_init_threshold_ms")]
    pub slow_init_threshold_ms: u64,

    /// Listener count per event above which a warning is logged (0 = unlimited).
    #[builder(default = "100")]
    #[serde(default = "default_max_listeners")]
    pub max_listeners: usize,
}

fn default_true() -> bool {
    true
}

fn default_ready_timeout_ms() -> u64 {
    60_000
}

fn default_debounce_ms() -> u64 {
    200
}

fn default_slow_init_threshold_ms() -> u64 {
    1000
}

fn default_max_listeners() -> usize {
    100
}

fn default_host_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_entry_files() -> Vec<String> {
    vec!["index.js".to_string()]
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("exthost")
}

fn default_roots() -> Vec<ExtensionRoot> {
    vec![ExtensionRoot::user(data_dir().join("plugins"))]
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("exthost")
}

/// Checks shared by the builder and file loading. `None` means unset.
fn check_values(
    entry_files: Option<&[String]>,
    ready_timeout_ms: Option<u64>,
    host_version: Option<&str>,
) -> Result<(), String> {
    if entry_files.is_some_and(|files| files.is_empty()) {
        return Err("At least one entry file name is required".to_string());
    }
    if ready_timeout_ms == Some(0) {
        return Err("Ready timeout must be greater than zero".to_string());
    }
    if let Some(host_version) = host_version {
        if version::parse_version(host_version).is_none() {
            return Err(format!("Host version '{host_version}' is not a valid version"));
        }
    }
    Ok(())
}

impl HostConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        check_values(
            self.entry_files.as_deref(),
            self.ready_timeout_ms,
            self.host_version.as_deref(),
        )
    }
}

impl HostConfig {
    /// Create a new host config builder.
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::default()
    }

    /// Parse a config from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(input: &str) -> HostResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| HostError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the host cannot run with.
    pub fn validate(&self) -> HostResult<()> {
        check_values(
            Some(&self.entry_files),
            Some(self.ready_timeout_ms),
            Some(&self.host_version),
        )
        .map_err(|message| HostError::Config { message })
    }

    /// Load a config file.
    pub fn load(path: &Path) -> HostResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Directory where state is kept, next to the default user root.
    pub fn default_data_dir() -> PathBuf {
        data_dir()
    }

    /// User roots followed by bundled roots, relative order preserved.
    pub fn ordered_roots(&self) -> Vec<ExtensionRoot> {
        let mut roots = self.roots.clone();
        roots.sort_by_key(|root| root.bundled);
        roots
    }

    /// The first user-writable root, if any.
    pub fn user_root(&self) -> Option<&Path> {
        self.roots
            .iter()
            .find(|root| !root.bundled)
            .map(|root| root.path.as_path())
    }

    /// Parsed host version.
    pub fn host_semver(&self) -> semver::Version {
        version::version_or_zero(&self.host_version)
    }

    /// Whether `name` is an entry file.
    pub fn is_entry_file(&self, name: &str) -> bool {
        self.entry_files.iter().any(|entry| entry == name)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            temp_dir: default_temp_dir(),
            entry_files: default_entry_files(),
            ready_timeout_ms: default_ready_timeout_ms(),
            default_debounce_ms: default_debounce_ms(),
            host_version: default_host_version(),
            enforce_host_version: true,
            slow_init_threshold_ms: default_slow_init_threshold_ms(),
            max_listeners: default_max_listeners(),
        }
    }
}
