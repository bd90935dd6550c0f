//! Extension descriptors and entry point resolution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use compact_str::CompactString;
use exthost_core::{ExtensionInfo, HostError, HostResult, Manifest};
use indexmap::IndexMap;
use serde::Serialize;

use crate::context::ExtensionContext;

/// Synchronous registration function of an extension.
pub type InitFn = Arc<dyn Fn(&ExtensionContext) -> HostResult<()> + Send + Sync>;

/// Wrap a closure as an [`InitFn`].
pub fn init_fn<F>(f: F) -> InitFn
where
    F: Fn(&ExtensionContext) -> HostResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// How the registration function of an extension is obtained.
#[derive(Clone)]
pub enum EntryLoader {
    /// Compiled into the host.
    Builtin(InitFn),

    /// Entry file on disk, turned into an [`InitFn`] by an [`EntryResolver`].
    File(PathBuf),
}

impl std::fmt::Debug for EntryLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Builtin(_) => f.write_str("Builtin"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// Turns on-disk entry files into registration functions.
///
/// The runtime itself does not execute scripts or load libraries; the host
/// embedding it decides how an entry file becomes callable.
pub trait EntryResolver: Send + Sync {
    fn resolve(&self, descriptor: &ExtensionDescriptor) -> HostResult<InitFn>;
}

/// Resolver backed by a fixed table of registration functions, keyed by
/// extension name.
#[derive(Default, Clone)]
pub struct StaticResolver {
    entries: IndexMap<String, InitFn>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the init function for `name`.
    pub fn with(mut self, name: impl Into<String>, init: InitFn) -> Self {
        self.entries.insert(name.into(), init);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl EntryResolver for StaticResolver {
    fn resolve(&self, descriptor: &ExtensionDescriptor) -> HostResult<InitFn> {
        self.entries
            .get(descriptor.name.as_str())
            .cloned()
            .ok_or_else(|| {
                HostError::load(
                    &descriptor.path,
                    format!("no entry point registered for '{}'", descriptor.name),
                )
            })
    }
}

/// Extension compiled into the host.
#[derive(Clone)]
pub struct BuiltinExtension {
    pub name: CompactString,
    pub init: InitFn,
}

impl BuiltinExtension {
    pub fn new(name: impl Into<CompactString>, init: InitFn) -> Self {
        Self {
            name: name.into(),
            init,
        }
    }
}

/// Everything the runtime knows about one loadable extension.
#[derive(Debug, Clone)]
pub struct ExtensionDescriptor {
    /// Unique identity.
    pub name: CompactString,

    /// Namespace used for translations.
    pub namespace: CompactString,

    /// Extension directory.
    pub path: PathBuf,

    /// Found under a bundled root.
    pub bundled: bool,

    /// Loaded from disk rather than compiled in.
    pub dynamic: bool,

    /// Parsed or synthesized manifest.
    pub manifest: Manifest,

    pub entry: EntryLoader,
}

impl ExtensionDescriptor {
    /// Descriptor of an extension compiled into the host.
    pub fn builtin(extension: &BuiltinExtension) -> Self {
        Self {
            name: extension.name.clone(),
            namespace: extension.name.clone(),
            path: PathBuf::new(),
            bundled: true,
            dynamic: false,
            manifest: Manifest {
                name: extension.name.to_string(),
                ..Default::default()
            },
            entry: EntryLoader::Builtin(extension.init.clone()),
        }
    }

    /// Identity handed to diagnostics and the gated api.
    pub fn info(&self) -> ExtensionInfo {
        ExtensionInfo {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            path: self.path.clone(),
            dynamic: self.dynamic,
            official: !self.dynamic || self.bundled,
        }
    }

    /// Declared version, `0.0.0` when missing or invalid.
    pub fn version(&self) -> semver::Version {
        self.manifest.semver()
    }

    /// Whether `id` refers to this extension by manifest name, manifest id
    /// or descriptor name.
    pub fn matches_id(&self, id: &str) -> bool {
        self.name == id
            || self.manifest.name == id
            || self.manifest.id.as_deref() == Some(id)
    }

    pub fn summary(&self) -> DescriptorSummary {
        DescriptorSummary {
            name: self.name.to_string(),
            namespace: self.namespace.to_string(),
            version: self.manifest.version.clone(),
            author: self.manifest.author.clone(),
            path: self.path.clone(),
            bundled: self.bundled,
            dynamic: self.dynamic,
        }
    }
}

/// Serializable view of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorSummary {
    pub name: String,
    pub namespace: String,
    pub version: String,
    pub author: String,
    pub path: PathBuf,
    pub bundled: bool,
    pub dynamic: bool,
}

/// Result of scanning the extension roots.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Loadable extensions in load order.
    pub descriptors: Vec<ExtensionDescriptor>,

    /// Directories superseded by another copy of the same extension.
    pub outdated: Vec<PathBuf>,
}

impl ScanResult {
    pub fn find(&self, id: &str) -> Option<&ExtensionDescriptor> {
        self.descriptors.iter().find(|d| d.matches_id(id))
    }

    pub fn names(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name.as_str()).collect()
    }
}

/// Look up a descriptor by any of its identifiers.
pub fn find_descriptor<'a>(
    descriptors: &'a [ExtensionDescriptor],
    id: &str,
) -> Option<&'a ExtensionDescriptor> {
    descriptors.iter().find(|d| d.matches_id(id))
}

/// Derive an id from a display name, or from an archive-style directory
/// name when there is none.
pub fn idify(name: Option<&str>, dir_name: &str) -> String {
    match name {
        Some(name) => name
            .to_lowercase()
            .chars()
            .filter(|c| *c != ':' && *c != '\'')
            .map(|c| if c == ' ' || c == '_' { '-' } else { c })
            .collect::<String>()
            .trim()
            .to_string(),
        None => archive_prefix(dir_name).to_string(),
    }
}

/// Part of `name` before the first `-<word>-` segment.
fn archive_prefix(name: &str) -> &str {
    let bytes = name.as_bytes();
    for (start, _) in name.match_indices('-') {
        let tail = &bytes[start + 1..];
        let word_len = tail
            .iter()
            .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
            .count();
        if word_len > 0 && tail.get(word_len) == Some(&b'-') {
            return &name[..start];
        }
    }
    name
}

/// Whether a path lies inside `root`.
pub(crate) fn is_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}
