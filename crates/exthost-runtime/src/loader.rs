//! Discovery of extensions in the configured roots.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use compact_str::CompactString;
use exthost_core::{ExtensionRoot, ExtensionStates, HostConfig, Manifest, version::is_newer};
use tracing::{debug, info, warn};

use crate::descriptor::{EntryLoader, ExtensionDescriptor, ScanResult, idify};

/// Name of the per-extension manifest file.
pub const MANIFEST_FILE: &str = "info.json";

/// Scans extension roots and builds the deduplicated descriptor list.
///
/// User roots are scanned before bundled ones, so a user copy of an
/// extension shadows the bundled copy unless the bundled one is strictly
/// newer.
#[derive(Debug)]
pub struct DescriptorLoader<'a> {
    config: &'a HostConfig,
    disabled: HashSet<String>,
}

impl<'a> DescriptorLoader<'a> {
    pub fn new(config: &'a HostConfig) -> Self {
        Self {
            config,
            disabled: HashSet::new(),
        }
    }

    /// Skip every extension that is disabled or flagged for removal in `states`.
    pub fn with_states(mut self, states: &ExtensionStates) -> Self {
        self.disabled.extend(
            states
                .iter()
                .filter(|(_, state)| !state.enabled || state.remove)
                .map(|(id, _)| id.clone()),
        );
        self
    }

    /// Skip these extension ids.
    pub fn with_disabled<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.disabled.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn is_disabled(&self, id: &str) -> bool {
        self.disabled.contains(id)
    }

    /// Scan all roots in order.
    pub fn scan(&self) -> ScanResult {
        let mut result = ScanResult::default();
        for root in self.config.ordered_roots() {
            self.scan_root(&root, &mut result);
        }
        if !result.outdated.is_empty() {
            info!(
                count = result.outdated.len(),
                "Outdated extension copies found"
            );
        }
        result
    }

    fn scan_root(&self, root: &ExtensionRoot, result: &mut ScanResult) {
        if !root.path.exists() {
            info!(path = %root.path.display(), "Extension root does not exist, creating it");
            if let Err(e) = fs::create_dir_all(&root.path) {
                warn!(path = %root.path.display(), error = %e, "Failed to create extension root");
            }
            return;
        }

        let entries = match fs::read_dir(&root.path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %root.path.display(), error = %e, "Failed to read extension root");
                return;
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let dir_name = file_name(&dir);
            if self.is_disabled(&dir_name) {
                debug!(extension = %dir_name, "Extension disabled, skipped");
                continue;
            }
            let Some(descriptor) = self.load_descriptor(&dir, root.bundled) else {
                continue;
            };
            if self.is_disabled(&descriptor.name) {
                debug!(extension = %descriptor.name, "Extension disabled, skipped");
                continue;
            }
            insert_deduplicated(result, descriptor);
        }
    }

    /// Build the descriptor of one extension directory.
    ///
    /// Returns `None` when the directory contains no entry file.
    pub fn load_descriptor(&self, dir: &Path, bundled: bool) -> Option<ExtensionDescriptor> {
        let Some(entry) = self
            .config
            .entry_files
            .iter()
            .map(|file| dir.join(file))
            .find(|path| path.is_file())
        else {
            debug!(path = %dir.display(), "No entry file, not an extension");
            return None;
        };

        let manifest = read_manifest(dir);
        let dir_name = file_name(dir);

        let name: CompactString = manifest
            .id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(&dir_name)
            .into();
        let namespace: CompactString = match (&manifest.namespace, &manifest.id) {
            (Some(namespace), _) => namespace.as_str().into(),
            (None, Some(id)) => id.as_str().into(),
            (None, None) if bundled => dir_name.as_str().into(),
            (None, None) => idify(manifest.display_name(), &dir_name).into(),
        };

        Some(ExtensionDescriptor {
            name,
            namespace,
            path: dir.to_path_buf(),
            bundled,
            dynamic: true,
            manifest,
            entry: EntryLoader::File(entry),
        })
    }
}

fn read_manifest(dir: &Path) -> Manifest {
    let path = dir.join(MANIFEST_FILE);
    match fs::read_to_string(&path) {
        Ok(text) => Manifest::from_json(&text).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Failed to parse extension manifest");
            Manifest::default()
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(path = %dir.display(), "Extension has no manifest");
            Manifest::default()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read extension manifest");
            Manifest::default()
        }
    }
}

/// Keep the first copy of an extension unless `descriptor` is strictly newer.
fn insert_deduplicated(result: &mut ScanResult, descriptor: ExtensionDescriptor) {
    let Some(pos) = result
        .descriptors
        .iter()
        .position(|existing| existing.name == descriptor.name)
    else {
        result.descriptors.push(descriptor);
        return;
    };

    let existing = &result.descriptors[pos];
    if is_newer(&descriptor.version(), &existing.version()) {
        info!(
            extension = %descriptor.name,
            kept = %descriptor.path.display(),
            outdated = %existing.path.display(),
            "Newer copy of extension replaces earlier one"
        );
        result.outdated.push(existing.path.clone());
        result.descriptors[pos] = descriptor;
    } else {
        info!(
            extension = %descriptor.name,
            kept = %existing.path.display(),
            outdated = %descriptor.path.display(),
            "Duplicate extension is not newer, skipped"
        );
        result.outdated.push(descriptor.path);
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
