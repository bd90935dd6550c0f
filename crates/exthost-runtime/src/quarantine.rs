//! Crash quarantine markers and actions buffered until the store exists.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use exthost_core::{Action, HostResult, StateStore};
use tracing::{error, info, warn};

/// File name prefix of a disable marker; the extension id follows it.
pub const DISABLE_MARKER_PREFIX: &str = "__disable_";

/// Path of the disable marker for `extension_id`.
pub fn marker_path(dir: &Path, extension_id: &str) -> PathBuf {
    dir.join(format!("{DISABLE_MARKER_PREFIX}{extension_id}"))
}

/// Write a marker so `extension_id` is disabled at the next start.
pub fn write_marker(dir: &Path, extension_id: &str) -> HostResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = marker_path(dir, extension_id);
    fs::write(&path, b"")?;
    info!(extension = extension_id, path = %path.display(), "Extension quarantined");
    Ok(path)
}

/// Ids of all pending markers, without consuming them.
pub fn list_markers(dir: &Path) -> HostResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut ids: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(DISABLE_MARKER_PREFIX))
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
        .collect();
    ids.sort();
    Ok(ids)
}

/// Read and delete all markers, returning the extension ids.
///
/// Markers that cannot be deleted are still returned.
pub fn consume_markers(dir: &Path) -> Vec<String> {
    let ids = match list_markers(dir) {
        Ok(ids) => ids,
        Err(e) => {
            error!(path = %dir.display(), error = %e, "Failed to read quarantine markers");
            return Vec::new();
        }
    };
    for id in &ids {
        info!(extension = %id, "Extension crashed last session, disabling it");
        let path = marker_path(dir, id);
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove quarantine marker");
        }
    }
    ids
}

/// Actions queued before the state store is available.
#[derive(Debug, Default)]
pub struct PendingActions {
    actions: Vec<Action>,
}

impl PendingActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Dispatch everything queued, in order.
    pub fn flush(&mut self, store: &dyn StateStore) -> usize {
        let count = self.actions.len();
        for action in self.actions.drain(..) {
            store.dispatch(action);
        }
        count
    }
}
