//! Boundary to the application state store.
//!
//! The host never owns application state. It reads snapshots, dispatches
//! actions and subscribes to changes through [`StateStore`]. A snapshot maps
//! hive names to reference-counted values; a hive that did not change keeps
//! the same `Arc`, so change detection is a pointer comparison.
//!
//! [`MemoryStore`] is a small reference implementation used by the CLI and
//! in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::extension::{ExtensionState, ExtensionStates};

/// Well-known action kinds.
pub mod actions {
    /// Merge persisted data into a hive. Payload: `{ hive, data }`.
    pub const HYDRATE: &str = "__hydrate";

    /// Replace a whole hive. Payload: `{ hive, value }`.
    pub const SET_HIVE: &str = "SET_HIVE";

    /// Set a nested value. Payload: `{ path: [hive, key, ...], value }`.
    pub const SET_VALUE: &str = "SET_VALUE";

    /// Payload: `{ extension_id, enabled }`.
    pub const SET_EXTENSION_ENABLED: &str = "SET_EXTENSION_ENABLED";

    /// Mark an extension for removal at next startup. Payload: `{ extension_id }`.
    pub const REMOVE_EXTENSION: &str = "REMOVE_EXTENSION";

    /// Drop all state about an extension. Payload: `{ extension_id }`.
    pub const FORGET_EXTENSION: &str = "FORGET_EXTENSION";

    /// Payload: `{ extension_id, version }`.
    pub const SET_EXTENSION_VERSION: &str = "SET_EXTENSION_VERSION";

    /// Payload: map of extension name to load failures.
    pub const SET_EXTENSION_LOAD_FAILURES: &str = "SET_EXTENSION_LOAD_FAILURES";

    /// Payload: map of extension name to missing optional dependencies.
    pub const SET_OPTIONAL_EXTENSIONS: &str = "SET_OPTIONAL_EXTENSIONS";
}

/// Hive holding durable application state, including extension states.
pub const APP_HIVE: &str = "app";

/// Hive holding per-session state such as load failures.
pub const SESSION_HIVE: &str = "session";

/// An action dispatched to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action type.
    pub kind: String,

    /// Action payload.
    #[serde(default)]
    pub payload: Value,
}

impl Action {
    /// Create an action.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Action merging persisted data into a hive.
    pub fn hydrate(hive: &str, data: Value) -> Self {
        Self::new(actions::HYDRATE, json!({ "hive": hive, "data": data }))
    }

    /// Action replacing a whole hive.
    pub fn set_hive(hive: &str, value: Value) -> Self {
        Self::new(actions::SET_HIVE, json!({ "hive": hive, "value": value }))
    }

    /// Action setting a nested value.
    pub fn set_value(path: &[&str], value: Value) -> Self {
        Self::new(actions::SET_VALUE, json!({ "path": path, "value": value }))
    }

    /// Action enabling or disabling an extension.
    pub fn set_extension_enabled(extension_id: &str, enabled: bool) -> Self {
        Self::new(
            actions::SET_EXTENSION_ENABLED,
            json!({ "extension_id": extension_id, "enabled": enabled }),
        )
    }

    /// Action recording the last seen version of an extension.
    pub fn set_extension_version(extension_id: &str, version: &str) -> Self {
        Self::new(
            actions::SET_EXTENSION_VERSION,
            json!({ "extension_id": extension_id, "version": version }),
        )
    }

    /// Action marking an extension for removal.
    pub fn remove_extension(extension_id: &str) -> Self {
        Self::new(
            actions::REMOVE_EXTENSION,
            json!({ "extension_id": extension_id }),
        )
    }

    /// Action dropping all state about an extension.
    pub fn forget_extension(extension_id: &str) -> Self {
        Self::new(
            actions::FORGET_EXTENSION,
            json!({ "extension_id": extension_id }),
        )
    }
}

/// Immutable view of the store: hive name to hive value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    hives: IndexMap<String, Arc<Value>>,
}

impl StateSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a hive.
    pub fn hive(&self, name: &str) -> Option<&Arc<Value>> {
        self.hives.get(name)
    }

    /// Replace a hive, returning the modified snapshot.
    pub fn with_hive(mut self, name: impl Into<String>, value: Value) -> Self {
        self.hives.insert(name.into(), Arc::new(value));
        self
    }

    /// Names of all hives.
    pub fn hive_names(&self) -> impl Iterator<Item = &str> {
        self.hives.keys().map(String::as_str)
    }

    /// Value at a path whose first segment is the hive name.
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let (hive, rest) = path.split_first()?;
        let value = self.hives.get(hive.as_ref())?;
        value_at(value, rest)
    }

    /// Extension states stored in the application hive.
    pub fn extension_states(&self) -> ExtensionStates {
        self.get_path(&[APP_HIVE, "extensions"])
            .and_then(Value::as_object)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(id, state)| {
                        serde_json::from_value::<ExtensionState>(state.clone())
                            .ok()
                            .map(|state| (id.clone(), state))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Value at a nested object path.
pub fn value_at<'a, S: AsRef<str>>(value: &'a Value, path: &[S]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |current, key| current.get(key.as_ref()))
}

/// Set a nested value, creating intermediate objects as needed.
pub fn set_value_at<S: AsRef<str>>(target: &mut Value, path: &[S], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *target = value;
        return;
    };
    let mut current = target;
    for key in parents {
        current = object_mut(current)
            .entry(key.as_ref().to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    object_mut(current).insert(last.as_ref().to_string(), value);
}

/// Remove a nested value. Returns whether something was removed.
pub fn remove_value_at<S: AsRef<str>>(target: &mut Value, path: &[S]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut current = target;
    for key in parents {
        match current.get_mut(key.as_ref()) {
            Some(next) => current = next,
            None => return false,
        }
    }
    current
        .as_object_mut()
        .is_some_and(|map| map.remove(last.as_ref()).is_some())
}

/// Recursively merge `source` into `target`. Objects merge, everything else replaces.
pub fn merge_value(target: &mut Value, source: Value) {
    match source {
        Value::Object(source) => {
            let target = object_mut(target);
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_value(existing, value);
                    }
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        other => *target = other,
    }
}

fn object_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced by an object"),
    }
}

/// Callback invoked after every dispatch.
pub type StateListener = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`StateStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Read/dispatch/subscribe interface of the application state store.
pub trait StateStore: Send + Sync {
    /// Current snapshot.
    fn get_state(&self) -> Arc<StateSnapshot>;

    /// Dispatch an action.
    fn dispatch(&self, action: Action);

    /// Register a change listener.
    fn subscribe(&self, listener: StateListener) -> SubscriptionId;

    /// Remove a change listener. Stores whose listeners live as long as
    /// the store itself can keep the default.
    fn unsubscribe(&self, id: SubscriptionId) {
        let _ = id;
    }
}

/// Reducer for actions the store does not handle itself.
///
/// Returns the new hive value, or `None` when the action does not apply.
pub type Reducer = Arc<dyn Fn(&Value, &Action) -> Option<Value> + Send + Sync>;

/// In-memory [`StateStore`].
pub struct MemoryStore {
    state: Mutex<Arc<StateSnapshot>>,
    listeners: Mutex<IndexMap<SubscriptionId, StateListener>>,
    reducers: Mutex<Vec<(String, Reducer)>>,
    dispatched: Mutex<Vec<Action>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("state", &*self.state.lock())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StateSnapshot::default())
    }
}

impl MemoryStore {
    /// Create a store with an initial snapshot.
    pub fn new(initial: StateSnapshot) -> Self {
        Self {
            state: Mutex::new(Arc::new(initial)),
            listeners: Mutex::new(IndexMap::new()),
            reducers: Mutex::new(Vec::new()),
            dispatched: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a reducer for a hive.
    pub fn add_reducer(&self, hive: impl Into<String>, reducer: Reducer) {
        self.reducers.lock().push((hive.into(), reducer));
    }

    /// All actions dispatched so far, in order.
    pub fn dispatched(&self) -> Vec<Action> {
        self.dispatched.lock().clone()
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Compute the hives changed by an action.
    fn reduce(&self, state: &StateSnapshot, action: &Action) -> Vec<(String, Value)> {
        let payload = &action.payload;
        let str_field = |name: &str| payload.get(name).and_then(Value::as_str).map(str::to_string);
        let hive_value = |hive: &str| state.hive(hive).map(|v| (**v).clone()).unwrap_or(Value::Null);

        match action.kind.as_str() {
            actions::HYDRATE => {
                let Some(hive) = str_field("hive") else {
                    return Vec::new();
                };
                let mut value = hive_value(&hive);
                merge_value(&mut value, payload.get("data").cloned().unwrap_or(Value::Null));
                vec![(hive, value)]
            }
            actions::SET_HIVE => match str_field("hive") {
                Some(hive) => vec![(hive, payload.get("value").cloned().unwrap_or(Value::Null))],
                None => Vec::new(),
            },
            actions::SET_VALUE => {
                let path: Vec<String> = payload
                    .get("path")
                    .and_then(|p| serde_json::from_value(p.clone()).ok())
                    .unwrap_or_default();
                let Some((hive, rest)) = path.split_first() else {
                    return Vec::new();
                };
                let mut value = hive_value(hive);
                set_value_at(&mut value, rest, payload.get("value").cloned().unwrap_or(Value::Null));
                vec![(hive.clone(), value)]
            }
            actions::SET_EXTENSION_ENABLED
            | actions::SET_EXTENSION_VERSION
            | actions::REMOVE_EXTENSION
            | actions::FORGET_EXTENSION => {
                let Some(id) = str_field("extension_id") else {
                    return Vec::new();
                };
                let mut value = hive_value(APP_HIVE);
                let path = ["extensions", id.as_str()];
                let mut ext = value_at(&value, &path)
                    .and_then(|v| serde_json::from_value::<ExtensionState>(v.clone()).ok())
                    .unwrap_or_default();
                match action.kind.as_str() {
                    actions::SET_EXTENSION_ENABLED => {
                        ext.enabled = payload.get("enabled").and_then(Value::as_bool).unwrap_or(true);
                    }
                    actions::SET_EXTENSION_VERSION => ext.version = str_field("version"),
                    actions::REMOVE_EXTENSION => ext.remove = true,
                    _ => {
                        remove_value_at(&mut value, &path);
                        return vec![(APP_HIVE.to_string(), value)];
                    }
                }
                match serde_json::to_value(ext) {
                    Ok(ext) => set_value_at(&mut value, &path, ext),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize extension state"),
                }
                vec![(APP_HIVE.to_string(), value)]
            }
            actions::SET_EXTENSION_LOAD_FAILURES | actions::SET_OPTIONAL_EXTENSIONS => {
                let key = if action.kind == actions::SET_EXTENSION_LOAD_FAILURES {
                    "loadFailures"
                } else {
                    "optional"
                };
                let mut value = hive_value(SESSION_HIVE);
                set_value_at(&mut value, &["extensions", key], payload.clone());
                vec![(SESSION_HIVE.to_string(), value)]
            }
            _ => {
                let reducers = self.reducers.lock().clone();
                let mut changed: Vec<(String, Value)> = Vec::new();
                for (hive, reducer) in reducers {
                    let current = changed
                        .iter()
                        .rev()
                        .find(|(name, _)| *name == hive)
                        .map(|(_, v)| v.clone())
                        .unwrap_or_else(|| hive_value(&hive));
                    if let Some(next) = reducer(&current, action) {
                        changed.push((hive, next));
                    }
                }
                changed
            }
        }
    }
}

impl StateStore for MemoryStore {
    fn get_state(&self) -> Arc<StateSnapshot> {
        self.state.lock().clone()
    }

    fn dispatch(&self, action: Action) {
        {
            let mut state = self.state.lock();
            let changes = self.reduce(&state, &action);
            if !changes.is_empty() {
                let mut next = (**state).clone();
                for (hive, value) in changes {
                    let unchanged = next.hives.get(&hive).is_some_and(|old| **old == value);
                    if !unchanged {
                        next.hives.insert(hive, Arc::new(value));
                    }
                }
                *state = Arc::new(next);
            }
            self.dispatched.lock().push(action);
        }

        // Listeners may dispatch again, so no lock is held while notifying.
        let listeners: Vec<StateListener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener();
        }
    }

    fn subscribe(&self, listener: StateListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(id, listener);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().shift_remove(&id);
    }
}
