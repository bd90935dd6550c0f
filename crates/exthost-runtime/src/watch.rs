//! Path-based state change watches.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use exthost_core::{ExtensionInfo, HostError, HostResult, StateStore, SubscriptionId};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

/// Callback receiving the previous and the current value at a watched path.
pub type WatchCallback = Arc<dyn Fn(&Value, &Value) -> HostResult<()> + Send + Sync>;

/// Wrap a closure as a [`WatchCallback`].
pub fn watch_callback<F>(f: F) -> WatchCallback
where
    F: Fn(&Value, &Value) -> HostResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handle of a registered watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct Watch {
    id: WatchId,
    callback: WatchCallback,
    owner: Option<ExtensionInfo>,
}

#[derive(Default)]
struct PathWatches {
    last: Value,
    watches: Vec<Watch>,
}

#[derive(Default)]
struct WatchInner {
    paths: Mutex<IndexMap<Vec<String>, PathWatches>>,
    store: Mutex<Option<(Arc<dyn StateStore>, SubscriptionId)>>,
    next_id: AtomicU64,
}

/// Watches on paths of the state store.
///
/// Watches can be added before a store is attached; they start reporting
/// changes relative to the state at the time of attaching.
#[derive(Clone, Default)]
pub struct StateWatches {
    inner: Arc<WatchInner>,
}

impl std::fmt::Debug for StateWatches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateWatches")
            .field("paths", &self.inner.paths.lock().len())
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl StateWatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch the value at `path` (hive name first).
    pub fn add<S: AsRef<str>>(
        &self,
        path: &[S],
        callback: WatchCallback,
        owner: Option<ExtensionInfo>,
    ) -> WatchId {
        let key: Vec<String> = path.iter().map(|s| s.as_ref().to_string()).collect();
        let id = WatchId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let current = self.current_value(&key);

        let mut paths = self.inner.paths.lock();
        let entry = paths.entry(key).or_insert_with(|| PathWatches {
            last: current.unwrap_or(Value::Null),
            watches: Vec::new(),
        });
        entry.watches.push(Watch {
            id,
            callback,
            owner,
        });
        id
    }

    /// Remove a watch.
    pub fn remove(&self, id: WatchId) -> bool {
        let mut paths = self.inner.paths.lock();
        let mut removed = false;
        for watches in paths.values_mut() {
            let before = watches.watches.len();
            watches.watches.retain(|w| w.id != id);
            removed |= watches.watches.len() != before;
        }
        paths.retain(|_, watches| !watches.watches.is_empty());
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.paths.lock().values().map(|p| p.watches.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_attached(&self) -> bool {
        self.inner.store.lock().is_some()
    }

    /// Start following `store`. Replaces a previously attached store.
    pub fn attach(&self, store: Arc<dyn StateStore>) {
        self.detach();

        let state = store.get_state();
        for (path, watches) in self.inner.paths.lock().iter_mut() {
            watches.last = state.get_path(path).cloned().unwrap_or(Value::Null);
        }

        let weak = Arc::downgrade(&self.inner);
        let id = store.subscribe(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                StateWatches { inner }.on_change();
            }
        }));
        *self.inner.store.lock() = Some((store, id));
    }

    /// Stop following the attached store.
    pub fn detach(&self) {
        if let Some((store, id)) = self.inner.store.lock().take() {
            store.unsubscribe(id);
        }
    }

    fn current_value(&self, path: &[String]) -> Option<Value> {
        let store = self.inner.store.lock().as_ref().map(|(s, _)| s.clone())?;
        store.get_state().get_path(path).cloned()
    }

    fn on_change(&self) {
        let Some(store) = self.inner.store.lock().as_ref().map(|(s, _)| s.clone()) else {
            return;
        };
        let state = store.get_state();

        let mut fired: Vec<(Vec<String>, Value, Value, Vec<(WatchCallback, Option<ExtensionInfo>)>)> =
            Vec::new();
        {
            let mut paths = self.inner.paths.lock();
            for (path, watches) in paths.iter_mut() {
                let current = state.get_path(path).cloned().unwrap_or(Value::Null);
                if current == watches.last {
                    continue;
                }
                let previous = std::mem::replace(&mut watches.last, current.clone());
                let callbacks = watches
                    .watches
                    .iter()
                    .map(|w| (w.callback.clone(), w.owner.clone()))
                    .collect();
                fired.push((path.clone(), previous, current, callbacks));
            }
        }

        for (path, previous, current, callbacks) in fired {
            for (callback, owner) in callbacks {
                let result = catch_unwind(AssertUnwindSafe(|| callback(&previous, &current)))
                    .unwrap_or_else(|panic| Err(HostError::from_panic(panic)));
                if let Err(e) = result {
                    warn!(
                        extension = owner.as_ref().map(|o| o.name.as_str()).unwrap_or("host"),
                        path = %path.join("."),
                        error = %e,
                        "State change callback failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use exthost_core::{Action, MemoryStore, StateSnapshot};
    use serde_json::json;

    use super::*;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(
            StateSnapshot::new().with_hive("settings", json!({ "theme": "dark", "lang": "en" })),
        ))
    }

    fn recorder() -> (WatchCallback, Arc<Mutex<Vec<(Value, Value)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback = watch_callback(move |prev, cur| {
            sink.lock().push((prev.clone(), cur.clone()));
            Ok(())
        });
        (callback, seen)
    }

    #[test]
    fn test_fires_only_for_watched_path() {
        let store = store();
        let watches = StateWatches::new();
        let (callback, seen) = recorder();
        watches.add(&["settings", "theme"], callback, None);
        watches.attach(store.clone());

        store.dispatch(Action::set_value(&["settings", "lang"], json!("de")));
        assert!(seen.lock().is_empty());

        store.dispatch(Action::set_value(&["settings", "theme"], json!("light")));
        assert_eq!(*seen.lock(), vec![(json!("dark"), json!("light"))]);
    }

    #[test]
    fn test_failing_callback_does_not_stop_others() {
        let store = store();
        let watches = StateWatches::new();
        watches.attach(store.clone());
        watches.add(&["settings", "theme"], watch_callback(|_, _| panic!("bad watcher")), None);
        watches.add(
            &["settings", "theme"],
            watch_callback(|_, _| Err(HostError::other("refused"))),
            None,
        );
        let (callback, seen) = recorder();
        watches.add(&["settings", "theme"], callback, None);

        store.dispatch(Action::set_value(&["settings", "theme"], json!("light")));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_remove_and_detach() {
        let store = store();
        let watches = StateWatches::new();
        let (callback, seen) = recorder();
        let id = watches.add(&["settings", "theme"], callback, None);
        watches.attach(store.clone());
        assert_eq!(store.subscriber_count(), 1);

        assert!(watches.remove(id));
        assert!(watches.is_empty());
        store.dispatch(Action::set_value(&["settings", "theme"], json!("light")));
        assert!(seen.lock().is_empty());

        watches.detach();
        assert_eq!(store.subscriber_count(), 0);
    }
}
