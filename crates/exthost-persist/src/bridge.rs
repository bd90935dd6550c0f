//! Debounced write-back of hives to their persistors.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use exthost_core::{
    Action, ErrorReport, ErrorReporter, ExtensionInfo, HostError, HostResult, StateStore,
    SubscriptionId,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diff::{DiffOp, diff, unflatten};
use crate::persistor::Persistor;

/// Write-back state of one hive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Nothing to write.
    Idle,

    /// A change is waiting for the debounce timer.
    PendingFlush {
        /// When the timer fires.
        deadline: Instant,
    },

    /// Changes are being written.
    Flushing,
}

struct Binding {
    hive: String,
    owner: Option<ExtensionInfo>,
    persistor: Arc<dyn Persistor>,
    debounce: Duration,
    /// Hive value the persistor currently reflects.
    last_snapshot: Mutex<Option<Arc<Value>>>,
    flush_state: Mutex<FlushState>,
    /// Serializes flushes and hydrations of this hive.
    flush_lock: tokio::sync::Mutex<()>,
    timer: Mutex<Option<CancellationToken>>,
    hydrating: AtomicBool,
}

impl Binding {
    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
    }

    fn differs_from_snapshot(&self, current: Option<&Arc<Value>>) -> bool {
        !same_hive(self.last_snapshot.lock().as_ref(), current)
    }
}

/// Reducers replace a hive when they change it, so identity is enough.
fn same_hive(a: Option<&Arc<Value>>, b: Option<&Arc<Value>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

struct BridgeInner {
    store: Arc<dyn StateStore>,
    reporter: Arc<dyn ErrorReporter>,
    runtime: Handle,
    default_debounce: Duration,
    bindings: Mutex<IndexMap<String, Arc<Binding>>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.get_mut().take() {
            self.store.unsubscribe(id);
        }
        for binding in self.bindings.get_mut().values() {
            binding.cancel_timer();
        }
    }
}

/// Keeps persistor-owned hives in sync with their persistors.
///
/// Each registered hive is hydrated from its persistor once. Afterwards every
/// store change that replaces the hive restarts a debounce timer; when it
/// fires, the leaves that differ from the last persisted snapshot are
/// written. A failed flush keeps the old snapshot, so the next change
/// retries the whole difference.
#[derive(Clone)]
pub struct PersistenceBridge {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for PersistenceBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceBridge")
            .field("hives", &self.hives())
            .finish()
    }
}

impl PersistenceBridge {
    /// Subscribe to `store`. Must be called from within a tokio runtime.
    pub fn attach(
        store: Arc<dyn StateStore>,
        reporter: Arc<dyn ErrorReporter>,
        default_debounce: Duration,
    ) -> HostResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| HostError::other("Persistence bridge requires a tokio runtime"))?;
        let inner = Arc::new(BridgeInner {
            store,
            reporter,
            runtime,
            default_debounce,
            bindings: Mutex::new(IndexMap::new()),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let id = inner.store.subscribe(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_store_change();
            }
        }));
        *inner.subscription.lock() = Some(id);
        Ok(Self { inner })
    }

    /// Register a persistor for `hive` and hydrate the hive from it.
    pub async fn register(
        &self,
        hive: &str,
        persistor: Arc<dyn Persistor>,
        debounce: Option<Duration>,
    ) -> HostResult<()> {
        self.register_for(None, hive, persistor, debounce).await
    }

    /// Register a persistor on behalf of an extension. Flush failures are
    /// attributed to `owner`.
    pub async fn register_for(
        &self,
        owner: Option<ExtensionInfo>,
        hive: &str,
        persistor: Arc<dyn Persistor>,
        debounce: Option<Duration>,
    ) -> HostResult<()> {
        let binding = {
            let mut bindings = self.inner.bindings.lock();
            if bindings.contains_key(hive) {
                return Err(HostError::Persistor {
                    hive: hive.to_string(),
                    message: "a persistor is already registered for this hive".to_string(),
                });
            }
            let binding = Arc::new(Binding {
                hive: hive.to_string(),
                owner,
                persistor,
                debounce: debounce.unwrap_or(self.inner.default_debounce),
                last_snapshot: Mutex::new(self.inner.store.get_state().hive(hive).cloned()),
                flush_state: Mutex::new(FlushState::Idle),
                flush_lock: tokio::sync::Mutex::new(()),
                timer: Mutex::new(None),
                hydrating: AtomicBool::new(true),
            });
            bindings.insert(hive.to_string(), binding.clone());
            binding
        };

        if let Err(e) = self.inner.hydrate(&binding).await {
            self.inner.bindings.lock().shift_remove(hive);
            return Err(e);
        }

        let weak_inner = Arc::downgrade(&self.inner);
        let weak_binding = Arc::downgrade(&binding);
        binding.persistor.set_reset_callback(Arc::new(move || {
            let (Some(inner), Some(binding)) = (weak_inner.upgrade(), weak_binding.upgrade())
            else {
                return;
            };
            let runtime = inner.runtime.clone();
            runtime.spawn(async move {
                if let Err(e) = inner.hydrate(&binding).await {
                    inner.report(&binding, "Failed to reload persisted state", &e);
                }
            });
        }));

        info!(hive, debounce_ms = binding.debounce.as_millis() as u64, "Persistor registered");
        Ok(())
    }

    /// Hydrate a hive from its persistor again.
    pub async fn reset(&self, hive: &str) -> HostResult<()> {
        let binding = self.binding(hive)?;
        self.inner.hydrate(&binding).await
    }

    /// Write pending changes of every hive immediately.
    pub async fn flush_all(&self) {
        let bindings: Vec<Arc<Binding>> = self.inner.bindings.lock().values().cloned().collect();
        for binding in bindings {
            binding.cancel_timer();
            self.inner.flush(&binding).await;
        }
    }

    /// Hives with a registered persistor.
    pub fn hives(&self) -> Vec<String> {
        self.inner.bindings.lock().keys().cloned().collect()
    }

    /// Write-back state of a hive.
    pub fn flush_state(&self, hive: &str) -> Option<FlushState> {
        self.inner
            .bindings
            .lock()
            .get(hive)
            .map(|binding| *binding.flush_state.lock())
    }

    fn binding(&self, hive: &str) -> HostResult<Arc<Binding>> {
        self.inner
            .bindings
            .lock()
            .get(hive)
            .cloned()
            .ok_or_else(|| HostError::Persistor {
                hive: hive.to_string(),
                message: "no persistor registered".to_string(),
            })
    }
}

impl BridgeInner {
    fn on_store_change(self: &Arc<Self>) {
        let state = self.store.get_state();
        let bindings: Vec<Arc<Binding>> = self.bindings.lock().values().cloned().collect();
        for binding in bindings {
            if binding.hydrating.load(Ordering::SeqCst) {
                continue;
            }
            if binding.differs_from_snapshot(state.hive(&binding.hive)) {
                self.schedule(&binding);
            }
        }
    }

    /// Restart the debounce timer of a hive.
    fn schedule(self: &Arc<Self>, binding: &Arc<Binding>) {
        let token = CancellationToken::new();
        if let Some(previous) = binding.timer.lock().replace(token.clone()) {
            previous.cancel();
        }
        *binding.flush_state.lock() = FlushState::PendingFlush {
            deadline: Instant::now() + binding.debounce,
        };

        let weak = Arc::downgrade(self);
        let binding = binding.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(binding.debounce) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.flush(&binding).await;
                    }
                }
            }
        });
    }

    async fn flush(&self, binding: &Binding) {
        let _guard = binding.flush_lock.lock().await;
        if binding.hydrating.load(Ordering::SeqCst) {
            return;
        }
        *binding.flush_state.lock() = FlushState::Flushing;

        let current = self.store.get_state().hive(&binding.hive).cloned();
        if binding.differs_from_snapshot(current.as_ref()) {
            let last = binding.last_snapshot.lock().clone();
            let ops = diff(
                last.as_deref().unwrap_or(&Value::Null),
                current.as_deref().unwrap_or(&Value::Null),
            );
            match apply(binding.persistor.as_ref(), &ops).await {
                Ok(()) => {
                    debug!(hive = %binding.hive, ops = ops.len(), "Persisted hive changes");
                    *binding.last_snapshot.lock() = current;
                }
                Err(e) => {
                    warn!(hive = %binding.hive, error = %e, "Failed to persist hive changes");
                    self.report(binding, "Failed to persist state", &e);
                }
            }
        }

        let mut state = binding.flush_state.lock();
        if *state == FlushState::Flushing {
            *state = FlushState::Idle;
        }
    }

    /// Replace the hive with the persisted data. Flushes are suppressed
    /// meanwhile. If the hive was edited while the persistor was read, the
    /// snapshot becomes the persisted data and a flush is scheduled so the
    /// edit is written; otherwise the snapshot is the hydrated hive.
    async fn hydrate(self: &Arc<Self>, binding: &Arc<Binding>) -> HostResult<()> {
        let guard = binding.flush_lock.lock().await;
        binding.hydrating.store(true, Ordering::SeqCst);
        binding.cancel_timer();
        *binding.flush_state.lock() = FlushState::Idle;
        let started = self.store.get_state().hive(&binding.hive).cloned();

        let outcome = match binding.persistor.get_all_kvs().await {
            Ok(kvs) => {
                let count = kvs.len();
                let persisted = unflatten(kvs);
                let before = self.store.get_state().hive(&binding.hive).cloned();
                let edited = !same_hive(started.as_ref(), before.as_ref());
                self.store
                    .dispatch(Action::hydrate(&binding.hive, persisted.clone()));
                *binding.last_snapshot.lock() = if edited {
                    Some(Arc::new(persisted))
                } else {
                    self.store.get_state().hive(&binding.hive).cloned()
                };
                debug!(hive = %binding.hive, keys = count, edited, "Hydrated hive");
                Ok(edited)
            }
            Err(e) => Err(HostError::Persistor {
                hive: binding.hive.clone(),
                message: e.to_string(),
            }),
        };

        binding.hydrating.store(false, Ordering::SeqCst);
        drop(guard);
        if outcome? {
            self.schedule(binding);
        }
        Ok(())
    }

    fn report(&self, binding: &Binding, title: &str, error: &HostError) {
        self.reporter.report(ErrorReport::new(
            title,
            binding.owner.as_ref(),
            format!("{}: {error}", binding.hive),
        ));
    }
}

async fn apply(persistor: &dyn Persistor, ops: &[DiffOp]) -> HostResult<()> {
    for op in ops {
        match op {
            DiffOp::Set { path, value } => {
                let encoded = serde_json::to_string(value)?;
                persistor.set_item(path, encoded).await?;
            }
            DiffOp::Remove { path } => persistor.remove_item(path).await?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use exthost_core::{MemoryReporter, MemoryStore, StateSnapshot};
    use serde_json::json;

    use exthost_core::BoxFuture;

    use super::*;
    use crate::persistor::{MemoryPersistor, PersistKey, ResetCallback};

    /// Memory persistor whose key listing takes a while.
    struct SlowReads {
        inner: Arc<MemoryPersistor>,
        delay: Duration,
    }

    impl Persistor for SlowReads {
        fn set_reset_callback(&self, callback: ResetCallback) {
            self.inner.set_reset_callback(callback);
        }

        fn get_item<'a>(&'a self, key: &'a [String]) -> BoxFuture<'a, HostResult<Option<String>>> {
            self.inner.get_item(key)
        }

        fn set_item<'a>(&'a self, key: &'a [String], value: String) -> BoxFuture<'a, HostResult<()>> {
            self.inner.set_item(key, value)
        }

        fn remove_item<'a>(&'a self, key: &'a [String]) -> BoxFuture<'a, HostResult<()>> {
            self.inner.remove_item(key)
        }

        fn get_all_keys(&self) -> BoxFuture<'_, HostResult<Vec<PersistKey>>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.inner.get_all_keys().await
            })
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        reporter: Arc<MemoryReporter>,
        bridge: PersistenceBridge,
    }

    fn fixture(initial: StateSnapshot) -> Fixture {
        let store = Arc::new(MemoryStore::new(initial));
        let reporter = Arc::new(MemoryReporter::new());
        let bridge =
            PersistenceBridge::attach(store.clone(), reporter.clone(), Duration::from_millis(200))
                .unwrap();
        Fixture {
            store,
            reporter,
            bridge,
        }
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_hydrates_without_write_back() {
        let fx = fixture(StateSnapshot::new().with_hive("prefs", json!({ "default": true })));
        let persistor = Arc::new(MemoryPersistor::with_data([
            (vec!["theme"], "\"dark\"".to_string()),
            (vec!["window", "width"], "800".to_string()),
        ]));

        fx.bridge.register("prefs", persistor.clone(), None).await.unwrap();
        assert_eq!(
            **fx.store.get_state().hive("prefs").unwrap(),
            json!({ "default": true, "theme": "dark", "window": { "width": 800 } })
        );

        settle(500).await;
        assert_eq!(persistor.write_count(), 0);
        assert_eq!(fx.bridge.flush_state("prefs"), Some(FlushState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_debounced_and_diffed() {
        let fx = fixture(StateSnapshot::new().with_hive("prefs", json!({ "a": 1, "b": 2 })));
        let persistor = Arc::new(MemoryPersistor::new());
        fx.bridge.register("prefs", persistor.clone(), None).await.unwrap();

        fx.store.dispatch(Action::set_value(&["prefs", "a"], json!(10)));
        assert!(matches!(
            fx.bridge.flush_state("prefs"),
            Some(FlushState::PendingFlush { .. })
        ));
        settle(150).await;
        fx.store.dispatch(Action::set_value(&["prefs", "c"], json!(3)));
        settle(150).await;
        assert_eq!(persistor.write_count(), 0);

        settle(100).await;
        assert_eq!(persistor.value(&["a"]), Some("10".into()));
        assert_eq!(persistor.value(&["c"]), Some("3".into()));
        assert_eq!(persistor.value(&["b"]), None);
        assert_eq!(persistor.write_count(), 2);
        assert_eq!(fx.bridge.flush_state("prefs"), Some(FlushState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_change_does_not_flush() {
        let fx = fixture(
            StateSnapshot::new()
                .with_hive("prefs", json!({ "a": 1 }))
                .with_hive("other", json!({})),
        );
        let persistor = Arc::new(MemoryPersistor::new());
        fx.bridge.register("prefs", persistor.clone(), None).await.unwrap();

        fx.store.dispatch(Action::set_value(&["other", "x"], json!(1)));
        assert_eq!(fx.bridge.flush_state("prefs"), Some(FlushState::Idle));
        settle(500).await;
        assert_eq!(persistor.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_retries_full_difference() {
        let fx = fixture(StateSnapshot::new().with_hive("prefs", json!({ "a": 1 })));
        let persistor = Arc::new(MemoryPersistor::with_data([(vec!["a"], "1".to_string())]));
        fx.bridge.register("prefs", persistor.clone(), None).await.unwrap();

        persistor.set_fail_writes(true);
        fx.store.dispatch(Action::set_value(&["prefs", "a"], json!(2)));
        settle(300).await;
        assert_eq!(persistor.value(&["a"]), Some("1".into()));
        let reports = fx.reporter.take();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].title, "Failed to persist state");

        persistor.set_fail_writes(false);
        fx.store.dispatch(Action::set_value(&["prefs", "b"], json!(true)));
        settle(300).await;
        assert_eq!(persistor.value(&["a"]), Some("2".into()));
        assert_eq!(persistor.value(&["b"]), Some("true".into()));
        assert!(fx.reporter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_rehydrates_without_write_back() {
        let fx = fixture(StateSnapshot::new().with_hive("prefs", json!({})));
        let persistor = Arc::new(MemoryPersistor::new());
        fx.bridge.register("prefs", persistor.clone(), None).await.unwrap();

        persistor.insert(["theme"], "\"light\"".to_string());
        assert!(persistor.request_reset());
        settle(10).await;
        assert_eq!(
            fx.store.get_state().get_path(&["prefs", "theme"]),
            Some(&json!("light"))
        );

        settle(500).await;
        assert_eq!(persistor.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_during_hydration_is_persisted() {
        let fx = fixture(StateSnapshot::new().with_hive("prefs", json!({})));
        let memory = Arc::new(MemoryPersistor::with_data([(
            vec!["theme"],
            "\"dark\"".to_string(),
        )]));
        let persistor = Arc::new(SlowReads {
            inner: memory.clone(),
            delay: Duration::from_millis(50),
        });

        let (registered, ()) = tokio::join!(
            fx.bridge.register("prefs", persistor, None),
            async {
                settle(10).await;
                fx.store.dispatch(Action::set_value(&["prefs", "user"], json!("edit")));
            }
        );
        registered.unwrap();
        assert_eq!(
            **fx.store.get_state().hive("prefs").unwrap(),
            json!({ "theme": "dark", "user": "edit" })
        );

        settle(300).await;
        assert_eq!(memory.value(&["user"]), Some("\"edit\"".into()));
        assert_eq!(memory.write_count(), 1);
        assert_eq!(fx.bridge.flush_state("prefs"), Some(FlushState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_during_reset_is_persisted() {
        let fx = fixture(StateSnapshot::new().with_hive("prefs", json!({})));
        let memory = Arc::new(MemoryPersistor::new());
        let persistor = Arc::new(SlowReads {
            inner: memory.clone(),
            delay: Duration::from_millis(50),
        });
        fx.bridge.register("prefs", persistor, None).await.unwrap();

        memory.insert(["theme"], "\"light\"".to_string());
        let (reset, ()) = tokio::join!(fx.bridge.reset("prefs"), async {
            settle(10).await;
            fx.store.dispatch(Action::set_value(&["prefs", "user"], json!("edit")));
        });
        reset.unwrap();

        settle(300).await;
        assert_eq!(memory.value(&["user"]), Some("\"edit\"".into()));
        assert_eq!(memory.value(&["theme"]), Some("\"light\"".into()));
        assert_eq!(memory.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_registration_rejected() {
        let fx = fixture(StateSnapshot::new());
        fx.bridge
            .register("prefs", Arc::new(MemoryPersistor::new()), None)
            .await
            .unwrap();
        let err = fx
            .bridge
            .register("prefs", Arc::new(MemoryPersistor::new()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Persistor { .. }));
        assert_eq!(fx.bridge.hives(), vec!["prefs".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_writes_immediately() {
        let fx = fixture(StateSnapshot::new());
        let persistor = Arc::new(MemoryPersistor::new());
        fx.bridge
            .register("session", persistor.clone(), Some(Duration::from_secs(10)))
            .await
            .unwrap();

        fx.store.dispatch(Action::set_hive("session", json!({ "open": ["a"] })));
        fx.bridge.flush_all().await;
        assert_eq!(persistor.value(&["open"]), Some("[\"a\"]".into()));
        assert_eq!(fx.bridge.flush_state("session"), Some(FlushState::Idle));
    }
}
