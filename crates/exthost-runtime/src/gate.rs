//! The shared host api and its per-extension gate.

use std::fmt;
use std::sync::Arc;

use exthost_core::{
    Action, ErrorReport, ErrorReporter, ExtensionInfo, HostError, HostResult, StateSnapshot,
    StateStore,
};
use exthost_events::{AsyncListener, EventBus, ExtEventHandler, ListenerId};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::intent::ApiFunction;
use crate::watch::{StateWatches, WatchCallback, WatchId};

/// Looks up translated strings.
pub trait Translator: Send + Sync {
    fn translate(&self, key: &str, namespace: &str) -> String;
}

/// Translator returning the key unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTranslator;

impl Translator for IdentityTranslator {
    fn translate(&self, key: &str, _namespace: &str) -> String {
        key.to_string()
    }
}

/// A string marked for translation, resolved when it is displayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalizedString {
    pub key: String,
    pub namespace: String,
}

impl LocalizedString {
    pub fn resolve(&self, translator: &dyn Translator) -> String {
        translator.translate(&self.key, &self.namespace)
    }
}

impl fmt::Display for LocalizedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Api shared by all extensions.
///
/// There is one instance per host, passed by handle to every component that
/// needs it.
pub struct HostApi {
    events: EventBus,
    reporter: Arc<dyn ErrorReporter>,
    translator: Arc<dyn Translator>,
    store: RwLock<Option<Arc<dyn StateStore>>>,
    watches: StateWatches,
    ext: RwLock<IndexMap<String, ApiFunction>>,
    loaded: RwLock<Vec<ExtensionInfo>>,
}

impl fmt::Debug for HostApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostApi")
            .field("store", &self.store.read().is_some())
            .field("ext", &self.ext.read().keys().collect::<Vec<_>>())
            .field("loaded", &self.loaded.read().len())
            .finish()
    }
}

impl HostApi {
    pub fn new(
        events: EventBus,
        reporter: Arc<dyn ErrorReporter>,
        translator: Arc<dyn Translator>,
    ) -> Self {
        Self {
            events,
            reporter,
            translator,
            store: RwLock::new(None),
            watches: StateWatches::new(),
            ext: RwLock::new(IndexMap::new()),
            loaded: RwLock::new(Vec::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn reporter(&self) -> Arc<dyn ErrorReporter> {
        self.reporter.clone()
    }

    pub fn translator(&self) -> &dyn Translator {
        self.translator.as_ref()
    }

    /// Attach the state store and activate pending watches.
    pub fn attach_store(&self, store: Arc<dyn StateStore>) {
        *self.store.write() = Some(store.clone());
        self.watches.attach(store);
    }

    pub fn store(&self) -> HostResult<Arc<dyn StateStore>> {
        self.store.read().clone().ok_or(HostError::StoreUnavailable)
    }

    pub fn get_state(&self) -> HostResult<Arc<StateSnapshot>> {
        Ok(self.store()?.get_state())
    }

    pub fn dispatch(&self, action: Action) -> HostResult<()> {
        self.store()?.dispatch(action);
        Ok(())
    }

    /// Watch a state path. `owner` is used to attribute callback failures.
    pub fn on_state_change<S: AsRef<str>>(
        &self,
        path: &[S],
        callback: WatchCallback,
        owner: Option<ExtensionInfo>,
    ) -> WatchId {
        self.watches.add(path, callback, owner)
    }

    pub fn remove_state_watch(&self, id: WatchId) -> bool {
        self.watches.remove(id)
    }

    pub fn watches(&self) -> &StateWatches {
        &self.watches
    }

    /// Report an error to the user.
    pub fn show_error_notification(
        &self,
        title: &str,
        message: impl fmt::Display,
        extension: Option<&ExtensionInfo>,
    ) {
        self.reporter
            .report(ErrorReport::new(title, extension, message.to_string()));
    }

    pub(crate) fn set_ext(&self, name: &str, func: ApiFunction) -> bool {
        self.ext.write().insert(name.to_string(), func).is_some()
    }

    /// Call a function another extension added to the api.
    pub fn call_ext(&self, name: &str, args: &[Value]) -> HostResult<Value> {
        let func = self
            .ext
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::UnknownApi {
                name: name.to_string(),
            })?;
        func(args)
    }

    pub fn ext_names(&self) -> Vec<String> {
        self.ext.read().keys().cloned().collect()
    }

    pub(crate) fn set_loaded(&self, extensions: Vec<ExtensionInfo>) {
        *self.loaded.write() = extensions;
    }

    pub fn loaded_extensions(&self) -> Vec<ExtensionInfo> {
        self.loaded.read().clone()
    }
}

/// Whether a gate lets gated members through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Locked,
    Unlocked,
}

/// Per-extension view of the [`HostApi`].
///
/// While locked only identity and translation members work; everything
/// else fails with [`HostError::ApiNotReady`]. Clones share the lock state,
/// so unlocking also unlocks handles captured during registration.
#[derive(Clone)]
pub struct GatedApi {
    host: Arc<HostApi>,
    extension: ExtensionInfo,
    state: Arc<Mutex<GateState>>,
    events: ExtEventHandler,
}

impl fmt::Debug for GatedApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatedApi")
            .field("extension", &self.extension.name)
            .field("state", &self.state())
            .finish()
    }
}

impl GatedApi {
    /// Create a locked gate for `extension`.
    pub fn new(host: Arc<HostApi>, extension: ExtensionInfo) -> Self {
        let events = ExtEventHandler::new(host.events(), extension.clone());
        Self {
            host,
            extension,
            state: Arc::new(Mutex::new(GateState::Locked)),
            events,
        }
    }

    pub fn extension(&self) -> &ExtensionInfo {
        &self.extension
    }

    pub fn namespace(&self) -> &str {
        &self.extension.namespace
    }

    pub fn translate(&self, key: &str) -> String {
        self.host.translator().translate(key, &self.extension.namespace)
    }

    /// Mark a string for translation in this extension's namespace.
    pub fn later_t(&self, key: &str) -> LocalizedString {
        LocalizedString {
            key: key.to_string(),
            namespace: self.extension.namespace.to_string(),
        }
    }

    pub fn state(&self) -> GateState {
        *self.state.lock()
    }

    pub(crate) fn unlock(&self) {
        *self.state.lock() = GateState::Unlocked;
    }

    /// Relock every clone, used when an extension is unloaded after registering.
    pub(crate) fn lock(&self) {
        *self.state.lock() = GateState::Locked;
    }

    fn ensure_unlocked(&self, member: &'static str) -> HostResult<()> {
        match self.state() {
            GateState::Unlocked => Ok(()),
            GateState::Locked => Err(HostError::ApiNotReady {
                name: self.extension.name.to_string(),
                member,
            }),
        }
    }

    /// The event bus, scoped to this extension.
    pub fn events(&self) -> HostResult<&ExtEventHandler> {
        self.ensure_unlocked("events")?;
        Ok(&self.events)
    }

    pub async fn emit_and_await(&self, event: &str, args: &[Value]) -> HostResult<Vec<Value>> {
        self.ensure_unlocked("emit_and_await")?;
        Ok(self.events.emit_and_await(event, args).await)
    }

    /// Register an async listener attributed to this extension.
    pub fn on_async(&self, event: &str, listener: AsyncListener) -> HostResult<ListenerId> {
        self.ensure_unlocked("on_async")?;
        Ok(self
            .host
            .events()
            .on_async(event, listener, Some(self.extension.clone())))
    }

    /// Watch a state path; failures are attributed to this extension.
    pub fn on_state_change<S: AsRef<str>>(
        &self,
        path: &[S],
        callback: WatchCallback,
    ) -> HostResult<WatchId> {
        self.ensure_unlocked("on_state_change")?;
        Ok(self
            .host
            .on_state_change(path, callback, Some(self.extension.clone())))
    }

    pub fn show_error_notification(&self, title: &str, message: impl fmt::Display) -> HostResult<()> {
        self.ensure_unlocked("show_error_notification")?;
        self.host
            .show_error_notification(title, message, Some(&self.extension));
        Ok(())
    }

    pub fn store(&self) -> HostResult<Arc<dyn StateStore>> {
        self.ensure_unlocked("store")?;
        self.host.store()
    }

    pub fn get_state(&self) -> HostResult<Arc<StateSnapshot>> {
        self.ensure_unlocked("get_state")?;
        self.host.get_state()
    }

    pub fn dispatch(&self, action: Action) -> HostResult<()> {
        self.ensure_unlocked("dispatch")?;
        self.host.dispatch(action)
    }

    pub fn call_ext(&self, name: &str, args: &[Value]) -> HostResult<Value> {
        self.ensure_unlocked("ext")?;
        self.host.call_ext(name, args)
    }

    pub fn loaded_extensions(&self) -> HostResult<Vec<ExtensionInfo>> {
        self.ensure_unlocked("loaded_extensions")?;
        Ok(self.host.loaded_extensions())
    }
}
