//! Per-extension view of the event bus.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use exthost_core::{ExtensionInfo, HostError};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::{
    AsyncListener, EventArgs, EventBus, Listener, ListenerId, ListenerOptions, WeakEventBus,
};

type Registered = Arc<Mutex<IndexMap<String, Vec<(Listener, ListenerId)>>>>;

/// Event bus adapter handed to a single extension.
///
/// Listeners are wrapped so failures are attributed to the extension and
/// panics stay contained. The adapter remembers which wrapper belongs to
/// which original listener, so [`remove_listener`](Self::remove_listener)
/// takes the callback the extension registered. It holds only a weak
/// reference to the bus; once the bus is gone every operation is a no-op.
#[derive(Clone)]
pub struct ExtEventHandler {
    bus: WeakEventBus,
    extension: ExtensionInfo,
    registered: Registered,
}

impl std::fmt::Debug for ExtEventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtEventHandler")
            .field("extension", &self.extension.name)
            .field("events", &self.registered.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExtEventHandler {
    /// Create the adapter for `extension`.
    pub fn new(bus: &EventBus, extension: ExtensionInfo) -> Self {
        Self {
            bus: bus.downgrade(),
            extension,
            registered: Arc::new(Mutex::new(IndexMap::new())),
        }
    }

    /// The extension this adapter belongs to.
    pub fn extension(&self) -> &ExtensionInfo {
        &self.extension
    }

    /// Add a listener.
    pub fn on(&self, event: &str, listener: Listener) -> &Self {
        self.add(event, listener, false, false)
    }

    /// Add a listener that is removed after its first call.
    pub fn once(&self, event: &str, listener: Listener) -> &Self {
        self.add(event, listener, true, false)
    }

    /// Add a listener in front of the existing ones.
    pub fn prepend_listener(&self, event: &str, listener: Listener) -> &Self {
        self.add(event, listener, false, true)
    }

    /// Add a single-shot listener in front of the existing ones.
    pub fn prepend_once_listener(&self, event: &str, listener: Listener) -> &Self {
        self.add(event, listener, true, true)
    }

    /// Remove a listener previously added through this adapter.
    ///
    /// `listener` is the callback that was passed in, not the wrapper.
    pub fn remove_listener(&self, event: &str, listener: &Listener) -> bool {
        let id = {
            let mut registered = self.registered.lock();
            let Some(entries) = registered.get_mut(event) else {
                return false;
            };
            let Some(pos) = entries
                .iter()
                .position(|(original, _)| Arc::ptr_eq(original, listener))
            else {
                return false;
            };
            let (_, id) = entries.remove(pos);
            if entries.is_empty() {
                registered.shift_remove(event);
            }
            id
        };
        self.bus
            .upgrade()
            .is_some_and(|bus| bus.remove_listener(event, id))
    }

    /// Remove this extension's listeners of one event, or of every event.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        let removed: Vec<(String, ListenerId)> = {
            let mut registered = self.registered.lock();
            let events: Vec<String> = match event {
                Some(event) => vec![event.to_string()],
                None => registered.keys().cloned().collect(),
            };
            events
                .into_iter()
                .filter_map(|event| registered.shift_remove(&event).map(|entries| (event, entries)))
                .flat_map(|(event, entries)| {
                    entries.into_iter().map(move |(_, id)| (event.clone(), id))
                })
                .collect()
        };
        if let Some(bus) = self.bus.upgrade() {
            for (event, id) in removed {
                bus.remove_listener(&event, id);
            }
        }
    }

    /// Number of listeners for an event, across all extensions.
    pub fn listener_count(&self, event: &str) -> usize {
        self.bus.upgrade().map_or(0, |bus| bus.listener_count(event))
    }

    /// Number of listeners this extension has for an event.
    pub fn own_listener_count(&self, event: &str) -> usize {
        self.registered.lock().get(event).map_or(0, Vec::len)
    }

    /// Events that have listeners, across all extensions.
    pub fn event_names(&self) -> Vec<String> {
        self.bus
            .upgrade()
            .map(|bus| bus.event_names())
            .unwrap_or_default()
    }

    /// Emit an event on the shared bus.
    pub fn emit(&self, event: &str, args: &[Value]) -> bool {
        self.bus.upgrade().is_some_and(|bus| bus.emit(event, args))
    }

    /// Emit an event on the shared bus and collect the enqueued results.
    pub async fn emit_and_await(&self, event: &str, args: &[Value]) -> Vec<Value> {
        match self.bus.upgrade() {
            Some(bus) => bus.emit_and_await(event, args).await,
            None => Vec::new(),
        }
    }

    /// Register an async listener attributed to this extension.
    pub fn on_async(&self, event: &str, listener: AsyncListener) -> Option<ListenerId> {
        let bus = self.bus.upgrade()?;
        Some(bus.on_async(event, listener, Some(self.extension.clone())))
    }

    fn add(&self, event: &str, listener: Listener, once: bool, prepend: bool) -> &Self {
        let Some(bus) = self.bus.upgrade() else {
            debug!(
                extension = %self.extension.name,
                event,
                "Event bus is gone, listener not registered"
            );
            return self;
        };

        let wrapper = self.wrap(listener.clone(), once);
        let id = bus.add_listener(
            event,
            wrapper,
            ListenerOptions {
                once,
                prepend,
                owner: Some(self.extension.clone()),
            },
        );
        self.registered
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((listener, id));
        self
    }

    fn wrap(&self, original: Listener, once: bool) -> Listener {
        let registered = self.registered.clone();
        let extension = self.extension.name.clone();
        Arc::new(move |args: &EventArgs<'_>| {
            if once {
                forget(&registered, args.event, &original);
            }
            match catch_unwind(AssertUnwindSafe(|| original(args))) {
                Ok(result) => result,
                Err(panic) => {
                    let err = HostError::from_panic(panic);
                    warn!(
                        extension = %extension,
                        event = args.event,
                        error = %err,
                        "Extension event handler panicked"
                    );
                    Err(err)
                }
            }
        })
    }
}

fn forget(registered: &Registered, event: &str, original: &Listener) {
    let mut registered = registered.lock();
    if let Some(entries) = registered.get_mut(event) {
        if let Some(pos) = entries.iter().position(|(l, _)| Arc::ptr_eq(l, original)) {
            entries.remove(pos);
        }
        if entries.is_empty() {
            registered.shift_remove(event);
        }
    }
}
