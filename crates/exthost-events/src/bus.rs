//! The shared event bus.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use compact_str::CompactString;
use exthost_core::{
    ErrorReport, ErrorReporter, ExtensionInfo, HostError, HostResult, TracingReporter,
};
use futures::FutureExt;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

pub use exthost_core::BoxFuture;

/// A synchronous event listener.
pub type Listener = Arc<dyn Fn(&EventArgs<'_>) -> HostResult<()> + Send + Sync>;

/// An event listener returning a future.
pub type AsyncListener =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, HostResult<Value>> + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&EventArgs<'_>) -> HostResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap an async closure as an [`AsyncListener`].
pub fn async_listener<F, Fut>(f: F) -> AsyncListener
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HostResult<Value>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// Identifier of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Pending = (Option<ExtensionInfo>, BoxFuture<'static, HostResult<Value>>);

/// Handle through which a listener hands a result future to
/// [`EventBus::emit_and_await`].
pub struct Enqueue<'a> {
    owner: Option<&'a ExtensionInfo>,
    sink: &'a Mutex<Vec<Pending>>,
}

impl Enqueue<'_> {
    /// Add a future whose result is collected.
    pub fn push<F>(&self, fut: F)
    where
        F: Future<Output = HostResult<Value>> + Send + 'static,
    {
        self.push_boxed(Box::pin(fut));
    }

    /// Add an already boxed future.
    pub fn push_boxed(&self, fut: BoxFuture<'static, HostResult<Value>>) {
        self.sink.lock().push((self.owner.cloned(), fut));
    }
}

/// Arguments passed to a listener.
pub struct EventArgs<'a> {
    /// Event name.
    pub event: &'a str,

    /// Event arguments.
    pub args: &'a [Value],

    enqueue: Option<Enqueue<'a>>,
}

impl<'a> EventArgs<'a> {
    /// Arguments for a plain emit.
    pub fn new(event: &'a str, args: &'a [Value]) -> Self {
        Self {
            event,
            args,
            enqueue: None,
        }
    }

    /// Argument at `index`.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Enqueue handle, present when the event is emitted with
    /// [`EventBus::emit_and_await`].
    pub fn enqueue(&self) -> Option<&Enqueue<'a>> {
        self.enqueue.as_ref()
    }
}

/// Options for [`EventBus::add_listener`].
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    /// Remove the listener after its first call.
    pub once: bool,

    /// Call the listener before the existing ones.
    pub prepend: bool,

    /// Extension the listener belongs to.
    pub owner: Option<ExtensionInfo>,
}

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    listener: Listener,
    once: bool,
    owner: Option<ExtensionInfo>,
}

struct BusInner {
    listeners: Mutex<IndexMap<CompactString, Vec<Registration>>>,
    next_id: AtomicU64,
    reporter: Arc<dyn ErrorReporter>,
    max_listeners: usize,
}

/// Shared event bus.
///
/// Cloning is cheap; all clones refer to the same registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Non-owning handle to an [`EventBus`].
#[derive(Clone)]
pub struct WeakEventBus {
    inner: Weak<BusInner>,
}

impl WeakEventBus {
    /// The bus, if it is still alive.
    pub fn upgrade(&self) -> Option<EventBus> {
        self.inner.upgrade().map(|inner| EventBus { inner })
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.event_names())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Arc::new(TracingReporter))
    }
}

impl EventBus {
    /// Create a bus reporting listener failures to `reporter`.
    pub fn new(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self::with_max_listeners(reporter, 0)
    }

    /// Create a bus that warns when an event has more than `max_listeners`
    /// listeners (0 = unlimited).
    pub fn with_max_listeners(reporter: Arc<dyn ErrorReporter>, max_listeners: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(IndexMap::new()),
                next_id: AtomicU64::new(1),
                reporter,
                max_listeners,
            }),
        }
    }

    /// Non-owning handle to this bus.
    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The reporter used for listener failures.
    pub fn reporter(&self) -> Arc<dyn ErrorReporter> {
        self.inner.reporter.clone()
    }

    /// Register a listener with explicit options.
    pub fn add_listener(&self, event: &str, listener: Listener, options: ListenerOptions) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let registration = Registration {
            id,
            listener,
            once: options.once,
            owner: options.owner,
        };

        let mut listeners = self.inner.listeners.lock();
        let entries = listeners.entry(CompactString::from(event)).or_default();
        if options.prepend {
            entries.insert(0, registration);
        } else {
            entries.push(registration);
        }
        if self.inner.max_listeners > 0 && entries.len() == self.inner.max_listeners + 1 {
            warn!(
                event,
                count = entries.len(),
                "Possible listener leak: more listeners than the configured maximum"
            );
        }
        id
    }

    /// Add a listener.
    pub fn on(&self, event: &str, listener: Listener) -> ListenerId {
        self.add_listener(event, listener, ListenerOptions::default())
    }

    /// Add a listener that is removed after its first call.
    pub fn once(&self, event: &str, listener: Listener) -> ListenerId {
        self.add_listener(
            event,
            listener,
            ListenerOptions {
                once: true,
                ..Default::default()
            },
        )
    }

    /// Add a listener in front of the existing ones.
    pub fn prepend_listener(&self, event: &str, listener: Listener) -> ListenerId {
        self.add_listener(
            event,
            listener,
            ListenerOptions {
                prepend: true,
                ..Default::default()
            },
        )
    }

    /// Add a single-shot listener in front of the existing ones.
    pub fn prepend_once_listener(&self, event: &str, listener: Listener) -> ListenerId {
        self.add_listener(
            event,
            listener,
            ListenerOptions {
                once: true,
                prepend: true,
                owner: None,
            },
        )
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let Some(entries) = listeners.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|registration| registration.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.shift_remove(event);
        }
        removed
    }

    /// Remove all listeners of one event, or of every event.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        let mut listeners = self.inner.listeners.lock();
        match event {
            Some(event) => {
                listeners.shift_remove(event);
            }
            None => listeners.clear(),
        }
    }

    /// Number of listeners for an event.
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .listeners
            .lock()
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Events that have listeners, in order of first registration.
    pub fn event_names(&self) -> Vec<String> {
        self.inner
            .listeners
            .lock()
            .keys()
            .map(|name| name.to_string())
            .collect()
    }

    /// Call every listener of `event`. Returns whether there were listeners.
    ///
    /// Listener errors and panics are reported, never propagated.
    pub fn emit(&self, event: &str, args: &[Value]) -> bool {
        let registrations = self.take_for_emit(event);
        for registration in &registrations {
            self.call(registration, &EventArgs::new(event, args));
        }
        !registrations.is_empty()
    }

    /// Call every listener of `event` with an enqueue handle and wait for all
    /// enqueued futures.
    ///
    /// Returns the non-null results in listener-registration order. Failed
    /// futures are reported individually and left out.
    pub async fn emit_and_await(&self, event: &str, args: &[Value]) -> Vec<Value> {
        let sink: Mutex<Vec<Pending>> = Mutex::new(Vec::new());
        for registration in self.take_for_emit(event) {
            let event_args = EventArgs {
                event,
                args,
                enqueue: Some(Enqueue {
                    owner: registration.owner.as_ref(),
                    sink: &sink,
                }),
            };
            self.call(&registration, &event_args);
        }

        let (owners, pending): (Vec<_>, Vec<_>) = sink.into_inner().into_iter().unzip();
        let settled = join_all(
            pending
                .into_iter()
                .map(|fut| AssertUnwindSafe(fut).catch_unwind()),
        )
        .await;

        let mut results = Vec::with_capacity(settled.len());
        for (owner, outcome) in owners.iter().zip(settled) {
            match outcome.unwrap_or_else(|panic| Err(HostError::from_panic(panic))) {
                Ok(Value::Null) => {}
                Ok(value) => results.push(value),
                Err(e) => self.inner.reporter.report(ErrorReport::new(
                    format!("Unhandled error in event \"{event}\""),
                    owner.as_ref(),
                    e.to_string(),
                )),
            }
        }
        results
    }

    /// Register a listener that returns a future.
    ///
    /// With [`emit_and_await`](Self::emit_and_await) the future is collected.
    /// With a plain [`emit`](Self::emit) it is spawned on the current runtime
    /// and an "Invalid event handler" diagnostic is reported, followed by any
    /// failure of the future.
    pub fn on_async(
        &self,
        event: &str,
        listener: AsyncListener,
        owner: Option<ExtensionInfo>,
    ) -> ListenerId {
        let bus = self.downgrade();
        let wrapper_owner = owner.clone();
        let wrapper: Listener = Arc::new(move |event_args: &EventArgs<'_>| {
            let fut = listener(event_args.args.to_vec());
            match event_args.enqueue() {
                Some(enqueue) => enqueue.push_boxed(fut),
                None => {
                    if let Some(bus) = bus.upgrade() {
                        bus.run_detached(event_args.event, wrapper_owner.clone(), fut);
                    }
                }
            }
            Ok(())
        });
        self.add_listener(
            event,
            wrapper,
            ListenerOptions {
                owner,
                ..Default::default()
            },
        )
    }

    /// Emit `will-<name>`, run `op`, then emit `did-<name>` with the result
    /// prepended to `args`.
    pub async fn with_pre_post<F>(&self, name: &str, args: &[Value], op: F) -> HostResult<Value>
    where
        F: Future<Output = HostResult<Value>> + Send,
    {
        self.emit_and_await(&format!("will-{name}"), args).await;
        let result = op.await?;

        let mut did_args = Vec::with_capacity(args.len() + 1);
        did_args.push(result.clone());
        did_args.extend_from_slice(args);
        self.emit_and_await(&format!("did-{name}"), &did_args).await;
        Ok(result)
    }

    /// Snapshot the listeners of `event`, dropping single-shot ones from the registry.
    fn take_for_emit(&self, event: &str) -> Vec<Registration> {
        let mut listeners = self.inner.listeners.lock();
        let Some(entries) = listeners.get_mut(event) else {
            return Vec::new();
        };
        let snapshot = entries.clone();
        entries.retain(|registration| !registration.once);
        if entries.is_empty() {
            listeners.shift_remove(event);
        }
        snapshot
    }

    fn call(&self, registration: &Registration, event_args: &EventArgs<'_>) {
        let outcome = catch_unwind(AssertUnwindSafe(|| (registration.listener)(event_args)))
            .unwrap_or_else(|panic| Err(HostError::from_panic(panic)));
        if let Err(e) = outcome {
            self.inner.reporter.report(ErrorReport::new(
                format!("Event handler for \"{}\" failed", event_args.event),
                registration.owner.as_ref(),
                e.to_string(),
            ));
        }
    }

    fn run_detached(
        &self,
        event: &str,
        owner: Option<ExtensionInfo>,
        fut: BoxFuture<'static, HostResult<Value>>,
    ) {
        self.inner.reporter.report(
            ErrorReport::new(
                "Invalid event handler",
                owner.as_ref(),
                format!("Async handler for \"{event}\" was called without awaiting its result"),
            )
            .not_reportable(),
        );

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!(event, "No runtime to drive async handler, dropping it");
                return;
            }
        };
        let reporter = self.inner.reporter.clone();
        let event = event.to_string();
        handle.spawn(async move {
            let outcome = AssertUnwindSafe(fut)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HostError::from_panic(panic)));
            if let Err(e) = outcome {
                reporter.report(ErrorReport::new(
                    format!("Failed to call event {event}"),
                    owner.as_ref(),
                    e.to_string(),
                ));
            }
        });
    }
}
