//! Event aggregation for exthost.
//!
//! [`EventBus`] is a synchronous listener registry with two additions: listeners
//! can hand back futures that [`EventBus::emit_and_await`] collects, and
//! listeners registered through [`EventBus::on_async`] return futures directly.
//! [`ExtEventHandler`] is the per-extension view of the bus that attributes
//! errors to the extension and lets it remove listeners by the original
//! callback.

mod bus;
mod handler;

pub use bus::{
    AsyncListener, BoxFuture, Enqueue, EventArgs, EventBus, Listener, ListenerId, ListenerOptions,
    WeakEventBus, async_listener, listener,
};
pub use handler::ExtEventHandler;
