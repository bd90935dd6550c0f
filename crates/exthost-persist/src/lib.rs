//! Extension-scoped persistence for exthost.
//!
//! An extension can take ownership of a hive of the application state by
//! registering a [`Persistor`]. The [`PersistenceBridge`] hydrates the hive
//! from the persistor once, then watches the store and writes back only the
//! leaves that changed, debounced per hive.

mod bridge;
mod diff;
mod persistor;

pub use bridge::{FlushState, PersistenceBridge};
pub use diff::{DiffOp, diff, unflatten};
pub use persistor::{MemoryPersistor, PersistKey, Persistor, ResetCallback};
