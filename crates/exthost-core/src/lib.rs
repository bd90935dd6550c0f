//! Core types and traits for exthost.
//!
//! This crate provides the data structures shared by every part of the
//! extension runtime: extension metadata and manifests, load failure
//! verdicts, error reporting, host configuration and the boundary to the
//! application state store.

use std::future::Future;
use std::pin::Pin;

mod config;
mod error;
mod extension;
mod report;
mod state;
pub mod version;

pub use config::{ExtensionRoot, HostConfig, HostConfigBuilder};
pub use error::{HostError, HostResult};
pub use extension::{
    ExtensionInfo, ExtensionState, ExtensionStates, FailureKind, LoadFailure, Manifest,
    OptionalDependency,
};
pub use report::{ErrorReport, ErrorReporter, MemoryReporter, TracingReporter};
pub use state::{
    APP_HIVE, Action, MemoryStore, Reducer, SESSION_HIVE, StateListener, StateSnapshot,
    StateStore, SubscriptionId, actions, merge_value, remove_value_at, set_value_at, value_at,
};
pub use version::VersionRange;

/// Dynamic value passed between the host and extensions.
pub use serde_json::Value;

/// Type alias for boxed futures returned by async extension code.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
