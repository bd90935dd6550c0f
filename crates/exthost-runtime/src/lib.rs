//! exthost-runtime - Extension discovery, registration and lifecycle.
//!
//! This crate drives the extension host:
//! - **Loader** scans user and bundled roots into a deduplicated registry
//! - **Registration proxy** records what extensions register and replays it later
//! - **Capability gate** keeps the shared api locked until an extension registered
//! - **Orchestrator** resolves requirements and runs ready hooks with timeouts
//!
//! # Example
//!
//! ```no_run
//! use exthost_core::HostConfig;
//! use exthost_runtime::ExtensionManager;
//!
//! # async fn run() -> exthost_core::HostResult<()> {
//! let mut manager = ExtensionManager::builder(HostConfig::default()).build()?;
//! manager.init_extensions()?;
//! for outcome in manager.do_once().await {
//!     println!("{}: {:?}", outcome.extension, outcome.status);
//! }
//! # Ok(())
//! # }
//! ```

mod context;
mod descriptor;
mod gate;
mod intent;
mod loader;
mod orchestrator;
mod progress;
mod quarantine;
mod timeout;
mod watch;

pub use context::{ExtensionContext, RegistrationProxy, Verdicts};
pub use descriptor::{
    BuiltinExtension, DescriptorSummary, EntryLoader, EntryResolver, ExtensionDescriptor, InitFn,
    ScanResult, StaticResolver, find_descriptor, idify, init_fn,
};
pub use gate::{GateState, GatedApi, HostApi, IdentityTranslator, LocalizedString, Translator};
pub use intent::{
    ApiFunction, IntentArgs, MigrationFn, ProviderFn, ReadyHook, RegisteredIntent, STATIC_APIS,
    api_function, calls, migration, provider, ready_hook,
};
pub use loader::{DescriptorLoader, MANIFEST_FILE};
pub use orchestrator::{
    ExtensionManager, ExtensionManagerBuilder, HookOutcome, HookStatus, remove_outdated_paths,
};
pub use progress::{LoadProgress, LoadingCallback};
pub use quarantine::{
    DISABLE_MARKER_PREFIX, PendingActions, consume_markers, list_markers, marker_path, write_marker,
};
pub use timeout::{QueryContinue, query_continue, with_timeout};
pub use watch::{StateWatches, WatchCallback, WatchId, watch_callback};
