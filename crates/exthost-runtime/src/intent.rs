//! Recorded registration calls.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use compact_str::CompactString;
use exthost_core::{BoxFuture, ExtensionInfo, HostResult, Reducer};
use exthost_persist::Persistor;
use serde_json::Value;

/// Names of the registration calls the host understands.
pub mod calls {
    pub const REGISTER_ACTION: &str = "register_action";
    pub const REGISTER_REDUCER: &str = "register_reducer";
    pub const REGISTER_SETTINGS: &str = "register_settings";
    pub const REGISTER_PERSISTOR: &str = "register_persistor";
    pub const REGISTER_API: &str = "register_api";
    pub const REGISTER_MIGRATION: &str = "register_migration";
    pub const REQUIRE_EXTENSION: &str = "require_extension";
    pub const REQUIRE_VERSION: &str = "require_version";
    pub const ONCE: &str = "once";
    pub const ONCE_MAIN: &str = "once_main";
}

/// The registration vocabulary known without any capability provider.
pub const STATIC_APIS: &[&str] = &[
    calls::REGISTER_ACTION,
    calls::REGISTER_REDUCER,
    calls::REGISTER_SETTINGS,
    calls::REGISTER_PERSISTOR,
    calls::REGISTER_API,
    calls::REGISTER_MIGRATION,
    calls::REQUIRE_EXTENSION,
    calls::REQUIRE_VERSION,
    calls::ONCE,
    calls::ONCE_MAIN,
];

/// Asynchronous hook run after all extensions registered.
pub type ReadyHook = Arc<dyn Fn() -> BoxFuture<'static, HostResult<()>> + Send + Sync>;

/// Wrap an async closure as a [`ReadyHook`].
pub fn ready_hook<F, Fut>(f: F) -> ReadyHook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HostResult<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Migration run with the previously recorded version of the extension.
pub type MigrationFn = Arc<dyn Fn(String) -> BoxFuture<'static, HostResult<()>> + Send + Sync>;

/// Wrap an async closure as a [`MigrationFn`].
pub fn migration<F, Fut>(f: F) -> MigrationFn
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HostResult<()>> + Send + 'static,
{
    Arc::new(move |old| Box::pin(f(old)))
}

/// Function an extension adds to the shared api.
pub type ApiFunction = Arc<dyn Fn(&[Value]) -> HostResult<Value> + Send + Sync>;

/// Wrap a closure as an [`ApiFunction`].
pub fn api_function<F>(f: F) -> ApiFunction
where
    F: Fn(&[Value]) -> HostResult<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handler a capability provider installs for its registration name.
///
/// Invoked once per recorded call with the arguments, the calling
/// extension's directory and its identity.
pub type ProviderFn =
    Arc<dyn Fn(&IntentArgs, &Path, &ExtensionInfo) -> HostResult<()> + Send + Sync>;

pub fn provider<F>(f: F) -> ProviderFn
where
    F: Fn(&IntentArgs, &Path, &ExtensionInfo) -> HostResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Arguments of a recorded call.
#[derive(Clone)]
pub enum IntentArgs {
    /// Plain values, used by `register_action`, `register_settings` and
    /// calls outside the fixed vocabulary.
    Values(Vec<Value>),

    RequireExtension {
        id: String,
        version: Option<String>,
        optional: bool,
    },

    RequireVersion {
        range: String,
    },

    Reducer {
        path: Vec<String>,
        reducer: Reducer,
    },

    Persistor {
        hive: String,
        persistor: Arc<dyn Persistor>,
        debounce: Option<Duration>,
    },

    Api {
        name: String,
        func: ApiFunction,
    },

    Migration(MigrationFn),

    ReadyHook(ReadyHook),
}

impl IntentArgs {
    /// The plain values of a generic call.
    pub fn values(&self) -> Option<&[Value]> {
        match self {
            Self::Values(values) => Some(values),
            _ => None,
        }
    }
}

impl std::fmt::Debug for IntentArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Values(values) => f.debug_tuple("Values").field(values).finish(),
            Self::RequireExtension {
                id,
                version,
                optional,
            } => f
                .debug_struct("RequireExtension")
                .field("id", id)
                .field("version", version)
                .field("optional", optional)
                .finish(),
            Self::RequireVersion { range } => f
                .debug_struct("RequireVersion")
                .field("range", range)
                .finish(),
            Self::Reducer { path, .. } => f.debug_struct("Reducer").field("path", path).finish(),
            Self::Persistor { hive, debounce, .. } => f
                .debug_struct("Persistor")
                .field("hive", hive)
                .field("debounce", debounce)
                .finish(),
            Self::Api { name, .. } => f.debug_struct("Api").field("name", name).finish(),
            Self::Migration(_) => f.write_str("Migration"),
            Self::ReadyHook(_) => f.write_str("ReadyHook"),
        }
    }
}

/// One call an extension made during registration.
#[derive(Debug, Clone)]
pub struct RegisteredIntent {
    /// Position in the global registration order.
    pub seq: u64,

    /// Name of the extension that made the call.
    pub extension: CompactString,

    /// Directory of that extension.
    pub extension_path: PathBuf,

    /// Name of the registration call.
    pub call: CompactString,

    pub args: IntentArgs,

    /// Recorded through the lenient facade.
    pub optional: bool,
}
