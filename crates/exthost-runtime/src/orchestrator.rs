//! Extension lifecycle.
//!
//! Startup runs in this order:
//!
//! 1. [`ExtensionManager::builder`] consumes quarantine markers and scans
//!    the extension roots.
//! 2. [`init_extensions`](ExtensionManager::init_extensions) runs every
//!    registration function and resolves compatibility.
//! 3. [`set_store`](ExtensionManager::set_store) wires up the state store,
//!    flushes buffered actions and runs migrations.
//! 4. [`init_extension_persistors`](ExtensionManager::init_extension_persistors)
//!    and [`remove_outdated`](ExtensionManager::remove_outdated).
//! 5. [`do_once`](ExtensionManager::do_once) runs the ready hooks.

use std::fs;
use std::io::ErrorKind;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use compact_str::CompactString;
use exthost_core::{
    Action, BoxFuture, ErrorReport, ErrorReporter, ExtensionInfo, ExtensionStates, HostConfig,
    HostError, HostResult, LoadFailure, OptionalDependency, StateStore, TracingReporter, actions,
    version::{is_newer, parse_version, version_or_zero},
};
use exthost_events::EventBus;
use exthost_persist::PersistenceBridge;
use futures::FutureExt;
use indexmap::IndexMap;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::context::{ExtensionContext, RegistrationProxy, Verdicts};
use crate::descriptor::{
    BuiltinExtension, EntryLoader, EntryResolver, ExtensionDescriptor, StaticResolver,
    find_descriptor, is_within,
};
use crate::gate::{GatedApi, HostApi, IdentityTranslator, Translator};
use crate::intent::{IntentArgs, RegisteredIntent, calls};
use crate::loader::DescriptorLoader;
use crate::progress::{LoadProgress, LoadingCallback};
use crate::quarantine::{PendingActions, consume_markers, write_marker};
use crate::timeout::{QueryContinue, with_timeout};

const INIT_FAILED: &str = "Extension failed to initialize";

/// How a ready hook ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookStatus {
    Completed,
    TimedOut,
    Failed(String),
}

/// Result of one ready hook.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub extension: CompactString,
    pub call: CompactString,
    pub elapsed: Duration,
    pub status: HookStatus,
}

/// Builder for [`ExtensionManager`].
pub struct ExtensionManagerBuilder {
    config: HostConfig,
    resolver: Option<Arc<dyn EntryResolver>>,
    builtins: Vec<BuiltinExtension>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    translator: Option<Arc<dyn Translator>>,
    extension_states: ExtensionStates,
    further_apis: Vec<String>,
    query_continue: Option<QueryContinue>,
}

impl ExtensionManagerBuilder {
    /// How entry files become registration functions.
    pub fn resolver(mut self, resolver: Arc<dyn EntryResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Add an extension compiled into the host. Builtins load first, in the
    /// order they were added.
    pub fn builtin(mut self, extension: BuiltinExtension) -> Self {
        self.builtins.push(extension);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    /// Persisted extension states, read before the store is attached.
    pub fn extension_states(mut self, states: ExtensionStates) -> Self {
        self.extension_states = states;
        self
    }

    /// Registration names the host handles outside the fixed vocabulary.
    pub fn further_apis<I>(mut self, names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.further_apis.extend(names.into_iter().map(Into::into));
        self
    }

    /// Asked whether to keep waiting for a ready hook that timed out.
    pub fn query_continue(mut self, query: QueryContinue) -> Self {
        self.query_continue = Some(query);
        self
    }

    /// Consume quarantine markers, scan the roots and create the manager.
    pub fn build(self) -> HostResult<ExtensionManager> {
        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(TracingReporter));
        let translator = self
            .translator
            .unwrap_or_else(|| Arc::new(IdentityTranslator));
        let events = EventBus::with_max_listeners(reporter.clone(), self.config.max_listeners);
        let api = Arc::new(HostApi::new(events, reporter, translator));

        let quarantined = consume_markers(&self.config.temp_dir);
        let mut pending = PendingActions::new();
        for id in &quarantined {
            pending.push(Action::set_extension_enabled(id, false));
        }

        let enabled = |name: &str| {
            !quarantined.iter().any(|id| id == name)
                && self
                    .extension_states
                    .get(name)
                    .is_none_or(|state| state.enabled)
        };

        let mut descriptors: Vec<ExtensionDescriptor> = self
            .builtins
            .iter()
            .filter(|builtin| enabled(&builtin.name))
            .map(ExtensionDescriptor::builtin)
            .collect();

        let scan = DescriptorLoader::new(&self.config)
            .with_states(&self.extension_states)
            .with_disabled(quarantined.iter().cloned())
            .scan();
        for descriptor in scan.descriptors {
            if self.builtins.iter().any(|b| b.name == descriptor.name) {
                warn!(
                    extension = %descriptor.name,
                    path = %descriptor.path.display(),
                    "Extension has the name of a builtin, skipped"
                );
                continue;
            }
            descriptors.push(descriptor);
        }

        info!(
            count = descriptors.len(),
            outdated = scan.outdated.len(),
            quarantined = quarantined.len(),
            "Extensions discovered"
        );

        let (progress_tx, _) = broadcast::channel(100);
        Ok(ExtensionManager {
            config: self.config,
            descriptors,
            outdated: scan.outdated,
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(StaticResolver::new())),
            proxy: RegistrationProxy::new(),
            api,
            gates: IndexMap::new(),
            load_failures: Verdicts::new(),
            optional_extensions: IndexMap::new(),
            pending,
            further_apis: self.further_apis,
            query_continue: self.query_continue,
            bridge: None,
            loading_callbacks: Vec::new(),
            progress_tx,
        })
    }
}

/// Owns the extension registry and drives every startup phase.
pub struct ExtensionManager {
    config: HostConfig,
    descriptors: Vec<ExtensionDescriptor>,
    outdated: Vec<PathBuf>,
    resolver: Arc<dyn EntryResolver>,
    proxy: RegistrationProxy,
    api: Arc<HostApi>,
    gates: IndexMap<CompactString, GatedApi>,
    load_failures: Verdicts,
    optional_extensions: IndexMap<String, Vec<OptionalDependency>>,
    pending: PendingActions,
    further_apis: Vec<String>,
    query_continue: Option<QueryContinue>,
    bridge: Option<PersistenceBridge>,
    loading_callbacks: Vec<LoadingCallback>,
    progress_tx: broadcast::Sender<LoadProgress>,
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("descriptors", &self.descriptors.len())
            .field("outdated", &self.outdated)
            .field("load_failures", &self.load_failures)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl ExtensionManager {
    pub fn builder(config: HostConfig) -> ExtensionManagerBuilder {
        ExtensionManagerBuilder {
            config,
            resolver: None,
            builtins: Vec::new(),
            reporter: None,
            translator: None,
            extension_states: ExtensionStates::new(),
            further_apis: Vec::new(),
            query_continue: None,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Extensions in load order.
    pub fn descriptors(&self) -> &[ExtensionDescriptor] {
        &self.descriptors
    }

    /// Directories superseded by another copy, not yet removed.
    pub fn outdated(&self) -> &[PathBuf] {
        &self.outdated
    }

    pub fn load_failures(&self) -> &Verdicts {
        &self.load_failures
    }

    pub fn optional_extensions(&self) -> &IndexMap<String, Vec<OptionalDependency>> {
        &self.optional_extensions
    }

    pub fn pending_actions(&self) -> &PendingActions {
        &self.pending
    }

    pub fn api(&self) -> &Arc<HostApi> {
        &self.api
    }

    pub fn events(&self) -> &EventBus {
        self.api.events()
    }

    pub fn proxy(&self) -> &RegistrationProxy {
        &self.proxy
    }

    pub fn bridge(&self) -> Option<&PersistenceBridge> {
        self.bridge.as_ref()
    }

    /// Gated api of a successfully registered extension.
    pub fn gate(&self, extension: &str) -> Option<&GatedApi> {
        self.gates.get(extension)
    }

    /// Names of extensions that registered without any failure.
    pub fn loaded(&self) -> Vec<&str> {
        self.descriptors
            .iter()
            .map(|d| d.name.as_str())
            .filter(|name| !self.load_failures.contains_key(*name))
            .collect()
    }

    /// Receive progress of the ready phase.
    pub fn subscribe(&self) -> broadcast::Receiver<LoadProgress> {
        self.progress_tx.subscribe()
    }

    /// Called before each ready hook with `(Some(extension), index)` and
    /// once with `(None, total)` at the end.
    pub fn on_loading_extension(&mut self, callback: LoadingCallback) {
        self.loading_callbacks.push(callback);
    }

    /// Quarantine an extension so it is disabled at the next start.
    pub fn quarantine(&self, extension_id: &str) -> HostResult<PathBuf> {
        write_marker(&self.config.temp_dir, extension_id)
    }

    fn info_of(&self, extension: &str) -> ExtensionInfo {
        find_descriptor(&self.descriptors, extension)
            .map(ExtensionDescriptor::info)
            .unwrap_or_else(|| ExtensionInfo::builtin(extension))
    }

    fn report(&self, title: &str, extension: &ExtensionInfo, error: &HostError) {
        self.api
            .reporter()
            .report(ErrorReport::new(title, Some(extension), error.to_string()));
    }

    /// Run every registration function, then resolve compatibility.
    ///
    /// A failing builtin aborts startup. A failing dynamic extension gets an
    /// `exception` verdict and everything it registered is dropped.
    pub fn init_extensions(&mut self) -> HostResult<()> {
        let started = Instant::now();
        let descriptors = self.descriptors.clone();

        for descriptor in &descriptors {
            let info = descriptor.info();
            self.proxy.set_extension(&descriptor.name, &descriptor.path);
            let gate = GatedApi::new(self.api.clone(), info);
            let context = self.proxy.context(gate.clone());

            let before = Instant::now();
            match self.run_init(descriptor, &context) {
                Ok(()) => {
                    gate.unlock();
                    self.gates.insert(descriptor.name.clone(), gate);
                    debug!(
                        extension = %descriptor.name,
                        elapsed_ms = before.elapsed().as_millis() as u64,
                        "Extension registered"
                    );
                }
                Err(e) if !descriptor.dynamic => {
                    error!(extension = %descriptor.name, error = %e, "Core extension failed to initialize");
                    return Err(HostError::Registration {
                        name: descriptor.name.to_string(),
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(extension = %descriptor.name, error = %e, "Extension failed to initialize");
                    self.proxy.drop_calls(&descriptor.name);
                    self.load_failures
                        .entry(descriptor.name.to_string())
                        .or_default()
                        .push(LoadFailure::exception(&e));
                }
            }
        }

        let host_version = self
            .config
            .enforce_host_version
            .then(|| self.config.host_semver());
        let verdicts =
            self.proxy
                .unload_incompatible(&self.further_apis, &self.descriptors, host_version.as_ref());
        self.proxy.end_registration();

        for (extension, failures) in verdicts {
            self.load_failures
                .entry(extension)
                .or_default()
                .extend(failures);
        }
        let failures = &self.load_failures;
        self.gates.retain(|name, gate| {
            let keep = !failures.contains_key(name.as_str());
            if !keep {
                gate.lock();
            }
            keep
        });
        self.optional_extensions = self.proxy.get_optional_extensions(&self.descriptors);
        self.apply_api_additions();

        let loaded: Vec<ExtensionInfo> = self
            .descriptors
            .iter()
            .filter(|d| !self.load_failures.contains_key(d.name.as_str()))
            .map(ExtensionDescriptor::info)
            .collect();
        info!(
            loaded = loaded.len(),
            failed = self.load_failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "All extensions initialized"
        );
        self.api.set_loaded(loaded);
        Ok(())
    }

    fn run_init(&self, descriptor: &ExtensionDescriptor, context: &ExtensionContext) -> HostResult<()> {
        catch_unwind(AssertUnwindSafe(|| {
            let init = match &descriptor.entry {
                EntryLoader::Builtin(init) => init.clone(),
                EntryLoader::File(_) => self.resolver.resolve(descriptor)?,
            };
            init(context)
        }))
        .unwrap_or_else(|panic| Err(HostError::from_panic(panic)))
    }

    fn apply_api_additions(&self) {
        for intent in self.proxy.get_calls(calls::REGISTER_API) {
            let IntentArgs::Api { name, func } = intent.args else {
                continue;
            };
            if self.api.set_ext(&name, func) {
                warn!(extension = %intent.extension, name = %name, "Api function replaced");
            }
        }
    }

    /// Attach the state store.
    ///
    /// Dispatches buffered actions and the load report, starts the
    /// persistence bridge and runs pending migrations.
    pub async fn set_store(&mut self, store: Arc<dyn StateStore>) -> HostResult<()> {
        self.api.attach_store(store.clone());

        let flushed = self.pending.flush(store.as_ref());
        if flushed > 0 {
            info!(count = flushed, "Buffered extension actions applied");
        }

        store.dispatch(Action::new(
            actions::SET_EXTENSION_LOAD_FAILURES,
            serde_json::to_value(&self.load_failures)?,
        ));
        store.dispatch(Action::new(
            actions::SET_OPTIONAL_EXTENSIONS,
            serde_json::to_value(&self.optional_extensions)?,
        ));

        self.bridge = Some(PersistenceBridge::attach(
            store.clone(),
            self.api.reporter(),
            Duration::from_millis(self.config.default_debounce_ms),
        )?);

        self.migrate_extensions(store.as_ref()).await;
        Ok(())
    }

    async fn migrate_extensions(&self, store: &dyn StateStore) {
        let states = store.get_state().extension_states();
        let migrations = self.proxy.get_calls(calls::REGISTER_MIGRATION);

        for descriptor in self.descriptors.iter().filter(|d| d.dynamic) {
            let name = descriptor.name.as_str();
            let current = descriptor.manifest.version.as_str();
            if self.load_failures.contains_key(name) || current.is_empty() {
                continue;
            }

            let stored = states.get(name).and_then(|state| state.version.clone());
            let old = match stored {
                Some(version) if parse_version(&version).is_some() => version,
                Some(version) => {
                    error!(extension = name, version = %version, "Invalid stored extension version");
                    "0.0.0".to_string()
                }
                None => "0.0.0".to_string(),
            };
            if old == current {
                continue;
            }

            if is_newer(&descriptor.version(), &version_or_zero(&old)) {
                let own: Vec<&RegisteredIntent> =
                    migrations.iter().filter(|i| i.extension == name).collect();
                if !own.is_empty() {
                    info!(extension = name, from = %old, to = current, "Migrating extension");
                }
                let mut failed = false;
                for intent in own {
                    let IntentArgs::Migration(migration) = &intent.args else {
                        continue;
                    };
                    let old = old.clone();
                    if let Err(e) = run_guarded(|| migration(old)).await {
                        error!(extension = name, error = %e, "Extension migration failed");
                        self.report("Extension failed to migrate", &descriptor.info(), &e);
                        failed = true;
                        break;
                    }
                }
                if failed {
                    continue;
                }
            }
            store.dispatch(Action::set_extension_version(name, current));
        }
    }

    /// Register every persistor extensions asked for and hydrate its hive.
    ///
    /// Returns the number of persistors registered.
    pub async fn init_extension_persistors(&self) -> HostResult<usize> {
        let bridge = self.bridge.as_ref().ok_or(HostError::StoreUnavailable)?;
        let mut count = 0;
        for intent in self.proxy.get_calls(calls::REGISTER_PERSISTOR) {
            let IntentArgs::Persistor {
                hive,
                persistor,
                debounce,
            } = intent.args
            else {
                continue;
            };
            let info = self.info_of(&intent.extension);
            match bridge
                .register_for(Some(info.clone()), &hive, persistor, debounce)
                .await
            {
                Ok(()) => count += 1,
                Err(e) => {
                    warn!(extension = %intent.extension, hive = %hive, error = %e, "Failed to register persistor");
                    self.report("Failed to register persistor", &info, &e);
                }
            }
        }
        Ok(count)
    }

    /// Delete outdated extension copies and extensions flagged for removal.
    ///
    /// Returns the deleted directories.
    pub fn remove_outdated(&mut self) -> HostResult<Vec<PathBuf>> {
        let store = self.api.store()?;
        let mut removed = remove_outdated_paths(&self.config, &self.outdated);
        self.outdated.clear();

        let states = store.get_state().extension_states();
        for (id, _) in states.iter().filter(|(_, state)| state.remove) {
            if let Some(root) = self.config.user_root() {
                let path = root.join(id);
                match fs::remove_dir_all(&path) {
                    Ok(()) => {
                        info!(extension = %id, path = %path.display(), "Extension removed");
                        removed.push(path);
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(extension = %id, error = %e, "Failed to remove extension");
                        continue;
                    }
                }
            }
            store.dispatch(Action::forget_extension(id));
        }
        Ok(removed)
    }

    /// Invoke `handler` for every recorded call of `call`, in registration
    /// order. A failing handler is reported and the rest still run.
    ///
    /// Returns the number of calls handled successfully.
    pub fn apply<F>(&self, call: &str, mut handler: F) -> usize
    where
        F: FnMut(&RegisteredIntent, &ExtensionInfo) -> HostResult<()>,
    {
        let mut applied = 0;
        for intent in self.proxy.get_calls(call) {
            let info = self.info_of(&intent.extension);
            let result = catch_unwind(AssertUnwindSafe(|| handler(&intent, &info)))
                .unwrap_or_else(|panic| Err(HostError::from_panic(panic)));
            match result {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!(extension = %intent.extension, call, error = %e, "Failed to apply registration");
                    self.report(INIT_FAILED, &info, &e);
                }
            }
        }
        applied
    }

    /// Hand calls addressed to capability providers to their handlers.
    pub fn apply_extensions_of_extensions(&self) {
        for (info, e) in self.proxy.invoke_additions(&self.descriptors) {
            warn!(extension = %info.name, error = %e, "Failed to apply extension addition");
            self.report(INIT_FAILED, &info, &e);
        }
    }

    /// Run all ready hooks, one at a time, in registration order.
    pub async fn do_once(&self) -> Vec<HookOutcome> {
        let hooks = self.proxy.get_calls_merged(&[calls::ONCE, calls::ONCE_MAIN]);
        let total = hooks.len();
        let timeout = Duration::from_millis(self.config.ready_timeout_ms);
        let slow = Duration::from_millis(self.config.slow_init_threshold_ms);
        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(total);

        for (index, intent) in hooks.iter().enumerate() {
            self.notify(LoadProgress::running(&intent.extension, index, total, started.elapsed()));
            let IntentArgs::ReadyHook(hook) = &intent.args else {
                continue;
            };

            let before = Instant::now();
            let result = with_timeout(
                run_guarded(|| hook()),
                timeout,
                &intent.extension,
                self.query_continue.as_ref(),
            )
            .await;
            let elapsed = before.elapsed();

            let info = self.info_of(&intent.extension);
            let status = match result {
                Ok(()) => {
                    if elapsed > slow {
                        debug!(
                            extension = %intent.extension,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Extension was slow to initialize"
                        );
                    }
                    HookStatus::Completed
                }
                Err(e) if e.is_timeout() => {
                    warn!(extension = %intent.extension, error = %e, "Extension initialization timed out");
                    self.api.reporter().report(
                        ErrorReport::new(
                            INIT_FAILED,
                            Some(&info),
                            "Initialization didn't finish in time.",
                        )
                        .not_reportable(),
                    );
                    HookStatus::TimedOut
                }
                Err(e) => {
                    warn!(extension = %intent.extension, error = %e, "Extension initialization failed");
                    self.report(INIT_FAILED, &info, &e);
                    HookStatus::Failed(e.to_string())
                }
            };
            outcomes.push(HookOutcome {
                extension: intent.extension.clone(),
                call: intent.call.clone(),
                elapsed,
                status,
            });
        }

        self.notify(LoadProgress::done(total, started.elapsed()));
        info!(hooks = total, elapsed_ms = started.elapsed().as_millis() as u64, "Extensions ready");
        outcomes
    }

    fn notify(&self, progress: LoadProgress) {
        for callback in &self.loading_callbacks {
            callback(progress.extension.as_deref(), progress.index);
        }
        let _ = self.progress_tx.send(progress);
    }
}

/// Delete outdated copies that live under a user root. Copies under a
/// bundled root are left in place.
pub fn remove_outdated_paths(config: &HostConfig, paths: &[PathBuf]) -> Vec<PathBuf> {
    let user_roots: Vec<&Path> = config
        .roots
        .iter()
        .filter(|root| !root.bundled)
        .map(|root| root.path.as_path())
        .collect();

    let mut removed = Vec::new();
    for path in paths {
        if !user_roots.iter().any(|root| is_within(path, root)) {
            info!(path = %path.display(), "Outdated copy is in a bundled root, left in place");
            continue;
        }
        match fs::remove_dir_all(path) {
            Ok(()) => {
                info!(path = %path.display(), "Outdated extension removed");
                removed.push(path.clone());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove outdated extension"),
        }
    }
    removed
}

/// Run an extension-supplied async function, turning panics into errors.
async fn run_guarded<F>(make: F) -> HostResult<()>
where
    F: FnOnce() -> BoxFuture<'static, HostResult<()>>,
{
    let fut = catch_unwind(AssertUnwindSafe(make)).map_err(HostError::from_panic)?;
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(HostError::from_panic(panic)))
}
