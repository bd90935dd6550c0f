//! Registration proxy and the context handed to extension init functions.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use compact_str::CompactString;
use exthost_core::{
    ExtensionInfo, HostError, LoadFailure, OptionalDependency, Reducer, version::VersionRange,
    version::satisfies,
};
use exthost_persist::Persistor;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::descriptor::{ExtensionDescriptor, find_descriptor};
use crate::gate::GatedApi;
use crate::intent::{
    ApiFunction, IntentArgs, MigrationFn, ProviderFn, ReadyHook, RegisteredIntent, STATIC_APIS,
    calls,
};

/// Compatibility verdicts keyed by extension name.
pub type Verdicts = IndexMap<String, Vec<LoadFailure>>;

struct Provider {
    owner: CompactString,
    handler: ProviderFn,
}

struct ProxyState {
    intents: IndexMap<CompactString, Vec<RegisteredIntent>>,
    providers: IndexMap<CompactString, Provider>,
    current: Option<(CompactString, PathBuf)>,
    may_register: bool,
    next_seq: u64,
}

/// Records registration calls made by extensions so they can be replayed
/// once every extension has registered.
#[derive(Clone)]
pub struct RegistrationProxy {
    state: Arc<Mutex<ProxyState>>,
}

impl Default for RegistrationProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegistrationProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RegistrationProxy")
            .field("calls", &state.intents.keys().collect::<Vec<_>>())
            .field("providers", &state.providers.keys().collect::<Vec<_>>())
            .field("may_register", &state.may_register)
            .finish()
    }
}

impl RegistrationProxy {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProxyState {
                intents: IndexMap::new(),
                providers: IndexMap::new(),
                current: None,
                may_register: true,
                next_seq: 0,
            })),
        }
    }

    /// Point the proxy at the extension about to register.
    pub fn set_extension(&self, name: &str, path: &Path) {
        self.state.lock().current = Some((name.into(), path.to_path_buf()));
    }

    /// Context for the current extension.
    pub fn context(&self, api: GatedApi) -> ExtensionContext {
        let (extension, extension_path) = self
            .state
            .lock()
            .current
            .clone()
            .unwrap_or_else(|| (api.extension().name.clone(), api.extension().path.clone()));
        ExtensionContext {
            proxy: self.clone(),
            api,
            extension,
            extension_path,
            optional: false,
        }
    }

    /// Stop accepting registrations.
    pub fn end_registration(&self) {
        self.state.lock().may_register = false;
    }

    pub fn may_register(&self) -> bool {
        self.state.lock().may_register
    }

    fn record(
        &self,
        extension: &CompactString,
        extension_path: &Path,
        call: &str,
        args: IntentArgs,
        optional: bool,
    ) {
        let mut state = self.state.lock();
        if !state.may_register {
            warn!(
                extension = %extension,
                call,
                "Extension tried to register outside of its init function, ignored"
            );
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .intents
            .entry(call.into())
            .or_default()
            .push(RegisteredIntent {
                seq,
                extension: extension.clone(),
                extension_path: extension_path.to_path_buf(),
                call: call.into(),
                args,
                optional,
            });
    }

    fn add_provider(&self, owner: &CompactString, name: &str, handler: ProviderFn) {
        let mut state = self.state.lock();
        if !state.may_register {
            warn!(extension = %owner, name, "Extension tried to add a provider after registration, ignored");
            return;
        }
        if let Some(previous) = state.providers.insert(
            name.into(),
            Provider {
                owner: owner.clone(),
                handler,
            },
        ) {
            warn!(name, previous = %previous.owner, replaced_by = %owner, "Provider replaced");
        }
    }

    /// Recorded calls of one name, in registration order.
    pub fn get_calls(&self, call: &str) -> Vec<RegisteredIntent> {
        self.state
            .lock()
            .intents
            .get(call)
            .cloned()
            .unwrap_or_default()
    }

    /// Recorded calls of several names, merged in registration order.
    pub fn get_calls_merged(&self, calls: &[&str]) -> Vec<RegisteredIntent> {
        let state = self.state.lock();
        let mut merged: Vec<RegisteredIntent> = calls
            .iter()
            .filter_map(|call| state.intents.get(*call))
            .flatten()
            .cloned()
            .collect();
        merged.sort_by_key(|intent| intent.seq);
        merged
    }

    /// Every recorded call, in registration order.
    pub fn all_intents(&self) -> Vec<RegisteredIntent> {
        let state = self.state.lock();
        let mut all: Vec<RegisteredIntent> = state.intents.values().flatten().cloned().collect();
        all.sort_by_key(|intent| intent.seq);
        all
    }

    pub fn intents_of(&self, extension: &str) -> Vec<RegisteredIntent> {
        self.all_intents()
            .into_iter()
            .filter(|intent| intent.extension == extension)
            .collect()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.state
            .lock()
            .providers
            .keys()
            .map(|name| name.to_string())
            .collect()
    }

    /// Forget everything an extension registered.
    pub fn drop_calls(&self, extension: &str) {
        let mut state = self.state.lock();
        for intents in state.intents.values_mut() {
            intents.retain(|intent| intent.extension != extension);
        }
        state.intents.retain(|_, intents| !intents.is_empty());
        state.providers.retain(|_, provider| provider.owner != extension);
    }

    /// Check every recorded call against the known api surface and the
    /// declared requirements, then purge all calls of extensions that failed.
    ///
    /// `host_version` is `None` when host version requirements are not
    /// enforced.
    pub fn unload_incompatible(
        &self,
        further_apis: &[String],
        descriptors: &[ExtensionDescriptor],
        host_version: Option<&semver::Version>,
    ) -> Verdicts {
        let mut verdicts = Verdicts::new();
        {
            let state = self.state.lock();
            let known = |call: &str| {
                STATIC_APIS.contains(&call)
                    || further_apis.iter().any(|api| api == call)
                    || state.providers.contains_key(call)
            };

            for (call, intents) in &state.intents {
                if known(call.as_str()) {
                    continue;
                }
                for intent in intents.iter().filter(|intent| !intent.optional) {
                    verdicts
                        .entry(intent.extension.to_string())
                        .or_default()
                        .push(LoadFailure::unsupported_api(call));
                }
            }

            for intent in state.intents.get(calls::REQUIRE_EXTENSION).into_iter().flatten() {
                let IntentArgs::RequireExtension {
                    id,
                    version,
                    optional: false,
                } = &intent.args
                else {
                    continue;
                };
                let failure = match find_descriptor(descriptors, id) {
                    None => Some(LoadFailure::missing_dependency(id)),
                    Some(target) => version.as_deref().and_then(|range| {
                        (!satisfies(&target.manifest.version, range, true)).then(|| {
                            LoadFailure::version_mismatch(id, range, &target.manifest.version)
                        })
                    }),
                };
                if let Some(failure) = failure {
                    verdicts
                        .entry(intent.extension.to_string())
                        .or_default()
                        .push(failure);
                }
            }

            if let Some(host_version) = host_version {
                for intent in state.intents.get(calls::REQUIRE_VERSION).into_iter().flatten() {
                    let IntentArgs::RequireVersion { range } = &intent.args else {
                        continue;
                    };
                    let supported = VersionRange::parse(range)
                        .map(|r| r.matches(host_version, true))
                        .unwrap_or(false);
                    if !supported {
                        verdicts
                            .entry(intent.extension.to_string())
                            .or_default()
                            .push(LoadFailure::unsupported_host_version(range));
                    }
                }
            }
        }

        for (extension, failures) in &verdicts {
            warn!(
                extension = %extension,
                failures = ?failures.iter().map(|f| f.kind.as_ref()).collect::<Vec<_>>(),
                "Extension is incompatible and will not be loaded"
            );
            self.drop_calls(extension);
        }
        verdicts
    }

    /// Optional dependencies that are not installed, keyed by the extension
    /// that asked for them.
    pub fn get_optional_extensions(
        &self,
        descriptors: &[ExtensionDescriptor],
    ) -> IndexMap<String, Vec<OptionalDependency>> {
        let mut missing: IndexMap<String, Vec<OptionalDependency>> = IndexMap::new();
        for intent in self.get_calls(calls::REQUIRE_EXTENSION) {
            let IntentArgs::RequireExtension {
                id,
                version,
                optional: true,
            } = intent.args
            else {
                continue;
            };
            if find_descriptor(descriptors, &id).is_some() {
                continue;
            }
            debug!(extension = %intent.extension, dependency = %id, "Optional dependency missing");
            missing
                .entry(intent.extension.to_string())
                .or_default()
                .push(OptionalDependency {
                    id,
                    version,
                    extension_path: intent.extension_path,
                });
        }
        missing
    }

    /// Replay the calls recorded under each provider's name into its handler.
    ///
    /// Returns the failures, attributed to the calling extension.
    pub fn invoke_additions(
        &self,
        descriptors: &[ExtensionDescriptor],
    ) -> Vec<(ExtensionInfo, HostError)> {
        let providers: Vec<(CompactString, ProviderFn)> = self
            .state
            .lock()
            .providers
            .iter()
            .map(|(name, provider)| (name.clone(), provider.handler.clone()))
            .collect();

        let mut failures = Vec::new();
        for (name, handler) in providers {
            for intent in self.get_calls(&name) {
                let info = find_descriptor(descriptors, &intent.extension)
                    .map(ExtensionDescriptor::info)
                    .unwrap_or_else(|| ExtensionInfo::builtin(intent.extension.clone()));
                let result = catch_unwind(AssertUnwindSafe(|| {
                    handler(&intent.args, &intent.extension_path, &info)
                }))
                .unwrap_or_else(|panic| Err(HostError::from_panic(panic)));
                if let Err(e) = result {
                    failures.push((info, e));
                }
            }
        }
        failures
    }
}

/// Handle an extension registers itself through.
///
/// Every method only records the call; nothing takes effect until the host
/// replays it. Calls made after registration ended are ignored.
#[derive(Clone)]
pub struct ExtensionContext {
    proxy: RegistrationProxy,
    api: GatedApi,
    extension: CompactString,
    extension_path: PathBuf,
    optional: bool,
}

impl std::fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("extension", &self.extension)
            .field("optional", &self.optional)
            .finish()
    }
}

impl ExtensionContext {
    /// The (gated) host api.
    pub fn api(&self) -> &GatedApi {
        &self.api
    }

    /// Facade whose calls are lenient: unknown calls do not make the
    /// extension incompatible and required extensions may be missing.
    pub fn optional(&self) -> ExtensionContext {
        Self {
            optional: true,
            ..self.clone()
        }
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    fn record(&self, call: &str, args: IntentArgs) {
        self.proxy
            .record(&self.extension, &self.extension_path, call, args, self.optional);
    }

    pub fn register_action(&self, group: &str, id: &str, options: Value) {
        self.record(
            calls::REGISTER_ACTION,
            IntentArgs::Values(vec![Value::from(group), Value::from(id), options]),
        );
    }

    /// Reducer for the state below `path` (hive name first).
    pub fn register_reducer(&self, path: &[&str], reducer: Reducer) {
        self.record(
            calls::REGISTER_REDUCER,
            IntentArgs::Reducer {
                path: path.iter().map(|s| s.to_string()).collect(),
                reducer,
            },
        );
    }

    pub fn register_settings(&self, title: &str, options: Value) {
        self.record(
            calls::REGISTER_SETTINGS,
            IntentArgs::Values(vec![Value::from(title), options]),
        );
    }

    /// Back the `hive` with an external store.
    pub fn register_persistor(
        &self,
        hive: &str,
        persistor: Arc<dyn Persistor>,
        debounce: Option<Duration>,
    ) {
        self.record(
            calls::REGISTER_PERSISTOR,
            IntentArgs::Persistor {
                hive: hive.to_string(),
                persistor,
                debounce,
            },
        );
    }

    /// Add a function to the shared api.
    pub fn register_api(&self, name: &str, func: ApiFunction) {
        self.record(
            calls::REGISTER_API,
            IntentArgs::Api {
                name: name.to_string(),
                func,
            },
        );
    }

    pub fn register_migration(&self, migration: MigrationFn) {
        self.record(calls::REGISTER_MIGRATION, IntentArgs::Migration(migration));
    }

    /// Require another extension, optionally within a version range.
    pub fn require_extension(&self, id: &str, version: Option<&str>) {
        self.record(
            calls::REQUIRE_EXTENSION,
            IntentArgs::RequireExtension {
                id: id.to_string(),
                version: version.map(str::to_string),
                optional: self.optional,
            },
        );
    }

    /// Require a host version range.
    pub fn require_version(&self, range: &str) {
        self.record(
            calls::REQUIRE_VERSION,
            IntentArgs::RequireVersion {
                range: range.to_string(),
            },
        );
    }

    /// Run `hook` once every extension has registered.
    pub fn once(&self, hook: ReadyHook) {
        self.record(calls::ONCE, IntentArgs::ReadyHook(hook));
    }

    /// Like [`once`](Self::once), for work belonging to the privileged process.
    pub fn once_main(&self, hook: ReadyHook) {
        self.record(calls::ONCE_MAIN, IntentArgs::ReadyHook(hook));
    }

    /// Record a call outside the fixed vocabulary.
    pub fn register_other(&self, call: &str, values: Vec<Value>) {
        self.record(call, IntentArgs::Values(values));
    }

    /// Accept calls named `name` from other extensions and handle them with
    /// `handler` during the additions pass.
    pub fn provide(&self, name: &str, handler: ProviderFn) {
        self.proxy.add_provider(&self.extension, name, handler);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use exthost_core::{FailureKind, Manifest, MemoryReporter};
    use exthost_events::EventBus;
    use serde_json::json;

    use super::*;
    use crate::descriptor::EntryLoader;
    use crate::gate::{HostApi, IdentityTranslator};
    use crate::intent::{provider, ready_hook};

    fn descriptor(name: &str, version: &str) -> ExtensionDescriptor {
        ExtensionDescriptor {
            name: name.into(),
            namespace: name.into(),
            path: PathBuf::from(format!("/plugins/{name}")),
            bundled: false,
            dynamic: true,
            manifest: Manifest {
                name: name.to_string(),
                version: version.to_string(),
                ..Default::default()
            },
            entry: EntryLoader::File(PathBuf::from(format!("/plugins/{name}/index.js"))),
        }
    }

    fn context_for(proxy: &RegistrationProxy, descriptor: &ExtensionDescriptor) -> ExtensionContext {
        let reporter = Arc::new(MemoryReporter::new());
        let host = Arc::new(HostApi::new(
            EventBus::new(reporter.clone()),
            reporter,
            Arc::new(IdentityTranslator),
        ));
        proxy.set_extension(&descriptor.name, &descriptor.path);
        proxy.context(GatedApi::new(host, descriptor.info()))
    }

    #[test]
    fn test_records_in_order_with_identity() {
        let proxy = RegistrationProxy::new();
        let a = descriptor("a", "1.0.0");
        let ctx = context_for(&proxy, &a);
        ctx.register_settings("General", json!({}));
        ctx.once(ready_hook(|| async { Ok(()) }));
        ctx.optional().register_other("custom_call", vec![json!(1)]);

        let all = proxy.all_intents();
        let names: Vec<&str> = all.iter().map(|i| i.call.as_str()).collect();
        assert_eq!(names, vec!["register_settings", "once", "custom_call"]);
        assert!(all.iter().all(|i| i.extension == "a"));
        assert!(all[2].optional);
        assert_eq!(all[2].args.values(), Some(&[json!(1)][..]));
    }

    #[test]
    fn test_registration_after_end_is_ignored() {
        let proxy = RegistrationProxy::new();
        let a = descriptor("a", "1.0.0");
        let ctx = context_for(&proxy, &a);
        ctx.register_action("global-icons", "refresh", json!({}));
        proxy.end_registration();

        ctx.register_action("global-icons", "late", json!({}));
        ctx.register_other("whatever", Vec::new());
        ctx.optional().require_extension("b", None);
        ctx.provide("late_provider", provider(|_, _, _| Ok(())));

        assert!(!proxy.may_register());
        assert_eq!(proxy.all_intents().len(), 1);
        assert!(proxy.provider_names().is_empty());
    }

    #[test]
    fn test_version_mismatch_purges_all_intents() {
        let proxy = RegistrationProxy::new();
        let a = descriptor("A", "1.0.0");
        let b = descriptor("B", "1.5.0");

        let ctx_a = context_for(&proxy, &a);
        ctx_a.require_extension("B", Some(">=2.0.0"));
        ctx_a.register_settings("A settings", json!({}));
        ctx_a.once(ready_hook(|| async { Ok(()) }));

        let ctx_b = context_for(&proxy, &b);
        ctx_b.register_settings("B settings", json!({}));

        let descriptors = vec![a, b];
        let verdicts = proxy.unload_incompatible(&[], &descriptors, None);

        assert_eq!(verdicts.len(), 1);
        let failures = &verdicts["A"];
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::VersionMismatch);
        assert_eq!(failures[0].args["found"], json!("1.5.0"));
        assert!(proxy.intents_of("A").is_empty());
        assert_eq!(proxy.intents_of("B").len(), 1);
    }

    #[test]
    fn test_unsupported_api_and_missing_dependency() {
        let proxy = RegistrationProxy::new();
        let a = descriptor("a", "1.0.0");
        let b = descriptor("b", "1.0.0");
        let c = descriptor("c", "1.0.0");

        context_for(&proxy, &a).register_other("unknown_call", Vec::new());
        let ctx_b = context_for(&proxy, &b);
        ctx_b.register_other("host_extra", Vec::new());
        ctx_b.optional().register_other("unknown_call", Vec::new());
        context_for(&proxy, &c).require_extension("nowhere", None);

        let descriptors = vec![a, b, c];
        let verdicts = proxy.unload_incompatible(&["host_extra".to_string()], &descriptors, None);

        assert_eq!(verdicts["a"][0].kind, FailureKind::UnsupportedApi);
        assert_eq!(verdicts["c"][0].kind, FailureKind::MissingDependency);
        assert!(!verdicts.contains_key("b"));
        for extension in verdicts.keys() {
            assert!(proxy.intents_of(extension).is_empty());
        }
        assert_eq!(proxy.intents_of("b").len(), 2);
    }

    #[test]
    fn test_host_version_requirement() {
        let proxy = RegistrationProxy::new();
        let a = descriptor("a", "1.0.0");
        let b = descriptor("b", "1.0.0");
        context_for(&proxy, &a).require_version(">=2.0.0");
        context_for(&proxy, &b).require_version("^1.4.0");

        let descriptors = vec![a, b];
        let host = semver::Version::parse("1.5.0-beta.2").unwrap();
        let verdicts = proxy.unload_incompatible(&[], &descriptors, Some(&host));
        assert_eq!(verdicts.keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(verdicts["a"][0].kind, FailureKind::UnsupportedHostVersion);

        let proxy = RegistrationProxy::new();
        let a = descriptor("a", "1.0.0");
        context_for(&proxy, &a).require_version(">=2.0.0");
        assert!(proxy.unload_incompatible(&[], &[a], None).is_empty());
    }

    #[test]
    fn test_optional_extensions() {
        let proxy = RegistrationProxy::new();
        let a = descriptor("a", "1.0.0");
        let b = descriptor("b", "1.0.0");
        let ctx = context_for(&proxy, &a);
        ctx.optional().require_extension("b", None);
        ctx.optional().require_extension("ghost", Some("^1.0.0"));

        let descriptors = vec![a, b];
        assert!(proxy.unload_incompatible(&[], &descriptors, None).is_empty());
        let missing = proxy.get_optional_extensions(&descriptors);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing["a"][0].id, "ghost");
        assert_eq!(missing["a"][0].version.as_deref(), Some("^1.0.0"));
        assert_eq!(missing["a"][0].extension_path, PathBuf::from("/plugins/a"));
    }

    #[test]
    fn test_provider_extends_surface_and_receives_calls() {
        let proxy = RegistrationProxy::new();
        let owner = descriptor("provider", "1.0.0");
        let user = descriptor("user", "1.0.0");

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        context_for(&proxy, &owner).provide(
            "register_game",
            provider(move |args, path, info| {
                assert_eq!(path, Path::new("/plugins/user"));
                assert_eq!(info.name, "user");
                assert_eq!(args.values().map(<[Value]>::len), Some(1));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        context_for(&proxy, &user).register_other("register_game", vec![json!("skyrim")]);

        let descriptors = vec![owner, user];
        assert!(proxy.unload_incompatible(&[], &descriptors, None).is_empty());
        assert!(proxy.invoke_additions(&descriptors).is_empty());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_provider_is_attributed_to_caller() {
        let proxy = RegistrationProxy::new();
        let owner = descriptor("provider", "1.0.0");
        let user = descriptor("user", "1.0.0");
        context_for(&proxy, &owner).provide("register_thing", provider(|_, _, _| panic!("boom")));
        context_for(&proxy, &user).register_other("register_thing", Vec::new());

        let failures = proxy.invoke_additions(&[owner, user]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.name, "user");
        assert_eq!(failures[0].1.to_string(), "boom");
    }
}
