use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use exthost_core::{
    APP_HIVE, Action, ExtensionRoot, FailureKind, HostConfig, HostError, MemoryReporter,
    MemoryStore, SESSION_HIVE, StateSnapshot, StateStore, actions,
};
use exthost_persist::MemoryPersistor;
use exthost_runtime::{
    BuiltinExtension, ExtensionManager, GateState, HookStatus, IntentArgs, StaticResolver,
    api_function, calls, init_fn, migration, provider, ready_hook, write_marker,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;

fn write_extension(root: &Path, dir: &str, version: &str) -> PathBuf {
    let path = root.join(dir);
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join("index.js"), "// entry").unwrap();
    fs::write(
        path.join("info.json"),
        json!({ "name": dir, "version": version, "author": "tests" }).to_string(),
    )
    .unwrap();
    path
}

fn config(tmp: &TempDir) -> HostConfig {
    HostConfig::builder()
        .roots(vec![
            ExtensionRoot::user(tmp.path().join("plugins")),
            ExtensionRoot::bundled(tmp.path().join("bundled")),
        ])
        .temp_dir(tmp.path().join("scratch"))
        .build()
        .unwrap()
}

fn user_root(tmp: &TempDir) -> PathBuf {
    tmp.path().join("plugins")
}

fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(
        StateSnapshot::new().with_hive(APP_HIVE, json!({ "extensions": {} })),
    ))
}

#[tokio::test]
async fn test_full_lifecycle() {
    let tmp = TempDir::new().unwrap();
    write_extension(&user_root(&tmp), "greeter", "1.0.0");

    let locked_during_init = Arc::new(AtomicBool::new(false));
    let flag = locked_during_init.clone();
    let resolver = StaticResolver::new().with(
        "greeter",
        init_fn(move |ctx| {
            let blocked = ctx
                .api()
                .dispatch(Action::set_value(&["app", "early"], json!(true)));
            flag.store(matches!(blocked, Err(HostError::ApiNotReady { .. })), Ordering::SeqCst);

            ctx.register_settings("Greeter", json!({ "icon": "wave" }));
            let api = ctx.api().clone();
            ctx.once(ready_hook(move || {
                let api = api.clone();
                async move { api.dispatch(Action::set_value(&["app", "greeted"], json!(true))) }
            }));
            Ok(())
        }),
    );

    let reporter = Arc::new(MemoryReporter::new());
    let mut manager = ExtensionManager::builder(config(&tmp))
        .builtin(BuiltinExtension::new(
            "core",
            init_fn(|ctx| {
                ctx.register_action("global-icons", "refresh", json!({}));
                Ok(())
            }),
        ))
        .resolver(Arc::new(resolver))
        .reporter(reporter.clone())
        .build()
        .unwrap();

    assert_eq!(
        manager.descriptors().iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
        vec!["core", "greeter"]
    );

    manager.init_extensions().unwrap();
    assert!(locked_during_init.load(Ordering::SeqCst));
    assert!(manager.load_failures().is_empty());
    assert_eq!(manager.loaded(), vec!["core", "greeter"]);

    let store = store();
    manager.set_store(store.clone()).await.unwrap();

    let mut settings = Vec::new();
    let applied = manager.apply(calls::REGISTER_SETTINGS, |intent, info| {
        settings.push((info.name.to_string(), intent.args.values().map(<[Value]>::to_vec)));
        Ok(())
    });
    assert_eq!(applied, 1);
    assert_eq!(settings[0].0, "greeter");

    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = progress.clone();
    manager.on_loading_extension(Arc::new(move |name: Option<&str>, index: usize| {
        sink.lock().push((name.map(str::to_string), index));
    }));

    let outcomes = manager.do_once().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, HookStatus::Completed);
    assert_eq!(
        store.get_state().get_path(&["app", "greeted"]),
        Some(&json!(true))
    );
    assert_eq!(
        *progress.lock(),
        vec![(Some("greeter".to_string()), 0), (None, 1)]
    );
    assert!(reporter.is_empty());
}

#[test]
fn test_core_failure_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let mut manager = ExtensionManager::builder(config(&tmp))
        .builtin(BuiltinExtension::new(
            "core-state",
            init_fn(|_| Err(HostError::other("reducer missing"))),
        ))
        .build()
        .unwrap();

    let err = manager.init_extensions().unwrap_err();
    assert!(matches!(err, HostError::Registration { ref name, .. } if name == "core-state"));
}

#[test]
fn test_dynamic_failure_is_isolated() {
    let tmp = TempDir::new().unwrap();
    write_extension(&user_root(&tmp), "broken", "1.0.0");
    write_extension(&user_root(&tmp), "healthy", "1.0.0");
    write_extension(&user_root(&tmp), "unresolved", "1.0.0");

    let resolver = StaticResolver::new()
        .with(
            "broken",
            init_fn(|ctx| {
                ctx.register_settings("Broken", json!({}));
                panic!("init exploded");
            }),
        )
        .with(
            "healthy",
            init_fn(|ctx| {
                ctx.register_settings("Healthy", json!({}));
                Ok(())
            }),
        );

    let mut manager = ExtensionManager::builder(config(&tmp))
        .resolver(Arc::new(resolver))
        .build()
        .unwrap();
    manager.init_extensions().unwrap();

    let failures = manager.load_failures();
    assert_eq!(failures["broken"][0].kind, FailureKind::Exception);
    assert_eq!(failures["broken"][0].args["message"], json!("init exploded"));
    assert_eq!(failures["unresolved"][0].kind, FailureKind::Exception);
    assert!(!failures.contains_key("healthy"));

    assert!(manager.proxy().intents_of("broken").is_empty());
    assert_eq!(manager.proxy().intents_of("healthy").len(), 1);
    assert!(manager.gate("broken").is_none());
    assert!(manager.gate("healthy").is_some());
}

#[tokio::test]
async fn test_version_mismatch_blocks_registrations() {
    let tmp = TempDir::new().unwrap();
    write_extension(&user_root(&tmp), "A", "1.0.0");
    write_extension(&user_root(&tmp), "B", "1.5.0");

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    let captured = Arc::new(Mutex::new(None));
    let slot = captured.clone();
    let resolver = StaticResolver::new()
        .with(
            "A",
            init_fn(move |ctx| {
                ctx.require_extension("B", Some(">=2.0.0"));
                *slot.lock() = Some(ctx.api().clone());
                let counter = counter.clone();
                ctx.once(ready_hook(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                }));
                Ok(())
            }),
        )
        .with("B", init_fn(|_| Ok(())));

    let mut manager = ExtensionManager::builder(config(&tmp))
        .resolver(Arc::new(resolver))
        .build()
        .unwrap();
    manager.init_extensions().unwrap();

    assert_eq!(manager.load_failures()["A"][0].kind, FailureKind::VersionMismatch);
    assert!(manager.proxy().intents_of("A").is_empty());
    assert!(manager.gate("A").is_none());
    let handle = captured.lock().clone().unwrap();
    assert_eq!(handle.state(), GateState::Locked);
    assert!(handle.events().is_err());

    let store = store();
    manager.set_store(store.clone()).await.unwrap();
    let reported = store
        .get_state()
        .get_path(&[SESSION_HIVE, "extensions", "loadFailures", "A"])
        .cloned()
        .unwrap();
    assert_eq!(reported[0]["kind"], json!("version-mismatch"));

    assert!(manager.do_once().await.is_empty());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hung_ready_hook_is_abandoned() {
    let tmp = TempDir::new().unwrap();
    write_extension(&user_root(&tmp), "a-stuck", "1.0.0");
    write_extension(&user_root(&tmp), "b-fine", "1.0.0");

    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    let resolver = StaticResolver::new()
        .with(
            "a-stuck",
            init_fn(|ctx| {
                ctx.once(ready_hook(std::future::pending::<exthost_core::HostResult<()>>));
                Ok(())
            }),
        )
        .with(
            "b-fine",
            init_fn(move |ctx| {
                let flag = flag.clone();
                ctx.once_main(ready_hook(move || {
                    let flag = flag.clone();
                    async move {
                        flag.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                }));
                Ok(())
            }),
        );

    let reporter = Arc::new(MemoryReporter::new());
    let mut manager = ExtensionManager::builder(config(&tmp))
        .resolver(Arc::new(resolver))
        .reporter(reporter.clone())
        .build()
        .unwrap();
    manager.init_extensions().unwrap();
    let mut progress = manager.subscribe();

    let outcomes = manager.do_once().await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].extension, "a-stuck");
    assert_eq!(outcomes[0].status, HookStatus::TimedOut);
    assert_eq!(outcomes[1].call, calls::ONCE_MAIN);
    assert_eq!(outcomes[1].status, HookStatus::Completed);
    assert!(finished.load(Ordering::SeqCst));

    let reports = reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].extension_name(), Some("a-stuck"));
    assert!(!reports[0].allow_report);

    let first = progress.recv().await.unwrap();
    assert_eq!(first.extension.as_deref(), Some("a-stuck"));
    progress.recv().await.unwrap();
    assert!(progress.recv().await.unwrap().is_done());
}

#[tokio::test]
async fn test_failing_ready_hook_is_reported() {
    let tmp = TempDir::new().unwrap();
    write_extension(&tmp.path().join("bundled"), "official", "1.0.0");

    let resolver = StaticResolver::new().with(
        "official",
        init_fn(|ctx| {
            ctx.once(ready_hook(|| async { Err(HostError::other("no network")) }));
            Ok(())
        }),
    );
    let reporter = Arc::new(MemoryReporter::new());
    let mut manager = ExtensionManager::builder(config(&tmp))
        .resolver(Arc::new(resolver))
        .reporter(reporter.clone())
        .build()
        .unwrap();
    manager.init_extensions().unwrap();

    let outcomes = manager.do_once().await;
    assert_eq!(outcomes[0].status, HookStatus::Failed("no network".to_string()));
    let reports = reporter.reports();
    assert_eq!(reports[0].message, "no network");
    assert!(reports[0].allow_report);
}

#[tokio::test]
async fn test_quarantine_marker_disables_extension() {
    let tmp = TempDir::new().unwrap();
    write_extension(&user_root(&tmp), "crashy", "1.0.0");
    write_extension(&user_root(&tmp), "stable", "1.0.0");
    let marker = write_marker(&tmp.path().join("scratch"), "crashy").unwrap();

    let resolver = StaticResolver::new()
        .with("crashy", init_fn(|_| Ok(())))
        .with("stable", init_fn(|_| Ok(())));
    let mut manager = ExtensionManager::builder(config(&tmp))
        .resolver(Arc::new(resolver))
        .build()
        .unwrap();

    assert!(!marker.exists());
    assert_eq!(manager.descriptors().len(), 1);
    assert_eq!(manager.pending_actions().len(), 1);

    manager.init_extensions().unwrap();
    let store = store();
    manager.set_store(store.clone()).await.unwrap();

    assert!(manager.pending_actions().is_empty());
    assert_eq!(store.dispatched()[0].kind, actions::SET_EXTENSION_ENABLED);
    let states = store.get_state().extension_states();
    assert!(!states["crashy"].enabled);
    assert!(tmp.path().join("plugins/crashy").exists());
}

#[tokio::test]
async fn test_migrations_run_for_older_stored_version() {
    let tmp = TempDir::new().unwrap();
    write_extension(&user_root(&tmp), "mig", "2.0.0");
    write_extension(&user_root(&tmp), "fresh", "1.0.0");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let resolver = StaticResolver::new()
        .with(
            "mig",
            init_fn(move |ctx| {
                let sink = sink.clone();
                ctx.register_migration(migration(move |old| {
                    sink.lock().push(old);
                    async { Ok(()) }
                }));
                Ok(())
            }),
        )
        .with("fresh", init_fn(|_| Ok(())));

    let mut manager = ExtensionManager::builder(config(&tmp))
        .resolver(Arc::new(resolver))
        .build()
        .unwrap();
    manager.init_extensions().unwrap();

    let store = Arc::new(MemoryStore::new(StateSnapshot::new().with_hive(
        APP_HIVE,
        json!({ "extensions": { "mig": { "enabled": true, "version": "1.0.0" } } }),
    )));
    manager.set_store(store.clone()).await.unwrap();

    assert_eq!(*seen.lock(), vec!["1.0.0".to_string()]);
    let states = store.get_state().extension_states();
    assert_eq!(states["mig"].version.as_deref(), Some("2.0.0"));
    assert_eq!(states["fresh"].version.as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn test_build_metadata_change_skips_migration() {
    let tmp = TempDir::new().unwrap();
    write_extension(&user_root(&tmp), "mig", "2.0.0+build.2");

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    let resolver = StaticResolver::new().with(
        "mig",
        init_fn(move |ctx| {
            let counter = counter.clone();
            ctx.register_migration(migration(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }));
            Ok(())
        }),
    );

    let mut manager = ExtensionManager::builder(config(&tmp))
        .resolver(Arc::new(resolver))
        .build()
        .unwrap();
    manager.init_extensions().unwrap();

    let store = Arc::new(MemoryStore::new(StateSnapshot::new().with_hive(
        APP_HIVE,
        json!({ "extensions": { "mig": { "enabled": true, "version": "2.0.0+build.1" } } }),
    )));
    manager.set_store(store.clone()).await.unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    let states = store.get_state().extension_states();
    assert_eq!(states["mig"].version.as_deref(), Some("2.0.0+build.2"));
}

#[tokio::test]
async fn test_failed_migration_keeps_stored_version() {
    let tmp = TempDir::new().unwrap();
    write_extension(&user_root(&tmp), "mig", "2.0.0");
    let resolver = StaticResolver::new().with(
        "mig",
        init_fn(|ctx| {
            ctx.register_migration(migration(|_| async { Err(HostError::other("bad data")) }));
            Ok(())
        }),
    );
    let reporter = Arc::new(MemoryReporter::new());
    let mut manager = ExtensionManager::builder(config(&tmp))
        .resolver(Arc::new(resolver))
        .reporter(reporter.clone())
        .build()
        .unwrap();
    manager.init_extensions().unwrap();

    let store = Arc::new(MemoryStore::new(StateSnapshot::new().with_hive(
        APP_HIVE,
        json!({ "extensions": { "mig": { "version": "not-a-version" } } }),
    )));
    manager.set_store(store.clone()).await.unwrap();

    let states = store.get_state().extension_states();
    assert_eq!(states["mig"].version.as_deref(), Some("not-a-version"));
    assert_eq!(reporter.reports()[0].title, "Extension failed to migrate");
}

#[tokio::test]
async fn test_extension_persistor_hydrates_hive() {
    let tmp = TempDir::new().unwrap();
    write_extension(&user_root(&tmp), "loadorder", "1.0.0");
    let persistor = Arc::new(MemoryPersistor::with_data([(
        ["plugins", "main.esm"],
        "true".to_string(),
    )]));

    let shared = persistor.clone();
    let resolver = StaticResolver::new().with(
        "loadorder",
        init_fn(move |ctx| {
            ctx.register_persistor("loadOrder", shared.clone(), None);
            Ok(())
        }),
    );
    let mut manager = ExtensionManager::builder(config(&tmp))
        .resolver(Arc::new(resolver))
        .build()
        .unwrap();
    assert!(matches!(
        manager.init_extension_persistors().await,
        Err(HostError::StoreUnavailable)
    ));

    manager.init_extensions().unwrap();
    let store = store();
    manager.set_store(store.clone()).await.unwrap();
    assert_eq!(manager.init_extension_persistors().await.unwrap(), 1);

    assert_eq!(
        store.get_state().get_path(&["loadOrder", "plugins", "main.esm"]),
        Some(&json!(true))
    );
    assert_eq!(manager.bridge().unwrap().hives(), vec!["loadOrder".to_string()]);
    assert_eq!(persistor.write_count(), 0);
}

#[tokio::test]
async fn test_remove_outdated_only_touches_user_root() {
    let tmp = TempDir::new().unwrap();
    let old_user = write_extension(&user_root(&tmp), "foo", "1.0.0");
    let bundled = write_extension(&tmp.path().join("bundled"), "foo", "2.0.0");
    let dup_bundled = write_extension(&tmp.path().join("bundled"), "bar", "1.0.0");
    write_extension(&user_root(&tmp), "bar", "1.0.0");
    let doomed = write_extension(&user_root(&tmp), "doomed", "1.0.0");

    let mut manager = ExtensionManager::builder(config(&tmp)).build().unwrap();
    assert_eq!(manager.outdated().len(), 2);
    assert!(matches!(manager.remove_outdated(), Err(HostError::StoreUnavailable)));

    let store = Arc::new(MemoryStore::new(StateSnapshot::new().with_hive(
        APP_HIVE,
        json!({ "extensions": { "doomed": { "remove": true } } }),
    )));
    manager.set_store(store.clone()).await.unwrap();
    let removed = manager.remove_outdated().unwrap();

    assert_eq!(removed, vec![old_user.clone(), doomed.clone()]);
    assert!(!old_user.exists());
    assert!(!doomed.exists());
    assert!(bundled.exists());
    assert!(dup_bundled.exists());
    assert!(manager.outdated().is_empty());
    assert!(!store.get_state().extension_states().contains_key("doomed"));
}

#[tokio::test]
async fn test_api_additions_and_providers() {
    let tmp = TempDir::new().unwrap();
    write_extension(&user_root(&tmp), "math", "1.0.0");
    write_extension(&user_root(&tmp), "user", "1.0.0");

    let games = Arc::new(Mutex::new(Vec::new()));
    let sink = games.clone();
    let resolver = StaticResolver::new()
        .with(
            "math",
            init_fn(move |ctx| {
                ctx.register_api(
                    "add",
                    api_function(|args| {
                        Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
                    }),
                );
                let sink = sink.clone();
                ctx.provide(
                    "register_game",
                    provider(move |args, _, info| {
                        if let IntentArgs::Values(values) = args {
                            sink.lock().push((info.name.to_string(), values.clone()));
                        }
                        Ok(())
                    }),
                );
                Ok(())
            }),
        )
        .with(
            "user",
            init_fn(|ctx| {
                ctx.register_other("register_game", vec![json!("skyrim")]);
                Ok(())
            }),
        );

    let mut manager = ExtensionManager::builder(config(&tmp))
        .resolver(Arc::new(resolver))
        .build()
        .unwrap();
    manager.init_extensions().unwrap();
    assert!(manager.load_failures().is_empty());

    manager.apply_extensions_of_extensions();
    assert_eq!(*games.lock(), vec![("user".to_string(), vec![json!("skyrim")])]);

    let user = manager.gate("user").unwrap();
    assert_eq!(user.call_ext("add", &[json!(2), json!(3)]).unwrap(), json!(5));
}

#[test]
fn test_builtin_disabled_by_state() {
    let tmp = TempDir::new().unwrap();
    let mut states = exthost_core::ExtensionStates::new();
    states.insert(
        "optional-core".into(),
        exthost_core::ExtensionState {
            enabled: false,
            ..Default::default()
        },
    );
    let manager = ExtensionManager::builder(config(&tmp))
        .builtin(BuiltinExtension::new("optional-core", init_fn(|_| Ok(()))))
        .builtin(BuiltinExtension::new("required-core", init_fn(|_| Ok(()))))
        .extension_states(states)
        .build()
        .unwrap();
    assert_eq!(manager.descriptors().len(), 1);
    assert_eq!(manager.descriptors()[0].name, "required-core");
}
