//! The persistor interface and an in-memory implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use exthost_core::{BoxFuture, HostError, HostResult};
use indexmap::IndexMap;
use parking_lot::Mutex;

/// Key of a persisted leaf: the path below the hive root.
pub type PersistKey = Vec<String>;

/// Callback a persistor invokes when its backing data changed underneath
/// the host and the hive needs to be hydrated again.
pub type ResetCallback = Arc<dyn Fn() + Send + Sync>;

/// Durable key/value storage for one hive.
///
/// Values are JSON-encoded leaves of the hive, keyed by their path.
pub trait Persistor: Send + Sync {
    /// Install the callback used to request re-hydration.
    fn set_reset_callback(&self, callback: ResetCallback);

    /// Read one value.
    fn get_item<'a>(&'a self, key: &'a [String]) -> BoxFuture<'a, HostResult<Option<String>>>;

    /// Write one value.
    fn set_item<'a>(&'a self, key: &'a [String], value: String) -> BoxFuture<'a, HostResult<()>>;

    /// Delete one value. Deleting a missing key is not an error.
    fn remove_item<'a>(&'a self, key: &'a [String]) -> BoxFuture<'a, HostResult<()>>;

    /// All stored keys.
    fn get_all_keys(&self) -> BoxFuture<'_, HostResult<Vec<PersistKey>>>;

    /// All stored key/value pairs.
    fn get_all_kvs(&self) -> BoxFuture<'_, HostResult<Vec<(PersistKey, String)>>> {
        Box::pin(async move {
            let keys = self.get_all_keys().await?;
            let mut kvs = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(value) = self.get_item(&key).await? {
                    kvs.push((key, value));
                }
            }
            Ok(kvs)
        })
    }
}

/// Persistor keeping data in memory.
#[derive(Default)]
pub struct MemoryPersistor {
    data: Mutex<IndexMap<PersistKey, String>>,
    reset: Mutex<Option<ResetCallback>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl std::fmt::Debug for MemoryPersistor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPersistor")
            .field("data", &*self.data.lock())
            .field("writes", &self.writes.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryPersistor {
    /// Create an empty persistor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a persistor holding `entries`.
    pub fn with_data<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, String)>,
        K: IntoIterator,
        K::Item: Into<String>,
    {
        let persistor = Self::new();
        for (key, value) in entries {
            persistor.insert(key, value);
        }
        persistor
    }

    /// Store a value directly, bypassing write accounting.
    pub fn insert<K>(&self, key: K, value: String)
    where
        K: IntoIterator,
        K::Item: Into<String>,
    {
        let key: PersistKey = key.into_iter().map(Into::into).collect();
        self.data.lock().insert(key, value);
    }

    /// Current contents.
    pub fn entries(&self) -> IndexMap<PersistKey, String> {
        self.data.lock().clone()
    }

    /// Value of a key given as path segments.
    pub fn value(&self, key: &[&str]) -> Option<String> {
        let key: PersistKey = key.iter().map(|s| s.to_string()).collect();
        self.data.lock().get(&key).cloned()
    }

    /// Make subsequent writes and removals fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes and removals.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Ask the host to hydrate again. Returns whether a callback was installed.
    pub fn request_reset(&self) -> bool {
        let callback = self.reset.lock().clone();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    fn check_writable(&self, key: &[String]) -> HostResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(HostError::other(format!(
                "write to '{}' rejected",
                key.join(".")
            )));
        }
        Ok(())
    }
}

impl Persistor for MemoryPersistor {
    fn set_reset_callback(&self, callback: ResetCallback) {
        *self.reset.lock() = Some(callback);
    }

    fn get_item<'a>(&'a self, key: &'a [String]) -> BoxFuture<'a, HostResult<Option<String>>> {
        Box::pin(async move { Ok(self.data.lock().get(key).cloned()) })
    }

    fn set_item<'a>(&'a self, key: &'a [String], value: String) -> BoxFuture<'a, HostResult<()>> {
        Box::pin(async move {
            self.check_writable(key)?;
            self.data.lock().insert(key.to_vec(), value);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn remove_item<'a>(&'a self, key: &'a [String]) -> BoxFuture<'a, HostResult<()>> {
        Box::pin(async move {
            self.check_writable(key)?;
            self.data.lock().shift_remove(key);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn get_all_keys(&self) -> BoxFuture<'_, HostResult<Vec<PersistKey>>> {
        Box::pin(async move { Ok(self.data.lock().keys().cloned().collect()) })
    }
}
