//! Cache of watched objects and its single writer
use super::ObjectKey;
use ahash::AHashMap;
use kube::{runtime::watcher, Resource};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type Cache<K> = Arc<RwLock<AHashMap<ObjectKey, Arc<K>>>>;

/// A writable Store handle
///
/// This is exclusive since it's not safe to share a single `Store` between multiple reflectors.
/// In particular, relists (`Init`..`InitDone`) replace the entire contents of the store.
#[derive(Debug)]
pub struct Writer<K> {
    store: Cache<K>,
    buffer: AHashMap<ObjectKey, Arc<K>>,
    ready: CancellationToken,
}

impl<K: Resource + Clone> Writer<K> {
    /// Creates a new empty writer
    ///
    /// Prefer [`store()`] which hands out the reader at the same time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::default(),
            buffer: AHashMap::new(),
            ready: CancellationToken::new(),
        }
    }

    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader` multiple times,
    /// or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store<K> {
        Store {
            store: self.store.clone(),
            ready: self.ready.clone(),
        }
    }

    /// Applies a single watcher event to the store
    pub fn apply_watcher_event(&mut self, event: &watcher::Event<K>) {
        match event {
            watcher::Event::Apply(obj) => {
                if let Some(key) = ObjectKey::from_obj(obj) {
                    self.store.write().insert(key, Arc::new(obj.clone()));
                }
            }
            watcher::Event::Delete(obj) => {
                if let Some(key) = ObjectKey::from_obj(obj) {
                    self.store.write().remove(&key);
                }
            }
            watcher::Event::Init => {
                self.buffer = AHashMap::new();
            }
            watcher::Event::InitApply(obj) => {
                if let Some(key) = ObjectKey::from_obj(obj) {
                    self.buffer.insert(key, Arc::new(obj.clone()));
                }
            }
            watcher::Event::InitDone => {
                let mut store = self.store.write();
                // Swap the buffer in so readers never observe a partially relisted cache
                std::mem::swap(&mut *store, &mut self.buffer);
                self.buffer = AHashMap::new();
                self.ready.cancel();
            }
        }
    }
}

impl<K: Resource + Clone> Default for Writer<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// A readable cache of Kubernetes objects of kind `K`
///
/// Cloning will produce a new reference to the same backing store.
///
/// Cannot be constructed directly since one writer handle is required,
/// use `Writer::as_reader()` or [`store()`] instead.
pub struct Store<K> {
    store: Cache<K>,
    ready: CancellationToken,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ready: self.ready.clone(),
        }
    }
}

impl<K> std::fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("len", &self.len())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<K> Store<K> {
    /// Retrieve the entry referred to by `key`, if it is in the cache.
    ///
    /// Note that this is a cache and may be stale. Deleted objects may still exist in the cache
    /// despite having been deleted in the cluster, and new objects may not yet exist in the cache.
    /// The lag is bounded by how quickly the watch stream delivers events to the [`Writer`].
    #[must_use]
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.store.read().get(key).cloned()
    }

    /// Return a full snapshot of the current values
    #[must_use]
    pub fn state(&self) -> Vec<Arc<K>> {
        self.store.read().values().cloned().collect()
    }

    /// Keys of every cached object
    #[must_use]
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.store.read().keys().cloned().collect()
    }

    /// Number of cached objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether the cache holds no objects
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Whether the initial list has been fully applied
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.is_cancelled()
    }

    /// Wait for the store to be populated by the initial list
    ///
    /// Resolves immediately if the store is already ready. Never resolves if the
    /// [`Writer`] is dropped before finishing its first list, so callers should race it
    /// against a timeout or a shutdown signal.
    pub async fn wait_until_ready(&self) {
        self.ready.cancelled().await;
    }
}

/// Create a (Reader, Writer) for a `Store<K>` for a typed resource `K`
///
/// The `Writer` should be driven by the event source, and the `Store` handed to
/// the reconciler.
#[must_use]
pub fn store<K: Resource + Clone>() -> (Store<K>, Writer<K>) {
    let w = Writer::<K>::new();
    let r = w.as_reader();
    (r, w)
}

#[cfg(test)]
mod tests {
    use super::store;
    use crate::reflector::ObjectKey;
    use futures::FutureExt;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::{api::ObjectMeta, runtime::watcher};

    fn cm(name: &str, value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..ObjectMeta::default()
            },
            data: Some([("value".to_string(), value.to_string())].into()),
            ..ConfigMap::default()
        }
    }

    #[test]
    fn should_allow_getting_namespaced_object_by_namespaced_key() {
        let obj = cm("obj", "a");
        let (store, mut writer) = store();
        writer.apply_watcher_event(&watcher::Event::Apply(obj.clone()));
        assert_eq!(
            store.get(&ObjectKey::new("obj").within("ns")).as_deref(),
            Some(&obj)
        );
        assert_eq!(store.get(&ObjectKey::new("obj")), None);
    }

    #[test]
    fn apply_should_replace_and_delete_should_remove() {
        let (store, mut writer) = store();
        let key = ObjectKey::new("obj").within("ns");
        writer.apply_watcher_event(&watcher::Event::Apply(cm("obj", "a")));
        writer.apply_watcher_event(&watcher::Event::Apply(cm("obj", "b")));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key).as_deref(), Some(&cm("obj", "b")));
        writer.apply_watcher_event(&watcher::Event::Delete(cm("obj", "b")));
        assert!(store.is_empty());
    }

    #[test]
    fn relist_should_only_become_visible_on_init_done() {
        let (store, mut writer) = store();
        writer.apply_watcher_event(&watcher::Event::Apply(cm("stale", "a")));
        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitApply(cm("fresh", "a")));
        assert_eq!(store.keys(), vec![ObjectKey::new("stale").within("ns")]);
        assert!(!store.is_ready());

        writer.apply_watcher_event(&watcher::Event::InitDone);
        assert_eq!(store.keys(), vec![ObjectKey::new("fresh").within("ns")]);
        assert!(store.is_ready());
    }

    #[test]
    fn wait_until_ready_should_resolve_after_first_list() {
        let (store, mut writer) = store::<ConfigMap>();
        let mut ready = store.wait_until_ready().boxed();
        assert!((&mut ready).now_or_never().is_none());
        writer.apply_watcher_event(&watcher::Event::Init);
        assert!((&mut ready).now_or_never().is_none());
        writer.apply_watcher_event(&watcher::Event::InitDone);
        assert!(ready.now_or_never().is_some());
    }
}
