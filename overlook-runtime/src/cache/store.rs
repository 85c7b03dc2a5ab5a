//! The per-kind object map behind the [`Cache`](super::Cache)
use std::{fmt, sync::Arc};

use ahash::AHashMap;
use overlook_core::CacheObject;
use parking_lot::RwLock;
use tokio::sync::watch;

use super::Event;
use crate::watcher;

/// A typeless reference to a cached object within one kind
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Name of the object
    pub name: String,
}

impl ObjectRef {
    /// Reference to a cluster-scoped object
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Scope the reference to a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Reference to `obj`
    #[must_use]
    pub fn from_obj(obj: &CacheObject) -> Self {
        Self {
            namespace: obj.namespace().map(str::to_owned),
            name: obj.name().to_owned(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

type Cache = Arc<RwLock<AHashMap<ObjectRef, Arc<CacheObject>>>>;

/// A writable Store handle
///
/// This is exclusive since it's not safe to share a single `Store` between multiple watchers.
/// In particular, `Restarted` events will clobber the state of other connected watchers.
#[derive(Debug)]
pub struct Writer {
    store: Cache,
    ready_tx: watch::Sender<bool>,
}

impl Default for Writer {
    fn default() -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            store: Cache::default(),
            ready_tx,
        }
    }
}

impl Writer {
    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader` multiple times,
    /// or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store {
        Store {
            store: self.store.clone(),
            ready_rx: self.ready_tx.subscribe(),
        }
    }

    /// Applies a single watcher event to the store
    ///
    /// Returns the changes subscribers should see, in the order they happened.
    pub fn apply_watcher_event(&mut self, event: &watcher::Event<CacheObject>) -> Vec<Event> {
        let changes = match event {
            watcher::Event::Applied(obj) => {
                let obj = Arc::new(obj.clone());
                let previous = self.store.write().insert(ObjectRef::from_obj(&obj), obj.clone());
                match previous {
                    Some(_) => vec![Event::Modified(obj)],
                    None => vec![Event::Added(obj)],
                }
            }
            watcher::Event::Deleted(obj) => {
                // Deleting something we never saw is not a change
                match self.store.write().remove(&ObjectRef::from_obj(obj)) {
                    Some(_) => vec![Event::Deleted(Arc::new(obj.clone()))],
                    None => vec![],
                }
            }
            watcher::Event::Restarted(new_objs) => {
                let mut new_store = new_objs
                    .iter()
                    .map(|obj| (ObjectRef::from_obj(obj), Arc::new(obj.clone())))
                    .collect::<AHashMap<_, _>>();
                let mut changes = Vec::new();
                {
                    let mut store = self.store.write();
                    std::mem::swap(&mut *store, &mut new_store);
                    let (old_store, store) = (&new_store, &*store);
                    for (key, old) in old_store {
                        if !store.contains_key(key) {
                            changes.push(Event::Deleted(old.clone()));
                        }
                    }
                    for (key, obj) in store {
                        match old_store.get(key) {
                            None => changes.push(Event::Added(obj.clone())),
                            Some(old) if old.resource_version() != obj.resource_version() => {
                                changes.push(Event::Modified(obj.clone()))
                            }
                            Some(_) => {}
                        }
                    }
                }
                changes
            }
        };
        self.ready_tx.send_if_modified(|ready| !std::mem::replace(ready, true));
        changes
    }
}

/// A readable cache of cluster objects of one kind
///
/// Cloning will produce a new reference to the same backing store.
///
/// Cannot be constructed directly since one writer handle is required,
/// use `Writer::as_reader()` instead.
#[derive(Debug, Clone)]
pub struct Store {
    store: Cache,
    ready_rx: watch::Receiver<bool>,
}

impl Store {
    /// Retrieve the entry referred to by `key`, if it is in the cache.
    ///
    /// `key.namespace` is ignored for cluster-scoped objects.
    ///
    /// Note that this is a cache and may be stale. Deleted objects may still exist in the cache
    /// despite having been deleted in the cluster, and new objects may not yet exist in the cache.
    #[must_use]
    pub fn get(&self, key: &ObjectRef) -> Option<Arc<CacheObject>> {
        let store = self.store.read();
        store
            .get(key)
            // Try to erase the namespace and try again, in case the object is cluster-scoped
            .or_else(|| {
                store.get(&ObjectRef {
                    namespace: None,
                    name: key.name.clone(),
                })
            })
            .cloned()
    }

    /// Return a full snapshot of the current values
    #[must_use]
    pub fn state(&self) -> Vec<Arc<CacheObject>> {
        self.store.read().values().cloned().collect()
    }

    /// Number of cached objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether no object is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Whether the initial list has been applied
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Wait until the initial list has been applied
    ///
    /// Returns `false` if the writer went away before that happened.
    pub async fn wait_until_ready(&self) -> bool {
        let mut rx = self.ready_rx.clone();
        let ready = rx.wait_for(|ready| *ready).await.is_ok();
        ready
    }
}
