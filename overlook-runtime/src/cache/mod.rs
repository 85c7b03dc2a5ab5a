//! Watch-backed, in-memory mirror of cluster objects
//!
//! The [`Cache`] starts one informer per kind the first time that kind is asked for. Each informer
//! runs a [`watcher`](crate::watcher()) with backoff, applies every event to its [`Store`], and then
//! broadcasts the resulting changes to subscribers. Because the store is updated before the change
//! is broadcast, a [`Cache::get`] issued after receiving an event never returns an older object.

mod store;
pub use store::{ObjectRef, Store, Writer};

use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use async_broadcast::{InactiveReceiver, Sender};
use futures::{Stream, StreamExt};
use overlook_core::{CacheObject, GroupVersionKind, KindFilter, ListSelector, ObjectKey, ObjectSource};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    utils::{default_backoff, wait_before_retry, ResettableBackoff},
    watcher::watcher,
};

/// Tuning for the [`Cache`]
#[derive(Clone, Debug)]
pub struct Config {
    /// How long reads wait for a kind's initial list before answering from what is there
    pub sync_timeout: Duration,
    /// Buffered events per kind before the informer waits on slow subscribers
    pub subscription_capacity: usize,
    /// Shortest delay before retrying a failed list or watch
    pub backoff_min: Duration,
    /// Longest delay before retrying a failed list or watch
    pub backoff_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(30),
            subscription_capacity: 1024,
            backoff_min: Duration::from_millis(800),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// A change to a cached object, as seen by subscribers
///
/// Duplicate `Added` events for an unchanged object can happen after a watch was resumed,
/// so consumers should treat `Added` as an upsert.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The object is new to the subscriber
    Added(Arc<CacheObject>),
    /// A newer version of a known object
    Modified(Arc<CacheObject>),
    /// The object is gone
    Deleted(Arc<CacheObject>),
}

impl Event {
    /// The object carried by the event
    pub fn object(&self) -> &Arc<CacheObject> {
        match self {
            Event::Added(obj) | Event::Modified(obj) | Event::Deleted(obj) => obj,
        }
    }
}

struct Informer {
    store: Store,
    // Kept so that new subscribers can be activated at any time
    events: InactiveReceiver<Event>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    source: Arc<dyn ObjectSource>,
    config: Config,
    informers: Mutex<AHashMap<GroupVersionKind, Arc<Informer>>>,
    token: CancellationToken,
}

/// A shared mirror of cluster objects
///
/// Cloning will produce a new handle to the same mirror. Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

impl Cache {
    /// Create an empty cache reading from `source`
    pub fn new(source: Arc<dyn ObjectSource>, config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                informers: Mutex::default(),
                token: CancellationToken::new(),
            }),
        }
    }

    fn informer(&self, gvk: &GroupVersionKind) -> Arc<Informer> {
        let mut informers = self.inner.informers.lock();
        if let Some(informer) = informers.get(gvk) {
            return informer.clone();
        }

        let writer = Writer::default();
        let store = writer.as_reader();
        let (mut tx, rx) = async_broadcast::broadcast(self.inner.config.subscription_capacity);
        // Nobody may be subscribed yet, events still have to flow into the store
        tx.set_await_active(false);
        let handle = tokio::spawn(run_informer(
            self.inner.source.clone(),
            gvk.clone(),
            writer,
            tx,
            self.inner.config.clone(),
            self.inner.token.child_token(),
        ));
        info!(%gvk, "started informer");
        let informer = Arc::new(Informer {
            store,
            events: rx.deactivate(),
            handle: Mutex::new(Some(handle)),
        });
        informers.insert(gvk.clone(), informer.clone());
        informer
    }

    async fn synced_informer(&self, gvk: &GroupVersionKind) -> Arc<Informer> {
        let informer = self.informer(gvk);
        if !informer.store.is_ready() && !self.inner.token.is_cancelled() {
            let waited = tokio::time::timeout(self.inner.config.sync_timeout, informer.store.wait_until_ready()).await;
            if waited.is_err() {
                warn!(%gvk, timeout = ?self.inner.config.sync_timeout, "kind did not sync in time, answering from partial cache");
            }
        }
        informer
    }

    /// Look up a single object
    ///
    /// Starts watching the kind if nothing did yet, and waits for its initial list.
    pub async fn get(&self, key: &ObjectKey) -> Option<Arc<CacheObject>> {
        let informer = self.synced_informer(&key.gvk).await;
        let obj_ref = ObjectRef {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        };
        informer.store.get(&obj_ref)
    }

    /// List the objects picked by `selector`, ordered by namespace then name
    ///
    /// Starts watching the kind if nothing did yet, and waits for its initial list.
    pub async fn list(&self, selector: &ListSelector) -> Vec<Arc<CacheObject>> {
        let informer = self.synced_informer(&selector.gvk).await;
        let mut objs = informer
            .store
            .state()
            .into_iter()
            .filter(|obj| selector.matches(obj))
            .collect::<Vec<_>>();
        objs.sort_by(|a, b| (a.namespace(), a.name()).cmp(&(b.namespace(), b.name())));
        objs
    }

    /// Stream changes to the objects passing `filter`
    ///
    /// Every object already cached is replayed as [`Event::Added`] first. The stream ends when the
    /// cache shuts down.
    pub fn subscribe(&self, filter: KindFilter) -> impl Stream<Item = Event> + Send + 'static {
        let informer = self.informer(&filter.gvk);
        // Listen before taking the snapshot so that no change can fall in between
        let mut live = informer.events.activate_cloned();
        let mut snapshot = informer.store.state();
        snapshot.sort_by(|a, b| (a.namespace(), a.name()).cmp(&(b.namespace(), b.name())));
        debug!(gvk = %filter.gvk, replayed = snapshot.len(), "new subscription");

        async_stream::stream! {
            for obj in snapshot {
                if filter.matches(&obj) {
                    yield Event::Added(obj);
                }
            }
            while let Some(event) = live.next().await {
                if filter.matches(event.object()) {
                    yield event;
                }
            }
        }
    }

    /// A read handle to the store of one kind, starting its informer if needed
    pub fn reader(&self, gvk: &GroupVersionKind) -> Store {
        self.informer(gvk).store.clone()
    }

    /// Whether the kind has completed its initial list
    pub fn is_synced(&self, gvk: &GroupVersionKind) -> bool {
        self.inner
            .informers
            .lock()
            .get(gvk)
            .is_some_and(|informer| informer.store.is_ready())
    }

    /// Wait until every watched kind has completed its initial list
    ///
    /// Returns `false` if that did not happen within the sync timeout.
    pub async fn wait_until_synced(&self) -> bool {
        let stores = self
            .inner
            .informers
            .lock()
            .values()
            .map(|informer| informer.store.clone())
            .collect::<Vec<_>>();
        let all_ready = futures::future::join_all(stores.iter().map(Store::wait_until_ready));
        matches!(
            tokio::time::timeout(self.inner.config.sync_timeout, all_ready).await,
            Ok(ready) if ready.iter().all(|r| *r)
        )
    }

    /// Kinds with a running informer
    pub fn watched_kinds(&self) -> Vec<GroupVersionKind> {
        let mut kinds = self.inner.informers.lock().keys().cloned().collect::<Vec<_>>();
        kinds.sort();
        kinds
    }

    /// Stop every informer and wait for them to exit
    ///
    /// Open subscriptions end once the buffered events are drained.
    pub async fn shutdown(&self) {
        self.inner.token.cancel();
        let informers = std::mem::take(&mut *self.inner.informers.lock());
        for (gvk, informer) in informers {
            let handle = informer.handle.lock().take();
            if let Some(handle) = handle {
                if let Err(err) = handle.await {
                    warn!(%gvk, error = %err, "informer task did not exit cleanly");
                }
            }
        }
        info!("cache shut down");
    }
}

async fn run_informer(
    source: Arc<dyn ObjectSource>,
    gvk: GroupVersionKind,
    mut writer: Writer,
    tx: Sender<Event>,
    config: Config,
    token: CancellationToken,
) {
    let mut backoff = default_backoff(config.backoff_min, config.backoff_max);
    let stream = watcher(source, gvk.clone());
    futures::pin_mut!(stream);
    'watch: loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                backoff.reset();
                for change in writer.apply_watcher_event(&event) {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break 'watch,
                        // Only fails when every receiver is gone, which is fine
                        _ = tx.broadcast_direct(change) => {}
                    }
                }
            }
            Some(Err(err)) => {
                warn!(%gvk, error = %err, "watch failed, backing off");
                if !wait_before_retry(&mut backoff, &token).await {
                    break;
                }
            }
            None => break,
        }
    }
    debug!(%gvk, "informer stopped");
}

#[cfg(test)]
mod tests {
    use super::{Cache, Config, Event};
    use crate::test_utils::{eventually, FakeSource};
    use futures::{pin_mut, StreamExt};
    use overlook_core::{CacheObject, GroupVersionKind, KindFilter, ListSelector, ObjectKey, Selector, WatchEvent};
    use std::{sync::Arc, time::Duration};

    fn pods() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "Pod")
    }

    fn pod(name: &str, ns: &str, rv: &str) -> CacheObject {
        CacheObject::new(name, &pods()).within(ns).with_resource_version(rv)
    }

    fn test_config() -> Config {
        Config {
            sync_timeout: Duration::from_secs(5),
            subscription_capacity: 16,
            backoff_min: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn get_and_list_read_the_mirror() {
        let source = Arc::new(FakeSource::default());
        source.set_objects(
            &pods(),
            vec![
                pod("b", "default", "1").with_label("app", "web"),
                pod("a", "default", "1").with_label("app", "db"),
                pod("c", "kube-system", "1").with_label("app", "web"),
            ],
            "1",
        );
        let cache = Cache::new(source, test_config());

        let hit = cache.get(&ObjectKey::new(pods(), "a").within("default")).await;
        assert_eq!(hit.map(|o| o.name().to_string()), Some("a".to_string()));
        assert!(cache.get(&ObjectKey::new(pods(), "a").within("other")).await.is_none());

        let all = cache.list(&ListSelector::all(pods())).await;
        let names = all.iter().map(|o| o.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["a", "b", "c"]);

        let web = cache
            .list(&ListSelector::all(pods()).labels(Selector::parse("app=web").unwrap()))
            .await;
        assert_eq!(web.len(), 2);
        let default_web = cache
            .list(
                &ListSelector::all(pods())
                    .within("default")
                    .labels(Selector::parse("app=web").unwrap()),
            )
            .await;
        assert_eq!(default_web.len(), 1);

        assert!(cache.is_synced(&pods()));
        assert_eq!(cache.watched_kinds(), vec![pods()]);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn subscribe_replays_then_streams_changes() {
        let source = Arc::new(FakeSource::default());
        source.set_objects(&pods(), vec![pod("a", "default", "1")], "1");
        let cache = Cache::new(source.clone(), test_config());
        assert!(cache.get(&ObjectKey::new(pods(), "a").within("default")).await.is_some());

        let events = cache.subscribe(KindFilter::new(pods()).within("default"));
        pin_mut!(events);
        assert!(matches!(events.next().await, Some(Event::Added(o)) if o.name() == "a"));

        source.push(&pods(), WatchEvent::Added(pod("other", "kube-system", "2")));
        source.push(&pods(), WatchEvent::Modified(pod("a", "default", "3")));
        source.push(&pods(), WatchEvent::Deleted(pod("a", "default", "4")));
        let ev = events.next().await.unwrap();
        assert!(matches!(&ev, Event::Modified(o) if o.resource_version() == Some("3")));
        assert!(matches!(events.next().await, Some(Event::Deleted(o)) if o.name() == "a"));
        assert!(cache.get(&ObjectKey::new(pods(), "a").within("default")).await.is_none());

        cache.shutdown().await;
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn get_after_event_is_never_older() {
        let source = Arc::new(FakeSource::default());
        source.set_objects(&pods(), vec![], "1");
        let cache = Cache::new(source.clone(), test_config());
        let events = cache.subscribe(KindFilter::new(pods()));
        pin_mut!(events);

        for rv in 2..20 {
            source.push(&pods(), WatchEvent::Modified(pod("a", "default", &rv.to_string())));
        }
        for _ in 2..20 {
            let event = events.next().await.unwrap();
            let seen: u32 = event.object().resource_version().unwrap().parse().unwrap();
            let cached = cache.get(&ObjectKey::new(pods(), "a").within("default")).await.unwrap();
            let now: u32 = cached.resource_version().unwrap().parse().unwrap();
            assert!(now >= seen);
        }
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn recovers_from_broken_watch_without_losing_state() {
        let source = Arc::new(FakeSource::default());
        source.set_objects(&pods(), vec![pod("a", "default", "1")], "1");
        let cache = Cache::new(source.clone(), test_config());
        let events = cache.subscribe(KindFilter::new(pods()));
        pin_mut!(events);
        assert!(matches!(events.next().await, Some(Event::Added(_))));

        source.fail_watches(&pods());
        source.push(&pods(), WatchEvent::Added(pod("b", "default", "2")));
        assert!(matches!(events.next().await, Some(Event::Added(o)) if o.name() == "b"));
        assert_eq!(cache.list(&ListSelector::all(pods())).await.len(), 2);
        eventually(|| source.watch_versions(&pods()).len() >= 2).await;
        assert_eq!(source.list_calls(&pods()), 1);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_cluster_times_out_reads() {
        let source = Arc::new(FakeSource::default());
        source.set_unavailable(true);
        let cache = Cache::new(source, Config {
            sync_timeout: Duration::from_millis(50),
            ..test_config()
        });
        assert!(cache.list(&ListSelector::all(pods())).await.is_empty());
        assert!(!cache.is_synced(&pods()));
        assert!(!cache.wait_until_synced().await);
        cache.shutdown().await;
    }
}
