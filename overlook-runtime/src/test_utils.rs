//! In-memory fakes of the cluster capabilities, for tests
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};
use overlook_core::{
    client::WatchStream, ByteStream, CacheObject, Error, GroupVersionKind, ListMeta, LogSource, ObjectList,
    ObjectSource, PortDialer, PortForwardTarget, Tunnel, WatchEvent,
};
use parking_lot::Mutex;
use tokio::sync::watch;

type WatchItem = Result<WatchEvent<CacheObject>, Error>;

#[derive(Default)]
struct KindState {
    objects: Vec<CacheObject>,
    resource_version: String,
    list_calls: usize,
    watch_versions: Vec<String>,
    watchers: Vec<mpsc::UnboundedSender<WatchItem>>,
    pending: Vec<WatchItem>,
}

/// An [`ObjectSource`] driven by the test
///
/// Lists return whatever was last given to [`FakeSource::set_objects`]. Pushed events go to every
/// open watch of the kind, or are held back for the next watch when none is open.
#[derive(Default)]
pub struct FakeSource {
    kinds: Mutex<AHashMap<GroupVersionKind, KindState>>,
    unavailable: AtomicBool,
}

impl FakeSource {
    /// Set what the next list of `gvk` returns
    pub fn set_objects(&self, gvk: &GroupVersionKind, objects: Vec<CacheObject>, resource_version: &str) {
        let mut kinds = self.kinds.lock();
        let kind = kinds.entry(gvk.clone()).or_default();
        kind.objects = objects;
        kind.resource_version = resource_version.into();
    }

    /// Deliver a watch event for `gvk`
    pub fn push(&self, gvk: &GroupVersionKind, event: WatchEvent<CacheObject>) {
        self.send(gvk, Ok(event));
    }

    /// Break every open watch of `gvk` with a transport error
    ///
    /// Events pushed afterwards are held back for the next watch.
    pub fn fail_watches(&self, gvk: &GroupVersionKind) {
        let mut kinds = self.kinds.lock();
        let kind = kinds.entry(gvk.clone()).or_default();
        for tx in kind.watchers.drain(..) {
            let _ = tx.unbounded_send(Err(Error::UpstreamUnavailable("connection reset".into())));
        }
    }

    fn send(&self, gvk: &GroupVersionKind, item: WatchItem) {
        let mut kinds = self.kinds.lock();
        let kind = kinds.entry(gvk.clone()).or_default();
        kind.watchers.retain(|tx| !tx.is_closed());
        if kind.watchers.is_empty() {
            kind.pending.push(item);
            return;
        }
        for tx in &kind.watchers {
            let _ = tx.unbounded_send(item.clone());
        }
    }

    /// End every open watch of `gvk` cleanly
    pub fn close_watches(&self, gvk: &GroupVersionKind) {
        if let Some(kind) = self.kinds.lock().get_mut(gvk) {
            kind.watchers.clear();
        }
    }

    /// Make every list and watch call fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// How many times `gvk` was listed
    pub fn list_calls(&self, gvk: &GroupVersionKind) -> usize {
        self.kinds.lock().get(gvk).map_or(0, |k| k.list_calls)
    }

    /// The resource versions each watch of `gvk` was started from
    pub fn watch_versions(&self, gvk: &GroupVersionKind) -> Vec<String> {
        self.kinds
            .lock()
            .get(gvk)
            .map(|k| k.watch_versions.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectSource for FakeSource {
    async fn list(&self, gvk: &GroupVersionKind) -> Result<ObjectList, Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::UpstreamUnavailable("cluster unreachable".into()));
        }
        let mut kinds = self.kinds.lock();
        let kind = kinds.entry(gvk.clone()).or_default();
        kind.list_calls += 1;
        Ok(ObjectList {
            metadata: ListMeta {
                resource_version: Some(kind.resource_version.clone()),
            },
            items: kind.objects.clone(),
        })
    }

    async fn watch(&self, gvk: &GroupVersionKind, resource_version: &str) -> Result<WatchStream, Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::UpstreamUnavailable("cluster unreachable".into()));
        }
        let (tx, rx) = mpsc::unbounded();
        let mut kinds = self.kinds.lock();
        let kind = kinds.entry(gvk.clone()).or_default();
        kind.watch_versions.push(resource_version.into());
        for item in kind.pending.drain(..) {
            let _ = tx.unbounded_send(item);
        }
        kind.watchers.push(tx);
        Ok(rx.boxed())
    }
}

/// How the next [`FakeDialer::connect`] behaves
#[derive(Clone, Debug, Default)]
pub enum DialBehavior {
    /// Connect and echo every byte back
    #[default]
    Echo,
    /// Fail with the given error
    Fail(Error),
    /// Never resolve
    Hang,
}

/// A [`PortDialer`] whose tunnels echo bytes back to the caller
#[derive(Default)]
pub struct FakeDialer {
    behavior: Mutex<DialBehavior>,
    connects: AtomicUsize,
    tunnels: Mutex<Vec<watch::Sender<Option<Result<(), Error>>>>>,
}

impl FakeDialer {
    /// Change how subsequent connects behave
    pub fn set_behavior(&self, behavior: DialBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// How many connects were attempted
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Terminate every established tunnel with `outcome`
    pub fn close_tunnels(&self, outcome: Result<(), Error>) {
        for tx in self.tunnels.lock().iter() {
            tx.send_replace(Some(outcome.clone()));
        }
    }
}

#[async_trait]
impl PortDialer for FakeDialer {
    async fn connect(&self, _target: &PortForwardTarget) -> Result<Box<dyn Tunnel>, Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().clone();
        match behavior {
            DialBehavior::Echo => {
                let (tx, rx) = watch::channel(None);
                self.tunnels.lock().push(tx);
                Ok(Box::new(EchoTunnel { closed: rx }))
            }
            DialBehavior::Fail(err) => Err(err),
            DialBehavior::Hang => {
                futures::future::pending::<()>().await;
                Err(Error::Internal("unreachable".into()))
            }
        }
    }
}

struct EchoTunnel {
    closed: watch::Receiver<Option<Result<(), Error>>>,
}

#[async_trait]
impl Tunnel for EchoTunnel {
    async fn open(&self) -> Result<ByteStream, Error> {
        let (local, remote) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(remote);
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        });
        Ok(Box::new(local))
    }

    async fn closed(&self) -> Result<(), Error> {
        let mut rx = self.closed.clone();
        let outcome = rx.wait_for(Option::is_some).await.map(|o| (*o).clone());
        match outcome {
            Ok(outcome) => outcome.unwrap_or(Ok(())),
            // dialer dropped, nothing will ever close us
            Err(_) => {
                futures::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// A [`LogSource`] serving whatever the test gave it
#[derive(Default)]
pub struct FakeLogs {
    logs: Mutex<AHashMap<(String, String, String), String>>,
}

impl FakeLogs {
    /// Set the raw log text of a container
    pub fn set_logs(&self, namespace: &str, pod: &str, container: &str, text: &str) {
        self.logs
            .lock()
            .insert((namespace.into(), pod.into(), container.into()), text.into());
    }
}

#[async_trait]
impl LogSource for FakeLogs {
    async fn logs(&self, namespace: &str, pod: &str, container: &str) -> Result<String, Error> {
        self.logs
            .lock()
            .get(&(namespace.to_string(), pod.to_string(), container.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("container {namespace}/{pod}/{container}")))
    }
}

/// Poll `f` until it returns true, panicking after a while
pub async fn eventually(mut f: impl FnMut() -> bool) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
