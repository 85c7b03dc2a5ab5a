//! Keeps a [`PathMatcher`] in step with the objects of one kind
//!
//! Each object of the watched kind owns a set of path registrations, named after the object.
//! The set is registered when the object shows up and removed when it goes away.
use std::sync::Arc;

use ahash::AHashSet;
use futures::StreamExt;
use overlook_core::{CacheObject, GroupVersionKind, KindFilter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    cache::{Cache, Event},
    registry::PathMatcher,
};

/// Decides which paths an object of the watched kind contributes
pub trait KindRoutes<H: ?Sized>: Send + Sync + 'static {
    /// Patterns and handlers to register for the object called `name`
    fn routes(&self, name: &str, obj: &CacheObject) -> Vec<(String, Arc<H>)>;

    /// Called once the routes for `name` are registered
    fn added(&self, _name: &str, _obj: &CacheObject) {}

    /// Called once the routes for `name` are removed
    fn removed(&self, _name: &str) {}
}

/// Drives registrations in a [`PathMatcher`] from cache events of one kind
pub struct KindWatcher<H: ?Sized, R> {
    cache: Cache,
    matcher: PathMatcher<H>,
    routes: R,
    filter: KindFilter,
    registered: AHashSet<String>,
}

impl<H, R> KindWatcher<H, R>
where
    H: ?Sized + Send + Sync + 'static,
    R: KindRoutes<H>,
{
    /// Register routes in `matcher` for every object of `gvk` in `cache`
    pub fn new(cache: Cache, matcher: PathMatcher<H>, gvk: GroupVersionKind, routes: R) -> Self {
        Self {
            cache,
            matcher,
            routes,
            filter: KindFilter::new(gvk),
            registered: AHashSet::new(),
        }
    }

    /// Names that currently own registrations
    pub fn registered(&self) -> Vec<String> {
        let mut names = self.registered.iter().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Apply one cache event
    ///
    /// A re-delivered `Added` for a registered name does nothing, while `Modified` replaces the
    /// routes of that name with the ones built from the new object. Removing a name that was
    /// never registered does nothing.
    pub fn handle(&mut self, event: &Event) {
        match event {
            Event::Added(obj) | Event::Modified(obj) => {
                let name = obj.name();
                let known = self.registered.contains(name);
                if known && matches!(event, Event::Added(_)) {
                    debug!(name, "already registered");
                    return;
                }
                let routes = self.routes.routes(name, obj);
                match self.matcher.register_for(name, routes) {
                    Ok(keys) if known => info!(name, paths = keys.len(), "replaced kind routes"),
                    Ok(keys) => {
                        info!(name, paths = keys.len(), "registered kind");
                        self.registered.insert(name.to_string());
                        self.routes.added(name, obj);
                    }
                    Err(err) => error!(name, error = %err, "unable to register kind"),
                }
            }
            Event::Deleted(obj) => {
                let name = obj.name();
                if !self.registered.remove(name) {
                    debug!(name, "deleted kind was never registered");
                    return;
                }
                self.matcher.deregister_for(name);
                self.routes.removed(name);
                info!(name, "deregistered kind");
            }
        }
    }

    fn clear(&mut self) {
        for name in self.registered.drain() {
            self.matcher.deregister_for(&name);
            self.routes.removed(&name);
        }
    }

    /// Follow the cache until `token` is cancelled or the cache shuts down
    ///
    /// Everything registered along the way is removed again on exit.
    pub async fn run(mut self, token: CancellationToken) {
        let events = self.cache.subscribe(self.filter.clone());
        futures::pin_mut!(events);
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = events.next() => event,
            };
            match event {
                Some(event) => self.handle(&event),
                None => break,
            }
        }
        self.clear();
        debug!(gvk = %self.filter.gvk, "kind watcher stopped");
    }

    /// [`run`](Self::run) on a new task
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }
}
