//! The cluster overview
//!
//! [`ClusterOverview`] owns everything behind the `/overview` content paths: the cache, the
//! path matcher with the static describers registered first, the kind watcher adding a
//! section per custom resource definition, and the port-forward sessions. Container logs
//! are read straight from the cluster.
use std::sync::Arc;

use overlook_core::{Error as CoreError, LogSource, ObjectSource, PortDialer};
use overlook_runtime::{Cache, KindWatcher, PathMatcher, SessionManager};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Config, Result};

mod describer;
pub use describer::{crd_gvk, CrdRoutes, CrdSection};
use describer::{EventsDescriber, PodDescriber, PodListDescriber, RootDescriber};

mod generator;
use generator::into_describer;
pub use generator::{ContentOptions, ContentResponse, Describer, DescriberContext, Generator};

pub mod logs;
pub use logs::{LogEntry, LogResponse};

pub mod portforward;

/// What a [`ClusterOverview`] is built from
pub struct Options {
    /// Lists and watches cluster objects
    pub source: Arc<dyn ObjectSource>,
    /// Opens tunnels to pods
    pub dialer: Arc<dyn PortDialer>,
    /// Reads container logs
    pub logs: Arc<dyn LogSource>,
    /// Settings
    pub config: Config,
}

enum Lifecycle {
    Idle,
    Running {
        token: CancellationToken,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Content and port forwards for a cluster
pub struct ClusterOverview {
    config: Config,
    cache: Cache,
    generator: Generator,
    sessions: SessionManager,
    logs: Arc<dyn LogSource>,
    crds: Arc<CrdSection>,
    lifecycle: Mutex<Lifecycle>,
}

impl ClusterOverview {
    /// Build an overview and register its static paths
    ///
    /// Nothing is watched until [`start`](Self::start). Must be called from within a tokio runtime.
    pub fn new(options: Options) -> Result<Self> {
        let Options {
            source,
            dialer,
            logs,
            config,
        } = options;
        let cache = Cache::new(source, config.cache_config());
        let sessions = SessionManager::new(dialer, config.port_forward_config());
        let crds = Arc::new(CrdSection::default());

        let matcher = PathMatcher::<dyn Describer>::new();
        matcher.register("/overview", into_describer(RootDescriber))?;
        matcher.register("/overview/pods", into_describer(PodListDescriber))?;
        matcher.register("/overview/pod/{name}", into_describer(PodDescriber))?;
        matcher.register("/overview/events", into_describer(EventsDescriber))?;
        matcher.register("/overview/crd", crds.clone())?;
        debug!(patterns = ?matcher.patterns(), "registered static paths");

        Ok(Self {
            generator: Generator::new(cache.clone(), matcher),
            config,
            cache,
            sessions,
            logs,
            crds,
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Name of the module
    pub fn name(&self) -> &'static str {
        "overview"
    }

    /// Root of the content paths served
    pub fn content_path(&self) -> String {
        format!("/{}", self.name())
    }

    /// Namespace content is generated for when the caller has none
    pub fn default_namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Start following custom resource definitions
    ///
    /// Starting twice is a no-op. Fails once the overview was stopped.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running { .. } => {
                debug!("overview already started");
                Ok(())
            }
            Lifecycle::Stopped => Err(CoreError::Internal("overview was stopped".into()).into()),
            Lifecycle::Idle => {
                let token = CancellationToken::new();
                let watcher = KindWatcher::new(
                    self.cache.clone(),
                    self.generator.matcher().clone(),
                    crd_gvk(),
                    CrdRoutes::new(self.crds.clone()),
                );
                let handle = watcher.spawn(token.clone());
                *lifecycle = Lifecycle::Running { token, handle };
                info!(module = self.name(), "started");
                Ok(())
            }
        }
    }

    /// Stop watching, end every port forward, and shut the cache down
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        if let Lifecycle::Running { token, handle } = previous {
            token.cancel();
            if let Err(err) = handle.await {
                warn!(error = %err, "custom resource watcher did not exit cleanly");
            }
        }
        self.sessions.shutdown().await;
        self.cache.shutdown().await;
        info!(module = self.name(), "stopped");
    }

    /// Content is generated per request, so there is nothing to switch
    pub fn set_namespace(&self, namespace: &str) -> Result<()> {
        debug!(namespace, module = self.name(), "setting namespace (noop)");
        Ok(())
    }

    /// Generate the content for `path` in `namespace`
    pub async fn content(&self, path: &str, namespace: &str, options: &ContentOptions) -> Result<ContentResponse> {
        Ok(self.generator.generate(path, namespace, options).await?)
    }

    /// Log lines of a container of a pod in `namespace`
    pub async fn container_logs(&self, namespace: &str, pod: &str, container: &str) -> Result<LogResponse> {
        Ok(logs::container_logs(self.logs.as_ref(), namespace, pod, container).await?)
    }

    /// Start a port forward from a JSON request body
    pub fn create_port_forward(&self, body: &[u8]) -> portforward::Response {
        portforward::create(&self.sessions, body)
    }

    /// Snapshot of one port forward
    pub fn port_forward(&self, id: &str) -> portforward::Response {
        portforward::read(&self.sessions, id)
    }

    /// Stop and remove one port forward
    pub async fn delete_port_forward(&self, id: &str) -> portforward::Response {
        portforward::delete(&self.sessions, id).await
    }

    /// Snapshots of every port forward
    pub fn port_forwards(&self) -> portforward::Response {
        portforward::list(&self.sessions)
    }

    /// The port-forward sessions
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// The object cache
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// The matcher content paths are resolved through
    pub fn matcher(&self) -> &PathMatcher<dyn Describer> {
        self.generator.matcher()
    }

    /// Names of the custom resource definitions with a section
    pub fn crd_names(&self) -> Vec<String> {
        self.crds.names()
    }
}
