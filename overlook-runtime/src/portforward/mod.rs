//! Port-forward sessions: local listeners tunnelled to pod ports
//!
//! Every session is owned by its own supervisory task. The task binds the local listener,
//! establishes the tunnel through a [`PortDialer`], forwards accepted connections, and records
//! the terminal state once the tunnel ends. Deleting a session cancels that task and waits
//! for it, so all sockets are closed by the time [`SessionManager::delete`] returns.

mod session;

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use dashmap::DashMap;
use overlook_core::{Error, PortDialer, PortForwardTarget, Session, SessionId, SessionStatus};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use session::{supervise, SessionEntry};

/// Tuning for the [`SessionManager`]
#[derive(Clone, Debug)]
pub struct Config {
    /// Address local listeners bind to
    pub bind_address: IpAddr,
    /// How long establishing a tunnel may take before the session fails
    pub establish_timeout: Duration,
    /// How long a stopped or failed session stays visible before it is removed
    pub terminal_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            establish_timeout: Duration::from_secs(30),
            terminal_retention: Duration::from_secs(60),
        }
    }
}

struct Inner {
    dialer: Arc<dyn PortDialer>,
    config: Config,
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    token: CancellationToken,
}

/// Creates, tracks, and terminates port-forward sessions
///
/// Cloning will produce a new handle to the same session table. Must be used from within a
/// tokio runtime.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// An empty session table dialing through `dialer`
    pub fn new(dialer: Arc<dyn PortDialer>, config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                dialer,
                config,
                sessions: DashMap::new(),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Start forwarding to `target`
    ///
    /// Returns the session in its `Requested` state right away, the tunnel is established in the
    /// background. Malformed targets are rejected before anything is allocated.
    pub fn create(&self, target: PortForwardTarget) -> Result<Session, Error> {
        target.validate()?;
        if self.inner.token.is_cancelled() {
            return Err(Error::Internal("session manager is shut down".into()));
        }

        let session = Session {
            id: SessionId::generate(),
            target,
            status: SessionStatus::Requested,
            created_at: Utc::now(),
            local_port: None,
            message: None,
        };
        let id = session.id;
        let entry = Arc::new(SessionEntry::new(session.clone(), self.inner.token.child_token()));
        self.inner.sessions.insert(id, entry.clone());

        let reap = {
            let inner = Arc::downgrade(&self.inner);
            move || {
                if let Some(inner) = inner.upgrade() {
                    inner.sessions.remove(&id);
                }
            }
        };
        let handle = tokio::spawn(supervise(
            self.inner.dialer.clone(),
            self.inner.config.clone(),
            entry.clone(),
            reap,
        ));
        *entry.handle.lock() = Some(handle);
        info!(session = %id, target = %session.target, "port forward requested");
        Ok(session)
    }

    /// The current state of a session
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.inner.sessions.get(id).map(|entry| entry.snapshot())
    }

    /// Follow the state of a session
    pub fn watch(&self, id: &SessionId) -> Option<watch::Receiver<Session>> {
        self.inner.sessions.get(id).map(|entry| entry.subscribe())
    }

    /// Every known session, oldest first
    pub fn list(&self) -> Vec<Session> {
        let mut sessions = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.snapshot())
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        sessions
    }

    /// Number of sessions, terminal ones included
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether there are no sessions
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Stop a session and wait until its resources are released
    ///
    /// Terminal sessions are removed the same way. Fails with [`Error::NotFound`] when the id is
    /// unknown or another delete of the same id is already underway.
    pub async fn delete(&self, id: &SessionId) -> Result<(), Error> {
        let entry = self
            .inner
            .sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("port forward {id}")))?;
        entry.token.cancel();
        let handle = entry.handle.lock().take();
        let Some(handle) = handle else {
            return Err(Error::NotFound(format!("port forward {id}")));
        };
        if let Err(err) = handle.await {
            warn!(session = %id, error = %err, "session task did not exit cleanly");
        }
        self.inner.sessions.remove(id);
        info!(session = %id, "port forward deleted");
        Ok(())
    }

    /// Stop every session and wait for all of them
    pub async fn shutdown(&self) {
        self.inner.token.cancel();
        let entries = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();
        for entry in entries {
            let handle = entry.handle.lock().take();
            if let Some(handle) = handle {
                if let Err(err) = handle.await {
                    warn!(error = %err, "session task did not exit cleanly");
                }
            }
        }
        self.inner.sessions.clear();
        info!("port forwards shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, SessionManager};
    use crate::test_utils::{eventually, DialBehavior, FakeDialer};
    use overlook_core::{Error, PortForwardTarget, SessionId, SessionStatus};
    use std::{sync::Arc, time::Duration};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    fn target() -> PortForwardTarget {
        PortForwardTarget::new("default", "p1", "c1", 8080)
    }

    fn manager(dialer: Arc<FakeDialer>) -> SessionManager {
        SessionManager::new(dialer, Config {
            establish_timeout: Duration::from_millis(200),
            ..Config::default()
        })
    }

    async fn running_port(manager: &SessionManager, id: &SessionId) -> u16 {
        let mut rx = manager.watch(id).unwrap();
        let session = rx
            .wait_for(|s| s.status != SessionStatus::Requested)
            .await
            .unwrap()
            .clone();
        assert_eq!(session.status, SessionStatus::Running, "{:?}", session.message);
        session.local_port.unwrap()
    }

    #[tokio::test]
    async fn create_get_delete() {
        let dialer = Arc::new(FakeDialer::default());
        let manager = manager(dialer);
        let session = manager.create(target()).unwrap();
        assert_eq!(session.status, SessionStatus::Requested);
        assert!(!session.id.to_string().is_empty());

        let seen = manager.get(&session.id).unwrap();
        assert!(matches!(seen.status, SessionStatus::Requested | SessionStatus::Running));

        let port = running_port(&manager, &session.id).await;
        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        manager.delete(&session.id).await.unwrap();
        assert!(manager.get(&session.id).is_none());
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        assert!(matches!(manager.delete(&session.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn invalid_target_allocates_nothing() {
        let dialer = Arc::new(FakeDialer::default());
        let manager = manager(dialer.clone());
        let err = manager.create(PortForwardTarget::new("default", "", "c1", 8080)).unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
        assert!(manager.is_empty());
        tokio::task::yield_now().await;
        assert_eq!(dialer.connects(), 0);
    }

    #[tokio::test]
    async fn deleting_unknown_id_leaves_others_alone() {
        let manager = manager(Arc::new(FakeDialer::default()));
        let session = manager.create(target()).unwrap();
        running_port(&manager, &session.id).await;
        assert!(matches!(
            manager.delete(&SessionId::generate()).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(manager.get(&session.id).unwrap().status, SessionStatus::Running);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn broken_tunnel_fails_abandoned_session() {
        let dialer = Arc::new(FakeDialer::default());
        let manager = manager(dialer.clone());
        let session = manager.create(target()).unwrap();
        let port = running_port(&manager, &session.id).await;

        dialer.close_tunnels(Err(Error::UpstreamUnavailable("stream reset".into())));
        let mut rx = manager.watch(&session.id).unwrap();
        let failed = rx.wait_for(|s| s.status.is_terminal()).await.unwrap().clone();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert!(failed.message.unwrap().contains("stream reset"));
        // the listener is gone without anyone calling delete
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        // terminal sessions are deleted like any other
        manager.delete(&session.id).await.unwrap();
        assert!(manager.get(&session.id).is_none());
    }

    #[tokio::test]
    async fn remote_close_without_delete_fails_session() {
        let dialer = Arc::new(FakeDialer::default());
        let manager = manager(dialer.clone());
        let session = manager.create(target()).unwrap();
        let port = running_port(&manager, &session.id).await;
        dialer.close_tunnels(Ok(()));
        let mut rx = manager.watch(&session.id).unwrap();
        let ended = rx.wait_for(|s| s.status.is_terminal()).await.unwrap().clone();
        assert_eq!(ended.status, SessionStatus::Failed);
        assert_eq!(ended.message.as_deref(), Some("tunnel closed by remote"));
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn establish_errors_fail_session() {
        let dialer = Arc::new(FakeDialer::default());
        dialer.set_behavior(DialBehavior::Fail(Error::UpstreamUnavailable("pod not running".into())));
        let manager = manager(dialer.clone());
        let session = manager.create(target()).unwrap();
        let mut rx = manager.watch(&session.id).unwrap();
        let failed = rx.wait_for(|s| s.status.is_terminal()).await.unwrap().clone();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert!(failed.message.unwrap().contains("pod not running"));

        dialer.set_behavior(DialBehavior::Hang);
        let session = manager.create(target()).unwrap();
        let mut rx = manager.watch(&session.id).unwrap();
        let timed_out = rx.wait_for(|s| s.status.is_terminal()).await.unwrap().clone();
        assert_eq!(timed_out.status, SessionStatus::Failed);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn delete_before_running_stops_session() {
        let dialer = Arc::new(FakeDialer::default());
        dialer.set_behavior(DialBehavior::Hang);
        let manager = SessionManager::new(dialer, Config::default());
        let session = manager.create(target()).unwrap();
        let rx = manager.watch(&session.id).unwrap();
        manager.delete(&session.id).await.unwrap();
        assert_eq!(rx.borrow().status, SessionStatus::Stopped);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn terminal_sessions_are_reaped_after_retention() {
        let dialer = Arc::new(FakeDialer::default());
        dialer.set_behavior(DialBehavior::Fail(Error::UpstreamUnavailable("nope".into())));
        let manager = SessionManager::new(dialer, Config {
            terminal_retention: Duration::from_millis(20),
            ..Config::default()
        });
        let session = manager.create(target()).unwrap();
        eventually(|| manager.get(&session.id).is_none()).await;
        assert!(matches!(manager.delete(&session.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let manager = manager(Arc::new(FakeDialer::default()));
        let a = manager.create(target()).unwrap();
        let b = manager.create(target()).unwrap();
        running_port(&manager, &a.id).await;
        running_port(&manager, &b.id).await;
        assert_eq!(manager.list().len(), 2);
        let (rx_a, rx_b) = (manager.watch(&a.id).unwrap(), manager.watch(&b.id).unwrap());

        manager.shutdown().await;
        assert!(manager.is_empty());
        assert_eq!(rx_a.borrow().status, SessionStatus::Stopped);
        assert_eq!(rx_b.borrow().status, SessionStatus::Stopped);
        assert!(matches!(manager.create(target()), Err(Error::Internal(_))));
    }
}
