use std::{net::SocketAddr, sync::Arc, time::Duration};

use overlook_core::{Error, PortDialer, PortForwardTarget, Session, SessionStatus, Tunnel};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Config;

/// Pause after a failed `accept` so a persistent error does not spin
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);
/// Consecutive `accept` failures after which the session fails
const MAX_ACCEPT_ERRORS: u32 = 50;

/// A session as kept in the session table
pub(super) struct SessionEntry {
    state: watch::Sender<Session>,
    pub(super) token: CancellationToken,
    pub(super) handle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionEntry {
    pub(super) fn new(session: Session, token: CancellationToken) -> Self {
        let (state, _) = watch::channel(session);
        Self {
            state,
            token,
            handle: Mutex::new(None),
        }
    }

    pub(super) fn snapshot(&self) -> Session {
        self.state.borrow().clone()
    }

    pub(super) fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    /// Move to `next`, ignoring illegal transitions
    fn transition(&self, next: SessionStatus, local_port: Option<u16>, message: Option<String>) -> bool {
        self.state.send_if_modified(|session| {
            if !session.status.can_transition_to(next) {
                warn!(session = %session.id, from = %session.status, to = %next, "ignoring illegal transition");
                return false;
            }
            session.status = next;
            if local_port.is_some() {
                session.local_port = local_port;
            }
            session.message = message;
            true
        })
    }
}

/// Owns one session from creation until it is removed from the table
pub(super) async fn supervise(
    dialer: Arc<dyn PortDialer>,
    config: Config,
    entry: Arc<SessionEntry>,
    reap: impl FnOnce() + Send + 'static,
) {
    let session = entry.snapshot();
    let result = forward(dialer.as_ref(), &config, &entry, &session.target).await;
    match result {
        Ok(()) if entry.token.is_cancelled() => {
            entry.transition(SessionStatus::Stopped, None, None);
            info!(session = %session.id, target = %session.target, "port forward stopped");
        }
        Ok(()) => {
            entry.transition(SessionStatus::Failed, None, Some("tunnel closed by remote".into()));
            warn!(session = %session.id, target = %session.target, "tunnel closed by remote");
        }
        Err(err) => {
            entry.transition(SessionStatus::Failed, None, Some(err.to_string()));
            warn!(session = %session.id, target = %session.target, error = %err, "port forward failed");
        }
    }

    // Everything is released at this point, only the snapshot lingers
    if !entry.token.is_cancelled() {
        tokio::select! {
            _ = entry.token.cancelled() => {}
            _ = tokio::time::sleep(config.terminal_retention) => {}
        }
    }
    reap();
    debug!(session = %session.id, "session removed");
}

/// Listen locally, connect upstream, and shovel bytes until cancelled or the tunnel ends
///
/// `Ok` means the session was cancelled or the remote side closed the tunnel without an error.
/// Only the former counts as stopped.
async fn forward(
    dialer: &dyn PortDialer,
    config: &Config,
    entry: &SessionEntry,
    target: &PortForwardTarget,
) -> Result<(), Error> {
    let token = &entry.token;
    let addr = SocketAddr::new(config.bind_address, target.local_port.unwrap_or(0));
    let listener = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(()),
        bound = TcpListener::bind(addr) => bound.map_err(|err| Error::Internal(format!("unable to listen on {addr}: {err}")))?,
    };
    let local_port = listener
        .local_addr()
        .map_err(|err| Error::Internal(format!("unable to read listener address: {err}")))?
        .port();

    let tunnel: Arc<dyn Tunnel> = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(()),
        connected = tokio::time::timeout(config.establish_timeout, dialer.connect(target)) => match connected {
            Ok(tunnel) => Arc::from(tunnel?),
            Err(_) => {
                return Err(Error::UpstreamUnavailable(format!(
                    "no connection to {target} within {:?}",
                    config.establish_timeout
                )))
            }
        },
    };

    entry.transition(SessionStatus::Running, Some(local_port), None);
    info!(%target, local_port, "port forward running");

    let mut connections = JoinSet::new();
    let mut closed = tunnel.closed();
    let mut accept_errors = AcceptErrors::default();
    let result = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break Ok(()),
            outcome = &mut closed => break outcome,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    accept_errors.reset();
                    debug!(%peer, "accepted connection");
                    connections.spawn(forward_connection(socket, tunnel.clone()));
                }
                Err(err) => {
                    if let Err(err) = accept_errors.record(err) {
                        break Err(err);
                    }
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(ACCEPT_ERROR_DELAY) => {}
                    }
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => match joined {
                Ok(Ok((sent, received))) => debug!(sent, received, "connection closed"),
                Ok(Err(err)) => debug!(error = %err, "connection failed"),
                Err(err) => warn!(error = %err, "connection task panicked"),
            },
        }
    };
    connections.shutdown().await;
    result
}

/// Counts consecutive `accept` failures
#[derive(Debug, Default)]
struct AcceptErrors {
    consecutive: u32,
}

impl AcceptErrors {
    fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Fails once `MAX_ACCEPT_ERRORS` errors arrive in a row
    fn record(&mut self, err: std::io::Error) -> Result<(), Error> {
        self.consecutive += 1;
        if self.consecutive >= MAX_ACCEPT_ERRORS {
            return Err(Error::Internal(format!(
                "unable to accept connections after {} attempts: {err}",
                self.consecutive
            )));
        }
        warn!(error = %err, consecutive = self.consecutive, "failed to accept connection");
        Ok(())
    }
}

async fn forward_connection(mut socket: TcpStream, tunnel: Arc<dyn Tunnel>) -> Result<(u64, u64), Error> {
    let mut upstream = tunnel.open().await?;
    tokio::io::copy_bidirectional(&mut socket, &mut upstream)
        .await
        .map_err(|err| Error::UpstreamUnavailable(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{AcceptErrors, MAX_ACCEPT_ERRORS};
    use overlook_core::Error;
    use std::io;

    fn emfile() -> io::Error {
        io::Error::other("too many open files")
    }

    #[test]
    fn persistent_accept_errors_give_up() {
        let mut errors = AcceptErrors::default();
        for _ in 1..MAX_ACCEPT_ERRORS {
            errors.record(emfile()).unwrap();
        }
        let err = errors.record(emfile()).unwrap_err();
        assert!(matches!(err, Error::Internal(msg) if msg.contains("too many open files")));
    }

    #[test]
    fn accepted_connection_resets_count() {
        let mut errors = AcceptErrors::default();
        for _ in 1..MAX_ACCEPT_ERRORS {
            errors.record(emfile()).unwrap();
        }
        errors.reset();
        errors.record(emfile()).unwrap();
    }
}
