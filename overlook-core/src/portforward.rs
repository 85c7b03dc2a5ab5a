//! Port-forward session targets and the snapshots handed out to callers
use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Where a session forwards to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardTarget {
    /// Namespace of the pod
    pub namespace: String,
    /// Name of the pod
    pub pod: String,
    /// Container within the pod
    pub container: String,
    /// Local port to listen on, `None` or `0` picks a free port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    /// Port inside the pod
    pub remote_port: u16,
}

impl PortForwardTarget {
    /// A target listening on an ephemeral local port
    pub fn new(namespace: &str, pod: &str, container: &str, remote_port: u16) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
            local_port: None,
            remote_port,
        }
    }

    /// Listen on a fixed local port
    #[must_use]
    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// Reject targets that can never be forwarded to
    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.trim().is_empty() {
            return Err(Error::InvalidTarget("namespace is required".into()));
        }
        if self.pod.trim().is_empty() {
            return Err(Error::InvalidTarget("pod is required".into()));
        }
        if self.container.trim().is_empty() {
            return Err(Error::InvalidTarget("container is required".into()));
        }
        if self.remote_port == 0 {
            return Err(Error::InvalidTarget("remote port is required".into()));
        }
        Ok(())
    }
}

impl fmt::Display for PortForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.namespace, self.pod, self.container, self.remote_port
        )
    }
}

/// Opaque session identity, unique for the lifetime of the process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh id
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::NotFound(format!("port forward {s}")))
    }
}

/// Lifecycle state of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Created, connection not yet confirmed
    Requested,
    /// Forwarding
    Running,
    /// The connection broke, was closed by the remote side, or could not be established
    Failed,
    /// Terminated on request
    Stopped,
}

impl SessionStatus {
    /// Terminal states never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Failed | SessionStatus::Stopped)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Requested, Running) | (Requested, Failed) | (Requested, Stopped) | (Running, Failed) | (Running, Stopped)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Requested => "Requested",
            SessionStatus::Running => "Running",
            SessionStatus::Failed => "Failed",
            SessionStatus::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// A point-in-time copy of a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Identity
    pub id: SessionId,
    /// What is being forwarded
    pub target: PortForwardTarget,
    /// Current state
    pub status: SessionStatus,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// The bound local port, once listening
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    /// Why the session failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{PortForwardTarget, SessionId, SessionStatus};
    use crate::Error;

    #[test]
    fn validate_rejects_missing_fields() {
        assert!(PortForwardTarget::new("default", "p1", "c1", 8080).validate().is_ok());
        for bad in [
            PortForwardTarget::new("", "p1", "c1", 8080),
            PortForwardTarget::new("default", "", "c1", 8080),
            PortForwardTarget::new("default", "p1", " ", 8080),
            PortForwardTarget::new("default", "p1", "c1", 0),
        ] {
            assert!(matches!(bad.validate(), Err(Error::InvalidTarget(_))), "{bad:?}");
        }
    }

    #[test]
    fn terminal_states_are_final() {
        use SessionStatus::*;
        assert!(Requested.can_transition_to(Running));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Requested));
        for terminal in [Failed, Stopped] {
            assert!(terminal.is_terminal());
            for next in [Requested, Running, Failed, Stopped] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn ids_are_unique_and_parse_back() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<SessionId>().unwrap(), a);
        assert!("not-an-id".parse::<SessionId>().is_err());
    }
}
