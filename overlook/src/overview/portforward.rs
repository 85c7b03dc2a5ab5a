//! Port-forward verbs with structured payloads
//!
//! Each verb returns a [`Response`] holding a status code and a JSON body, either a
//! [`SessionPayload`] or an [`ErrorPayload`]. Serving them over HTTP is left to the caller.
use chrono::{DateTime, Utc};
use http::StatusCode;
use overlook_core::{Error, PortForwardTarget, Session, SessionId, SessionStatus};
use overlook_runtime::SessionManager;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Body of a create request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    /// Namespace of the pod
    #[serde(default)]
    pub namespace: String,
    /// Name of the pod
    #[serde(default)]
    pub pod: String,
    /// Container within the pod
    #[serde(default)]
    pub container: String,
    /// Port inside the pod
    #[serde(default)]
    pub port: u16,
    /// Local port to listen on, a free one is picked when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
}

impl From<CreateRequest> for PortForwardTarget {
    fn from(req: CreateRequest) -> Self {
        let target = PortForwardTarget::new(&req.namespace, &req.pod, &req.container, req.port);
        match req.local_port {
            Some(port) => target.local_port(port),
            None => target,
        }
    }
}

/// A session as returned to callers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    /// Session id
    pub id: SessionId,
    /// Current state
    pub status: SessionStatus,
    /// What is being forwarded
    pub target: PortForwardTarget,
    /// The bound local port, once listening
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// Why the session failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<Session> for SessionPayload {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            status: session.status,
            target: session.target,
            local_port: session.local_port,
            created_at: session.created_at,
            message: session.message,
        }
    }
}

/// A failed verb
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine readable error code
    pub code: String,
    /// Human readable description
    pub message: String,
}

impl From<&Error> for ErrorPayload {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// The status code an error is reported with
pub fn status_code(err: &Error) -> StatusCode {
    match err {
        Error::InvalidTarget(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::UpstreamUnavailable(_) | Error::Api(_) => StatusCode::BAD_GATEWAY,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Outcome of a verb
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// Status code to answer with
    pub status: StatusCode,
    /// JSON body, `Null` when there is nothing to say
    pub body: serde_json::Value,
}

impl Response {
    fn ok<T: Serialize>(status: StatusCode, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status, body },
            Err(err) => Self::error(&Error::Internal(format!("unable to encode response: {err}"))),
        }
    }

    fn empty(status: StatusCode) -> Self {
        Self {
            status,
            body: serde_json::Value::Null,
        }
    }

    fn error(err: &Error) -> Self {
        let status = status_code(err);
        if status.is_server_error() {
            warn!(error = %err, "port forward request failed");
        } else {
            debug!(error = %err, "port forward request rejected");
        }
        Self {
            status,
            body: serde_json::to_value(ErrorPayload::from(err)).unwrap_or_default(),
        }
    }

    /// Whether the verb succeeded
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Start a session from a JSON request body
pub fn create(sessions: &SessionManager, body: &[u8]) -> Response {
    let request = match serde_json::from_slice::<CreateRequest>(body) {
        Ok(request) => request,
        Err(err) => return Response::error(&Error::InvalidTarget(format!("malformed request: {err}"))),
    };
    match sessions.create(request.into()) {
        Ok(session) => Response::ok(StatusCode::CREATED, &SessionPayload::from(session)),
        Err(err) => Response::error(&err),
    }
}

/// Snapshot of one session
pub fn read(sessions: &SessionManager, id: &str) -> Response {
    let found = id
        .parse::<SessionId>()
        .and_then(|id| sessions.get(&id).ok_or_else(|| Error::NotFound(format!("port forward {id}"))));
    match found {
        Ok(session) => Response::ok(StatusCode::OK, &SessionPayload::from(session)),
        Err(err) => Response::error(&err),
    }
}

/// Stop and remove one session
pub async fn delete(sessions: &SessionManager, id: &str) -> Response {
    let id = match id.parse::<SessionId>() {
        Ok(id) => id,
        Err(err) => return Response::error(&err),
    };
    match sessions.delete(&id).await {
        Ok(()) => Response::empty(StatusCode::NO_CONTENT),
        Err(err) => Response::error(&err),
    }
}

/// Snapshots of every session, oldest first
pub fn list(sessions: &SessionManager) -> Response {
    let payloads = sessions
        .list()
        .into_iter()
        .map(SessionPayload::from)
        .collect::<Vec<_>>();
    Response::ok(StatusCode::OK, &payloads)
}
