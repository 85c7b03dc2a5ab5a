//! Capabilities an already-authenticated cluster client has to provide
//!
//! The cache only needs to list and watch objects of a kind, the port-forward
//! session manager only needs to open byte streams to a pod port, and container logs
//! are read as text. Any client implementing these traits can be plugged in.
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::Error, gvk::GroupVersionKind, object::ObjectList, portforward::PortForwardTarget,
    watch::WatchEvent, CacheObject,
};

/// Stream of raw watch events returned by [`ObjectSource::watch`]
pub type WatchStream = BoxStream<'static, Result<WatchEvent<CacheObject>, Error>>;

/// A bidirectional byte stream
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// A boxed bidirectional byte stream to a remote port
pub type ByteStream = Box<dyn AsyncReadWrite>;

/// List and watch objects of a kind
#[async_trait]
pub trait ObjectSource: Send + Sync + 'static {
    /// List every object of the kind, across all namespaces
    async fn list(&self, gvk: &GroupVersionKind) -> Result<ObjectList, Error>;

    /// Watch the kind for changes after `resource_version`
    ///
    /// The stream ends when the server closes the watch. A resource version that is
    /// too old is reported as a [`WatchEvent::Error`] with code 410.
    async fn watch(&self, gvk: &GroupVersionKind, resource_version: &str) -> Result<WatchStream, Error>;
}

/// Establishes forwarding connections to pod ports
#[async_trait]
pub trait PortDialer: Send + Sync + 'static {
    /// Connect to the target, resolving once the connection is confirmed live
    async fn connect(&self, target: &PortForwardTarget) -> Result<Box<dyn Tunnel>, Error>;
}

/// Reads the logs of pod containers
#[async_trait]
pub trait LogSource: Send + Sync + 'static {
    /// Everything the container logged so far
    ///
    /// One entry per line, each line prefixed with its RFC 3339 timestamp and a space.
    async fn logs(&self, namespace: &str, pod: &str, container: &str) -> Result<String, Error>;
}

/// An established forwarding connection
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Open a new byte stream to the remote port over this connection
    async fn open(&self) -> Result<ByteStream, Error>;

    /// Resolves when the connection terminates
    ///
    /// `Ok` means the remote side closed the connection cleanly, `Err` that it broke.
    async fn closed(&self) -> Result<(), Error>;
}
