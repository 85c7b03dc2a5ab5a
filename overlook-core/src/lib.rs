//! Crate with types and traits shared by every overlook component
//!
//! This crate has no runtime of its own: it describes mirrored objects, the raw
//! watch protocol, label selectors, port-forward targets, and the two capabilities
//! a cluster client must provide. Everything here is re-exported from `overlook`
//! under `overlook::core`.
#![deny(unsafe_code)]

pub mod client;
pub use client::{ByteStream, LogSource, ObjectSource, PortDialer, Tunnel};

pub mod gvk;
pub use gvk::{GroupVersion, GroupVersionKind};

pub mod labels;
pub use labels::Selector;

pub mod metadata;
pub use metadata::{ListMeta, ObjectMeta, TypeMeta};

pub mod object;
pub use object::{CacheObject, KindFilter, ListSelector, ObjectKey, ObjectList};

pub mod portforward;
pub use portforward::{PortForwardTarget, Session, SessionId, SessionStatus};

pub mod watch;
pub use watch::WatchEvent;

mod error;
pub use error::{Error, ErrorResponse};

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
