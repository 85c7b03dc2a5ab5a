//! Crate with the runtime components of overlook
//!
//! This crate contains the building blocks that keep a live view of a cluster:
//! a [`watcher`] that recovers from broken watches, a [`Cache`] mirroring objects
//! per kind, a [`PathMatcher`] that a [`KindWatcher`] keeps in step with the
//! objects of one kind, and a [`SessionManager`] owning port-forward sessions.

#![deny(unsafe_code)]

pub mod cache;
pub mod kind_watcher;
pub mod portforward;
pub mod registry;
pub mod utils;
pub mod watcher;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cache::Cache;
pub use kind_watcher::{KindRoutes, KindWatcher};
pub use portforward::SessionManager;
pub use registry::PathMatcher;
pub use watcher::watcher;
