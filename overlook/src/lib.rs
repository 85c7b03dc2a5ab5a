//! Live overview of a Kubernetes cluster
//!
//! `overlook` keeps an in-memory, watch-backed mirror of cluster objects and
//! serves content for paths under `/overview`. Paths for custom resources come
//! and go as their definitions are added to and removed from the cluster, and
//! port-forward sessions to pods can be created, inspected, and deleted.
//!
//! The crate is a facade over two layers, re-exported here:
//!
//! - [`core`]: object model, label selectors, error taxonomy, and the client
//!   capabilities ([`core::ObjectSource`], [`core::PortDialer`]) a cluster
//!   client has to provide
//! - [`runtime`]: the watcher, cache, path matcher, kind watcher, and
//!   port-forward session manager
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use overlook::{
//!     core::{LogSource, ObjectSource, PortDialer},
//!     overview::{ClusterOverview, ContentOptions, Options},
//!     Config,
//! };
//!
//! async fn serve(
//!     source: Arc<dyn ObjectSource>,
//!     dialer: Arc<dyn PortDialer>,
//!     logs: Arc<dyn LogSource>,
//! ) -> overlook::Result<()> {
//!     let config = Config::infer()?;
//!     let overview = ClusterOverview::new(Options { source, dialer, logs, config })?;
//!     overview.start()?;
//!     let root = overview.content("/overview", "default", &ContentOptions::default()).await?;
//!     println!("{}", root.title);
//!     overview.stop().await;
//!     Ok(())
//! }
//! ```
#![deny(unsafe_code)]

pub use overlook_core as core;
pub use overlook_runtime as runtime;

pub mod config;
pub use config::Config;

pub mod event;
pub mod overview;

mod error;
pub use error::Error;

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
