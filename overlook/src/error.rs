//! Error handling in [`overlook`][crate]
use thiserror::Error;

pub use crate::config::{kubeconfig::KubeconfigError, ConfigError};

/// Possible errors when working with [`overlook`][crate]
#[derive(Error, Debug)]
pub enum Error {
    /// A cache, session, or content error
    #[error(transparent)]
    Core(#[from] overlook_core::Error),

    /// A content path could not be registered
    #[error("unable to register content path: {0}")]
    Registry(#[from] overlook_runtime::registry::Error),

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A kubeconfig could not be loaded
    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] KubeconfigError),
}

impl Error {
    /// The core error behind this one, if any
    pub fn as_core(&self) -> Option<&overlook_core::Error> {
        match self {
            Error::Core(err) => Some(err),
            _ => None,
        }
    }
}
