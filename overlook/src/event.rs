//! Periodically generated events for clients
//!
//! A [`Generator`] produces one kind of [`Event`] and says how long to wait before it is
//! asked again.
use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::kubeconfig::{FsLoader, KubeContext, Loader},
    Config, Result,
};

/// Delay between two events of a generator unless it asks for another one
pub const DEFAULT_SCHEDULE_DELAY: Duration = Duration::from_secs(1);

/// Kinds of generated events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// The available kubeconfig contexts
    #[serde(rename = "kubeConfig")]
    KubeConfig,
}

/// An event sent to clients
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// What the event carries
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// The payload
    pub data: serde_json::Value,
}

/// Produces events of one type
#[async_trait]
pub trait Generator: Send + Sync {
    /// Name of the generator
    fn name(&self) -> &str;

    /// How long to wait before generating the next event
    fn schedule_delay(&self) -> Duration {
        DEFAULT_SCHEDULE_DELAY
    }

    /// Generate the current event
    async fn event(&self) -> Result<Event>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContextsResponse {
    contexts: Vec<KubeContext>,
    current_context: String,
}

/// Generates the kubeconfig contexts a client can switch between
pub struct ContextsGenerator {
    loader: Arc<dyn Loader>,
    paths: Vec<PathBuf>,
    context: Option<String>,
}

impl ContextsGenerator {
    /// Read the files and context override from `config` using the file system
    pub fn new(config: &Config) -> Self {
        Self::with_loader(config, Arc::new(FsLoader))
    }

    /// Like [`new`](Self::new) with another [`Loader`]
    pub fn with_loader(config: &Config, loader: Arc<dyn Loader>) -> Self {
        Self {
            loader,
            paths: config.kubeconfig_paths(),
            context: config.context.clone(),
        }
    }
}

#[async_trait]
impl Generator for ContextsGenerator {
    fn name(&self) -> &str {
        "kubeConfig"
    }

    async fn event(&self) -> Result<Event> {
        let (loader, paths) = (self.loader.clone(), self.paths.clone());
        let mut kubeconfig = tokio::task::spawn_blocking(move || loader.load_from_file(&paths))
            .await
            .map_err(|err| overlook_core::Error::Internal(format!("kubeconfig loader did not finish: {err}")))??;
        kubeconfig.contexts.sort_by(|a, b| a.name.cmp(&b.name));
        let current_context = match &self.context {
            Some(context) if !context.is_empty() => context.clone(),
            _ => kubeconfig.current_context,
        };
        let data = serde_json::to_value(ContextsResponse {
            contexts: kubeconfig.contexts,
            current_context,
        })
        .map_err(|err| overlook_core::Error::Internal(format!("unable to encode contexts: {err}")))?;
        Ok(Event {
            event_type: EventType::KubeConfig,
            data,
        })
    }
}
