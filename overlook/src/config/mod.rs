//! Settings for an [`overlook`][crate] instance
//!
//! A [`Config`] can be built in code, read from YAML, or inferred from the environment:
//!
//! - `OVERLOOK_CONFIG` names a YAML file to start from instead of the defaults
//! - `OVERLOOK_NAMESPACE` sets the initial namespace
//! - `OVERLOOK_CONTEXT` overrides the kubeconfig's current context
//! - `KUBECONFIG` lists the kubeconfig files, falling back to `~/.kube/config`
pub mod kubeconfig;

use std::{
    fs,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use overlook_runtime::{cache, portforward};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_ENV: &str = "OVERLOOK_CONFIG";
const NAMESPACE_ENV: &str = "OVERLOOK_NAMESPACE";
const CONTEXT_ENV: &str = "OVERLOOK_CONTEXT";
const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// Errors from loading a [`Config`]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read a configuration file
    #[error("failed to read '{1:?}': {0}")]
    ReadFile(#[source] std::io::Error, PathBuf),

    /// Failed to parse configuration YAML
    #[error("failed to parse configuration: {0}")]
    Parse(#[source] serde_yaml::Error),
}

/// Settings for an [`overlook`][crate] instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Namespace content is generated for when none is given
    pub namespace: String,
    /// Kubeconfig context to use instead of the file's current context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Kubeconfig files, merged in order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kubeconfig: Vec<PathBuf>,
    /// Cache tuning
    pub cache: CacheConfig,
    /// Port-forward tuning
    pub port_forward: PortForwardConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            context: None,
            kubeconfig: Vec::new(),
            cache: CacheConfig::default(),
            port_forward: PortForwardConfig::default(),
        }
    }
}

/// Cache tuning, in serializable units
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Seconds a read waits for a kind's initial list
    pub sync_timeout_secs: u64,
    /// Events buffered per kind for subscribers
    pub subscription_capacity: usize,
    /// Shortest retry delay in milliseconds
    pub backoff_min_millis: u64,
    /// Longest retry delay in seconds
    pub backoff_max_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sync_timeout_secs: 30,
            subscription_capacity: 1024,
            backoff_min_millis: 800,
            backoff_max_secs: 30,
        }
    }
}

impl From<&CacheConfig> for cache::Config {
    fn from(c: &CacheConfig) -> Self {
        Self {
            sync_timeout: Duration::from_secs(c.sync_timeout_secs),
            subscription_capacity: c.subscription_capacity.max(1),
            backoff_min: Duration::from_millis(c.backoff_min_millis),
            backoff_max: Duration::from_secs(c.backoff_max_secs),
        }
    }
}

/// Port-forward tuning, in serializable units
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortForwardConfig {
    /// Address local listeners bind to
    pub bind_address: IpAddr,
    /// Seconds a tunnel may take to establish
    pub establish_timeout_secs: u64,
    /// Seconds a stopped or failed session stays visible
    pub terminal_retention_secs: u64,
}

impl Default for PortForwardConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            establish_timeout_secs: 30,
            terminal_retention_secs: 60,
        }
    }
}

impl From<&PortForwardConfig> for portforward::Config {
    fn from(c: &PortForwardConfig) -> Self {
        Self {
            bind_address: c.bind_address,
            establish_timeout: Duration::from_secs(c.establish_timeout_secs),
            terminal_retention: Duration::from_secs(c.terminal_retention_secs),
        }
    }
}

impl Config {
    /// Parse a config from YAML, missing fields take their defaults
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(ConfigError::Parse)
    }

    /// Read a config from a YAML file
    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile(source, path.as_ref().into()))?;
        Self::from_yaml(&data)
    }

    /// Infer a config from the environment
    ///
    /// Starts from the file named by `OVERLOOK_CONFIG` if set, or from the defaults otherwise.
    pub fn infer() -> Result<Self, ConfigError> {
        let lookup = |name: &str| std::env::var_os(name).and_then(|v| v.into_string().ok());
        let base = match lookup(CONFIG_ENV).filter(|p| !p.is_empty()) {
            Some(path) => Self::read_from(path)?,
            None => Self::default(),
        };
        Ok(base.with_env(lookup))
    }

    /// Apply environment overrides read through `lookup`
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ns) = lookup(NAMESPACE_ENV).filter(|ns| !ns.is_empty()) {
            self.namespace = ns;
        }
        if let Some(context) = lookup(CONTEXT_ENV).filter(|c| !c.is_empty()) {
            self.context = Some(context);
        }
        if let Some(paths) = lookup(KUBECONFIG_ENV) {
            let paths = kubeconfig::split_path_list(&paths);
            if !paths.is_empty() {
                self.kubeconfig = paths;
            }
        }
        self
    }

    /// Kubeconfig files to read, falling back to `~/.kube/config`
    pub fn kubeconfig_paths(&self) -> Vec<PathBuf> {
        if self.kubeconfig.is_empty() {
            kubeconfig::default_kube_path().into_iter().collect()
        } else {
            self.kubeconfig.clone()
        }
    }

    /// Settings for the runtime cache
    pub fn cache_config(&self) -> cache::Config {
        (&self.cache).into()
    }

    /// Settings for the runtime session manager
    pub fn port_forward_config(&self) -> portforward::Config {
        (&self.port_forward).into()
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use std::{collections::HashMap, path::PathBuf, time::Duration};

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            r#"
namespace: kube-system
portForward:
  terminalRetentionSecs: 5
"#,
        )
        .unwrap();
        assert_eq!(config.namespace, "kube-system");
        assert_eq!(config.port_forward_config().terminal_retention, Duration::from_secs(5));
        assert_eq!(config.port_forward_config().establish_timeout, Duration::from_secs(30));
        assert_eq!(config.cache_config().sync_timeout, Duration::from_secs(30));
        assert_eq!(config.cache, Default::default());
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(Config::from_yaml("namespace: [unclosed").is_err());
        assert!(Config::from_yaml("cache:\n  syncTimeoutSecs: soon\n").is_err());
    }

    #[test]
    fn environment_overrides_defaults() {
        let env = HashMap::from([
            ("OVERLOOK_NAMESPACE", "apps"),
            ("OVERLOOK_CONTEXT", "staging"),
            ("KUBECONFIG", "/a/config::/b/config:/a/config"),
        ]);
        let config = Config::default().with_env(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.namespace, "apps");
        assert_eq!(config.context.as_deref(), Some("staging"));
        assert_eq!(config.kubeconfig_paths(), vec![
            PathBuf::from("/a/config"),
            PathBuf::from("/b/config")
        ]);
    }

    #[test]
    fn reads_config_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"context: prod\nkubeconfig: [/etc/kube/config]\n").unwrap();
        let config = Config::read_from(file.path()).unwrap();
        assert_eq!(config.context.as_deref(), Some("prod"));
        assert_eq!(config.kubeconfig_paths(), vec![PathBuf::from("/etc/kube/config")]);
        assert!(Config::read_from("/definitely/not/here.yaml").is_err());
    }

    #[test]
    fn empty_environment_changes_nothing() {
        let config = Config::default().with_env(|_| Some(String::new()));
        assert_eq!(config, Config::default());
    }
}
