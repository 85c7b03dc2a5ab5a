//! Kubeconfig context discovery
//!
//! Only the parts of a kubeconfig that name contexts are read. Files are merged
//! with the usual kubeconfig rules: the first file to set a value wins.
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Errors from loading kubeconfig files
#[derive(Error, Debug)]
pub enum KubeconfigError {
    /// Failed to read a kubeconfig file
    #[error("failed to read kubeconfig from '{1:?}': {0}")]
    ReadConfig(#[source] std::io::Error, PathBuf),

    /// Failed to parse kubeconfig YAML
    #[error("failed to parse kubeconfig YAML: {0}")]
    Parse(#[source] serde_yaml::Error),

    /// The YAML was valid but not a kubeconfig
    #[error("the structure of the parsed kubeconfig is invalid: {0}")]
    InvalidStructure(#[source] serde_yaml::Error),

    /// No kubeconfig path was given and no home directory was found
    #[error("failed to find the path of kubeconfig")]
    FindPath,

    /// Merged documents disagree on `kind`
    #[error("kind mismatch while merging kubeconfigs")]
    KindMismatch,

    /// Merged documents disagree on `apiVersion`
    #[error("apiVersion mismatch while merging kubeconfigs")]
    ApiVersionMismatch,
}

/// The context-related subset of a kubeconfig
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Kubeconfig {
    /// Referencable names to context configs
    #[serde(default, deserialize_with = "deserialize_null_as_default")]
    pub contexts: Vec<NamedContext>,
    /// The name of the context used by default
    #[serde(rename = "current-context")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,
    /// Legacy field from TypeMeta
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Legacy field from TypeMeta
    #[serde(rename = "apiVersion")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

/// A context together with its name
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct NamedContext {
    /// Name of the context
    pub name: String,
    /// The context itself
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

/// Which cluster and user a context combines
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Context {
    /// Name of the cluster
    #[serde(default)]
    pub cluster: String,
    /// Name of the user
    #[serde(default)]
    pub user: Option<String>,
    /// Default namespace for the context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

fn deserialize_null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

impl Kubeconfig {
    /// Read a kubeconfig file, merging every document in it
    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Kubeconfig, KubeconfigError> {
        let data = fs::read_to_string(&path)
            .map_err(|source| KubeconfigError::ReadConfig(source, path.as_ref().into()))?;
        Self::from_yaml(&data)
    }

    /// Parse possibly multi-document YAML into one merged kubeconfig
    pub fn from_yaml(text: &str) -> Result<Kubeconfig, KubeconfigError> {
        kubeconfig_from_yaml(text)?
            .into_iter()
            .try_fold(Kubeconfig::default(), Kubeconfig::merge)
    }

    /// Read and merge several files in order
    pub fn read_all(paths: &[PathBuf]) -> Result<Kubeconfig, KubeconfigError> {
        paths.iter().try_fold(Kubeconfig::default(), |merged, path| {
            Kubeconfig::read_from(path).and_then(|next| merged.merge(next))
        })
    }

    /// Merge `next` into `self`, keeping the first value set for anything present in both
    pub fn merge(mut self, next: Kubeconfig) -> Result<Self, KubeconfigError> {
        if self.kind.is_some() && next.kind.is_some() && self.kind != next.kind {
            return Err(KubeconfigError::KindMismatch);
        }
        if self.api_version.is_some() && next.api_version.is_some() && self.api_version != next.api_version {
            return Err(KubeconfigError::ApiVersionMismatch);
        }

        self.kind = self.kind.or(next.kind);
        self.api_version = self.api_version.or(next.api_version);
        append_new_named(&mut self.contexts, next.contexts, |x| &x.name);
        self.current_context = self.current_context.or(next.current_context);
        Ok(self)
    }

    /// Context names and the current context, sorted by name
    pub fn summary(&self) -> KubeContexts {
        let mut contexts = self
            .contexts
            .iter()
            .map(|named| KubeContext {
                name: named.name.clone(),
            })
            .collect::<Vec<_>>();
        contexts.sort_by(|a, b| a.name.cmp(&b.name));
        KubeContexts {
            contexts,
            current_context: self.current_context.clone().unwrap_or_default(),
        }
    }
}

fn kubeconfig_from_yaml(text: &str) -> Result<Vec<Kubeconfig>, KubeconfigError> {
    let mut documents = vec![];
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(doc).map_err(KubeconfigError::Parse)?;
        let kubeconfig = serde_yaml::from_value(value).map_err(KubeconfigError::InvalidStructure)?;
        documents.push(kubeconfig);
    }
    Ok(documents)
}

fn append_new_named<T, F>(base: &mut Vec<T>, next: Vec<T>, f: F)
where
    F: Fn(&T) -> &String,
{
    let existing = base.iter().map(|x| f(x).clone()).collect::<HashSet<_>>();
    base.extend(next.into_iter().filter(|x| !existing.contains(f(x))));
}

/// Split a `KUBECONFIG` style path list
///
/// Empty entries are dropped and later duplicates are ignored.
pub fn split_path_list(list: &str) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    std::env::split_paths(list)
        .filter(|p| !p.as_os_str().is_empty())
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

/// Returns kubeconfig path from `$HOME/.kube/config`.
pub fn default_kube_path() -> Option<PathBuf> {
    home::home_dir().map(|h| h.join(".kube").join("config"))
}

/// A context as listed to callers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeContext {
    /// Name of the context
    pub name: String,
}

/// The contexts found in a set of kubeconfig files
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeContexts {
    /// Every context, sorted by name
    pub contexts: Vec<KubeContext>,
    /// The file's current context, empty when unset
    pub current_context: String,
}

/// Loads kubeconfig contexts
pub trait Loader: Send + Sync {
    /// Load and merge contexts from files, in order
    fn load_from_file(&self, paths: &[PathBuf]) -> Result<KubeContexts, KubeconfigError>;

    /// Load contexts from kubeconfig YAML
    fn load(&self, content: &str) -> Result<KubeContexts, KubeconfigError>;
}

/// Loads kubeconfig contexts from the file system
#[derive(Clone, Debug, Default)]
pub struct FsLoader;

impl Loader for FsLoader {
    fn load_from_file(&self, paths: &[PathBuf]) -> Result<KubeContexts, KubeconfigError> {
        let mut seen = HashSet::new();
        let chain = paths
            .iter()
            .filter(|p| !p.as_os_str().is_empty() && seen.insert(*p))
            .cloned()
            .collect::<Vec<_>>();
        if chain.is_empty() {
            return Err(KubeconfigError::FindPath);
        }
        Ok(Kubeconfig::read_all(&chain)?.summary())
    }

    fn load(&self, content: &str) -> Result<KubeContexts, KubeconfigError> {
        Ok(Kubeconfig::from_yaml(content)?.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::{split_path_list, FsLoader, KubeContext, Kubeconfig, KubeconfigError, Loader};
    use std::{io::Write, path::PathBuf};

    const FIRST: &str = r#"
apiVersion: v1
kind: Config
current-context: zeta
contexts:
  - name: zeta
    context:
      cluster: prod
      user: admin
  - name: alpha
    context:
      cluster: dev
      user: dev
      namespace: apps
"#;

    const SECOND: &str = r#"
current-context: alpha
contexts:
  - name: alpha
    context:
      cluster: elsewhere
  - name: mid
    context:
      cluster: staging
"#;

    fn file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn names(contexts: &[KubeContext]) -> Vec<&str> {
        contexts.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn first_file_wins_when_merging() {
        let merged = Kubeconfig::from_yaml(FIRST)
            .unwrap()
            .merge(Kubeconfig::from_yaml(SECOND).unwrap())
            .unwrap();
        assert_eq!(merged.current_context.as_deref(), Some("zeta"));
        assert_eq!(merged.contexts.len(), 3);
        let alpha = merged.contexts.iter().find(|c| c.name == "alpha").unwrap();
        assert_eq!(alpha.context.as_ref().unwrap().cluster, "dev");
        assert_eq!(alpha.context.as_ref().unwrap().namespace.as_deref(), Some("apps"));
    }

    #[test]
    fn multi_document_yaml_is_merged() {
        let merged = Kubeconfig::from_yaml(&format!("{FIRST}\n---\n{SECOND}")).unwrap();
        assert_eq!(names(&merged.summary().contexts), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn empty_and_null_documents() {
        assert_eq!(Kubeconfig::from_yaml("").unwrap(), Kubeconfig::default());
        let config = Kubeconfig::from_yaml("contexts: null\n").unwrap();
        assert!(config.contexts.is_empty());
        assert_eq!(config.summary().current_context, "");
    }

    #[test]
    fn mismatched_kinds_fail_to_merge() {
        let err = Kubeconfig::from_yaml("kind: Config\n---\nkind: Other\n").unwrap_err();
        assert!(matches!(err, KubeconfigError::KindMismatch));
        let err = Kubeconfig::from_yaml("apiVersion: v1\n---\napiVersion: v2\n").unwrap_err();
        assert!(matches!(err, KubeconfigError::ApiVersionMismatch));
    }

    #[test]
    fn invalid_documents_are_rejected() {
        assert!(matches!(
            Kubeconfig::from_yaml("contexts: [unclosed"),
            Err(KubeconfigError::Parse(_))
        ));
        assert!(matches!(
            Kubeconfig::from_yaml("contexts: 12\n"),
            Err(KubeconfigError::InvalidStructure(_))
        ));
    }

    #[test]
    fn loads_sorted_contexts_from_files() {
        let first = file(FIRST);
        let second = file(SECOND);
        let paths = vec![
            first.path().to_path_buf(),
            second.path().to_path_buf(),
            first.path().to_path_buf(),
        ];
        let contexts = FsLoader.load_from_file(&paths).unwrap();
        assert_eq!(names(&contexts.contexts), vec!["alpha", "mid", "zeta"]);
        assert_eq!(contexts.current_context, "zeta");

        let contexts = FsLoader.load(SECOND).unwrap();
        assert_eq!(names(&contexts.contexts), vec!["alpha", "mid"]);
        assert_eq!(contexts.current_context, "alpha");
    }

    #[test]
    fn missing_files_are_errors() {
        let err = FsLoader
            .load_from_file(&[PathBuf::from("/definitely/not/a/kubeconfig")])
            .unwrap_err();
        assert!(matches!(err, KubeconfigError::ReadConfig(..)));
        assert!(matches!(FsLoader.load_from_file(&[]), Err(KubeconfigError::FindPath)));
    }

    #[test]
    fn path_lists_are_deduplicated() {
        assert_eq!(split_path_list("/a:/b::/a:/c"), vec![
            PathBuf::from("/a"),
            PathBuf::from("/b"),
            PathBuf::from("/c")
        ]);
        assert!(split_path_list("").is_empty());
    }
}
