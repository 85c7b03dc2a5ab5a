//! The mirrored object representation and the keys used to address it.
use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    gvk::GroupVersionKind,
    labels::Selector,
    metadata::{ObjectMeta, TypeMeta},
};

/// A dynamic representation of a cluster object
///
/// Everything outside of `apiVersion`, `kind`, and `metadata` is kept verbatim in `data`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CacheObject {
    /// The type fields, not always present
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// All other keys
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl CacheObject {
    /// Create a `CacheObject` with minimal values set for a kind
    #[must_use]
    pub fn new(name: &str, gvk: &GroupVersionKind) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: gvk.api_version(),
                kind: gvk.kind.clone(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: serde_json::Value::Object(Default::default()),
        }
    }

    /// Attach dynamic data
    #[must_use]
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a namespace
    #[must_use]
    pub fn within(mut self, ns: &str) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }

    /// Attach a resource version
    #[must_use]
    pub fn with_resource_version(mut self, rv: &str) -> Self {
        self.metadata.resource_version = Some(rv.into());
        self
    }

    /// Attach a label
    #[must_use]
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// The name of the object, empty when the source omitted it
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// The namespace of the object
    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    /// The last seen resource version
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    /// Labels of the object, empty when unset
    pub fn labels(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.metadata.labels.as_ref().unwrap_or(&EMPTY)
    }

    /// The kind of the object, if its type fields were sent
    pub fn gvk(&self) -> Option<GroupVersionKind> {
        let types = self.types.as_ref()?;
        GroupVersionKind::from_api_version(&types.api_version, &types.kind).ok()
    }
}

/// A list of objects together with the version to resume watching from
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ObjectList {
    /// List metadata
    #[serde(default)]
    pub metadata: crate::metadata::ListMeta,
    /// The listed objects
    #[serde(default)]
    pub items: Vec<CacheObject>,
}

/// Identifies a single cached object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Kind of the object
    pub gvk: GroupVersionKind,
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Name of the object
    pub name: String,
}

impl ObjectKey {
    /// Key for a cluster-scoped object
    pub fn new(gvk: GroupVersionKind, name: &str) -> Self {
        Self {
            gvk,
            namespace: None,
            name: name.into(),
        }
    }

    /// Scope the key to a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}.{}/{}", self.gvk.kind, self.gvk.version, ns, self.name),
            None => write!(f, "{}.{}/{}", self.gvk.kind, self.gvk.version, self.name),
        }
    }
}

/// Selects a subset of the cached objects of one kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListSelector {
    /// Kind to list
    pub gvk: GroupVersionKind,
    /// Restrict to a namespace, `None` lists across all namespaces
    pub namespace: Option<String>,
    /// Label selector, empty selects everything
    pub labels: Selector,
}

impl ListSelector {
    /// Select every object of a kind
    pub fn all(gvk: GroupVersionKind) -> Self {
        Self {
            gvk,
            namespace: None,
            labels: Selector::default(),
        }
    }

    /// Restrict to a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Restrict by labels
    #[must_use]
    pub fn labels(mut self, labels: Selector) -> Self {
        self.labels = labels;
        self
    }

    /// Whether an object of the selected kind is selected
    pub fn matches(&self, obj: &CacheObject) -> bool {
        let ns_ok = match &self.namespace {
            Some(ns) => obj.namespace() == Some(ns.as_str()),
            None => true,
        };
        ns_ok && self.labels.matches(obj.labels())
    }
}

/// Filters a subscription down to one kind and optionally one namespace
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KindFilter {
    /// Kind to subscribe to
    pub gvk: GroupVersionKind,
    /// Restrict to a namespace
    pub namespace: Option<String>,
}

impl KindFilter {
    /// Subscribe to every object of a kind
    pub fn new(gvk: GroupVersionKind) -> Self {
        Self { gvk, namespace: None }
    }

    /// Restrict to a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Whether an object of the filtered kind passes the filter
    pub fn matches(&self, obj: &CacheObject) -> bool {
        match &self.namespace {
            Some(ns) => obj.namespace() == Some(ns.as_str()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheObject, ListSelector};
    use crate::{gvk::GroupVersionKind, labels::Selector};

    #[test]
    fn deserializes_dynamic_body() {
        let obj: CacheObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "p1", "namespace": "default", "resourceVersion": "12" },
            "spec": { "containers": [{ "name": "c1" }] }
        }))
        .unwrap();
        assert_eq!(obj.name(), "p1");
        assert_eq!(obj.namespace(), Some("default"));
        assert_eq!(obj.resource_version(), Some("12"));
        assert_eq!(obj.gvk(), Some(GroupVersionKind::gvk("", "v1", "Pod")));
        assert_eq!(obj.data["spec"]["containers"][0]["name"], "c1");
    }

    #[test]
    fn list_selector_filters_namespace_and_labels() {
        let pod = GroupVersionKind::gvk("", "v1", "Pod");
        let a = CacheObject::new("a", &pod).within("default").with_label("app", "web");
        let b = CacheObject::new("b", &pod).within("kube-system").with_label("app", "web");
        let c = CacheObject::new("c", &pod).within("default");

        let selector = ListSelector::all(pod)
            .within("default")
            .labels(Selector::parse("app=web").unwrap());
        assert!(selector.matches(&a));
        assert!(!selector.matches(&b));
        assert!(!selector.matches(&c));
    }
}
