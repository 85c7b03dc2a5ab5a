//! Describers for the static overview paths and for custom resources
use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use overlook_core::{CacheObject, Error, GroupVersionKind, ListSelector, ObjectKey};
use overlook_runtime::KindRoutes;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::warn;

use super::generator::{into_describer, ContentResponse, Describer, DescriberContext};

/// Kinds counted on the overview root
pub(crate) fn overview_kinds() -> Vec<GroupVersionKind> {
    vec![
        pod_gvk(),
        GroupVersionKind::gvk("", "v1", "Service"),
        GroupVersionKind::gvk("apps", "v1", "Deployment"),
        GroupVersionKind::gvk("", "v1", "ConfigMap"),
        GroupVersionKind::gvk("", "v1", "Secret"),
    ]
}

pub(crate) fn pod_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Pod")
}

pub(crate) fn event_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Event")
}

/// The kind whose objects define custom resources
pub fn crd_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("apiextensions.k8s.io", "v1", "CustomResourceDefinition")
}

fn selector_for(ctx: &DescriberContext, gvk: GroupVersionKind) -> ListSelector {
    ListSelector::all(gvk)
        .within(&ctx.namespace)
        .labels(ctx.selector.clone())
}

fn summary(obj: &CacheObject) -> Value {
    json!({
        "name": obj.name(),
        "namespace": obj.namespace(),
        "labels": obj.labels(),
        "creationTimestamp": obj.metadata.creation_timestamp,
    })
}

fn to_value(obj: &CacheObject) -> Result<Value, Error> {
    serde_json::to_value(obj).map_err(|err| Error::Internal(format!("unable to encode {}: {err}", obj.name())))
}

/// Object counts per well-known kind
pub(crate) struct RootDescriber;

#[async_trait]
impl Describer for RootDescriber {
    async fn describe(&self, ctx: &DescriberContext) -> Result<ContentResponse, Error> {
        let mut counts = serde_json::Map::new();
        for gvk in overview_kinds() {
            let objs = ctx.cache.list(&selector_for(ctx, gvk.clone())).await;
            counts.insert(gvk.kind, objs.len().into());
        }
        Ok(ContentResponse::new(
            "Overview",
            json!({ "namespace": ctx.namespace, "counts": counts }),
        ))
    }
}

/// Pods of the namespace
pub(crate) struct PodListDescriber;

#[async_trait]
impl Describer for PodListDescriber {
    async fn describe(&self, ctx: &DescriberContext) -> Result<ContentResponse, Error> {
        let pods = ctx
            .cache
            .list(&selector_for(ctx, pod_gvk()))
            .await
            .iter()
            .map(|pod| {
                let mut item = summary(pod);
                item["phase"] = pod.data["status"]["phase"].clone();
                item
            })
            .collect::<Vec<_>>();
        Ok(ContentResponse::new("Pods", json!({ "pods": pods })))
    }
}

/// One pod, by the `name` parameter
pub(crate) struct PodDescriber;

#[async_trait]
impl Describer for PodDescriber {
    async fn describe(&self, ctx: &DescriberContext) -> Result<ContentResponse, Error> {
        let name = ctx.param("name")?;
        let key = ObjectKey::new(pod_gvk(), name).within(&ctx.namespace);
        let pod = ctx
            .cache
            .get(&key)
            .await
            .ok_or_else(|| Error::NotFound(format!("pod {}/{name}", ctx.namespace)))?;
        Ok(ContentResponse::new(format!("Pods / {name}"), to_value(&pod)?))
    }
}

/// Events of the namespace
pub(crate) struct EventsDescriber;

#[async_trait]
impl Describer for EventsDescriber {
    async fn describe(&self, ctx: &DescriberContext) -> Result<ContentResponse, Error> {
        let events = ctx
            .cache
            .list(&selector_for(ctx, event_gvk()))
            .await
            .iter()
            .map(|event| {
                json!({
                    "name": event.name(),
                    "type": event.data["type"],
                    "reason": event.data["reason"],
                    "message": event.data["message"],
                    "involvedObject": event.data["involvedObject"],
                    "lastTimestamp": event.data["lastTimestamp"],
                })
            })
            .collect::<Vec<_>>();
        Ok(ContentResponse::new("Events", json!({ "events": events })))
    }
}

/// The custom resource section, listing the definitions currently known
#[derive(Default)]
pub struct CrdSection {
    names: RwLock<BTreeSet<String>>,
}

impl CrdSection {
    /// Definition names in order
    pub fn names(&self) -> Vec<String> {
        self.names.read().iter().cloned().collect()
    }

    fn add(&self, name: &str) {
        self.names.write().insert(name.to_string());
    }

    fn remove(&self, name: &str) {
        self.names.write().remove(name);
    }
}

#[async_trait]
impl Describer for CrdSection {
    async fn describe(&self, _ctx: &DescriberContext) -> Result<ContentResponse, Error> {
        Ok(ContentResponse::new(
            "Custom Resources",
            json!({ "customResourceDefinitions": self.names() }),
        ))
    }
}

/// What a definition says about the custom resources it defines
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CustomResource {
    pub(crate) gvk: GroupVersionKind,
    pub(crate) namespaced: bool,
}

impl CustomResource {
    /// Read group, kind, scope, and version from a definition
    ///
    /// The storage version is preferred, then the first served one, then the first listed one.
    pub(crate) fn from_definition(crd: &CacheObject) -> Option<Self> {
        let spec = &crd.data["spec"];
        let group = spec["group"].as_str()?;
        let kind = spec["names"]["kind"].as_str()?;
        let versions = spec["versions"].as_array().map(Vec::as_slice).unwrap_or_default();
        let flagged = |flag: &str| {
            versions
                .iter()
                .find(|v| v[flag].as_bool() == Some(true))
                .and_then(|v| v["name"].as_str())
        };
        let version = flagged("storage")
            .or_else(|| flagged("served"))
            .or_else(|| versions.first().and_then(|v| v["name"].as_str()))
            .or_else(|| spec["version"].as_str())?;
        Some(Self {
            gvk: GroupVersionKind::gvk(group, version, kind),
            namespaced: spec["scope"].as_str() != Some("Cluster"),
        })
    }

    fn selector(&self, ctx: &DescriberContext) -> ListSelector {
        let selector = ListSelector::all(self.gvk.clone()).labels(ctx.selector.clone());
        if self.namespaced {
            selector.within(&ctx.namespace)
        } else {
            selector
        }
    }

    fn key(&self, ctx: &DescriberContext, name: &str) -> ObjectKey {
        let key = ObjectKey::new(self.gvk.clone(), name);
        if self.namespaced {
            key.within(&ctx.namespace)
        } else {
            key
        }
    }
}

/// Objects of one custom resource
pub(crate) struct CustomResourceListDescriber {
    crd: String,
    resource: CustomResource,
}

#[async_trait]
impl Describer for CustomResourceListDescriber {
    async fn describe(&self, ctx: &DescriberContext) -> Result<ContentResponse, Error> {
        let items = ctx
            .cache
            .list(&self.resource.selector(ctx))
            .await
            .iter()
            .map(|obj| summary(obj))
            .collect::<Vec<_>>();
        Ok(ContentResponse::new(
            format!("Custom Resources / {}", self.crd),
            json!({
                "apiVersion": self.resource.gvk.api_version(),
                "kind": self.resource.gvk.kind,
                "items": items,
            }),
        ))
    }
}

/// One object of a custom resource, by the `name` parameter
pub(crate) struct CustomResourceDescriber {
    crd: String,
    resource: CustomResource,
}

#[async_trait]
impl Describer for CustomResourceDescriber {
    async fn describe(&self, ctx: &DescriberContext) -> Result<ContentResponse, Error> {
        let name = ctx.param("name")?;
        let obj = ctx
            .cache
            .get(&self.resource.key(ctx, name))
            .await
            .ok_or_else(|| Error::NotFound(format!("{} {name}", self.resource.gvk.kind)))?;
        Ok(ContentResponse::new(
            format!("Custom Resources / {} / {name}", self.crd),
            to_value(&obj)?,
        ))
    }
}

/// Paths contributed by each custom resource definition
#[derive(Clone)]
pub struct CrdRoutes {
    section: Arc<CrdSection>,
}

impl CrdRoutes {
    /// Routes that keep `section` in step with what is registered
    pub fn new(section: Arc<CrdSection>) -> Self {
        Self { section }
    }
}

impl KindRoutes<dyn Describer> for CrdRoutes {
    fn routes(&self, name: &str, obj: &CacheObject) -> Vec<(String, Arc<dyn Describer>)> {
        let Some(resource) = CustomResource::from_definition(obj) else {
            warn!(name, "definition has no group, kind, or version; listing it without content");
            return vec![];
        };
        vec![
            (
                format!("/overview/crd/{name}"),
                into_describer(CustomResourceListDescriber {
                    crd: name.to_string(),
                    resource: resource.clone(),
                }),
            ),
            (
                format!("/overview/crd/{name}/{{name}}"),
                into_describer(CustomResourceDescriber {
                    crd: name.to_string(),
                    resource,
                }),
            ),
        ]
    }

    fn added(&self, name: &str, _obj: &CacheObject) {
        self.section.add(name);
    }

    fn removed(&self, name: &str) {
        self.section.remove(name);
    }
}
