use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use overlook_core::{Error, Selector};
use overlook_runtime::{Cache, PathMatcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Options for a single content request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContentOptions {
    /// Restrict listed objects by label, empty selects everything
    pub selector: Selector,
}

/// Content produced for a path
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentResponse {
    /// Title of the content
    pub title: String,
    /// The content itself, shaped by the describer that produced it
    pub body: serde_json::Value,
}

impl ContentResponse {
    /// Content with a title and a body
    pub fn new(title: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            title: title.into(),
            body,
        }
    }
}

/// Everything a describer gets to work with
#[derive(Clone)]
pub struct DescriberContext {
    /// The cache objects are read from
    pub cache: Cache,
    /// Namespace the content is for
    pub namespace: String,
    /// Label selector from the request
    pub selector: Selector,
    /// Parameters captured by the matched pattern
    pub params: BTreeMap<String, String>,
    /// The requested path
    pub path: String,
}

impl DescriberContext {
    /// A captured path parameter
    pub fn param(&self, name: &str) -> Result<&str, Error> {
        self.params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::Internal(format!("pattern for {} has no {{{name}}} parameter", self.path)))
    }
}

/// Produces content for the paths it is registered under
#[async_trait]
pub trait Describer: Send + Sync {
    /// Describe whatever the request in `ctx` points at
    async fn describe(&self, ctx: &DescriberContext) -> Result<ContentResponse, Error>;
}

/// Resolves content paths through a [`PathMatcher`] and runs the matched describer
#[derive(Clone)]
pub struct Generator {
    cache: Cache,
    matcher: PathMatcher<dyn Describer>,
}

impl Generator {
    /// A generator over `matcher` reading from `cache`
    pub fn new(cache: Cache, matcher: PathMatcher<dyn Describer>) -> Self {
        Self { cache, matcher }
    }

    /// Generate the content for `path`
    ///
    /// Paths without a registered describer are reported as [`Error::NotFound`].
    #[instrument(skip(self, options), fields(selector = %options.selector.to_selector_string()))]
    pub async fn generate(
        &self,
        path: &str,
        namespace: &str,
        options: &ContentOptions,
    ) -> Result<ContentResponse, Error> {
        let Some(found) = self.matcher.find(path) else {
            debug!("no describer registered");
            return Err(Error::NotFound(format!("content for {path}")));
        };
        debug!(pattern = %found.pattern, "matched describer");
        let ctx = DescriberContext {
            cache: self.cache.clone(),
            namespace: namespace.to_string(),
            selector: options.selector.clone(),
            params: found.params,
            path: path.to_string(),
        };
        found.handler.describe(&ctx).await
    }

    /// The matcher content paths are resolved through
    pub fn matcher(&self) -> &PathMatcher<dyn Describer> {
        &self.matcher
    }
}

/// Shorthand for registering a describer
pub(crate) fn into_describer<D: Describer + 'static>(describer: D) -> Arc<dyn Describer> {
    Arc::new(describer)
}

#[cfg(test)]
mod tests {
    use super::{ContentOptions, ContentResponse, Describer, DescriberContext, Generator};
    use async_trait::async_trait;
    use overlook_core::Error;
    use overlook_runtime::{cache::Config, test_utils::FakeSource, Cache, PathMatcher};
    use serde_json::json;
    use std::sync::Arc;

    struct Echo;

    #[async_trait]
    impl Describer for Echo {
        async fn describe(&self, ctx: &DescriberContext) -> Result<ContentResponse, Error> {
            Ok(ContentResponse::new(
                ctx.param("name")?,
                json!({ "namespace": ctx.namespace, "selector": ctx.selector.to_selector_string() }),
            ))
        }
    }

    #[tokio::test]
    async fn runs_matched_describer_with_params() {
        let cache = Cache::new(Arc::new(FakeSource::default()), Config::default());
        let matcher = PathMatcher::<dyn Describer>::new();
        matcher.register("/overview/pod/{name}", Arc::new(Echo)).unwrap();
        let generator = Generator::new(cache.clone(), matcher);

        let options = ContentOptions {
            selector: "app=web".parse().unwrap(),
        };
        let content = generator.generate("/overview/pod/p1", "apps", &options).await.unwrap();
        assert_eq!(content.title, "p1");
        assert_eq!(content.body, json!({ "namespace": "apps", "selector": "app=web" }));

        let err = generator
            .generate("/overview/nothing", "apps", &ContentOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        cache.shutdown().await;
    }
}
