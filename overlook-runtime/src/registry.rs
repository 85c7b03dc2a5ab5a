//! An ordered, runtime-mutable table of path patterns
//!
//! Lookups scan registrations in the order they were added and return the first match, so
//! anything registered at startup outranks what is added later on.
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

/// Rejected registrations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The pattern cannot be parsed
    #[error("invalid path pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The offending pattern
        pattern: String,
        /// What is wrong with it
        reason: &'static str,
    },

    /// The exact pattern is registered already
    #[error("path pattern {0:?} is already registered")]
    Duplicate(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed path pattern
///
/// Patterns are absolute paths whose segments are either literals or `{name}` placeholders
/// matching exactly one non-empty segment. A final `*` segment matches any remainder,
/// including none at all: `/overview/*` matches `/overview` and `/overview/a/b`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
    wildcard: bool,
}

fn split_path(path: &str) -> Vec<&str> {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    }
}

impl FromStr for PathPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = |reason| Error::InvalidPattern {
            pattern: s.to_string(),
            reason,
        };
        if s.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if !s.starts_with('/') {
            return Err(invalid("pattern must start with '/'"));
        }

        let parts = split_path(s);
        let mut segments = Vec::with_capacity(parts.len());
        let mut wildcard = false;
        for (i, part) in parts.iter().enumerate() {
            if *part == "*" {
                if i + 1 != parts.len() {
                    return Err(invalid("'*' is only allowed as the last segment"));
                }
                wildcard = true;
            } else if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                    return Err(invalid("placeholder names must be non-empty alphanumerics"));
                }
                if segments.contains(&Segment::Param(name.to_string())) {
                    return Err(invalid("placeholder names must be unique"));
                }
                segments.push(Segment::Param(name.to_string()));
            } else if part.is_empty() {
                return Err(invalid("empty path segment"));
            } else if part.contains(['{', '}', '*']) {
                return Err(invalid("'{', '}' and '*' must span a whole segment"));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        let mut raw = String::from("/");
        raw.push_str(&parts.join("/"));
        Ok(Self { raw, segments, wildcard })
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PathPattern {
    /// The normalized pattern string
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match `path`, returning the captured placeholders
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let parts = split_path(path);
        if parts.len() < self.segments.len() || (!self.wildcard && parts.len() != self.segments.len()) {
            return None;
        }
        let mut params = BTreeMap::new();
        for (segment, part) in self.segments.iter().zip(&parts) {
            match segment {
                Segment::Literal(lit) if lit.as_str() == *part => {}
                Segment::Param(name) if !part.is_empty() => {
                    params.insert(name.clone(), (*part).to_string());
                }
                _ => return None,
            }
        }
        Some(params)
    }
}

/// Identifies a single registration, for [`PathMatcher::deregister`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegistrationKey(u64);

/// The result of a successful [`PathMatcher::find`]
pub struct Match<H: ?Sized> {
    /// The handler registered for the pattern
    pub handler: Arc<H>,
    /// The pattern that matched
    pub pattern: PathPattern,
    /// Values captured by `{name}` placeholders
    pub params: BTreeMap<String, String>,
}

impl<H: ?Sized> fmt::Debug for Match<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Match")
            .field("pattern", &self.pattern)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

struct Registration<H: ?Sized> {
    key: RegistrationKey,
    owner: Option<String>,
    pattern: PathPattern,
    handler: Arc<H>,
}

struct Registrations<H: ?Sized> {
    next_key: u64,
    entries: Vec<Registration<H>>,
}

impl<H: ?Sized> Registrations<H> {
    fn push(&mut self, owner: Option<&str>, pattern: PathPattern, handler: Arc<H>) -> Result<RegistrationKey, Error> {
        if self.entries.iter().any(|e| e.pattern == pattern) {
            warn!(%pattern, owner, "dropping duplicate path registration");
            return Err(Error::Duplicate(pattern.raw));
        }
        self.next_key += 1;
        let key = RegistrationKey(self.next_key);
        debug!(%pattern, owner, "registered path");
        self.entries.push(Registration {
            key,
            owner: owner.map(str::to_owned),
            pattern,
            handler,
        });
        Ok(key)
    }
}

/// A shared, ordered table of path patterns and their handlers
///
/// Cloning will produce a new handle to the same table. Every operation takes one short
/// critical section, so a lookup racing a mutation sees the table either before or after it.
pub struct PathMatcher<H: ?Sized> {
    inner: Arc<RwLock<Registrations<H>>>,
}

impl<H: ?Sized> Clone for PathMatcher<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: ?Sized> Default for PathMatcher<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Registrations {
                next_key: 0,
                entries: Vec::new(),
            })),
        }
    }
}

impl<H: ?Sized> fmt::Debug for PathMatcher<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathMatcher")
            .field("patterns", &self.patterns())
            .finish()
    }
}

impl<H: ?Sized> PathMatcher<H> {
    /// An empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single pattern
    ///
    /// Fails if the pattern is malformed or already registered.
    pub fn register(&self, pattern: &str, handler: Arc<H>) -> Result<RegistrationKey, Error> {
        let pattern = pattern.parse::<PathPattern>()?;
        self.inner.write().push(None, pattern, handler)
    }

    /// Remove a single registration, returning whether it existed
    pub fn deregister(&self, key: RegistrationKey) -> bool {
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.key != key);
        inner.entries.len() != before
    }

    /// Replace every registration made on behalf of `name`
    ///
    /// All patterns are validated before anything changes. Patterns already registered by
    /// someone else are logged and skipped. Returns the keys of what was registered.
    pub fn register_for(&self, name: &str, routes: Vec<(String, Arc<H>)>) -> Result<Vec<RegistrationKey>, Error> {
        let routes = routes
            .into_iter()
            .map(|(pattern, handler)| Ok((pattern.parse::<PathPattern>()?, handler)))
            .collect::<Result<Vec<_>, Error>>()?;

        let mut inner = self.inner.write();
        inner.entries.retain(|e| e.owner.as_deref() != Some(name));
        Ok(routes
            .into_iter()
            .filter_map(|(pattern, handler)| inner.push(Some(name), pattern, handler).ok())
            .collect())
    }

    /// Remove every registration made on behalf of `name`, returning how many there were
    pub fn deregister_for(&self, name: &str) -> usize {
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.owner.as_deref() != Some(name));
        let removed = before - inner.entries.len();
        debug!(name, removed, "deregistered paths");
        removed
    }

    /// Whether anything is registered on behalf of `name`
    pub fn contains_owner(&self, name: &str) -> bool {
        self.inner.read().entries.iter().any(|e| e.owner.as_deref() == Some(name))
    }

    /// Find the first registration matching `path`
    pub fn find(&self, path: &str) -> Option<Match<H>> {
        let inner = self.inner.read();
        inner.entries.iter().find_map(|e| {
            e.pattern.matches(path).map(|params| Match {
                handler: e.handler.clone(),
                pattern: e.pattern.clone(),
                params,
            })
        })
    }

    /// Registered patterns in lookup order
    pub fn patterns(&self) -> Vec<String> {
        self.inner.read().entries.iter().map(|e| e.pattern.raw.clone()).collect()
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, PathMatcher, PathPattern};
    use std::sync::Arc;

    fn matcher() -> PathMatcher<str> {
        PathMatcher::new()
    }

    fn handler(name: &str) -> Arc<str> {
        Arc::from(name)
    }

    #[test]
    fn parses_and_normalizes_patterns() {
        let p: PathPattern = "/overview/pod/{name}/".parse().unwrap();
        assert_eq!(p.as_str(), "/overview/pod/{name}");
        assert_eq!("/".parse::<PathPattern>().unwrap().as_str(), "/");
        for bad in [
            "",
            "overview",
            "/overview/*/pods",
            "/overview/x*",
            "/overview/{}",
            "/overview/{name",
            "/overview/{a}/{a}",
            "/overview//pods",
        ] {
            assert!(
                matches!(bad.parse::<PathPattern>(), Err(Error::InvalidPattern { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn matches_literals_params_and_wildcards() {
        let p: PathPattern = "/overview/pod/{name}".parse().unwrap();
        let params = p.matches("/overview/pod/p1").unwrap();
        assert_eq!(params.get("name").map(String::as_str), Some("p1"));
        assert!(p.matches("/overview/pod").is_none());
        assert!(p.matches("/overview/pod/p1/logs").is_none());

        let w: PathPattern = "/overview/*".parse().unwrap();
        assert!(w.matches("/overview").is_some());
        assert!(w.matches("/overview/a/b/c").is_some());
        assert!(w.matches("/other").is_none());
    }

    #[test]
    fn first_registration_wins() {
        let m = matcher();
        m.register("/overview/crd/{crd}", handler("static")).unwrap();
        m.register("/overview/crd/widgets", handler("dynamic")).unwrap();
        let found = m.find("/overview/crd/widgets").unwrap();
        assert_eq!(&*found.handler, "static");
    }

    #[test]
    fn duplicates_are_rejected() {
        let m = matcher();
        m.register("/overview/pods", handler("a")).unwrap();
        assert_eq!(
            m.register("/overview/pods/", handler("b")).unwrap_err(),
            Error::Duplicate("/overview/pods".into())
        );
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn deregister_removes_exactly_one_registration() {
        let m = matcher();
        let a = m.register("/a", handler("a")).unwrap();
        m.register("/b", handler("b")).unwrap();
        assert!(m.deregister(a));
        assert!(!m.deregister(a));
        assert!(m.find("/a").is_none());
        assert!(m.find("/b").is_some());
    }

    #[test]
    fn owner_registrations_are_replaced_atomically() {
        let m = matcher();
        m.register("/overview", handler("root")).unwrap();
        m.register_for("widgets", vec![
            ("/overview/crd/widgets".into(), handler("list")),
            ("/overview/crd/widgets/{name}".into(), handler("detail")),
        ])
        .unwrap();
        assert!(m.contains_owner("widgets"));
        assert_eq!(&*m.find("/overview/crd/widgets/w1").unwrap().handler, "detail");

        // an invalid route leaves the previous registrations untouched
        assert!(m
            .register_for("widgets", vec![("no-slash".into(), handler("bad"))])
            .is_err());
        assert_eq!(m.len(), 3);

        m.register_for("widgets", vec![("/overview/crd/widgets".into(), handler("list2"))])
            .unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(&*m.find("/overview/crd/widgets").unwrap().handler, "list2");

        assert_eq!(m.deregister_for("widgets"), 1);
        assert_eq!(m.deregister_for("widgets"), 0);
        assert!(m.find("/overview/crd/widgets").is_none());
        assert_eq!(m.patterns(), vec!["/overview".to_string()]);
    }

    #[test]
    fn static_duplicate_of_owned_pattern_is_skipped() {
        let m = matcher();
        m.register("/overview/crd/widgets", handler("static")).unwrap();
        let keys = m
            .register_for("widgets", vec![("/overview/crd/widgets".into(), handler("dynamic"))])
            .unwrap();
        assert!(keys.is_empty());
        assert_eq!(m.deregister_for("widgets"), 0);
        assert_eq!(&*m.find("/overview/crd/widgets").unwrap().handler, "static");
    }

    #[test]
    fn lookups_race_mutations_without_tearing() {
        let m = matcher();
        m.register("/static", handler("static")).unwrap();
        let writer = {
            let m = m.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    m.register_for("dyn", vec![(format!("/dyn/{i}/{{id}}"), handler("dyn"))])
                        .unwrap();
                    m.deregister_for("dyn");
                }
            })
        };
        for _ in 0..500 {
            assert!(m.find("/static").is_some());
            if let Some(found) = m.find("/dyn/7/x") {
                assert_eq!(&*found.handler, "dyn");
            }
        }
        writer.join().unwrap();
        assert_eq!(m.len(), 1);
    }
}
