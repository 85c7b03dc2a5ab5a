//! Types for the raw watch protocol spoken by an [`ObjectSource`](crate::client::ObjectSource)
use crate::{error::ErrorResponse, metadata::TypeMeta};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A raw event returned from a watch query
///
/// Note that a watch query returns many of these as newline separated JSON.
#[derive(Deserialize, Serialize, Clone)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<K> {
    /// Resource was added
    Added(K),
    /// Resource was modified
    Modified(K),
    /// Resource was deleted
    Deleted(K),
    /// Resource bookmark, only carries a resource version.
    Bookmark(Bookmark),
    /// There was some kind of error
    Error(ErrorResponse),
}

impl<K> Debug for WatchEvent<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            WatchEvent::Added(_) => write!(f, "Added event"),
            WatchEvent::Modified(_) => write!(f, "Modified event"),
            WatchEvent::Deleted(_) => write!(f, "Deleted event"),
            WatchEvent::Bookmark(_) => write!(f, "Bookmark event"),
            WatchEvent::Error(e) => write!(f, "Error event: {:?}", e),
        }
    }
}

/// Slimmed down object for [`WatchEvent::Bookmark`].
///
/// Can only be relied upon to have metadata with resource version.
#[derive(Serialize, Deserialize, Clone)]
pub struct Bookmark {
    /// apiVersion + kind
    #[serde(flatten)]
    pub types: TypeMeta,

    /// Basically empty metadata
    pub metadata: BookmarkMeta,
}

/// Slimmed down metadata for [`WatchEvent::Bookmark`]
#[derive(Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkMeta {
    /// The only field we need from a Bookmark event.
    pub resource_version: String,
}

#[cfg(test)]
mod tests {
    use super::WatchEvent;
    use crate::CacheObject;

    #[test]
    fn decodes_tagged_events() {
        let line = r#"{"type":"DELETED","object":{"apiVersion":"v1","kind":"Pod","metadata":{"name":"p1"}}}"#;
        let ev: WatchEvent<CacheObject> = serde_json::from_str(line).unwrap();
        assert!(matches!(ev, WatchEvent::Deleted(ref o) if o.name() == "p1"));

        let gone = r#"{"type":"ERROR","object":{"status":"Failure","message":"too old","reason":"Expired","code":410}}"#;
        let ev: WatchEvent<CacheObject> = serde_json::from_str(gone).unwrap();
        assert!(matches!(ev, WatchEvent::Error(ref e) if e.code == 410));
    }
}
