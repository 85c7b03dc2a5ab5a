//! Watches one kind of cluster object for changes, with error recovery

use std::{fmt::Debug, sync::Arc};

use educe::Educe;
use futures::{Stream, StreamExt};
use overlook_core::{
    client::{ObjectSource, WatchStream},
    CacheObject, ErrorResponse, GroupVersionKind, WatchEvent,
};
use thiserror::Error;

/// Failures of a [`watcher()`], by the phase they happened in
#[derive(Error, Debug)]
pub enum Error {
    /// The list that starts every watch cycle failed
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] overlook_core::Error),
    /// The watch call itself failed
    #[error("failed to start watching object: {0}")]
    WatchStartFailed(#[source] overlook_core::Error),
    /// The source sent an error event
    #[error("error returned by apiserver during watch: {0}")]
    WatchError(#[source] ErrorResponse),
    /// The watch stream broke
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] overlook_core::Error),
}
#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq)]
/// Watch events returned from the [`watcher`]
pub enum Event<K> {
    /// An object was added or modified
    Applied(K),
    /// An object was deleted
    Deleted(K),
    /// The watch stream was restarted, so `Deleted` events may have been missed
    ///
    /// Should be used as a signal to replace the store contents atomically.
    ///
    /// Any objects that were previously [`Applied`](Event::Applied) but are not listed in this event
    /// should be assumed to have been [`Deleted`](Event::Deleted).
    Restarted(Vec<K>),
}

#[derive(Educe)]
#[educe(Debug)]
/// The internal finite state machine driving the [`watcher`]
enum State {
    /// The Watcher is empty, and the next [`poll`](Stream::poll_next) will start the initial LIST to get all existing objects
    Empty,
    /// The initial LIST was successful, so we should move on to starting the actual watch.
    InitListed { resource_version: String },
    /// The watch is in progress, from this point we just return events from the server.
    ///
    /// If the connection is disrupted then we propagate the error but try to restart the watch stream by
    /// returning to the `InitListed` state.
    /// If we fall out of the watch window then we propagate the error and fall back doing a re-list
    /// with `Empty`.
    Watching {
        resource_version: String,
        #[educe(Debug(ignore))]
        stream: WatchStream,
    },
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None`
/// then the function should be called again until it returns a Some.
async fn step_trampolined(
    source: &dyn ObjectSource,
    gvk: &GroupVersionKind,
    state: State,
) -> (Option<Result<Event<CacheObject>>>, State) {
    match state {
        State::Empty => match source.list(gvk).await {
            Ok(list) => {
                let resource_version = list.metadata.resource_version.unwrap_or_default();
                (Some(Ok(Event::Restarted(list.items))), State::InitListed {
                    resource_version,
                })
            }
            Err(err) => (Some(Err(Error::InitialListFailed(err))), State::Empty),
        },
        State::InitListed { resource_version } => match source.watch(gvk, &resource_version).await {
            Ok(stream) => (None, State::Watching {
                resource_version,
                stream,
            }),
            Err(err) => (Some(Err(Error::WatchStartFailed(err))), State::InitListed {
                resource_version,
            }),
        },
        State::Watching {
            resource_version,
            mut stream,
        } => match stream.next().await {
            Some(Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj))) => {
                let resource_version = obj
                    .resource_version()
                    .map(str::to_owned)
                    .unwrap_or(resource_version);
                (Some(Ok(Event::Applied(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Deleted(obj))) => {
                let resource_version = obj
                    .resource_version()
                    .map(str::to_owned)
                    .unwrap_or(resource_version);
                (Some(Ok(Event::Deleted(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Bookmark(bm))) => (None, State::Watching {
                resource_version: bm.metadata.resource_version,
                stream,
            }),
            Some(Ok(WatchEvent::Error(err))) => {
                // HTTP GONE, means we have desynced and need to start over and re-list :(
                let new_state = if err.is_gone() {
                    State::Empty
                } else {
                    State::Watching {
                        resource_version,
                        stream,
                    }
                };
                (Some(Err(Error::WatchError(err))), new_state)
            }
            Some(Err(err)) => (Some(Err(Error::WatchFailed(err))), State::InitListed {
                resource_version,
            }),
            None => (None, State::InitListed { resource_version }),
        },
    }
}

/// Trampoline helper for `step_trampolined`
async fn step(source: &dyn ObjectSource, gvk: &GroupVersionKind, mut state: State) -> (Result<Event<CacheObject>>, State) {
    loop {
        match step_trampolined(source, gvk, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches one kind continuously
///
/// Compared to [`ObjectSource::watch`], this automatically tries to recover the stream upon errors.
///
/// Errors from the underlying watch are propagated, after which the stream will go into recovery mode on the next poll.
/// Wait with [`wait_before_retry`](crate::utils::wait_before_retry) between errors to avoid hammering an
/// unavailable cluster.
///
/// # Recovery
///
/// If the watch connection is interrupted then we attempt to restart the watch using the last
/// resource version seen on the stream. If this is successful then the stream is simply resumed from where it left off.
/// If this fails because the resource version is no longer valid then we start over with a new list, emitting an
/// [`Event::Restarted`].
pub fn watcher(
    source: Arc<dyn ObjectSource>,
    gvk: GroupVersionKind,
) -> impl Stream<Item = Result<Event<CacheObject>>> + Send {
    futures::stream::unfold((source, gvk, State::Empty), |(source, gvk, state)| async move {
        let (event, state) = step(source.as_ref(), &gvk, state).await;
        Some((event, (source, gvk, state)))
    })
}
