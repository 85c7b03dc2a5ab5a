//! Retry delays for watch streams

mod backoff_resettable;

pub use backoff_resettable::{ResettableBackoff, ResettableBackoffWrapper};

use std::time::Duration;

use backon::ExponentialBuilder;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The backoff applied to every watch stream by the cache
///
/// Exponential with jitter between `min` and `max`, and it never gives up.
pub fn default_backoff(min: Duration, max: Duration) -> ResettableBackoffWrapper<ExponentialBuilder> {
    ResettableBackoffWrapper::new(
        ExponentialBuilder::default()
            .with_min_delay(min)
            .with_max_delay(max)
            .with_factor(2.0)
            .with_jitter()
            .with_max_times(usize::MAX),
    )
}

/// Sleep for the next delay of `backoff`
///
/// Returns `false` when the backoff has run out of delays or `token` was cancelled while
/// waiting, in which case the caller should stop retrying.
pub async fn wait_before_retry<B: ResettableBackoff>(backoff: &mut B, token: &CancellationToken) -> bool {
    let Some(delay) = backoff.next() else {
        debug!("backoff exhausted, giving up");
        return false;
    };
    debug!(?delay, "backing off");
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
