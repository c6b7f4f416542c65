//! Convergence polling.
//!
//! Waiters re-read derived instance state at a fixed interval instead of
//! listening for edges: several independent waiters need the same
//! snapshot, and an engine restart resets the flags they watch.

use std::future::Future;
use std::time::Duration;

use strata_core::{Context, ContextError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Evaluate `check` until it returns `true`, sleeping `interval` between
/// attempts. The context error is returned unchanged.
pub async fn poll_until<F, Fut>(
    ctx: &Context,
    interval: Duration,
    mut check: F,
) -> Result<(), ContextError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    loop {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if check().await {
            return Ok(());
        }
        ctx.sleep(interval).await?;
    }
}
