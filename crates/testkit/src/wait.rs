//! Polling helpers for tests that cross real sockets.

use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Time given to loopback datagrams to land before a tick reads them.
pub const SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Sleep for [`SETTLE_DELAY`].
pub async fn settle() {
    sleep(SETTLE_DELAY).await;
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
    true
}
