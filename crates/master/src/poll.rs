//! Repeat a check on a fixed interval until it yields a value.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::warn;

/// One check of a condition the controller waits for.
#[async_trait]
pub trait Probe: Send {
    type Output: Send;
    type Error: fmt::Display + Send;

    /// `Some` ends the wait; `None` means check again after the interval.
    async fn check(&mut self) -> Result<Option<Self::Output>, Self::Error>;
}

/// Sleep `duration` unless shutdown is signalled first. Returns `false` on shutdown.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Sender gone, nothing can signal any more.
                    sleep.as_mut().await;
                    return true;
                }
            }
        }
    }
}

/// Run `probe` until it yields, sleeping `interval` between checks.
///
/// A failed check is logged and counts as "not yet". Returns `None` when
/// shutdown is signalled while waiting.
pub async fn poll_until<P: Probe>(
    probe: &mut P,
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<P::Output> {
    loop {
        match probe.check().await {
            Ok(Some(output)) => return Some(output),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "probe failed, retrying"),
        }
        if !sleep_or_shutdown(interval, shutdown).await {
            return None;
        }
    }
}
