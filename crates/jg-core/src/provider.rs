//! Provider contract and reachability probing
//!
//! A provider owns one machine's lifecycle end to end: provision the
//! backing resource, probe it, serve translate requests, tear it down.
//! Providers communicate with the rest of the daemon only through the
//! machine's control channels.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::machine::{Machine, MachineControl};

/// Interval between reachability probe attempts.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(3);

/// Timeout for a single probe connect.
pub const PROBE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Total budget for the reachability probe.
pub const PROBE_BUDGET: Duration = Duration::from_secs(120);

/// Timeout for one invocation of an external provisioning command or API.
pub const EXTERNAL_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A machine provider.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Whether at most one live machine should exist per target address.
    ///
    /// Pure and non-blocking; called on the manager task.
    fn is_shared(&self) -> bool;

    /// Own one machine's lifecycle.
    ///
    /// Runs on a dedicated task and must eventually return with any
    /// backing resource released; provisioning and teardown failures are
    /// logged here, not propagated. The control surface is borrowed so
    /// the manager can reclaim it for the post-exit drain.
    async fn run_machine(&self, machine: &Machine, control: &mut MachineControl);
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Provider").finish_non_exhaustive()
    }
}

/// Wait until `addr` accepts TCP connections.
///
/// Retries every [`PROBE_INTERVAL`] within [`PROBE_BUDGET`], each attempt
/// bounded by [`PROBE_ATTEMPT_TIMEOUT`]. Returns `false` when the budget
/// is exhausted or `stop` fires first.
pub async fn probe_tcp(addr: &str, stop: &CancellationToken) -> bool {
    let deadline = tokio::time::Instant::now() + PROBE_BUDGET;
    loop {
        match tokio::time::timeout(PROBE_ATTEMPT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => return true,
            Ok(Err(e)) => tracing::trace!("probe of {} failed: {}", addr, e),
            Err(_) => tracing::trace!("probe of {} timed out", addr),
        }

        if tokio::time::Instant::now() + PROBE_INTERVAL > deadline {
            return false;
        }
        tokio::select! {
            _ = stop.cancelled() => return false,
            _ = tokio::time::sleep(PROBE_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let stop = CancellationToken::new();
        assert!(probe_tcp(&addr, &stop).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_gives_up_after_budget() {
        // A freshly bound and dropped port refuses connections quickly.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let stop = CancellationToken::new();
        assert!(!probe_tcp(&addr, &stop).await);
    }

    #[tokio::test]
    async fn test_probe_aborts_on_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let stop = CancellationToken::new();
        stop.cancel();
        assert!(!probe_tcp(&addr, &stop).await);
    }
}
