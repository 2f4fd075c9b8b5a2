//! Machine records and their control surface
//!
//! A [`Machine`] is one running backing resource behind a virtual target
//! address. The handle side (held by the manager and by channel connectors)
//! carries the sender ends of the control channels; the [`MachineControl`]
//! side (owned by the provider run loop) carries the receivers. The split
//! makes the ownership rules of the lifecycle explicit: only connectors
//! feed activity and translate requests, only the run loop consumes them,
//! and the manager reclaims the control surface for draining once the run
//! loop returns.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Capacity of the translate request channel.
///
/// Requests queue here while a machine is still provisioning; 16 covers a
/// burst of concurrent channel opens without building an unbounded backlog
/// against a machine that may never come up.
const TRANSLATE_CHANNEL_CAPACITY: usize = 16;

/// An address-translation request from a channel connector.
#[derive(Debug)]
pub struct TranslateRequest {
    /// Virtual target address the client asked for.
    pub addr: String,
    /// TCP port the client asked for.
    pub port: u32,
    /// Reply channel carrying the real "host:port" to dial, or `None` when
    /// the machine cannot serve the request. A dropped reply reads as
    /// `None` on the connector side.
    pub reply: oneshot::Sender<Option<String>>,
}

/// Handle side of a running machine.
pub struct Machine {
    /// Monotonic id assigned by the manager, for logging.
    pub id: u64,
    /// Virtual address this machine serves.
    pub target: String,
    /// Shared flag snapshotted at creation; determines registry placement.
    pub shared: bool,
    /// Resolved public address, written once by the provider after the
    /// reachability probe succeeds. Never mutated afterwards.
    pub resolved: OnceLock<String>,
    /// Stop signal; cancelling it tells the run loop to tear down now,
    /// regardless of the activity counter.
    pub stop: CancellationToken,
    activity: mpsc::UnboundedSender<i8>,
    translate: mpsc::Sender<TranslateRequest>,
}

impl Machine {
    /// Allocate a machine and its control surface.
    pub fn new(id: u64, target: impl Into<String>, shared: bool) -> (Arc<Self>, MachineControl) {
        let (activity_tx, activity_rx) = mpsc::unbounded_channel();
        let (translate_tx, translate_rx) = mpsc::channel(TRANSLATE_CHANNEL_CAPACITY);
        let stop = CancellationToken::new();

        let machine = Arc::new(Self {
            id,
            target: target.into(),
            shared,
            resolved: OnceLock::new(),
            stop: stop.clone(),
            activity: activity_tx,
            translate: translate_tx,
        });
        let control = MachineControl {
            activity: activity_rx,
            translate: translate_rx,
            stop,
        };
        (machine, control)
    }

    /// Register one channel with the machine's activity counter.
    ///
    /// Returns `None` when the machine is already fully gone (run loop
    /// exited and the drain window closed). Dropping the guard emits the
    /// matching `-1`, so an increment can never leak on an early-return
    /// path.
    pub fn begin_activity(&self) -> Option<ActivityGuard> {
        self.activity.send(1).ok()?;
        Some(ActivityGuard {
            activity: self.activity.clone(),
        })
    }

    /// Ask the provider to translate a virtual address into a dialable
    /// "host:port". Blocks until the machine has passed its reachability
    /// probe; `None` means the machine cannot serve the request.
    pub async fn translate(&self, addr: &str, port: u32) -> Option<String> {
        let (reply, answer) = oneshot::channel();
        let request = TranslateRequest {
            addr: addr.to_string(),
            port,
            reply,
        };
        self.translate.send(request).await.ok()?;
        answer.await.ok().flatten()
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("shared", &self.shared)
            .field("resolved", &self.resolved.get())
            .finish()
    }
}

/// RAII guard for one channel's contribution to a machine's activity
/// counter.
///
/// Every guard that was handed out accounts for exactly one `+1` and, on
/// drop, exactly one `-1`. No other code path writes activity deltas.
#[derive(Debug)]
pub struct ActivityGuard {
    activity: mpsc::UnboundedSender<i8>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        // The run loop may already be gone; the drain absorbs the rest.
        let _ = self.activity.send(-1);
    }
}

/// Why a service loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeEnd {
    /// Stop was signalled; skip linger and tear down now.
    Stopped,
    /// The linger period elapsed with no remaining activity.
    Idle,
}

/// Receiver side of a machine's control channels, owned by the provider
/// run loop.
pub struct MachineControl {
    /// Activity deltas from channel connectors.
    pub activity: mpsc::UnboundedReceiver<i8>,
    /// Translate requests from channel connectors.
    pub translate: mpsc::Receiver<TranslateRequest>,
    /// Stop signal from the manager.
    pub stop: CancellationToken,
}

impl MachineControl {
    /// Drive the service/linger select loop for a machine that has passed
    /// its reachability probe.
    ///
    /// One select loop with a Serving/Lingering state: while the activity
    /// counter is positive, translate requests are answered via `resolve`;
    /// once it reaches zero the linger timer is armed and translate
    /// requests are left queued. A new `+1` during linger resumes service.
    /// Stop wins over everything, including an already-expired timer.
    pub async fn serve<F>(&mut self, linger: Duration, mut resolve: F) -> ServeEnd
    where
        F: FnMut(&TranslateRequest) -> Option<String>,
    {
        // Bootstrap: the first +1 is guaranteed to arrive while the run
        // loop is live, because connectors increment before translating.
        let mut active: i64 = 0;
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => return ServeEnd::Stopped,
            delta = self.activity.recv() => match delta {
                Some(delta) => active += i64::from(delta),
                None => return ServeEnd::Idle,
            },
        }

        loop {
            if active > 0 {
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => return ServeEnd::Stopped,
                    delta = self.activity.recv() => match delta {
                        Some(delta) => active += i64::from(delta),
                        None => return ServeEnd::Idle,
                    },
                    request = self.translate.recv() => {
                        if let Some(request) = request {
                            let answer = resolve(&request);
                            let _ = request.reply.send(answer);
                        }
                    }
                }
            } else {
                if linger.is_zero() {
                    return ServeEnd::Idle;
                }
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => return ServeEnd::Stopped,
                    delta = self.activity.recv() => match delta {
                        Some(delta) => active += i64::from(delta),
                        None => return ServeEnd::Idle,
                    },
                    _ = tokio::time::sleep(linger) => return ServeEnd::Idle,
                }
            }
        }
    }

    /// Absorb stragglers aimed at a machine whose run loop has exited.
    ///
    /// Activity deltas are discarded and translate requests answered with
    /// the unavailable sentinel for the duration of `grace`. Afterwards
    /// the receivers are dropped, so any later sender observes a closed
    /// channel instead of blocking on an unsupervised machine.
    pub async fn drain(mut self, grace: Duration) {
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);

        let mut activity_open = true;
        let mut translate_open = true;
        while activity_open || translate_open {
            tokio::select! {
                _ = &mut deadline => break,
                delta = self.activity.recv(), if activity_open => {
                    if delta.is_none() {
                        activity_open = false;
                    }
                }
                request = self.translate.recv(), if translate_open => match request {
                    Some(request) => {
                        let _ = request.reply.send(None);
                    }
                    None => translate_open = false,
                },
            }
        }
    }
}
