//! The manager agent
//!
//! A single event-loop task with exclusive ownership of the machine
//! registries. All public operations enqueue onto the event channel and
//! the loop processes one event at a time, which gives it a total order
//! over channel arrivals, machine terminations, and stop requests without
//! any locks. The loop never performs network I/O inline; rejections,
//! channel connectors, provider run loops, and drains are all spawned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use jg_core::{ChannelOpen, Machine, MachineControl, Provider, RejectReason};

use crate::connector;

/// Capacity of the manager's event queue.
///
/// 256 covers the burst a busy listener can produce between two loop
/// iterations; senders queue briefly beyond that.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Grace window during which a dead machine's channels keep being
/// serviced, so late channel connectors unblock cleanly instead of
/// waiting on an unsupervised machine.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Events processed by the manager loop.
enum ManagerEvent {
    /// An authenticated channel-open from the SSH front end.
    Channel(Box<dyn ChannelOpen>),
    /// A provider run loop returned; its control surface comes back with
    /// the notification for draining.
    MachineStopped {
        machine: Arc<Machine>,
        control: MachineControl,
    },
    /// Graceful-shutdown request, answered once every machine is gone.
    Stop(oneshot::Sender<()>),
}

/// Handle to the manager agent.
#[derive(Clone)]
pub struct Manager {
    events: mpsc::Sender<ManagerEvent>,
}

impl Manager {
    /// Spawn the manager loop over the configured targets.
    pub fn spawn(targets: HashMap<String, Arc<dyn Provider>>) -> Self {
        let (events, queue) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let state = ManagerLoop::new(targets, events.clone());
        tokio::spawn(state.run(queue));
        Self { events }
    }

    /// Hand an authenticated channel-open event to the manager.
    ///
    /// The call only enqueues; acceptance or rejection happens on the
    /// event itself, later, from whichever task ends up owning it.
    pub async fn submit(&self, channel: Box<dyn ChannelOpen>) {
        if let Err(returned) = self.events.send(ManagerEvent::Channel(channel)).await {
            let ManagerEvent::Channel(channel) = returned.0 else {
                return;
            };
            channel
                .reject(RejectReason::Prohibited, "shutting down")
                .await;
        }
    }

    /// Request graceful shutdown and wait until every machine has torn
    /// down. Safe to call from several tasks; each caller is woken when
    /// shutdown completes.
    pub async fn stop(&self) {
        let (done, finished) = oneshot::channel();
        if self.events.send(ManagerEvent::Stop(done)).await.is_ok() {
            let _ = finished.await;
        }
    }
}

/// Loop state. Owned by the event-loop task; nothing here is shared.
struct ManagerLoop {
    targets: HashMap<String, Arc<dyn Provider>>,
    /// Sender handed to machine monitors so run-loop exits come back as
    /// events.
    events: mpsc::Sender<ManagerEvent>,
    /// Every live machine, shared or not.
    machines: Vec<Arc<Machine>>,
    /// target address -> live machine, for shared providers only.
    shared: HashMap<String, Arc<Machine>>,
    next_machine_id: u64,
    stopping: bool,
    /// Outstanding Stop() callers, woken when the machine set empties.
    stop_waiters: Vec<oneshot::Sender<()>>,
}

impl ManagerLoop {
    fn new(targets: HashMap<String, Arc<dyn Provider>>, events: mpsc::Sender<ManagerEvent>) -> Self {
        Self {
            targets,
            events,
            machines: Vec::new(),
            shared: HashMap::new(),
            next_machine_id: 1,
            stopping: false,
            stop_waiters: Vec::new(),
        }
    }

    async fn run(mut self, mut queue: mpsc::Receiver<ManagerEvent>) {
        while let Some(event) = queue.recv().await {
            match event {
                ManagerEvent::Channel(channel) => self.handle_channel(channel),
                ManagerEvent::MachineStopped { machine, control } => {
                    self.handle_machine_stopped(machine, control)
                }
                ManagerEvent::Stop(done) => self.handle_stop(done),
            }
        }
    }

    fn handle_channel(&mut self, channel: Box<dyn ChannelOpen>) {
        if self.stopping {
            reject(channel, RejectReason::Prohibited, "shutting down");
            return;
        }
        if channel.kind() != "direct-tcpip" {
            reject(
                channel,
                RejectReason::UnknownChannelType,
                "only direct-tcpip channels are served",
            );
            return;
        }
        let Some(provider) = self.targets.get(channel.target()) else {
            reject(
                channel,
                RejectReason::ConnectionFailed,
                "unknown remote address",
            );
            return;
        };
        let provider = Arc::clone(provider);

        let machine = if provider.is_shared() {
            match self.shared.get(channel.target()) {
                Some(machine) => Arc::clone(machine),
                None => self.start_machine(channel.target().to_string(), provider, true),
            }
        } else {
            self.start_machine(channel.target().to_string(), provider, false)
        };

        tokio::spawn(connector::run_channel(channel, machine));
    }

    /// Allocate a machine, register it, and spawn its run loop plus the
    /// monitor that reports the exit. Exactly one MachineStopped event
    /// comes back per machine started here.
    fn start_machine(
        &mut self,
        target: String,
        provider: Arc<dyn Provider>,
        shared: bool,
    ) -> Arc<Machine> {
        let id = self.next_machine_id;
        self.next_machine_id += 1;

        let (machine, mut control) = Machine::new(id, target.clone(), shared);
        self.machines.push(Arc::clone(&machine));
        if shared {
            self.shared.insert(target.clone(), Arc::clone(&machine));
        }
        tracing::info!("starting machine {} for target {:?}", id, target);

        let events = self.events.clone();
        let monitored = Arc::clone(&machine);
        tokio::spawn(async move {
            provider.run_machine(&monitored, &mut control).await;
            let _ = events
                .send(ManagerEvent::MachineStopped {
                    machine: monitored,
                    control,
                })
                .await;
        });

        machine
    }

    fn handle_machine_stopped(&mut self, machine: Arc<Machine>, control: MachineControl) {
        tracing::info!(
            "machine {} for target {:?} stopped",
            machine.id,
            machine.target
        );

        self.machines.retain(|m| !Arc::ptr_eq(m, &machine));
        if machine.shared {
            // Clear the slot only while it still points at this exact
            // machine; a successor may already have taken it.
            if let Some(current) = self.shared.get(&machine.target) {
                if Arc::ptr_eq(current, &machine) {
                    self.shared.remove(&machine.target);
                }
            }
        }

        tokio::spawn(control.drain(DRAIN_GRACE));

        if self.stopping && self.machines.is_empty() {
            for waiter in self.stop_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn handle_stop(&mut self, done: oneshot::Sender<()>) {
        if !self.stopping {
            self.stopping = true;
            tracing::info!("shutdown requested, stopping {} machine(s)", self.machines.len());
            for machine in &self.machines {
                machine.stop.cancel();
            }
        }

        if self.machines.is_empty() {
            let _ = done.send(());
        } else {
            self.stop_waiters.push(done);
        }
    }
}

/// Reject a channel without blocking the event loop.
fn reject(channel: Box<dyn ChannelOpen>, reason: RejectReason, message: &'static str) {
    tokio::spawn(async move {
        channel.reject(reason, message).await;
    });
}
