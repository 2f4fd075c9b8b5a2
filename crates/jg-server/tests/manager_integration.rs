//! Manager integration tests
//!
//! Exercises the manager, connector, and machine lifecycle end to end
//! with a recording fake provider, in-memory channel-open events, and a
//! loopback TCP echo server standing in for the backing machine.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use jg_core::{BoxedChannelIo, ChannelOpen, Machine, MachineControl, Provider, RejectReason};
use jg_server::Manager;

/// What happened to a submitted channel.
#[derive(Debug)]
enum Outcome {
    Accepted,
    Rejected(RejectReason, String),
}

/// In-memory channel-open event backed by a duplex pipe.
struct FakeChannel {
    kind: &'static str,
    target: String,
    port: u32,
    stream: DuplexStream,
    outcome: oneshot::Sender<Outcome>,
}

impl FakeChannel {
    fn new(
        target: &str,
        port: u32,
    ) -> (Box<dyn ChannelOpen>, DuplexStream, oneshot::Receiver<Outcome>) {
        Self::with_kind("direct-tcpip", target, port)
    }

    fn with_kind(
        kind: &'static str,
        target: &str,
        port: u32,
    ) -> (Box<dyn ChannelOpen>, DuplexStream, oneshot::Receiver<Outcome>) {
        let (client, server) = duplex(4096);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let channel = FakeChannel {
            kind,
            target: target.to_string(),
            port,
            stream: server,
            outcome: outcome_tx,
        };
        (Box::new(channel), client, outcome_rx)
    }
}

#[async_trait]
impl ChannelOpen for FakeChannel {
    fn kind(&self) -> &str {
        self.kind
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn port(&self) -> u32 {
        self.port
    }

    async fn accept(self: Box<Self>) -> io::Result<BoxedChannelIo> {
        let _ = self.outcome.send(Outcome::Accepted);
        Ok(Box::new(self.stream))
    }

    async fn reject(self: Box<Self>, reason: RejectReason, message: &str) {
        let _ = self
            .outcome
            .send(Outcome::Rejected(reason, message.to_string()));
    }
}

/// Provider lifecycle records emitted by [`RecordingProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Start,
    Stop,
}

/// Fake provider that records lifecycle events and serves translate
/// requests against a fixed backend address. `backend: None` simulates a
/// provisioning/probe failure: the run loop returns without ever
/// answering a translate request.
struct RecordingProvider {
    shared: bool,
    linger: Duration,
    backend: Option<String>,
    events: mpsc::UnboundedSender<Lifecycle>,
}

#[async_trait]
impl Provider for RecordingProvider {
    fn is_shared(&self) -> bool {
        self.shared
    }

    async fn run_machine(&self, machine: &Machine, control: &mut MachineControl) {
        let _ = self.events.send(Lifecycle::Start);

        let Some(backend) = &self.backend else {
            // Never became reachable; nothing was started to tear down.
            let _ = self.events.send(Lifecycle::Stop);
            return;
        };

        let _ = machine.resolved.set(backend.clone());
        let backend = backend.clone();
        control.serve(self.linger, move |_| Some(backend.clone())).await;

        let _ = self.events.send(Lifecycle::Stop);
    }
}

fn manager_with(target: &str, provider: RecordingProvider) -> Manager {
    let mut targets: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    targets.insert(target.to_string(), Arc::new(provider));
    Manager::spawn(targets)
}

/// Loopback echo server standing in for a backing machine.
async fn spawn_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Write a payload, half-close, and collect the echoed answer.
async fn echo_roundtrip(client: DuplexStream, payload: &[u8]) -> Vec<u8> {
    let (mut rd, mut wr) = tokio::io::split(client);
    wr.write_all(payload).await.unwrap();
    wr.shutdown().await.unwrap();

    let mut answer = Vec::new();
    rd.read_to_end(&mut answer).await.unwrap();
    answer
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Lifecycle>) -> Lifecycle {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for lifecycle event")
        .expect("event channel closed")
}

async fn next_outcome(outcome: oneshot::Receiver<Outcome>) -> Outcome {
    timeout(Duration::from_secs(5), outcome)
        .await
        .expect("timed out waiting for channel outcome")
        .expect("channel dropped without outcome")
}

// S1: two concurrent opens against a shared target use one machine.
#[tokio::test]
async fn test_concurrent_opens_share_one_machine() {
    let backend = spawn_echo_server().await;
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let manager = manager_with(
        "t1",
        RecordingProvider {
            shared: true,
            linger: Duration::ZERO,
            backend: Some(backend),
            events: events_tx,
        },
    );

    let (chan_a, client_a, outcome_a) = FakeChannel::new("t1", 22);
    let (chan_b, client_b, outcome_b) = FakeChannel::new("t1", 22);
    manager.submit(chan_a).await;
    manager.submit(chan_b).await;

    let (a, b) = tokio::join!(
        echo_roundtrip(client_a, b"alpha"),
        echo_roundtrip(client_b, b"beta"),
    );
    assert_eq!(a, b"alpha");
    assert_eq!(b, b"beta");
    assert!(matches!(next_outcome(outcome_a).await, Outcome::Accepted));
    assert!(matches!(next_outcome(outcome_b).await, Outcome::Accepted));

    // Exactly one machine started, stopped once both channels finished.
    assert_eq!(next_event(&mut events).await, Lifecycle::Start);
    assert_eq!(next_event(&mut events).await, Lifecycle::Stop);
    assert!(events.try_recv().is_err());
}

// Property 1 at larger N: one provider run loop per shared target.
#[tokio::test]
async fn test_many_concurrent_opens_spawn_one_machine() {
    let backend = spawn_echo_server().await;
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let manager = manager_with(
        "t1",
        RecordingProvider {
            shared: true,
            linger: Duration::ZERO,
            backend: Some(backend),
            events: events_tx,
        },
    );

    let mut sessions = Vec::new();
    for i in 0..8u32 {
        let (chan, client, outcome) = FakeChannel::new("t1", 22);
        manager.submit(chan).await;
        sessions.push((i, client, outcome));
    }

    let mut tasks = Vec::new();
    for (i, client, outcome) in sessions {
        tasks.push(tokio::spawn(async move {
            let payload = format!("payload-{}", i).into_bytes();
            let answer = echo_roundtrip(client, &payload).await;
            assert_eq!(answer, payload);
            assert!(matches!(next_outcome(outcome).await, Outcome::Accepted));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(next_event(&mut events).await, Lifecycle::Start);
    assert_eq!(next_event(&mut events).await, Lifecycle::Stop);
    assert!(events.try_recv().is_err());
}

// S2: a non-shared target gets one machine per channel.
#[tokio::test]
async fn test_non_shared_target_gets_machine_per_channel() {
    let backend = spawn_echo_server().await;
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let manager = manager_with(
        "t1",
        RecordingProvider {
            shared: false,
            linger: Duration::ZERO,
            backend: Some(backend),
            events: events_tx,
        },
    );

    let (chan_a, client_a, _outcome_a) = FakeChannel::new("t1", 22);
    let (chan_b, client_b, _outcome_b) = FakeChannel::new("t1", 22);
    manager.submit(chan_a).await;
    manager.submit(chan_b).await;

    let (a, b) = tokio::join!(
        echo_roundtrip(client_a, b"alpha"),
        echo_roundtrip(client_b, b"beta"),
    );
    assert_eq!(a, b"alpha");
    assert_eq!(b, b"beta");

    let mut starts = 0;
    let mut stops = 0;
    for _ in 0..4 {
        match next_event(&mut events).await {
            Lifecycle::Start => starts += 1,
            Lifecycle::Stop => stops += 1,
        }
    }
    assert_eq!(starts, 2);
    assert_eq!(stops, 2);
}

// S3: a channel opened inside the linger window keeps the machine alive.
#[tokio::test]
async fn test_linger_retains_machine_between_channels() {
    let backend = spawn_echo_server().await;
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let manager = manager_with(
        "t1",
        RecordingProvider {
            shared: true,
            linger: Duration::from_millis(500),
            backend: Some(backend),
            events: events_tx,
        },
    );

    let (chan, client, _outcome) = FakeChannel::new("t1", 22);
    manager.submit(chan).await;
    assert_eq!(echo_roundtrip(client, b"one").await, b"one");

    assert_eq!(next_event(&mut events).await, Lifecycle::Start);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err(), "machine stopped inside linger");

    let (chan, client, _outcome) = FakeChannel::new("t1", 22);
    manager.submit(chan).await;
    assert_eq!(echo_roundtrip(client, b"two").await, b"two");

    // Still the same machine: only now does the linger run out.
    assert_eq!(next_event(&mut events).await, Lifecycle::Stop);
    assert!(events.try_recv().is_err());
}

// S4: an idle machine is torn down once the linger expires.
#[tokio::test]
async fn test_linger_expires_when_idle() {
    let backend = spawn_echo_server().await;
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let manager = manager_with(
        "t1",
        RecordingProvider {
            shared: true,
            linger: Duration::from_millis(300),
            backend: Some(backend),
            events: events_tx,
        },
    );

    let (chan, client, _outcome) = FakeChannel::new("t1", 22);
    manager.submit(chan).await;
    assert_eq!(echo_roundtrip(client, b"one").await, b"one");

    assert_eq!(next_event(&mut events).await, Lifecycle::Start);
    assert_eq!(next_event(&mut events).await, Lifecycle::Stop);
    assert!(events.try_recv().is_err());
}

// S5: a machine that never becomes reachable rejects its channels via
// the drain sentinel, without leaking the connector.
#[tokio::test]
async fn test_probe_failure_rejects_channel() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let manager = manager_with(
        "t1",
        RecordingProvider {
            shared: true,
            linger: Duration::ZERO,
            backend: None,
            events: events_tx,
        },
    );

    let (chan, _client, outcome) = FakeChannel::new("t1", 22);
    manager.submit(chan).await;

    match next_outcome(outcome).await {
        Outcome::Rejected(RejectReason::ConnectionFailed, _) => {}
        other => panic!("expected connection-failed rejection, got {:?}", other),
    }
    assert_eq!(next_event(&mut events).await, Lifecycle::Start);
    assert_eq!(next_event(&mut events).await, Lifecycle::Stop);
}

// S6: graceful shutdown mid-session stops the machine and rejects
// later opens.
#[tokio::test]
async fn test_graceful_shutdown_mid_session() {
    let backend = spawn_echo_server().await;
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let manager = manager_with(
        "t1",
        RecordingProvider {
            shared: true,
            linger: Duration::from_secs(60),
            backend: Some(backend),
            events: events_tx,
        },
    );

    // Keep the channel open: write and read the echo without closing.
    let (chan, client, outcome) = FakeChannel::new("t1", 22);
    manager.submit(chan).await;
    let (mut rd, mut wr) = tokio::io::split(client);
    wr.write_all(b"ping").await.unwrap();
    let mut answer = [0u8; 4];
    rd.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer, b"ping");
    assert!(matches!(next_outcome(outcome).await, Outcome::Accepted));

    assert_eq!(next_event(&mut events).await, Lifecycle::Start);

    timeout(Duration::from_secs(5), manager.stop())
        .await
        .expect("stop did not complete");
    assert_eq!(next_event(&mut events).await, Lifecycle::Stop);

    // Every subsequent open is refused.
    let (chan, _client, outcome) = FakeChannel::new("t1", 22);
    manager.submit(chan).await;
    match next_outcome(outcome).await {
        Outcome::Rejected(RejectReason::Prohibited, message) => {
            assert!(message.contains("shutting down"));
        }
        other => panic!("expected prohibited rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_target_is_rejected() {
    let backend = spawn_echo_server().await;
    let (events_tx, _events) = mpsc::unbounded_channel();
    let manager = manager_with(
        "t1",
        RecordingProvider {
            shared: true,
            linger: Duration::ZERO,
            backend: Some(backend),
            events: events_tx,
        },
    );

    let (chan, _client, outcome) = FakeChannel::new("nonexistent", 22);
    manager.submit(chan).await;

    match next_outcome(outcome).await {
        Outcome::Rejected(RejectReason::ConnectionFailed, message) => {
            assert!(message.contains("unknown remote address"));
        }
        other => panic!("expected connection-failed rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_channel_kind_is_rejected() {
    let backend = spawn_echo_server().await;
    let (events_tx, _events) = mpsc::unbounded_channel();
    let manager = manager_with(
        "t1",
        RecordingProvider {
            shared: true,
            linger: Duration::ZERO,
            backend: Some(backend),
            events: events_tx,
        },
    );

    let (chan, _client, outcome) = FakeChannel::with_kind("session", "t1", 22);
    manager.submit(chan).await;

    match next_outcome(outcome).await {
        Outcome::Rejected(RejectReason::UnknownChannelType, _) => {}
        other => panic!("expected unknown-channel-type rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stop_completes_for_concurrent_callers() {
    let (events_tx, _events) = mpsc::unbounded_channel();
    let manager = manager_with(
        "t1",
        RecordingProvider {
            shared: true,
            linger: Duration::ZERO,
            backend: None,
            events: events_tx,
        },
    );

    let first = manager.clone();
    let second = manager.clone();
    let both = tokio::join!(first.stop(), second.stop());
    let _ = both;

    // A third call after completion returns immediately as well.
    timeout(Duration::from_secs(1), manager.stop())
        .await
        .expect("repeated stop hung");
}
