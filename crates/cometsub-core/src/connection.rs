//! Connection lifecycle manager.
//!
//! A background task owns at most one [`Transport`] at a time and drives the
//! liveness/reconnect state machine:
//!
//! ```text
//! Idle → Connecting → Connected ──failure──▶ Reconnecting ──delay──▶ Connecting
//!                        │
//!                        └──disconnect()──▶ Closed
//! ```
//!
//! Every transport instance is a *generation*. The generation owns its event
//! channel and its liveness timers, so dropping it on teardown cancels
//! everything that belonged to it before the next transport is created.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, trace, warn};

use crate::config::SubscriberConfig;
use crate::envelope::SubscriptionRequest;
use crate::error::{ConfigError, ConnectionError};
use crate::subscriptions::RequestSink;
use crate::transport::{Connector, Transport, TransportEvent};

/// Lifecycle state of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `connect()` has not been called yet.
    Idle,
    /// A transport is being opened.
    Connecting,
    /// The transport is open and liveness probing is running.
    Connected,
    /// A failure was detected and a reconnect is scheduled.
    Reconnecting,
    /// Closed by the owner, or failed with auto-reconnect disabled.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Normalized events delivered to the manager's single owner.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A transport finished opening. `generation` increases with every
    /// transport the manager creates.
    Connected { generation: u64 },
    /// A raw inbound text frame.
    Message(String),
    /// The peer answered a heartbeat probe.
    HeartbeatAck,
    /// A transport that had reached `Connected` was torn down.
    Disconnected,
    /// Transport failure, liveness failure, or failure to close.
    Error(ConnectionError),
}

enum Command {
    Connect,
    Disconnect,
    Send(String),
    Shutdown,
}

/// Handle to the connection task.
///
/// Cheap to clone; all clones drive the same connection. The task exits on
/// [`ConnectionManager::shutdown`] or once every handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    address: Arc<str>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// Start the connection task. Must be called from within a Tokio runtime.
    ///
    /// Nothing is opened until [`connect`](Self::connect) is called. Configs
    /// with an empty address or a zero timer are rejected.
    pub fn spawn(
        config: SubscriberConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>), ConfigError> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let address: Arc<str> = Arc::from(config.address.as_str());

        let worker = Worker {
            config,
            connector,
            events: event_tx,
            state: state_tx,
            generation: None,
            generations: 0,
            closing_intentionally: false,
            reconnect_at: None,
        };
        tokio::spawn(worker.run(cmd_rx));

        Ok((
            Self {
                address,
                cmd_tx,
                state: state_rx,
            },
            event_rx,
        ))
    }

    /// Open a new transport, tearing down the current one first.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Close the transport and cancel every timer. No reconnect follows.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Serialize `envelope` and send it if the transport is open.
    ///
    /// Frames sent while not connected are dropped; the caller's own request
    /// timeout covers that case.
    pub fn send<T: Serialize + ?Sized>(&self, envelope: &T) -> Result<(), ConnectionError> {
        let frame = serde_json::to_string(envelope)
            .map_err(|e| ConnectionError::Serialization(e.to_string()))?;
        self.cmd_tx
            .send(Command::Send(frame))
            .map_err(|_| ConnectionError::Stopped)
    }

    /// Stop the connection task, closing the transport.
    pub fn shutdown(&self) {
        self.command(Command::Shutdown);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// The configured node address.
    pub fn address(&self) -> &str {
        &self.address
    }

    fn command(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_err() {
            debug!("connection manager already stopped");
        }
    }
}

impl RequestSink for ConnectionManager {
    fn send_request(&self, request: &SubscriptionRequest) -> Result<(), ConnectionError> {
        self.send(request)
    }
}

// ─── Background task ─────────────────────────────────────────────────────────

/// One transport instance and everything scoped to it.
struct Generation {
    id: u64,
    transport: Box<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    opened: bool,
    last_activity: Instant,
    /// `None` until opened, and again once a liveness failure was reported.
    liveness: Option<Liveness>,
}

struct Liveness {
    heartbeat: Interval,
    ack_deadline: Option<Pin<Box<Sleep>>>,
    probe_sent_at: Instant,
    silence: Pin<Box<Sleep>>,
    silence_timeout: Duration,
}

enum Timer {
    Heartbeat,
    AckDeadline,
    Silence,
}

impl Liveness {
    fn start(config: &SubscriberConfig) -> Self {
        let now = Instant::now();
        let period = config.heartbeat_interval();
        let mut heartbeat = time::interval_at(now + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            heartbeat,
            ack_deadline: None,
            probe_sent_at: now,
            silence: Box::pin(time::sleep_until(now + config.silence_timeout())),
            silence_timeout: config.silence_timeout(),
        }
    }

    fn touch(&mut self, now: Instant) {
        self.silence.as_mut().reset(now + self.silence_timeout);
    }

    fn probe_sent(&mut self, now: Instant, ack_timeout: Duration) {
        // An armed deadline already covers the earlier probe.
        if self.ack_deadline.is_none() {
            self.probe_sent_at = now;
            self.ack_deadline = Some(Box::pin(time::sleep_until(now + ack_timeout)));
        }
    }

    async fn expired(&mut self) -> Timer {
        tokio::select! {
            _ = self.heartbeat.tick() => Timer::Heartbeat,
            () = wait(&mut self.ack_deadline) => Timer::AckDeadline,
            () = &mut self.silence => Timer::Silence,
        }
    }
}

async fn wait(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn liveness(liveness: &mut Option<Liveness>) -> Timer {
    match liveness {
        Some(l) => l.expired().await,
        None => pending().await,
    }
}

enum Step {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    Timer(Timer),
    Reconnect,
}

struct Worker {
    config: SubscriberConfig,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    generation: Option<Generation>,
    generations: u64,
    closing_intentionally: bool,
    /// Armed while a reconnect is pending; doubles as the reconnecting guard.
    reconnect_at: Option<Pin<Box<Sleep>>>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            match self.next_step(&mut commands).await {
                Step::Command(Some(Command::Connect)) => self.connect(),
                Step::Command(Some(Command::Disconnect)) => self.disconnect(),
                Step::Command(Some(Command::Send(frame))) => self.send(frame),
                Step::Command(Some(Command::Shutdown)) | Step::Command(None) => break,
                Step::Transport(Some(event)) => self.on_transport_event(event),
                // Adapter dropped its sender without saying goodbye.
                Step::Transport(None) => self.on_transport_event(TransportEvent::Closed),
                Step::Timer(Timer::Heartbeat) => self.on_heartbeat(),
                Step::Timer(Timer::AckDeadline) => self.on_ack_deadline(),
                Step::Timer(Timer::Silence) => self.on_silence(),
                Step::Reconnect => {
                    info!(address = %self.config.address, "reconnecting");
                    self.connect();
                }
            }
        }

        self.reconnect_at = None;
        self.teardown();
        self.set_state(ConnectionState::Closed);
        debug!("connection manager task exiting");
    }

    async fn next_step(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Step {
        let reconnect = &mut self.reconnect_at;
        match &mut self.generation {
            Some(generation) => tokio::select! {
                cmd = commands.recv() => Step::Command(cmd),
                event = generation.events.recv() => Step::Transport(event),
                timer = liveness(&mut generation.liveness) => Step::Timer(timer),
                () = wait(reconnect) => Step::Reconnect,
            },
            None => tokio::select! {
                cmd = commands.recv() => Step::Command(cmd),
                () = wait(reconnect) => Step::Reconnect,
            },
        }
    }

    fn connect(&mut self) {
        self.closing_intentionally = false;
        self.reconnect_at = None;
        self.teardown();

        self.generations += 1;
        let id = self.generations;
        let (tx, rx) = mpsc::unbounded_channel();

        info!(address = %self.config.address, generation = id, "connecting");
        self.set_state(ConnectionState::Connecting);

        match self.connector.open(&self.config.address, tx) {
            Ok(transport) => {
                self.generation = Some(Generation {
                    id,
                    transport,
                    events: rx,
                    opened: false,
                    last_activity: Instant::now(),
                    liveness: None,
                });
            }
            Err(e) => {
                warn!(error = %e, generation = id, "failed to open transport");
                self.emit(ConnectionEvent::Error(e.into()));
                self.schedule_reconnect();
            }
        }
    }

    fn disconnect(&mut self) {
        info!(address = %self.config.address, "disconnect requested");
        self.closing_intentionally = true;
        self.reconnect_at = None;
        self.teardown();
        self.set_state(ConnectionState::Closed);
    }

    /// Drop the current generation: timers first, then the socket.
    fn teardown(&mut self) {
        let Some(mut generation) = self.generation.take() else {
            return;
        };
        generation.liveness = None;
        debug!(generation = generation.id, "tearing down transport");

        if let Err(e) = generation.transport.close() {
            warn!(error = %e, generation = generation.id, "error while closing transport");
            self.emit(ConnectionEvent::Error(ConnectionError::Close(e.to_string())));
        }
        if generation.opened {
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    fn send(&mut self, frame: String) {
        let Some(generation) = self.generation.as_mut().filter(|g| g.opened) else {
            debug!("not connected, dropping outbound frame");
            return;
        };
        trace!(generation = generation.id, len = frame.len(), "sending frame");
        if let Err(e) = generation.transport.send(frame) {
            self.on_failure(e.into());
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Frame(text) => {
                self.touch();
                self.emit(ConnectionEvent::Message(text));
            }
            TransportEvent::HeartbeatAck => {
                self.touch();
                trace!("heartbeat ack");
                self.emit(ConnectionEvent::HeartbeatAck);
            }
            TransportEvent::Closed => {
                info!(address = %self.config.address, "transport closed");
                self.teardown();
                if self.closing_intentionally {
                    self.set_state(ConnectionState::Closed);
                } else {
                    self.schedule_reconnect();
                }
            }
            TransportEvent::Error(detail) => {
                self.on_failure(ConnectionError::Transport(detail));
            }
        }
    }

    fn on_opened(&mut self) {
        let Some(generation) = self.generation.as_mut() else {
            return;
        };
        if generation.opened {
            return;
        }
        generation.opened = true;
        generation.last_activity = Instant::now();
        generation.liveness = Some(Liveness::start(&self.config));
        let id = generation.id;

        info!(address = %self.config.address, generation = id, "connected");
        self.set_state(ConnectionState::Connected);
        self.emit(ConnectionEvent::Connected { generation: id });
    }

    fn touch(&mut self) {
        if let Some(generation) = self.generation.as_mut() {
            let now = Instant::now();
            generation.last_activity = now;
            if let Some(liveness) = generation.liveness.as_mut() {
                liveness.touch(now);
            }
        }
    }

    fn on_heartbeat(&mut self) {
        let ack_timeout = self.config.heartbeat_ack_timeout();
        let Some(generation) = self.generation.as_mut().filter(|g| g.opened) else {
            return;
        };
        match generation.transport.probe() {
            Ok(()) => {
                if let Some(liveness) = generation.liveness.as_mut() {
                    liveness.probe_sent(Instant::now(), ack_timeout);
                }
                trace!(generation = generation.id, "heartbeat probe sent");
            }
            Err(e) => self.on_failure(e.into()),
        }
    }

    fn on_ack_deadline(&mut self) {
        let Some(generation) = self.generation.as_mut() else {
            return;
        };
        let Some(liveness) = generation.liveness.as_mut() else {
            return;
        };
        liveness.ack_deadline = None;
        if generation.last_activity >= liveness.probe_sent_at {
            return;
        }
        let ms = self.config.heartbeat_ack_timeout_ms;
        self.on_failure(ConnectionError::HeartbeatTimeout { ms });
    }

    fn on_silence(&mut self) {
        let ms = self.config.silence_timeout_ms;
        self.on_failure(ConnectionError::Silence { ms });
    }

    /// Report a failure of the current generation and stop its liveness
    /// timers so the same failure is not reported twice.
    fn on_failure(&mut self, err: ConnectionError) {
        warn!(address = %self.config.address, error = %err, "connection failure");
        if let Some(generation) = self.generation.as_mut() {
            generation.liveness = None;
        }
        self.emit(ConnectionEvent::Error(err));
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.closing_intentionally || !self.config.auto_reconnect {
            self.teardown();
            self.set_state(ConnectionState::Closed);
            return;
        }
        if self.reconnect_at.is_some() {
            debug!("reconnect already pending");
            return;
        }
        let delay = self.config.reconnect_delay();
        info!(address = %self.config.address, "reconnecting in {delay:?}");
        self.set_state(ConnectionState::Reconnecting);
        self.reconnect_at = Some(Box::pin(time::sleep(delay)));
    }

    fn emit(&self, event: ConnectionEvent) {
        // The owner going away is not an error for the connection itself.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state changed");
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::TransportEvents;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone)]
    struct MockLink {
        events: TransportEvents,
        sent: Arc<Mutex<Vec<String>>>,
        probes: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    struct MockTransport {
        link: MockLink,
        auto_ack: bool,
        fail_close: bool,
    }

    impl Transport for MockTransport {
        fn send(&mut self, frame: String) -> Result<(), TransportError> {
            self.link.sent.lock().unwrap().push(frame);
            Ok(())
        }

        fn probe(&mut self) -> Result<(), TransportError> {
            self.link.probes.fetch_add(1, Ordering::SeqCst);
            if self.auto_ack {
                let _ = self.link.events.send(TransportEvent::HeartbeatAck);
            }
            Ok(())
        }

        fn close(&mut self) -> Result<(), TransportError> {
            self.link.closed.store(true, Ordering::SeqCst);
            if self.fail_close {
                return Err(TransportError::Other("close handshake failed".into()));
            }
            Ok(())
        }
    }

    #[derive(Clone)]
    struct MockConnector {
        auto_open: bool,
        auto_ack: bool,
        fail_close: bool,
        links: Arc<Mutex<Vec<MockLink>>>,
    }

    impl MockConnector {
        fn new() -> Self {
            Self {
                auto_open: true,
                auto_ack: false,
                fail_close: false,
                links: Arc::default(),
            }
        }

        fn opened(&self) -> usize {
            self.links.lock().unwrap().len()
        }

        fn link(&self, i: usize) -> MockLink {
            self.links.lock().unwrap()[i].clone()
        }
    }

    impl Connector for MockConnector {
        fn open(
            &self,
            _address: &str,
            events: TransportEvents,
        ) -> Result<Box<dyn Transport>, TransportError> {
            let link = MockLink {
                events: events.clone(),
                sent: Arc::default(),
                probes: Arc::default(),
                closed: Arc::default(),
            };
            if self.auto_open {
                let _ = events.send(TransportEvent::Opened);
            }
            self.links.lock().unwrap().push(link.clone());
            Ok(Box::new(MockTransport {
                link,
                auto_ack: self.auto_ack,
                fail_close: self.fail_close,
            }))
        }
    }

    fn config() -> SubscriberConfig {
        SubscriberConfig::new("ws://node.test/websocket")
    }

    fn spawn(
        config: SubscriberConfig,
        connector: &MockConnector,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<ConnectionEvent>) {
        ConnectionManager::spawn(config, Arc::new(connector.clone())).unwrap()
    }

    async fn settle() {
        time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_emits_connected() {
        let connector = MockConnector::new();
        let (conn, mut rx) = spawn(config(), &connector);
        assert_eq!(conn.state(), ConnectionState::Idle);

        conn.connect();
        assert!(matches!(
            rx.recv().await,
            Some(ConnectionEvent::Connected { generation: 1 })
        ));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.address(), "ws://node.test/websocket");
    }

    #[tokio::test(start_paused = true)]
    async fn silence_triggers_one_error_and_one_reconnect() {
        let connector = MockConnector::new();
        let cfg = config()
            .with_auto_reconnect(true)
            .with_heartbeat(Duration::from_secs(3600), Duration::from_secs(10))
            .with_silence_timeout(Duration::from_millis(120))
            .with_reconnect_delay(Duration::from_secs(5));
        let (conn, mut rx) = spawn(cfg, &connector);
        conn.connect();

        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { generation: 1 })));
        match rx.recv().await {
            Some(ConnectionEvent::Error(ConnectionError::Silence { ms })) => assert_eq!(ms, 120),
            other => panic!("expected silence error, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Disconnected)));
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { generation: 2 })));

        assert_eq!(connector.opened(), 2);
        assert!(connector.link(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeat_ack_closes_without_auto_reconnect() {
        let connector = MockConnector::new();
        let cfg = config()
            .with_heartbeat(Duration::from_millis(30), Duration::from_millis(10))
            .with_silence_timeout(Duration::from_secs(10));
        let (conn, mut rx) = spawn(cfg, &connector);
        conn.connect();

        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { .. })));
        match rx.recv().await {
            Some(ConnectionEvent::Error(ConnectionError::HeartbeatTimeout { ms })) => {
                assert_eq!(ms, 10)
            }
            other => panic!("expected heartbeat timeout, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Disconnected)));
        assert_eq!(conn.state(), ConnectionState::Closed);

        let link = connector.link(0);
        assert_eq!(link.probes.load(Ordering::SeqCst), 1);
        assert!(link.closed.load(Ordering::SeqCst));

        time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acked_heartbeats_keep_connection_alive() {
        let mut connector = MockConnector::new();
        connector.auto_ack = true;
        let cfg = config()
            .with_heartbeat(Duration::from_millis(30), Duration::from_millis(10))
            .with_silence_timeout(Duration::from_millis(100));
        let (conn, mut rx) = spawn(cfg, &connector);
        conn.connect();

        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { .. })));
        for _ in 0..5 {
            assert!(matches!(rx.recv().await, Some(ConnectionEvent::HeartbeatAck)));
        }
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(connector.link(0).probes.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_never_reconnects() {
        let connector = MockConnector::new();
        let (conn, mut rx) = spawn(config().with_auto_reconnect(true), &connector);
        conn.connect();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { .. })));

        conn.disconnect();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Disconnected)));

        time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(connector.opened(), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_schedules_reconnect() {
        let connector = MockConnector::new();
        let (conn, mut rx) = spawn(config().with_auto_reconnect(true), &connector);
        conn.connect();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { generation: 1 })));

        connector.link(0).events.send(TransportEvent::Closed).unwrap();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Disconnected)));
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { generation: 2 })));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn error_then_close_reconnects_once() {
        let connector = MockConnector::new();
        let (conn, mut rx) = spawn(config().with_auto_reconnect(true), &connector);
        conn.connect();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { .. })));

        let link = connector.link(0);
        link.events.send(TransportEvent::Error("connection reset".into())).unwrap();
        link.events.send(TransportEvent::Closed).unwrap();

        match rx.recv().await {
            Some(ConnectionEvent::Error(ConnectionError::Transport(detail))) => {
                assert_eq!(detail, "connection reset")
            }
            other => panic!("expected transport error, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Disconnected)));
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { generation: 2 })));

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn send_is_dropped_until_open() {
        let mut connector = MockConnector::new();
        connector.auto_open = false;
        let (conn, mut rx) = spawn(config(), &connector);
        conn.connect();
        settle().await;

        conn.send(&serde_json::json!({"early": true})).unwrap();
        settle().await;
        let link = connector.link(0);
        assert!(link.sent.lock().unwrap().is_empty());

        link.events.send(TransportEvent::Opened).unwrap();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { .. })));

        let req = SubscriptionRequest::subscribe(1, "tm.event='NewBlock'");
        conn.send_request(&req).unwrap();
        settle().await;

        let sent = link.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![serde_json::to_string(&req).unwrap()]);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_forwarded_and_reset_silence() {
        let connector = MockConnector::new();
        let cfg = config()
            .with_heartbeat(Duration::from_secs(3600), Duration::from_secs(10))
            .with_silence_timeout(Duration::from_millis(100));
        let (conn, mut rx) = spawn(cfg, &connector);
        conn.connect();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { .. })));

        let link = connector.link(0);
        for i in 0..5 {
            time::sleep(Duration::from_millis(60)).await;
            link.events.send(TransportEvent::Frame(format!("{{\"n\":{i}}}"))).unwrap();
            match rx.recv().await {
                Some(ConnectionEvent::Message(raw)) => assert_eq!(raw, format!("{{\"n\":{i}}}")),
                other => panic!("expected message, got {other:?}"),
            }
        }
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_connected_replaces_transport() {
        let connector = MockConnector::new();
        let (conn, mut rx) = spawn(config(), &connector);
        conn.connect();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { generation: 1 })));

        conn.connect();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Disconnected)));
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { generation: 2 })));
        assert!(connector.link(0).closed.load(Ordering::SeqCst));
        assert!(!connector.link(1).closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_close_is_reported_and_next_generation_connects() {
        let mut connector = MockConnector::new();
        connector.fail_close = true;
        let (conn, mut rx) = spawn(config(), &connector);
        conn.connect();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { generation: 1 })));

        conn.connect();
        match rx.recv().await {
            Some(ConnectionEvent::Error(ConnectionError::Close(detail))) => {
                assert_eq!(detail, "close handshake failed")
            }
            other => panic!("expected close error, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Disconnected)));
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { generation: 2 })));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test]
    async fn spawn_rejects_invalid_config() {
        let connector = MockConnector::new();
        let cfg = config().with_heartbeat(Duration::ZERO, Duration::from_secs(10));
        match ConnectionManager::spawn(cfg, Arc::new(connector.clone())) {
            Err(ConfigError::ZeroDuration { field }) => assert_eq!(field, "heartbeatIntervalMs"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("zero heartbeat interval accepted"),
        }
        assert_eq!(connector.opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_events_are_ignored() {
        let connector = MockConnector::new();
        let (conn, mut rx) = spawn(config(), &connector);
        conn.connect();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { generation: 1 })));
        conn.connect();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Disconnected)));
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Connected { generation: 2 })));

        // The first generation's receiver is gone.
        assert!(connector.link(0).events.send(TransportEvent::Frame("{}".into())).is_err());
        settle().await;
        assert!(rx.try_recv().is_err());
    }
}
