//! Connection manager with bounded reconnection and an observable state stream.
//!
//! `ConnectionManager` keeps at most one live connection per namespace. The
//! first `open` for a namespace spawns a worker task that exclusively owns the
//! transport connection; later opens share it. Every [`ConnectionHandle`] has
//! its own ordered event stream, and the worker stops once the last handle is
//! closed or dropped.

use crate::error::{Error, Result};
use crate::messages::ControlCommand;
use crate::protocol::{InboundEvent, OutboundEvent};
use crate::transport::{Transport, TransportConnection};
use crate::types::{ConnectionState, Namespace};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Floor for `ConnectionConfig::ping_interval`.
const MIN_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Delay growth between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffPolicy {
    /// `reconnect_delay * 2^(attempt - 1)`, capped at `max_reconnect_delay`.
    #[default]
    Exponential,
    /// `reconnect_delay` for every attempt.
    Fixed,
}

/// Configuration for a connection worker.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Reconnection attempts after a failure before settling in `Disconnected`.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnection attempt.
    pub reconnect_delay: Duration,
    /// Upper bound for exponential backoff.
    pub max_reconnect_delay: Duration,
    pub backoff: BackoffPolicy,
    /// Interval between heartbeat pings.
    pub ping_interval: Duration,
    /// Capacity of the outbound command channel.
    pub command_buffer: usize,
    /// Capacity of the inbound event channel.
    pub event_buffer: usize,
    /// How long `close` waits for the worker before aborting it.
    pub close_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            backoff: BackoffPolicy::Exponential,
            ping_interval: Duration::from_secs(30),
            command_buffer: 64,
            event_buffer: 256,
            close_timeout: Duration::from_secs(1),
        }
    }
}

impl ConnectionConfig {
    /// Delay before reconnection attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffPolicy::Fixed => self.reconnect_delay,
            BackoffPolicy::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.reconnect_delay
                    .saturating_mul(factor)
                    .min(self.max_reconnect_delay)
            }
        }
    }
}

/// Everything the worker reports, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    State(ConnectionState),
    Inbound(InboundEvent),
}

type Registry = Arc<DashMap<Namespace, Arc<SharedConnection>>>;

/// Opens connections over a shared transport, one per namespace.
#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    live: Registry,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        Self {
            transport,
            config,
            live: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get a handle on the connection for `namespace`, starting a worker if
    /// none is running.
    ///
    /// Returns the handle and its ordered stream of state changes and inbound
    /// events. A handle joining a running connection first receives the
    /// current state. Dropping the event receiver does not stop the worker;
    /// closing or dropping the last handle does.
    pub fn open(&self, namespace: Namespace) -> (ConnectionHandle, mpsc::Receiver<ConnectionEvent>) {
        let shared = match self.live.entry(namespace) {
            Entry::Occupied(entry) if entry.get().is_alive() => {
                let shared = entry.get().clone();
                let handles = shared.handles.fetch_add(1, Ordering::AcqRel) + 1;
                debug!("[{}] Sharing live connection ({} handles)", namespace, handles);
                shared
            }
            entry => {
                let shared = self.spawn_worker(namespace);
                entry.insert(shared.clone());
                shared
            }
        };

        let (id, events) = shared
            .subscribers
            .attach(&shared.state_rx, self.config.event_buffer.max(1));

        let handle = ConnectionHandle {
            namespace,
            id,
            shared,
            live: self.live.clone(),
            released: false,
        };
        (handle, events)
    }

    fn spawn_worker(&self, namespace: Namespace) -> Arc<SharedConnection> {
        let (command_tx, command_rx) = mpsc::channel(self.config.command_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let subscribers = Arc::new(Subscribers::default());

        let worker = ConnectionWorker {
            transport: self.transport.clone(),
            namespace,
            config: self.config.clone(),
            command_rx,
            subscribers: subscribers.clone(),
            state_tx,
        };

        info!("[{}] Opening connection", namespace);
        let task = tokio::spawn(worker.run());

        Arc::new(SharedConnection {
            command_tx,
            state_rx,
            subscribers,
            handles: AtomicUsize::new(1),
            task: Mutex::new(Some(task)),
            close_timeout: self.config.close_timeout,
        })
    }
}

/// One running worker and the bookkeeping of the handles sharing it.
struct SharedConnection {
    command_tx: mpsc::Sender<ControlCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    subscribers: Arc<Subscribers>,
    handles: AtomicUsize,
    task: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

impl SharedConnection {
    /// The worker drops its command receiver when it exits.
    fn is_alive(&self) -> bool {
        !self.command_tx.is_closed()
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[derive(Default)]
struct SubscriberList {
    next_id: u64,
    senders: Vec<(u64, mpsc::Sender<ConnectionEvent>)>,
    closed: bool,
}

/// Event streams of every handle on one connection.
///
/// State changes are recorded under the same lock that admits new
/// subscribers, so a late subscriber sees every state exactly once.
#[derive(Default)]
struct Subscribers {
    inner: Mutex<SubscriberList>,
}

impl Subscribers {
    fn lock(&self) -> MutexGuard<'_, SubscriberList> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn attach(
        &self,
        state_rx: &watch::Receiver<ConnectionState>,
        buffer: usize,
    ) -> (u64, mpsc::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        let mut list = self.lock();
        let id = list.next_id;
        list.next_id += 1;
        if list.closed {
            // Worker already gone; the stream ends immediately.
            return (id, rx);
        }

        let current = *state_rx.borrow();
        if current != ConnectionState::Disconnected {
            let _ = tx.try_send(ConnectionEvent::State(current));
        }
        list.senders.push((id, tx));
        (id, rx)
    }

    fn detach(&self, id: u64) {
        self.lock().senders.retain(|(sid, _)| *sid != id);
    }

    /// Senders to deliver to, optionally recording a state change first.
    fn snapshot(
        &self,
        state: Option<(&watch::Sender<ConnectionState>, ConnectionState)>,
    ) -> Vec<mpsc::Sender<ConnectionEvent>> {
        let list = self.lock();
        if let Some((state_tx, state)) = state {
            state_tx.send_replace(state);
        }
        list.senders.iter().map(|(_, tx)| tx.clone()).collect()
    }

    async fn deliver(&self, senders: Vec<mpsc::Sender<ConnectionEvent>>, event: ConnectionEvent) {
        for tx in senders {
            if tx.send(event.clone()).await.is_err() {
                debug!("Event receiver gone, discarding event");
            }
        }
    }

    /// End every stream.
    fn close(&self) {
        let mut list = self.lock();
        list.closed = true;
        list.senders.clear();
    }
}

/// Handle to the namespace connection, possibly shared with other handles.
pub struct ConnectionHandle {
    namespace: Namespace,
    id: u64,
    shared: Arc<SharedConnection>,
    live: Registry,
    released: bool,
}

impl ConnectionHandle {
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_rx.borrow()
    }

    /// Stream of connection states. A new receiver starts at the current state.
    pub fn observe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_rx.clone()
    }

    /// Queue an event for the live connection. Events queued while the
    /// connection is down are dropped by the worker.
    pub fn emit(&self, event: OutboundEvent) -> Result<()> {
        self.shared
            .command_tx
            .try_send(ControlCommand::Emit(event))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(ControlCommand::Emit(event)) => {
                    Error::Backpressure(event.name)
                }
                _ => Error::ChannelClosed,
            })
    }

    /// Give up this handle. When it was the last one, the connection is
    /// closed: pending emits are flushed first and no reconnect happens
    /// afterwards, even if one was scheduled.
    pub async fn close(mut self) {
        let Some(mut task) = self.release() else {
            return;
        };
        let _ = self.shared.command_tx.send(ControlCommand::Shutdown).await;
        if tokio::time::timeout(self.shared.close_timeout, &mut task)
            .await
            .is_err()
        {
            warn!(
                "[{}] Connection worker did not stop within {:?}, aborting",
                self.namespace, self.shared.close_timeout
            );
            task.abort();
        }
    }

    /// Detach from the connection. Returns the worker task when this was the
    /// last handle.
    fn release(&mut self) -> Option<JoinHandle<()>> {
        if self.released {
            return None;
        }
        self.released = true;

        let last = match self.live.entry(self.namespace) {
            Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), &self.shared) => {
                let last = self.shared.handles.fetch_sub(1, Ordering::AcqRel) == 1;
                if last {
                    entry.remove();
                }
                last
            }
            _ => self.shared.handles.fetch_sub(1, Ordering::AcqRel) == 1,
        };

        if !last {
            self.shared.subscribers.detach(self.id);
            debug!("[{}] Handle released, connection still shared", self.namespace);
            return None;
        }
        // The last stream stays attached until the worker reports Disconnected.
        self.shared.take_task()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        // Dropping the last handle drops the command sender, which stops the worker.
        if self.release().is_some() {
            debug!("[{}] Last handle dropped", self.namespace);
        }
    }
}

/// Why the pump loop returned.
enum SessionEnd {
    Shutdown,
    Lost(Error),
}

/// Owns the transport connection and drives reconnection.
struct ConnectionWorker {
    transport: Arc<dyn Transport>,
    namespace: Namespace,
    config: ConnectionConfig,
    command_rx: mpsc::Receiver<ControlCommand>,
    subscribers: Arc<Subscribers>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionWorker {
    /// Connect, pump, reconnect with backoff until shutdown or the retry
    /// budget runs out.
    async fn run(mut self) {
        let label = self.namespace.as_str();
        let mut retries: u32 = 0;
        let mut ever_connected = false;

        self.transition(ConnectionState::Connecting).await;

        loop {
            let transport = self.transport.clone();
            let attempt = transport.connect(self.namespace);
            let outcome = match self.unless_shutdown(attempt).await {
                Some(outcome) => outcome,
                None => break,
            };

            match outcome {
                Ok(mut conn) => {
                    retries = 0;
                    ever_connected = true;
                    info!("[{}] Connected", label);
                    gauge!("channel_client_connections_active", "namespace" => label)
                        .increment(1.0);
                    self.transition(ConnectionState::Connected).await;

                    let end = self.pump(conn.as_mut()).await;
                    gauge!("channel_client_connections_active", "namespace" => label)
                        .decrement(1.0);

                    match end {
                        SessionEnd::Shutdown => {
                            conn.close().await;
                            info!("[{}] Connection closed", label);
                            break;
                        }
                        SessionEnd::Lost(e) => {
                            counter!("channel_client_disconnects_total", "namespace" => label)
                                .increment(1);
                            warn!("[{}] Connection lost: {}", label, e);
                            self.transition(ConnectionState::Reconnecting).await;
                        }
                    }
                }
                Err(e) => {
                    warn!("[{}] Connect attempt failed: {}", label, e);
                }
            }

            if retries >= self.config.max_reconnect_attempts {
                warn!(
                    "[{}] Giving up after {} reconnection attempts",
                    label, retries
                );
                break;
            }
            retries += 1;

            let delay = self.config.backoff_delay(retries);
            info!(
                "[{}] Reconnecting in {:?} (attempt {}/{}{})",
                label,
                delay,
                retries,
                self.config.max_reconnect_attempts,
                if ever_connected { "" } else { ", never connected" }
            );
            counter!("channel_client_reconnect_attempts_total", "namespace" => label)
                .increment(1);

            if self.unless_shutdown(tokio::time::sleep(delay)).await.is_none() {
                break;
            }
        }

        self.transition(ConnectionState::Disconnected).await;
        self.subscribers.close();
    }

    /// Drive `fut` while watching the command channel. Returns `None` when
    /// shutdown was requested first; emits arriving meanwhile are dropped.
    async fn unless_shutdown<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;

                cmd = self.command_rx.recv() => match cmd {
                    Some(ControlCommand::Emit(event)) => {
                        debug!(
                            "[{}] Dropping '{}' while not connected",
                            self.namespace, event.name
                        );
                    }
                    Some(ControlCommand::Shutdown) | None => {
                        info!("[{}] Shutdown requested while not connected", self.namespace);
                        return None;
                    }
                },

                out = &mut fut => return Some(out),
            }
        }
    }

    /// Move commands out and events in until the session ends.
    async fn pump(&mut self, conn: &mut dyn TransportConnection) -> SessionEnd {
        let label = self.namespace.as_str();
        let mut heartbeat = interval(self.config.ping_interval.max(MIN_PING_INTERVAL));
        heartbeat.reset(); // Don't fire immediately

        loop {
            tokio::select! {
                biased;

                cmd = self.command_rx.recv() => match cmd {
                    Some(ControlCommand::Emit(event)) => {
                        debug!("[{}] Sending '{}'", label, event.name);
                        if let Err(e) = conn.send(&event).await {
                            return SessionEnd::Lost(e);
                        }
                        counter!("channel_client_events_sent_total", "namespace" => label)
                            .increment(1);
                    }
                    Some(ControlCommand::Shutdown) | None => {
                        info!("[{}] Received shutdown command", label);
                        return SessionEnd::Shutdown;
                    }
                },

                inbound = conn.recv() => match inbound {
                    Some(Ok(event)) => {
                        counter!("channel_client_events_received_total", "namespace" => label)
                            .increment(1);
                        debug!("[{}] Received '{}'", label, event.name);
                        let senders = self.subscribers.snapshot(None);
                        self.subscribers
                            .deliver(senders, ConnectionEvent::Inbound(event))
                            .await;
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e),
                    None => return SessionEnd::Lost(Error::ConnectionClosed),
                },

                _ = heartbeat.tick() => {
                    if let Err(e) = conn.heartbeat().await {
                        return SessionEnd::Lost(e);
                    }
                }
            }
        }
    }

    /// Publish a state change on both the watch channel and the event stream.
    async fn transition(&mut self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        debug!("[{}] State -> {}", self.namespace, state.as_str());
        let senders = self.subscribers.snapshot(Some((&self.state_tx, state)));
        self.subscribers
            .deliver(senders, ConnectionEvent::State(state))
            .await;
    }
}
