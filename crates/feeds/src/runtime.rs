//! Single-task feed runtime.
//!
//! Every feed runs on one tokio task that serially handles consumer
//! commands, initialization and REST completions, connection events and an
//! optional poll tick. Handlers never overlap, so the local cache needs no
//! locking. Spawned work carries the generation it was started in and a
//! cancellation token; switching target or tearing down bumps the generation
//! and cancels the token, and anything finishing late is discarded before it
//! reaches the cache.

use crate::cache::{FeedStatus, FeedView, LocalCache};
use crate::dispatcher::{Dispatch, Effect, EventDispatcher};
use crate::error::{FeedError, Result};
use crate::subscription::{SubscriptionAction, SubscriptionController};
use async_trait::async_trait;
use common::{
    Channel, ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState, Namespace,
    OutboundEvent,
};
use metrics::counter;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Floor for [`Feed::poll_interval`].
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A specialization of the generic feed runtime (chat, presence, odds).
#[async_trait]
pub trait Feed: Send + Sync + Sized + 'static {
    const NAMESPACE: Namespace;

    /// What the consumer points the feed at.
    type Target: Clone + PartialEq + Debug + Send + Sync + 'static;
    /// Authoritative local state, mutated only on the feed task.
    type State: Default + Send + 'static;
    /// Immutable data published to consumers.
    type Snapshot: Clone + Debug + Default + Send + Sync + 'static;
    /// Result of initialization.
    type Prepared: Send + 'static;
    type Command: Debug + Send + 'static;
    /// Result of work spawned through [`FeedContext::spawn`].
    type Output: Send + 'static;

    /// The channel for `target` when it is known without any I/O.
    fn channel_hint(&self, _target: &Self::Target) -> Option<Channel> {
        None
    }

    /// Initialization for `target`. Runs off the feed task.
    async fn prepare(&self, target: Self::Target) -> Result<Self::Prepared>;

    /// Fold a successful initialization into the state and return the
    /// channel to join.
    fn seed(&self, target: &Self::Target, prepared: Self::Prepared, state: &mut Self::State) -> Channel;

    /// Clear the state when the target changes.
    fn reset(&self, state: &mut Self::State) {
        *state = Self::State::default();
    }

    fn join_event(&self, channel: &Channel) -> OutboundEvent;

    fn leave_event(&self, channel: &Channel) -> OutboundEvent;

    fn register_routes(&self, dispatcher: &mut EventDispatcher<Self::State>);

    fn snapshot(&self, state: &Self::State) -> Self::Snapshot;

    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    /// Called on every poll tick while the feed is ready.
    fn on_poll(&self, _ctx: &mut FeedContext<'_, Self>) {}

    fn on_command(&self, _ctx: &mut FeedContext<'_, Self>, command: Self::Command) -> Result<()> {
        debug!("[{}] Ignoring command {:?}", Self::NAMESPACE, command);
        Ok(())
    }

    fn on_output(&self, _ctx: &mut FeedContext<'_, Self>, _output: Self::Output) {}
}

/// Work finished off the feed task, tagged with its generation.
enum Completion<F: Feed> {
    Prepared {
        generation: u64,
        target: F::Target,
        result: Result<F::Prepared>,
    },
    Output {
        generation: u64,
        output: F::Output,
    },
}

impl<F: Feed> Completion<F> {
    fn generation(&self) -> u64 {
        match self {
            Completion::Prepared { generation, .. } | Completion::Output { generation, .. } => {
                *generation
            }
        }
    }
}

/// Generation counter plus the cancellation token of the current generation.
struct TaskScope<F: Feed> {
    generation: u64,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<Completion<F>>,
}

impl<F: Feed> TaskScope<F> {
    /// Cancel everything in flight and start a new generation.
    fn renew(&mut self) {
        self.token.cancel();
        self.token = CancellationToken::new();
        self.generation += 1;
    }

    fn spawn<Fut>(&self, fut: Fut)
    where
        Fut: Future<Output = Completion<F>> + Send + 'static,
    {
        let token = self.token.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                done = fut => {
                    let _ = tx.send(done);
                }
            }
        });
    }
}

/// Access handed to feed hooks while they run on the feed task.
pub struct FeedContext<'a, F: Feed> {
    cache: &'a mut LocalCache<F::State>,
    active: Option<&'a Channel>,
    connection: Option<&'a ConnectionHandle>,
    tasks: &'a TaskScope<F>,
}

impl<'a, F: Feed> FeedContext<'a, F> {
    pub fn state(&self) -> &F::State {
        self.cache.state()
    }

    pub fn state_mut(&mut self) -> &mut F::State {
        self.cache.state_mut()
    }

    pub fn status(&self) -> &FeedStatus {
        self.cache.status()
    }

    /// The joined channel, if membership is live.
    pub fn active_channel(&self) -> Option<&Channel> {
        self.active
    }

    /// Queue `event` on the feed's connection.
    pub fn emit(&self, event: OutboundEvent) -> Result<()> {
        match self.connection {
            Some(handle) => Ok(handle.emit(event)?),
            None => Err(FeedError::NotJoined),
        }
    }

    /// Surface a non-fatal problem to the consumer.
    pub fn notice(&mut self, message: impl Into<String>) {
        self.cache.set_notice(Some(message.into()));
    }

    /// Run `fut` off the feed task; its output comes back through
    /// [`Feed::on_output`] unless the target changed in the meantime.
    pub fn spawn<Fut>(&self, fut: Fut)
    where
        Fut: Future<Output = F::Output> + Send + 'static,
    {
        let generation = self.tasks.generation;
        self.tasks.spawn(async move {
            Completion::Output {
                generation,
                output: fut.await,
            }
        });
    }
}

enum FeedCommand<F: Feed> {
    SetTarget(Option<F::Target>),
    Retry,
    Reconnect,
    Feed(F::Command),
    Shutdown(oneshot::Sender<()>),
}

/// Consumer handle of a running feed. Dropping it tears the feed down.
pub struct FeedClient<F: Feed> {
    commands: mpsc::UnboundedSender<FeedCommand<F>>,
    views: watch::Receiver<Arc<FeedView<F::Snapshot>>>,
}

impl<F: Feed> FeedClient<F> {
    /// Start `feed` on its own task. The connection is opened through
    /// `manager` once the first target initialized.
    pub fn spawn(feed: F, manager: ConnectionManager) -> Self {
        let feed = Arc::new(feed);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(Arc::new(FeedView::default()));

        let mut dispatcher = EventDispatcher::new(F::NAMESPACE);
        feed.register_routes(&mut dispatcher);

        let runtime = FeedRuntime {
            feed,
            manager,
            dispatcher,
            controller: SubscriptionController::new(F::NAMESPACE),
            cache: LocalCache::default(),
            target: None,
            connection: None,
            events: None,
            connection_state: ConnectionState::Disconnected,
            tasks: TaskScope {
                generation: 0,
                token: CancellationToken::new(),
                tx: completion_tx,
            },
            completions: completion_rx,
            commands: command_rx,
            view_tx,
        };
        tokio::spawn(runtime.run());

        Self {
            commands: command_tx,
            views: view_rx,
        }
    }

    /// Point the feed at `target`, or disable it with `None`.
    pub fn set_target(&self, target: Option<F::Target>) -> Result<()> {
        self.send(FeedCommand::SetTarget(target))
    }

    /// Restart initialization after it failed.
    pub fn retry(&self) -> Result<()> {
        self.send(FeedCommand::Retry)
    }

    /// Reopen the connection after the reconnect budget was exhausted.
    pub fn reconnect(&self) -> Result<()> {
        self.send(FeedCommand::Reconnect)
    }

    pub fn command(&self, command: F::Command) -> Result<()> {
        self.send(FeedCommand::Feed(command))
    }

    /// Latest published view.
    pub fn view(&self) -> Arc<FeedView<F::Snapshot>> {
        self.views.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<FeedView<F::Snapshot>>> {
        self.views.clone()
    }

    /// Wait until a published view satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&FeedView<F::Snapshot>) -> bool,
    ) -> Result<Arc<FeedView<F::Snapshot>>> {
        let mut views = self.views.clone();
        let view = views
            .wait_for(|view| predicate(&**view))
            .await
            .map_err(|_| FeedError::Closed)?
            .clone();
        Ok(view)
    }

    /// Leave the active room, close the connection and stop the task.
    pub async fn shutdown(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(FeedCommand::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    fn send(&self, command: FeedCommand<F>) -> Result<()> {
        self.commands.send(command).map_err(|_| FeedError::Closed)
    }
}

struct FeedRuntime<F: Feed> {
    feed: Arc<F>,
    manager: ConnectionManager,
    dispatcher: EventDispatcher<F::State>,
    controller: SubscriptionController,
    cache: LocalCache<F::State>,
    target: Option<F::Target>,
    connection: Option<ConnectionHandle>,
    events: Option<mpsc::Receiver<ConnectionEvent>>,
    connection_state: ConnectionState,
    tasks: TaskScope<F>,
    completions: mpsc::UnboundedReceiver<Completion<F>>,
    commands: mpsc::UnboundedReceiver<FeedCommand<F>>,
    view_tx: watch::Sender<Arc<FeedView<F::Snapshot>>>,
}

impl<F: Feed> FeedRuntime<F> {
    async fn run(mut self) {
        let label = F::NAMESPACE.as_str();
        let mut poll = self.feed.poll_interval().map(|period| {
            let mut ticker = interval(period.max(MIN_POLL_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.reset(); // Don't fire immediately
            ticker
        });

        info!("[{}] Feed started", label);

        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        debug!("[{}] Feed handle dropped", label);
                        self.teardown().await;
                        break;
                    }
                },

                Some(done) = self.completions.recv() => self.handle_completion(done).await,

                event = next_event(&mut self.events) => self.handle_connection_event(event).await,

                _ = next_tick(&mut poll) => self.poll(),
            }

            self.publish();
        }

        info!("[{}] Feed stopped", label);
    }

    /// Returns false once the feed should stop.
    async fn handle_command(&mut self, command: FeedCommand<F>) -> bool {
        let label = F::NAMESPACE.as_str();
        match command {
            FeedCommand::SetTarget(target) => self.switch_target(target, false).await,
            FeedCommand::Retry => match self.target.clone() {
                Some(target) if self.cache.status().is_error() => {
                    info!("[{}] Retrying initialization", label);
                    self.switch_target(Some(target), true).await;
                }
                _ => debug!("[{}] Retry ignored, feed is {}", label, self.cache.status()),
            },
            FeedCommand::Reconnect => self.reconnect().await,
            FeedCommand::Feed(command) => {
                let feed = self.feed.clone();
                let mut ctx = self.context();
                if let Err(e) = feed.on_command(&mut ctx, command) {
                    warn!("[{}] Command failed: {}", label, e);
                    ctx.notice(e.to_string());
                }
            }
            FeedCommand::Shutdown(ack) => {
                info!("[{}] Shutdown requested", label);
                self.teardown().await;
                self.publish();
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    async fn switch_target(&mut self, target: Option<F::Target>, force: bool) {
        let label = F::NAMESPACE.as_str();
        if !force && self.target == target && !self.cache.status().is_error() {
            debug!("[{}] Target unchanged", label);
            return;
        }

        info!("[{}] Target -> {:?}", label, target);
        self.tasks.renew();

        let feed = self.feed.clone();
        self.cache.with_state(|state| feed.reset(state));
        self.cache.mark_dirty();
        self.cache.set_notice(None);
        self.target = target.clone();

        match target {
            None => {
                self.cache.set_status(FeedStatus::Uninitialized);
                self.release().await;
            }
            Some(target) => {
                self.cache.set_status(FeedStatus::Loading);
                let hint = feed.channel_hint(&target);
                self.set_desired(hint);
                self.start_prepare(target);
            }
        }
    }

    fn start_prepare(&self, target: F::Target) {
        let feed = self.feed.clone();
        let generation = self.tasks.generation;
        self.tasks.spawn(async move {
            let result = feed.prepare(target.clone()).await;
            Completion::Prepared {
                generation,
                target,
                result,
            }
        });
    }

    async fn handle_completion(&mut self, done: Completion<F>) {
        let label = F::NAMESPACE.as_str();
        if done.generation() != self.tasks.generation {
            debug!(
                "[{}] Discarding completion from generation {} (now {})",
                label,
                done.generation(),
                self.tasks.generation
            );
            return;
        }

        let feed = self.feed.clone();
        match done {
            Completion::Prepared { target, result, .. } => match result {
                Ok(prepared) => {
                    let channel = feed.seed(&target, prepared, self.cache.state_mut());
                    self.cache.set_status(FeedStatus::Ready);
                    info!("[{}] Ready on {}", label, channel);
                    self.set_desired(Some(channel));
                    self.ensure_connection();
                }
                Err(e) => {
                    warn!("[{}] Initialization failed: {}", label, e);
                    counter!("channel_client_init_failures_total", "namespace" => label)
                        .increment(1);
                    self.cache.set_status(FeedStatus::Error(e.to_string()));
                    self.release().await;
                }
            },
            Completion::Output { output, .. } => {
                let mut ctx = self.context();
                feed.on_output(&mut ctx, output);
            }
        }
    }

    async fn handle_connection_event(&mut self, event: Option<ConnectionEvent>) {
        let label = F::NAMESPACE.as_str();
        match event {
            Some(ConnectionEvent::State(state)) => {
                debug!("[{}] Connection {}", label, state.as_str());
                self.connection_state = state;
                self.cache.mark_dirty();
                let actions = self.controller.on_connection_state(state);
                self.apply(actions);
            }
            Some(ConnectionEvent::Inbound(event)) => self.dispatch(event),
            None => {
                // Worker exited after exhausting its retry budget.
                info!("[{}] Connection worker exited", label);
                self.events = None;
                self.connection = None;
                self.mark_disconnected();
            }
        }
    }

    fn dispatch(&mut self, event: common::InboundEvent) {
        let label = F::NAMESPACE.as_str();
        let active = self.controller.active_channel();
        let dispatcher = &self.dispatcher;
        let outcome = self
            .cache
            .with_state(|state| dispatcher.dispatch(state, active, event));

        match outcome {
            Ok(Dispatch::Applied(Effect::Updated)) => self.cache.mark_dirty(),
            Ok(Dispatch::Applied(Effect::Notice(message))) => {
                warn!("[{}] Server reported: {}", label, message);
                self.cache.set_notice(Some(message));
            }
            Ok(_) => {}
            Err(e) => warn!("[{}] Failed to apply event: {}", label, e),
        }
    }

    fn poll(&mut self) {
        if !self.cache.status().is_ready() {
            return;
        }
        let feed = self.feed.clone();
        let mut ctx = self.context();
        feed.on_poll(&mut ctx);
    }

    fn set_desired(&mut self, channel: Option<Channel>) {
        match self.controller.set_desired_channel(channel) {
            Ok(actions) => self.apply(actions),
            Err(e) => warn!("[{}] {}", F::NAMESPACE, e),
        }
    }

    /// Emit the join and leave events decided by the controller, in order.
    fn apply(&mut self, actions: Vec<SubscriptionAction>) {
        let label = F::NAMESPACE.as_str();
        for action in actions {
            self.cache.mark_dirty();
            let event = match &action {
                SubscriptionAction::Join(channel) => {
                    info!("[{}] Joining {}", label, channel);
                    counter!("channel_client_joins_total", "namespace" => label).increment(1);
                    self.feed.join_event(channel)
                }
                SubscriptionAction::Leave(channel) => {
                    info!("[{}] Leaving {}", label, channel);
                    counter!("channel_client_leaves_total", "namespace" => label).increment(1);
                    self.feed.leave_event(channel)
                }
            };

            match &self.connection {
                Some(handle) => {
                    if let Err(e) = handle.emit(event) {
                        warn!("[{}] Failed to queue {:?}: {}", label, action, e);
                    }
                }
                None => warn!("[{}] No connection for {:?}", label, action),
            }
        }
    }

    fn ensure_connection(&mut self) {
        if self.connection.is_some() {
            return;
        }
        let (handle, events) = self.manager.open(F::NAMESPACE);
        self.connection = Some(handle);
        self.events = Some(events);
    }

    async fn reconnect(&mut self) {
        let label = F::NAMESPACE.as_str();
        if !self.cache.status().is_ready() {
            debug!("[{}] Reconnect ignored, feed is {}", label, self.cache.status());
            return;
        }
        if let Some(handle) = &self.connection {
            if handle.state() != ConnectionState::Disconnected {
                debug!("[{}] Reconnect ignored, connection is {}", label, handle.state().as_str());
                return;
            }
        }

        info!("[{}] Reconnecting on request", label);
        self.close_connection().await;
        self.ensure_connection();
    }

    /// Leave the active room and close the connection.
    async fn release(&mut self) {
        let actions = self.controller.teardown();
        self.apply(actions);
        self.close_connection().await;
    }

    async fn close_connection(&mut self) {
        self.events = None;
        if let Some(handle) = self.connection.take() {
            handle.close().await;
        }
        self.mark_disconnected();
    }

    fn mark_disconnected(&mut self) {
        if self.connection_state != ConnectionState::Disconnected {
            self.connection_state = ConnectionState::Disconnected;
            self.cache.mark_dirty();
        }
        let actions = self.controller.on_connection_state(ConnectionState::Disconnected);
        self.apply(actions);
    }

    async fn teardown(&mut self) {
        self.tasks.renew();
        self.release().await;
    }

    fn publish(&mut self) {
        if !self.cache.take_dirty() {
            return;
        }
        let view = FeedView {
            status: self.cache.status().clone(),
            connection: self.connection_state,
            channel: self.controller.active_channel().cloned(),
            notice: self.cache.notice().map(str::to_string),
            data: self.feed.snapshot(self.cache.state()),
        };
        self.view_tx.send_replace(Arc::new(view));
    }

    fn context(&mut self) -> FeedContext<'_, F> {
        FeedContext {
            cache: &mut self.cache,
            active: self.controller.active_channel(),
            connection: self.connection.as_ref(),
            tasks: &self.tasks,
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<ConnectionEvent>>) -> Option<ConnectionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
