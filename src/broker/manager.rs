//! The publish/consume façade and its reconnect supervisor
//!
//! One [`BrokerManager`] owns one logical connection: the physical
//! connection and channel handles, the state machine, and a background
//! supervisor that detects unexpected closes, reconnects with backoff,
//! and replays registered subscriptions before declaring the link
//! healthy again.

use crate::broker::backoff::{BackoffPolicy, RetryState};
use crate::broker::consumers::{
    ConsumeOptions, ConsumerRegistry, MessageHandler, Subscription, SubscriptionId,
};
use crate::broker::events::{BrokerEvent, EventKind, EventNotifier};
use crate::broker::message::Message;
use crate::broker::state::{setup_channels, ConnectionState};
use crate::config::BrokerSection;
use crate::error::{BrokerError, BrokerResult, HandlerError};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// AMQP delivery mode 2: the broker retains the message across restarts
const PERSISTENT: u8 = 2;

/// Reply code sent with graceful channel/connection close
const REPLY_SUCCESS: u16 = 200;

/// Manager of the single logical connection to one broker URL
pub struct BrokerManager {
    inner: Arc<ManagerInner>,
}

#[derive(Clone, Copy, PartialEq)]
enum ConnectPhase {
    /// First-ever connect, driven by a `connect()` caller
    Initial,
    /// Recovery after an unexpected drop, driven by the supervisor
    Reconnect,
}

struct ManagerInner {
    config: BrokerSection,
    amqp_uri: String,
    backoff: BackoffPolicy,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    /// Unexpected-close signals from the connection error callback,
    /// tagged with the epoch of the connection that raised them
    drop_tx: mpsc::UnboundedSender<(u64, String)>,
    drop_rx: StdMutex<Option<mpsc::UnboundedReceiver<(u64, String)>>>,
    connection: Mutex<Option<Connection>>,
    channel: Mutex<Option<Channel>>,
    /// Bumped whenever the channel is invalidated or replaced; stale
    /// deliveries compare against it when resolved
    epoch: Arc<AtomicU64>,
    registry: ConsumerRegistry,
    notifier: EventNotifier,
    /// Serializes first-connect owners; concurrent callers share the
    /// in-flight attempt instead of opening a second connection
    connect_gate: Mutex<()>,
    attempt_generation: AtomicU64,
    last_error: StdMutex<Option<String>>,
    closing: AtomicBool,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl BrokerManager {
    /// Create a manager for the given broker. No network activity happens
    /// until `connect()`.
    pub fn new(config: BrokerSection) -> BrokerResult<Self> {
        config.validate()?;
        let amqp_uri = config.amqp_url()?;
        let backoff = BackoffPolicy::from_section(&config);
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) = setup_channels();
        let (drop_tx, drop_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                amqp_uri,
                backoff,
                state_tx,
                state_rx,
                shutdown_tx,
                shutdown_rx,
                drop_tx,
                drop_rx: StdMutex::new(Some(drop_rx)),
                connection: Mutex::new(None),
                channel: Mutex::new(None),
                epoch: Arc::new(AtomicU64::new(0)),
                registry: ConsumerRegistry::new(),
                notifier: EventNotifier::new(),
                connect_gate: Mutex::new(()),
                attempt_generation: AtomicU64::new(0),
                last_error: StdMutex::new(None),
                closing: AtomicBool::new(false),
                supervisor: StdMutex::new(None),
            }),
        })
    }

    /// Broker URL this manager is keyed by
    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    /// Current connection state; never blocks
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Whether the link is up right now; never blocks
    pub fn is_connected(&self) -> bool {
        self.inner.state().can_publish()
    }

    /// Register a lifecycle observer
    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&BrokerEvent) + Send + Sync + 'static,
    {
        self.inner.notifier.on(kind, callback);
    }

    /// Register a lifecycle observer removed after its first invocation
    pub fn once<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&BrokerEvent) + Send + Sync + 'static,
    {
        self.inner.notifier.once(kind, callback);
    }

    /// Establish the connection, retrying with backoff until it succeeds,
    /// the retry budget runs out, or the manager is closed.
    ///
    /// Idempotent: returns immediately when already connected. Concurrent
    /// callers share one physical attempt and observe the same outcome.
    pub async fn connect(&self) -> BrokerResult<()> {
        let inner = &self.inner;
        if inner.shutting_down() {
            return Err(BrokerError::ShuttingDown);
        }
        let state = inner.state();
        if state.can_publish() {
            debug!(url = %inner.config.url, "connect called while already connected");
            return Ok(());
        }
        if state.is_shutdown() {
            return Err(BrokerError::ShuttingDown);
        }
        if state.attempt_in_flight() {
            return inner.await_attempt_outcome().await;
        }

        let generation_before = inner.attempt_generation.load(Ordering::SeqCst);
        let _guard = inner.connect_gate.lock().await;

        // Re-check everything after acquiring the gate: the previous
        // owner may have finished while we waited.
        if inner.state().can_publish() {
            return Ok(());
        }
        if inner.shutting_down() {
            return Err(BrokerError::ShuttingDown);
        }
        if inner.attempt_generation.load(Ordering::SeqCst) != generation_before {
            // We waited behind an attempt that failed; share its outcome
            // rather than opening a second one.
            return Err(BrokerError::connection_failed(inner.last_error_message()));
        }

        inner.set_state(ConnectionState::Connecting);
        ManagerInner::ensure_supervisor(inner);
        let result = ManagerInner::establish(inner, ConnectPhase::Initial).await;
        inner.attempt_generation.fetch_add(1, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!(url = %inner.config.url, "broker connection established");
                inner.notifier.emit(&BrokerEvent::Connected);
                Ok(())
            }
            Err(error) => {
                inner.record_last_error(&error);
                inner.set_state(ConnectionState::Idle);
                Err(error)
            }
        }
    }

    /// Publish a persistent message to a durable queue, declaring the
    /// queue if it does not exist yet
    pub async fn publish(&self, queue: &str, payload: &[u8]) -> BrokerResult<()> {
        let channel = self.inner.acquire_channel().await?;
        self.inner.declare_durable_queue(&channel, queue).await?;
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;
        debug!(queue, bytes = payload.len(), "published persistent message");
        Ok(())
    }

    /// Register a long-lived consumer on a durable queue
    ///
    /// The subscription is recorded for replay after reconnects and stays
    /// active until cancelled or the manager closes.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> BrokerResult<SubscriptionId> {
        let inner = &self.inner;
        let channel = inner.acquire_channel().await?;
        let subscription = Arc::new(Subscription::new(queue, handler, options));
        let id = inner.registry.register(subscription.clone()).await;
        if let Err(error) = ManagerInner::bind_subscription(inner, &channel, &subscription).await {
            inner.registry.cancel(id).await;
            return Err(error);
        }
        Ok(id)
    }

    /// Cancel a subscription; unknown ids are a warned no-op
    pub async fn cancel(&self, id: SubscriptionId) -> BrokerResult<()> {
        let Some(subscription) = self.inner.registry.cancel(id).await else {
            warn!(subscription = %id, "cancel for unknown subscription, ignoring");
            return Ok(());
        };
        if let Some(tag) = subscription.take_consumer_tag() {
            let channel = self.inner.channel.lock().await.clone();
            if let Some(channel) = channel {
                if let Err(error) = channel
                    .basic_cancel(&tag, BasicCancelOptions::default())
                    .await
                {
                    warn!(
                        queue = %subscription.queue,
                        consumer_tag = %tag,
                        error = %error,
                        "failed to cancel active consumer"
                    );
                }
            }
        }
        info!(queue = %subscription.queue, subscription = %id, "subscription cancelled");
        Ok(())
    }

    /// Acknowledge a delivered message (see [`Message::ack`])
    pub async fn ack(&self, message: &Message) -> BrokerResult<()> {
        message.ack().await
    }

    /// Reject a delivered message (see [`Message::nack`])
    pub async fn nack(&self, message: &Message, requeue: bool) -> BrokerResult<()> {
        message.nack(requeue).await
    }

    /// Graceful shutdown: stop accepting work, unblock waiting callers,
    /// release the channel then the connection. Idempotent.
    pub async fn close(&self) -> BrokerResult<()> {
        let inner = &self.inner;
        if inner.closing.swap(true, Ordering::SeqCst) {
            debug!(url = %inner.config.url, "close called again, already shut down");
            return Ok(());
        }
        info!(url = %inner.config.url, "closing broker connection");
        inner.set_state(ConnectionState::Closing);
        let _ = inner.shutdown_tx.send(true);

        // Channel first, then connection. Failures are logged and
        // swallowed since the process is going away regardless.
        if let Some(channel) = inner.channel.lock().await.take() {
            if let Err(error) = channel.close(REPLY_SUCCESS, "shutting down").await {
                warn!(error = %error, "error closing channel");
            }
        }
        if let Some(connection) = inner.connection.lock().await.take() {
            if let Err(error) = connection.close(REPLY_SUCCESS, "shutting down").await {
                warn!(error = %error, "error closing connection");
            }
        }

        let handle = inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("reconnect supervisor shut down cleanly"),
                Ok(Err(join_error)) if !join_error.is_cancelled() => {
                    warn!(error = %join_error, "reconnect supervisor ended with error");
                }
                Err(_) => {
                    warn!("reconnect supervisor did not stop in time, aborting");
                    abort.abort();
                }
                _ => {}
            }
        }

        inner.force_state(ConnectionState::Closed);
        inner.notifier.emit(&BrokerEvent::Closed);
        info!(url = %inner.config.url, "broker connection closed");
        Ok(())
    }
}

impl Drop for BrokerManager {
    fn drop(&mut self) {
        // Best effort: stop background tasks. Graceful release needs an
        // explicit close() since Drop cannot await.
        let _ = self.inner.shutdown_tx.send(true);
        if let Some(handle) = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for BrokerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerManager")
            .field("url", &self.inner.config.url)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl ManagerInner {
    fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    fn shutting_down(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || *self.shutdown_rx.borrow()
    }

    /// Transition the state machine; transitions out of shutdown states
    /// are suppressed so a racing reconnect cannot resurrect a closed
    /// manager
    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_modify(|state| {
            if state.is_shutdown() && !next.is_shutdown() {
                return;
            }
            *state = next;
        });
    }

    fn force_state(&self, next: ConnectionState) {
        self.state_tx.send_replace(next);
    }

    fn record_last_error(&self, error: &BrokerError) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }

    fn last_error_message(&self) -> String {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "connect attempt failed".to_string())
    }

    /// Spawn the reconnect supervisor once per manager
    fn ensure_supervisor(this: &Arc<Self>) {
        let mut slot = this
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let Some(drop_rx) = this
            .drop_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let inner = Arc::clone(this);
        *slot = Some(tokio::spawn(async move { inner.supervise(drop_rx).await }));
    }

    /// Background task: wait for unexpected closes and recover from them
    async fn supervise(self: Arc<Self>, mut drop_rx: mpsc::UnboundedReceiver<(u64, String)>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        debug!(url = %self.config.url, "reconnect supervisor started");
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                signal = drop_rx.recv() => {
                    let Some((epoch, reason)) = signal else { break };
                    if epoch != self.epoch.load(Ordering::SeqCst) {
                        debug!(epoch, "ignoring close signal from a superseded connection");
                        continue;
                    }
                    if self.shutting_down() {
                        break;
                    }
                    warn!(url = %self.config.url, reason = %reason, "broker connection lost, reconnecting");
                    self.invalidate_handles().await;
                    self.notifier
                        .emit(&BrokerEvent::Error(format!("connection lost: {reason}")));
                    match Self::establish(&self, ConnectPhase::Reconnect).await {
                        Ok(()) => {
                            info!(url = %self.config.url, "broker connection restored");
                            self.notifier.emit(&BrokerEvent::Reconnected);
                        }
                        Err(BrokerError::ShuttingDown) => break,
                        Err(error) => {
                            error!(url = %self.config.url, error = %error, "reconnect failed permanently");
                            self.notifier.emit(&BrokerEvent::Error(error.to_string()));
                            self.set_state(ConnectionState::Closed);
                            break;
                        }
                    }
                }
            }
        }
        debug!(url = %self.config.url, "reconnect supervisor stopped");
    }

    /// Retry loop shared by the first connect and every reconnect
    async fn establish(this: &Arc<Self>, phase: ConnectPhase) -> BrokerResult<()> {
        let mut retry = RetryState::new();
        loop {
            if this.shutting_down() {
                return Err(BrokerError::ShuttingDown);
            }
            if phase == ConnectPhase::Reconnect {
                this.set_state(ConnectionState::Reconnecting(retry.attempts() + 1));
            }
            match this.try_connect_once().await {
                Ok((connection, channel)) => {
                    this.install(connection, channel.clone()).await;
                    if phase == ConnectPhase::Reconnect {
                        // Replay before the state settles so observers of
                        // Connected see a fully restored manager
                        Self::replay_subscriptions(this, &channel).await;
                    }
                    this.set_state(ConnectionState::Connected);
                    if retry.attempts() > 0 {
                        info!(
                            attempts = retry.attempts() + 1,
                            url = %this.config.url,
                            "broker connection established after retries"
                        );
                    }
                    return Ok(());
                }
                Err(error) => {
                    let delay = retry.record_failure(&this.backoff);
                    warn!(
                        attempt = retry.attempts(),
                        error = %error,
                        "broker connect attempt failed"
                    );
                    let max_retries = this.config.max_retries;
                    if max_retries != 0 && retry.attempts() >= max_retries {
                        let attempts = retry.attempts();
                        error!(attempts, url = %this.config.url, "connect retry budget exhausted");
                        this.notifier.emit(&BrokerEvent::Error(format!(
                            "gave up connecting to {} after {attempts} attempts",
                            this.config.url
                        )));
                        return Err(BrokerError::ConnectionExhausted { attempts });
                    }
                    if !this.interruptible_sleep(delay).await {
                        return Err(BrokerError::ShuttingDown);
                    }
                }
            }
        }
    }

    /// One bounded handshake attempt
    async fn try_connect_once(&self) -> BrokerResult<(Connection, Channel)> {
        let connecting = Connection::connect(&self.amqp_uri, ConnectionProperties::default());
        let connection = match tokio::time::timeout(self.config.connect_timeout(), connecting).await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(error)) => return Err(BrokerError::connection_failed(error.to_string())),
            Err(_) => {
                return Err(BrokerError::connection_failed(format!(
                    "handshake timed out after {}ms",
                    self.config.connect_timeout_ms
                )))
            }
        };
        let channel = connection
            .create_channel()
            .await
            .map_err(|error| BrokerError::connection_failed(error.to_string()))?;
        Ok((connection, channel))
    }

    /// Store fresh handles and hook the unexpected-close callback
    async fn install(&self, connection: Connection, channel: Channel) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let drop_tx = self.drop_tx.clone();
        connection.on_error(move |error| {
            let _ = drop_tx.send((epoch, error.to_string()));
        });
        *self.connection.lock().await = Some(connection);
        *self.channel.lock().await = Some(channel);
        debug!(epoch, "channel handles installed");
    }

    /// Drop the handles of a dead connection so no caller can use them;
    /// the epoch bump turns any outstanding ack/nack into a warned no-op
    async fn invalidate_handles(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *self.channel.lock().await = None;
        *self.connection.lock().await = None;
    }

    /// Wait for the in-flight attempt another caller owns
    async fn await_attempt_outcome(&self) -> BrokerResult<()> {
        let mut state_rx = self.state_rx.clone();
        loop {
            let state = state_rx.borrow().clone();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closing | ConnectionState::Closed => {
                    return Err(BrokerError::ShuttingDown)
                }
                ConnectionState::Idle => {
                    // The owner finished with a terminal failure
                    return Err(BrokerError::connection_failed(self.last_error_message()));
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(BrokerError::ShuttingDown);
            }
        }
    }

    /// Current channel, waiting out an in-flight (re)connect when
    /// blocking is enabled
    async fn acquire_channel(&self) -> BrokerResult<Channel> {
        let mut state_rx = self.state_rx.clone();
        loop {
            let state = state_rx.borrow().clone();
            match state {
                ConnectionState::Connected => {
                    if let Some(channel) = self.channel.lock().await.clone() {
                        return Ok(channel);
                    }
                    // Connected but the slot is mid-swap; wait for the
                    // next transition
                }
                ConnectionState::Closing | ConnectionState::Closed => {
                    return Err(BrokerError::ShuttingDown)
                }
                ConnectionState::Idle => return Err(BrokerError::NotConnected { state }),
                ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {
                    if !self.config.block_on_disconnect {
                        return Err(BrokerError::NotConnected { state });
                    }
                }
            }
            if state_rx.changed().await.is_err() {
                return Err(BrokerError::ShuttingDown);
            }
        }
    }

    async fn declare_durable_queue(&self, channel: &Channel, queue: &str) -> BrokerResult<()> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Declare, consume and spawn the delivery loop for one subscription
    async fn bind_subscription(
        this: &Arc<Self>,
        channel: &Channel,
        subscription: &Arc<Subscription>,
    ) -> BrokerResult<()> {
        this.declare_durable_queue(channel, &subscription.queue)
            .await?;
        let consume_options = BasicConsumeOptions {
            no_ack: !subscription.options.manual_ack,
            ..Default::default()
        };
        let consumer = channel
            .basic_consume(
                &subscription.queue,
                "",
                consume_options,
                FieldTable::default(),
            )
            .await?;
        let tag = consumer.tag().to_string();
        subscription.set_consumer_tag(tag.clone());
        info!(queue = %subscription.queue, consumer_tag = %tag, "consuming from queue");

        let inner = Arc::clone(this);
        let subscription = Arc::clone(subscription);
        let epoch = this.epoch.load(Ordering::SeqCst);
        tokio::spawn(async move {
            inner.drive_deliveries(consumer, subscription, epoch).await;
        });
        Ok(())
    }

    /// Re-issue every registered subscription on a fresh channel, in
    /// original registration order. Partial recovery beats total failure:
    /// a replay error is reported and the loop continues.
    async fn replay_subscriptions(this: &Arc<Self>, channel: &Channel) {
        let subscriptions = this.registry.snapshot().await;
        if subscriptions.is_empty() {
            return;
        }
        info!(count = subscriptions.len(), "replaying consumer subscriptions");
        for (id, subscription) in subscriptions {
            if let Err(replay_error) = Self::bind_subscription(this, channel, &subscription).await {
                error!(
                    queue = %subscription.queue,
                    subscription = %id,
                    error = %replay_error,
                    "failed to replay subscription"
                );
                this.notifier.emit(&BrokerEvent::Error(format!(
                    "replay failed for queue {}: {replay_error}",
                    subscription.queue
                )));
            }
        }
    }

    /// Sequentially drain one consumer stream, dispatching each delivery
    /// to the subscription's handler
    async fn drive_deliveries(
        self: Arc<Self>,
        mut consumer: Consumer,
        subscription: Arc<Subscription>,
        epoch: u64,
    ) {
        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => self.dispatch_delivery(delivery, &subscription, epoch).await,
                Err(stream_error) => {
                    warn!(
                        queue = %subscription.queue,
                        error = %stream_error,
                        "consumer stream failed; subscription will be replayed after reconnect"
                    );
                    break;
                }
            }
        }
        debug!(queue = %subscription.queue, epoch, "consumer stream ended");
    }

    async fn dispatch_delivery(
        &self,
        delivery: Delivery,
        subscription: &Arc<Subscription>,
        epoch: u64,
    ) {
        let manual_ack = subscription.options.manual_ack;
        let Delivery {
            delivery_tag,
            data,
            acker,
            ..
        } = delivery;
        let message = Message::new(
            data,
            delivery_tag,
            subscription.queue.clone(),
            epoch,
            Arc::clone(&self.epoch),
            manual_ack.then_some(acker),
        );
        let resolver = message.resolver();

        match subscription.handler.handle(message).await {
            Ok(()) => {
                if manual_ack && !resolver.is_resolved() {
                    debug!(
                        queue = %subscription.queue,
                        delivery_tag,
                        "handler returned without resolving the delivery"
                    );
                }
            }
            Err(handler_error) => {
                if !manual_ack {
                    // Pre-acknowledged by the broker; nothing to reject
                    warn!(
                        queue = %subscription.queue,
                        delivery_tag,
                        error = %handler_error,
                        "handler failed on a pre-acknowledged delivery"
                    );
                    return;
                }
                let requeue = matches!(handler_error, HandlerError::Failed(_));
                warn!(
                    queue = %subscription.queue,
                    delivery_tag,
                    error = %handler_error,
                    requeue,
                    "handler failed, rejecting delivery"
                );
                if let Err(reject_error) = resolver.reject(requeue).await {
                    warn!(
                        queue = %subscription.queue,
                        delivery_tag,
                        error = %reject_error,
                        "failed to reject delivery"
                    );
                }
                self.notifier.emit(&BrokerEvent::Error(format!(
                    "handler failure on {}: {handler_error}",
                    subscription.queue
                )));
            }
        }
    }

    /// Sleep that wakes early on shutdown; returns false when interrupted
    async fn interruptible_sleep(&self, delay: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Explicit registry of managers keyed by broker URL
///
/// Owned by application startup code and injected into collaborators,
/// preserving one-connection-per-URL semantics without ambient globals.
#[derive(Default)]
pub struct ManagerRegistry {
    managers: StdMutex<HashMap<String, Arc<BrokerManager>>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager for the given broker, creating it on first use
    pub fn get_or_create(&self, config: BrokerSection) -> BrokerResult<Arc<BrokerManager>> {
        let mut managers = self
            .managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(manager) = managers.get(&config.url) {
            return Ok(Arc::clone(manager));
        }
        let manager = Arc::new(BrokerManager::new(config.clone())?);
        managers.insert(config.url, Arc::clone(&manager));
        Ok(manager)
    }

    /// Existing manager for a URL, if any
    pub fn get(&self, url: &str) -> Option<Arc<BrokerManager>> {
        self.managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }

    /// Close every managed connection; used at service shutdown
    pub async fn close_all(&self) {
        let managers: Vec<Arc<BrokerManager>> = {
            let mut map = self
                .managers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            map.drain().map(|(_, manager)| manager).collect()
        };
        for manager in managers {
            if let Err(error) = manager.close().await {
                warn!(url = %manager.url(), error = %error, "error closing managed connection");
            }
        }
    }
}

impl std::fmt::Debug for ManagerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let urls: Vec<String> = self
            .managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("ManagerRegistry")
            .field("urls", &urls)
            .finish()
    }
}
