//! Consumer subscriptions and their replay registry
//!
//! Every active subscription is recorded here so the manager can re-issue
//! the broker-level consume calls, in original registration order, after
//! a reconnect. Consumer tags are broker-assigned per registration and
//! are not preserved across reconnects; the logical subscription is.

use crate::broker::message::Message;
use crate::error::HandlerError;
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// Callback invoked for every delivery on a consumed queue
///
/// Implemented for any `Fn(Message) -> Future` closure, so plain async
/// functions work directly.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Per-subscription delivery options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOptions {
    /// When true (the default) the handler must ack/nack each delivery;
    /// when false the broker pre-acknowledges and handler failures are
    /// logged only
    pub manual_ack: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self { manual_ack: true }
    }
}

/// Identifier for one registered subscription, stable across reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One logical subscription: queue, handler and options, replayed
/// verbatim after each reconnect
pub struct Subscription {
    pub(crate) queue: String,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) options: ConsumeOptions,
    /// Broker-assigned tag of the currently active consumer, if any
    consumer_tag: Mutex<Option<String>>,
}

impl Subscription {
    pub(crate) fn new(
        queue: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Self {
        Self {
            queue: queue.into(),
            handler,
            options,
            consumer_tag: Mutex::new(None),
        }
    }

    pub(crate) fn set_consumer_tag(&self, tag: String) {
        *self
            .consumer_tag
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tag);
    }

    pub(crate) fn take_consumer_tag(&self) -> Option<String> {
        self.consumer_tag
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .field("options", &self.options)
            .finish()
    }
}

/// Ordered record of active subscriptions
#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    subscriptions: AsyncMutex<Vec<(SubscriptionId, Arc<Subscription>)>>,
}

impl ConsumerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a subscription; returns its id
    pub(crate) async fn register(&self, subscription: Arc<Subscription>) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.subscriptions.lock().await.push((id, subscription));
        id
    }

    /// Remove a subscription; returns it if it was still registered
    pub(crate) async fn cancel(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let mut subscriptions = self.subscriptions.lock().await;
        let position = subscriptions.iter().position(|(sub_id, _)| *sub_id == id)?;
        Some(subscriptions.remove(position).1)
    }

    /// All active subscriptions in registration order
    pub(crate) async fn snapshot(&self) -> Vec<(SubscriptionId, Arc<Subscription>)> {
        self.subscriptions.lock().await.clone()
    }

    pub(crate) async fn len(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}
