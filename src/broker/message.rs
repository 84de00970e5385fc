//! Delivered messages and their acknowledgment lifecycle
//!
//! A [`Message`] is handed to exactly one handler, which must resolve it
//! by acknowledging or rejecting exactly once. Resolution after the
//! channel was replaced by a reconnect is a no-op: the broker has already
//! discarded that delivery context and will redeliver on its own.

use crate::error::{BrokerError, BrokerResult};
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// One delivery from a consumed queue
pub struct Message {
    payload: Vec<u8>,
    delivery_tag: u64,
    queue: String,
    state: Arc<ResolveState>,
}

impl Message {
    pub(crate) fn new(
        payload: Vec<u8>,
        delivery_tag: u64,
        queue: String,
        epoch: u64,
        current_epoch: Arc<AtomicU64>,
        acker: Option<Acker>,
    ) -> Self {
        let state = Arc::new(ResolveState {
            resolved: AtomicBool::new(false),
            epoch,
            current_epoch,
            acker,
            queue: queue.clone(),
            delivery_tag,
        });
        Self {
            payload,
            delivery_tag,
            queue,
            state,
        }
    }

    /// Raw message bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the message, keeping only the payload
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Broker-assigned delivery tag, unique per channel
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Queue this message was consumed from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Acknowledge this delivery
    pub async fn ack(&self) -> BrokerResult<()> {
        self.state.resolve(Resolution::Ack).await
    }

    /// Reject this delivery, optionally returning it to the queue
    pub async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.state.resolve(Resolution::Nack { requeue }).await
    }

    pub(crate) fn resolver(&self) -> MessageResolver {
        MessageResolver {
            state: self.state.clone(),
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Handle retained by the façade so it can reject a delivery the handler
/// failed on without resolving
pub(crate) struct MessageResolver {
    state: Arc<ResolveState>,
}

impl MessageResolver {
    pub(crate) async fn reject(&self, requeue: bool) -> BrokerResult<()> {
        self.state.resolve(Resolution::Nack { requeue }).await
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.state.resolved.load(Ordering::SeqCst)
    }
}

enum Resolution {
    Ack,
    Nack { requeue: bool },
}

struct ResolveState {
    resolved: AtomicBool,
    /// Channel epoch at delivery time
    epoch: u64,
    /// Live channel epoch owned by the manager
    current_epoch: Arc<AtomicU64>,
    /// Absent when the subscription runs with automatic acknowledgment
    acker: Option<Acker>,
    queue: String,
    delivery_tag: u64,
}

impl ResolveState {
    async fn resolve(&self, resolution: Resolution) -> BrokerResult<()> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            warn!(
                queue = %self.queue,
                delivery_tag = self.delivery_tag,
                "message already resolved, ignoring"
            );
            return Ok(());
        }

        if self.epoch != self.current_epoch.load(Ordering::SeqCst) {
            warn!(
                queue = %self.queue,
                delivery_tag = self.delivery_tag,
                "channel re-established since delivery, broker discarded this context; dropping resolution"
            );
            return Ok(());
        }

        let Some(acker) = &self.acker else {
            debug!(
                queue = %self.queue,
                delivery_tag = self.delivery_tag,
                "delivery was pre-acknowledged, nothing to resolve"
            );
            return Ok(());
        };

        match resolution {
            Resolution::Ack => acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(BrokerError::Protocol),
            Resolution::Nack { requeue } => acker
                .nack(BasicNackOptions {
                    requeue,
                    ..Default::default()
                })
                .await
                .map_err(BrokerError::Protocol),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_message(epoch: u64, current: u64) -> Message {
        Message::new(
            b"payload".to_vec(),
            7,
            "ticket:created".to_string(),
            epoch,
            Arc::new(AtomicU64::new(current)),
            None,
        )
    }

    #[tokio::test]
    async fn test_double_resolution_is_a_noop() {
        let message = test_message(1, 1);

        assert!(message.ack().await.is_ok());
        // Second resolution of any kind is warned and ignored
        assert!(message.nack(true).await.is_ok());
        assert!(message.ack().await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_epoch_resolution_is_a_noop() {
        // Delivered on epoch 1, channel since replaced (epoch 2)
        let message = test_message(1, 2);
        assert!(message.ack().await.is_ok());
    }

    #[tokio::test]
    async fn test_resolver_sees_handler_resolution() {
        let message = test_message(1, 1);
        let resolver = message.resolver();

        assert!(!resolver.is_resolved());
        message.ack().await.unwrap();
        assert!(resolver.is_resolved());

        // Automatic rejection after the handler already resolved is skipped
        assert!(resolver.reject(true).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolver_reject_marks_resolved() {
        let message = test_message(1, 1);
        let resolver = message.resolver();
        drop(message);

        resolver.reject(true).await.unwrap();
        assert!(resolver.is_resolved());
    }

    #[test]
    fn test_message_accessors() {
        let message = test_message(1, 1);
        assert_eq!(message.payload(), b"payload");
        assert_eq!(message.delivery_tag(), 7);
        assert_eq!(message.queue(), "ticket:created");
        assert_eq!(message.into_payload(), b"payload".to_vec());
    }
}
