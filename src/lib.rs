//! Eventline - resilient RabbitMQ connection management
//!
//! Services in an event-driven deployment exchange durable events over a
//! message broker. This crate owns the hard part of that: one logical
//! connection per broker URL that survives broker restarts and network
//! partitions without operator intervention, exposes publish/consume
//! primitives to unrelated service code, and restores consumer
//! subscriptions automatically after a reconnect.
//!
//! # Overview
//!
//! - [`BrokerManager`]: the public surface (connect, publish, consume,
//!   ack/nack, close, status query), one instance per broker URL
//! - [`ManagerRegistry`]: owned by startup code, hands out one manager
//!   per URL
//! - [`BackoffPolicy`]: capped exponential retry delays with ±10% jitter
//! - [`BrokerEvent`]: typed lifecycle signals for health checks and logs
//! - [`EventEnvelope`]: the `{type, data, timestamp}` payload convention
//!   collaborating services publish
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use eventline::{BrokerManager, BrokerSection, ConsumeOptions, HandlerError, Message};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerSection::new("amqp://localhost:5672");
//!     let manager = BrokerManager::new(config)?;
//!     manager.connect().await?;
//!
//!     manager
//!         .consume(
//!             "ticket:created",
//!             Arc::new(|message: Message| async move {
//!                 println!("received {} bytes", message.payload().len());
//!                 message.ack().await.map_err(|e| HandlerError::failed(e.to_string()))
//!             }),
//!             ConsumeOptions::default(),
//!         )
//!         .await?;
//!
//!     manager.publish("ticket:created", br#"{"type":"ticket:created"}"#).await?;
//!     manager.close().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;

pub use broker::backoff::{BackoffPolicy, RetryState};
pub use broker::consumers::{ConsumeOptions, MessageHandler, SubscriptionId};
pub use broker::events::{BrokerEvent, EventKind, EventNotifier};
pub use broker::manager::{BrokerManager, ManagerRegistry};
pub use broker::message::Message;
pub use broker::state::ConnectionState;
pub use config::{BrokerSection, ConfigError};
pub use envelope::EventEnvelope;
pub use error::{BrokerError, BrokerResult, HandlerError};
