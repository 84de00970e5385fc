//! Event envelope convention used by collaborating services
//!
//! Services publish JSON payloads of the shape
//! `{"type": ..., "data": ..., "timestamp": ...}`. The connection manager
//! treats payloads as opaque bytes; this type exists so publishers and
//! consumers agree on the shape without each rolling their own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire shape of one published event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Event name, e.g. `ticket:created`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event-specific body, opaque to the transport
    pub data: serde_json::Value,
    /// When the event was produced (ISO-8601)
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    /// Create an envelope stamped with the current time
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Serialize for publishing
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a consumed payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
