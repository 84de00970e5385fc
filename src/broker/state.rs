//! Connection state for the broker link
//!
//! The manager's supervisor is the only writer; everyone else observes
//! the state through a watch channel and the predicates here.

use std::fmt;
use tokio::sync::watch;

/// Lifecycle of the single logical broker connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No connect has been requested yet (or the last one failed terminally)
    Idle,
    /// First connection attempt in progress
    Connecting,
    /// Handshake complete, channel usable
    Connected,
    /// Unexpected drop detected; retry loop running (attempt count)
    Reconnecting(u32),
    /// Graceful shutdown in progress
    Closing,
    /// Shut down; all reconnect attempts are suppressed
    Closed,
}

impl ConnectionState {
    /// Whether publish/consume operations may use the channel right now
    pub fn can_publish(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether a (re)connect attempt is currently in flight
    pub fn attempt_in_flight(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting(_)
        )
    }

    /// Whether shutdown has begun; terminal states accept no new work
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting(attempt) => {
                write!(f, "reconnecting (attempt {attempt})")
            }
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Create the state and shutdown channel pairs used by one manager
#[allow(clippy::type_complexity)]
pub(crate) fn setup_channels() -> (
    (
        watch::Sender<ConnectionState>,
        watch::Receiver<ConnectionState>,
    ),
    (watch::Sender<bool>, watch::Receiver<bool>),
) {
    let state_channels = watch::channel(ConnectionState::Idle);
    let shutdown_channels = watch::channel(false);
    (state_channels, shutdown_channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connected_can_publish() {
        assert!(ConnectionState::Connected.can_publish());
        assert!(!ConnectionState::Idle.can_publish());
        assert!(!ConnectionState::Connecting.can_publish());
        assert!(!ConnectionState::Reconnecting(1).can_publish());
        assert!(!ConnectionState::Closing.can_publish());
        assert!(!ConnectionState::Closed.can_publish());
    }

    #[test]
    fn test_attempt_in_flight() {
        assert!(ConnectionState::Connecting.attempt_in_flight());
        assert!(ConnectionState::Reconnecting(4).attempt_in_flight());
        assert!(!ConnectionState::Connected.attempt_in_flight());
        assert!(!ConnectionState::Idle.attempt_in_flight());
    }

    #[test]
    fn test_shutdown_states() {
        assert!(ConnectionState::Closing.is_shutdown());
        assert!(ConnectionState::Closed.is_shutdown());
        assert!(!ConnectionState::Reconnecting(1).is_shutdown());
    }

    #[test]
    fn test_display_includes_attempt() {
        assert_eq!(
            ConnectionState::Reconnecting(3).to_string(),
            "reconnecting (attempt 3)"
        );
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }

    #[test]
    fn test_setup_channels_initial_values() {
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) = setup_channels();

        assert_eq!(*state_rx.borrow(), ConnectionState::Idle);
        assert!(!(*shutdown_rx.borrow()));

        state_tx.send(ConnectionState::Connecting).unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);

        shutdown_tx.send(true).unwrap();
        assert!(*shutdown_rx.borrow());
    }
}
