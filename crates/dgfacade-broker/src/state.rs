//! The adapter connection state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection lifecycle of a publisher or subscriber.
///
/// `DISCONNECTED → CONNECTING → CONNECTED`, with `RECONNECTING` entered on
/// failure, `PAUSED` while backpressure or an operator holds the adapter,
/// and `CLOSING → CLOSED` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Initial state; no connection attempted yet.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and operational.
    Connected,
    /// Lost the connection; the supervisor is scheduling reconnects.
    Reconnecting,
    /// Held by backpressure or an operator pause.
    Paused,
    /// Shutdown initiated.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether the adapter accepts no further work.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Paused => "PAUSED",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        write!(f, "{name}")
    }
}
