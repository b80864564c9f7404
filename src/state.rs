//! Connection state as observed by the client adapter.
//!
//! Published through a `tokio::sync::watch` channel, so observers always see
//! the latest state and never a backlog:
//!
//! ```ignore
//! let mut state_rx = client.subscribe_state();
//! while state_rx.changed().await.is_ok() {
//!     if let ConnectionState::Disconnected(reason) = &*state_rx.borrow() {
//!         warn!("broker link lost: {}", reason);
//!     }
//! }
//! ```

use std::fmt;

/// Lifecycle of one client connection.
///
/// `Idle` -> `Connecting` -> `Connected` -> `Disconnected`. There is no
/// automatic reconnect; a new connect starts over at `Connecting`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connect has been issued yet.
    #[default]
    Idle,

    /// CONNECT sent, waiting for CONNACK.
    Connecting,

    /// CONNACK accepted; requests are flowing.
    Connected,

    /// The connection ended. The reason is the broker refusal, the network
    /// error, or `"Disconnected by client"` after a requested disconnect.
    Disconnected(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected(_) => "Disconnected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected(reason) => write!(f, "Disconnected ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}
