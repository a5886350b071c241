//! Connection state machine
//!
//! The link progresses through five explicit states; every transition
//! goes through [`ConnectionState::can_transition`], replacing scattered
//! boolean checks with one validated graph:
//!
//! ```text
//! Disconnected -> Connecting -> LinkEstablished
//!     -> AwaitingPeripheralReady -> Connected
//! ```
//!
//! Any state may fall back to `Disconnected` on radio failure or
//! teardown.

use std::fmt;

/// Lifecycle state of the peripheral link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No radio link; idle or waiting for a reconnection attempt
    Disconnected,
    /// A radio-level connect attempt is in flight
    Connecting,
    /// The radio link is up; characteristics verified, notifications on
    LinkEstablished,
    /// Probing until the peripheral's SOC reports it finished booting
    AwaitingPeripheralReady,
    /// Fully operational; heartbeats flowing
    Connected,
}

impl ConnectionState {
    /// Whether the state machine permits moving to `next`
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, LinkEstablished)
                | (LinkEstablished, AwaitingPeripheralReady)
                | (AwaitingPeripheralReady, Connected)
                | (Connecting, Disconnected)
                | (LinkEstablished, Disconnected)
                | (AwaitingPeripheralReady, Disconnected)
                | (Connected, Disconnected)
        )
    }

    /// Whether the radio link is up (any state past `Connecting`)
    pub fn is_link_up(self) -> bool {
        matches!(
            self,
            ConnectionState::LinkEstablished
                | ConnectionState::AwaitingPeripheralReady
                | ConnectionState::Connected
        )
    }

    /// Whether the link is fully operational
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::LinkEstablished => "link-established",
            ConnectionState::AwaitingPeripheralReady => "awaiting-peripheral-ready",
            ConnectionState::Connected => "connected",
        };
        write!(f, "{name}")
    }
}
