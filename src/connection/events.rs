//! Link event system
//!
//! Events emitted by the connection manager to the host application.

use std::time::Duration;

use crate::connection::ConnectionState;
use crate::protocol::Message;

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The connection state machine moved to a new state
    StateChanged {
        /// Previous state
        from: ConnectionState,
        /// New state
        to: ConnectionState,
    },

    /// The peripheral finished booting and answered the readiness probe
    PeripheralReady,

    /// A control message not consumed by the protocol core; dispatched
    /// to business logic
    Message(Message),

    /// A reliable message exhausted its retry bound without an ACK
    DeliveryFailed {
        /// Id of the failed message
        message_id: u64,
    },

    /// Battery status reported by the peripheral
    BatteryStatus {
        /// Charge level, 0-100
        level: i64,
        /// Whether the peripheral is charging
        charging: bool,
    },

    /// The peripheral answered a heartbeat ping
    HeartbeatAck,

    /// A reconnection attempt is scheduled
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Backoff delay before the attempt
        delay: Duration,
    },

    /// Reconnection attempts are exhausted; the link is permanently down
    /// until the host starts a fresh connection
    ConnectionFailed,
}

impl LinkEvent {
    /// Check if this is a dispatched business-logic message
    pub fn is_message(&self) -> bool {
        matches!(self, LinkEvent::Message(_))
    }

    /// Check if this event reports the peripheral becoming ready
    pub fn is_peripheral_ready(&self) -> bool {
        matches!(self, LinkEvent::PeripheralReady)
    }

    /// The new state, if this is a state change
    pub fn new_state(&self) -> Option<ConnectionState> {
        match self {
            LinkEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        }
    }
}
