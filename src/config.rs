//! Link configuration
//!
//! Timing and limit tunables for the connection lifecycle, reliable
//! delivery, and transfer reassembly. Defaults match the peripheral
//! firmware's expectations; override individual fields for tests or
//! unusual radio conditions.

use std::time::Duration;

use crate::protocol::chunk;

/// Configuration for a glasses link connection
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// How long a radio-level connect attempt may take before the
    /// connection cycle is torn down and retried
    pub connect_timeout: Duration,

    /// Interval between "host ready" probes while waiting for the
    /// peripheral's SOC to finish booting
    pub readiness_probe_interval: Duration,

    /// Interval between heartbeat pings once fully connected
    pub heartbeat_interval: Duration,

    /// Every Nth heartbeat additionally requests a battery status refresh
    pub battery_every_n_heartbeats: u32,

    /// Base acknowledgment timeout for a single-frame reliable message
    pub ack_timeout: Duration,

    /// Additional acknowledgment allowance per chunk fragment
    pub ack_per_fragment: Duration,

    /// Fixed safety margin added to the acknowledgment timeout of any
    /// chunked message
    pub ack_chunk_margin: Duration,

    /// Maximum resend attempts before a reliable message is reported as
    /// a terminal delivery failure
    pub max_retry_attempts: u32,

    /// First reconnection delay; doubles on each failed attempt
    pub base_reconnect_delay: Duration,

    /// Reconnection delay cap
    pub max_reconnect_delay: Duration,

    /// Reconnection attempts before reporting permanent disconnection
    pub max_reconnect_attempts: u32,

    /// Minimum gap between consecutive radio writes; the link cannot
    /// sustain back-to-back characteristic writes
    pub min_send_interval: Duration,

    /// Pause before the send queue resumes after a failed write
    pub write_failure_backoff: Duration,

    /// Pause between queueing successive fragments of a chunked message
    pub chunk_pacing: Duration,

    /// Idle bound after which abandoned chunk sets and stalled transfer
    /// sessions are evicted
    pub session_idle_timeout: Duration,

    /// Sweep interval for idle-eviction of chunk sets and transfers
    pub sweep_interval: Duration,

    /// MTU requested from the transport after the link comes up
    pub preferred_mtu: u16,

    /// Minimum peripheral build number that supports acknowledgments;
    /// older firmware gets fire-and-forget delivery
    pub min_ack_build: i64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            readiness_probe_interval: Duration::from_millis(2500),
            heartbeat_interval: Duration::from_secs(30),
            battery_every_n_heartbeats: 10,
            ack_timeout: Duration::from_secs(2),
            ack_per_fragment: Duration::from_millis(500),
            ack_chunk_margin: Duration::from_secs(1),
            max_retry_attempts: 3,
            base_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            min_send_interval: Duration::from_millis(160),
            write_failure_backoff: Duration::from_millis(500),
            chunk_pacing: Duration::from_millis(40),
            session_idle_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            preferred_mtu: 512,
            min_ack_build: 5,
        }
    }
}

impl LinkConfig {
    /// Reconnection delay for the given 0-based attempt number:
    /// `min(base * 2^attempt, cap)`
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_reconnect_delay.as_millis() as u64;
        let cap_ms = self.max_reconnect_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }

    /// Acknowledgment timeout for a message whose fully wrapped frame is
    /// `wrapped_len` bytes.
    ///
    /// A chunked message cannot be acknowledged until every fragment has
    /// crossed the rate-limited link and the peripheral has reassembled
    /// it, so the timeout grows with the estimated fragment count.
    pub fn ack_timeout_for(&self, wrapped_len: usize) -> Duration {
        if !chunk::needs_chunking(wrapped_len) {
            return self.ack_timeout;
        }
        let fragments = wrapped_len.div_ceil(chunk::CHUNK_DATA_CAPACITY) as u32;
        self.ack_timeout + self.ack_per_fragment * fragments + self.ack_chunk_margin
    }
}
