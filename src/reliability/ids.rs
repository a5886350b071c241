//! Message id generation
//!
//! Reliable messages are stamped with ids that must stay unique across
//! the lifetime of a connection even under rapid issuance, and must
//! always be positive (the peripheral treats the value as a signed
//! 64-bit number). The construction mixes a monotonic counter, the
//! current time, and a cryptographically seeded random value, then
//! clears the sign bit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generator for positive, collision-resistant message ids
pub struct MessageIdGenerator {
    counter: AtomicU64,
    salt: u64,
}

impl MessageIdGenerator {
    /// Create a generator with a fresh random salt
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
            salt: rand::random(),
        }
    }

    /// Produce the next message id: a positive 63-bit value
    pub fn next(&self) -> u64 {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let random: u64 = rand::random();
        let id = (unix_millis() ^ self.salt ^ random ^ (counter << 32)) & (i64::MAX as u64);
        // Zero is reserved for "no id".
        if id == 0 {
            1
        } else {
            id
        }
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
