//! Reliable delivery
//!
//! At-least-once delivery for control messages: unique message ids,
//! acknowledgment correlation, and bounded timeout-driven retry.
//!
//! This module contains:
//! - [`MessageIdGenerator`](ids::MessageIdGenerator) - collision-resistant positive message ids
//! - [`DeliveryTracker`](tracker::DeliveryTracker) - pending-message map with retry timers

pub mod ids;
pub mod tracker;

pub use ids::MessageIdGenerator;
pub use tracker::DeliveryTracker;
