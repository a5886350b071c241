//! Delivery tracker
//!
//! Remembers every outbound reliable message until the peripheral
//! acknowledges it. A timer re-sends the original frames on each
//! acknowledgment timeout, up to a fixed retry bound; exhausting the
//! bound reports a terminal delivery failure to the host application
//! and never escalates into connection teardown.
//!
//! An ACK for an id that is no longer tracked is logged and ignored —
//! it may be a duplicate, or a race against local timeout cleanup.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::connection::LinkEvent;

/// A tracked message awaiting acknowledgment
struct Pending {
    /// Encoded wire frames; a chunked message re-sends every fragment
    frames: Vec<Vec<u8>>,
    retries: u32,
    timer: JoinHandle<()>,
}

/// Pending-message map with timeout-driven bounded retry
pub struct DeliveryTracker {
    pending: Arc<Mutex<HashMap<u64, Pending>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    max_retries: u32,
}

impl DeliveryTracker {
    /// Create a tracker.
    ///
    /// Re-sent frames go to `outbound` (the rate-limited send queue);
    /// terminal failures surface on `events`.
    pub fn new(
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        events: mpsc::UnboundedSender<LinkEvent>,
        max_retries: u32,
    ) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            outbound,
            events,
            max_retries,
        }
    }

    /// Track a message and arm its acknowledgment timeout.
    ///
    /// `frames` are the exact wire buffers already handed to the send
    /// queue; each timeout re-queues all of them.
    pub async fn track(&self, message_id: u64, frames: Vec<Vec<u8>>, timeout: Duration) {
        let timer = self.spawn_timer(message_id, timeout);
        let entry = Pending {
            frames,
            retries: 0,
            timer,
        };

        let mut pending = self.pending.lock().await;
        if let Some(stale) = pending.insert(message_id, entry) {
            // A collision here means the id generator failed its
            // uniqueness contract; keep the newest tracking state.
            warn!("Message id {} was already tracked, replacing", message_id);
            stale.timer.abort();
        }
        debug!(
            "Tracking message {} for ACK (timeout: {:?})",
            message_id, timeout
        );
    }

    /// Resolve an acknowledgment from the peripheral
    pub async fn acknowledge(&self, message_id: u64) {
        match self.pending.lock().await.remove(&message_id) {
            Some(entry) => {
                entry.timer.abort();
                debug!(
                    "Received ACK for message {} (retries: {})",
                    message_id, entry.retries
                );
            }
            None => {
                debug!("Received ACK for untracked message {}", message_id);
            }
        }
    }

    /// Number of messages currently awaiting acknowledgment
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Cancel every retry timer and drop all tracking state (link
    /// teardown)
    pub async fn purge(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            debug!("Purging {} pending messages", pending.len());
        }
        for (_, entry) in pending.drain() {
            entry.timer.abort();
        }
    }

    fn spawn_timer(&self, message_id: u64, timeout: Duration) -> JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        let outbound = self.outbound.clone();
        let events = self.events.clone();
        let max_retries = self.max_retries;

        tokio::spawn(async move {
            loop {
                sleep(timeout).await;

                let frames = {
                    let mut map = pending.lock().await;
                    match map.get_mut(&message_id) {
                        // Acknowledged while we slept.
                        None => return,
                        Some(entry) if entry.retries >= max_retries => {
                            map.remove(&message_id);
                            warn!(
                                "Message {} failed after {} attempts",
                                message_id, max_retries
                            );
                            let _ = events.send(LinkEvent::DeliveryFailed { message_id });
                            return;
                        }
                        Some(entry) => {
                            entry.retries += 1;
                            debug!(
                                "ACK timeout for message {}, retry {}/{}",
                                message_id, entry.retries, max_retries
                            );
                            entry.frames.clone()
                        }
                    }
                };

                for frame in frames {
                    if outbound.send(frame).is_err() {
                        // Send queue is gone; the connection is tearing
                        // down and purge() will clean up.
                        return;
                    }
                }
            }
        })
    }
}
