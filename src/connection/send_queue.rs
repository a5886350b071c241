//! Rate-limited send queue
//!
//! The radio cannot sustain back-to-back characteristic writes, so a
//! queue decouples "message ready to send" from "radio ready to accept
//! the next write". A drain task re-arms itself after each write —
//! waiting out the minimum inter-write gap, or a longer backoff after a
//! failed write — rather than running on a fixed tick.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

use crate::connection::Transport;

/// Handle to the per-connection outbound queue
pub struct SendQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    drain_task: JoinHandle<()>,
}

impl SendQueue {
    /// Start the drain task over the given transport
    pub fn start(
        transport: Arc<dyn Transport>,
        min_send_interval: Duration,
        write_failure_backoff: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let drain_task = tokio::spawn(Self::drain(
            transport,
            rx,
            min_send_interval,
            write_failure_backoff,
        ));
        Self { tx, drain_task }
    }

    /// Sender half, for components that enqueue frames directly (retry
    /// timers)
    pub fn sender(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        self.tx.clone()
    }

    /// Queue one wire frame; returns false once the queue is shut down
    pub fn enqueue(&self, frame: Vec<u8>) -> bool {
        self.tx.send(frame).is_ok()
    }

    /// Stop draining and drop any queued frames
    pub fn shutdown(&self) {
        self.drain_task.abort();
    }

    async fn drain(
        transport: Arc<dyn Transport>,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
        min_send_interval: Duration,
        write_failure_backoff: Duration,
    ) {
        let mut next_write_at: Option<Instant> = None;

        while let Some(frame) = rx.recv().await {
            if let Some(at) = next_write_at {
                let now = Instant::now();
                if at > now {
                    sleep(at - now).await;
                }
            }

            match transport.write(&frame).await {
                Ok(()) => {
                    debug!("Wrote {} bytes to the radio", frame.len());
                    next_write_at = Some(Instant::now() + min_send_interval);
                }
                Err(e) => {
                    // The frame is dropped; reliable messages come back
                    // through their retry timers.
                    warn!("Radio write of {} bytes failed: {}", frame.len(), e);
                    next_write_at = Some(Instant::now() + write_failure_backoff);
                }
            }
        }

        debug!("Send queue closed");
    }
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        self.drain_task.abort();
    }
}
