//! Transfer session manager
//!
//! Owns the reassembly sessions for every in-flight bulk transfer.
//! Sessions are created by an explicit photo pre-announcement or
//! inferred from a first packet; a fresh announcement for an id that
//! already has a session discards the old partial state (the protocol's
//! restart semantics).
//!
//! Gap recovery: when the final expected index arrives but packets are
//! missing, exactly one retransmission request is issued, naming the
//! absent indices. The peripheral answers by resending the whole
//! transfer from scratch — the wire protocol has no selective
//! retransmission — and duplicate indices from the resend are absorbed
//! idempotently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::protocol::{msg, BulkPacket, Message};
use crate::transfer::session::{IngestOutcome, TransferSession};

/// A fully reassembled transfer handed to the completion sink
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    /// Transfer identifier (file name without extension)
    pub transfer_id: String,
    /// Full file name as carried by the packets
    pub file_name: String,
    /// Transfer class type code
    pub transfer_type: u8,
    /// Originating request id, when the transfer was pre-announced
    pub request_id: Option<String>,
    /// Reassembled bytes
    pub data: Vec<u8>,
}

/// Consumer of completed transfers (upload pipeline, storage, ...)
#[async_trait]
pub trait TransferSink: Send + Sync {
    /// Called once per completed transfer, after reassembly
    async fn on_transfer_complete(&self, transfer: CompletedTransfer);
}

/// Session lifecycle and gap recovery for bulk transfers
pub struct TransferManager {
    sessions: HashMap<String, TransferSession>,
    /// Pre-announced photo transfers: transfer id -> originating request id
    photo_requests: HashMap<String, String>,
    sink: Option<Arc<dyn TransferSink>>,
    /// Outbound control messages (confirmations, retransmit requests)
    control_tx: mpsc::UnboundedSender<Message>,
    idle_timeout: Duration,
}

impl TransferManager {
    /// Create a manager; control messages it produces go to `control_tx`
    pub fn new(control_tx: mpsc::UnboundedSender<Message>, idle_timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            photo_requests: HashMap::new(),
            sink: None,
            control_tx,
            idle_timeout,
        }
    }

    /// Register the completion sink
    pub fn set_sink(&mut self, sink: Arc<dyn TransferSink>) {
        self.sink = Some(sink);
    }

    /// Record a photo pre-announcement from the peripheral.
    ///
    /// The packets that follow carry only the image id in their file
    /// name; this mapping restores the originating request id when the
    /// transfer completes.
    pub fn register_photo_request(
        &mut self,
        transfer_id: impl Into<String>,
        request_id: impl Into<String>,
    ) {
        let transfer_id = transfer_id.into();
        let request_id = request_id.into();
        debug!(
            "Tracking photo transfer {} for request {}",
            transfer_id, request_id
        );
        self.photo_requests.insert(transfer_id, request_id);
    }

    /// Create or reset a session from an explicit announcement.
    ///
    /// An announcement for an id with an existing session is a restart:
    /// prior partial state is discarded.
    pub fn announce(&mut self, transfer_id: &str, file_name: &str, file_size: u32) {
        if let Some(old) = self.sessions.insert(
            transfer_id.to_string(),
            TransferSession::new(file_name, file_size, true),
        ) {
            warn!(
                "Restarting transfer {} ({} of {} packets discarded)",
                transfer_id,
                old.received_count(),
                old.total_packets()
            );
        } else {
            info!(
                "Announced transfer {}: {} bytes, {} packets",
                transfer_id,
                file_size,
                file_size.div_ceil(crate::protocol::TRANSFER_PACKET_CAPACITY as u32)
            );
        }
    }

    /// Store one inbound bulk packet and drive completion / recovery
    pub async fn ingest(&mut self, packet: BulkPacket) {
        let transfer_id = packet.transfer_id().to_string();
        let index = packet.pack_index;
        let transfer_type = packet.transfer_type;

        let (outcome, is_final, total_packets) = {
            let session = self.sessions.entry(transfer_id.clone()).or_insert_with(|| {
                info!(
                    "Started transfer {}: {} bytes ({})",
                    transfer_id, packet.file_size, packet.file_name
                );
                TransferSession::new(packet.file_name.clone(), packet.file_size, false)
            });
            let outcome = session.ingest(index, packet.data);
            (outcome, session.is_final_index(index), session.total_packets())
        };

        match outcome {
            IngestOutcome::OutOfRange => {
                warn!(
                    "Dropping packet {} outside of transfer {} ({} packets)",
                    index, transfer_id, total_packets
                );
            }
            IngestOutcome::Duplicate => {
                debug!("Duplicate packet {} for transfer {}", index, transfer_id);
            }
            IngestOutcome::Stored { now_complete } => {
                debug!(
                    "Transfer {} packet {}/{} stored",
                    transfer_id,
                    index,
                    total_packets.saturating_sub(1)
                );
                if now_complete {
                    self.finish(&transfer_id, transfer_type).await;
                } else if is_final {
                    // The peripheral sent its last packet but gaps
                    // remain: ask for a retransmission.
                    self.request_retransmission(&transfer_id);
                }
            }
        }
    }

    /// Remove a session after an explicit peripheral timeout/failure
    /// notice
    pub fn abort(&mut self, transfer_id: &str, reason: &str) {
        if let Some(session) = self.sessions.remove(transfer_id) {
            warn!(
                "Transfer {} aborted ({}): {}/{} packets discarded",
                transfer_id,
                reason,
                session.received_count(),
                session.total_packets()
            );
        }
        self.photo_requests.remove(transfer_id);
    }

    /// Evict sessions with no progress inside the idle bound
    pub fn evict_idle(&mut self) {
        let idle_timeout = self.idle_timeout;
        let before = self.sessions.len();
        self.sessions.retain(|transfer_id, session| {
            let keep = session.last_activity().elapsed() <= idle_timeout;
            if !keep {
                warn!(
                    "Evicting stalled transfer {} ({}/{} packets)",
                    transfer_id,
                    session.received_count(),
                    session.total_packets()
                );
            }
            keep
        });
        if before != self.sessions.len() {
            debug!("Evicted {} stalled transfers", before - self.sessions.len());
        }
    }

    /// Drop all sessions and correlations (link teardown)
    pub fn clear(&mut self) {
        if !self.sessions.is_empty() {
            debug!("Clearing {} in-flight transfers", self.sessions.len());
        }
        self.sessions.clear();
        self.photo_requests.clear();
    }

    /// Number of in-flight sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    async fn finish(&mut self, transfer_id: &str, transfer_type: u8) {
        let Some(session) = self.sessions.remove(transfer_id) else {
            return;
        };
        let Some(data) = session.assemble() else {
            // is_complete() held when we were called; this is unreachable
            // in practice but must not panic the receive loop.
            warn!("Transfer {} vanished during assembly", transfer_id);
            return;
        };

        let request_id = self.photo_requests.remove(transfer_id);
        info!(
            "Transfer {} complete: {} bytes in {} packets",
            transfer_id,
            data.len(),
            session.total_packets()
        );

        let confirmation = match &request_id {
            Some(request_id) => Message::new(
                msg::PHOTO_TRANSFER_COMPLETE,
                json!({
                    "requestId": request_id,
                    "bleImgId": transfer_id,
                    "success": true,
                }),
            ),
            None => Message::new(
                msg::TRANSFER_COMPLETE,
                json!({
                    "fileName": session.file_name(),
                    "success": true,
                }),
            ),
        };
        let _ = self.control_tx.send(confirmation);

        if let Some(sink) = &self.sink {
            sink.on_transfer_complete(CompletedTransfer {
                transfer_id: transfer_id.to_string(),
                file_name: session.file_name().to_string(),
                transfer_type,
                request_id,
                data,
            })
            .await;
        } else {
            warn!(
                "Transfer {} completed but no sink is registered",
                transfer_id
            );
        }
    }

    fn request_retransmission(&self, transfer_id: &str) {
        let Some(session) = self.sessions.get(transfer_id) else {
            return;
        };
        let missing = session.missing_indices();
        warn!(
            "Transfer {} reached its final packet with {} gaps: {:?}",
            transfer_id,
            missing.len(),
            missing
        );
        let request = Message::new(
            msg::REQUEST_MISSING_PACKETS,
            json!({
                "fileName": session.file_name(),
                "missingPackets": missing,
            }),
        );
        let _ = self.control_tx.send(request);
    }
}
