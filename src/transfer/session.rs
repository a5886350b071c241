//! Per-transfer reassembly state

use std::collections::HashMap;

use tokio::time::Instant;

use crate::protocol::TRANSFER_PACKET_CAPACITY;

/// Result of storing one packet into a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Packet stored
    Stored {
        /// Whether the session is now complete
        now_complete: bool,
    },
    /// Index already received; state unchanged
    Duplicate,
    /// Index outside `0..total_packets`; rejected
    OutOfRange,
}

/// Reassembly state for one multi-packet transfer
pub struct TransferSession {
    file_name: String,
    file_size: u32,
    total_packets: u32,
    packets: HashMap<u16, Vec<u8>>,
    announced: bool,
    last_activity: Instant,
}

impl TransferSession {
    /// Create a session for a transfer of `file_size` bytes.
    ///
    /// `announced` distinguishes an explicit pre-announcement from a
    /// session inferred from its first packet.
    pub fn new(file_name: impl Into<String>, file_size: u32, announced: bool) -> Self {
        let total_packets = file_size.div_ceil(TRANSFER_PACKET_CAPACITY as u32);
        Self {
            file_name: file_name.into(),
            file_size,
            total_packets,
            packets: HashMap::new(),
            announced,
            last_activity: Instant::now(),
        }
    }

    /// Transfer file name
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Declared total size in bytes
    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    /// Expected packet count, derived from the declared size and the
    /// fixed per-packet capacity
    pub fn total_packets(&self) -> u32 {
        self.total_packets
    }

    /// Packets received so far
    pub fn received_count(&self) -> u32 {
        self.packets.len() as u32
    }

    /// Whether the session came from an explicit announcement
    pub fn is_announced(&self) -> bool {
        self.announced
    }

    /// Instant of the most recent packet (or creation)
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Store one packet
    pub fn ingest(&mut self, index: u16, data: Vec<u8>) -> IngestOutcome {
        if (index as u32) >= self.total_packets {
            return IngestOutcome::OutOfRange;
        }
        if self.packets.contains_key(&index) {
            return IngestOutcome::Duplicate;
        }
        self.packets.insert(index, data);
        self.last_activity = Instant::now();
        IngestOutcome::Stored {
            now_complete: self.is_complete(),
        }
    }

    /// Whether every expected index has arrived
    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total_packets
    }

    /// Whether `index` is the last expected packet of the transfer
    pub fn is_final_index(&self, index: u16) -> bool {
        self.total_packets > 0 && index as u32 == self.total_packets - 1
    }

    /// Sorted list of indices not yet received
    pub fn missing_indices(&self) -> Vec<u16> {
        let mut missing: Vec<u16> = (0..self.total_packets as u16)
            .filter(|i| !self.packets.contains_key(i))
            .collect();
        missing.sort_unstable();
        missing
    }

    /// Concatenate all packets in index order. Only valid once the
    /// session is complete.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::with_capacity(self.file_size as usize);
        for i in 0..self.total_packets as u16 {
            if let Some(packet) = self.packets.get(&i) {
                out.extend_from_slice(packet);
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_data(index: u16, len: usize) -> Vec<u8> {
        vec![index as u8; len]
    }

    #[test]
    fn test_total_packets_derivation() {
        assert_eq!(TransferSession::new("a", 1000, true).total_packets(), 3);
        assert_eq!(TransferSession::new("a", 1200, true).total_packets(), 3);
        assert_eq!(TransferSession::new("a", 1201, true).total_packets(), 4);
        assert_eq!(TransferSession::new("a", 1, true).total_packets(), 1);
        assert_eq!(TransferSession::new("a", 0, true).total_packets(), 0);
    }

    #[test]
    fn test_any_order_completion() {
        let mut session = TransferSession::new("img.avif", 1000, false);
        assert_eq!(session.total_packets(), 3);

        for &index in &[2u16, 0, 1] {
            let len = if index == 2 { 200 } else { 400 };
            let outcome = session.ingest(index, packet_data(index, len));
            let expected_complete = index == 1;
            assert_eq!(
                outcome,
                IngestOutcome::Stored {
                    now_complete: expected_complete
                }
            );
        }

        let data = session.assemble().unwrap();
        assert_eq!(data.len(), 1000);
        assert!(data[..400].iter().all(|&b| b == 0));
        assert!(data[400..800].iter().all(|&b| b == 1));
        assert!(data[800..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let mut session = TransferSession::new("f", 800, false);
        session.ingest(0, packet_data(0, 400));

        assert_eq!(session.ingest(0, packet_data(0, 400)), IngestOutcome::Duplicate);
        assert_eq!(session.received_count(), 1);
        assert!(!session.is_complete());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut session = TransferSession::new("f", 800, false);
        assert_eq!(session.ingest(2, packet_data(2, 10)), IngestOutcome::OutOfRange);
        assert_eq!(session.ingest(99, packet_data(99, 10)), IngestOutcome::OutOfRange);
        assert_eq!(session.received_count(), 0);
    }

    #[test]
    fn test_missing_indices_sorted() {
        let mut session = TransferSession::new("f", 2000, false);
        assert_eq!(session.total_packets(), 5);

        session.ingest(4, packet_data(4, 100));
        session.ingest(1, packet_data(1, 400));

        assert_eq!(session.missing_indices(), vec![0, 2, 3]);
        assert!(session.assemble().is_none());
    }

    #[test]
    fn test_final_index_detection() {
        let session = TransferSession::new("f", 1000, false);
        assert!(!session.is_final_index(0));
        assert!(!session.is_final_index(1));
        assert!(session.is_final_index(2));

        let empty = TransferSession::new("f", 0, false);
        assert!(!empty.is_final_index(0));
    }
}
