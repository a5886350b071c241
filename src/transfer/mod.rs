//! Bulk transfer reassembly
//!
//! Multi-packet file and photo transfers from the peripheral arrive as
//! binary bulk packets over the shared characteristic. This module
//! tracks each announced transfer, detects completion and gaps, and
//! drives full-retransmission recovery.
//!
//! This module contains:
//! - [`TransferSession`](session::TransferSession) - per-transfer sparse packet map
//! - [`TransferManager`](manager::TransferManager) - session lifecycle, gap recovery,
//!   completion dispatch

pub mod manager;
pub mod session;

pub use manager::{CompletedTransfer, TransferManager, TransferSink};
pub use session::{IngestOutcome, TransferSession};
