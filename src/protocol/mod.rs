//! Protocol module
//!
//! Wire-level protocol types for the glasses link.
//!
//! This module contains:
//! - `Message`: logical control message serialization/deserialization
//! - `frame`: envelope codec and inbound classification
//! - `chunk`: splitting and reassembly of oversized messages

// Module exports
pub mod chunk;
pub mod frame;
pub mod message;

// Re-exports for convenience
pub use frame::{AudioPacket, BulkPacket, Inbound};
pub use message::Message;

/// Envelope start marker ("##")
pub const FRAME_START: [u8; 2] = [0x23, 0x23];

/// Envelope end marker ("$$")
pub const FRAME_END: [u8; 2] = [0x24, 0x24];

/// Envelope overhead: start (2) + type (1) + length (2) + end (2)
pub const FRAME_OVERHEAD: usize = 7;

/// Envelope type code: JSON command payload
pub const TYPE_JSON: u8 = 0x30;

/// Envelope type code: photo transfer packet
pub const TYPE_PHOTO: u8 = 0x31;

/// Envelope type code: video transfer packet
pub const TYPE_VIDEO: u8 = 0x32;

/// Envelope type code: music transfer packet
pub const TYPE_MUSIC: u8 = 0x33;

/// Envelope type code: audio-file transfer packet
pub const TYPE_AUDIO_FILE: u8 = 0x34;

/// Envelope type code: generic data transfer packet
pub const TYPE_DATA: u8 = 0x35;

/// First byte of a streamed audio packet; these arrive outside the
/// envelope format
pub const AUDIO_STREAM_MARKER: u8 = 0xA0;

/// Maximum data bytes per bulk transfer packet
pub const TRANSFER_PACKET_CAPACITY: usize = 400;

/// Check if a type code marks a bulk transfer packet
pub fn is_transfer_type(code: u8) -> bool {
    matches!(
        code,
        TYPE_PHOTO | TYPE_VIDEO | TYPE_MUSIC | TYPE_AUDIO_FILE | TYPE_DATA
    )
}

/// Message type discriminators used by the core protocol
pub mod msg {
    /// Acknowledgment of a reliable message
    pub const ACK: &str = "msg_ack";
    /// One fragment of a chunked message
    pub const CHUNK: &str = "chunked_msg";
    /// Host readiness probe, sent while the peripheral SOC boots
    pub const HOST_READY: &str = "phone_ready";
    /// Peripheral readiness response
    pub const PERIPHERAL_READY: &str = "glasses_ready";
    /// Heartbeat ping
    pub const PING: &str = "ping";
    /// Heartbeat response
    pub const PONG: &str = "pong";
    /// Battery status report from the peripheral
    pub const BATTERY_STATUS: &str = "battery_status";
    /// Battery status request
    pub const BATTERY_REQUEST: &str = "request_battery_state";
    /// Peripheral firmware/version report
    pub const VERSION_INFO: &str = "version_info";
    /// Version report request
    pub const VERSION_REQUEST: &str = "request_version";
    /// Photo transfer pre-announcement from the peripheral
    pub const PHOTO_READY: &str = "ble_photo_ready";
    /// Host confirmation that a photo transfer reassembled completely
    pub const PHOTO_TRANSFER_COMPLETE: &str = "ble_photo_transfer_complete";
    /// Host confirmation that a file transfer reassembled completely
    pub const TRANSFER_COMPLETE: &str = "transfer_complete";
    /// Host request for retransmission after detecting gaps
    pub const REQUEST_MISSING_PACKETS: &str = "request_missing_packets";
    /// Explicit peripheral notice that a transfer timed out
    pub const TRANSFER_TIMEOUT: &str = "transfer_timeout";
    /// Explicit peripheral notice that a transfer failed
    pub const TRANSFER_FAILED: &str = "transfer_failed";
}
