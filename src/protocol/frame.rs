//! Frame codec
//!
//! Converts logical messages to and from the byte buffers written to the
//! radio characteristic, and classifies inbound buffers.
//!
//! ## Wire format
//!
//! Control commands and bulk packets share one envelope:
//!
//! ```text
//! ┌──────┬──────┬───────────┬─────────┬──────┐
//! │ 0x23 │ type │ len       │ payload │ 0x24 │
//! │ 0x23 │ (1B) │ (2B, LE)  │ (len B) │ 0x24 │
//! └──────┴──────┴───────────┴─────────┴──────┘
//! ```
//!
//! For type `0x30` the payload is the command wrapper
//! `{"C": "<serialized message>"}` with an optional `"W": 1` wake flag
//! understood by the peripheral's low-power wake logic. For the bulk
//! types (`0x31..=0x35`) the payload is a transfer packet:
//!
//! ```text
//! packSize (2B BE) + packIndex (2B BE) + fileSize (4B BE)
//! + fileName (16B, NUL padded) + flags (2B BE)
//! + data (packSize B) + verify (1B, byte sum of data)
//! ```
//!
//! Streamed audio arrives outside the envelope entirely: a `0xA0`
//! marker byte, a wrapping sequence byte, then the compressed frame.

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{LinkError, Result};
use crate::protocol::{
    self, Message, AUDIO_STREAM_MARKER, FRAME_END, FRAME_OVERHEAD, FRAME_START,
    TRANSFER_PACKET_CAPACITY, TYPE_JSON,
};

/// Command wrapper field carrying the serialized message
const FIELD_CONTENT: &str = "C";

/// Command wrapper field carrying the wake flag
const FIELD_WAKE: &str = "W";

/// Fixed bulk-packet header: packSize + packIndex + fileSize + fileName + flags
const BULK_HEADER_LEN: usize = 2 + 2 + 4 + 16 + 2;

/// Bulk-packet overhead inside the envelope payload: header + verify byte
const BULK_PAYLOAD_OVERHEAD: usize = BULK_HEADER_LEN + 1;

/// Maximum bytes of a transfer packet file name
const FILE_NAME_LEN: usize = 16;

/// A classified inbound buffer
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A control message (enveloped JSON or bare JSON)
    Control(Message),
    /// One packet of a bulk file/photo transfer
    Bulk(BulkPacket),
    /// One streamed audio packet
    Audio(AudioPacket),
    /// Valid-looking data that matches no protocol class; log and discard
    Unrecognized,
}

/// One packet of a multi-packet bulk transfer
#[derive(Debug, Clone, PartialEq)]
pub struct BulkPacket {
    /// Transfer class type code (`TYPE_PHOTO`, `TYPE_VIDEO`, ...)
    pub transfer_type: u8,
    /// 0-based packet index
    pub pack_index: u16,
    /// Total transfer size in bytes, declared on every packet
    pub file_size: u32,
    /// Transfer file name (identifier), at most 16 bytes
    pub file_name: String,
    /// Transfer flags (opaque to this layer)
    pub flags: u16,
    /// Packet data
    pub data: Vec<u8>,
}

impl BulkPacket {
    /// Transfer identifier: the file name without its extension.
    ///
    /// Photo pre-announcements carry the bare image id while the packets
    /// carry `<id>.avif` or `<id>.jpg`; both must land in one session.
    pub fn transfer_id(&self) -> &str {
        match self.file_name.rfind('.') {
            Some(dot) if dot > 0 => &self.file_name[..dot],
            _ => &self.file_name,
        }
    }
}

/// One streamed audio packet
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPacket {
    /// Stream marker byte (`0xA0`)
    pub stream: u8,
    /// Wrapping sequence number
    pub sequence: u8,
    /// Compressed audio frame
    pub payload: Vec<u8>,
}

/// Pack a raw payload into the wire envelope
pub fn pack_envelope(payload: &[u8], type_code: u8) -> Result<Vec<u8>> {
    if payload.len() > u16::MAX as usize {
        return Err(LinkError::frame(format!(
            "payload of {} bytes exceeds envelope capacity",
            payload.len()
        )));
    }
    let mut out = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    out.extend_from_slice(&FRAME_START);
    out.push(type_code);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&FRAME_END);
    Ok(out)
}

/// Encode a logical message into the command envelope written to the
/// radio.
///
/// The message is serialized, wrapped under the `C` field (plus the
/// wake flag when requested), and packed into a `TYPE_JSON` envelope.
pub fn encode_command(message: &Message, wake: bool) -> Result<Vec<u8>> {
    let mut wrapper = Map::new();
    wrapper.insert(FIELD_CONTENT.to_string(), Value::String(message.to_json()));
    if wake {
        wrapper.insert(FIELD_WAKE.to_string(), Value::from(1));
    }
    let payload = Value::Object(wrapper).to_string();
    pack_envelope(payload.as_bytes(), TYPE_JSON)
}

/// Pack one bulk transfer packet.
///
/// Used when the host pushes a file to the peripheral, and by tests to
/// fabricate inbound transfer traffic.
pub fn pack_transfer_packet(
    data: &[u8],
    pack_index: u16,
    file_size: u32,
    file_name: &str,
    flags: u16,
    type_code: u8,
) -> Result<Vec<u8>> {
    if !protocol::is_transfer_type(type_code) {
        return Err(LinkError::invalid_packet(format!(
            "0x{type_code:02X} is not a transfer type code"
        )));
    }
    if data.is_empty() || data.len() > TRANSFER_PACKET_CAPACITY {
        return Err(LinkError::invalid_packet(format!(
            "transfer packet data must be 1..={TRANSFER_PACKET_CAPACITY} bytes, got {}",
            data.len()
        )));
    }
    if file_name.len() > FILE_NAME_LEN {
        return Err(LinkError::invalid_packet(format!(
            "file name '{file_name}' exceeds {FILE_NAME_LEN} bytes"
        )));
    }

    let mut payload = Vec::with_capacity(BULK_PAYLOAD_OVERHEAD + data.len());
    payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
    payload.extend_from_slice(&pack_index.to_be_bytes());
    payload.extend_from_slice(&file_size.to_be_bytes());
    let mut name = [0u8; FILE_NAME_LEN];
    name[..file_name.len()].copy_from_slice(file_name.as_bytes());
    payload.extend_from_slice(&name);
    payload.extend_from_slice(&flags.to_be_bytes());
    payload.extend_from_slice(data);
    payload.push(checksum(data));

    pack_envelope(&payload, type_code)
}

/// Classify an inbound buffer.
///
/// Returns `Err(LinkError::Frame)` for a malformed envelope (truncated,
/// bad length, missing end marker); the receive loop logs and discards
/// the buffer without dropping the connection. Data that is well formed
/// but matches no protocol class comes back as
/// [`Inbound::Unrecognized`].
pub fn classify(data: &[u8]) -> Result<Inbound> {
    if data.starts_with(&FRAME_START) {
        let (type_code, payload) = unwrap_envelope(data)?;
        if type_code == TYPE_JSON {
            return decode_control_payload(payload).map(Inbound::Control);
        }
        if protocol::is_transfer_type(type_code) {
            return Ok(match parse_bulk_payload(type_code, payload) {
                Some(packet) => Inbound::Bulk(packet),
                None => Inbound::Unrecognized,
            });
        }
        warn!("Unknown envelope type code 0x{:02X}", type_code);
        return Ok(Inbound::Unrecognized);
    }

    if data.first() == Some(&AUDIO_STREAM_MARKER) {
        if data.len() < 2 {
            return Err(LinkError::frame("audio packet missing sequence byte"));
        }
        return Ok(Inbound::Audio(AudioPacket {
            stream: data[0],
            sequence: data[1],
            payload: data[2..].to_vec(),
        }));
    }

    // Some firmware revisions send bare JSON without the envelope.
    if data.first() == Some(&b'{') {
        let text = std::str::from_utf8(data)
            .map_err(|_| LinkError::frame("bare JSON payload is not valid UTF-8"))?;
        return decode_control_text(text).map(Inbound::Control);
    }

    Ok(Inbound::Unrecognized)
}

/// Validate the envelope and return `(type_code, payload)`
fn unwrap_envelope(data: &[u8]) -> Result<(u8, &[u8])> {
    if data.len() < FRAME_OVERHEAD {
        return Err(LinkError::frame(format!(
            "envelope truncated: {} bytes",
            data.len()
        )));
    }
    let type_code = data[2];
    let len = u16::from_le_bytes([data[3], data[4]]) as usize;
    let total = len + FRAME_OVERHEAD;
    if data.len() < total {
        return Err(LinkError::frame(format!(
            "envelope declares {len} payload bytes but only {} are present",
            data.len() - FRAME_OVERHEAD
        )));
    }
    if data[5 + len..7 + len] != FRAME_END {
        return Err(LinkError::frame("end marker not found where expected"));
    }
    Ok((type_code, &data[5..5 + len]))
}

/// Decode a control payload: UTF-8, JSON parse, unwrap the `C` wrapper
fn decode_control_payload(payload: &[u8]) -> Result<Message> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| LinkError::frame("control payload is not valid UTF-8"))?;
    decode_control_text(text)
}

fn decode_control_text(text: &str) -> Result<Message> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| LinkError::frame(format!("control payload is not JSON: {e}")))?;

    // The command wrapper carries the real message as a string under C.
    // Native MCU traffic also uses C but as a bare command code; only
    // recurse when the inner content is itself a JSON object.
    if let Some(inner) = value.get(FIELD_CONTENT).and_then(Value::as_str) {
        if let Ok(inner_value) = serde_json::from_str::<Value>(inner) {
            if inner_value.is_object() {
                return Message::from_value(inner_value);
            }
        }
    }

    Message::from_value(value)
}

/// Parse a bulk transfer payload; `None` when its internal fields do
/// not validate (wrong size, bad checksum)
fn parse_bulk_payload(type_code: u8, payload: &[u8]) -> Option<BulkPacket> {
    if payload.len() < BULK_PAYLOAD_OVERHEAD {
        warn!(
            "Bulk payload too short: {} bytes (type 0x{:02X})",
            payload.len(),
            type_code
        );
        return None;
    }

    let pack_size = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if payload.len() != BULK_PAYLOAD_OVERHEAD + pack_size {
        warn!(
            "Bulk payload length {} does not match declared pack size {}",
            payload.len(),
            pack_size
        );
        return None;
    }

    let pack_index = u16::from_be_bytes([payload[2], payload[3]]);
    let file_size = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let name_bytes = &payload[8..8 + FILE_NAME_LEN];
    let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(FILE_NAME_LEN);
    let file_name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();
    let flags = u16::from_be_bytes([payload[24], payload[25]]);
    let data = payload[BULK_HEADER_LEN..BULK_HEADER_LEN + pack_size].to_vec();
    let verify = payload[BULK_HEADER_LEN + pack_size];

    if checksum(&data) != verify {
        warn!(
            "Bulk packet checksum mismatch for '{}' index {}: expected 0x{:02X}, got 0x{:02X}",
            file_name,
            pack_index,
            checksum(&data),
            verify
        );
        return None;
    }

    Some(BulkPacket {
        transfer_type: type_code,
        pack_index,
        file_size,
        file_name,
        flags,
        data,
    })
}

/// Byte-sum verification code over packet data
fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u32, |acc, &b| acc + b as u32) as u8
}
