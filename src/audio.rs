//! Audio packet sequencer
//!
//! A continuous stream of small fixed-size compressed audio packets
//! arrives out-of-band from control traffic. Each packet carries a
//! 1-byte stream marker and a wrapping 1-byte sequence number. The
//! sequencer validates sequence continuity per stream — logging
//! discontinuities, never dropping data — and forwards every payload to
//! the registered decode sink, plus a playback sink when local playback
//! is enabled. No buffering or reordering happens here; packets are
//! consumed in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::protocol::AudioPacket;

/// Consumer of raw compressed audio frames
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Called once per packet, in arrival order
    async fn on_audio(&self, payload: &[u8]);
}

/// Per-stream sequence validation and sink dispatch
pub struct AudioSequencer {
    /// Last-seen sequence number per stream marker
    last_sequence: HashMap<u8, u8>,
    decode_sink: Option<Arc<dyn AudioSink>>,
    playback_sink: Option<Arc<dyn AudioSink>>,
    playback_enabled: bool,
    packets_received: u64,
    discontinuities: u64,
}

impl AudioSequencer {
    /// Create a sequencer with no sinks registered
    pub fn new() -> Self {
        Self {
            last_sequence: HashMap::new(),
            decode_sink: None,
            playback_sink: None,
            playback_enabled: false,
            packets_received: 0,
            discontinuities: 0,
        }
    }

    /// Register the decode sink
    pub fn set_decode_sink(&mut self, sink: Arc<dyn AudioSink>) {
        self.decode_sink = Some(sink);
    }

    /// Register the local playback sink
    pub fn set_playback_sink(&mut self, sink: Arc<dyn AudioSink>) {
        self.playback_sink = Some(sink);
    }

    /// Toggle forwarding to the playback sink
    pub fn set_playback_enabled(&mut self, enabled: bool) {
        self.playback_enabled = enabled;
    }

    /// Total packets ingested
    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    /// Sequence discontinuities observed
    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }

    /// Reset per-stream sequence tracking (link teardown)
    pub fn reset(&mut self) {
        self.last_sequence.clear();
    }

    /// Validate and forward one packet
    pub async fn ingest(&mut self, packet: AudioPacket) {
        self.packets_received += 1;

        if let Some(&last) = self.last_sequence.get(&packet.stream) {
            let expected = last.wrapping_add(1);
            if packet.sequence != expected {
                self.discontinuities += 1;
                warn!(
                    "Audio stream 0x{:02X} discontinuity: expected seq {}, got {} (lost ~{})",
                    packet.stream,
                    expected,
                    packet.sequence,
                    packet.sequence.wrapping_sub(expected)
                );
            }
        } else {
            debug!(
                "Audio stream 0x{:02X} started at seq {}",
                packet.stream, packet.sequence
            );
        }
        self.last_sequence.insert(packet.stream, packet.sequence);

        if let Some(sink) = &self.decode_sink {
            sink.on_audio(&packet.payload).await;
        } else {
            warn!("Audio packet received but no decode sink is registered");
        }

        if self.playback_enabled {
            if let Some(sink) = &self.playback_sink {
                sink.on_audio(&packet.payload).await;
            }
        }
    }
}

impl Default for AudioSequencer {
    fn default() -> Self {
        Self::new()
    }
}
