//! Message chunking
//!
//! Oversized control messages are split at the JSON layer into bounded
//! fragments, because the radio link only carries small buffers. The
//! decision is made on the *fully wrapped* frame size — the envelope
//! and command wrapper count against the link budget, not just the
//! message body.
//!
//! Fragments share a chunk id derived from the message id and the
//! current time, carry a 0-based index and the declared total, and the
//! final fragment alone repeats the original message id so that an
//! acknowledgment is only meaningful once the whole message arrived.
//!
//! The [`ChunkAssembler`] on the receive side accumulates fragments by
//! chunk id and hands back the reassembled payload when the set
//! completes. Abandoned sets (a lost final fragment) are evicted after
//! an idle bound rather than accumulating forever.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::json;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{LinkError, Result};
use crate::protocol::{msg, Message};

/// Wrapped-frame size above which a message must be chunked.
///
/// Tuned to the smallest guaranteed negotiated MTU minus protocol and
/// envelope overhead.
pub const CHUNK_THRESHOLD: usize = 400;

/// Maximum payload bytes carried by one fragment. Smaller than the
/// threshold to leave headroom for the fragment's own wrapper fields.
pub const CHUNK_DATA_CAPACITY: usize = 300;

/// Idle bound after which an incomplete chunk set is discarded
pub const CHUNK_SET_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum concurrently tracked chunk sets
pub const MAX_CHUNK_SETS: usize = 10;

/// Check whether a fully wrapped frame exceeds the single-write budget
pub fn needs_chunking(wrapped_len: usize) -> bool {
    wrapped_len > CHUNK_THRESHOLD
}

/// Split a serialized message into chunk fragments.
///
/// `message_id` is repeated on the final fragment when present, for
/// acknowledgment correlation. `now_millis` feeds the chunk id, which
/// must differ between retries of the same message.
///
/// Splitting an empty payload is a caller contract violation.
pub fn split(payload: &str, message_id: Option<u64>, now_millis: u64) -> Result<Vec<Message>> {
    if payload.is_empty() {
        return Err(LinkError::chunking("cannot chunk an empty payload"));
    }

    let chunk_id = format!(
        "chunk_{}_{}",
        message_id.map(|id| id.to_string()).unwrap_or_else(|| "0".to_string()),
        now_millis
    );

    // Cut on char boundaries so each fragment stays valid UTF-8; for
    // ASCII payloads this is exactly the fixed capacity.
    let mut slices = Vec::new();
    let mut start = 0;
    while start < payload.len() {
        let mut end = (start + CHUNK_DATA_CAPACITY).min(payload.len());
        while !payload.is_char_boundary(end) {
            end -= 1;
        }
        slices.push(&payload[start..end]);
        start = end;
    }

    let total = slices.len();
    debug!(
        "Splitting {} byte payload into {} fragments ({})",
        payload.len(),
        total,
        chunk_id
    );

    let fragments = slices
        .into_iter()
        .enumerate()
        .map(|(index, data)| {
            let mut fragment = Message::new(
                msg::CHUNK,
                json!({
                    "chunkId": chunk_id,
                    "chunk": index as u32,
                    "total": total as u32,
                    "data": data,
                }),
            );
            if index == total - 1 {
                if let Some(id) = message_id {
                    fragment.set_message_id(id);
                }
            }
            fragment
        })
        .collect();

    Ok(fragments)
}

/// Fragment fields carried by a `chunked_msg` message
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChunkInfo {
    /// Shared id of the chunk set
    #[serde(rename = "chunkId")]
    pub chunk_id: String,
    /// 0-based fragment index
    #[serde(rename = "chunk")]
    pub index: u32,
    /// Declared fragment count
    pub total: u32,
    /// Payload slice
    pub data: String,
    /// Original message id, final fragment only
    #[serde(rename = "mId", default)]
    pub message_id: Option<u64>,
}

impl ChunkInfo {
    /// Extract chunk fields from a received message.
    ///
    /// Returns `None` when the message is not a chunk; an error when it
    /// claims to be one but is missing fields.
    pub fn from_message(message: &Message) -> Result<Option<Self>> {
        if !message.is_type(msg::CHUNK) {
            return Ok(None);
        }
        let info = serde_json::from_value(message.to_value())
            .map_err(|e| LinkError::invalid_packet(format!("malformed chunk: {e}")))?;
        Ok(Some(info))
    }
}

/// One partially received chunk set
struct ChunkSet {
    total: u32,
    fragments: HashMap<u32, String>,
    created_at: Instant,
    last_activity: Instant,
}

impl ChunkSet {
    fn new(total: u32) -> Self {
        let now = Instant::now();
        Self {
            total,
            fragments: HashMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.fragments.len() as u32 == self.total
    }

    fn reassemble(&self) -> String {
        let mut out = String::new();
        for i in 0..self.total {
            if let Some(data) = self.fragments.get(&i) {
                out.push_str(data);
            }
        }
        out
    }
}

/// Accumulates chunk fragments and reassembles completed sets
pub struct ChunkAssembler {
    sets: HashMap<String, ChunkSet>,
    max_sets: usize,
    idle_timeout: Duration,
}

impl ChunkAssembler {
    /// Create an assembler with the default limits
    pub fn new() -> Self {
        Self::with_limits(MAX_CHUNK_SETS, CHUNK_SET_IDLE_TIMEOUT)
    }

    /// Create an assembler with explicit limits
    pub fn with_limits(max_sets: usize, idle_timeout: Duration) -> Self {
        Self {
            sets: HashMap::new(),
            max_sets,
            idle_timeout,
        }
    }

    /// Add a fragment.
    ///
    /// Returns the reassembled payload once every index `0..total` of
    /// the set is present. Duplicate indices overwrite idempotently;
    /// out-of-range indices are dropped with a warning.
    pub fn add(&mut self, info: ChunkInfo) -> Option<String> {
        self.evict_idle();

        if info.index >= info.total {
            warn!(
                "Dropping chunk with index {} outside of total {} ({})",
                info.index, info.total, info.chunk_id
            );
            return None;
        }

        if self.sets.len() >= self.max_sets && !self.sets.contains_key(&info.chunk_id) {
            warn!("Chunk set capacity reached, evicting oldest");
            self.evict_oldest();
        }

        let set = self
            .sets
            .entry(info.chunk_id.clone())
            .or_insert_with(|| ChunkSet::new(info.total));

        if set.fragments.contains_key(&info.index) {
            debug!("Duplicate chunk {} for set {}", info.index, info.chunk_id);
        }
        set.fragments.insert(info.index, info.data);
        set.last_activity = Instant::now();

        if set.is_complete() {
            debug!(
                "Chunk set {} complete with {} fragments",
                info.chunk_id, set.total
            );
            let payload = set.reassemble();
            self.sets.remove(&info.chunk_id);
            return Some(payload);
        }

        None
    }

    /// Discard every tracked set (link teardown)
    pub fn clear(&mut self) {
        if !self.sets.is_empty() {
            debug!("Clearing {} incomplete chunk sets", self.sets.len());
        }
        self.sets.clear();
    }

    /// Number of incomplete sets currently tracked
    pub fn active_sets(&self) -> usize {
        self.sets.len()
    }

    /// Drop sets that have seen no fragment within the idle bound
    pub fn evict_idle(&mut self) {
        let idle_timeout = self.idle_timeout;
        self.sets.retain(|chunk_id, set| {
            let keep = set.last_activity.elapsed() <= idle_timeout;
            if !keep {
                warn!(
                    "Evicting idle chunk set {} ({}/{} fragments received)",
                    chunk_id,
                    set.fragments.len(),
                    set.total
                );
            }
            keep
        });
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .sets
            .iter()
            .min_by_key(|(_, set)| set.created_at)
            .map(|(id, _)| id.clone())
        {
            self.sets.remove(&oldest);
        }
    }
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new()
    }
}
