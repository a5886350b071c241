//! glasslink-core
//!
//! Reliable messaging over a lossy, small-MTU BLE link between a host
//! device and smart glasses. The radio delivers small opaque byte
//! buffers that may be dropped or reordered; everything interesting
//! lives in the protocol built on top: framing, chunking of oversized
//! payloads, acknowledgment/retry for at-least-once delivery, the
//! connection-lifecycle handshake with the peripheral's own boot
//! sequence, and reassembly of multi-packet file/photo transfers.
//!
//! ## Architecture
//!
//! ### Modules
//!
//! - `protocol`: envelope codec, logical messages, chunking
//! - `reliability`: message ids, acknowledgment tracking, bounded retry
//! - `transfer`: multi-packet transfer reassembly and gap recovery
//! - `connection`: lifecycle state machine, send queue, transport trait
//! - `audio`: streamed audio packet sequencing
//!
//! The physical radio (scan/connect/write/notify) is an external
//! collaborator behind the [`Transport`] trait; audio decoding, photo
//! upload, and UI are external sinks.
//!
//! ## Example
//!
//! ```rust,no_run
//! use glasslink_core::{ConnectionManager, LinkConfig, Message, Transport};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example(transport: Arc<dyn Transport>) -> glasslink_core::Result<()> {
//! let mut manager = ConnectionManager::new(transport, LinkConfig::default());
//! let mut events = manager.take_events().unwrap();
//! manager.start()?;
//!
//! // React to link events while sending commands.
//! manager.send_reliable(Message::new("display_text", json!({ "text": "hi" })))?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

// Re-export commonly used types
pub use audio::{AudioSequencer, AudioSink};
pub use config::LinkConfig;
pub use connection::{ConnectionManager, ConnectionState, LinkEvent, Transport};
pub use error::{LinkError, Result};
pub use protocol::Message;
pub use transfer::{CompletedTransfer, TransferSink};

// Public modules
pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod reliability;
pub mod transfer;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
