//! Radio transport abstraction
//!
//! The physical BLE link is an external collaborator: scanning,
//! connecting, characteristic writes, and notifications are platform
//! capability. This layer only needs the narrow surface below and
//! reacts to its success/failure results.
//!
//! Implementations hand inbound notification payloads to the channel
//! returned from [`Transport::connect`]; the connection manager owns
//! the receiving side and closes it on teardown. Dropping the sender
//! signals a radio-level disconnect.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Default BLE MTU before negotiation
pub const DEFAULT_MTU: u16 = 23;

/// Radio transport collaborator
///
/// All methods take `&self`; implementations use interior mutability so
/// the transport can be shared between the connection driver and the
/// send queue.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bring up the radio link (scan + connect + characteristic
    /// discovery). Returns the inbound notification stream.
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>>;

    /// Tear down the radio link
    async fn disconnect(&self);

    /// Write one buffer to the shared characteristic
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Negotiate the MTU; returns the effective value
    async fn request_mtu(&self, preferred: u16) -> Result<u16>;

    /// Enable notifications on the peripheral's TX characteristic
    async fn enable_notifications(&self) -> Result<()>;
}
