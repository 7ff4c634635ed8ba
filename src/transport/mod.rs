// Transport abstraction for the SWIM engine
//
// The engine is constructed around a transport and never attempts to
// restart it. The transport owns address parsing, delivery, and the mapping
// from a network-level sender to a member identity; it does not interpret
// message semantics.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::membership::MemberId;
use crate::protocol::Message;

pub mod memory;
pub mod udp;

pub use memory::{MemoryHub, MemoryTransport};
pub use udp::UdpTransport;

/// Trait for message transport implementations
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a message to a specific member. The engine treats a failure as
    /// a probe timeout; nothing is retried at this layer.
    async fn send(&self, message: &Message, target: &MemberId)
        -> Result<(), TransportError>;

    /// Receive the next `(message, sender)` pair. The stream is finite and
    /// non-restartable: `None` means the transport has shut down.
    async fn recv(&self) -> Option<(Message, MemberId)>;

    /// Local routing address.
    fn local_address(&self) -> String;
}
