// In-memory transport
//
// Wires engines together in-process for tests and simulations. Every send
// goes through the wire codec, so a datagram crossing the hub is exactly
// the byte sequence a network transport would carry. The hub can drop a
// peer (`disconnect`) or block a pair of addresses (`partition`) to stage
// failure scenarios.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::Transport;
use crate::error::TransportError;
use crate::membership::MemberId;
use crate::protocol::{codec, Message};

type Inbox = mpsc::UnboundedSender<(Message, MemberId)>;

#[derive(Default)]
struct HubInner {
    peers: DashMap<String, Inbox>,
    partitions: DashMap<(String, String), ()>,
}

/// Shared registry connecting in-memory transports by address.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member and hand back its transport endpoint.
    pub fn attach(&self, local: MemberId) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.peers.insert(local.address.clone(), tx);
        MemoryTransport {
            local,
            inner: self.inner.clone(),
            incoming: Mutex::new(rx),
        }
    }

    /// Drop a peer from the hub; sends to it fail from now on.
    pub fn disconnect(&self, address: &str) {
        self.inner.peers.remove(address);
    }

    /// Block traffic between two addresses in both directions.
    pub fn partition(&self, a: &str, b: &str) {
        self.inner.partitions.insert((a.to_string(), b.to_string()), ());
        self.inner.partitions.insert((b.to_string(), a.to_string()), ());
    }

    pub fn heal(&self, a: &str, b: &str) {
        self.inner.partitions.remove(&(a.to_string(), b.to_string()));
        self.inner.partitions.remove(&(b.to_string(), a.to_string()));
    }
}

pub struct MemoryTransport {
    local: MemberId,
    inner: Arc<HubInner>,
    incoming: Mutex<mpsc::UnboundedReceiver<(Message, MemberId)>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: &Message, target: &MemberId) -> Result<(), TransportError> {
        let route = (self.local.address.clone(), target.address.clone());
        if self.inner.partitions.contains_key(&route) {
            return Err(TransportError::SendFailed(format!(
                "partitioned from {}",
                target.address
            )));
        }

        // full encode/decode round trip, exactly as a real wire would see it
        let frame = codec::encode(message)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let datagram = codec::decode(&frame)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let Some(peer) = self.inner.peers.get(&target.address) else {
            return Err(TransportError::SendFailed(format!(
                "no route to {}",
                target.address
            )));
        };
        peer.send((datagram, self.local.clone())).map_err(|_| {
            TransportError::SendFailed(format!("{} is shut down", target.address))
        })
    }

    async fn recv(&self) -> Option<(Message, MemberId)> {
        self.incoming.lock().await.recv().await
    }

    fn local_address(&self) -> String {
        self.local.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn ping(seq: u64) -> Message {
        Message::Ping {
            seq,
            gossip: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let hub = MemoryHub::new();
        let a = hub.attach(MemberId::new("a", "a:1"));
        let b = hub.attach(MemberId::new("b", "b:2"));

        a.send(&ping(7), &MemberId::new("b", "b:2")).await.unwrap();
        let (message, sender) = b.recv().await.unwrap();
        assert_eq!(message, ping(7));
        assert_eq!(sender, MemberId::new("a", "a:1"));
        assert_eq!(a.local_address(), "a:1");
    }

    #[tokio::test]
    async fn test_send_to_unknown_address_fails() {
        let hub = MemoryHub::new();
        let a = hub.attach(MemberId::new("a", "a:1"));

        let err = a.send(&ping(1), &MemberId::new("x", "x:9")).await;
        assert!(matches!(err, Err(TransportError::SendFailed(_))));
    }

    #[tokio::test]
    async fn test_disconnect_breaks_route() {
        let hub = MemoryHub::new();
        let a = hub.attach(MemberId::new("a", "a:1"));
        let _b = hub.attach(MemberId::new("b", "b:2"));

        hub.disconnect("b:2");
        let err = a.send(&ping(1), &MemberId::new("b", "b:2")).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let hub = MemoryHub::new();
        let a = hub.attach(MemberId::new("a", "a:1"));
        let b = hub.attach(MemberId::new("b", "b:2"));

        hub.partition("a:1", "b:2");
        assert!(a.send(&ping(1), &MemberId::new("b", "b:2")).await.is_err());
        assert!(b.send(&ping(2), &MemberId::new("a", "a:1")).await.is_err());

        hub.heal("a:1", "b:2");
        a.send(&ping(3), &MemberId::new("b", "b:2")).await.unwrap();
        let (message, _) = timeout(Duration::from_secs(1), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.seq(), 3);
    }
}
