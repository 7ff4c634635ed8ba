// UDP datagram transport
//
// One socket per engine; every message is a single datagram. The transport
// keeps a cache mapping socket addresses to member identities, learned from
// outbound sends and from inbound Ack responder fields. A sender that is
// not yet in the cache is synthesised from its socket address; the engine's
// join-by-observation and later gossip converge on the real identity.
//
// Undecodable datagrams are logged and dropped: the protocol is
// loss-tolerant and a corrupt frame is indistinguishable from a lost one.

use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

use super::Transport;
use crate::error::TransportError;
use crate::membership::MemberId;
use crate::protocol::{codec, Message, MAX_DATAGRAM_SIZE};

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: String,
    peers: DashMap<SocketAddr, MemberId>,
}

impl UdpTransport {
    /// Bind a socket for cluster communication.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::Unavailable(format!("bind {}: {}", addr, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?
            .to_string();
        tracing::debug!(%local_addr, "udp transport bound");
        Ok(Self {
            socket,
            local_addr,
            peers: DashMap::new(),
        })
    }

    fn sender_identity(&self, message: &Message, from: SocketAddr) -> MemberId {
        // an Ack names its responder; trust it when the datagram really
        // came from that address (a relayed Ack does not)
        if let Message::Ack { responder, .. } = message {
            if responder.address == from.to_string() {
                self.peers.insert(from, responder.clone());
            }
        }
        self.peers
            .get(&from)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| MemberId::new(from.to_string(), from.to_string()))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, message: &Message, target: &MemberId) -> Result<(), TransportError> {
        let addr: SocketAddr = target
            .address
            .parse()
            .map_err(|e| TransportError::SendFailed(format!("{}: {}", target.address, e)))?;
        self.peers.insert(addr, target.clone());

        let frame =
            codec::encode(message).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let written = self
            .socket
            .send_to(&frame, addr)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        if written != frame.len() {
            return Err(TransportError::SendFailed(format!(
                "short write: {} of {} bytes",
                written,
                frame.len()
            )));
        }
        Ok(())
    }

    async fn recv(&self) -> Option<(Message, MemberId)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(error) => {
                    tracing::warn!(%error, "udp receive failed, closing incoming stream");
                    return None;
                }
            };
            match codec::decode(&buf[..len]) {
                Ok(message) => {
                    let sender = self.sender_identity(&message, from);
                    return Some((message, sender));
                }
                Err(error) => {
                    tracing::warn!(%from, %error, len, "dropping undecodable datagram");
                }
            }
        }
    }

    fn local_address(&self) -> String {
        self.local_addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_datagram_exchange_with_identity_learning() {
        let a = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let b_id = MemberId::new("b", b.local_address());

        // first contact: b has never seen a, so the sender is synthesised
        let ping = Message::Ping {
            seq: 5,
            gossip: Vec::new(),
        };
        a.send(&ping, &b_id).await.unwrap();
        let (received, sender) = timeout(Duration::from_secs(2), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, ping);
        assert_eq!(sender.address, a.local_address());
        assert_eq!(sender.id, a.local_address());

        // b acks with its real identity; a learns it from the responder field
        let ack = Message::Ack {
            seq: 5,
            responder: b_id.clone(),
            gossip: Vec::new(),
        };
        b.send(&ack, &sender).await.unwrap();
        let (received, sender) = timeout(Duration::from_secs(2), a.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.seq(), 5);
        // a sent to b first, so the cache already knows b's identity
        assert_eq!(sender, b_id);
    }

    #[tokio::test]
    async fn test_send_to_unparseable_address_fails() {
        let a = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let target = MemberId::new("x", "not-an-address");
        let err = a
            .send(
                &Message::Nack {
                    seq: 1,
                    target: target.clone(),
                },
                &target,
            )
            .await;
        assert!(matches!(err, Err(TransportError::SendFailed(_))));
    }
}
