//! Session transport
//!
//! Sessions hand outgoing [`PeerMessage`]s to a [`PeerTransport`]; inbound
//! messages reach a registry as [`Envelope`]s. Byte encoding and sockets
//! belong to the embedder. [`ChannelNetwork`] connects nodes in-process.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::{EngineError, Result};
use crate::session::PeerMessage;

/// Inbound message tagged with its sender
pub type Envelope = (SocketAddr, PeerMessage);

/// Outgoing half of the session/transport contract
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Queue `msg` for delivery to `peer`
    async fn send(&self, peer: SocketAddr, msg: PeerMessage) -> Result<()>;
}

#[derive(Default)]
struct NetworkInner {
    endpoints: RwLock<HashMap<SocketAddr, mpsc::UnboundedSender<Envelope>>>,
    latency: RwLock<Duration>,
    partitioned: RwLock<HashSet<SocketAddr>>,
}

/// In-process network of channel endpoints
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    inner: Arc<NetworkInner>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addr`, returning its transport and inbound stream
    pub fn endpoint(&self, addr: SocketAddr) -> (ChannelTransport, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.endpoints.write().insert(addr, tx);
        let transport = ChannelTransport {
            local: addr,
            network: Arc::clone(&self.inner),
        };
        (transport, rx)
    }

    /// One-way delay applied to every message
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.write() = latency;
    }

    /// Silently drop everything sent to or from `addr`
    pub fn set_partitioned(&self, addr: SocketAddr, partitioned: bool) {
        let mut set = self.inner.partitioned.write();
        if partitioned {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }
}

/// Transport bound to one endpoint of a [`ChannelNetwork`]
#[derive(Clone)]
pub struct ChannelTransport {
    local: SocketAddr,
    network: Arc<NetworkInner>,
}

impl ChannelTransport {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[async_trait]
impl PeerTransport for ChannelTransport {
    async fn send(&self, peer: SocketAddr, msg: PeerMessage) -> Result<()> {
        {
            let partitioned = self.network.partitioned.read();
            if partitioned.contains(&peer) || partitioned.contains(&self.local) {
                tracing::trace!("{} -> {}: dropped {}", self.local, peer, msg.name());
                return Ok(());
            }
        }

        let tx = self
            .network
            .endpoints
            .read()
            .get(&peer)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("peer {}", peer)))?;

        let latency = *self.network.latency.read();
        if latency.is_zero() {
            return tx.send((self.local, msg)).map_err(EngineError::from);
        }

        let from = self.local;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let _ = tx.send((from, msg));
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileId, Role, TorrentId};

    fn shutdown() -> PeerMessage {
        PeerMessage::Shutdown {
            file: FileId::new(TorrentId::from_name("net"), 0),
            from: Role::Leecher,
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_delivery_tags_sender() {
        let network = ChannelNetwork::new();
        let (a, _a_rx) = network.endpoint(addr(1));
        let (_b, mut b_rx) = network.endpoint(addr(2));

        a.send(addr(2), shutdown()).await.unwrap();
        let (from, msg) = b_rx.recv().await.unwrap();
        assert_eq!(from, addr(1));
        assert_eq!(msg, shutdown());
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let network = ChannelNetwork::new();
        let (a, _rx) = network.endpoint(addr(1));
        assert!(matches!(
            a.send(addr(9), shutdown()).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_partition_drops() {
        let network = ChannelNetwork::new();
        let (a, _a_rx) = network.endpoint(addr(1));
        let (_b, mut b_rx) = network.endpoint(addr(2));
        network.set_partitioned(addr(2), true);

        a.send(addr(2), shutdown()).await.unwrap();
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency() {
        let network = ChannelNetwork::new();
        network.set_latency(Duration::from_millis(30));
        let (a, _a_rx) = network.endpoint(addr(1));
        let (_b, mut b_rx) = network.endpoint(addr(2));

        let start = tokio::time::Instant::now();
        a.send(addr(2), shutdown()).await.unwrap();
        b_rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
