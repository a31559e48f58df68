//! In-process host implementation.
//!
//! [`MemNetwork`] is a hub of hosts living in one process, wired together
//! with in-memory duplex pipes. It exists for tests, demos, and embedding
//! the overlay in simulations: connectivity is whatever the caller scripts
//! with [`MemNetwork::connect`] and [`MemNetwork::disconnect`], and streams
//! carry real framed bytes, so everything above the host boundary runs
//! exactly as it would over a network.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::host::{Host, HostEvent, PeerStream, ProtocolHandlers};
use crate::identity::PeerId;

/// Buffer size of an in-memory stream, per direction.
const PIPE_CAPACITY: usize = 64 * 1024;

/// A hub of in-process hosts.
pub struct MemNetwork {
    hosts: Mutex<HashMap<PeerId, Arc<ProtocolHandlers>>>,
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(MemNetwork {
            hosts: Mutex::new(HashMap::new()),
        })
    }

    /// Mint a new host with a fresh random peer id.
    pub fn host(self: &Arc<Self>) -> Arc<MemHost> {
        let peer = PeerId::random();
        let handlers = Arc::new(ProtocolHandlers::default());
        self.hosts.lock().insert(peer.clone(), handlers.clone());
        Arc::new(MemHost {
            peer,
            handlers,
            network: self.clone(),
        })
    }

    /// Deliver Connected notifications to both hosts, as a transport would
    /// after a dial succeeds.
    pub async fn connect(&self, a: &PeerId, b: &PeerId) -> Result<()> {
        self.notify(a, || HostEvent::Connected(b.clone())).await?;
        self.notify(b, || HostEvent::Connected(a.clone())).await?;
        Ok(())
    }

    /// Deliver Disconnected notifications to both hosts.
    pub async fn disconnect(&self, a: &PeerId, b: &PeerId) -> Result<()> {
        self.notify(a, || HostEvent::Disconnected(b.clone())).await?;
        self.notify(b, || HostEvent::Disconnected(a.clone())).await?;
        Ok(())
    }

    async fn notify(&self, to: &PeerId, event: impl Fn() -> HostEvent) -> Result<()> {
        let handlers = self
            .handlers_of(to)
            .with_context(|| format!("no host {} on this network", to))?;
        for tx in handlers.all() {
            let _ = tx.send(event()).await;
        }
        Ok(())
    }

    fn handlers_of(&self, peer: &PeerId) -> Option<Arc<ProtocolHandlers>> {
        self.hosts.lock().get(peer).cloned()
    }
}

/// One host on a [`MemNetwork`].
pub struct MemHost {
    peer: PeerId,
    handlers: Arc<ProtocolHandlers>,
    network: Arc<MemNetwork>,
}

impl MemHost {
    /// The hub this host belongs to.
    pub fn network(&self) -> &Arc<MemNetwork> {
        &self.network
    }
}

#[async_trait]
impl Host for MemHost {
    fn local_peer(&self) -> PeerId {
        self.peer.clone()
    }

    fn register(&self, protocol: &str) -> mpsc::Receiver<HostEvent> {
        self.handlers.register(protocol)
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<PeerStream> {
        let remote = self
            .network
            .handlers_of(peer)
            .with_context(|| format!("no host {} on this network", peer))?;
        let handler = remote
            .get(protocol)
            .with_context(|| format!("peer {} has no handler for {}", peer, protocol))?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        handler
            .send(HostEvent::InboundStream(PeerStream::new(
                self.peer.clone(),
                far,
            )))
            .await
            .map_err(|_| anyhow::anyhow!("peer handler closed"))?;
        Ok(PeerStream::new(peer.clone(), near))
    }
}
