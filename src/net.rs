//! Minimal TCP host implementation.
//!
//! One TCP connection per directed stream: the dialing side writes a fixed
//! handshake naming itself, its advertised listen port, and the protocol it
//! wants, and the accepting side answers with its own peer id. After the
//! handshake the connection is handed over verbatim as the protocol stream.
//! A presence handshake (empty protocol) lets [`TcpHost::connect`] learn a
//! remote's identity and makes both sides emit a Connected notification,
//! which is what prompts the overlay's adapter to open its real stream.
//!
//! The host keeps an address book mapping peer ids to `ip:listen_port`,
//! learned from dials and inbound handshakes. It carries no authentication
//! or encryption, and it never emits Disconnected: peer death surfaces as
//! EOF on streams, which the overlay's receive workers translate into
//! peer-down events.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::host::{Host, HostEvent, PeerStream, ProtocolHandlers};
use crate::identity::PeerId;

/// Deadline for completing a handshake exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a handshake's peer id length.
const MAX_HANDSHAKE_ID_LEN: usize = 64;

/// A host speaking plain TCP.
pub struct TcpHost {
    local_peer: PeerId,
    listen_addr: SocketAddr,
    handlers: Arc<ProtocolHandlers>,
    addr_book: Arc<Mutex<HashMap<PeerId, SocketAddr>>>,
}

impl TcpHost {
    /// Bind a listener and start accepting streams until `cancel` fires.
    pub async fn bind(addr: &str, cancel: CancellationToken) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        let listen_addr = listener.local_addr().context("listener has no address")?;

        let host = Arc::new(TcpHost {
            local_peer: PeerId::random(),
            listen_addr,
            handlers: Arc::new(ProtocolHandlers::default()),
            addr_book: Arc::new(Mutex::new(HashMap::new())),
        });
        info!(peer = %host.local_peer, addr = %listen_addr, "tcp host listening");

        let accept_host = host.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((socket, remote_addr)) => {
                        let host = accept_host.clone();
                        tokio::spawn(async move {
                            if let Err(e) = host.handle_inbound(socket, remote_addr).await {
                                debug!(addr = %remote_addr, error = %e, "inbound handshake failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            debug!("tcp accept loop exited");
        });

        Ok(host)
    }

    /// The address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Dial a remote host, learn its peer id, and record how to reach it.
    /// Both sides emit a Connected notification for a newly learned peer.
    pub async fn connect(&self, addr: &str) -> Result<PeerId> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let mut socket = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to dial {}", addr))?;
        socket.set_nodelay(true).ok();

        let remote = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            write_handshake(&mut socket, &self.local_peer, self.listen_addr.port(), "").await?;
            read_peer_id(&mut socket).await
        })
        .await
        .context("handshake timed out")??;

        if remote == self.local_peer {
            bail!("dialed our own listener");
        }

        let newly_known = self
            .addr_book
            .lock()
            .insert(remote.clone(), addr)
            .is_none();
        if newly_known {
            self.notify_connected(&remote).await;
        }
        debug!(peer = %remote, addr = %addr, "dialed peer");
        Ok(remote)
    }

    async fn handle_inbound(&self, mut socket: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        socket.set_nodelay(true).ok();
        let (remote, listen_port, protocol) =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
                let handshake = read_handshake(&mut socket).await?;
                write_peer_id(&mut socket, &self.local_peer).await?;
                Ok::<_, anyhow::Error>(handshake)
            })
            .await
            .context("handshake timed out")??;

        if remote == self.local_peer {
            bail!("inbound connection from ourselves");
        }

        let reach = SocketAddr::new(remote_addr.ip(), listen_port);
        let newly_known = self
            .addr_book
            .lock()
            .insert(remote.clone(), reach)
            .is_none();
        if newly_known {
            self.notify_connected(&remote).await;
        }

        if protocol.is_empty() {
            // Presence-only dial; identity exchanged, nothing to stream.
            trace!(peer = %remote, "presence handshake");
            return Ok(());
        }

        match self.handlers.get(&protocol) {
            Some(handler) => {
                let stream = PeerStream::new(remote, socket);
                handler
                    .send(HostEvent::InboundStream(stream))
                    .await
                    .map_err(|_| anyhow::anyhow!("protocol handler closed"))?;
            }
            None => {
                warn!(peer = %remote, protocol = %protocol, "no handler for protocol, dropping stream");
            }
        }
        Ok(())
    }

    async fn notify_connected(&self, remote: &PeerId) {
        for tx in self.handlers.all() {
            let _ = tx.send(HostEvent::Connected(remote.clone())).await;
        }
    }
}

#[async_trait]
impl Host for TcpHost {
    fn local_peer(&self) -> PeerId {
        self.local_peer.clone()
    }

    fn register(&self, protocol: &str) -> mpsc::Receiver<HostEvent> {
        self.handlers.register(protocol)
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<PeerStream> {
        let addr = self
            .addr_book
            .lock()
            .get(peer)
            .copied()
            .with_context(|| format!("no known address for peer {}", peer))?;

        let mut socket = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to dial {}", addr))?;
        socket.set_nodelay(true).ok();

        let remote = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            write_handshake(
                &mut socket,
                &self.local_peer,
                self.listen_addr.port(),
                protocol,
            )
            .await?;
            read_peer_id(&mut socket).await
        })
        .await
        .context("handshake timed out")??;

        if &remote != peer {
            bail!("peer at {} identified as {}, expected {}", addr, remote, peer);
        }
        Ok(PeerStream::new(remote, socket))
    }
}

// ============================================================================
// Handshake encoding
// ============================================================================

async fn write_handshake(
    socket: &mut TcpStream,
    local: &PeerId,
    listen_port: u16,
    protocol: &str,
) -> Result<()> {
    if protocol.len() > u8::MAX as usize {
        bail!("protocol id too long for handshake");
    }
    write_peer_id(socket, local).await?;
    socket.write_u16(listen_port).await?;
    socket.write_u8(protocol.len() as u8).await?;
    socket.write_all(protocol.as_bytes()).await?;
    socket.flush().await?;
    Ok(())
}

async fn read_handshake(socket: &mut TcpStream) -> Result<(PeerId, u16, String)> {
    let remote = read_peer_id(socket).await?;
    let listen_port = socket.read_u16().await?;
    let proto_len = socket.read_u8().await? as usize;
    let mut proto = vec![0u8; proto_len];
    socket.read_exact(&mut proto).await?;
    let protocol = String::from_utf8(proto).context("protocol id is not UTF-8")?;
    Ok((remote, listen_port, protocol))
}

async fn write_peer_id(socket: &mut TcpStream, id: &PeerId) -> Result<()> {
    let bytes = id.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_HANDSHAKE_ID_LEN {
        bail!("peer id length {} outside handshake bounds", bytes.len());
    }
    socket.write_u8(bytes.len() as u8).await?;
    socket.write_all(bytes).await?;
    Ok(())
}

async fn read_peer_id(socket: &mut TcpStream) -> Result<PeerId> {
    let len = socket.read_u8().await? as usize;
    if len == 0 || len > MAX_HANDSHAKE_ID_LEN {
        bail!("peer id length {} outside handshake bounds", len);
    }
    let mut bytes = vec![0u8; len];
    socket.read_exact(&mut bytes).await?;
    Ok(PeerId::from_bytes(bytes))
}
