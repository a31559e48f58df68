//! Host abstraction and the adapter that bridges it to the router.
//!
//! The host owns networking: connections, their lifecycle, and the stream
//! multiplexer. This module defines the narrow surface the overlay needs
//! from it — a local peer id, a feed of connection events for a registered
//! protocol, and the ability to open an outbound stream — plus the adapter
//! task that translates those events into router events. The adapter is
//! the only component that talks to the host; the router is host-agnostic.
//!
//! Streams are used unidirectionally: the stream a side opens carries its
//! outbound frames, and the streams its handler receives carry inbound
//! frames. Each inbound stream gets a receive worker; each outbound stream
//! becomes a peer-up event, and the router binds a send worker to it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::identity::PeerId;
use crate::peer::{self, IngressRpc};
use crate::router::PeerEvent;
use crate::wire::PROTOCOL_ID;

/// Byte-stream requirements for a peer link.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// A bidirectional byte stream to a remote peer, annotated with the
/// remote's identity.
pub struct PeerStream {
    pub remote: PeerId,
    pub io: Box<dyn StreamIo>,
}

impl PeerStream {
    pub fn new(remote: PeerId, io: impl StreamIo + 'static) -> Self {
        PeerStream {
            remote,
            io: Box::new(io),
        }
    }
}

impl fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerStream")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Connection-layer notifications delivered to a registered protocol.
#[derive(Debug)]
pub enum HostEvent {
    /// A remote opened a stream to us for the registered protocol.
    InboundStream(PeerStream),
    /// A connection to the peer was established (either direction).
    Connected(PeerId),
    /// The connection to the peer went away.
    Disconnected(PeerId),
}

/// Capacity of a registered protocol's event channel.
const HOST_EVENT_CAPACITY: usize = 32;

/// Per-protocol event channels, shared by the host implementations in
/// this crate.
#[derive(Default)]
pub(crate) struct ProtocolHandlers {
    by_protocol: Mutex<HashMap<String, mpsc::Sender<HostEvent>>>,
}

impl ProtocolHandlers {
    pub(crate) fn register(&self, protocol: &str) -> mpsc::Receiver<HostEvent> {
        let (tx, rx) = mpsc::channel(HOST_EVENT_CAPACITY);
        self.by_protocol.lock().insert(protocol.to_string(), tx);
        rx
    }

    pub(crate) fn get(&self, protocol: &str) -> Option<mpsc::Sender<HostEvent>> {
        self.by_protocol.lock().get(protocol).cloned()
    }

    /// Senders for every registered protocol, for connection-level events.
    pub(crate) fn all(&self) -> Vec<mpsc::Sender<HostEvent>> {
        self.by_protocol.lock().values().cloned().collect()
    }
}

/// The host surface the overlay depends on.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// This host's own peer id.
    fn local_peer(&self) -> PeerId;

    /// Register a protocol and receive its connection events. Registering
    /// the same protocol again replaces the previous receiver.
    fn register(&self, protocol: &str) -> mpsc::Receiver<HostEvent>;

    /// Open an outbound stream to a connected peer for the given protocol.
    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<PeerStream>;
}

/// Spawn the adapter task: registers `/floodsub/1.0.0` with the host and
/// feeds the router's ingress and peer-event channels until the root token
/// is cancelled or the host drops its event feed.
pub(crate) fn spawn_adapter(
    host: Arc<dyn Host>,
    ingress_tx: mpsc::Sender<IngressRpc>,
    events_tx: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
) {
    let mut host_events = host.register(PROTOCOL_ID);

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = host_events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                HostEvent::InboundStream(stream) => {
                    debug!(peer = %stream.remote, "inbound stream");
                    peer::spawn_recv_worker(
                        stream,
                        ingress_tx.clone(),
                        events_tx.clone(),
                        cancel.child_token(),
                    );
                }
                HostEvent::Connected(remote) => {
                    // Dial the outbound stream off the adapter loop so a
                    // slow peer cannot stall event handling.
                    let host = host.clone();
                    let events_tx = events_tx.clone();
                    tokio::spawn(async move {
                        match host.open_stream(&remote, PROTOCOL_ID).await {
                            Ok(stream) => {
                                let _ = events_tx.send(PeerEvent::Up(stream)).await;
                            }
                            Err(e) => {
                                warn!(peer = %remote, error = %e, "failed to open outbound stream");
                            }
                        }
                    });
                }
                HostEvent::Disconnected(remote) => {
                    let _ = events_tx
                        .send(PeerEvent::Down {
                            peer: remote,
                            generation: None,
                        })
                        .await;
                }
            }
        }
        debug!("host adapter exited");
    });
}
