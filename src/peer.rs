//! Per-peer stream workers.
//!
//! Each connected peer gets two independent tasks. The send worker drains
//! a bounded queue of frames onto the peer's outbound stream; the receive
//! worker decodes frames off an inbound stream and hands them to the
//! router's ingress channel. Neither touches router state: workers signal
//! failure by posting a peer-down event and exiting, and both honor the
//! root cancellation token.

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::host::PeerStream;
use crate::identity::PeerId;
use crate::router::PeerEvent;
use crate::wire::{Rpc, RpcCodec};

/// Capacity of a peer's outbound frame queue.
pub(crate) const SEND_QUEUE_CAPACITY: usize = 32;

/// Capacity of the router's ingress channel.
pub(crate) const INGRESS_CAPACITY: usize = 32;

/// A decoded frame annotated with the peer it arrived from.
pub(crate) struct IngressRpc {
    pub from: PeerId,
    pub rpc: Rpc,
}

/// Spawn the send worker for one peer.
///
/// Exits when the queue closes (router-initiated teardown), a write
/// fails, or the token is cancelled. A write failure posts a peer-down
/// event carrying `generation` so the router can ignore it if a newer
/// stream has already replaced this one.
pub(crate) fn spawn_send_worker(
    stream: PeerStream,
    mut queue_rx: mpsc::Receiver<Rpc>,
    generation: u64,
    events_tx: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let remote = stream.remote;
        let mut framed = FramedWrite::new(stream.io, RpcCodec);
        let mut write_failed = false;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = queue_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(e) = framed.send(frame).await {
                debug!(peer = %remote, error = %e, "outbound stream write failed");
                write_failed = true;
                break;
            }
        }

        let _ = framed.get_mut().shutdown().await;
        trace!(peer = %remote, generation, "send worker exited");

        if write_failed {
            let event = PeerEvent::Down {
                peer: remote,
                generation: Some(generation),
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = events_tx.send(event) => {}
            }
        }
    });
}

/// Spawn the receive worker for one inbound stream.
///
/// Reads length-delimited frames, annotates them with the stream's remote
/// identity, and forwards them to the ingress channel. On EOF or a decode
/// error it posts a peer-down event; during shutdown it never blocks on a
/// full ingress channel, because every send races the cancellation token.
pub(crate) fn spawn_recv_worker(
    stream: PeerStream,
    ingress_tx: mpsc::Sender<IngressRpc>,
    events_tx: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let remote = stream.remote;
        let mut framed = FramedRead::new(stream.io, RpcCodec);
        let mut peer_dead = false;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = framed.next() => frame,
            };
            match frame {
                Some(Ok(rpc)) => {
                    let ingress = IngressRpc {
                        from: remote.clone(),
                        rpc,
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = ingress_tx.send(ingress) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    debug!(peer = %remote, error = %e, "inbound stream decode failed");
                    peer_dead = true;
                    break;
                }
                None => {
                    trace!(peer = %remote, "inbound stream closed");
                    peer_dead = true;
                    break;
                }
            }
        }

        if peer_dead {
            let event = PeerEvent::Down {
                peer: remote,
                generation: None,
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = events_tx.send(event) => {}
            }
        }
    });
}
