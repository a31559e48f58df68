//! # Floodcast - Flooding Publish/Subscribe Overlay
//!
//! Floodcast implements the `/floodsub/1.0.0` protocol: peers connected to
//! a host exchange framed RPCs announcing which topics they care about, and
//! every published message is flooded to every directly-connected peer that
//! announced interest, which re-forwards it to its own subscribed
//! neighbors. A time-bounded seen-set deduplicates, so the network
//! converges on best-effort eventual delivery without storms.
//!
//! ## Architecture
//!
//! All overlay state lives in a single router task (the Actor Pattern):
//! the public [`FloodCast`] handle is cheap to clone and talks to the
//! router over command channels, and every peer link gets an independent
//! send worker and receive worker joined to the router by bounded queues.
//! The router never blocks on a slow peer or subscriber.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `router` | The event loop owning subscriptions, peer queues, and dedup |
//! | `identity` | Opaque peer identifiers |
//! | `wire` | Frozen RPC schema and varint length-delimited framing |
//! | `seen` | Time-bounded set of message identities |
//! | `subscription` | Per-topic handles with bounded inboxes |
//! | `peer` | Per-peer stream workers |
//! | `host` | Host abstraction and the adapter binding it to the router |
//! | `mem` | In-process host hub for tests and simulations |
//! | `net` | Minimal TCP host |
//!
//! ## Guarantees and non-guarantees
//!
//! Per-source ordering is preserved from a peer's stream into local
//! delivery; nothing is guaranteed across peers or publishers. Delivery is
//! at-most-once per message identity within the seen window, and
//! best-effort beyond that: full queues shed load instead of stalling the
//! router.

mod host;
mod identity;
mod mem;
mod net;
mod peer;
mod router;
mod seen;
mod subscription;
mod wire;

pub use host::{Host, HostEvent, PeerStream, StreamIo};
pub use identity::{PeerId, PEER_ID_LEN};
pub use mem::{MemHost, MemNetwork};
pub use net::TcpHost;
pub use router::{FloodCast, SubscribeError};
pub use seen::DEFAULT_SEEN_WINDOW;
pub use subscription::Subscription;
pub use wire::{
    AuthMode, AuthOpts, EncMode, EncOpts, Message, MessageId, Rpc, SubOpts, TopicDescriptor,
    MAX_FRAME_SIZE, PROTOCOL_ID,
};
