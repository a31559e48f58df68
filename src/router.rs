//! The router: single event loop owning all overlay state.
//!
//! The module follows the handle/actor split: [`FloodCast`] is the public,
//! cheap-to-clone handle whose methods turn into commands on a channel,
//! and [`Router`] is the private actor that owns every mutable map and
//! services one event per loop iteration. No other task reads or writes
//! router state.
//!
//! | State | Contents |
//! |-------|----------|
//! | `my_topics` | topic → live local subscription inboxes |
//! | `remote_topics` | topic → peers that announced interest |
//! | `peers` | peer → outbound frame queue (plus stream generation) |
//! | `seen` | time-bounded set of delivered message identities |
//!
//! Flooding: a message entering the router (from a peer or a local
//! publish) is delivered to local inboxes and forwarded once to every
//! interested peer except the immediate sender and the originator, with
//! the seen-set breaking cycles.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::host::{self, Host, PeerStream};
use crate::identity::PeerId;
use crate::peer::{self, IngressRpc, INGRESS_CAPACITY, SEND_QUEUE_CAPACITY};
use crate::seen::{TimeCache, DEFAULT_SEEN_WINDOW};
use crate::subscription::{SubCancel, Subscription, INBOX_CAPACITY};
use crate::wire::{Message, Rpc, SubOpts, TopicDescriptor};

/// Capacity of the command channel between handles and the router.
const COMMAND_CAPACITY: usize = 64;

/// Capacity of the peer-event channel fed by the adapter and workers.
const PEER_EVENT_CAPACITY: usize = 32;

// ============================================================================
// Errors
// ============================================================================

/// Synchronous refusal of a subscribe call. No router state is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeError {
    /// The topic descriptor requests an authentication mode other than NONE.
    UnsupportedAuthMode,
    /// The topic descriptor requests an encryption mode other than NONE.
    UnsupportedEncMode,
    /// The router has shut down.
    Shutdown,
}

impl fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedAuthMode => write!(f, "topic authentication is not supported"),
            Self::UnsupportedEncMode => write!(f, "topic encryption is not supported"),
            Self::Shutdown => write!(f, "router is shut down"),
        }
    }
}

impl std::error::Error for SubscribeError {}

// ============================================================================
// Commands and events
// ============================================================================

enum Command {
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Subscription>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<()>,
    },
    GetTopics {
        reply: oneshot::Sender<Vec<String>>,
    },
    ListPeers {
        topic: String,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
}

/// Peer lifecycle events posted by the host adapter and stream workers.
pub(crate) enum PeerEvent {
    /// A fresh outbound stream to the peer named in it.
    Up(PeerStream),
    /// The peer went away. `generation` is set when the event comes from a
    /// send worker, so a stale worker cannot tear down a replacement entry;
    /// `None` (adapter or receive worker) always applies.
    Down {
        peer: PeerId,
        generation: Option<u64>,
    },
}

// ============================================================================
// FloodCast handle (public API — cheap to clone)
// ============================================================================

/// Handle to a running flooding pub/sub overlay.
#[derive(Clone)]
pub struct FloodCast {
    local_peer: PeerId,
    cmd_tx: mpsc::Sender<Command>,
}

impl FloodCast {
    /// Start the overlay on the given host. The router lives until `cancel`
    /// fires; the token is shared with every worker the overlay spawns.
    pub fn new(host: Arc<dyn Host>, cancel: CancellationToken) -> Self {
        let local_peer = host.local_peer();
        let (handle, ingress_tx, events_tx) = Self::spawn_router(local_peer, cancel.clone());
        host::spawn_adapter(host, ingress_tx, events_tx, cancel);
        handle
    }

    /// Wire up and spawn the router actor without a host adapter. Used by
    /// [`FloodCast::new`] and by tests that drive the channels directly.
    pub(crate) fn spawn_router(
        local_peer: PeerId,
        cancel: CancellationToken,
    ) -> (
        FloodCast,
        mpsc::Sender<IngressRpc>,
        mpsc::Sender<PeerEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (sub_cancel_tx, sub_cancel_rx) = mpsc::unbounded_channel();
        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(PEER_EVENT_CAPACITY);

        let router = Router {
            local_peer: local_peer.clone(),
            my_topics: HashMap::new(),
            remote_topics: HashMap::new(),
            peers: HashMap::new(),
            seen: TimeCache::new(DEFAULT_SEEN_WINDOW),
            next_sub_id: 0,
            next_generation: 0,
            sub_cancel_tx,
            events_tx: events_tx.clone(),
            cancel,
        };
        tokio::spawn(router.run(cmd_rx, sub_cancel_rx, ingress_rx, events_rx));

        let handle = FloodCast { local_peer, cmd_tx };
        (handle, ingress_tx, events_tx)
    }

    /// This host's peer id — the `from` of every local publication.
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Subscribe to a plain topic (no authentication, no encryption).
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, SubscribeError> {
        self.subscribe_descriptor(TopicDescriptor::plain(topic)).await
    }

    /// Subscribe using a full topic descriptor. Descriptors requesting any
    /// authentication or encryption mode other than NONE are refused
    /// before the router is involved.
    pub async fn subscribe_descriptor(
        &self,
        descriptor: TopicDescriptor,
    ) -> Result<Subscription, SubscribeError> {
        if descriptor.auth_mode() != 0 {
            return Err(SubscribeError::UnsupportedAuthMode);
        }
        if descriptor.enc_mode() != 0 {
            return Err(SubscribeError::UnsupportedEncMode);
        }

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                topic: descriptor.name,
                reply,
            })
            .await
            .map_err(|_| SubscribeError::Shutdown)?;
        rx.await.map_err(|_| SubscribeError::Shutdown)
    }

    /// Publish `data` to a topic. Returns once the router has accepted the
    /// message; delivery is best-effort flooding from there.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish {
                topic: topic.to_string(),
                data,
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("router closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("router closed"))
    }

    /// Topics with at least one live local subscription.
    pub async fn get_topics(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::GetTopics { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Peers known to be subscribed to `topic`; the empty string lists
    /// every connected peer.
    pub async fn list_peers(&self, topic: &str) -> Vec<PeerId> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ListPeers {
                topic: topic.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

// ============================================================================
// Router actor (owns all state)
// ============================================================================

struct PeerEntry {
    queue: mpsc::Sender<Rpc>,
    generation: u64,
}

struct Router {
    local_peer: PeerId,
    /// topic → subscription id → inbox. A key persists (possibly with an
    /// empty map) once the topic has ever been subscribed; the ingress
    /// topic check is on key presence.
    my_topics: HashMap<String, HashMap<u64, mpsc::Sender<Message>>>,
    remote_topics: HashMap<String, HashSet<PeerId>>,
    peers: HashMap<PeerId, PeerEntry>,
    seen: TimeCache,
    next_sub_id: u64,
    next_generation: u64,
    sub_cancel_tx: mpsc::UnboundedSender<SubCancel>,
    events_tx: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
}

impl Router {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut sub_cancel_rx: mpsc::UnboundedReceiver<SubCancel>,
        mut ingress_rx: mpsc::Receiver<IngressRpc>,
        mut events_rx: mpsc::Receiver<PeerEvent>,
    ) {
        debug!(peer = %self.local_peer, "router started");
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(peer = %self.local_peer, "router shutting down");
                    break;
                }
                event = events_rx.recv() => match event {
                    Some(PeerEvent::Up(stream)) => self.handle_peer_up(stream),
                    Some(PeerEvent::Down { peer, generation }) => {
                        self.handle_peer_down(peer, generation)
                    }
                    None => break,
                },
                Some(req) = sub_cancel_rx.recv() => self.handle_sub_cancel(req),
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                ingress = ingress_rx.recv() => match ingress {
                    Some(ingress) => self.handle_rpc(ingress),
                    None => break,
                },
            }
        }
        // Dropping the router closes every peer queue and subscription
        // inbox; workers observe that or the cancelled token and exit.
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { topic, reply } => self.handle_subscribe(topic, reply),
            Command::Publish { topic, data, reply } => {
                let _ = reply.send(());
                self.handle_publish(topic, data);
            }
            Command::GetTopics { reply } => {
                let topics = self
                    .my_topics
                    .iter()
                    .filter(|(_, subs)| !subs.is_empty())
                    .map(|(topic, _)| topic.clone())
                    .collect();
                let _ = reply.send(topics);
            }
            Command::ListPeers { topic, reply } => {
                let _ = reply.send(self.list_peers(&topic));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------------

    fn handle_peer_up(&mut self, stream: PeerStream) {
        let remote = stream.remote.clone();
        if let Some(old) = self.peers.remove(&remote) {
            // The newer stream wins; closing the old queue makes its send
            // worker exit and tear its stream down.
            error!(peer = %remote, "duplicate stream for connected peer, replacing");
            drop(old);
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let (queue_tx, queue_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        peer::spawn_send_worker(
            stream,
            queue_rx,
            generation,
            self.events_tx.clone(),
            self.cancel.child_token(),
        );

        // The hello must be the first frame on the link: the queue is
        // fresh, so this enqueue cannot fail or be reordered.
        let _ = queue_tx.try_send(self.hello_rpc());

        self.peers.insert(
            remote.clone(),
            PeerEntry {
                queue: queue_tx,
                generation,
            },
        );
        debug!(peer = %remote, "peer up");
    }

    fn handle_peer_down(&mut self, remote: PeerId, generation: Option<u64>) {
        let current = match self.peers.get(&remote) {
            Some(entry) => entry.generation,
            None => return,
        };
        if let Some(observed) = generation {
            if observed != current {
                trace!(peer = %remote, observed, current, "stale peer-down ignored");
                return;
            }
        }

        self.peers.remove(&remote);
        for interested in self.remote_topics.values_mut() {
            interested.remove(&remote);
        }
        debug!(peer = %remote, "peer down");
    }

    /// The first frame sent on every new link: one subscribe option per
    /// topic with a live local subscriber.
    fn hello_rpc(&self) -> Rpc {
        let subscriptions = self
            .my_topics
            .iter()
            .filter(|(_, subs)| !subs.is_empty())
            .map(|(topic, _)| SubOpts {
                subscribe: true,
                topicid: topic.clone(),
            })
            .collect();
        Rpc {
            subscriptions,
            publish: Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    fn handle_subscribe(&mut self, topic: String, reply: oneshot::Sender<Subscription>) {
        let is_first = self
            .my_topics
            .get(&topic)
            .map_or(true, |subs| subs.is_empty());
        if is_first {
            self.announce(&topic, true);
        }

        let id = self.next_sub_id;
        self.next_sub_id += 1;
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        self.my_topics
            .entry(topic.clone())
            .or_default()
            .insert(id, inbox_tx);

        debug!(topic = %topic, sub = id, "local subscription added");
        let sub = Subscription::new(topic, id, inbox_rx, self.sub_cancel_tx.clone());
        let _ = reply.send(sub);
    }

    fn handle_sub_cancel(&mut self, req: SubCancel) {
        let subs = match self.my_topics.get_mut(&req.topic) {
            Some(subs) => subs,
            None => return,
        };
        if subs.remove(&req.id).is_none() {
            return;
        }
        debug!(topic = %req.topic, sub = req.id, "local subscription cancelled");
        if subs.is_empty() {
            self.announce(&req.topic, false);
        }
    }

    /// Broadcast a subscription change to every connected peer. Bypasses
    /// the seen-set: announcements are link state, not flooded payload.
    fn announce(&self, topic: &str, subscribe: bool) {
        debug!(topic = %topic, subscribe, "announcing subscription change");
        let rpc = Rpc::with_subscription(topic, subscribe);
        for (remote, entry) in &self.peers {
            self.enqueue(remote, &entry.queue, rpc.clone());
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    fn list_peers(&self, topic: &str) -> Vec<PeerId> {
        if topic.is_empty() {
            return self.peers.keys().cloned().collect();
        }
        match self.remote_topics.get(topic) {
            Some(interested) => interested
                .iter()
                .filter(|remote| self.peers.contains_key(*remote))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Message flow
    // ------------------------------------------------------------------------

    fn handle_rpc(&mut self, ingress: IngressRpc) {
        let IngressRpc { from, rpc } = ingress;

        for opt in rpc.subscriptions {
            if opt.subscribe {
                self.remote_topics
                    .entry(opt.topicid)
                    .or_default()
                    .insert(from.clone());
            } else if let Some(interested) = self.remote_topics.get_mut(&opt.topicid) {
                interested.remove(&from);
            }
        }

        for message in rpc.publish {
            let known_topic = message
                .topic_ids
                .iter()
                .any(|topic| self.my_topics.contains_key(topic));
            if !known_topic {
                warn!(peer = %from, "message on a topic we never subscribed to, dropping");
                continue;
            }
            self.publish_maybe(&from, message);
        }
    }

    fn handle_publish(&mut self, topic: String, data: Vec<u8>) {
        let seqno = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64;
        let message = Message {
            from: self.local_peer.to_vec(),
            data,
            seqno: seqno.to_be_bytes().to_vec(),
            topic_ids: vec![topic],
        };
        let from = self.local_peer.clone();
        self.publish_maybe(&from, message);
    }

    /// Deliver and forward a message unless its identity was already seen
    /// inside the retention window. `from_peer` is the immediate sender —
    /// the local host id for local publications.
    fn publish_maybe(&mut self, from_peer: &PeerId, message: Message) {
        let id = message.id();
        if self.seen.has(&id) {
            trace!(id = ?id, "duplicate message, dropping");
            return;
        }
        self.seen.add(id);

        self.notify_subs(&message);
        self.forward(from_peer, message);
    }

    /// Local delivery: each matching topic is visited independently, so a
    /// handle subscribed to two of the message's topics sees it twice.
    fn notify_subs(&self, message: &Message) {
        for topic in &message.topic_ids {
            let subs = match self.my_topics.get(topic) {
                Some(subs) => subs,
                None => continue,
            };
            for (sub_id, inbox) in subs {
                match inbox.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(topic = %topic, sub = sub_id, "subscriber inbox full, dropping delivery");
                    }
                    // Cancellation in flight; the router will process it.
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }
    }

    /// Flood-forward to the union of interested peers, excluding the
    /// immediate sender and the originator. Peers interested in several of
    /// the message's topics still get one copy.
    fn forward(&self, from_peer: &PeerId, message: Message) {
        let mut targets: HashSet<PeerId> = HashSet::new();
        for topic in &message.topic_ids {
            if let Some(interested) = self.remote_topics.get(topic) {
                targets.extend(interested.iter().cloned());
            }
        }
        targets.remove(from_peer);
        targets.remove(&message.source());
        if targets.is_empty() {
            return;
        }

        let rpc = Rpc::with_message(message);
        for remote in &targets {
            if let Some(entry) = self.peers.get(remote) {
                self.enqueue(remote, &entry.queue, rpc.clone());
            }
        }
    }

    /// Non-blocking enqueue onto a peer's send queue. A full queue defers
    /// the frame to a detached task so the router loop never suspends.
    fn enqueue(&self, remote: &PeerId, queue: &mpsc::Sender<Rpc>, rpc: Rpc) {
        match queue.try_send(rpc) {
            Ok(()) => {}
            Err(TrySendError::Full(rpc)) => {
                trace!(peer = %remote, "send queue full, deferring enqueue");
                let queue = queue.clone();
                tokio::spawn(async move {
                    let _ = queue.send(rpc).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                trace!(peer = %remote, "send queue closed, dropping frame");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc::Sender;
    use tokio::time::timeout;
    use tokio_util::codec::FramedRead;

    use crate::wire::RpcCodec;

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(100);

    struct Rig {
        fs: FloodCast,
        ingress_tx: Sender<IngressRpc>,
        events_tx: Sender<PeerEvent>,
        cancel: CancellationToken,
    }

    fn rig() -> Rig {
        let cancel = CancellationToken::new();
        let (fs, ingress_tx, events_tx) =
            FloodCast::spawn_router(PeerId::random(), cancel.clone());
        Rig {
            fs,
            ingress_tx,
            events_tx,
            cancel,
        }
    }

    /// Connect a fake peer: posts peer-up for one half of a duplex pipe and
    /// returns a frame reader over the other half.
    async fn connect_peer(rig: &Rig, remote: &PeerId) -> FramedRead<DuplexStream, RpcCodec> {
        let (near, far) = tokio::io::duplex(64 * 1024);
        rig.events_tx
            .send(PeerEvent::Up(PeerStream::new(remote.clone(), near)))
            .await
            .expect("router gone");
        FramedRead::new(far, RpcCodec)
    }

    async fn read_frame(reader: &mut FramedRead<DuplexStream, RpcCodec>) -> Rpc {
        timeout(WAIT, reader.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream closed")
            .expect("decode failed")
    }

    async fn assert_quiet(reader: &mut FramedRead<DuplexStream, RpcCodec>) {
        let unexpected = timeout(QUIET, reader.next()).await;
        assert!(unexpected.is_err(), "unexpected frame: {:?}", unexpected);
    }

    async fn ingress(rig: &Rig, from: &PeerId, rpc: Rpc) {
        rig.ingress_tx
            .send(IngressRpc {
                from: from.clone(),
                rpc,
            })
            .await
            .expect("router gone");
    }

    fn remote_message(author: &PeerId, topic: &str, data: &[u8], seq: u64) -> Message {
        Message {
            from: author.to_vec(),
            data: data.to_vec(),
            seqno: seq.to_be_bytes().to_vec(),
            topic_ids: vec![topic.to_string()],
        }
    }

    #[tokio::test]
    async fn hello_lists_live_subscriptions_first() {
        let rig = rig();
        let mut sub_a = rig.fs.subscribe("a").await.unwrap();
        let _sub_b = rig.fs.subscribe("b").await.unwrap();
        sub_a.cancel();
        // Drain the cancel so "a" has no live subscriber at peer-up.
        tokio::time::sleep(QUIET).await;

        let remote = PeerId::random();
        let mut reader = connect_peer(&rig, &remote).await;
        let hello = read_frame(&mut reader).await;

        assert!(hello.publish.is_empty());
        assert_eq!(hello.subscriptions.len(), 1);
        assert!(hello.subscriptions[0].subscribe);
        assert_eq!(hello.subscriptions[0].topicid, "b");
    }

    #[tokio::test]
    async fn announces_on_first_subscribe_and_last_cancel() {
        let rig = rig();
        let remote = PeerId::random();
        let mut reader = connect_peer(&rig, &remote).await;
        let hello = read_frame(&mut reader).await;
        assert!(hello.subscriptions.is_empty());

        let mut first = rig.fs.subscribe("t").await.unwrap();
        let announce = read_frame(&mut reader).await;
        assert_eq!(announce.subscriptions.len(), 1);
        assert!(announce.subscriptions[0].subscribe);
        assert_eq!(announce.subscriptions[0].topicid, "t");

        // A second handle on the same topic announces nothing.
        let mut second = rig.fs.subscribe("t").await.unwrap();
        assert_quiet(&mut reader).await;

        // Nor does dropping one of two handles.
        first.cancel();
        assert_quiet(&mut reader).await;

        // Losing the last one broadcasts the unsubscribe.
        second.cancel();
        let retract = read_frame(&mut reader).await;
        assert_eq!(retract.subscriptions.len(), 1);
        assert!(!retract.subscriptions[0].subscribe);
        assert_eq!(retract.subscriptions[0].topicid, "t");
    }

    #[tokio::test]
    async fn duplicate_identity_delivered_once() {
        let rig = rig();
        let mut sub = rig.fs.subscribe("t").await.unwrap();

        let sender = PeerId::random();
        let author = PeerId::random();
        let msg = remote_message(&author, "t", b"payload", 7);

        ingress(&rig, &sender, Rpc::with_message(msg.clone())).await;
        ingress(&rig, &sender, Rpc::with_message(msg.clone())).await;

        let delivered = timeout(WAIT, sub.next()).await.unwrap().unwrap();
        assert_eq!(delivered.data, b"payload");
        assert_eq!(delivered.source(), author);

        let again = timeout(QUIET, sub.next()).await;
        assert!(again.is_err(), "duplicate was delivered");
    }

    #[tokio::test]
    async fn forwards_to_interested_peers_only() {
        let rig = rig();
        // Local subscription so ingress messages on "t" are accepted.
        let _sub = rig.fs.subscribe("t").await.unwrap();

        let p1 = PeerId::random();
        let p2 = PeerId::random();
        let p3 = PeerId::random();
        let mut r1 = connect_peer(&rig, &p1).await;
        let mut r2 = connect_peer(&rig, &p2).await;
        let mut r3 = connect_peer(&rig, &p3).await;
        for reader in [&mut r1, &mut r2, &mut r3] {
            read_frame(reader).await; // hello
        }

        // p1 and p2 are interested in "t"; p3 is not.
        ingress(&rig, &p1, Rpc::with_subscription("t", true)).await;
        ingress(&rig, &p2, Rpc::with_subscription("t", true)).await;

        let author = PeerId::random();
        let msg = remote_message(&author, "t", b"flood", 1);
        ingress(&rig, &p1, Rpc::with_message(msg.clone())).await;

        // Forwarded to p2 exactly once; never echoed to the sender p1 or
        // sent to the uninterested p3.
        let forwarded = read_frame(&mut r2).await;
        assert_eq!(forwarded.publish.len(), 1);
        assert_eq!(forwarded.publish[0].data, b"flood");
        assert_quiet(&mut r2).await;
        assert_quiet(&mut r1).await;
        assert_quiet(&mut r3).await;
    }

    #[tokio::test]
    async fn never_forwards_back_to_the_originator() {
        let rig = rig();
        let _sub = rig.fs.subscribe("t").await.unwrap();

        let p1 = PeerId::random();
        let p2 = PeerId::random();
        let mut r1 = connect_peer(&rig, &p1).await;
        let mut r2 = connect_peer(&rig, &p2).await;
        read_frame(&mut r1).await;
        read_frame(&mut r2).await;

        ingress(&rig, &p1, Rpc::with_subscription("t", true)).await;
        ingress(&rig, &p2, Rpc::with_subscription("t", true)).await;

        // p2 authored the message; p1 relayed it to us.
        let msg = remote_message(&p2, "t", b"looped", 9);
        ingress(&rig, &p1, Rpc::with_message(msg)).await;

        assert_quiet(&mut r1).await;
        assert_quiet(&mut r2).await;
    }

    #[tokio::test]
    async fn drops_messages_on_unsubscribed_topics() {
        let rig = rig();
        let p1 = PeerId::random();
        let p2 = PeerId::random();
        let mut r1 = connect_peer(&rig, &p1).await;
        let mut r2 = connect_peer(&rig, &p2).await;
        read_frame(&mut r1).await;
        read_frame(&mut r2).await;

        ingress(&rig, &p2, Rpc::with_subscription("t", true)).await;
        let msg = remote_message(&PeerId::random(), "t", b"refused", 3);
        ingress(&rig, &p1, Rpc::with_message(msg)).await;

        // We never subscribed to "t", so nothing is forwarded.
        assert_quiet(&mut r2).await;
    }

    #[tokio::test]
    async fn local_publish_reaches_local_subscribers() {
        let rig = rig();
        let mut sub = rig.fs.subscribe("t").await.unwrap();

        rig.fs.publish("t", b"to self".to_vec()).await.unwrap();

        let delivered = timeout(WAIT, sub.next()).await.unwrap().unwrap();
        assert_eq!(delivered.data, b"to self");
        assert_eq!(&delivered.source(), rig.fs.local_peer());
        assert_eq!(delivered.seqno.len(), 8);
        assert_eq!(delivered.topic_ids, vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn multi_topic_message_delivered_once_per_matching_topic() {
        let rig = rig();
        let mut sub_a = rig.fs.subscribe("a").await.unwrap();
        let mut sub_b = rig.fs.subscribe("b").await.unwrap();

        let author = PeerId::random();
        let msg = Message {
            from: author.to_vec(),
            data: b"both".to_vec(),
            seqno: 11u64.to_be_bytes().to_vec(),
            topic_ids: vec!["a".to_string(), "b".to_string()],
        };
        ingress(&rig, &PeerId::random(), Rpc::with_message(msg)).await;

        let got_a = timeout(WAIT, sub_a.next()).await.unwrap().unwrap();
        let got_b = timeout(WAIT, sub_b.next()).await.unwrap().unwrap();
        assert_eq!(got_a.data, b"both");
        assert_eq!(got_b.data, b"both");
    }

    #[tokio::test]
    async fn get_topics_tracks_live_handles() {
        let rig = rig();
        assert!(rig.fs.get_topics().await.is_empty());

        let mut sub_a = rig.fs.subscribe("a").await.unwrap();
        let _sub_b = rig.fs.subscribe("b").await.unwrap();
        let mut topics = rig.fs.get_topics().await;
        topics.sort();
        assert_eq!(topics, vec!["a".to_string(), "b".to_string()]);

        sub_a.cancel();
        tokio::time::sleep(QUIET).await;
        assert_eq!(rig.fs.get_topics().await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn list_peers_reflects_remote_interest_and_churn() {
        let rig = rig();
        let p1 = PeerId::random();
        let p2 = PeerId::random();
        let mut r1 = connect_peer(&rig, &p1).await;
        let mut r2 = connect_peer(&rig, &p2).await;
        read_frame(&mut r1).await;
        read_frame(&mut r2).await;

        ingress(&rig, &p1, Rpc::with_subscription("z", true)).await;

        let mut all = rig.fs.list_peers("").await;
        all.sort();
        let mut expected = vec![p1.clone(), p2.clone()];
        expected.sort();
        assert_eq!(all, expected);
        assert_eq!(rig.fs.list_peers("z").await, vec![p1.clone()]);
        assert!(rig.fs.list_peers("never-announced").await.is_empty());

        // Retraction empties the topic view.
        ingress(&rig, &p1, Rpc::with_subscription("z", false)).await;
        assert!(rig.fs.list_peers("z").await.is_empty());

        // Peer-down removes the peer everywhere.
        ingress(&rig, &p2, Rpc::with_subscription("z", true)).await;
        assert_eq!(rig.fs.list_peers("z").await, vec![p2.clone()]);
        rig.events_tx
            .send(PeerEvent::Down {
                peer: p2.clone(),
                generation: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(QUIET).await;
        assert!(rig.fs.list_peers("z").await.is_empty());
        assert_eq!(rig.fs.list_peers("").await, vec![p1]);
    }

    #[tokio::test]
    async fn newer_stream_replaces_older() {
        let rig = rig();
        let remote = PeerId::random();
        let mut old_reader = connect_peer(&rig, &remote).await;
        read_frame(&mut old_reader).await;

        let mut new_reader = connect_peer(&rig, &remote).await;
        read_frame(&mut new_reader).await;

        // The replaced stream is torn down...
        let eof = timeout(WAIT, old_reader.next()).await.expect("no EOF");
        assert!(eof.is_none(), "old stream still live: {:?}", eof);

        // ...and announcements ride the new one.
        let _sub = rig.fs.subscribe("t").await.unwrap();
        let announce = read_frame(&mut new_reader).await;
        assert_eq!(announce.subscriptions[0].topicid, "t");
        assert_eq!(rig.fs.list_peers("").await, vec![remote]);
    }

    #[tokio::test]
    async fn refuses_guarded_topic_descriptors() {
        use crate::wire::{AuthMode, AuthOpts, EncMode, EncOpts, TopicDescriptor};

        let rig = rig();

        let mut guarded = TopicDescriptor::plain("locked");
        guarded.auth = Some(AuthOpts {
            mode: AuthMode::Key as i32,
            keys: Vec::new(),
        });
        let err = rig.fs.subscribe_descriptor(guarded).await.unwrap_err();
        assert_eq!(err, SubscribeError::UnsupportedAuthMode);

        let mut sealed = TopicDescriptor::plain("sealed");
        sealed.enc = Some(EncOpts {
            mode: EncMode::SharedKey as i32,
            key_hashes: Vec::new(),
        });
        let err = rig.fs.subscribe_descriptor(sealed).await.unwrap_err();
        assert_eq!(err, SubscribeError::UnsupportedEncMode);

        // Refusals leave no trace in router state.
        assert!(rig.fs.get_topics().await.is_empty());
    }

    #[tokio::test]
    async fn root_cancellation_ends_subscriptions_and_commands() {
        let rig = rig();
        let mut sub = rig.fs.subscribe("t").await.unwrap();

        rig.cancel.cancel();

        let ended = timeout(WAIT, sub.next()).await.unwrap();
        assert!(ended.is_none(), "inbox survived shutdown");
        assert!(rig.fs.publish("t", b"late".to_vec()).await.is_err());
        assert!(matches!(
            rig.fs.subscribe("t").await,
            Err(SubscribeError::Shutdown)
        ));
    }
}
