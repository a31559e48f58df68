//! Wire schema and framing for the `/floodsub/1.0.0` protocol.
//!
//! The schema is frozen: field tags must not change, and unknown fields in
//! incoming frames are skipped, so newer peers can extend the protocol
//! without breaking older ones.
//!
//! | Type | Field | Tag |
//! |------|-------|-----|
//! | [`Rpc`] | `subscriptions` | 1 |
//! | [`Rpc`] | `publish` | 2 |
//! | [`SubOpts`] | `subscribe` | 1 |
//! | [`SubOpts`] | `topicid` | 2 |
//! | [`Message`] | `from` | 1 |
//! | [`Message`] | `data` | 2 |
//! | [`Message`] | `seqno` | 3 |
//! | [`Message`] | `topic_ids` | 4 |
//!
//! On the stream, each frame is an unsigned varint byte count followed by
//! the protobuf-encoded [`Rpc`]. [`RpcCodec`] implements that framing for
//! `tokio_util::codec`, rejecting frames larger than [`MAX_FRAME_SIZE`]
//! before buffering them.

use std::fmt;
use std::io;

use bytes::{Buf, BytesMut};
use prost::Message as _;
use tokio_util::codec::{Decoder, Encoder};

use crate::identity::PeerId;

/// Protocol identifier registered with the host's stream multiplexer.
pub const PROTOCOL_ID: &str = "/floodsub/1.0.0";

/// Hard ceiling on a single frame's payload size.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Longest varint length prefix we accept (enough for any u64).
const MAX_VARINT_LEN: usize = 10;

// ============================================================================
// RPC schema (frozen)
// ============================================================================

/// One framed wire unit: subscription announcements and/or messages.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Rpc {
    #[prost(message, repeated, tag = "1")]
    pub subscriptions: Vec<SubOpts>,
    #[prost(message, repeated, tag = "2")]
    pub publish: Vec<Message>,
}

impl Rpc {
    /// Frame carrying a single subscription announcement.
    pub fn with_subscription(topic: impl Into<String>, subscribe: bool) -> Self {
        Rpc {
            subscriptions: vec![SubOpts {
                subscribe,
                topicid: topic.into(),
            }],
            publish: Vec::new(),
        }
    }

    /// Frame carrying a single message.
    pub fn with_message(message: Message) -> Self {
        Rpc {
            subscriptions: Vec::new(),
            publish: vec![message],
        }
    }
}

/// Announcement that the sending peer starts or stops a topic subscription.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubOpts {
    #[prost(bool, tag = "1")]
    pub subscribe: bool,
    #[prost(string, tag = "2")]
    pub topicid: String,
}

/// The unit of payload flood.
///
/// `from` names the originator, not the forwarder; together with `seqno`
/// it forms the message identity used for deduplication. Originators on
/// this host stamp `seqno` with the current wall-clock nanoseconds as
/// eight big-endian bytes; remote seqnos of any length are accepted and
/// treated as opaque.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(bytes = "vec", tag = "1")]
    pub from: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub seqno: Vec<u8>,
    #[prost(string, repeated, tag = "4")]
    pub topic_ids: Vec<String>,
}

impl Message {
    /// The originator's peer id.
    pub fn source(&self) -> PeerId {
        PeerId::from_bytes(self.from.clone())
    }

    /// Identity used for deduplication: `from` and `seqno` concatenated.
    pub fn id(&self) -> MessageId {
        let mut bytes = Vec::with_capacity(self.from.len() + self.seqno.len());
        bytes.extend_from_slice(&self.from);
        bytes.extend_from_slice(&self.seqno);
        MessageId(bytes)
    }
}

/// Deduplication identity of a [`Message`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MessageId(Vec<u8>);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0))
    }
}

// ============================================================================
// Topic descriptors
// ============================================================================

/// Description of a topic referenced at subscribe time.
///
/// Only the authentication and encryption modes are interpreted, and both
/// must be NONE (absent option blocks count as NONE). The key material
/// fields exist for schema compatibility and are never read.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopicDescriptor {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub auth: Option<AuthOpts>,
    #[prost(message, optional, tag = "3")]
    pub enc: Option<EncOpts>,
}

impl TopicDescriptor {
    /// Descriptor for a plain topic: no authentication, no encryption.
    pub fn plain(name: impl Into<String>) -> Self {
        TopicDescriptor {
            name: name.into(),
            auth: None,
            enc: None,
        }
    }

    /// Raw authentication mode, with an absent block meaning NONE.
    pub fn auth_mode(&self) -> i32 {
        self.auth.as_ref().map_or(AuthMode::None as i32, |a| a.mode)
    }

    /// Raw encryption mode, with an absent block meaning NONE.
    pub fn enc_mode(&self) -> i32 {
        self.enc.as_ref().map_or(EncMode::None as i32, |e| e.mode)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthOpts {
    #[prost(enumeration = "AuthMode", tag = "1")]
    pub mode: i32,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub keys: Vec<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AuthMode {
    None = 0,
    Key = 1,
    Wot = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncOpts {
    #[prost(enumeration = "EncMode", tag = "1")]
    pub mode: i32,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub key_hashes: Vec<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EncMode {
    None = 0,
    SharedKey = 1,
    Wot = 2,
}

// ============================================================================
// Framing codec
// ============================================================================

/// Length-delimited [`Rpc`] codec: unsigned varint byte count, then the
/// encoded frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct RpcCodec;

impl Decoder for RpcCodec {
    type Item = Rpc;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Rpc>, io::Error> {
        let mut len: u64 = 0;
        let mut header = 0;
        loop {
            if header == src.len() {
                // Length prefix not complete yet.
                return Ok(None);
            }
            if header == MAX_VARINT_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "frame length prefix exceeds varint bounds",
                ));
            }
            let byte = src[header];
            len |= u64::from(byte & 0x7f) << (7 * header as u32);
            header += 1;
            if byte & 0x80 == 0 {
                break;
            }
        }

        let len = len as usize;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_SIZE),
            ));
        }
        if src.len() < header + len {
            src.reserve(header + len - src.len());
            return Ok(None);
        }

        src.advance(header);
        let frame = src.split_to(len).freeze();
        let rpc = Rpc::decode(frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(rpc))
    }
}

impl Encoder<Rpc> for RpcCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Rpc, dst: &mut BytesMut) -> Result<(), io::Error> {
        let len = item.encoded_len();
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_SIZE),
            ));
        }
        dst.reserve(prost::length_delimiter_len(len) + len);
        prost::encoding::encode_varint(len as u64, dst);
        item.encode(dst)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(())
    }
}
