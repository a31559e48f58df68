//! Peer identifiers.
//!
//! A [`PeerId`] is an opaque byte string naming a host on the overlay. The
//! router never inspects its contents: identifiers are compared bytewise,
//! used as map keys, and concatenated with sequence numbers to form message
//! identities. Hosts on this overlay mint 32-byte random identifiers, but
//! any byte string a remote presents (for example in the `from` field of a
//! published message) is accepted as-is.

use std::fmt;

use rand::RngCore;

/// Length of locally generated peer identifiers.
pub const PEER_ID_LEN: usize = 32;

/// Opaque identifier of a peer on the overlay.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    /// Wrap raw identifier bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        PeerId(bytes.into())
    }

    /// Generate a fresh random 32-byte identifier.
    pub fn random() -> Self {
        let mut bytes = vec![0u8; PEER_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.clone()
    }

    /// Full identifier as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for PeerId {
    /// Truncated hex form used in logs; see [`PeerId::to_hex`] for the full
    /// identifier.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = &self.0[..self.0.len().min(8)];
        write!(f, "{}", hex::encode(shown))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
