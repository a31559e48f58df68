//! Time-bounded set of message identities.
//!
//! The router records every message identity it delivers or forwards; a
//! second observation inside the retention window is dropped before any
//! delivery. Entries silently age out, so the set's size tracks recent
//! traffic rather than total history.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::wire::MessageId;

/// Default retention window for observed message identities.
pub const DEFAULT_SEEN_WINDOW: Duration = Duration::from_secs(30);

/// Set membership with a fixed retention window.
///
/// Additions are idempotent while the entry is live; once an entry has
/// aged out, the identity may be added (and thus delivered) again. Expired
/// entries are swept lazily on every call, keeping `entries` and `order`
/// in lockstep: at most one queue slot per live identity.
pub struct TimeCache {
    window: Duration,
    entries: HashMap<MessageId, Instant>,
    order: VecDeque<(MessageId, Instant)>,
}

impl TimeCache {
    pub fn new(window: Duration) -> Self {
        TimeCache {
            window,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record an identity. A no-op if it is already live.
    pub fn add(&mut self, id: MessageId) {
        self.sweep(Instant::now());
        if self.entries.contains_key(&id) {
            return;
        }
        let now = Instant::now();
        self.entries.insert(id.clone(), now);
        self.order.push_back((id, now));
    }

    /// Whether the identity was added within the retention window.
    pub fn has(&mut self, id: &MessageId) -> bool {
        self.sweep(Instant::now());
        self.entries.contains_key(id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&mut self, now: Instant) {
        while let Some((_, added)) = self.order.front() {
            if now.duration_since(*added) < self.window {
                break;
            }
            if let Some((id, _)) = self.order.pop_front() {
                self.entries.remove(&id);
            }
        }
    }
}
