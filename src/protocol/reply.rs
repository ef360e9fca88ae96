//! Request/response correlation.
//!
//! Each connection owns one `ReplyTable`. Sending with a reply allocates a
//! slot, stores a one-shot callback under it and stamps `TypeID = 10 + slot`
//! on the outgoing message. The peer answers with the same TypeID, and the
//! worker that receives the answer takes the callback out and runs it.
//!
//! Both ends of a link may issue requests, and the wire carries no
//! request/response bit. The slot space is therefore split: clients allocate
//! from the lower half, servers from the upper half. A received TypeID >= 10
//! whose slot falls in our own half is an answer; any other is a request
//! that expects one.

use crate::core::uint24::UInt24;
use crate::protocol::message::{Message, REPLY_BASE};
use crate::protocol::router::Role;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// One-shot continuation run with the reply
pub type ReplyCallback = Box<dyn FnOnce(Message) + Send + Sync + 'static>;

/// Number of distinct slots that fit in a TypeID
const SLOT_SPACE: u32 = UInt24::MAX.get() - REPLY_BASE + 1;

/// First slot of the server half
const SERVER_BASE: u32 = SLOT_SPACE / 2;

pub struct ReplyTable {
    base: u32,
    span: u32,
    next: AtomicU32,
    pending: DashMap<u32, ReplyCallback>,
}

impl Default for ReplyTable {
    fn default() -> Self {
        Self::new(Role::Client)
    }
}

impl ReplyTable {
    pub fn new(role: Role) -> Self {
        let (base, span) = match role {
            Role::Client => (0, SERVER_BASE),
            Role::Server => (SERVER_BASE, SLOT_SPACE - SERVER_BASE),
        };
        Self {
            base,
            span,
            next: AtomicU32::new(0),
            pending: DashMap::new(),
        }
    }

    /// Whether `slot` was allocated by this side of the link.
    pub fn owns(&self, slot: u32) -> bool {
        slot >= self.base && slot - self.base < self.span
    }

    /// Stores `callback` and returns its slot.
    ///
    /// Slots wrap inside this side's half and skip ones still outstanding.
    pub fn register(&self, callback: ReplyCallback) -> u32 {
        let mut callback = Some(callback);
        loop {
            let slot = self.base + self.next.fetch_add(1, Ordering::Relaxed) % self.span;
            if let dashmap::mapref::entry::Entry::Vacant(entry) = self.pending.entry(slot) {
                if let Some(cb) = callback.take() {
                    entry.insert(cb);
                }
                return slot;
            }
        }
    }

    /// Runs and removes the callback for the reply's slot.
    ///
    /// Returns `false` when the message carries no slot or the slot is not
    /// outstanding.
    pub fn resolve(&self, message: Message) -> bool {
        let Some(slot) = message.reply_id() else {
            return false;
        };
        match self.pending.remove(&slot) {
            Some((_, callback)) => {
                callback(message);
                true
            }
            None => false,
        }
    }

    /// Forgets a slot without running it.
    pub fn cancel(&self, slot: u32) -> bool {
        self.pending.remove(&slot).is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops every outstanding callback.
    pub fn clear(&self) {
        self.pending.clear();
    }
}

impl std::fmt::Debug for ReplyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyTable")
            .field("pending", &self.pending.len())
            .finish()
    }
}
