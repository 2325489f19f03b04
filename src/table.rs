//! Connection table: index allocation and the index ↔ session mapping.
//!
//! A connection index is a 16-bit handle naming one multiplexed TCP
//! connection inside the conversation; index 0 is reserved for control
//! frames and never identifies a connection.  The table is the single
//! source of truth for which indices are live: an entry exists exactly as
//! long as the server should believe the index does.
//!
//! No I/O happens here — the supervisor owns the table and performs all
//! socket work.

use std::collections::HashMap;

/// Live connections, keyed by index.
pub struct ConnTable<S> {
    conns: HashMap<u16, S>,
    /// Last issued index.  Allocation pre-increments, so a fresh table
    /// hands out 2 first.
    last_idx: u16,
}

impl<S> ConnTable<S> {
    pub fn new() -> Self {
        Self { conns: HashMap::new(), last_idx: 1 }
    }

    /// Allocate the next connection index and insert the session built by
    /// `make` for it.  Index 0 is skipped on wrap, as is any index still
    /// live.  Returns `None` when every usable index is taken.
    pub fn accept(&mut self, make: impl FnOnce(u16) -> S) -> Option<u16> {
        if self.conns.len() >= usize::from(u16::MAX) {
            return None;
        }
        loop {
            self.last_idx = self.last_idx.wrapping_add(1);
            if self.last_idx != 0 && !self.conns.contains_key(&self.last_idx) {
                break;
            }
        }
        let idx = self.last_idx;
        self.conns.insert(idx, make(idx));
        Some(idx)
    }

    pub fn get(&self, idx: u16) -> Option<&S> {
        self.conns.get(&idx)
    }

    /// Remove and return the session for `idx`; `None` if already gone.
    pub fn remove(&mut self, idx: u16) -> Option<S> {
        self.conns.remove(&idx)
    }

    /// Remove every live entry, returning them (the shutdown path).
    pub fn drain(&mut self) -> Vec<(u16, S)> {
        self.conns.drain().collect()
    }

    /// Indices of every live connection, in no particular order.
    pub fn indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.conns.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl<S> Default for ConnTable<S> {
    fn default() -> Self {
        Self::new()
    }
}
