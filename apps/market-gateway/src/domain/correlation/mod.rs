//! Sequence Correlation
//!
//! Tracks outstanding requests by sequence id so responses are matched by
//! id rather than arrival order. Each entry carries a caller-defined
//! context; removing it hands the context back exactly once.
//!
//! Acting on an unknown id is never an error: it returns `None` and logs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Why a request left the table without a matching response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Upstream returned an error for this sequence id.
    Server {
        /// Raw error code.
        code: i32,
        /// Upstream message.
        message: String,
    },
    /// Caller gave up waiting.
    Abandoned,
    /// Connection teardown.
    ConnectionClosed,
}

#[derive(Debug)]
struct Entry<C> {
    context: C,
    created_at: Instant,
}

/// Outstanding requests of one connection.
#[derive(Debug)]
pub struct SequenceCorrelator<C> {
    next: u32,
    pending: HashMap<u32, Entry<C>>,
}

impl<C> Default for SequenceCorrelator<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> SequenceCorrelator<C> {
    /// Empty table; the first id handed out is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate the next sequence id. Zero is skipped on wrap.
    pub const fn next_sequence_id(&mut self) -> u32 {
        let id = self.next;
        self.next = match self.next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }

    /// Track `context` under `seq`.
    ///
    /// Returns `false` and leaves the existing entry in place if `seq` is
    /// already pending.
    pub fn register(&mut self, seq: u32, context: C) -> bool {
        if self.pending.contains_key(&seq) {
            tracing::warn!(sequence_id = seq, "Sequence id already pending");
            return false;
        }
        self.pending.insert(
            seq,
            Entry {
                context,
                created_at: Instant::now(),
            },
        );
        true
    }

    /// Allocate an id and register `context` under it.
    pub fn track(&mut self, context: C) -> u32 {
        loop {
            let seq = self.next_sequence_id();
            if !self.pending.contains_key(&seq) {
                self.pending.insert(
                    seq,
                    Entry {
                        context,
                        created_at: Instant::now(),
                    },
                );
                return seq;
            }
        }
    }

    /// Remove and return the context for a matched response.
    pub fn resolve(&mut self, seq: u32) -> Option<C> {
        let entry = self.pending.remove(&seq);
        if entry.is_none() {
            tracing::debug!(sequence_id = seq, "Resolve for untracked sequence id");
        }
        entry.map(|e| e.context)
    }

    /// Remove and return the context for a failed request.
    pub fn reject(&mut self, seq: u32, reason: &RejectReason) -> Option<C> {
        match self.pending.remove(&seq) {
            Some(entry) => {
                tracing::debug!(
                    sequence_id = seq,
                    ?reason,
                    age_ms = u64::try_from(entry.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Pending request rejected"
                );
                Some(entry.context)
            }
            None => {
                tracing::debug!(sequence_id = seq, ?reason, "Reject for untracked sequence id");
                None
            }
        }
    }

    /// Drain every pending entry, oldest first.
    pub fn reject_all(&mut self, reason: &RejectReason) -> Vec<(u32, C)> {
        let mut drained: Vec<_> = self.pending.drain().collect();
        drained.sort_by_key(|(_, entry)| entry.created_at);
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), ?reason, "Rejecting all pending requests");
        }
        drained
            .into_iter()
            .map(|(seq, entry)| (seq, entry.context))
            .collect()
    }

    /// Whether `seq` is pending.
    #[must_use]
    pub fn contains(&self, seq: u32) -> bool {
        self.pending.contains_key(&seq)
    }

    /// Context of a pending entry.
    #[must_use]
    pub fn get(&self, seq: u32) -> Option<&C> {
        self.pending.get(&seq).map(|e| &e.context)
    }

    /// Ids pending longer than `age`.
    #[must_use]
    pub fn older_than(&self, age: Duration) -> Vec<u32> {
        self.pending
            .iter()
            .filter(|(_, e)| e.created_at.elapsed() > age)
            .map(|(seq, _)| *seq)
            .collect()
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
