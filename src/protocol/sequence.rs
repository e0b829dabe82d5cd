//! Sequence number allocation and inbound ordering checks.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::warn;

use super::header::Header;
use crate::core::SequencePolicy;

/// Per-connection sequence allocator.
///
/// Allocation is a single atomic increment, so concurrent senders always
/// receive distinct, strictly increasing values.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: AtomicU32,
}

impl SequenceAllocator {
    /// Creates an allocator whose first value is 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates an allocator with an explicit first value
    pub fn starting_at(first: u32) -> Self {
        SequenceAllocator {
            next: AtomicU32::new(first),
        }
    }

    /// Draws the next sequence number
    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Value the next call to `allocate` will return
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of checking one inbound header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceVerdict {
    /// Strictly newer than anything seen
    InOrder,
    /// Duplicate or older, but the policy accepts it
    Accepted,
    /// Duplicate or older, and the policy drops it
    Rejected,
}

/// Tracks the highest inbound sequence seen on one connection
#[derive(Debug)]
pub struct SequenceTracker {
    policy: SequencePolicy,
    highest: Option<u32>,
}

impl SequenceTracker {
    /// Creates a tracker for a fresh connection
    pub fn new(policy: SequencePolicy) -> Self {
        SequenceTracker {
            policy,
            highest: None,
        }
    }

    /// Checks a header against the connection's history.
    ///
    /// Caller-sequenced frames are retransmissions and are always accepted.
    pub fn observe(&mut self, header: &Header) -> SequenceVerdict {
        if header.has_sequence_override() {
            return SequenceVerdict::InOrder;
        }

        let sequence = header.sequence;
        match self.highest {
            Some(highest) if sequence <= highest => match self.policy {
                SequencePolicy::Lenient => SequenceVerdict::Accepted,
                SequencePolicy::Warn => {
                    warn!(sequence, highest, kind = header.message_type.name(), "inbound frame out of order");
                    SequenceVerdict::Accepted
                }
                SequencePolicy::Reject => SequenceVerdict::Rejected,
            },
            _ => {
                self.highest = Some(sequence);
                SequenceVerdict::InOrder
            }
        }
    }

    /// Highest in-order sequence seen so far
    pub fn highest(&self) -> Option<u32> {
        self.highest
    }
}
