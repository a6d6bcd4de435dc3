//! Outstanding delivery-tag bookkeeping for one consumer.

use std::collections::BTreeSet;
use std::sync::Mutex;

/// Ordered set of in-flight delivery tags.
///
/// Tags arrive strictly increasing per channel, but acknowledgements may
/// come back out of order, so an ordered set rather than a watermark is
/// required. All operations serialize on one lock; this runs at consumer
/// delivery rate, not publish rate.
#[derive(Debug, Default)]
pub struct AckTracker {
    tags: Mutex<BTreeSet<u64>>,
}

impl AckTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `tag` as delivered and awaiting acknowledgement.
    pub fn track(&self, tag: u64) {
        self.tags.lock().unwrap().insert(tag);
    }

    /// Removes `tag`; with `multiple`, removes every tracked tag ≤ `tag`.
    /// Unknown tags are a no-op.
    pub fn ack(&self, tag: u64, multiple: bool) {
        let mut tags = self.tags.lock().unwrap();
        if multiple {
            if tag == u64::MAX {
                tags.clear();
            } else {
                *tags = tags.split_off(&(tag + 1));
            }
        } else {
            tags.remove(&tag);
        }
    }

    /// Same removal semantics as [`ack`](Self::ack): a rejected delivery
    /// is no longer in flight either.
    pub fn nack(&self, tag: u64, multiple: bool) {
        self.ack(tag, multiple);
    }

    /// Snapshot of the outstanding tags in ascending order.
    pub fn unacked(&self) -> Vec<u64> {
        self.tags.lock().unwrap().iter().copied().collect()
    }

    /// Number of outstanding tags.
    pub fn count(&self) -> usize {
        self.tags.lock().unwrap().len()
    }

    /// Forgets every outstanding tag.
    pub fn clear(&self) {
        self.tags.lock().unwrap().clear();
    }
}
