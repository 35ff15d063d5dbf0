//! Per-partition bookkeeping of delivered offsets.
//!
//! Several workers drain one consumer and finish tasks out of order. Kafka commits are a
//! single watermark per partition, so committing the offset of whichever task finished
//! last would skip tasks still running below it. The tracker only releases a commit
//! offset once every delivered offset beneath it has finished.

use std::collections::{BTreeMap, HashMap};

/// Result of finishing one delivered offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The offset was never delivered or already finished.
    Unknown,
    /// Finished, but a lower offset on the same partition is still running.
    Pending,
    /// Every offset below this value has finished; commit it.
    Commit(i64),
}

/// Tracks in-flight and finished offsets for each partition.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, BTreeMap<i64, bool>>,
}

impl OffsetTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivered offset as running.
    pub fn start(&mut self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .or_default()
            .insert(offset, false);
    }

    /// Mark an offset finished and return the offset that can now be committed.
    ///
    /// The commit offset follows Kafka's convention: it is the next offset to consume.
    pub fn finish(&mut self, partition: i32, offset: i64) -> Completion {
        let Some(offsets) = self.partitions.get_mut(&partition) else {
            return Completion::Unknown;
        };
        match offsets.get_mut(&offset) {
            Some(done) if !*done => *done = true,
            _ => return Completion::Unknown,
        }

        let mut committed = None;
        while let Some(entry) = offsets.first_entry() {
            if !*entry.get() {
                break;
            }
            committed = Some(*entry.key() + 1);
            entry.remove();
        }

        committed.map_or(Completion::Pending, Completion::Commit)
    }

    /// Number of delivered offsets not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.partitions
            .values()
            .map(|offsets| offsets.values().filter(|done| !**done).count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_finishes_commit_immediately() {
        let mut tracker = OffsetTracker::new();
        tracker.start(0, 10);
        tracker.start(0, 11);

        assert_eq!(tracker.finish(0, 10), Completion::Commit(11));
        assert_eq!(tracker.finish(0, 11), Completion::Commit(12));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn out_of_order_finish_waits_for_lower_offset() {
        let mut tracker = OffsetTracker::new();
        tracker.start(0, 10);
        tracker.start(0, 11);
        tracker.start(0, 12);

        assert_eq!(tracker.finish(0, 12), Completion::Pending);
        assert_eq!(tracker.finish(0, 11), Completion::Pending);
        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(tracker.finish(0, 10), Completion::Commit(13));
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        tracker.start(0, 5);
        tracker.start(1, 7);

        assert_eq!(tracker.finish(1, 7), Completion::Commit(8));
        assert_eq!(tracker.in_flight(), 1);
    }

    #[test]
    fn unknown_and_repeated_finishes_are_reported() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.finish(3, 1), Completion::Unknown);

        tracker.start(0, 1);
        tracker.start(0, 2);
        assert_eq!(tracker.finish(0, 2), Completion::Pending);
        assert_eq!(tracker.finish(0, 2), Completion::Unknown);
    }
}
