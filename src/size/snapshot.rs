use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{Backoff, OpKind};
use crate::cfg::trace;

// A snapshot of the per-thread update counters, shared by every `size`
// call that overlaps its collection.
//
// Each cell is written at most once by a collector, but may be raised by
// forwarding updates while the snapshot is collecting. The computed size is
// published once, first writer wins.
pub struct CountersSnapshot {
    cells: Box<[AtomicU64]>,
    collecting: AtomicBool,
    size: AtomicU64,
}

impl CountersSnapshot {
    // Marks a cell that has not been observed yet.
    const INVALID_COUNTER: u64 = u64::MAX;

    // Marks a size that has not been published yet.
    const INVALID_SIZE: u64 = u64::MAX;

    // Creates a collecting snapshot.
    pub fn new(threads: usize) -> CountersSnapshot {
        CountersSnapshot {
            cells: (0..threads * OpKind::COUNT)
                .map(|_| AtomicU64::new(CountersSnapshot::INVALID_COUNTER))
                .collect(),
            collecting: AtomicBool::new(true),
            size: AtomicU64::new(CountersSnapshot::INVALID_SIZE),
        }
    }

    // Creates a snapshot that has already finished collecting.
    pub fn deactivated(threads: usize) -> CountersSnapshot {
        let snapshot = CountersSnapshot::new(threads);
        snapshot.deactivate();
        snapshot
    }

    #[inline]
    fn cell(&self, tid: usize, kind: OpKind) -> &AtomicU64 {
        &self.cells[tid * OpKind::COUNT + kind as usize]
    }

    #[inline]
    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }

    // Ends the collection phase. This is the linearization point of `size`.
    #[inline]
    pub fn deactivate(&self) {
        self.collecting.store(false, Ordering::SeqCst);
    }

    // Records a counter value observed by a collector, unless the cell
    // was already recorded.
    pub fn add(&self, tid: usize, kind: OpKind, counter: u64) {
        let cell = self.cell(tid, kind);

        if cell.load(Ordering::SeqCst) == CountersSnapshot::INVALID_COUNTER {
            let _ = cell.compare_exchange(
                CountersSnapshot::INVALID_COUNTER,
                counter,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }

    // Records a counter value on behalf of an update that linearized during
    // collection, raising an earlier, lower recording if necessary.
    pub fn forward(&self, tid: usize, kind: OpKind, counter: u64) {
        let cell = self.cell(tid, kind);
        let mut current = cell.load(Ordering::SeqCst);

        // At most two iterations: the counter moves by one per update, and only
        // collectors or forwarders of the same update race here.
        while current == CountersSnapshot::INVALID_COUNTER || counter > current {
            match cell.compare_exchange(current, counter, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => {
                    trace!("forwarded counter {} for thread {} ({:?})", counter, tid, kind);
                    break;
                }
                Err(found) => current = found,
            }
        }
    }

    // Returns the published size, if any.
    #[inline]
    pub fn size(&self) -> Option<usize> {
        match self.size.load(Ordering::SeqCst) {
            CountersSnapshot::INVALID_SIZE => None,
            size => Some(saturating_usize(size)),
        }
    }

    // Computes the size from the recorded cells and publishes it, or adopts
    // the size published by a concurrent computation.
    pub fn compute_size(&self, backoff: &Backoff) -> usize {
        if let Some(size) = self.size() {
            backoff.increase();
            return size;
        }

        let mut size: i64 = 0;
        for tid in 0..self.cells.len() / OpKind::COUNT {
            let inserts = self.cell(tid, OpKind::Insert).load(Ordering::SeqCst);
            let removes = self.cell(tid, OpKind::Remove).load(Ordering::SeqCst);
            debug_assert_ne!(inserts, CountersSnapshot::INVALID_COUNTER);
            debug_assert_ne!(removes, CountersSnapshot::INVALID_COUNTER);
            size += inserts as i64 - removes as i64;
        }

        if let Some(size) = self.size() {
            backoff.increase();
            return size;
        }

        // A single thread may remove keys inserted by another, so only the total
        // is guaranteed to be non-negative.
        let computed = u64::try_from(size).unwrap_or(0);

        match self.size.compare_exchange(
            CountersSnapshot::INVALID_SIZE,
            computed,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                backoff.decrease();
                saturating_usize(computed)
            }
            Err(published) => {
                backoff.increase();
                saturating_usize(published)
            }
        }
    }
}

// Sizes beyond the address space saturate.
#[inline]
fn saturating_usize(size: u64) -> usize {
    usize::try_from(size).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_collector_wins() {
        let snapshot = CountersSnapshot::new(1);
        snapshot.add(0, OpKind::Insert, 3);
        snapshot.add(0, OpKind::Insert, 5);
        snapshot.add(0, OpKind::Remove, 1);
        snapshot.deactivate();

        assert_eq!(snapshot.compute_size(&Backoff::new()), 2);
    }

    #[test]
    fn forward_raises_recorded_counter() {
        let snapshot = CountersSnapshot::new(1);
        snapshot.add(0, OpKind::Insert, 3);
        snapshot.forward(0, OpKind::Insert, 4);
        // A stale forward never lowers a cell.
        snapshot.forward(0, OpKind::Insert, 2);
        snapshot.forward(0, OpKind::Remove, 1);
        snapshot.add(0, OpKind::Remove, 0);
        snapshot.deactivate();

        assert_eq!(snapshot.compute_size(&Backoff::new()), 3);
    }

    #[test]
    fn published_size_is_adopted() {
        let snapshot = CountersSnapshot::new(2);
        for tid in 0..2 {
            snapshot.add(tid, OpKind::Insert, 2);
            snapshot.add(tid, OpKind::Remove, 0);
        }
        snapshot.deactivate();

        let backoff = Backoff::new();
        assert_eq!(snapshot.size(), None);
        assert_eq!(snapshot.compute_size(&backoff), 4);
        assert_eq!(snapshot.size(), Some(4));

        // Later computations adopt the published value and back off.
        assert_eq!(snapshot.compute_size(&backoff), 4);
        assert_eq!(backoff.amount(), 2);
    }

    #[test]
    fn cross_thread_removals() {
        let snapshot = CountersSnapshot::new(2);
        snapshot.add(0, OpKind::Insert, 5);
        snapshot.add(0, OpKind::Remove, 0);
        snapshot.add(1, OpKind::Insert, 0);
        snapshot.add(1, OpKind::Remove, 4);
        snapshot.deactivate();

        assert_eq!(snapshot.compute_size(&Backoff::new()), 1);
    }

    #[test]
    fn sizes_saturate() {
        let beyond_u32 = u64::from(u32::MAX) + 1;
        let expected = if usize::BITS < 64 {
            usize::MAX
        } else {
            beyond_u32 as usize
        };
        assert_eq!(saturating_usize(beyond_u32), expected);

        let snapshot = CountersSnapshot::new(1);
        snapshot.deactivate();
        snapshot.size.store(beyond_u32, Ordering::SeqCst);

        assert_eq!(snapshot.size(), Some(expected));
        assert_eq!(snapshot.compute_size(&Backoff::new()), expected);
    }
}
