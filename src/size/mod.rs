mod backoff;
mod snapshot;

pub use backoff::Backoff;

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use seize::{reclaim, Guard};

use self::snapshot::CountersSnapshot;
use crate::cfg::trace;
use crate::raw::utils::CachePadded;

// The kinds of updates tracked by the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Insert = 0,
    Remove = 1,
}

impl OpKind {
    pub const COUNT: usize = 2;
}

// Identifies the `seq`-th insert or remove issued by thread `tid`.
//
// Ties a structural change in the tree to the ledger increment it owes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateInfo {
    pub tid: usize,
    pub seq: u64,
}

// Computes a linearizable size from per-thread update counters.
//
// Every linearized insert or remove advances its thread's counter exactly
// once, through `update_metadata`. A `size` call collects all counters into a
// shared snapshot; updates that land while the snapshot is collecting forward
// their new counter into it, so the snapshot never misses an update that is
// already visible.
pub struct SizeCalculator {
    counters: Box<[CachePadded<[AtomicU64; OpKind::COUNT]>]>,
    snapshot: AtomicPtr<CountersSnapshot>,
}

impl SizeCalculator {
    pub fn new(threads: usize) -> SizeCalculator {
        let snapshot = Box::new(CountersSnapshot::deactivated(threads));

        SizeCalculator {
            counters: (0..threads).map(|_| CachePadded::default()).collect(),
            snapshot: AtomicPtr::new(Box::into_raw(snapshot)),
        }
    }

    #[inline]
    pub fn threads(&self) -> usize {
        self.counters.len()
    }

    #[inline]
    fn counter(&self, tid: usize, kind: OpKind) -> &AtomicU64 {
        &self.counters[tid][kind as usize]
    }

    // Returns the number of completed updates of the given kind issued by `tid`.
    #[inline]
    pub fn thread_counter(&self, tid: usize, kind: OpKind) -> u64 {
        self.counter(tid, kind).load(Ordering::SeqCst)
    }

    // Creates the ledger entry for the next update of the given kind by `tid`.
    //
    // Only the thread holding `tid` may call this, and the previous update of
    // the same kind must already be reflected in the ledger.
    #[inline]
    pub fn create_update_info(&self, tid: usize, kind: OpKind) -> UpdateInfo {
        UpdateInfo {
            tid,
            seq: self.thread_counter(tid, kind) + 1,
        }
    }

    // Records a linearized update in the ledger.
    //
    // This is idempotent: any thread that observes the update may call it, and
    // the counter advances exactly once. If a size computation is collecting,
    // the new counter is forwarded into its snapshot.
    pub fn update_metadata(&self, kind: OpKind, info: UpdateInfo, guard: &impl Guard) {
        let counter = self.counter(info.tid, kind);

        if counter.load(Ordering::SeqCst) == info.seq - 1 {
            let _ = counter.compare_exchange(
                info.seq - 1,
                info.seq,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }

        // Safety: snapshots are only retired after being replaced, and we are
        // protected by the guard.
        let snapshot = unsafe { &*guard.protect(&self.snapshot, Ordering::SeqCst) };

        if snapshot.is_collecting() && counter.load(Ordering::SeqCst) == info.seq {
            snapshot.forward(info.tid, kind, info.seq);
        }
    }

    // Returns the number of keys at some instant during the call.
    pub fn compute(&self, backoff: &Backoff, guard: &impl Guard) -> usize {
        let current = guard.protect(&self.snapshot, Ordering::SeqCst);

        // Safety: see `update_metadata`.
        let (active, contended) = if unsafe { (*current).is_collecting() } {
            (current, true)
        } else {
            let new = Box::into_raw(Box::new(CountersSnapshot::new(self.threads())));

            match self.snapshot.compare_exchange(
                current,
                new,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    trace!("installed a new counters snapshot");

                    // Safety: the old snapshot is unreachable for new guards, and
                    // we won the race to replace it.
                    unsafe { guard.defer_retire(current, reclaim::boxed) };
                    (new, false)
                }
                Err(found) => {
                    // Safety: `new` was never shared.
                    let _ = unsafe { Box::from_raw(new) };
                    (found, true)
                }
            }
        };

        // Safety: protected by the guard.
        let active = unsafe { &*active };

        // Another `size` is collecting, give it a chance to publish its result.
        if contended {
            trace!("adopting a concurrent counters snapshot");
            backoff.snooze();

            if let Some(size) = active.size() {
                return size;
            }
        }

        self.collect(active);
        active.deactivate();
        active.compute_size(backoff)
    }

    fn collect(&self, snapshot: &CountersSnapshot) {
        for tid in 0..self.threads() {
            for kind in [OpKind::Insert, OpKind::Remove] {
                snapshot.add(tid, kind, self.thread_counter(tid, kind));
            }
        }
    }
}

impl Drop for SizeCalculator {
    fn drop(&mut self) {
        // Safety: we have exclusive access, and retired snapshots are owned
        // by the collector.
        let _ = unsafe { Box::from_raw(*self.snapshot.get_mut()) };
    }
}
