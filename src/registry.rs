use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cfg::trace;

/// An error returned when a thread cannot be registered with a tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// Every thread slot is held by a live [`Handle`](crate::Handle).
    Exhausted {
        /// The number of slots the tree was built with.
        max_threads: usize,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Exhausted { max_threads } => write!(
                f,
                "all {max_threads} thread slots are in use, drop a handle or raise `max_threads`"
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

// Hands out small, stable thread ids in `0..max_threads`.
//
// An id indexes the per-thread update counters of the size calculator, so
// at most one thread may drive a given id at a time. Ids are recycled when
// their slot is dropped, and the counters they index carry over to the next
// holder.
pub struct ThreadRegistry {
    slots: Box<[AtomicBool]>,
}

impl ThreadRegistry {
    pub fn new(max_threads: usize) -> ThreadRegistry {
        assert!(max_threads > 0, "a tree needs at least one thread slot");

        ThreadRegistry {
            slots: (0..max_threads).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    #[inline]
    pub fn max_threads(&self) -> usize {
        self.slots.len()
    }

    // Claims the first free slot.
    pub fn register(&self) -> Result<ThreadSlot<'_>, RegistryError> {
        for (id, slot) in self.slots.iter().enumerate() {
            if slot.load(Ordering::Relaxed) {
                continue;
            }

            if slot
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                trace!("registered thread slot {}", id);
                return Ok(ThreadSlot { id, registry: self });
            }
        }

        Err(RegistryError::Exhausted {
            max_threads: self.max_threads(),
        })
    }
}

// A claimed thread id, released on drop.
pub struct ThreadSlot<'r> {
    id: usize,
    registry: &'r ThreadRegistry,
}

impl ThreadSlot<'_> {
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for ThreadSlot<'_> {
    fn drop(&mut self) {
        trace!("released thread slot {}", self.id);
        self.registry.slots[self.id].store(false, Ordering::Release);
    }
}
