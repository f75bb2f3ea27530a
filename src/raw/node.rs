use std::borrow::Borrow;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use seize::{reclaim, Guard};

use crate::size::UpdateInfo;

// A node in the external tree. Keys live in the leaves, internal nodes only
// route searches.
pub enum Node<K, V> {
    Internal(Internal<K, V>),
    Leaf(Leaf<K, V>),
}

// A routing node.
//
// `key` is `None` for the sentinel routing keys, which compare greater than
// every real key. The children only change through a CAS performed while
// `info` holds the flag of the operation doing it.
pub struct Internal<K, V> {
    pub key: Option<K>,
    pub left: AtomicPtr<Node<K, V>>,
    pub right: AtomicPtr<Node<K, V>>,
    pub info: AtomicPtr<Record<K, V>>,
}

// A leaf holding an entry, or nothing for the two sentinel leaves.
//
// The entry of a leaf never changes: a new value for an existing key
// replaces the whole leaf.
pub struct Leaf<K, V> {
    pub entry: Option<(K, V)>,
    // The ledger entry of the insertion that brought this key into the tree.
    insert: Option<UpdateInfo>,
    // Whether `insert` may still be missing from the ledger.
    pending: AtomicBool,
}

impl<K, V> Node<K, V> {
    // Allocates a leaf.
    pub fn leaf(entry: Option<(K, V)>, insert: Option<UpdateInfo>) -> *mut Node<K, V> {
        Box::into_raw(Box::new(Node::Leaf(Leaf {
            entry,
            pending: AtomicBool::new(insert.is_some()),
            insert,
        })))
    }

    // Allocates an internal node with a clean info record.
    pub fn internal(
        key: Option<K>,
        left: *mut Node<K, V>,
        right: *mut Node<K, V>,
    ) -> *mut Node<K, V> {
        Box::into_raw(Box::new(Node::Internal(Internal {
            key,
            left: AtomicPtr::new(left),
            right: AtomicPtr::new(right),
            info: AtomicPtr::new(Record::new(Info::Clean)),
        })))
    }

    #[inline]
    pub fn as_internal(&self) -> &Internal<K, V> {
        match self {
            Node::Internal(internal) => internal,
            Node::Leaf(_) => unreachable!("expected an internal node"),
        }
    }

    #[inline]
    pub fn as_leaf(&self) -> &Leaf<K, V> {
        match self {
            Node::Leaf(leaf) => leaf,
            Node::Internal(_) => unreachable!("expected a leaf"),
        }
    }

    // Takes the entry out of a leaf that was never shared.
    //
    // # Safety
    //
    // `node` must be a leaf allocated by `Node::leaf` that was never published.
    pub unsafe fn into_entry(node: *mut Node<K, V>) -> (K, V) {
        match *unsafe { Box::from_raw(node) } {
            Node::Leaf(Leaf {
                entry: Some(entry), ..
            }) => entry,
            _ => unreachable!("expected a leaf with an entry"),
        }
    }

    // Frees a node and everything below it.
    //
    // # Safety
    //
    // The caller must have exclusive access to the subtree.
    pub unsafe fn drop_subtree(node: *mut Node<K, V>) {
        let mut stack = vec![node];

        while let Some(node) = stack.pop() {
            let node = unsafe { Box::from_raw(node) };

            if let Node::Internal(internal) = &*node {
                stack.push(internal.left.load(Ordering::Relaxed));
                stack.push(internal.right.load(Ordering::Relaxed));
            }
        }
    }
}

impl<K, V> Internal<K, V> {
    // Returns true if the search for `key` continues to the left child.
    #[inline]
    pub fn routes_left<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        match &self.key {
            Some(routing) => key < routing.borrow(),
            None => true,
        }
    }

    // Returns true if `node` is currently one of our children.
    #[inline]
    pub fn is_parent_of(&self, node: *mut Node<K, V>) -> bool {
        self.left.load(Ordering::Acquire) == node || self.right.load(Ordering::Acquire) == node
    }

    // Returns the child pointer currently holding `node`, defaulting to the
    // right one. A CAS against the result fails if `node` is no longer a child.
    #[inline]
    pub fn child_slot(&self, node: *mut Node<K, V>) -> &AtomicPtr<Node<K, V>> {
        if self.left.load(Ordering::Acquire) == node {
            &self.left
        } else {
            &self.right
        }
    }
}

impl<K, V> Drop for Internal<K, V> {
    fn drop(&mut self) {
        // Dropped nodes are either unlinked by a deletion, and hold its `Mark`,
        // or were never published. Either way the slot is the only holder.
        let _ = unsafe { Box::from_raw(*self.info.get_mut()) };
    }
}

impl<K, V> Leaf<K, V> {
    #[inline]
    pub fn key(&self) -> Option<&K> {
        self.entry.as_ref().map(|(key, _)| key)
    }

    #[inline]
    pub fn value(&self) -> Option<&V> {
        self.entry.as_ref().map(|(_, value)| value)
    }

    #[inline]
    pub fn matches<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.key().is_some_and(|k| k.borrow() == key)
    }

    // Returns the ledger entry of this leaf's insertion if it may not have
    // been recorded yet.
    #[inline]
    pub fn pending_insert(&self) -> Option<UpdateInfo> {
        if self.pending.load(Ordering::SeqCst) {
            self.insert
        } else {
            None
        }
    }

    // Marks the insertion as recorded in the ledger.
    #[inline]
    pub fn settle(&self) {
        self.pending.store(false, Ordering::SeqCst);
    }
}

impl<K: Clone, V: Clone> Leaf<K, V> {
    // Allocates a copy of this leaf, used as the sibling of a new key.
    pub fn duplicate(&self) -> *mut Node<K, V> {
        Node::leaf(self.entry.clone(), self.pending_insert())
    }
}

// The state of an internal node's `info` slot.
pub enum Info<K, V> {
    // No operation is pending.
    Clean,
    // An insertion below the node is pending.
    Insert(InsertInfo<K, V>),
    // A deletion below the node, as grandparent, is pending.
    Delete(DeleteInfo<K, V>),
    // The node, as parent, is being deleted. Points to the `Delete` record.
    Mark(*mut Record<K, V>),
}

// Replaces `leaf`, a child of `parent`, with `replacement`.
pub struct InsertInfo<K, V> {
    pub parent: *mut Node<K, V>,
    pub leaf: *mut Node<K, V>,
    pub replacement: *mut Node<K, V>,
}

// Removes `leaf` and its parent, replacing the parent with the leaf's sibling.
pub struct DeleteInfo<K, V> {
    pub grandparent: *mut Node<K, V>,
    pub parent: *mut Node<K, V>,
    pub leaf: *mut Node<K, V>,
    // The parent's info when the deletion was planned. Marking the parent
    // succeeds only if it is still installed.
    pub parent_info: *mut Record<K, V>,
    pub update: UpdateInfo,
}

// A heap-allocated `Info`, the unit of CAS on an info slot.
//
// Records are compared by address, so a record must not be freed while any
// pending deletion may still compare against it. `holders` counts the slot
// that publishes the record plus every `Delete` record that remembers it
// as `parent_info`; the record is retired when the last holder lets go.
pub struct Record<K, V> {
    pub info: Info<K, V>,
    holders: AtomicUsize,
}

impl<K, V> Record<K, V> {
    pub fn new(info: Info<K, V>) -> *mut Record<K, V> {
        Box::into_raw(Box::new(Record {
            info,
            holders: AtomicUsize::new(1),
        }))
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        matches!(self.info, Info::Clean)
    }

    #[inline]
    pub fn as_insert(&self) -> &InsertInfo<K, V> {
        match &self.info {
            Info::Insert(info) => info,
            _ => unreachable!("expected an insert record"),
        }
    }

    #[inline]
    pub fn as_delete(&self) -> &DeleteInfo<K, V> {
        match &self.info {
            Info::Delete(info) => info,
            _ => unreachable!("expected a delete record"),
        }
    }

    // Takes an extra hold on a record, failing if it was already released
    // by every holder.
    //
    // # Safety
    //
    // `record` must be protected by a guard.
    pub unsafe fn acquire(record: *mut Record<K, V>) -> bool {
        let holders = unsafe { &(*record).holders };
        let mut current = holders.load(Ordering::Acquire);

        loop {
            if current == 0 {
                return false;
            }

            match holders.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(found) => current = found,
            }
        }
    }

    // Lets go of a hold on a record, retiring it if it was the last one.
    //
    // # Safety
    //
    // The caller must own a hold on `record`, either by having replaced it in
    // its slot or through a `Delete` record that was just released.
    pub unsafe fn release(record: *mut Record<K, V>, guard: &impl Guard) {
        if unsafe { (*record).holders.fetch_sub(1, Ordering::AcqRel) } != 1 {
            return;
        }

        if let Info::Delete(delete) = unsafe { &(*record).info } {
            unsafe { Record::release(delete.parent_info, guard) };
        }

        unsafe { guard.defer_retire(record, reclaim::boxed) };
    }

    // Frees a record that was never published, dropping any hold it took.
    //
    // # Safety
    //
    // `record` must never have been shared with other threads.
    pub unsafe fn discard(record: *mut Record<K, V>, guard: &impl Guard) {
        let record = unsafe { Box::from_raw(record) };

        if let Info::Delete(delete) = &record.info {
            unsafe { Record::release(delete.parent_info, guard) };
        }
    }
}
