mod node;
pub mod utils;

use std::borrow::Borrow;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::Ordering;

use seize::{reclaim, Collector, Guard, LocalGuard};

use self::node::{DeleteInfo, Info, InsertInfo, Node, Record};
use crate::cfg::trace;
use crate::size::{Backoff, OpKind, SizeCalculator, UpdateInfo};

// A lock-free external binary search tree with a linearizable size.
//
// This is the non-blocking BST of Ellen, Fatourou, Ruppert and van Breugel.
// Mutations announce themselves by flagging the info slot of the node whose
// children they change, and any thread that runs into a flag completes the
// announced operation before retrying its own. Every linearized insert and
// remove is recorded in the size calculator's ledger by whichever thread
// first observes it.
pub struct Tree<K, V> {
    // The root never changes. Its right child is a sentinel leaf, and all
    // keys live below its left child.
    root: *mut Node<K, V>,
    pub size: SizeCalculator,
    collector: Collector,
    _kv: PhantomData<(K, V)>,
}

// Safety: keys and values are shared across threads through the tree and
// dropped by whichever thread reclaims them.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for Tree<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Tree<K, V> {}

// The result of a search: the leaf where the key is or would be, its parent
// and grandparent, and their info records read before the child links were
// confirmed.
struct Search<K, V> {
    grandparent: *mut Node<K, V>,
    grandparent_info: *mut Record<K, V>,
    parent: *mut Node<K, V>,
    parent_info: *mut Record<K, V>,
    leaf: *mut Node<K, V>,
}

impl<K, V> Tree<K, V> {
    pub fn new(threads: usize, collector: Collector) -> Tree<K, V> {
        // Two sentinel leaves avoid special cases for trees with fewer than
        // two keys.
        let root = Node::internal(None, Node::leaf(None, None), Node::leaf(None, None));

        Tree {
            root,
            size: SizeCalculator::new(threads),
            collector,
            _kv: PhantomData,
        }
    }

    #[inline]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    // Returns an in-order iterator over the entries.
    //
    // Exclusive access guarantees no operation is in flight.
    pub fn iter(&mut self) -> Iter<'_, K, V> {
        Iter {
            stack: vec![self.root],
            _tree: PhantomData,
        }
    }
}

impl<K, V> Tree<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Send + Sync,
{
    // Walks down to the leaf where `key` is or would be.
    //
    // The info of each ancestor is read once, and then its child link is
    // confirmed, as if the info had been read before the link. A broken link
    // restarts the search.
    fn search<Q>(&self, key: &Q, guard: &impl Guard) -> Search<K, V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        'search: loop {
            let mut grandparent = ptr::null_mut();
            let mut parent = self.root;
            // Safety: the root is never retired.
            let mut leaf = guard.protect(unsafe { &(*parent).as_internal().left }, Ordering::Acquire);

            // Safety: nodes reached from the root are protected by the guard.
            while let Node::Internal(internal) = unsafe { &*leaf } {
                grandparent = parent;
                parent = leaf;

                leaf = if internal.routes_left(key) {
                    guard.protect(&internal.left, Ordering::Acquire)
                } else {
                    guard.protect(&internal.right, Ordering::Acquire)
                };
            }

            let mut grandparent_info = ptr::null_mut();
            if !grandparent.is_null() {
                let node = unsafe { (*grandparent).as_internal() };
                grandparent_info = guard.protect(&node.info, Ordering::Acquire);
                if !node.is_parent_of(parent) {
                    continue 'search;
                }
            }

            let node = unsafe { (*parent).as_internal() };
            let parent_info = guard.protect(&node.info, Ordering::Acquire);
            if !node.is_parent_of(leaf) {
                continue 'search;
            }

            return Search {
                grandparent,
                grandparent_info,
                parent,
                parent_info,
                leaf,
            };
        }
    }

    // Records the insertion of `leaf` in the ledger if its inserter has not
    // done so yet, so the ledger is never behind what we return.
    #[inline]
    fn settle_insert(&self, leaf: &node::Leaf<K, V>, guard: &impl Guard) {
        if let Some(update) = leaf.pending_insert() {
            self.size.update_metadata(OpKind::Insert, update, guard);
            leaf.settle();
        }
    }

    // Returns the value for `key`.
    pub fn get<'g, Q>(&self, key: &Q, guard: &'g impl Guard) -> Option<&'g V>
    where
        K: Borrow<Q> + 'g,
        V: 'g,
        Q: Ord + ?Sized,
    {
        let search = self.search(key, guard);

        // Safety: everything in `search` is protected by the guard.
        let leaf = unsafe { (*search.leaf).as_leaf() };
        if !leaf.matches(key) {
            return None;
        }

        // The leaf is being removed, and the removal has linearized.
        if let Info::Mark(delete) = unsafe { &(*search.parent_info).info } {
            let delete = unsafe { (**delete).as_delete() };

            if delete.leaf == search.leaf {
                self.size.update_metadata(OpKind::Remove, delete.update, guard);
                return None;
            }
        }

        self.settle_insert(leaf, guard);
        leaf.value()
    }

    // Inserts an entry if the key is absent, returning the current value
    // otherwise.
    pub fn insert_if_absent<'g>(
        &self,
        key: K,
        value: V,
        tid: usize,
        guard: &'g impl Guard,
    ) -> Option<&'g V>
    where
        K: 'g,
        V: Clone + 'g,
    {
        let update = self.size.create_update_info(tid, OpKind::Insert);
        let mut entry = (key, value);

        loop {
            let search = self.search(&entry.0, guard);

            // Safety: everything in `search` is protected by the guard.
            let leaf = unsafe { (*search.leaf).as_leaf() };
            let parent_info = unsafe { &*search.parent_info };

            if let Info::Mark(delete) = &parent_info.info {
                unsafe { self.help_marked(*delete, guard) };
                continue;
            }

            if leaf.matches(&entry.0) {
                self.settle_insert(leaf, guard);
                return leaf.value();
            }

            if !parent_info.is_clean() {
                unsafe { self.help(search.parent_info, guard) };
                continue;
            }

            let (new, subtree) = self.split_leaf(&search, entry, Some(update));

            if unsafe { self.flag_insert(&search, subtree, guard) } {
                self.size.update_metadata(OpKind::Insert, update, guard);
                // Safety: the new leaf is in the tree and protected by the guard.
                unsafe { (*new).as_leaf().settle() };
                return None;
            }

            entry = unsafe { Self::unsplit(new, subtree) };

            let parent = unsafe { (*search.parent).as_internal() };
            unsafe { self.help(guard.protect(&parent.info, Ordering::Acquire), guard) };
        }
    }

    // Inserts an entry, replacing and returning the current value if the key
    // is present.
    pub fn insert<'g>(&self, key: K, value: V, tid: usize, guard: &'g impl Guard) -> Option<&'g V>
    where
        K: 'g,
        V: Clone + 'g,
    {
        let update = self.size.create_update_info(tid, OpKind::Insert);
        let mut entry = (key, value);

        loop {
            let search = self.search(&entry.0, guard);

            // Safety: everything in `search` is protected by the guard.
            let leaf = unsafe { (*search.leaf).as_leaf() };
            let parent_info = unsafe { &*search.parent_info };

            if !parent_info.is_clean() {
                unsafe { self.help(search.parent_info, guard) };
                continue;
            }

            if leaf.matches(&entry.0) {
                // The replacement inherits the ledger entry of the insertion that
                // brought the key into the tree.
                let inherited = leaf.pending_insert();
                let replacement = Node::leaf(Some(entry), inherited);

                if unsafe { self.flag_insert(&search, replacement, guard) } {
                    if let Some(inherited) = inherited {
                        self.size.update_metadata(OpKind::Insert, inherited, guard);
                        unsafe { (*replacement).as_leaf().settle() };
                    }

                    return leaf.value();
                }

                // Safety: the replacement was never published.
                entry = unsafe { Node::into_entry(replacement) };
            } else {
                let (new, subtree) = self.split_leaf(&search, entry, Some(update));

                if unsafe { self.flag_insert(&search, subtree, guard) } {
                    self.size.update_metadata(OpKind::Insert, update, guard);
                    unsafe { (*new).as_leaf().settle() };
                    return None;
                }

                entry = unsafe { Self::unsplit(new, subtree) };
            }

            // The flag was lost, help whoever won it and start over.
            let parent = unsafe { (*search.parent).as_internal() };
            unsafe { self.help(guard.protect(&parent.info, Ordering::Acquire), guard) };
        }
    }

    // Builds the subtree that replaces the leaf found by `search`: a new
    // internal node over a copy of that leaf and a new leaf for `entry`.
    //
    // Returns the new leaf and the subtree root.
    fn split_leaf(
        &self,
        search: &Search<K, V>,
        entry: (K, V),
        update: Option<UpdateInfo>,
    ) -> (*mut Node<K, V>, *mut Node<K, V>)
    where
        V: Clone,
    {
        // Safety: protected by the caller's guard.
        let leaf = unsafe { (*search.leaf).as_leaf() };
        let sibling = leaf.duplicate();

        // The routing key is the larger of the two keys.
        let goes_left = leaf.key().map_or(true, |existing| entry.0 < *existing);
        let routing = if goes_left {
            leaf.key().cloned()
        } else {
            Some(entry.0.clone())
        };

        let new = Node::leaf(Some(entry), update);
        let subtree = if goes_left {
            Node::internal(routing, new, sibling)
        } else {
            Node::internal(routing, sibling, new)
        };

        (new, subtree)
    }

    // Frees a subtree built by `split_leaf` that was never published, and
    // returns the entry of its new leaf.
    unsafe fn unsplit(new: *mut Node<K, V>, subtree: *mut Node<K, V>) -> (K, V) {
        let subtree = unsafe { Box::from_raw(subtree) };
        let internal = subtree.as_internal();

        let sibling = if internal.left.load(Ordering::Relaxed) == new {
            internal.right.load(Ordering::Relaxed)
        } else {
            internal.left.load(Ordering::Relaxed)
        };

        unsafe {
            let _ = Box::from_raw(sibling);
            Node::into_entry(new)
        }
    }

    // Tries to flag the parent found by `search` with an insertion of
    // `replacement` in place of the leaf, completing it on success.
    //
    // Returns false if the flag was lost. Nothing was published in that case,
    // and the caller still owns `replacement`.
    unsafe fn flag_insert(
        &self,
        search: &Search<K, V>,
        replacement: *mut Node<K, V>,
        guard: &impl Guard,
    ) -> bool {
        let record = Record::new(Info::Insert(InsertInfo {
            parent: search.parent,
            leaf: search.leaf,
            replacement,
        }));

        let parent = unsafe { (*search.parent).as_internal() };

        match parent.info.compare_exchange(
            search.parent_info,
            record,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => unsafe {
                Record::release(search.parent_info, guard);
                self.help_insert(record, guard);
                true
            },
            Err(_) => unsafe {
                trace!("lost the race to flag a parent for insertion");
                Record::discard(record, guard);
                false
            },
        }
    }

    // Removes `key`, returning its value.
    pub fn remove<'g, Q>(&self, key: &Q, tid: usize, guard: &'g impl Guard) -> Option<&'g V>
    where
        K: Borrow<Q> + 'g,
        V: 'g,
        Q: Ord + ?Sized,
    {
        loop {
            let search = self.search(key, guard);

            // Only a sentinel leaf hangs directly off the root.
            if search.grandparent.is_null() {
                return None;
            }

            // Safety: everything in `search` is protected by the guard.
            let leaf = unsafe { (*search.leaf).as_leaf() };
            if !leaf.matches(key) {
                return None;
            }

            if !unsafe { (*search.grandparent_info).is_clean() } {
                unsafe { self.help(search.grandparent_info, guard) };
                continue;
            }

            if !unsafe { (*search.parent_info).is_clean() } {
                unsafe { self.help(search.parent_info, guard) };
                continue;
            }

            // The removal must not be recorded before the insertion it undoes.
            self.settle_insert(leaf, guard);

            // The parent's info was replaced since we read it, so marking the
            // parent would fail anyway.
            if !unsafe { Record::acquire(search.parent_info) } {
                continue;
            }

            let record = Record::new(Info::Delete(DeleteInfo {
                grandparent: search.grandparent,
                parent: search.parent,
                leaf: search.leaf,
                parent_info: search.parent_info,
                update: self.size.create_update_info(tid, OpKind::Remove),
            }));

            let grandparent = unsafe { (*search.grandparent).as_internal() };

            match grandparent.info.compare_exchange(
                search.grandparent_info,
                record,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => unsafe {
                    Record::release(search.grandparent_info, guard);

                    if self.help_delete(record, guard) {
                        return leaf.value();
                    }
                },
                Err(_) => unsafe {
                    trace!("lost the race to flag a grandparent for deletion");
                    Record::discard(record, guard);
                    self.help(guard.protect(&grandparent.info, Ordering::Acquire), guard);
                },
            }
        }
    }

    // Completes whatever operation `record` announces.
    //
    // # Safety
    //
    // `record` must have been read from an info slot and be protected by the guard.
    pub unsafe fn help(&self, record: *mut Record<K, V>, guard: &impl Guard) {
        match unsafe { &(*record).info } {
            Info::Clean => {}
            Info::Insert(_) => unsafe { self.help_insert(record, guard) },
            Info::Delete(_) => {
                let _ = unsafe { self.help_delete(record, guard) };
            }
            Info::Mark(delete) => unsafe { self.help_marked(*delete, guard) },
        }
    }

    // Swings the parent's child from the old leaf to the replacement, then
    // unflags the parent.
    unsafe fn help_insert(&self, record: *mut Record<K, V>, guard: &impl Guard) {
        let insert = unsafe { (*record).as_insert() };
        let parent = unsafe { (*insert.parent).as_internal() };

        if parent
            .child_slot(insert.leaf)
            .compare_exchange(insert.leaf, insert.replacement, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Safety: the old leaf is unreachable and we won the race to unlink it.
            unsafe { guard.defer_retire(insert.leaf, reclaim::boxed) };
        }

        unsafe { self.unflag(parent, record, guard) };
    }

    // Tries to mark the parent for a flagged deletion, which is where the
    // deletion linearizes. Returns false if the deletion was backtracked.
    unsafe fn help_delete(&self, record: *mut Record<K, V>, guard: &impl Guard) -> bool {
        let delete = unsafe { (*record).as_delete() };
        let parent = unsafe { (*delete.parent).as_internal() };

        let mark = Record::new(Info::Mark(record));

        match parent.info.compare_exchange(
            delete.parent_info,
            mark,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => unsafe {
                Record::release(delete.parent_info, guard);
                self.help_marked(record, guard);
                true
            },
            Err(_) => {
                // Safety: the mark was never published.
                let _ = unsafe { Box::from_raw(mark) };

                let current = guard.protect(&parent.info, Ordering::Acquire);

                // Someone else marked the parent for us.
                if let Info::Mark(marked) = unsafe { &(*current).info } {
                    if *marked == record {
                        unsafe { self.help_marked(record, guard) };
                        return true;
                    }
                }

                trace!("backtracking a deletion");

                unsafe {
                    self.help(current, guard);
                    self.unflag((*delete.grandparent).as_internal(), record, guard);
                }

                false
            }
        }
    }

    // Finishes a marked deletion: records it in the ledger, swings the
    // grandparent's child from the parent to the leaf's sibling, then unflags
    // the grandparent.
    unsafe fn help_marked(&self, record: *mut Record<K, V>, guard: &impl Guard) {
        let delete = unsafe { (*record).as_delete() };

        self.size.update_metadata(OpKind::Remove, delete.update, guard);

        let parent = unsafe { (*delete.parent).as_internal() };
        let grandparent = unsafe { (*delete.grandparent).as_internal() };

        // The parent is marked, so its children are frozen.
        let sibling = if parent.right.load(Ordering::Acquire) == delete.leaf {
            parent.left.load(Ordering::Acquire)
        } else {
            parent.right.load(Ordering::Acquire)
        };

        if grandparent
            .child_slot(delete.parent)
            .compare_exchange(delete.parent, sibling, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Safety: both nodes are unreachable and we won the race to unlink them.
            unsafe {
                guard.defer_retire(delete.parent, reclaim::boxed);
                guard.defer_retire(delete.leaf, reclaim::boxed);
            }
        }

        unsafe { self.unflag(grandparent, record, guard) };
    }

    // Replaces `record` in the node's info slot with a clean record.
    unsafe fn unflag(&self, node: &node::Internal<K, V>, record: *mut Record<K, V>, guard: &impl Guard) {
        let clean = Record::new(Info::Clean);

        match node
            .info
            .compare_exchange(record, clean, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => unsafe { Record::release(record, guard) },
            // Safety: the clean record was never published.
            Err(_) => unsafe { Record::discard(clean, guard) },
        }
    }

    // Returns the number of keys, linearizable with respect to every update.
    pub fn size(&self, backoff: &Backoff, guard: &impl Guard) -> usize {
        self.size.compute(backoff, guard)
    }
}

impl<K, V> Drop for Tree<K, V> {
    fn drop(&mut self) {
        // Safety: we have exclusive access, and every unlinked node or record
        // is owned by the collector.
        unsafe { Node::drop_subtree(self.root) };
    }
}

// An in-order iterator over the entries of a quiescent tree.
pub struct Iter<'a, K, V> {
    stack: Vec<*mut Node<K, V>>,
    _tree: PhantomData<&'a mut Tree<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.stack.pop() {
            // Safety: the tree is borrowed mutably for `'a`, so nothing is
            // retired while we iterate.
            match unsafe { &*node } {
                Node::Internal(internal) => {
                    self.stack.push(internal.right.load(Ordering::Relaxed));
                    self.stack.push(internal.left.load(Ordering::Relaxed));
                }
                Node::Leaf(leaf) => {
                    if let Some((key, value)) = &leaf.entry {
                        return Some((key, value));
                    }
                }
            }
        }

        None
    }
}
