use crate::raw::{self, utils};
use crate::registry::{RegistryError, ThreadRegistry, ThreadSlot};
use crate::size::Backoff;

use std::borrow::Borrow;
use std::fmt;
use std::marker::PhantomData;

use seize::Collector;

/// A lock-free ordered map with a linearizable [`size`](Handle::size).
///
/// Operations are performed through a [`Handle`], which registers the calling
/// thread with the tree. See the [crate-level documentation](crate) for details.
pub struct SizeBst<K, V> {
    raw: raw::Tree<K, V>,
    registry: ThreadRegistry,
}

/// A builder for a [`SizeBst`].
///
/// # Examples
///
/// ```rust
/// use concurrent_size::SizeBst;
/// use seize::Collector;
///
/// let tree: SizeBst<u64, u64> = SizeBst::builder()
///     // Allow up to 64 threads to hold a handle at once.
///     .max_threads(64)
///     // Use a custom garbage collector.
///     .collector(Collector::new().batch_size(128))
///     // Build the tree.
///     .build();
/// ```
pub struct SizeBstBuilder<K, V> {
    max_threads: usize,
    collector: Collector,
    _kv: PhantomData<(K, V)>,
}

impl<K, V> SizeBstBuilder<K, V> {
    /// Set the maximum number of threads that may hold a [`Handle`] at the same time.
    ///
    /// Every `size` call reads one pair of counters per thread slot, so this
    /// should not be much larger than needed. Defaults to twice the available
    /// parallelism, and at least 16.
    ///
    /// # Panics
    ///
    /// [`build`](SizeBstBuilder::build) panics if this is zero.
    pub fn max_threads(self, max_threads: usize) -> Self {
        SizeBstBuilder {
            max_threads,
            ..self
        }
    }

    /// Set the [`seize::Collector`] used for memory reclamation.
    ///
    /// This method may be useful when you want more control over memory reclamation.
    /// See [`seize::Collector`] for details.
    pub fn collector(self, collector: Collector) -> Self {
        SizeBstBuilder { collector, ..self }
    }

    /// Construct a [`SizeBst`] from the builder, using the configured options.
    pub fn build(self) -> SizeBst<K, V> {
        SizeBst {
            raw: raw::Tree::new(self.max_threads, self.collector),
            registry: ThreadRegistry::new(self.max_threads),
        }
    }
}

impl<K, V> fmt::Debug for SizeBstBuilder<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeBstBuilder")
            .field("max_threads", &self.max_threads)
            .finish()
    }
}

impl<K, V> SizeBst<K, V> {
    /// Creates an empty `SizeBst`.
    ///
    /// # Examples
    ///
    /// ```
    /// use concurrent_size::SizeBst;
    /// let tree: SizeBst<&str, i32> = SizeBst::new();
    /// ```
    pub fn new() -> SizeBst<K, V> {
        SizeBst::builder().build()
    }

    /// Creates an empty `SizeBst` that accepts up to `max_threads` concurrent handles.
    ///
    /// # Panics
    ///
    /// Panics if `max_threads` is zero.
    pub fn with_max_threads(max_threads: usize) -> SizeBst<K, V> {
        SizeBst::builder().max_threads(max_threads).build()
    }

    /// Returns a builder for a `SizeBst`.
    ///
    /// The builder can be used for more complex configuration, such as using
    /// a custom [`Collector`].
    pub fn builder() -> SizeBstBuilder<K, V> {
        SizeBstBuilder {
            max_threads: utils::default_max_threads(),
            collector: Collector::new(),
            _kv: PhantomData,
        }
    }

    /// Returns the maximum number of threads that may hold a [`Handle`] at the same time.
    #[inline]
    pub fn max_threads(&self) -> usize {
        self.registry.max_threads()
    }

    /// Registers the current thread with the tree, returning a handle through
    /// which it performs operations.
    ///
    /// A handle should be kept for as long as the thread uses the tree. It
    /// releases its thread slot when dropped, and the slot may then be reused
    /// by another thread.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Exhausted`] if [`max_threads`](SizeBst::max_threads)
    /// handles are already alive.
    ///
    /// # Examples
    ///
    /// ```
    /// use concurrent_size::SizeBst;
    ///
    /// let tree = SizeBst::with_max_threads(1);
    /// let handle = tree.handle().unwrap();
    /// handle.insert(1, "a");
    ///
    /// // The only slot is taken.
    /// assert!(tree.handle().is_err());
    ///
    /// drop(handle);
    /// assert_eq!(tree.handle().unwrap().size(), 1);
    /// ```
    pub fn handle(&self) -> Result<Handle<'_, K, V>, RegistryError> {
        let slot = self.registry.register()?;

        Ok(Handle {
            tree: self,
            slot,
            backoff: Backoff::new(),
        })
    }

    /// Returns an iterator over the entries of the tree, in key order.
    ///
    /// This requires exclusive access, so no handle may be alive and the
    /// iteration sees a consistent state.
    ///
    /// # Examples
    ///
    /// ```
    /// use concurrent_size::SizeBst;
    ///
    /// let mut tree = SizeBst::new();
    /// {
    ///     let handle = tree.handle().unwrap();
    ///     handle.insert(2, 'b');
    ///     handle.insert(1, 'a');
    /// }
    ///
    /// let entries: Vec<_> = tree.iter().collect();
    /// assert_eq!(entries, [(&1, &'a'), (&2, &'b')]);
    /// ```
    pub fn iter(&mut self) -> Iter<'_, K, V> {
        Iter {
            raw: self.raw.iter(),
        }
    }

    /// Returns the number of entries by counting them.
    ///
    /// Unlike [`Handle::size`], this walks the whole tree, and requires exclusive access.
    pub fn len_quiescent(&mut self) -> usize {
        self.iter().count()
    }
}

impl<K, V> Default for SizeBst<K, V> {
    fn default() -> Self {
        SizeBst::new()
    }
}

impl<K, V> fmt::Debug for SizeBst<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeBst")
            .field("max_threads", &self.max_threads())
            .finish_non_exhaustive()
    }
}

/// A thread's registration with a [`SizeBst`].
///
/// All operations on the tree go through a handle. A handle may be sent to
/// another thread, but cannot be shared between threads: each thread that
/// operates on the tree concurrently needs its own.
pub struct Handle<'tree, K, V> {
    tree: &'tree SizeBst<K, V>,
    slot: ThreadSlot<'tree>,
    backoff: Backoff,
}

impl<K, V> Handle<'_, K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Returns the thread id assigned to this handle, in `0..max_threads`.
    #[inline]
    pub fn id(&self) -> usize {
        self.slot.id()
    }

    /// Returns a clone of the value corresponding to the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use concurrent_size::SizeBst;
    ///
    /// let tree = SizeBst::new();
    /// let handle = tree.handle().unwrap();
    /// handle.insert(1, "a");
    /// assert_eq!(handle.get(&1), Some("a"));
    /// assert_eq!(handle.get(&2), None);
    /// ```
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guard = self.tree.raw.guard();
        self.tree.raw.get(key, &guard).cloned()
    }

    /// Returns `true` if the tree contains a value for the specified key.
    #[inline]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guard = self.tree.raw.guard();
        self.tree.raw.get(key, &guard).is_some()
    }

    /// Inserts a key-value pair into the tree.
    ///
    /// If the tree did not have this key present, [`None`] is returned.
    /// Otherwise the value is replaced, and the old value is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use concurrent_size::SizeBst;
    ///
    /// let tree = SizeBst::new();
    /// let handle = tree.handle().unwrap();
    /// assert_eq!(handle.insert(37, "a"), None);
    /// assert_eq!(handle.insert(37, "b"), Some("a"));
    /// assert_eq!(handle.get(&37), Some("b"));
    /// assert_eq!(handle.size(), 1);
    /// ```
    #[inline]
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let guard = self.tree.raw.guard();
        self.tree
            .raw
            .insert(key, value, self.id(), &guard)
            .cloned()
    }

    /// Inserts a key-value pair into the tree if the key is absent.
    ///
    /// If the key is already present, the tree is left unchanged and the
    /// current value is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use concurrent_size::SizeBst;
    ///
    /// let tree = SizeBst::new();
    /// let handle = tree.handle().unwrap();
    /// assert_eq!(handle.insert_if_absent(37, "a"), None);
    /// assert_eq!(handle.insert_if_absent(37, "b"), Some("a"));
    /// assert_eq!(handle.get(&37), Some("a"));
    /// ```
    #[inline]
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<V> {
        let guard = self.tree.raw.guard();
        self.tree
            .raw
            .insert_if_absent(key, value, self.id(), &guard)
            .cloned()
    }

    /// Removes a key from the tree, returning its value if it was present.
    ///
    /// # Examples
    ///
    /// ```
    /// use concurrent_size::SizeBst;
    ///
    /// let tree = SizeBst::new();
    /// let handle = tree.handle().unwrap();
    /// handle.insert(1, "a");
    /// assert_eq!(handle.remove(&1), Some("a"));
    /// assert_eq!(handle.remove(&1), None);
    /// ```
    #[inline]
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guard = self.tree.raw.guard();
        self.tree.raw.remove(key, self.id(), &guard).cloned()
    }

    /// Returns the number of entries in the tree.
    ///
    /// The result is linearizable: it is the exact number of entries at some
    /// instant during the call, even while other threads insert and remove.
    /// Concurrent `size` calls cooperate rather than block each other.
    #[inline]
    pub fn size(&self) -> usize {
        let guard = self.tree.raw.guard();
        self.tree.raw.size(&self.backoff, &guard)
    }

    /// Returns `true` if the tree is empty, see [`size`](Handle::size).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<K, V> fmt::Debug for Handle<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("id", &self.slot.id()).finish()
    }
}

/// An iterator over the entries of a [`SizeBst`], in key order.
///
/// This struct is created by the [`iter`](SizeBst::iter) method on [`SizeBst`].
pub struct Iter<'tree, K, V> {
    raw: raw::Iter<'tree, K, V>,
}

impl<'tree, K: 'tree, V: 'tree> Iterator for Iter<'tree, K, V> {
    type Item = (&'tree K, &'tree V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.raw.next()
    }
}
