use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::ReleaseOutcome;

/// The pool side of a [`Pooled<T>`], type-erased so handles do not carry the factory type.
pub(crate) trait ItemSink<T>: Send + Sync {
    /// Routes a released item through the recycle decision. `generation` identifies the
    /// activation of the pool that handed the item out.
    fn release(&self, item: T, generation: u64) -> ReleaseOutcome;

    /// Frees the slot of an item that is leaving pool management for good.
    fn forget(&self);

    fn pool_id(&self) -> u64;
}

/// An item acquired from a [`Pool`][crate::Pool].
///
/// The handle gives direct access to the item via [`Deref`] and [`DerefMut`]. When the handle
/// is dropped, the item is released back to the pool that produced it, where the item's
/// [`Recycle`][crate::Recycle] implementation decides whether it is reused or destroyed. Use
/// [`release()`][Self::release] to release explicitly and learn the outcome.
///
/// # Example
///
/// ```rust
/// use media_pool::{BufferFactory, Pool, PoolConfig, ReleaseOutcome};
///
/// let pool = Pool::new(BufferFactory::new());
/// pool.configure(PoolConfig::builder().item_size(4).build().unwrap()).unwrap();
/// pool.set_active(true).unwrap();
///
/// let mut buffer = pool.acquire().unwrap();
/// buffer.map_writable().unwrap().copy_from_slice(&[1, 2, 3, 4]);
///
/// assert_eq!(buffer.release(), ReleaseOutcome::Recycled);
/// assert_eq!(pool.available(), 1);
/// ```
pub struct Pooled<T> {
    // Both fields are always initialized. They are only taken out by the consuming methods
    // and by drop(), each of which runs at most once.
    item: ManuallyDrop<T>,
    pool: ManuallyDrop<Arc<dyn ItemSink<T>>>,

    // Once the pool is deactivated, items handed out before that are no longer its items.
    generation: u64,
}

impl<T> Pooled<T> {
    pub(crate) fn new(item: T, generation: u64, pool: Arc<dyn ItemSink<T>>) -> Self {
        Self {
            item: ManuallyDrop::new(item),
            pool: ManuallyDrop::new(pool),
            generation,
        }
    }

    /// Releases the item back to its pool and reports whether it was recycled or destroyed.
    #[expect(
        clippy::must_use_candidate,
        reason = "callers that do not care about the outcome simply drop the handle"
    )]
    pub fn release(self) -> ReleaseOutcome {
        let generation = self.generation;
        let (item, pool) = self.into_parts();
        pool.release(item, generation)
    }

    /// Takes the item out of pool management. The item will never return to the pool and
    /// its slot becomes free for a new allocation.
    ///
    /// # Example
    ///
    /// ```rust
    /// use media_pool::{BufferFactory, Pool, PoolConfig};
    ///
    /// let pool = Pool::new(BufferFactory::new());
    /// pool.configure(PoolConfig::builder().item_size(4).max_items(1).build().unwrap()).unwrap();
    /// pool.set_active(true).unwrap();
    ///
    /// let buffer = pool.acquire().unwrap().detach();
    /// assert_eq!(buffer.size(), 4);
    ///
    /// // The slot was freed, so the bounded pool can allocate again.
    /// let _another = pool.try_acquire().unwrap();
    /// ```
    #[must_use]
    pub fn detach(self) -> T {
        let (item, pool) = self.into_parts();
        pool.forget();
        item
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool.pool_id()
    }

    fn into_parts(self) -> (T, Arc<dyn ItemSink<T>>) {
        let mut this = ManuallyDrop::new(self);

        // SAFETY: `this` is never dropped, so each field is moved out exactly once here and
        // the originals are never touched again.
        let item = unsafe { ManuallyDrop::take(&mut this.item) };
        // SAFETY: As above.
        let pool = unsafe { ManuallyDrop::take(&mut this.pool) };

        (item, pool)
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.item
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.item
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        // SAFETY: drop() runs at most once and the consuming methods bypass it, so the fields
        // are still initialized and are not used again after being taken.
        let item = unsafe { ManuallyDrop::take(&mut self.item) };
        // SAFETY: As above.
        let pool = unsafe { ManuallyDrop::take(&mut self.pool) };

        drop(pool.release(item, self.generation));
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("item", &*self.item)
            .field("pool_id", &self.pool.pool_id())
            .finish()
    }
}
