use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, trace};

use crate::constants::ERR_POISONED_LOCK;
use crate::pooled::ItemSink;
use crate::stats::PoolCounters;
use crate::{
    ActivationError, BufferFactory, ConfigError, Decision, DestroyReason, FlowError,
    ItemFactory, PoolConfig, PoolStats, Pooled, Recycle, ReleaseOutcome, WaitPolicy,
};

/// A pool of buffers with byte storage, the most common use of [`Pool`].
pub type BufferPool = Pool<BufferFactory>;

/// Global counter for generating unique pool IDs.
static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates a unique pool ID.
fn generate_pool_id() -> u64 {
    POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Where a [`Pool`] is in its lifecycle.
///
/// Flushing is tracked separately, see [`Pool::is_flushing()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolPhase {
    /// No configuration has been applied yet.
    Unconfigured,

    /// Configured but not handing out items.
    Inactive,

    /// Handing out items.
    Active,
}

/// A thread-safe pool of identically shaped items that are expensive to create.
///
/// Items are created by an [`ItemFactory`] and handed out as [`Pooled<T>`] handles. When a
/// handle is released, the item decides via [`Recycle`] whether it can be reused as-is. Reusable
/// items go back to the pool, most recently released first; all others are destroyed.
///
/// The pool is a cheap handle: clones share the same underlying pool. Every operation takes
/// `&self` and may be called from any thread.
///
/// # Lifecycle
///
/// A new pool is [`PoolPhase::Unconfigured`]. [`configure()`][Self::configure] makes it
/// [`PoolPhase::Inactive`], after which [`set_active(true)`][Self::set_active] preallocates the
/// configured minimum number of items and starts handing out items. Deactivating the pool
/// destroys the items waiting in it; items still in circulation are destroyed when released.
///
/// # Example
///
/// ```rust
/// use media_pool::{BufferFactory, BufferPool, PoolConfig, Shape};
///
/// let pool = BufferPool::new(BufferFactory::new());
///
/// pool.configure(
///     PoolConfig::builder()
///         .shape(Shape::new("video/x-raw, format=GRAY8, width=4, height=4"))
///         .item_size(16)
///         .min_items(2)
///         .max_items(4)
///         .build()
///         .unwrap(),
/// )
/// .unwrap();
///
/// pool.set_active(true).unwrap();
/// assert_eq!(pool.available(), 2);
///
/// let buffer = pool.acquire().unwrap();
/// assert_eq!(buffer.size(), 16);
/// assert_eq!(pool.outstanding(), 1);
///
/// drop(buffer);
/// assert_eq!(pool.outstanding(), 0);
/// assert_eq!(pool.available(), 2);
/// ```
pub struct Pool<F: ItemFactory> {
    shared: Arc<PoolShared<F>>,
}

struct PoolShared<F: ItemFactory> {
    pool_id: u64,
    factory: F,
    state: Mutex<PoolState<F::Item>>,

    // Signaled whenever an acquirer blocked on an exhausted pool may be able to make progress:
    // an item came back, a slot was freed or the pool stopped handing out items.
    item_returned: Condvar,

    counters: PoolCounters,
}

struct PoolState<T> {
    config: Option<Arc<PoolConfig>>,
    phase: PoolPhase,
    flushing: bool,

    // Incremented on every deactivation. Items handed out under an older generation are
    // destroyed when released, even if the pool has been activated again since.
    generation: u64,

    // Front is the most recently released item.
    available: VecDeque<T>,

    // Includes slots reserved by acquirers that are still waiting on the factory.
    outstanding: u32,
}

impl<F: ItemFactory> Pool<F> {
    /// Creates an unconfigured pool that allocates its items with `factory`.
    #[must_use]
    pub fn new(factory: F) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                pool_id: generate_pool_id(),
                factory,
                state: Mutex::new(PoolState {
                    config: None,
                    phase: PoolPhase::Unconfigured,
                    flushing: false,
                    generation: 0,
                    available: VecDeque::new(),
                    outstanding: 0,
                }),
                item_returned: Condvar::new(),
                counters: PoolCounters::default(),
            }),
        }
    }

    /// Applies a configuration to the pool.
    ///
    /// An inactive or unconfigured pool accepts any configuration and becomes
    /// [`PoolPhase::Inactive`]. An active pool stays active and only accepts a configuration
    /// that keeps the shape, the item size and the ceiling of the items in circulation: either
    /// the identical configuration or one that lowers `min_items`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Incompatible`] if the pool is active and the configuration would
    /// change the items in circulation.
    ///
    /// # Example
    ///
    /// ```rust
    /// use media_pool::{BufferFactory, ConfigError, Pool, PoolConfig};
    ///
    /// let pool = Pool::new(BufferFactory::new());
    /// let config = PoolConfig::builder().item_size(8).min_items(2).max_items(4).build().unwrap();
    ///
    /// pool.configure(config.clone()).unwrap();
    /// pool.set_active(true).unwrap();
    ///
    /// // Re-applying the same configuration is fine.
    /// pool.configure(config).unwrap();
    ///
    /// // Asking an active pool for more preallocated items than it was set up with is not.
    /// let bigger = PoolConfig::builder().item_size(8).min_items(3).max_items(4).build().unwrap();
    /// assert!(matches!(pool.configure(bigger), Err(ConfigError::Incompatible)));
    /// ```
    pub fn configure(&self, config: PoolConfig) -> Result<(), ConfigError> {
        let mut state = self.shared.lock_state();

        if state.phase == PoolPhase::Active {
            let compatible = state
                .config
                .as_deref()
                .is_some_and(|current| current.accepts_while_active(&config));

            if !compatible {
                debug!(
                    pool_id = self.shared.pool_id,
                    "rejected incompatible configuration for active pool"
                );
                return Err(ConfigError::Incompatible);
            }
        } else {
            state.phase = PoolPhase::Inactive;
        }

        debug!(
            pool_id = self.shared.pool_id,
            shape = %config.shape(),
            item_size = config.item_size(),
            min_items = config.min_items(),
            max_items = config.max_items(),
            "pool configured"
        );

        state.config = Some(Arc::new(config));

        Ok(())
    }

    /// Starts or stops handing out items.
    ///
    /// Activating preallocates the configured minimum number of items (limited by the ceiling
    /// minus items still in circulation from an earlier activation). Activating an active pool
    /// does nothing.
    ///
    /// Deactivating destroys every item waiting in the pool and wakes blocked acquirers, which
    /// fail with [`FlowError::Flushing`]. Items in circulation are destroyed when released.
    /// Deactivating a pool that is not active does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ActivationError::Unconfigured`] when activating a pool that has never been
    /// configured and [`ActivationError::AllocationFailed`] if preallocation fails, in which case
    /// the items allocated so far are destroyed and the pool stays inactive.
    pub fn set_active(&self, active: bool) -> Result<(), ActivationError> {
        if active {
            self.activate()
        } else {
            self.deactivate();
            Ok(())
        }
    }

    fn activate(&self) -> Result<(), ActivationError> {
        let mut state = self.shared.lock_state();

        let config = match state.phase {
            PoolPhase::Active => return Ok(()),
            PoolPhase::Unconfigured => return Err(ActivationError::Unconfigured),
            PoolPhase::Inactive => state
                .config
                .clone()
                .ok_or(ActivationError::Unconfigured)?,
        };

        let target = if config.is_bounded() {
            config
                .min_items()
                .min(config.max_items().saturating_sub(state.outstanding))
        } else {
            config.min_items()
        };

        // Activation is rare and must not race another activation, so we preallocate while
        // holding the lock.
        let mut preallocated = VecDeque::with_capacity(target as usize);

        for _ in 0..target {
            match self.shared.factory.allocate(&config, None) {
                Ok(item) => preallocated.push_back(item),
                Err(error) => {
                    drop(state);

                    let count = preallocated.len() as u64;
                    self.shared.counters.record_allocated(count);
                    self.shared.counters.record_destroyed(count);
                    drop(preallocated);

                    debug!(
                        pool_id = self.shared.pool_id,
                        %error,
                        "pool activation failed during preallocation"
                    );
                    return Err(ActivationError::AllocationFailed(error));
                }
            }
        }

        self.shared
            .counters
            .record_allocated(preallocated.len() as u64);

        state.available = preallocated;
        state.phase = PoolPhase::Active;

        debug!(
            pool_id = self.shared.pool_id,
            preallocated = target,
            "pool activated"
        );

        Ok(())
    }

    fn deactivate(&self) {
        let mut state = self.shared.lock_state();

        if state.phase != PoolPhase::Active {
            return;
        }

        state.phase = PoolPhase::Inactive;
        state.generation = state.generation.wrapping_add(1);
        let drained = mem::take(&mut state.available);
        let outstanding = state.outstanding;

        drop(state);
        self.shared.item_returned.notify_all();

        self.shared.counters.record_destroyed(drained.len() as u64);

        debug!(
            pool_id = self.shared.pool_id,
            destroyed = drained.len(),
            outstanding,
            "pool deactivated"
        );

        drop(drained);
    }

    /// Starts or stops flushing.
    ///
    /// While flushing, acquiring fails with [`FlowError::Flushing`], including for acquirers
    /// that are currently blocked waiting for an item. Items in circulation are not affected
    /// and are still recycled when released.
    pub fn set_flushing(&self, flushing: bool) {
        let mut state = self.shared.lock_state();
        state.flushing = flushing;
        drop(state);

        if flushing {
            self.shared.item_returned.notify_all();
        }

        debug!(pool_id = self.shared.pool_id, flushing, "pool flushing changed");
    }

    /// Acquires an item, applying the configured [`WaitPolicy`] if the pool is exhausted.
    ///
    /// # Errors
    ///
    /// See [`acquire_with()`][Self::acquire_with].
    pub fn acquire(&self) -> Result<Pooled<F::Item>, FlowError> {
        self.acquire_with(&AcquireParams::new())
    }

    /// Acquires an item without waiting if the pool is exhausted.
    ///
    /// # Errors
    ///
    /// See [`acquire_with()`][Self::acquire_with].
    pub fn try_acquire(&self) -> Result<Pooled<F::Item>, FlowError> {
        self.acquire_with(&AcquireParams::new().dont_wait())
    }

    /// Acquires an item.
    ///
    /// The most recently released item is handed out first. If none is waiting in the pool and
    /// the pool is below its ceiling, a new item is allocated with the hints from `params`.
    /// Otherwise the configured [`WaitPolicy`] decides what happens, unless `params` asks not to
    /// wait.
    ///
    /// # Errors
    ///
    /// * [`FlowError::Flushing`] if the pool is not active or is flushing, including when
    ///   either happens while waiting.
    /// * [`FlowError::Exhausted`] if the pool is at its ceiling and waiting was not allowed or
    ///   timed out.
    /// * [`FlowError::AllocationFailed`] if the factory failed to allocate a new item. The pool
    ///   remains usable.
    ///
    /// # Example
    ///
    /// ```rust
    /// use media_pool::{AcquireParams, BufferFactory, BufferHints, FlowError, Pool, PoolConfig};
    ///
    /// let pool = Pool::new(BufferFactory::new());
    /// pool.configure(PoolConfig::builder().item_size(2).max_items(1).build().unwrap()).unwrap();
    /// pool.set_active(true).unwrap();
    ///
    /// let hints = BufferHints::fill(0x10);
    /// let buffer = pool.acquire_with(&AcquireParams::new().hints(&hints)).unwrap();
    /// assert_eq!(&*buffer.map_readable().unwrap(), &[0x10, 0x10]);
    ///
    /// let again = pool.acquire_with(&AcquireParams::new().dont_wait());
    /// assert!(matches!(again, Err(FlowError::Exhausted)));
    /// ```
    pub fn acquire_with(
        &self,
        params: &AcquireParams<'_, F::Hints>,
    ) -> Result<Pooled<F::Item>, FlowError> {
        let started = Instant::now();
        let mut waited = false;

        let mut state = self.shared.lock_state();

        loop {
            if state.phase != PoolPhase::Active || state.flushing {
                return Err(FlowError::Flushing);
            }

            let Some(config) = state.config.clone() else {
                return Err(FlowError::Flushing);
            };

            let generation = state.generation;

            if let Some(item) = state.available.pop_front() {
                state.outstanding = state
                    .outstanding
                    .checked_add(1)
                    .expect("outstanding item count cannot overflow");
                drop(state);

                self.shared.counters.record_acquired();
                trace!(pool_id = self.shared.pool_id, "reusing available item");

                return Ok(self.hand_out(item, generation));
            }

            if !config.is_bounded() || state.outstanding < config.max_items() {
                // Reserve the slot so concurrent acquirers respect the ceiling while we allocate.
                state.outstanding = state
                    .outstanding
                    .checked_add(1)
                    .expect("outstanding item count cannot overflow");
                drop(state);

                return self.allocate_reserved(&config, params.hints, generation);
            }

            let policy = if params.dont_wait {
                WaitPolicy::FailFast
            } else {
                config.wait_policy()
            };

            if !waited && policy != WaitPolicy::FailFast {
                waited = true;
                self.shared.counters.record_waited();
                trace!(pool_id = self.shared.pool_id, "pool exhausted, waiting for an item");
            }

            state = match policy {
                WaitPolicy::FailFast => return Err(FlowError::Exhausted),
                WaitPolicy::Block => self
                    .shared
                    .item_returned
                    .wait(state)
                    .expect(ERR_POISONED_LOCK),
                WaitPolicy::BlockFor(timeout) => {
                    let remaining = timeout.saturating_sub(started.elapsed());

                    if remaining.is_zero() {
                        return Err(FlowError::Exhausted);
                    }

                    self.shared
                        .item_returned
                        .wait_timeout(state, remaining)
                        .expect(ERR_POISONED_LOCK)
                        .0
                }
            };
        }
    }

    fn allocate_reserved(
        &self,
        config: &PoolConfig,
        hints: Option<&F::Hints>,
        generation: u64,
    ) -> Result<Pooled<F::Item>, FlowError> {
        match self.shared.factory.allocate(config, hints) {
            Ok(item) => {
                self.shared.counters.record_allocated(1);
                self.shared.counters.record_acquired();
                trace!(pool_id = self.shared.pool_id, "allocated new item");

                Ok(self.hand_out(item, generation))
            }
            Err(error) => {
                self.shared.free_slot();

                debug!(pool_id = self.shared.pool_id, %error, "item allocation failed");
                Err(FlowError::AllocationFailed(error))
            }
        }
    }

    fn hand_out(&self, item: F::Item, generation: u64) -> Pooled<F::Item> {
        let shared = Arc::clone(&self.shared);
        Pooled::new(item, generation, shared)
    }

    /// Releases an item back to the pool. Equivalent to [`Pooled::release()`].
    ///
    /// # Panics
    ///
    /// Panics if the handle was acquired from a different pool.
    #[expect(
        clippy::must_use_candidate,
        reason = "callers that do not care about the outcome simply drop the handle"
    )]
    pub fn release(&self, pooled: Pooled<F::Item>) -> ReleaseOutcome {
        assert!(
            pooled.pool_id() == self.shared.pool_id,
            "provided handle does not belong to this pool"
        );

        pooled.release()
    }

    /// The factory that creates the items of this pool.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// The configuration currently applied, if any.
    #[must_use]
    pub fn config(&self) -> Option<PoolConfig> {
        self.shared.lock_state().config.as_deref().cloned()
    }

    /// Where the pool is in its lifecycle.
    #[must_use]
    pub fn phase(&self) -> PoolPhase {
        self.shared.lock_state().phase
    }

    /// Whether the pool is handing out items.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.phase() == PoolPhase::Active
    }

    /// Whether the pool is flushing.
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.shared.lock_state().flushing
    }

    /// The number of items currently in circulation.
    #[must_use]
    pub fn outstanding(&self) -> u32 {
        self.shared.lock_state().outstanding
    }

    /// The number of items waiting in the pool for an acquirer.
    #[must_use]
    pub fn available(&self) -> usize {
        self.shared.lock_state().available.len()
    }

    /// A snapshot of the pool's activity counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock_state();
        let outstanding = state.outstanding;
        let available = state.available.len();
        drop(state);

        self.shared.counters.snapshot(outstanding, available)
    }
}

impl<F: ItemFactory> PoolShared<F> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState<F::Item>> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }

    fn free_slot(&self) {
        let mut state = self.lock_state();
        state.outstanding = state
            .outstanding
            .checked_sub(1)
            .expect("freed a slot that was never reserved");
        drop(state);

        self.item_returned.notify_one();
    }
}

impl<F: ItemFactory> ItemSink<F::Item> for PoolShared<F> {
    fn release(&self, mut item: F::Item, generation: u64) -> ReleaseOutcome {
        // Item inspection may be arbitrarily expensive, keep it outside the lock.
        let decision = item.on_release();

        let mut state = self.lock_state();
        state.outstanding = state
            .outstanding
            .checked_sub(1)
            .expect("released more items than were handed out");

        let destroy_reason = match decision {
            Decision::Destroy => Some(DestroyReason::Dirty),
            Decision::Recycle
                if state.phase != PoolPhase::Active || state.generation != generation =>
            {
                Some(DestroyReason::Inactive)
            }
            Decision::Recycle => None,
        };

        let Some(reason) = destroy_reason else {
            state.available.push_front(item);
            drop(state);
            self.item_returned.notify_one();

            self.counters.record_recycled();
            trace!(pool_id = self.pool_id, "item recycled");

            return ReleaseOutcome::Recycled;
        };

        drop(state);
        self.item_returned.notify_one();

        self.counters.record_destroyed(1);
        trace!(pool_id = self.pool_id, ?reason, "released item destroyed");
        drop(item);

        ReleaseOutcome::Destroyed(reason)
    }

    fn forget(&self) {
        self.free_slot();

        self.counters.record_detached();
        trace!(pool_id = self.pool_id, "item detached");
    }

    fn pool_id(&self) -> u64 {
        self.pool_id
    }
}

impl<F: ItemFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: ItemFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock_state();

        f.debug_struct("Pool")
            .field("pool_id", &self.shared.pool_id)
            .field("phase", &state.phase)
            .field("flushing", &state.flushing)
            .field("outstanding", &state.outstanding)
            .field("available", &state.available.len())
            .finish_non_exhaustive()
    }
}

/// Per-call parameters for [`Pool::acquire_with()`].
///
/// # Example
///
/// ```rust
/// use media_pool::{AcquireParams, BufferHints};
///
/// let hints = BufferHints::fill(0xFF);
/// let params = AcquireParams::new().hints(&hints).dont_wait();
/// # let _ = params;
/// ```
#[must_use]
pub struct AcquireParams<'a, H> {
    hints: Option<&'a H>,
    dont_wait: bool,
}

impl<'a, H> AcquireParams<'a, H> {
    /// Parameters that use the pool's defaults.
    pub fn new() -> Self {
        Self {
            hints: None,
            dont_wait: false,
        }
    }

    /// Passes allocation hints to the [`ItemFactory`] if this call allocates a new item.
    /// The pool does not interpret them.
    pub fn hints(mut self, hints: &'a H) -> Self {
        self.hints = Some(hints);
        self
    }

    /// Fails with [`FlowError::Exhausted`] instead of applying the configured [`WaitPolicy`]
    /// when the pool is exhausted.
    pub fn dont_wait(mut self) -> Self {
        self.dont_wait = true;
        self
    }
}

impl<H> Default for AcquireParams<'_, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> fmt::Debug for AcquireParams<'_, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquireParams")
            .field("has_hints", &self.hints.is_some())
            .field("dont_wait", &self.dont_wait)
            .finish()
    }
}
