use crate::{AllocationError, PoolConfig, Recycle};

/// Creates the items handed out by a [`Pool`][crate::Pool].
///
/// The pool calls [`allocate()`][Self::allocate] whenever it needs a new item: when it is
/// activated and preallocates the configured minimum, and when an acquirer finds no available
/// item while the pool is still below its ceiling. Allocations for an acquirer happen outside
/// the pool's internal lock, so a slow factory only delays the thread that triggered it.
/// Preallocation during [`set_active(true)`][crate::Pool::set_active] holds that lock, so the
/// factory must not call back into the pool that owns it.
///
/// Items are destroyed by dropping them.
///
/// # Example
///
/// ```rust
/// use media_pool::{AllocationError, Decision, ItemFactory, Pool, PoolConfig, Recycle};
///
/// struct Frame(Vec<u16>);
///
/// impl Recycle for Frame {
///     fn on_release(&mut self) -> Decision {
///         Decision::Recycle
///     }
/// }
///
/// struct FrameFactory;
///
/// impl ItemFactory for FrameFactory {
///     type Item = Frame;
///     type Hints = ();
///
///     fn allocate(&self, config: &PoolConfig, _hints: Option<&()>) -> Result<Frame, AllocationError> {
///         Ok(Frame(vec![0; config.item_size() / 2]))
///     }
/// }
///
/// let pool = Pool::new(FrameFactory);
/// pool.configure(PoolConfig::builder().item_size(8).build().unwrap()).unwrap();
/// pool.set_active(true).unwrap();
///
/// let frame = pool.acquire().unwrap();
/// assert_eq!(frame.0.len(), 4);
/// ```
pub trait ItemFactory: Send + Sync + 'static {
    /// The kind of item produced.
    type Item: Recycle;

    /// Collaborator-defined allocation hints, passed through from
    /// [`AcquireParams::hints()`][crate::AcquireParams::hints] without interpretation by the pool.
    type Hints;

    /// Allocates a new item shaped according to `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError`] if the item cannot be created. The pool stays usable.
    fn allocate(
        &self,
        config: &PoolConfig,
        hints: Option<&Self::Hints>,
    ) -> Result<Self::Item, AllocationError>;
}
