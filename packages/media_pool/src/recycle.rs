/// Capability of an item kind to decide, at release time, whether it may be reused.
///
/// The pool calls [`on_release()`][Self::on_release] exactly once every time an item is
/// released. Implementations inspect the item and either restore it to a pristine state and
/// ask for it to be recycled, or report that it can no longer be handed to the next acquirer
/// as-is (for example because its storage was resized or taken away).
///
/// # Example
///
/// ```rust
/// use media_pool::{Decision, Recycle};
///
/// struct Scratch {
///     data: Vec<u8>,
///     capacity: usize,
/// }
///
/// impl Recycle for Scratch {
///     fn on_release(&mut self) -> Decision {
///         if self.data.capacity() != self.capacity {
///             // Someone grew or shrank the storage, the next user would get the wrong shape.
///             return Decision::Destroy;
///         }
///
///         self.data.clear();
///         Decision::Recycle
///     }
/// }
/// ```
pub trait Recycle: Send + 'static {
    /// Inspects the item as it is released and decides its fate.
    ///
    /// Returning [`Decision::Recycle`] does not guarantee reuse: the pool still destroys the
    /// item if the pool itself is no longer active.
    fn on_release(&mut self) -> Decision;
}

/// The verdict of [`Recycle::on_release()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    /// The item is pristine and may be handed to the next acquirer.
    Recycle,

    /// The item is dirty and must be destroyed.
    Destroy,
}

/// What happened to an item when it was released.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReleaseOutcome {
    /// The item was returned to the pool and will be reused.
    Recycled,

    /// The item was destroyed.
    Destroyed(DestroyReason),
}

impl ReleaseOutcome {
    /// Whether the item went back to the pool.
    #[must_use]
    pub fn is_recycled(self) -> bool {
        matches!(self, Self::Recycled)
    }
}

/// Why a released item was destroyed instead of being recycled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum DestroyReason {
    /// The item itself declined reuse via [`Recycle::on_release()`].
    Dirty,

    /// The pool was not active when the item came back.
    Inactive,
}
