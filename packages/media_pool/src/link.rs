use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};
use tracing::debug;

/// The shared part of an attachment: a lock guarding the context it points to.
///
/// Borrowers hold an `Arc` to the link itself, so the link outlives its slot if it has to.
/// The context is only ever reachable through a read guard on the link.
type Link<C> = RwLock<Option<Arc<C>>>;

thread_local! {
    // Addresses of the links this thread currently holds read guards on. A thread that already
    // holds a guard must not queue behind a waiting writer, as that writer is waiting for it.
    static HELD_LINKS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

fn link_key<C>(link: &Arc<Link<C>>) -> usize {
    Arc::as_ptr(link).addr()
}

fn is_held_by_current_thread(key: usize) -> bool {
    HELD_LINKS.with(|held| held.borrow().contains(&key))
}

/// An owner's attachment point for a shared context (for example the device context an element
/// renders with), arbitrating between threads that borrow the context and the thread that
/// detaches it.
///
/// Any number of threads may borrow the context at the same time via
/// [`lock_for_read()`][Self::lock_for_read]. [`tear_down()`][Self::tear_down] detaches the
/// context and waits until every borrow has ended, after which no thread holds or can obtain the
/// context through this slot. Readers cannot starve a waiting teardown, and a thread that
/// already borrows the context may borrow it again without deadlocking behind that teardown.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use media_pool::LinkSlot;
///
/// struct DeviceContext {
///     name: &'static str,
/// }
///
/// let slot = LinkSlot::new();
/// slot.attach(Arc::new(DeviceContext { name: "gpu0" }));
///
/// let guard = slot.lock_for_read().unwrap();
/// assert_eq!(guard.name, "gpu0");
/// guard.unlock();
///
/// let context = slot.tear_down().unwrap();
/// assert_eq!(Arc::strong_count(&context), 1);
/// assert!(slot.lock_for_read().is_none());
/// ```
pub struct LinkSlot<C> {
    link: Mutex<Option<Arc<Link<C>>>>,
}

impl<C> LinkSlot<C> {
    /// Creates a slot with nothing attached.
    #[must_use]
    pub fn new() -> Self {
        Self {
            link: Mutex::new(None),
        }
    }

    /// Attaches `context` to the slot.
    ///
    /// If a context was already attached, it is torn down first (waiting for its borrowers,
    /// like [`tear_down()`][Self::tear_down]) and returned.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread holds a [`LinkGuard`] on the currently attached context.
    pub fn attach(&self, context: Arc<C>) -> Option<Arc<C>> {
        let new_link = Arc::new(RwLock::new(Some(context)));

        let mut slot = self.link.lock();
        assert_not_held(slot.as_ref());
        let previous = slot.replace(new_link);
        drop(slot);

        debug!(replaced = previous.is_some(), "context attached");

        previous.and_then(|link| link.write().take())
    }

    /// Borrows the attached context for reading.
    ///
    /// Returns `None` if nothing is attached or the context is being torn down.
    #[must_use]
    pub fn lock_for_read(&self) -> Option<LinkGuard<C>> {
        // Cloning under the slot lock means a concurrent teardown either sees our reference
        // to the link or we see the slot already empty.
        let link = Arc::clone(self.link.lock().as_ref()?);
        let key = link_key(&link);

        let guard = if is_held_by_current_thread(key) {
            link.read_arc_recursive()
        } else {
            link.read_arc()
        };

        let context = Arc::clone((*guard).as_ref()?);

        HELD_LINKS.with(|held| held.borrow_mut().push(key));

        Some(LinkGuard {
            context,
            _guard: guard,
            key,
        })
    }

    /// Detaches the context and returns it once no thread borrows it anymore.
    ///
    /// After this returns, no thread holds or can obtain the context through this slot. The
    /// returned `Arc` is the reference the slot held, so the caller may destroy the context
    /// right away. Returns `None` if nothing was attached.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread holds a [`LinkGuard`] on the attached context, since
    /// waiting for it would never end.
    pub fn tear_down(&self) -> Option<Arc<C>> {
        let mut slot = self.link.lock();
        assert_not_held(slot.as_ref());
        let link = slot.take()?;
        drop(slot);

        let context = link.write().take();

        debug!(had_context = context.is_some(), "link torn down");

        context
    }

    /// Whether a context is currently attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.link.lock().is_some()
    }
}

fn assert_not_held<C>(link: Option<&Arc<Link<C>>>) {
    if let Some(link) = link {
        assert!(
            !is_held_by_current_thread(link_key(link)),
            "cannot tear down a link while the current thread holds a read guard on it"
        );
    }
}

impl<C> Default for LinkSlot<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for LinkSlot<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkSlot")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// A borrow of the context attached to a [`LinkSlot`].
///
/// While the guard exists, the context cannot be torn down. The guard must be released on the
/// thread that created it, either with [`unlock()`][Self::unlock] or by dropping it.
pub struct LinkGuard<C> {
    // Fields drop in declaration order: our reference to the context goes away before the read
    // lock is released, so a completed teardown never races with it.
    context: Arc<C>,
    _guard: ArcRwLockReadGuard<RawRwLock, Option<Arc<C>>>,
    key: usize,
}

impl<C> LinkGuard<C> {
    /// Ends the borrow.
    pub fn unlock(self) {
        drop(self);
    }
}

impl<C> Deref for LinkGuard<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

impl<C> Drop for LinkGuard<C> {
    fn drop(&mut self) {
        HELD_LINKS.with(|held| {
            let mut held = held.borrow_mut();

            if let Some(index) = held.iter().rposition(|key| *key == self.key) {
                held.swap_remove(index);
            }
        });
    }
}

impl<C: fmt::Debug> fmt::Debug for LinkGuard<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkGuard")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::test_utils::with_watchdog;

    assert_impl_all!(LinkSlot<u32>: Send, Sync);

    #[derive(Debug)]
    struct Context {
        value: u32,
        alive: AtomicBool,
    }

    impl Context {
        fn new(value: u32) -> Arc<Self> {
            Arc::new(Self {
                value,
                alive: AtomicBool::new(true),
            })
        }
    }

    impl Drop for Context {
        fn drop(&mut self) {
            self.alive.store(false, Ordering::Relaxed);
        }
    }

    #[test]
    fn empty_slot_has_nothing_to_read() {
        let slot = LinkSlot::<Context>::new();

        assert!(slot.lock_for_read().is_none());
        assert!(slot.tear_down().is_none());
        assert!(!slot.is_attached());
    }

    #[test]
    fn tear_down_returns_sole_reference() {
        let slot = LinkSlot::new();
        slot.attach(Context::new(7));

        let guard = slot.lock_for_read().unwrap();
        assert_eq!(guard.value, 7);
        guard.unlock();

        let context = slot.tear_down().unwrap();
        assert_eq!(Arc::strong_count(&context), 1);
        assert!(slot.lock_for_read().is_none());
    }

    #[test]
    fn attach_replaces_previous_context() {
        let slot = LinkSlot::new();

        assert!(slot.attach(Context::new(1)).is_none());
        let previous = slot.attach(Context::new(2)).unwrap();

        assert_eq!(previous.value, 1);
        assert_eq!(Arc::strong_count(&previous), 1);
        assert_eq!(slot.lock_for_read().unwrap().value, 2);
    }

    #[test]
    fn nested_reads_on_one_thread() {
        let slot = LinkSlot::new();
        slot.attach(Context::new(3));

        let outer = slot.lock_for_read().unwrap();
        let inner = slot.lock_for_read().unwrap();

        assert_eq!(outer.value, inner.value);

        drop(inner);
        drop(outer);

        assert!(slot.tear_down().is_some());
    }

    #[test]
    #[should_panic(expected = "holds a read guard")]
    fn tear_down_while_reading_panics() {
        let slot = LinkSlot::new();
        slot.attach(Context::new(3));

        let _guard = slot.lock_for_read().unwrap();
        drop(slot.tear_down());
    }

    #[test]
    fn tear_down_waits_for_readers() {
        with_watchdog(|| {
            let slot = Arc::new(LinkSlot::new());
            slot.attach(Context::new(5));

            let guard = slot.lock_for_read().unwrap();
            let finished = Arc::new(AtomicBool::new(false));

            let teardown = thread::spawn({
                let slot = Arc::clone(&slot);
                let finished = Arc::clone(&finished);
                move || {
                    let context = slot.tear_down();
                    finished.store(true, Ordering::Release);
                    context
                }
            });

            // Wait until the teardown has detached the link, then give it time to queue for
            // the write lock.
            while slot.is_attached() {
                thread::yield_now();
            }
            thread::sleep(Duration::from_millis(20));
            assert!(!finished.load(Ordering::Acquire));

            // Reading again from this thread must not deadlock behind the waiting teardown.
            assert!(slot.lock_for_read().is_none());
            assert_eq!(guard.value, 5);

            drop(guard);

            let context = teardown.join().unwrap().unwrap();
            assert!(finished.load(Ordering::Acquire));
            assert_eq!(Arc::strong_count(&context), 1);
        });
    }

    #[test]
    fn concurrent_readers_never_observe_freed_context() {
        const READERS: usize = 4;

        with_watchdog(|| {
            let slot = Arc::new(LinkSlot::new());
            slot.attach(Context::new(42));

            let start = Arc::new(Barrier::new(READERS + 1));
            let successful_reads = Arc::new(AtomicUsize::new(0));

            let readers: Vec<_> = (0..READERS)
                .map(|_| {
                    let slot = Arc::clone(&slot);
                    let start = Arc::clone(&start);
                    let successful_reads = Arc::clone(&successful_reads);

                    thread::spawn(move || {
                        start.wait();

                        loop {
                            let Some(guard) = slot.lock_for_read() else {
                                break;
                            };

                            assert_eq!(guard.value, 42);
                            assert!(guard.alive.load(Ordering::Relaxed));

                            // Nested borrow while a teardown may be waiting.
                            if let Some(inner) = slot.lock_for_read() {
                                assert_eq!(inner.value, 42);
                            }

                            successful_reads.fetch_add(1, Ordering::Relaxed);
                            guard.unlock();
                        }
                    })
                })
                .collect();

            start.wait();

            while successful_reads.load(Ordering::Relaxed) < 100 {
                thread::yield_now();
            }

            let context = slot.tear_down().unwrap();
            assert_eq!(Arc::strong_count(&context), 1);
            assert!(context.alive.load(Ordering::Relaxed));

            for reader in readers {
                reader.join().unwrap();
            }
        });
    }
}
