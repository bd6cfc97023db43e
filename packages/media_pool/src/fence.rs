use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::FenceCompletion;
use crate::constants::ERR_POISONED_LOCK;

/// A point on a device timeline that eventually signals, for example when GPU work that reads
/// some resources has finished.
///
/// [`FenceDisposalQueue::submit()`][crate::FenceDisposalQueue::submit] hands the fence a
/// [`FenceCompletion`]. The fence implementation must call
/// [`FenceCompletion::complete()`] (or drop the completion) once the point has been reached,
/// from whatever thread observes the signal.
///
/// # Example
///
/// ```rust
/// use std::sync::mpsc;
///
/// use media_pool::{DisposalQueuePool, Fence, FenceCompletion};
///
/// /// Forwards completions to a thread that waits on device events.
/// struct EventFence {
///     waiter: mpsc::Sender<FenceCompletion>,
/// }
///
/// impl Fence for EventFence {
///     fn on_signaled(&self, completion: FenceCompletion) {
///         // If the waiter is gone the completion comes back inside the error and is dropped
///         // right here, which reclaims its resources immediately.
///         drop(self.waiter.send(completion));
///     }
/// }
///
/// let (waiter, events) = mpsc::channel();
/// let fence = EventFence { waiter };
///
/// let disposal = DisposalQueuePool::new();
/// let mut queue = disposal.acquire_queue();
/// queue.push_drop(vec![0_u8; 1024]);
/// queue.submit(&fence);
///
/// // Later, once the device reports the event:
/// events.recv().unwrap().complete();
/// assert_eq!(disposal.stats().completed, 1);
/// ```
pub trait Fence {
    /// Arranges for `completion` to be completed once the fence has signaled.
    ///
    /// Implementations may complete it inline if the fence has already signaled.
    fn on_signaled(&self, completion: FenceCompletion);
}

/// A software timeline fence with a monotonically increasing completed value.
///
/// Work is scheduled against a future value with [`at()`][Self::at] and completed when a value
/// at least as large is passed to [`signal()`][Self::signal]. Clones share the same timeline.
///
/// If the last clone of the fence is dropped while completions are still waiting, they are
/// released without waiting for a signal that can no longer come.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// use media_pool::{DisposalQueuePool, TimelineFence};
///
/// let disposal = DisposalQueuePool::new();
/// let timeline = TimelineFence::new();
/// let disposed = Arc::new(AtomicBool::new(false));
///
/// let mut queue = disposal.acquire_queue();
/// queue.push(Arc::clone(&disposed), |flag| flag.store(true, Ordering::Relaxed));
/// queue.submit(&timeline.at(3));
///
/// timeline.signal(2);
/// assert!(!disposed.load(Ordering::Relaxed));
///
/// timeline.signal(3);
/// assert!(disposed.load(Ordering::Relaxed));
/// ```
#[derive(Clone, Default)]
pub struct TimelineFence {
    shared: Arc<Mutex<TimelineState>>,
}

#[derive(Default)]
struct TimelineState {
    completed: u64,

    // Insertion order is preserved so completions for the same value run in submission order.
    pending: Vec<(u64, FenceCompletion)>,
}

impl TimelineFence {
    /// Creates a timeline whose completed value is zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest value signaled so far.
    #[must_use]
    pub fn completed_value(&self) -> u64 {
        self.shared.lock().expect(ERR_POISONED_LOCK).completed
    }

    /// The number of completions waiting for a future value.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.lock().expect(ERR_POISONED_LOCK).pending.len()
    }

    /// Advances the timeline to `value` and completes everything scheduled at or below it.
    ///
    /// Values lower than the current completed value are ignored. Completions run on the
    /// calling thread, in ascending value order and in submission order for equal values.
    pub fn signal(&self, value: u64) {
        let mut state = self.shared.lock().expect(ERR_POISONED_LOCK);

        if value < state.completed {
            trace!(value, completed = state.completed, "ignoring stale timeline signal");
        }

        state.completed = state.completed.max(value);
        let completed = state.completed;

        let (mut ready, waiting): (Vec<_>, Vec<_>) = mem::take(&mut state.pending)
            .into_iter()
            .partition(|(target, _)| *target <= completed);
        state.pending = waiting;

        // Completions may schedule more work on this timeline, so they must run unlocked.
        drop(state);

        ready.sort_by_key(|(target, _)| *target);

        for (_, completion) in ready {
            completion.complete();
        }
    }

    /// A point on this timeline that is reached once `value` has been signaled.
    #[must_use]
    pub fn at(&self, value: u64) -> TimelinePoint<'_> {
        TimelinePoint {
            timeline: self,
            value,
        }
    }
}

impl fmt::Debug for TimelineFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock().expect(ERR_POISONED_LOCK);

        f.debug_struct("TimelineFence")
            .field("completed", &state.completed)
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// A [`Fence`] that signals when its [`TimelineFence`] reaches a value.
#[derive(Debug)]
pub struct TimelinePoint<'a> {
    timeline: &'a TimelineFence,
    value: u64,
}

impl TimelinePoint<'_> {
    /// The timeline value this point waits for.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.value
    }
}

impl Fence for TimelinePoint<'_> {
    fn on_signaled(&self, completion: FenceCompletion) {
        let mut state = self.timeline.shared.lock().expect(ERR_POISONED_LOCK);

        if state.completed >= self.value {
            drop(state);
            completion.complete();
            return;
        }

        state.pending.push((self.value, completion));
    }
}
