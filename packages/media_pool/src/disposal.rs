use std::any::Any;
use std::fmt;
use std::mem::{self, ManuallyDrop};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::Fence;
use crate::constants::ERR_POISONED_LOCK;

type DisposalEntry = Box<dyn FnOnce() + Send>;

type PanicPayload = Box<dyn Any + Send>;

/// Runs every entry in push order, leaving `entries` empty. A panicking destructor does not stop
/// the ones after it; the first panic is returned for the caller to resume once its bookkeeping
/// is done.
fn run_entries(entries: &mut Vec<DisposalEntry>) -> Option<PanicPayload> {
    let mut first_panic = None;

    for entry in entries.drain(..) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
            warn!("deferred destructor panicked");

            if first_panic.is_none() {
                first_panic = Some(payload);
            }
        }
    }

    first_panic
}

fn resume_panic(first_panic: Option<PanicPayload>) {
    // Resuming while already unwinding would abort the process.
    if let Some(payload) = first_panic {
        if !thread::panicking() {
            panic::resume_unwind(payload);
        }
    }
}

/// Mints [`FenceDisposalQueue`]s and takes them back once their work has been disposed of.
///
/// Resources that outstanding device work may still read (staging buffers, descriptor heaps,
/// the pooled items themselves) must not be destroyed until that work has finished. A disposal
/// queue collects such resources together with the code that destroys them, and is submitted
/// against a [`Fence`]. The destructors run, in the order they were pushed, once the fence
/// signals.
///
/// Queues are recycled through a free-list, so steady-state use does not allocate. The pool is a
/// cheap handle: clones share the same free-list.
///
/// # Example
///
/// ```rust
/// use media_pool::{DisposalQueuePool, TimelineFence};
///
/// let disposal = DisposalQueuePool::new();
/// let timeline = TimelineFence::new();
///
/// let mut queue = disposal.acquire_queue();
/// queue.push_drop(vec![0_u8; 4096]);
/// queue.submit(&timeline.at(1));
///
/// assert_eq!(disposal.stats().pending, 1);
///
/// timeline.signal(1);
///
/// assert_eq!(disposal.stats().pending, 0);
/// assert_eq!(disposal.stats().free_queues, 1);
/// ```
#[derive(Clone, Default)]
pub struct DisposalQueuePool {
    shared: Arc<DisposalShared>,
}

#[derive(Default)]
struct DisposalShared {
    state: Mutex<DisposalState>,

    // Signaled when the last pending submission completes.
    idle: Condvar,

    next_submission_id: AtomicU64,
    queues_allocated: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
}

#[derive(Default)]
struct DisposalState {
    free: Vec<Vec<DisposalEntry>>,
    pending: u64,
}

impl DisposalQueuePool {
    /// Creates a pool with an empty free-list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a queue from the free-list, or creates a new one if the free-list is empty.
    #[must_use]
    pub fn acquire_queue(&self) -> FenceDisposalQueue {
        let recycled = self.shared.lock_state().free.pop();

        let entries = recycled.unwrap_or_else(|| {
            self.shared.queues_allocated.fetch_add(1, Ordering::Relaxed);
            Vec::new()
        });

        FenceDisposalQueue {
            entries,
            shared: Arc::clone(&self.shared),
        }
    }

    /// A snapshot of the pool's activity counters.
    #[must_use]
    pub fn stats(&self) -> DisposalStats {
        let state = self.shared.lock_state();
        let pending = state.pending;
        let free_queues = state.free.len();
        drop(state);

        DisposalStats {
            queues_allocated: self.shared.queues_allocated.load(Ordering::Relaxed),
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            pending,
            free_queues,
        }
    }

    /// Blocks until no submitted queue is waiting for its fence, or the timeout elapses.
    ///
    /// Returns whether the pool became idle. Use this at teardown to make sure every deferred
    /// resource has been destroyed before the device itself goes away.
    #[must_use]
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.shared.lock_state();

        let (state, _) = self
            .shared
            .idle
            .wait_timeout_while(state, timeout, |state| state.pending != 0)
            .expect(ERR_POISONED_LOCK);

        state.pending == 0
    }
}

impl DisposalShared {
    fn lock_state(&self) -> MutexGuard<'_, DisposalState> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }

    fn recycle(&self, entries: Vec<DisposalEntry>) {
        debug_assert!(entries.is_empty());

        self.lock_state().free.push(entries);
    }
}

impl fmt::Debug for DisposalQueuePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisposalQueuePool")
            .field("stats", &self.stats())
            .finish()
    }
}

/// A snapshot of the activity of a [`DisposalQueuePool`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct DisposalStats {
    /// Queues created because the free-list was empty.
    pub queues_allocated: u64,

    /// Queues submitted against a fence.
    pub submitted: u64,

    /// Submissions whose destructors have run.
    pub completed: u64,

    /// Submissions still waiting for their fence.
    pub pending: u64,

    /// Queues currently in the free-list.
    pub free_queues: usize,
}

/// An ordered list of deferred destructors, waiting to be submitted against a [`Fence`].
///
/// Dropping a queue without submitting it runs its destructors immediately.
pub struct FenceDisposalQueue {
    entries: Vec<DisposalEntry>,
    shared: Arc<DisposalShared>,
}

impl FenceDisposalQueue {
    /// Defers `destructor(payload)` until the fence this queue is submitted against signals.
    ///
    /// Destructors run in the order they were pushed.
    pub fn push<T, D>(&mut self, payload: T, destructor: D)
    where
        T: Send + 'static,
        D: FnOnce(T) + Send + 'static,
    {
        self.entries.push(Box::new(move || destructor(payload)));
    }

    /// Defers dropping `value` until the fence this queue is submitted against signals.
    pub fn push_drop<T: Send + 'static>(&mut self, value: T) {
        self.push(value, drop);
    }

    /// The number of deferred destructors in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue holds no deferred destructors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Submits the queue against `fence`. Its destructors run when the fence signals, on the
    /// thread that completes the [`FenceCompletion`].
    pub fn submit(self, fence: &(impl Fence + ?Sized)) {
        let mut this = ManuallyDrop::new(self);
        let entries = mem::take(&mut this.entries);

        // SAFETY: `this` is never dropped and the field is not touched again after this.
        let shared = unsafe { ptr::read(&raw const this.shared) };

        let submission_id = shared.next_submission_id.fetch_add(1, Ordering::Relaxed);
        shared.submitted.fetch_add(1, Ordering::Relaxed);

        let mut state = shared.lock_state();
        state.pending = state
            .pending
            .checked_add(1)
            .expect("pending submission count cannot overflow");
        drop(state);

        debug!(submission_id, entries = entries.len(), "disposal queue submitted");

        fence.on_signaled(FenceCompletion {
            entries,
            submission_id: Some(submission_id),
            shared,
        });
    }
}

impl Drop for FenceDisposalQueue {
    fn drop(&mut self) {
        let mut entries = mem::take(&mut self.entries);

        let first_panic = run_entries(&mut entries);
        self.shared.recycle(entries);

        resume_panic(first_panic);
    }
}

impl fmt::Debug for FenceDisposalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceDisposalQueue")
            .field("len", &self.entries.len())
            .finish_non_exhaustive()
    }
}

/// The obligation to dispose of a submitted [`FenceDisposalQueue`] once its fence signals.
///
/// Calling [`complete()`][Self::complete] or dropping the completion runs every deferred
/// destructor exactly once, in the order they were pushed, and returns the queue to its pool.
/// Dropping is the path for fences that will never signal, for example because the device was
/// lost.
#[must_use = "dropping a completion disposes of its resources immediately"]
pub struct FenceCompletion {
    entries: Vec<DisposalEntry>,

    // Cleared once the destructors have run.
    submission_id: Option<u64>,

    shared: Arc<DisposalShared>,
}

impl FenceCompletion {
    /// Identifies the submission this completion belongs to, for correlating log output with
    /// device work.
    #[must_use]
    pub fn submission_id(&self) -> u64 {
        self.submission_id.unwrap_or_default()
    }

    /// The number of deferred destructors this completion will run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether this completion has no deferred destructors to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs the deferred destructors and returns the queue to its pool.
    ///
    /// # Panics
    ///
    /// If a destructor panics, the remaining destructors still run and the submission is still
    /// counted as completed. The first panic is then resumed on the calling thread.
    pub fn complete(self) {
        drop(self);
    }

    fn dispose(&mut self) {
        let Some(submission_id) = self.submission_id.take() else {
            return;
        };

        let mut entries = mem::take(&mut self.entries);
        let count = entries.len();

        let first_panic = run_entries(&mut entries);

        self.shared.recycle(entries);
        self.shared.completed.fetch_add(1, Ordering::Relaxed);

        let mut state = self.shared.lock_state();
        state.pending = state
            .pending
            .checked_sub(1)
            .expect("completed a submission that was never pending");
        let idle = state.pending == 0;
        drop(state);

        if idle {
            self.shared.idle.notify_all();
        }

        trace!(submission_id, entries = count, "disposal queue completed");

        resume_panic(first_panic);
    }
}

impl Drop for FenceCompletion {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for FenceCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceCompletion")
            .field("submission_id", &self.submission_id)
            .field("len", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::TimelineFence;
    use crate::test_utils::with_watchdog;

    assert_impl_all!(DisposalQueuePool: Send, Sync, Clone);
    assert_impl_all!(FenceDisposalQueue: Send);
    assert_impl_all!(FenceCompletion: Send);

    /// A fence that holds on to its completion until the test releases it.
    #[derive(Default)]
    struct ManualFence {
        completion: Mutex<Option<FenceCompletion>>,
    }

    impl Fence for ManualFence {
        fn on_signaled(&self, completion: FenceCompletion) {
            *self.completion.lock().unwrap() = Some(completion);
        }
    }

    impl ManualFence {
        fn signal(&self) {
            self.completion.lock().unwrap().take().unwrap().complete();
        }
    }

    #[test]
    fn destructors_run_in_fifo_order_after_signal() {
        let disposal = DisposalQueuePool::new();
        let fence = ManualFence::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut queue = disposal.acquire_queue();
        for name in ["a", "b", "c"] {
            queue.push((Arc::clone(&log), name), |(log, name)| {
                log.lock().unwrap().push(name);
            });
        }
        assert_eq!(queue.len(), 3);

        queue.submit(&fence);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(disposal.stats().pending, 1);
        assert_eq!(disposal.stats().free_queues, 0);

        fence.signal();

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(disposal.stats().pending, 0);
        assert_eq!(disposal.stats().completed, 1);
    }

    #[test]
    fn completed_queue_is_reused() {
        let disposal = DisposalQueuePool::new();
        let timeline = TimelineFence::new();

        let free_during_destructor = Arc::new(Mutex::new(Vec::new()));

        let mut queue = disposal.acquire_queue();
        for _ in 0..2 {
            queue.push(
                (disposal.clone(), Arc::clone(&free_during_destructor)),
                |(disposal, observed)| {
                    observed.lock().unwrap().push(disposal.stats().free_queues);
                },
            );
        }
        queue.submit(&timeline.at(1));

        assert_eq!(disposal.stats().free_queues, 0);

        timeline.signal(1);

        // The queue only goes back to the free-list after its last destructor has run.
        assert_eq!(*free_during_destructor.lock().unwrap(), vec![0, 0]);
        assert_eq!(disposal.stats().free_queues, 1);

        let queue = disposal.acquire_queue();
        assert!(queue.is_empty());
        assert_eq!(disposal.stats().queues_allocated, 1);
        assert_eq!(disposal.stats().free_queues, 0);
    }

    #[test]
    fn each_destructor_runs_exactly_once() {
        let disposal = DisposalQueuePool::new();
        let fence = ManualFence::default();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut queue = disposal.acquire_queue();
        for _ in 0..5 {
            queue.push(Arc::clone(&runs), |runs| {
                runs.fetch_add(1, Ordering::Relaxed);
            });
        }
        queue.submit(&fence);
        fence.signal();

        assert_eq!(runs.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn unsubmitted_queue_disposes_on_drop() {
        let disposal = DisposalQueuePool::new();
        let payload = Arc::new(());

        let mut queue = disposal.acquire_queue();
        queue.push_drop(Arc::clone(&payload));
        assert_eq!(Arc::strong_count(&payload), 2);

        drop(queue);

        assert_eq!(Arc::strong_count(&payload), 1);
        assert_eq!(disposal.stats().free_queues, 1);
        assert_eq!(disposal.stats().submitted, 0);
    }

    #[test]
    fn abandoned_completion_disposes_on_drop() {
        struct LostDevice;

        impl Fence for LostDevice {
            fn on_signaled(&self, completion: FenceCompletion) {
                drop(completion);
            }
        }

        let disposal = DisposalQueuePool::new();
        let payload = Arc::new(());

        let mut queue = disposal.acquire_queue();
        queue.push_drop(Arc::clone(&payload));
        queue.submit(&LostDevice);

        assert_eq!(Arc::strong_count(&payload), 1);
        assert_eq!(disposal.stats().completed, 1);
    }

    #[test]
    fn panicking_destructor_does_not_skip_the_rest() {
        let disposal = DisposalQueuePool::new();
        let timeline = TimelineFence::new();
        let later_runs = Arc::new(AtomicUsize::new(0));

        let mut queue = disposal.acquire_queue();
        queue.push((), |()| panic!("destructor failed"));
        queue.push(Arc::clone(&later_runs), |runs| {
            runs.fetch_add(1, Ordering::Relaxed);
        });
        queue.submit(&timeline.at(1));

        let result = panic::catch_unwind(AssertUnwindSafe(|| timeline.signal(1)));
        assert!(result.is_err());

        assert_eq!(later_runs.load(Ordering::Relaxed), 1);

        let stats = disposal.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.free_queues, 1);
        assert!(disposal.wait_idle(Duration::from_millis(1)));
    }

    #[test]
    fn panicking_destructor_in_unsubmitted_queue_does_not_skip_the_rest() {
        let disposal = DisposalQueuePool::new();
        let payload = Arc::new(());

        let mut queue = disposal.acquire_queue();
        queue.push((), |()| panic!("destructor failed"));
        queue.push_drop(Arc::clone(&payload));

        let result = panic::catch_unwind(AssertUnwindSafe(|| drop(queue)));
        assert!(result.is_err());

        assert_eq!(Arc::strong_count(&payload), 1);
        assert_eq!(disposal.stats().free_queues, 1);
    }

    #[test]
    fn submission_ids_are_distinct() {
        let disposal = DisposalQueuePool::new();
        let first = ManualFence::default();
        let second = ManualFence::default();

        disposal.acquire_queue().submit(&first);
        disposal.acquire_queue().submit(&second);

        let first_id = first.completion.lock().unwrap().as_ref().unwrap().submission_id();
        let second_id = second.completion.lock().unwrap().as_ref().unwrap().submission_id();
        assert_ne!(first_id, second_id);
    }

    #[test]
    fn wait_idle_returns_once_signaled_elsewhere() {
        with_watchdog(|| {
            let disposal = DisposalQueuePool::new();
            let timeline = TimelineFence::new();

            disposal.acquire_queue().submit(&timeline.at(1));
            assert!(!disposal.wait_idle(Duration::from_millis(1)));

            let signaler = thread::spawn({
                let timeline = timeline.clone();
                move || timeline.signal(1)
            });

            assert!(disposal.wait_idle(Duration::from_secs(5)));
            signaler.join().unwrap();
        });
    }
}
