//! Helpers shared by the unit tests of this crate.
//!
//! This workspace has a single package, so these live here as a private test-only module rather
//! than in a separate testing package that other packages would depend on.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use crate::{AllocationError, Decision, ItemFactory, PoolConfig, Recycle};

/// Runs a test that may deadlock on a separate thread and fails it if it does not finish in time.
///
/// Used by the tests in this crate that block on the pool condition variable, the disposal idle
/// signal or a link's read/write lock.
///
/// Setting `MUTATION_TESTING=1` runs the test inline so mutation testing can observe hangs.
pub(crate) fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_thread = thread::spawn(move || {
        drop(tx.send(test_fn()));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_thread.join().expect("test thread must not panic after reporting");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => panic!("test did not finish within {timeout:?}"),
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread exited without reporting a result"),
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

/// An item that counts how many instances have been dropped and lets the test decide
/// whether it is dirty.
#[derive(Debug)]
pub(crate) struct TrackedItem {
    pub(crate) serial: usize,
    pub(crate) size: usize,
    pub(crate) dirty: bool,
    drops: Arc<AtomicUsize>,
}

impl Recycle for TrackedItem {
    fn on_release(&mut self) -> Decision {
        if self.dirty {
            Decision::Destroy
        } else {
            Decision::Recycle
        }
    }
}

impl Drop for TrackedItem {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

/// Creates [`TrackedItem`]s with increasing serial numbers and can be told to fail.
#[derive(Debug, Default)]
pub(crate) struct TrackedFactory {
    next_serial: AtomicUsize,
    drops: Arc<AtomicUsize>,
    fail: AtomicBool,

    // When set, `allocate()` waits on the barrier once on entry and once before returning.
    gate: Mutex<Option<Arc<Barrier>>>,
}

impl TrackedFactory {
    pub(crate) fn new() -> (Self, Arc<AtomicUsize>) {
        let factory = Self::default();
        let drops = Arc::clone(&factory.drops);
        (factory, drops)
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub(crate) fn set_gate(&self, gate: Option<Arc<Barrier>>) {
        *self.gate.lock().unwrap() = gate;
    }
}

impl ItemFactory for TrackedFactory {
    type Item = TrackedItem;
    type Hints = usize;

    fn allocate(
        &self,
        config: &PoolConfig,
        hints: Option<&usize>,
    ) -> Result<TrackedItem, AllocationError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = &gate {
            gate.wait();
            gate.wait();
        }

        if self.fail.load(Ordering::Relaxed) {
            return Err(AllocationError::new("allocation disabled by test"));
        }

        Ok(TrackedItem {
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            size: hints.copied().unwrap_or(config.item_size()),
            dirty: false,
            drops: Arc::clone(&self.drops),
        })
    }
}

pub(crate) fn dropped(drops: &AtomicUsize) -> usize {
    drops.load(Ordering::Relaxed)
}
