use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::AllocationError;

/// A reference-counted region of bytes backing a [`Buffer`][crate::Buffer].
///
/// Cloning a `Memory` creates another shared reference to the same region. Shared references
/// are compatible with recycling the buffer that owns the region: once the buffer is back in
/// the pool, the next acquirer simply shares the region with whoever still holds a reference.
///
/// A holder that needs the region to itself takes an [`ExclusiveLock`]. While any exclusive
/// lock exists, a buffer owning the region is considered dirty and is destroyed rather than
/// recycled when released.
///
/// # Example
///
/// ```rust
/// use media_pool::Memory;
///
/// let memory = Memory::zeroed(16).unwrap();
/// memory.write()[0] = 42;
///
/// let shared = memory.clone();
/// assert_eq!(shared.read()[0], 42);
///
/// let lock = shared.lock_exclusive();
/// assert!(memory.is_exclusively_locked());
///
/// drop(lock);
/// assert!(!memory.is_exclusively_locked());
/// ```
#[derive(Clone)]
pub struct Memory {
    shared: Arc<MemoryShared>,
}

struct MemoryShared {
    bytes: RwLock<Box<[u8]>>,

    // The length of `bytes` never changes, so we keep a copy that can be read without locking.
    size: usize,

    exclusive_locks: AtomicUsize,
}

impl Memory {
    /// Wraps existing bytes.
    #[must_use]
    pub fn from_bytes(bytes: Box<[u8]>) -> Self {
        let size = bytes.len();

        Self {
            shared: Arc::new(MemoryShared {
                bytes: RwLock::new(bytes),
                size,
                exclusive_locks: AtomicUsize::new(0),
            }),
        }
    }

    /// Allocates a zero-filled region of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError`] if the allocator cannot provide `size` bytes.
    pub fn zeroed(size: usize) -> Result<Self, AllocationError> {
        Self::filled(size, 0)
    }

    /// Allocates a region of `size` bytes with every byte set to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError`] if the allocator cannot provide `size` bytes.
    pub fn filled(size: usize, value: u8) -> Result<Self, AllocationError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|e| AllocationError::new(format!("cannot reserve {size} bytes: {e}")))?;
        bytes.resize(size, value);

        Ok(Self::from_bytes(bytes.into_boxed_slice()))
    }

    /// The size of the region in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Locks the region for reading, blocking while a writer holds it.
    pub fn read(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.shared.bytes.read(), |bytes| &**bytes)
    }

    /// Locks the region for writing, blocking while any reader or writer holds it.
    pub fn write(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.shared.bytes.write(), |bytes| &mut **bytes)
    }

    /// Takes an exclusive lock on the region, preventing any buffer that owns it from being
    /// recycled until the lock is dropped.
    #[must_use]
    pub fn lock_exclusive(&self) -> ExclusiveLock {
        self.shared.exclusive_locks.fetch_add(1, Ordering::AcqRel);

        ExclusiveLock {
            memory: self.clone(),
        }
    }

    /// Whether any holder currently owns an [`ExclusiveLock`] on the region.
    #[must_use]
    pub fn is_exclusively_locked(&self) -> bool {
        self.shared.exclusive_locks.load(Ordering::Acquire) != 0
    }

    /// Whether another `Memory` value references the same region.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.shared) > 1
    }

    /// Whether `self` and `other` reference the same region.
    #[must_use]
    pub fn same_region(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("size", &self.shared.size)
            .field("exclusive_locks", &self.shared.exclusive_locks.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// An exclusive claim on a [`Memory`] region, released when dropped.
///
/// Holding the lock keeps the region alive.
#[derive(Debug)]
pub struct ExclusiveLock {
    memory: Memory,
}

impl ExclusiveLock {
    /// The locked region.
    #[must_use]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        self.memory
            .shared
            .exclusive_locks
            .fetch_sub(1, Ordering::AcqRel);
    }
}
