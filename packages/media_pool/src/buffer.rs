use std::time::Duration;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard};

use crate::{AllocationError, Decision, ItemFactory, Memory, PoolConfig, Recycle};

/// A pooled media buffer: a visible region of a [`Memory`] plus per-use metadata.
///
/// A buffer is created with its visible region covering the whole memory. Downstream code may
/// shrink the region, remove or replace the memory, or lend the memory out under an exclusive
/// lock. Any of these make the buffer dirty, and a dirty buffer is destroyed instead of being
/// recycled when it is released back to its pool. Timestamps are per-use metadata and are
/// cleared whenever the buffer is recycled.
///
/// # Example
///
/// ```rust
/// use media_pool::{Buffer, Memory};
///
/// let mut buffer = Buffer::new(Memory::zeroed(8).unwrap());
/// assert_eq!(buffer.size(), 8);
/// assert!(!buffer.is_dirty());
///
/// buffer.map_writable().unwrap()[..2].copy_from_slice(b"hi");
/// assert_eq!(&buffer.map_readable().unwrap()[..2], b"hi");
///
/// buffer.resize(0, 4);
/// assert!(buffer.is_dirty());
/// ```
#[derive(Debug)]
pub struct Buffer {
    memory: Option<Memory>,

    /// Visible region within the memory.
    offset: usize,
    len: usize,

    /// The size the buffer was created with. A recycled buffer must still have it.
    allocated_size: usize,

    /// Set when the memory was taken out or swapped for another region.
    memory_tagged: bool,

    pts: Option<Duration>,
    duration: Option<Duration>,
}

impl Buffer {
    /// Creates a buffer whose visible region covers all of `memory`.
    #[must_use]
    pub fn new(memory: Memory) -> Self {
        let size = memory.size();

        Self {
            memory: Some(memory),
            offset: 0,
            len: size,
            allocated_size: size,
            memory_tagged: false,
            pts: None,
            duration: None,
        }
    }

    /// The size of the visible region in bytes, or zero if the memory has been removed.
    #[must_use]
    pub fn size(&self) -> usize {
        if self.memory.is_some() { self.len } else { 0 }
    }

    /// The offset of the visible region within the memory.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The memory backing this buffer, if it has not been removed.
    #[must_use]
    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref()
    }

    /// Maps the visible region for reading.
    ///
    /// Returns [`None`] if the memory has been removed.
    pub fn map_readable(&self) -> Option<MappedRwLockReadGuard<'_, [u8]>> {
        let memory = self.memory.as_ref()?;
        let range = self.offset..self.end();

        Some(MappedRwLockReadGuard::map(memory.read(), |bytes| {
            bytes
                .get(range)
                .expect("visible region is kept within the memory by resize()")
        }))
    }

    /// Maps the visible region for writing.
    ///
    /// Returns [`None`] if the memory has been removed or another holder has locked it
    /// exclusively.
    pub fn map_writable(&mut self) -> Option<MappedRwLockWriteGuard<'_, [u8]>> {
        let memory = self.memory.as_ref()?;

        if memory.is_exclusively_locked() {
            return None;
        }

        let range = self.offset..self.end();

        Some(MappedRwLockWriteGuard::map(memory.write(), |bytes| {
            bytes
                .get_mut(range)
                .expect("visible region is kept within the memory by resize()")
        }))
    }

    /// Changes the visible region to `len` bytes starting at `offset`.
    ///
    /// Any region other than the full memory makes the buffer dirty.
    ///
    /// # Panics
    ///
    /// Panics if the memory has been removed or the region does not fit in the memory.
    pub fn resize(&mut self, offset: usize, len: usize) {
        let memory = self
            .memory
            .as_ref()
            .expect("cannot resize a buffer whose memory has been removed");

        let end = offset
            .checked_add(len)
            .expect("visible region end overflows usize");
        assert!(
            end <= memory.size(),
            "visible region {offset}..{end} exceeds memory of {} bytes",
            memory.size()
        );

        self.offset = offset;
        self.len = len;
    }

    /// Takes the memory out of the buffer, leaving it empty and dirty.
    pub fn remove_memory(&mut self) -> Option<Memory> {
        let memory = self.memory.take();

        if memory.is_some() {
            self.memory_tagged = true;
            self.offset = 0;
            self.len = 0;
        }

        memory
    }

    /// Replaces the memory of the buffer, returning the previous one. The buffer becomes dirty
    /// and its visible region covers all of the new memory.
    pub fn replace_memory(&mut self, memory: Memory) -> Option<Memory> {
        self.memory_tagged = true;
        self.offset = 0;
        self.len = memory.size();

        self.memory.replace(memory)
    }

    /// Whether the buffer can no longer be recycled as-is.
    ///
    /// A buffer is dirty if its memory was removed or replaced, its visible region differs from
    /// the full allocated size, or some holder owns an exclusive lock on its memory. Shared
    /// references to the memory do not make a buffer dirty.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        let Some(memory) = &self.memory else {
            return true;
        };

        self.memory_tagged
            || self.offset != 0
            || self.len != self.allocated_size
            || memory.size() != self.allocated_size
            || memory.is_exclusively_locked()
    }

    /// Presentation timestamp of the buffer contents.
    #[must_use]
    pub fn pts(&self) -> Option<Duration> {
        self.pts
    }

    /// Sets the presentation timestamp of the buffer contents.
    pub fn set_pts(&mut self, pts: Option<Duration>) {
        self.pts = pts;
    }

    /// Duration of the buffer contents.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Sets the duration of the buffer contents.
    pub fn set_duration(&mut self, duration: Option<Duration>) {
        self.duration = duration;
    }

    fn end(&self) -> usize {
        // Cannot overflow, resize() checked it.
        self.offset.wrapping_add(self.len)
    }
}

impl Recycle for Buffer {
    fn on_release(&mut self) -> Decision {
        if self.is_dirty() {
            return Decision::Destroy;
        }

        self.pts = None;
        self.duration = None;

        Decision::Recycle
    }
}

/// Allocation hints understood by [`BufferFactory`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BufferHints {
    fill: u8,
}

impl BufferHints {
    /// Requests that newly allocated buffers have every byte set to `value` instead of zero.
    ///
    /// Recycled buffers keep whatever contents they had.
    #[must_use]
    pub fn fill(value: u8) -> Self {
        Self { fill: value }
    }
}

/// Allocates [`Buffer`]s with [`PoolConfig::item_size()`] bytes of heap memory each.
///
/// # Example
///
/// ```rust
/// use media_pool::{BufferFactory, Pool, PoolConfig};
///
/// let pool = Pool::new(BufferFactory::new());
/// pool.configure(PoolConfig::builder().item_size(10).build().unwrap()).unwrap();
/// pool.set_active(true).unwrap();
///
/// let buffer = pool.acquire().unwrap();
/// assert_eq!(buffer.size(), 10);
/// ```
#[derive(Debug, Default)]
pub struct BufferFactory {
    _private: (),
}

impl BufferFactory {
    /// Creates a new buffer factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ItemFactory for BufferFactory {
    type Item = Buffer;
    type Hints = BufferHints;

    fn allocate(
        &self,
        config: &PoolConfig,
        hints: Option<&BufferHints>,
    ) -> Result<Buffer, AllocationError> {
        let fill = hints.map_or(0, |hints| hints.fill);

        Ok(Buffer::new(Memory::filled(config.item_size(), fill)?))
    }
}
