#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Resource lifetime primitives for media pipelines: recycling pools of identically shaped
//! items, fence-gated deferred disposal and reader/writer-arbitrated links to shared contexts.
//!
//! # Item pools
//!
//! A [`Pool`] hands out items that are expensive to create, such as frame buffers, and takes
//! them back when the consumer is done. Each item decides at release time, via [`Recycle`],
//! whether it is still pristine enough to be handed to the next consumer. [`BufferPool`] is a
//! ready-made pool of byte [`Buffer`]s.
//!
//! * **Bounded or unbounded**: a ceiling on the number of items in existence, with a
//!   configurable [`WaitPolicy`] for when every item is in circulation.
//! * **LIFO reuse**: the most recently released (and therefore cache-warm) item is reused first.
//! * **Explicit lifecycle**: pools are configured, activated, flushed and deactivated, matching
//!   the state changes of the pipeline that owns them.
//!
//! # Deferred disposal
//!
//! A [`DisposalQueuePool`] mints [`FenceDisposalQueue`]s that hold resources still in use by
//! device work and destroy them, in order, once a [`Fence`] signals.
//!
//! # Context links
//!
//! A [`LinkSlot`] lets any number of threads borrow a shared context while guaranteeing that
//! detaching the context waits for every borrower and is never starved by them.
//!
//! # Example
//!
//! ```rust
//! use media_pool::{BufferFactory, BufferPool, PoolConfig, Shape};
//!
//! let pool = BufferPool::new(BufferFactory::new());
//!
//! pool.configure(
//!     PoolConfig::builder()
//!         .shape(Shape::new("audio/x-raw, format=S16LE, channels=2"))
//!         .item_size(10)
//!         .build()
//!         .unwrap(),
//! )
//! .unwrap();
//! pool.set_active(true).unwrap();
//!
//! let first = pool.acquire().unwrap();
//! let memory = first.memory().unwrap().clone();
//! assert_eq!(first.size(), 10);
//! drop(first);
//!
//! // The buffer came back clean, so it is reused.
//! let second = pool.acquire().unwrap();
//! assert!(second.memory().unwrap().same_region(&memory));
//! drop(second);
//!
//! pool.set_active(false).unwrap();
//! assert_eq!(pool.stats().destroyed, 1);
//! ```

mod buffer;
mod config;
mod constants;
mod disposal;
mod error;
mod factory;
mod fence;
mod link;
mod memory;
mod pool;
mod pooled;
mod recycle;
mod stats;

#[cfg(test)]
mod test_utils;

pub use buffer::*;
pub use config::*;
pub use disposal::*;
pub use error::*;
pub use factory::*;
pub use fence::*;
pub use link::*;
pub use memory::*;
pub use pool::*;
pub use pooled::*;
pub use recycle::*;
pub use stats::*;
