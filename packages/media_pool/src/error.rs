use std::borrow::Cow;

use thiserror::Error;

/// An item factory was unable to allocate a new item.
///
/// Allocation failures are fatal only to the operation that requested the item. The pool that
/// asked for the allocation remains usable afterwards.
#[derive(Debug, Error)]
#[error("item allocation failed: {reason}")]
pub struct AllocationError {
    reason: Cow<'static, str>,
}

impl AllocationError {
    /// Creates a new allocation error with a human-readable reason.
    ///
    /// # Example
    ///
    /// ```rust
    /// use media_pool::AllocationError;
    ///
    /// let error = AllocationError::new("device memory exhausted");
    /// assert_eq!(error.reason(), "device memory exhausted");
    /// ```
    #[must_use]
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// A human-readable description of why the allocation failed.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Errors returned when building or applying a pool configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The minimum item count exceeds a bounded maximum item count.
    #[error("min_items ({min_items}) must not exceed max_items ({max_items})")]
    InvalidBounds {
        /// The requested minimum number of items.
        min_items: u32,

        /// The requested maximum number of items.
        max_items: u32,
    },

    /// The pool is active and the new configuration would change the shape of items that may
    /// still be in circulation.
    #[error("configuration is incompatible with the configuration of an active pool")]
    Incompatible,
}

/// Errors returned when activating a pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ActivationError {
    /// The pool has never been configured, so it does not know what items to allocate.
    #[error("pool cannot be activated before it has been configured")]
    Unconfigured,

    /// Preallocating the configured minimum number of items failed.
    #[error("failed to preallocate the minimum number of items")]
    AllocationFailed(#[source] AllocationError),
}

/// Errors returned when acquiring an item from a pool.
///
/// These are expected during normal operation and are cheap to produce. Callers typically
/// react by backing off or by signaling upstream that they are not ready.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FlowError {
    /// The pool is not active or is flushing.
    #[error("pool is flushing or inactive")]
    Flushing,

    /// The pool is bounded, every item is outstanding and the wait policy did not allow
    /// (or gave up) waiting for one to be released.
    #[error("pool is exhausted")]
    Exhausted,

    /// The pool had room for a new item but the factory failed to allocate it.
    #[error("failed to allocate a new item")]
    AllocationFailed(#[source] AllocationError),
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::error::Error as _;
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(AllocationError: Send, Sync, Debug);
    assert_impl_all!(ConfigError: Send, Sync, Debug);
    assert_impl_all!(ActivationError: Send, Sync, Debug);
    assert_impl_all!(FlowError: Send, Sync, Debug);

    #[test]
    fn allocation_failure_is_exposed_as_source() {
        let error = FlowError::AllocationFailed(AllocationError::new("out of memory"));

        let source = error.source().expect("allocation failure must carry a source");
        assert!(source.to_string().contains("out of memory"));
    }

    #[test]
    fn activation_failure_is_exposed_as_source() {
        let error = ActivationError::AllocationFailed(AllocationError::new("no device"));

        assert!(error.source().is_some());
        assert!(ActivationError::Unconfigured.source().is_none());
    }

    #[test]
    fn invalid_bounds_reports_values() {
        let error = ConfigError::InvalidBounds {
            min_items: 7,
            max_items: 3,
        };

        let message = error.to_string();
        assert!(message.contains('7'));
        assert!(message.contains('3'));
    }
}
