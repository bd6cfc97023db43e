use std::borrow::Cow;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use crate::ConfigError;

/// Opaque descriptor of the shape of the items in a pool (for example a caps string such as
/// `video/x-raw, format=NV12, width=1920, height=1080`).
///
/// The pool never interprets the descriptor. It is only compared for equality when deciding
/// whether two configurations are compatible.
///
/// # Example
///
/// ```rust
/// use media_pool::Shape;
///
/// let a = Shape::new("video/x-raw, format=NV12");
/// let b = Shape::new("video/x-raw, format=NV12");
///
/// assert_eq!(a, b);
/// assert_ne!(a, Shape::new("audio/x-raw"));
/// ```
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Shape {
    descriptor: Arc<str>,
}

impl Shape {
    /// Creates a shape from its descriptor.
    #[must_use]
    pub fn new(descriptor: impl Into<Arc<str>>) -> Self {
        Self {
            descriptor: descriptor.into(),
        }
    }

    /// The descriptor this shape was created from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.descriptor
    }
}

impl Display for Shape {
    #[cfg_attr(test, mutants::skip)] // No API contract for display output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor)
    }
}

/// What [`Pool::acquire()`][crate::Pool::acquire] does when the pool is bounded and every item
/// is outstanding.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum WaitPolicy {
    /// Return [`FlowError::Exhausted`][crate::FlowError::Exhausted] immediately.
    FailFast,

    /// Block until an item is released, the pool is deactivated or flushing starts.
    /// This is the default.
    #[default]
    Block,

    /// Like [`WaitPolicy::Block`] but give up with
    /// [`FlowError::Exhausted`][crate::FlowError::Exhausted] once the timeout elapses.
    BlockFor(Duration),
}

/// Configuration of a [`Pool`][crate::Pool].
///
/// A configuration is immutable once built. Create one via [`PoolConfig::builder()`] and apply
/// it with [`Pool::configure()`][crate::Pool::configure].
///
/// # Example
///
/// ```rust
/// use media_pool::{PoolConfig, Shape};
///
/// let config = PoolConfig::builder()
///     .shape(Shape::new("video/x-raw, format=I420, width=320, height=240"))
///     .item_size(115_200)
///     .min_items(2)
///     .max_items(8)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.item_size(), 115_200);
/// assert_eq!(config.max_items(), 8);
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolConfig {
    shape: Shape,
    item_size: usize,
    min_items: u32,

    /// Zero means the pool is unbounded.
    max_items: u32,

    wait_policy: WaitPolicy,

    /// Named flags for item factories. The pool itself only carries them around.
    options: Vec<Cow<'static, str>>,
}

impl PoolConfig {
    /// Creates a builder for a pool configuration.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// The shape descriptor of the items in the pool.
    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// The size in bytes of each item.
    #[must_use]
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// The number of items allocated eagerly when the pool is activated.
    #[must_use]
    pub fn min_items(&self) -> u32 {
        self.min_items
    }

    /// The maximum number of items that may exist at the same time, or zero if unbounded.
    #[must_use]
    pub fn max_items(&self) -> u32 {
        self.max_items
    }

    /// Whether the pool limits the number of items in existence.
    #[must_use]
    pub fn is_bounded(&self) -> bool {
        self.max_items != 0
    }

    /// What acquiring from an exhausted pool does.
    #[must_use]
    pub fn wait_policy(&self) -> WaitPolicy {
        self.wait_policy
    }

    /// Whether the named option has been set on this configuration.
    ///
    /// # Example
    ///
    /// ```rust
    /// use media_pool::PoolConfig;
    ///
    /// let config = PoolConfig::builder().option("video-meta").build().unwrap();
    ///
    /// assert!(config.has_option("video-meta"));
    /// assert!(!config.has_option("video-alignment"));
    /// ```
    #[must_use]
    pub fn has_option(&self, name: &str) -> bool {
        self.options.iter().any(|option| option == name)
    }

    /// All options set on this configuration, in the order they were added.
    pub fn options(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(AsRef::as_ref)
    }

    /// Checks whether this configuration satisfies the requirements of a consumer.
    ///
    /// Returns `true` if all of the following hold:
    ///
    /// * the shapes are equal;
    /// * items are at least `item_size` bytes;
    /// * at least `min_items` items are preallocated;
    /// * the requested maximum does not exceed the pool's ceiling. A `max_items` of zero
    ///   expresses no requirement and an unbounded pool has no ceiling.
    ///
    /// # Example
    ///
    /// ```rust
    /// use media_pool::{PoolConfig, Shape};
    ///
    /// let shape = Shape::new("video/x-raw");
    /// let config = PoolConfig::builder()
    ///     .shape(shape.clone())
    ///     .item_size(5)
    ///     .min_items(4)
    ///     .max_items(30)
    ///     .build()
    ///     .unwrap();
    ///
    /// assert!(config.validate_params(&shape, 5, 4, 0));
    /// assert!(config.validate_params(&shape, 4, 2, 0));
    /// assert!(!config.validate_params(&shape, 5, 6, 0));
    /// assert!(!config.validate_params(&Shape::new("audio/x-raw"), 5, 4, 0));
    /// ```
    #[must_use]
    pub fn validate_params(
        &self,
        shape: &Shape,
        item_size: usize,
        min_items: u32,
        max_items: u32,
    ) -> bool {
        let within_ceiling =
            max_items == 0 || !self.is_bounded() || max_items <= self.max_items;

        self.shape == *shape
            && self.item_size >= item_size
            && self.min_items >= min_items
            && within_ceiling
    }

    /// Whether an active pool may switch from `self` to `new` while items configured by `self`
    /// are still in circulation.
    ///
    /// Items must keep their exact shape and size and the ceiling may not move. The minimum
    /// may only stay equal or shrink, since the items already preallocated satisfy it.
    pub(crate) fn accepts_while_active(&self, new: &Self) -> bool {
        self == new
            || (self.shape == new.shape
                && self.item_size == new.item_size
                && self.max_items == new.max_items
                && new.min_items <= self.min_items)
    }
}

/// Checks whether `config` satisfies the requirements of a consumer.
///
/// This is the free-standing form of [`PoolConfig::validate_params()`].
#[must_use]
pub fn validate(
    config: &PoolConfig,
    shape: &Shape,
    item_size: usize,
    min_items: u32,
    max_items: u32,
) -> bool {
    config.validate_params(shape, item_size, min_items, max_items)
}

/// Builder for creating an instance of [`PoolConfig`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use media_pool::{PoolConfig, WaitPolicy};
///
/// // Unbounded pool of 4 KiB items.
/// let config = PoolConfig::builder().item_size(4096).build().unwrap();
/// assert!(!config.is_bounded());
///
/// // Bounded pool that waits at most 5 ms for an item to be released.
/// let config = PoolConfig::builder()
///     .item_size(4096)
///     .max_items(4)
///     .wait_policy(WaitPolicy::BlockFor(Duration::from_millis(5)))
///     .build()
///     .unwrap();
/// assert!(config.is_bounded());
/// ```
#[derive(Debug)]
#[must_use]
pub struct PoolConfigBuilder {
    shape: Shape,
    item_size: usize,
    min_items: u32,
    max_items: u32,
    wait_policy: WaitPolicy,
    options: Vec<Cow<'static, str>>,
}

impl PoolConfigBuilder {
    pub(crate) fn new() -> Self {
        Self {
            shape: Shape::default(),
            item_size: 0,
            min_items: 0,
            max_items: 0,
            wait_policy: WaitPolicy::default(),
            options: Vec::new(),
        }
    }

    /// Sets the shape descriptor of the items.
    pub fn shape(mut self, shape: Shape) -> Self {
        self.shape = shape;
        self
    }

    /// Sets the size in bytes of each item.
    pub fn item_size(mut self, item_size: usize) -> Self {
        self.item_size = item_size;
        self
    }

    /// Sets the number of items to preallocate when the pool is activated.
    pub fn min_items(mut self, min_items: u32) -> Self {
        self.min_items = min_items;
        self
    }

    /// Sets the maximum number of items in existence. Zero (the default) means unbounded.
    pub fn max_items(mut self, max_items: u32) -> Self {
        self.max_items = max_items;
        self
    }

    /// Sets what acquiring from an exhausted bounded pool does.
    pub fn wait_policy(mut self, wait_policy: WaitPolicy) -> Self {
        self.wait_policy = wait_policy;
        self
    }

    /// Adds a named option for the item factory. Adding the same option twice has no effect.
    pub fn option(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        let name = name.into();

        if !self.options.contains(&name) {
            self.options.push(name);
        }

        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBounds`] if the pool is bounded and `min_items` is greater
    /// than `max_items`.
    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        if self.max_items != 0 && self.min_items > self.max_items {
            return Err(ConfigError::InvalidBounds {
                min_items: self.min_items,
                max_items: self.max_items,
            });
        }

        Ok(PoolConfig {
            shape: self.shape,
            item_size: self.item_size,
            min_items: self.min_items,
            max_items: self.max_items,
            wait_policy: self.wait_policy,
            options: self.options,
        })
    }
}
