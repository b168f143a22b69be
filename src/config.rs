//! Cache configuration.
//!
//! A plain all-public-fields struct: construct it directly, no builder.

use core::fmt;
use core::num::NonZeroUsize;
use core::time::Duration;

/// Configuration for a [`ComputeCache`](crate::ComputeCache).
///
/// # Fields
///
/// - `capacity`: maximum number of resident entries (at least 2)
/// - `positive_ttl`: validity window of successfully computed entries
/// - `negative_ttl`: validity window of negative-cached failures
///
/// # Examples
///
/// ```
/// use compute_cache::CacheConfig;
/// use core::num::NonZeroUsize;
/// use core::time::Duration;
///
/// let config = CacheConfig {
///     capacity: NonZeroUsize::new(1024).unwrap(),
///     positive_ttl: Duration::from_secs(60),
///     negative_ttl: Duration::from_secs(5),
/// };
/// assert_eq!(config.capacity.get(), 1024);
/// ```
#[derive(Clone, Copy)]
pub struct CacheConfig {
    /// Maximum number of resident entries. Constructors reject capacities
    /// below 2.
    pub capacity: NonZeroUsize,
    /// How long a READY entry stays valid after its computation.
    pub positive_ttl: Duration,
    /// How long a FAILED entry suppresses recomputation.
    pub negative_ttl: Duration,
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("capacity", &self.capacity)
            .field("positive_ttl", &self.positive_ttl)
            .field("negative_ttl", &self.negative_ttl)
            .finish()
    }
}
