//! Cache entry record and its lifecycle state machine.
//!
//! Each resident key owns one [`CacheEntry`]: the immutable key, an atomic
//! [`Status`], and the mutable payload (`EntryCore`) behind a per-entry mutex
//! with a condvar for single-flight waiters. Entries are shared through
//! `Arc`: the index and recency list hold one reference each, and every
//! lease handed to a caller holds another, so eviction can never invalidate
//! a value a caller is still reading.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Lifecycle state of a cache entry.
///
/// ```text
///            insert / fresh hit
/// AVAILABLE ────────────────────► READY
///     │                             │
///     │ miss start                  │ ttl expiry (observed on access)
///     ▼                             ▼
/// CALCULATING ──success──► READY
///     │
///     └──failure──► FAILED ──ttl expiry──► AVAILABLE
/// ```
///
/// Transitions happen only while the entry mutex is held; every transition
/// out of `Calculating` broadcasts the entry condvar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Reserved placeholder, or an expired entry awaiting recomputation.
    /// No valid value.
    Available = 0,
    /// Exactly one thread is running the miss handler; others wait on the
    /// entry condvar.
    Calculating = 1,
    /// Value (or compressed bytes) present and valid until the TTL expiry.
    Ready = 2,
    /// The miss handler failed; negative-cached until the TTL expiry.
    Failed = 3,
}

impl Status {
    fn from_u8(raw: u8) -> Status {
        match raw {
            0 => Status::Available,
            1 => Status::Calculating,
            2 => Status::Ready,
            3 => Status::Failed,
            _ => unreachable!("invalid status byte {raw}"),
        }
    }
}

/// Mutable half of an entry, guarded by the entry mutex.
///
/// For `Ready` entries exactly one of `value` and `compressed` is populated;
/// `original_size` is nonzero iff `compressed` is.
pub(crate) struct EntryCore<V> {
    pub(crate) value: Option<Arc<V>>,
    pub(crate) compressed: Option<Arc<[u8]>>,
    pub(crate) original_size: u64,
    pub(crate) ad_hoc_code: i8,
    pub(crate) expires_at: Instant,
}

impl<V> EntryCore<V> {
    fn new() -> Self {
        EntryCore {
            value: None,
            compressed: None,
            original_size: 0,
            ad_hoc_code: 0,
            expires_at: Instant::now(),
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// Reverts the payload to a blank slate so the miss path can reuse the
    /// entry after expiry or a codec failure.
    pub(crate) fn reset(&mut self) {
        self.value = None;
        self.compressed = None;
        self.original_size = 0;
        self.ad_hoc_code = 0;
    }
}

/// One resident key of the cache.
pub(crate) struct CacheEntry<K, V> {
    key: K,
    status: AtomicU8,
    pub(crate) core: Mutex<EntryCore<V>>,
    pub(crate) ready: Condvar,
}

impl<K, V> CacheEntry<K, V> {
    pub(crate) fn new(key: K) -> Self {
        CacheEntry {
            key,
            status: AtomicU8::new(Status::Available as u8),
            core: Mutex::new(EntryCore::new()),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    /// Current status. Readable without the entry mutex, so eviction scans
    /// and presence probes never block behind a running miss handler.
    pub(crate) fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Publishes a status transition. The `&mut EntryCore` witness forces
    /// the caller to hold the entry mutex.
    pub(crate) fn set_status(&self, _core: &mut EntryCore<V>, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }
}

impl<K: fmt::Debug, V> fmt::Debug for CacheEntry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("status", &self.status())
            .finish()
    }
}

/// Shared handle to a computed value, returned by value reads.
///
/// The lease pins the value: eviction or expiry only drops the cache's own
/// reference. Every caller coalesced onto the same computation receives a
/// lease aliasing the same allocation, observable with
/// [`Arc::ptr_eq`] on [`ValueLease::shared`].
pub struct ValueLease<V> {
    value: Arc<V>,
    ad_hoc_code: i8,
}

impl<V> ValueLease<V> {
    pub(crate) fn new(value: Arc<V>, ad_hoc_code: i8) -> Self {
        ValueLease { value, ad_hoc_code }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    /// The shared allocation backing this lease.
    pub fn shared(&self) -> &Arc<V> {
        &self.value
    }

    pub fn into_shared(self) -> Arc<V> {
        self.value
    }

    /// Code the miss handler attached to this entry (0 if never set).
    pub fn ad_hoc_code(&self) -> i8 {
        self.ad_hoc_code
    }
}

impl<V> Deref for ValueLease<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<V> Clone for ValueLease<V> {
    fn clone(&self) -> Self {
        ValueLease {
            value: Arc::clone(&self.value),
            ad_hoc_code: self.ad_hoc_code,
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for ValueLease<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueLease")
            .field("value", &self.value)
            .field("ad_hoc_code", &self.ad_hoc_code)
            .finish()
    }
}

/// Raw compressed bytes of a `Ready` entry, returned by compressed reads.
///
/// The byte stream is a bare LZ4 block over the serialized value; the
/// uncompressed length travels out-of-band in
/// [`BytesLease::original_size`] and must accompany the bytes if they are
/// persisted elsewhere.
#[derive(Clone)]
pub struct BytesLease {
    bytes: Arc<[u8]>,
    original_size: u64,
    ad_hoc_code: i8,
}

impl BytesLease {
    pub(crate) fn new(bytes: Arc<[u8]>, original_size: u64, ad_hoc_code: i8) -> Self {
        BytesLease {
            bytes,
            original_size,
            ad_hoc_code,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn shared(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    /// Serialized (uncompressed) length of the value.
    pub fn original_size(&self) -> u64 {
        self.original_size
    }

    pub fn ad_hoc_code(&self) -> i8 {
        self.ad_hoc_code
    }
}

impl fmt::Debug for BytesLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytesLease")
            .field("len", &self.bytes.len())
            .field("original_size", &self.original_size)
            .field("ad_hoc_code", &self.ad_hoc_code)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_entry_is_available() {
        let entry: CacheEntry<&str, i32> = CacheEntry::new("key");
        assert_eq!(*entry.key(), "key");
        assert_eq!(entry.status(), Status::Available);

        let core = entry.core.lock();
        assert!(core.value.is_none());
        assert!(core.compressed.is_none());
        assert_eq!(core.original_size, 0);
        assert_eq!(core.ad_hoc_code, 0);
    }

    #[test]
    fn test_status_transition_under_lock() {
        let entry: CacheEntry<u32, u32> = CacheEntry::new(1);
        let mut core = entry.core.lock();

        entry.set_status(&mut core, Status::Calculating);
        assert_eq!(entry.status(), Status::Calculating);

        entry.set_status(&mut core, Status::Ready);
        assert_eq!(entry.status(), Status::Ready);
    }

    #[test]
    fn test_expiry_is_strict() {
        let entry: CacheEntry<u32, u32> = CacheEntry::new(1);
        let mut core = entry.core.lock();
        let now = Instant::now();

        core.expires_at = now + Duration::from_secs(60);
        assert!(!core.is_expired(now));
        assert!(core.is_expired(now + Duration::from_secs(61)));
        // The expiry instant itself still counts as valid.
        assert!(!core.is_expired(core.expires_at));
    }

    #[test]
    fn test_reset_clears_payload() {
        let entry: CacheEntry<u32, u32> = CacheEntry::new(1);
        let mut core = entry.core.lock();
        core.value = Some(Arc::new(7));
        core.original_size = 42;
        core.ad_hoc_code = -3;

        core.reset();
        assert!(core.value.is_none());
        assert!(core.compressed.is_none());
        assert_eq!(core.original_size, 0);
        assert_eq!(core.ad_hoc_code, 0);
    }

    #[test]
    fn test_value_lease_aliases_allocation() {
        let value = Arc::new(String::from("payload"));
        let a = ValueLease::new(Arc::clone(&value), 5);
        let b = a.clone();

        assert_eq!(a.value(), "payload");
        assert_eq!(a.ad_hoc_code(), 5);
        assert!(Arc::ptr_eq(a.shared(), b.shared()));
        assert_eq!(a.len(), 7); // Deref passthrough
    }

    #[test]
    fn test_bytes_lease_accessors() {
        let bytes: Arc<[u8]> = Arc::from(vec![1u8, 2, 3]);
        let lease = BytesLease::new(bytes, 10, -1);
        assert_eq!(lease.bytes(), &[1, 2, 3]);
        assert_eq!(lease.original_size(), 10);
        assert_eq!(lease.ad_hoc_code(), -1);
    }
}
