//! Cache controller: lookup, reservation, eviction, and the per-entry
//! single-flight state machine.
//!
//! # Locking
//!
//! Two levels, always acquired in the same order:
//!
//! 1. the **cache mutex**, protecting index membership and recency order
//!    (held briefly, never across a computation);
//! 2. one **entry mutex** per resident key, protecting the entry payload and
//!    status, held for the whole miss handler invocation.
//!
//! The cache mutex may be taken and then an entry mutex on top of it, never
//! the reverse: the miss path drops the entry guard before re-locking the
//! cache to promote the entry in the recency list.
//!
//! # Single flight
//!
//! The first thread to find an entry AVAILABLE flips it to CALCULATING and
//! runs the miss handler under the entry mutex. Every other thread interested
//! in that key blocks on the entry condvar and is woken by the broadcast that
//! accompanies the transition to READY or FAILED, observing the same shared
//! value. Eviction never selects a CALCULATING entry as its victim.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{CodecError, CodecVtable, CODEC_FAILURE_CODE};
use crate::config::CacheConfig;
use crate::entry::{BytesLease, CacheEntry, EntryCore, Status, ValueLease};
use crate::error::CacheError;
use crate::list::{LruList, Node};
use crate::metrics::CacheCounters;

/// Outcome of a miss handler invocation: `Ok((value, ad_hoc_code))` caches
/// the value for the positive TTL, `Err(ad_hoc_code)` negative-caches the
/// failure for the negative TTL.
pub type MissResult<V> = Result<(V, i8), i8>;

type Handler<K, V, C> = Box<dyn Fn(&K, Option<&C>) -> MissResult<V> + Send + Sync>;

/// Which representation a read wants from a READY entry.
#[derive(Clone, Copy)]
enum ReadMode {
    Value,
    Bytes,
}

enum Payload<V> {
    Value(Arc<V>),
    Bytes(Arc<[u8]>, u64),
}

/// Index slot: the owning reference to an entry plus its recency node.
struct EntrySlot<K, V> {
    entry: Arc<CacheEntry<K, V>>,
    node: NonNull<Node<Arc<CacheEntry<K, V>>>>,
}

/// Index membership and recency order, guarded by the cache mutex.
struct Shared<K, V, S> {
    map: HashMap<K, EntrySlot<K, V>, S>,
    lru: LruList<Arc<CacheEntry<K, V>>>,
}

// SAFETY: the NonNull node pointers stored in the slots reference nodes owned
// by `lru` and are only dereferenced while the cache mutex is held. Everything
// else in the structure is ordinarily Send when K and V are.
unsafe impl<K: Send + Sync, V: Send + Sync, S: Send> Send for Shared<K, V, S> {}

/// Thread-safe bounded cache mapping keys to computed values, with LRU
/// eviction, positive/negative TTL, and single-flight miss coalescing.
///
/// Reads return leases (shared handles); eviction drops the cache's
/// reference to an entry but never invalidates a lease a caller still holds.
///
/// # Type parameters
///
/// - `K`: key type, `Hash + Eq + Clone`
/// - `V`: value type
/// - `C`: cookie type forwarded to the miss handler (`()` by default)
/// - `S`: hash builder for the index
///
/// # Example
///
/// ```
/// use compute_cache::{CacheConfig, ComputeCache};
/// use core::num::NonZeroUsize;
/// use core::time::Duration;
///
/// let config = CacheConfig {
///     capacity: NonZeroUsize::new(128).unwrap(),
///     positive_ttl: Duration::from_secs(60),
///     negative_ttl: Duration::from_secs(5),
/// };
/// let cache: ComputeCache<u32, u32> =
///     ComputeCache::new(config, |key: &u32, _cookie: Option<&()>| Ok((key * 10, 0)));
///
/// let lease = cache.get_or_compute(7).unwrap();
/// assert_eq!(*lease.value(), 70);
/// assert_eq!(cache.len(), 1);
/// ```
pub struct ComputeCache<K, V, C = (), S = DefaultHashBuilder> {
    config: CacheConfig,
    shared: Mutex<Shared<K, V, S>>,
    miss_handler: Handler<K, V, C>,
    codec: Option<CodecVtable<V>>,
    counters: CacheCounters,
}

/// Index headroom over the entry capacity, keeping the load factor bounded.
fn index_capacity(capacity: usize) -> usize {
    capacity + (capacity * 3).div_ceil(10)
}

impl<K, V, C> ComputeCache<K, V, C, DefaultHashBuilder>
where
    K: Hash + Eq + Clone,
{
    /// Creates a cache with the default hasher.
    ///
    /// # Panics
    ///
    /// Panics if `config.capacity` is below 2.
    pub fn new<F>(config: CacheConfig, miss_handler: F) -> Self
    where
        F: Fn(&K, Option<&C>) -> MissResult<V> + Send + Sync + 'static,
    {
        Self::with_hasher(config, miss_handler, DefaultHashBuilder::default())
    }

    /// Creates a cache that stores values as LZ4-compressed serialized
    /// bytes. Reads through [`ComputeCache::get_or_compute_compressed`]
    /// return the raw bytes without materializing the value.
    ///
    /// # Panics
    ///
    /// Panics if `config.capacity` is below 2.
    pub fn with_compression<F>(config: CacheConfig, miss_handler: F) -> Self
    where
        V: Serialize + DeserializeOwned,
        F: Fn(&K, Option<&C>) -> MissResult<V> + Send + Sync + 'static,
    {
        Self::with_compression_and_hasher(config, miss_handler, DefaultHashBuilder::default())
    }
}

impl<K, V, C, S> ComputeCache<K, V, C, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    /// Creates a cache with a caller-supplied hash builder.
    pub fn with_hasher<F>(config: CacheConfig, miss_handler: F, hash_builder: S) -> Self
    where
        F: Fn(&K, Option<&C>) -> MissResult<V> + Send + Sync + 'static,
    {
        Self::build(config, Box::new(miss_handler), hash_builder, None)
    }

    /// Compression-enabled variant of [`ComputeCache::with_hasher`].
    pub fn with_compression_and_hasher<F>(
        config: CacheConfig,
        miss_handler: F,
        hash_builder: S,
    ) -> Self
    where
        V: Serialize + DeserializeOwned,
        F: Fn(&K, Option<&C>) -> MissResult<V> + Send + Sync + 'static,
    {
        Self::build(
            config,
            Box::new(miss_handler),
            hash_builder,
            Some(CodecVtable::new()),
        )
    }

    fn build(
        config: CacheConfig,
        miss_handler: Handler<K, V, C>,
        hash_builder: S,
        codec: Option<CodecVtable<V>>,
    ) -> Self {
        assert!(config.capacity.get() >= 2, "cache capacity must be at least 2");
        ComputeCache {
            config,
            shared: Mutex::new(Shared {
                map: HashMap::with_capacity_and_hasher(
                    index_capacity(config.capacity.get()),
                    hash_builder,
                ),
                lru: LruList::new(),
            }),
            miss_handler,
            codec,
            counters: CacheCounters::default(),
        }
    }

    /// Maximum number of resident entries.
    pub fn capacity(&self) -> usize {
        self.config.capacity.get()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current number of resident entries.
    pub fn len(&self) -> usize {
        self.shared.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().map.is_empty()
    }

    /// Snapshot of the operation counters.
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        self.counters.to_btreemap()
    }

    /// Returns the cached value for `key`, computing it via the miss handler
    /// if the key is absent or expired.
    ///
    /// Concurrent calls for the same absent key invoke the handler exactly
    /// once; the other callers block until the computation finishes and
    /// receive leases aliasing the same value. A negative-cached failure
    /// surfaces as [`CacheError::Failed`] carrying the handler's ad hoc code.
    pub fn get_or_compute(&self, key: K) -> Result<ValueLease<V>, CacheError> {
        self.lookup(key, None, ReadMode::Value).map(Self::into_value_lease)
    }

    /// Like [`ComputeCache::get_or_compute`], forwarding `cookie` to the
    /// miss handler if it runs.
    pub fn get_or_compute_with(&self, key: K, cookie: &C) -> Result<ValueLease<V>, CacheError> {
        self.lookup(key, Some(cookie), ReadMode::Value)
            .map(Self::into_value_lease)
    }

    /// Returns the raw compressed bytes for `key`, computing (and
    /// compressing) the value on a miss. The value itself is not
    /// materialized.
    ///
    /// Fails with [`CacheError::CompressionDisabled`] on a cache built
    /// without compression.
    pub fn get_or_compute_compressed(&self, key: K) -> Result<BytesLease, CacheError> {
        self.lookup(key, None, ReadMode::Bytes).map(Self::into_bytes_lease)
    }

    /// Like [`ComputeCache::get_or_compute_compressed`], forwarding `cookie`
    /// to the miss handler if it runs.
    pub fn get_or_compute_compressed_with(
        &self,
        key: K,
        cookie: &C,
    ) -> Result<BytesLease, CacheError> {
        self.lookup(key, Some(cookie), ReadMode::Bytes)
            .map(Self::into_bytes_lease)
    }

    /// Stores `value` under `key` without consulting the miss handler.
    ///
    /// Returns `Ok(None)` if the key already exists (existing entries are
    /// not overwritten and their TTL is not refreshed), otherwise a shared
    /// handle to the stored value. May fail with
    /// [`CacheError::CapacityExhausted`] when no entry can be evicted.
    pub fn insert(&self, key: K, value: V) -> Result<Option<Arc<V>>, CacheError> {
        let (entry, existed) = {
            let mut shared = self.shared.lock();
            self.reserve(&mut shared, key)?
        };
        if existed {
            return Ok(None);
        }

        let mut core = entry.core.lock();
        if entry.status() != Status::Available {
            // A concurrent get_or_compute claimed the fresh placeholder
            // before this insert reached the entry mutex; its result wins.
            return Ok(None);
        }

        let value = Arc::new(value);
        if let Some(codec) = &self.codec {
            match (codec.encode)(&value) {
                Ok((bytes, original_size)) => {
                    core.compressed = Some(Arc::from(bytes));
                    core.original_size = original_size;
                }
                Err(err) => {
                    let err = self.fail_codec(&entry, &mut core, err);
                    drop(core);
                    entry.ready.notify_all();
                    return Err(err);
                }
            }
        } else {
            core.value = Some(Arc::clone(&value));
        }
        core.expires_at = Instant::now() + self.config.positive_ttl;
        entry.set_status(&mut core, Status::Ready);
        drop(core);
        entry.ready.notify_all();

        self.counters.record_insertion();
        Ok(Some(value))
    }

    /// True iff a fresh READY entry for `key` is resident. Purges expired
    /// entries as a side effect. Entries that are mid-computation report
    /// `false` without waiting, as do fresh negative-cached failures.
    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let mut shared = self.shared.lock();
        self.probe(&mut shared, key, false)
    }

    /// Like [`ComputeCache::has`], additionally moving a fresh READY entry
    /// to the most recently used position. Does not refresh the TTL.
    pub fn touch<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let mut shared = self.shared.lock();
        self.probe(&mut shared, key, true)
    }

    /// Detaches the entry for `key`, if any. Removing an absent key is a
    /// no-op. Callers must not remove a key whose computation is in flight;
    /// the computation itself stays safe (its entry outlives the removal),
    /// but its result will not be cached and a concurrent request may start
    /// a second computation.
    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let mut shared = self.shared.lock();
        let Shared { map, lru } = &mut *shared;
        if let Some(slot) = map.remove(key) {
            debug_assert!(
                slot.entry.status() != Status::Calculating,
                "removing an entry whose computation is in flight"
            );
            // SAFETY: the slot's node was linked into `lru` when the slot
            // was created and nothing else has unlinked it.
            unsafe {
                drop(lru.unlink(slot.node.as_ptr()));
            }
        }
    }

    /// Removes every resident entry. Same caveats as [`ComputeCache::remove`]
    /// for entries that are mid-computation.
    pub fn clear(&self) {
        let mut shared = self.shared.lock();
        shared.map.clear();
        shared.lru.clear();
    }

    /// Key and (materialized) value of the least recently used entry,
    /// without touching the recency order.
    pub fn peek_lru(&self) -> Option<(K, Option<Arc<V>>)> {
        let shared = self.shared.lock();
        shared.lru.back().map(Self::peeked)
    }

    /// Key and (materialized) value of the most recently used entry,
    /// without touching the recency order.
    pub fn peek_mru(&self) -> Option<(K, Option<Arc<V>>)> {
        let shared = self.shared.lock();
        shared.lru.front().map(Self::peeked)
    }

    /// Diagnostic: lifecycle state of the resident entry for `key`.
    pub fn status_of<Q>(&self, key: &Q) -> Option<Status>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let shared = self.shared.lock();
        shared.map.get(key).map(|slot| slot.entry.status())
    }

    /// Snapshot of the resident entries, in unspecified order.
    ///
    /// The snapshot is taken under the cache mutex and does not disturb the
    /// recency order. Entries that are mid-computation, negative-cached, or
    /// stored compressed yield `None` values.
    pub fn iter(&self) -> Iter<K, V> {
        let shared = self.shared.lock();
        let entries: Vec<_> = shared.map.values().map(|slot| Self::peeked(&slot.entry)).collect();
        Iter {
            entries: entries.into_iter(),
        }
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn into_value_lease((payload, ad_hoc_code): (Payload<V>, i8)) -> ValueLease<V> {
        match payload {
            Payload::Value(value) => ValueLease::new(value, ad_hoc_code),
            Payload::Bytes(..) => unreachable!("value read resolved to raw bytes"),
        }
    }

    fn into_bytes_lease((payload, ad_hoc_code): (Payload<V>, i8)) -> BytesLease {
        match payload {
            Payload::Bytes(bytes, original_size) => {
                BytesLease::new(bytes, original_size, ad_hoc_code)
            }
            Payload::Value(_) => unreachable!("compressed read resolved to a value"),
        }
    }

    fn peeked(entry: &Arc<CacheEntry<K, V>>) -> (K, Option<Arc<V>>) {
        let value = if entry.status() == Status::Calculating {
            // The entry mutex is held for the whole computation; don't block.
            None
        } else {
            entry.core.lock().value.clone()
        };
        (entry.key().clone(), value)
    }

    fn lookup(
        &self,
        key: K,
        cookie: Option<&C>,
        mode: ReadMode,
    ) -> Result<(Payload<V>, i8), CacheError> {
        if matches!(mode, ReadMode::Bytes) && self.codec.is_none() {
            return Err(CacheError::CompressionDisabled);
        }
        self.counters.record_request();

        let (entry, existed) = {
            let mut shared = self.shared.lock();
            self.reserve(&mut shared, key)?
        };

        if existed {
            match self.resolve_hit(&entry, mode) {
                Ok(Some(hit)) => {
                    self.promote(&entry);
                    self.counters.record_hit();
                    return Ok(hit);
                }
                Ok(None) => {} // expired or placeholder: take the miss path
                Err(err) => {
                    if matches!(err, CacheError::Failed { .. }) {
                        self.promote(&entry);
                        self.counters.record_negative_hit();
                    }
                    return Err(err);
                }
            }
        }

        self.resolve_miss(&entry, cookie, mode)
    }

    /// Looks `key` up under the cache mutex. A resident key is promoted and
    /// returned with `existed = true`; otherwise a fresh AVAILABLE
    /// placeholder is installed, evicting the LRU victim if the cache is
    /// full.
    fn reserve(
        &self,
        shared: &mut Shared<K, V, S>,
        key: K,
    ) -> Result<(Arc<CacheEntry<K, V>>, bool), CacheError> {
        let Shared { map, lru } = &mut *shared;

        if let Some(slot) = map.get(&key) {
            let entry = Arc::clone(&slot.entry);
            // SAFETY: the slot's node is linked in `lru` while the slot exists.
            unsafe { lru.move_to_front(slot.node.as_ptr()) };
            return Ok((entry, true));
        }

        debug_assert_eq!(map.len(), lru.len());
        if map.len() >= self.config.capacity.get() {
            self.evict_one(map, lru)?;
        }

        let entry = Arc::new(CacheEntry::new(key.clone()));
        let node = lru.push_front(Arc::clone(&entry));
        map.insert(key, EntrySlot { entry: Arc::clone(&entry), node });
        Ok((entry, false))
    }

    /// Discards the least recently used evictable entry. CALCULATING entries
    /// are never victims (another thread is writing into them), and neither
    /// are AVAILABLE placeholders: evicting one would let a second
    /// reservation of the same key start a second computation.
    fn evict_one(
        &self,
        map: &mut HashMap<K, EntrySlot<K, V>, S>,
        lru: &mut LruList<Arc<CacheEntry<K, V>>>,
    ) -> Result<(), CacheError> {
        let Some(victim) =
            lru.pop_back_where(|entry| matches!(entry.status(), Status::Ready | Status::Failed))
        else {
            log::warn!("cache full and every resident entry is mid-computation");
            return Err(CacheError::CapacityExhausted);
        };
        map.remove(victim.key());
        self.counters.record_eviction();
        log::debug!("evicted least recently used entry to make room");
        Ok(())
    }

    /// Resolves a key found resident. `Ok(Some(_))` is a fresh hit (after
    /// waiting out an in-flight computation if necessary); `Ok(None)` sends
    /// the caller to the miss path: the entry expired, or it is a
    /// placeholder another thread reserved but has not started computing.
    fn resolve_hit(
        &self,
        entry: &Arc<CacheEntry<K, V>>,
        mode: ReadMode,
    ) -> Result<Option<(Payload<V>, i8)>, CacheError> {
        let mut core = entry.core.lock();
        let mut waited = false;
        loop {
            match entry.status() {
                Status::Available => return Ok(None),
                Status::Calculating => {
                    if !waited {
                        self.counters.record_coalesced_wait();
                        waited = true;
                    }
                    entry.ready.wait(&mut core);
                }
                Status::Ready => {
                    if core.is_expired(Instant::now()) {
                        entry.set_status(&mut core, Status::Available);
                        core.reset();
                        self.counters.record_expiration();
                        log::trace!("entry expired on access; recomputing");
                        return Ok(None);
                    }
                    return self.payload_from_ready(entry, &mut core, mode).map(Some);
                }
                Status::Failed => {
                    if core.is_expired(Instant::now()) {
                        entry.set_status(&mut core, Status::Available);
                        core.reset();
                        self.counters.record_expiration();
                        return Ok(None);
                    }
                    return Err(CacheError::Failed {
                        ad_hoc_code: core.ad_hoc_code,
                    });
                }
            }
        }
    }

    /// Runs the per-entry state machine on the miss path. Exactly one caller
    /// finds the entry AVAILABLE and computes; the rest wait for its
    /// broadcast and read the settled result.
    fn resolve_miss(
        &self,
        entry: &Arc<CacheEntry<K, V>>,
        cookie: Option<&C>,
        mode: ReadMode,
    ) -> Result<(Payload<V>, i8), CacheError> {
        let mut core = entry.core.lock();
        let mut waited = false;
        loop {
            match entry.status() {
                Status::Available => {
                    entry.set_status(&mut core, Status::Calculating);
                    let outcome = (self.miss_handler)(entry.key(), cookie);
                    let result = self.complete_compute(entry, &mut core, outcome, mode);
                    drop(core);
                    // Lock order is cache mutex before entry mutex; the entry
                    // guard must be gone before the promotion re-locks the
                    // cache.
                    self.promote(entry);
                    entry.ready.notify_all();
                    return result;
                }
                Status::Calculating => {
                    if !waited {
                        self.counters.record_coalesced_wait();
                        waited = true;
                    }
                    entry.ready.wait(&mut core);
                }
                Status::Ready => {
                    // A sibling finished the computation while this caller
                    // was between the reservation and the entry mutex.
                    return self.payload_from_ready(entry, &mut core, mode);
                }
                Status::Failed => {
                    return Err(CacheError::Failed {
                        ad_hoc_code: core.ad_hoc_code,
                    });
                }
            }
        }
    }

    /// Applies a finished miss handler outcome to the entry and builds the
    /// caller's payload. Runs with the entry mutex held.
    fn complete_compute(
        &self,
        entry: &Arc<CacheEntry<K, V>>,
        core: &mut EntryCore<V>,
        outcome: MissResult<V>,
        mode: ReadMode,
    ) -> Result<(Payload<V>, i8), CacheError> {
        let now = Instant::now();
        match outcome {
            Ok((value, ad_hoc_code)) => {
                core.ad_hoc_code = ad_hoc_code;
                let value = Arc::new(value);
                if let Some(codec) = &self.codec {
                    match (codec.encode)(&value) {
                        Ok((bytes, original_size)) => {
                            let bytes: Arc<[u8]> = Arc::from(bytes);
                            core.compressed = Some(Arc::clone(&bytes));
                            core.original_size = original_size;
                            core.value = None;
                            core.expires_at = now + self.config.positive_ttl;
                            entry.set_status(core, Status::Ready);
                            self.counters.record_compute();
                            Ok(match mode {
                                ReadMode::Value => (Payload::Value(value), ad_hoc_code),
                                ReadMode::Bytes => {
                                    (Payload::Bytes(bytes, original_size), ad_hoc_code)
                                }
                            })
                        }
                        Err(err) => Err(self.fail_codec(entry, core, err)),
                    }
                } else {
                    core.value = Some(Arc::clone(&value));
                    core.expires_at = now + self.config.positive_ttl;
                    entry.set_status(core, Status::Ready);
                    self.counters.record_compute();
                    Ok((Payload::Value(value), ad_hoc_code))
                }
            }
            Err(ad_hoc_code) => {
                core.reset();
                core.ad_hoc_code = ad_hoc_code;
                core.expires_at = now + self.config.negative_ttl;
                entry.set_status(core, Status::Failed);
                self.counters.record_compute_failure();
                log::debug!("miss handler failed; negative-caching (ad hoc code {ad_hoc_code})");
                Err(CacheError::Failed { ad_hoc_code })
            }
        }
    }

    /// Builds the requested payload from a fresh READY entry, converting the
    /// stored representation in place when the read form differs: a value
    /// read of a compressed entry decompresses and re-materializes it, a
    /// bytes read of a materialized entry re-compresses it.
    fn payload_from_ready(
        &self,
        entry: &Arc<CacheEntry<K, V>>,
        core: &mut EntryCore<V>,
        mode: ReadMode,
    ) -> Result<(Payload<V>, i8), CacheError> {
        match mode {
            ReadMode::Value => {
                if core.value.is_none() {
                    let Some(codec) = &self.codec else {
                        unreachable!("READY entry holds neither a value nor compressed bytes")
                    };
                    let Some(bytes) = core.compressed.clone() else {
                        unreachable!("READY entry holds neither a value nor compressed bytes")
                    };
                    match (codec.decode)(&bytes, core.original_size) {
                        Ok(value) => {
                            core.value = Some(Arc::new(value));
                            core.compressed = None;
                            core.original_size = 0;
                        }
                        Err(err) => return Err(self.fail_codec(entry, core, err)),
                    }
                }
                match &core.value {
                    Some(value) => Ok((Payload::Value(Arc::clone(value)), core.ad_hoc_code)),
                    None => unreachable!("materialization left no value behind"),
                }
            }
            ReadMode::Bytes => {
                if core.compressed.is_none() {
                    let Some(codec) = &self.codec else {
                        // lookup() rejects bytes reads on codec-less caches.
                        unreachable!("compressed read on a cache without a codec")
                    };
                    let Some(value) = core.value.clone() else {
                        unreachable!("READY entry holds neither a value nor compressed bytes")
                    };
                    match (codec.encode)(&value) {
                        Ok((bytes, original_size)) => {
                            core.compressed = Some(Arc::from(bytes));
                            core.original_size = original_size;
                            core.value = None;
                        }
                        Err(err) => return Err(self.fail_codec(entry, core, err)),
                    }
                }
                match &core.compressed {
                    Some(bytes) => Ok((
                        Payload::Bytes(Arc::clone(bytes), core.original_size),
                        core.ad_hoc_code,
                    )),
                    None => unreachable!("compression left no bytes behind"),
                }
            }
        }
    }

    /// Poisons the entry after a codec failure: negative-cached FAILED with
    /// the reserved ad hoc code. Runs with the entry mutex held.
    fn fail_codec(
        &self,
        entry: &Arc<CacheEntry<K, V>>,
        core: &mut EntryCore<V>,
        err: CodecError,
    ) -> CacheError {
        log::warn!("codec failure; negative-caching entry: {err}");
        core.reset();
        core.ad_hoc_code = CODEC_FAILURE_CODE;
        core.expires_at = Instant::now() + self.config.negative_ttl;
        entry.set_status(core, Status::Failed);
        self.counters.record_compute_failure();
        CacheError::Codec(err)
    }

    /// Moves the entry to the recency front if it is still the resident
    /// entry for its key. A concurrent eviction may already have replaced
    /// it; the pointer identity check keeps the promotion from touching a
    /// successor entry.
    fn promote(&self, entry: &Arc<CacheEntry<K, V>>) {
        let mut shared = self.shared.lock();
        let Shared { map, lru } = &mut *shared;
        if let Some(slot) = map.get(entry.key()) {
            if Arc::ptr_eq(&slot.entry, entry) {
                // SAFETY: the resident slot's node is linked in `lru`.
                unsafe { lru.move_to_front(slot.node.as_ptr()) };
            }
        }
    }

    /// Shared body of `has` and `touch`: freshness check, expiry purge, and
    /// (for `touch`) recency promotion.
    fn probe<Q>(&self, shared: &mut Shared<K, V, S>, key: &Q, promote: bool) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let Shared { map, lru } = &mut *shared;
        let Some(slot) = map.get(key) else {
            return false;
        };
        let entry = Arc::clone(&slot.entry);
        let node = slot.node;

        // Mid-reservation and mid-computation entries are not usable hits,
        // and a CALCULATING entry holds its mutex for the whole miss
        // handler; don't block behind it.
        if matches!(entry.status(), Status::Available | Status::Calculating) {
            return false;
        }

        let core = entry.core.lock();
        // Re-read under the mutex; the status may have moved since the
        // lock-free check.
        let status = entry.status();
        if matches!(status, Status::Available | Status::Calculating) {
            return false;
        }
        if core.is_expired(Instant::now()) {
            drop(core);
            if let Some(slot) = map.remove(key) {
                // SAFETY: the removed slot's node was linked in `lru`.
                unsafe {
                    drop(lru.unlink(slot.node.as_ptr()));
                }
            }
            self.counters.record_expiration();
            log::trace!("purged expired entry");
            return false;
        }
        drop(core);

        if status == Status::Ready {
            if promote {
                // SAFETY: node belongs to the resident slot, still linked.
                unsafe { lru.move_to_front(node.as_ptr()) };
            }
            true
        } else {
            // Fresh FAILED: negative-cached, present but not usable.
            false
        }
    }
}

impl<K, V, C, S> fmt::Debug for ComputeCache<K, V, C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeCache")
            .field("capacity", &self.config.capacity)
            .field("len", &self.shared.lock().map.len())
            .field("compression", &self.codec.is_some())
            .finish()
    }
}

/// Snapshot iterator over `(key, value)` pairs, created by
/// [`ComputeCache::iter`].
pub struct Iter<K, V> {
    entries: std::vec::IntoIter<(K, Option<Arc<V>>)>,
}

impl<K, V> Iterator for Iter<K, V> {
    type Item = (K, Option<Arc<V>>);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn config(capacity: usize) -> CacheConfig {
        CacheConfig {
            capacity: NonZeroUsize::new(capacity).unwrap(),
            positive_ttl: Duration::from_secs(60),
            negative_ttl: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_get_or_compute_invokes_handler_once_per_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = Arc::clone(&calls);
        let cache: ComputeCache<i32, i32> =
            ComputeCache::new(config(5), move |key: &i32, _: Option<&()>| {
                calls_in_handler.fetch_add(1, Ordering::SeqCst);
                Ok((key * 10, 1))
            });

        let first = cache.get_or_compute(3).unwrap();
        assert_eq!(*first.value(), 30);
        assert_eq!(first.ad_hoc_code(), 1);

        let second = cache.get_or_compute(3).unwrap();
        assert!(Arc::ptr_eq(first.shared(), second.shared()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_insert_does_not_overwrite() {
        let cache: ComputeCache<i32, i32> =
            ComputeCache::new(config(5), |_: &i32, _: Option<&()>| Err(-1));

        let stored = cache.insert(1, 10).unwrap();
        assert_eq!(stored.as_deref(), Some(&10));
        assert_eq!(cache.insert(1, 99).unwrap(), None);
        assert_eq!(*cache.get_or_compute(1).unwrap().value(), 10);
    }

    #[test]
    fn test_status_observed_while_computing() {
        let cache: Arc<ComputeCache<i32, i32>> = Arc::new(ComputeCache::new(
            config(5),
            |key: &i32, _: Option<&()>| {
                thread::sleep(Duration::from_millis(300));
                Ok((key * 10, 1))
            },
        ));

        assert_eq!(cache.status_of(&1), None);

        let background = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get_or_compute(1).unwrap())
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(cache.status_of(&1), Some(Status::Calculating));
        // Probes must not block behind the running handler.
        assert!(!cache.has(&1));

        let lease = background.join().unwrap();
        assert_eq!(*lease.value(), 10);
        assert_eq!(cache.status_of(&1), Some(Status::Ready));
        assert!(cache.has(&1));
    }

    #[test]
    fn test_remove_absent_key_is_noop() {
        let cache: ComputeCache<i32, i32> =
            ComputeCache::new(config(5), |_: &i32, _: Option<&()>| Err(0));
        cache.remove(&42);
        assert!(cache.is_empty());
    }

    #[test]
    #[should_panic(expected = "capacity must be at least 2")]
    fn test_capacity_one_is_rejected() {
        let _cache: ComputeCache<i32, i32> =
            ComputeCache::new(config(1), |_: &i32, _: Option<&()>| Err(0));
    }

    #[test]
    fn test_index_capacity_headroom() {
        assert!(index_capacity(5) >= 7); // ceil(1.3 * 5)
        assert!(index_capacity(10) >= 13);
        assert!(index_capacity(1000) >= 1300);
    }
}
