#![forbid(unsafe_code)]
//! Sharded associative page cache keyed by block identifier.
//!
//! The index is a power-of-two set of shards, each a hash map plus an
//! LRU list under one lock. Values are shared-ownership
//! [`CacheBuffer`]s; the cache holds one strong reference, in-flight I/O
//! and callers hold others, and the memory lives as long as the longest
//! holder.
//!
//! `insert` never replaces a resident buffer: a racing loser receives
//! the winner and discards its own. Eviction only considers buffers the
//! cache alone references; when everything is pinned the cache goes
//! over budget, records a pressure event, and keeps serving rather than
//! blocking.

pub mod memvec;

pub use memvec::{MemPiece, MemVec};

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use strata_types::{BlkId, DISK_ALIGN_SIZE};
use tracing::{debug, trace, warn};

/// Survivor size up to which a straddling piece is copied on partial
/// free; anything larger is discarded from cache instead.
pub const CACHE_DISCARD_THRESHOLD: usize = 16 * 1024;

// ── Cache buffer ────────────────────────────────────────────────────────────

/// A cached, possibly sparse, logical buffer for one block run.
///
/// The rw lock guards the memvec for readers and the metadata updater;
/// it is never held across device I/O. The fill lock serializes miss
/// population and *is* held across the reads that populate holes, which
/// is what collapses concurrent cold reads into one device pass.
pub struct CacheBuffer {
    key: BlkId,
    mem: RwLock<MemVec>,
    fill: Mutex<()>,
    freq: AtomicU32,
}

impl CacheBuffer {
    /// Sparse buffer: every byte is a hole until filled.
    #[must_use]
    pub fn new_sparse(key: BlkId) -> Self {
        Self {
            key,
            mem: RwLock::new(MemVec::new()),
            fill: Mutex::new(()),
            freq: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_memvec(key: BlkId, mv: MemVec) -> Self {
        Self {
            key,
            mem: RwLock::new(mv),
            fill: Mutex::new(()),
            freq: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn key(&self) -> BlkId {
        self.key
    }

    #[must_use]
    pub fn mem(&self) -> &RwLock<MemVec> {
        &self.mem
    }

    /// Lock serializing hole population. Leaf-only: no other lock is
    /// acquired while holding it except the memvec rw lock briefly.
    #[must_use]
    pub fn fill_lock(&self) -> &Mutex<()> {
        &self.fill
    }

    #[must_use]
    pub fn resident_bytes(&self) -> usize {
        self.mem.read().resident_bytes()
    }

    pub fn upvote(&self) {
        self.freq.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn frequency(&self) -> u32 {
        self.freq.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CacheBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBuffer")
            .field("key", &self.key)
            .field("resident_bytes", &self.resident_bytes())
            .field("freq", &self.frequency())
            .finish()
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Snapshot of cache counters. All monotonic except the gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    /// Times an insert proceeded over budget with no evictable entry.
    pub pressure_events: u64,
    /// Resident payload bytes (gauge).
    pub resident_bytes: usize,
    /// Configured memory budget in bytes.
    pub budget_bytes: usize,
    /// Resident entries across all shards (gauge).
    pub entries: usize,
}

impl CacheMetrics {
    /// Hit ratio in `[0.0, 1.0]`; 0.0 before any access.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ── Cache ───────────────────────────────────────────────────────────────────

/// Cache sizing knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Memory budget for resident payload bytes.
    pub budget_bytes: usize,
    /// Shard count; rounded up to a power of two.
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 64 * 1024 * 1024,
            shards: 16,
        }
    }
}

struct Shard {
    map: HashMap<BlkId, Arc<CacheBuffer>>,
    lru: VecDeque<BlkId>,
}

impl Shard {
    fn touch(&mut self, key: BlkId) {
        if let Some(pos) = self.lru.iter().position(|k| *k == key) {
            let _ = self.lru.remove(pos);
            self.lru.push_back(key);
        }
    }
}

/// Sharded associative cache of block buffers.
pub struct Cache {
    shards: Vec<Mutex<Shard>>,
    mask: usize,
    budget: usize,
    resident: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    pressure_events: AtomicU64,
}

impl Cache {
    #[must_use]
    pub fn new(cfg: &CacheConfig) -> Self {
        let nshards = cfg.shards.max(1).next_power_of_two();
        let shards = (0..nshards)
            .map(|_| {
                Mutex::new(Shard {
                    map: HashMap::new(),
                    lru: VecDeque::new(),
                })
            })
            .collect();
        debug!(
            target: "strata::cache",
            event = "cache_created",
            shards = nshards,
            budget_bytes = cfg.budget_bytes
        );
        Self {
            shards,
            mask: nshards - 1,
            budget: cfg.budget_bytes,
            resident: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            pressure_events: AtomicU64::new(0),
        }
    }

    fn shard_of(&self, key: BlkId) -> &Mutex<Shard> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.encode().hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & self.mask]
    }

    /// Install `buf` unless `key` is already resident.
    ///
    /// Returns `(true, buf)` on install. When an entry already exists it
    /// is upvoted and returned as `(false, existing)`; the caller's
    /// buffer is never installed over a resident one.
    pub fn insert(&self, buf: Arc<CacheBuffer>) -> (bool, Arc<CacheBuffer>) {
        let key = buf.key();
        // Size the payload before taking the shard lock; the buffer rw
        // lock ranks above it.
        let bytes = buf.resident_bytes();

        let winner = {
            let mut shard = self.shard_of(key).lock();
            if let Some(existing) = shard.map.get(&key) {
                let existing = Arc::clone(existing);
                existing.upvote();
                shard.touch(key);
                drop(shard);
                trace!(target: "strata::cache", event = "insert_lost_race", key = %key);
                return (false, existing);
            }
            shard.map.insert(key, Arc::clone(&buf));
            shard.lru.push_back(key);
            buf
        };

        self.resident.fetch_add(bytes, Ordering::Relaxed);
        self.inserts.fetch_add(1, Ordering::Relaxed);
        trace!(target: "strata::cache", event = "insert", key = %key, bytes);
        self.evict_to_budget();
        (true, winner)
    }

    /// Build a buffer whose memvec covers `blob` at `value_offset`, then
    /// insert. If the key is already resident, `blob` is written into
    /// the existing buffer instead (overwrite semantics) and that buffer
    /// is returned.
    pub fn insert_blob(&self, key: BlkId, blob: &[u8], value_offset: u32) -> Arc<CacheBuffer> {
        let mv = MemVec::with_piece(MemPiece::from_slice(blob, value_offset, DISK_ALIGN_SIZE));
        let candidate = Arc::new(CacheBuffer::with_memvec(key, mv));
        let (inserted, current) = self.insert(candidate);
        if !inserted {
            let before = current.resident_bytes();
            current
                .mem()
                .write()
                .write_bytes(value_offset, blob, DISK_ALIGN_SIZE);
            let after = current.resident_bytes();
            self.note_resident_delta(after as isize - before as isize);
        }
        current
    }

    /// Look up `key`; a hit is upvoted.
    pub fn get(&self, key: BlkId) -> Option<Arc<CacheBuffer>> {
        let mut shard = self.shard_of(key).lock();
        match shard.map.get(&key) {
            Some(buf) => {
                let buf = Arc::clone(buf);
                buf.upvote();
                shard.touch(key);
                drop(shard);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(buf)
            }
            None => {
                drop(shard);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Remove `key` from the index.
    ///
    /// Outstanding references keep the returned buffer alive; its memory
    /// is released when the last holder drops it.
    pub fn erase(&self, key: BlkId) -> Option<Arc<CacheBuffer>> {
        let removed = {
            let mut shard = self.shard_of(key).lock();
            let removed = shard.map.remove(&key);
            if removed.is_some() {
                if let Some(pos) = shard.lru.iter().position(|k| *k == key) {
                    let _ = shard.lru.remove(pos);
                }
            }
            removed
        };
        if let Some(buf) = &removed {
            let bytes = buf.resident_bytes();
            self.resident.fetch_sub(bytes, Ordering::Relaxed);
            trace!(target: "strata::cache", event = "erase", key = %key, bytes);
        }
        removed
    }

    /// Account payload growth or shrink of a resident buffer.
    ///
    /// The read path calls this after attaching pieces it populated.
    pub fn note_resident_delta(&self, delta: isize) {
        if delta >= 0 {
            #[expect(clippy::cast_sign_loss)]
            self.resident.fetch_add(delta as usize, Ordering::Relaxed);
            self.evict_to_budget();
        } else {
            self.resident
                .fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
        }
    }

    /// Evict LRU entries until the budget is met.
    ///
    /// Only buffers the cache alone references are evictable; pinned
    /// buffers are requeued. When a full pass over a shard finds nothing
    /// evictable, a pressure event is recorded and the cache stays over
    /// budget rather than blocking.
    fn evict_to_budget(&self) {
        let mut shard_idx = 0_usize;
        while self.resident.load(Ordering::Relaxed) > self.budget {
            if shard_idx > self.mask {
                // Every shard scanned without finding a victim.
                self.pressure_events.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "strata::cache",
                    event = "cache_pressure",
                    resident = self.resident.load(Ordering::Relaxed),
                    budget = self.budget,
                    "no evictable entry; proceeding over budget"
                );
                return;
            }

            let victim = {
                let mut shard = self.shards[shard_idx].lock();
                let mut victim = None;
                for _ in 0..shard.lru.len() {
                    let Some(key) = shard.lru.pop_front() else {
                        break;
                    };
                    let evictable = shard
                        .map
                        .get(&key)
                        .is_some_and(|buf| Arc::strong_count(buf) == 1);
                    if evictable {
                        victim = shard.map.remove(&key);
                        break;
                    }
                    // Pinned by a caller or in-flight I/O: requeue.
                    shard.lru.push_back(key);
                }
                victim
            };

            match victim {
                Some(buf) => {
                    let bytes = buf.resident_bytes();
                    self.resident.fetch_sub(bytes, Ordering::Relaxed);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        target: "strata::cache",
                        event = "evict",
                        key = %buf.key(),
                        bytes
                    );
                }
                None => shard_idx += 1,
            }
        }
    }

    /// Counter snapshot. Shard locks are taken in index order.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let mut entries = 0_usize;
        for shard in &self.shards {
            entries += shard.lock().map.len();
        }
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            pressure_events: self.pressure_events.load(Ordering::Relaxed),
            resident_bytes: self.resident.load(Ordering::Relaxed),
            budget_bytes: self.budget,
            entries,
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("shards", &self.shards.len())
            .field("budget", &self.budget)
            .field("resident", &self.resident.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ── Partial-free residuals ──────────────────────────────────────────────────

/// Residual buffers left when `[from_blk, to_blk)` of `buf`'s run is
/// freed.
///
/// Applies the straddle policy from [`MemVec::split_for_free`]
/// symmetrically on both sides and keys each surviving side under the
/// identifier derived from the original run. A side with zero blocks
/// yields `None`.
#[must_use]
pub fn carve_residuals(
    buf: &CacheBuffer,
    from_blk: u8,
    to_blk: u8,
    blk_size: u32,
) -> [Option<Arc<CacheBuffer>>; 2] {
    let orig = buf.key();
    debug_assert!(from_blk < to_blk && to_blk <= orig.nblks());

    let from_off = u32::from(from_blk) * blk_size;
    let to_off = u32::from(to_blk) * blk_size;
    let (left_mv, right_mv) = buf.mem().read().split_for_free(
        from_off,
        to_off,
        CACHE_DISCARD_THRESHOLD,
        DISK_ALIGN_SIZE,
    );

    let left = (from_blk > 0).then(|| {
        let key = orig.sub_id(0, from_blk);
        Arc::new(CacheBuffer::with_memvec(key, left_mv))
    });
    let right_nblks = orig.nblks() - to_blk;
    let right = (right_nblks > 0).then(|| {
        let key = orig.sub_id(to_blk, right_nblks);
        Arc::new(CacheBuffer::with_memvec(key, right_mv))
    });
    [left, right]
}

// ── Tests ───────────────────────────────────────────────────────────────────
