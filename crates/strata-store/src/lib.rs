#![forbid(unsafe_code)]
//! The block store: allocation, cached reads, and write policies over a
//! virtual device.
//!
//! Every cache/device interaction in the data path goes through here.
//! The store is parameterized at construction by the vdev's allocator
//! variant and by one of three cache modes:
//!
//! - **PassThru** — the cache is never touched.
//! - **WriteThrough** — writes insert into the cache and complete after
//!   the device (all mirrors) acks.
//! - **WriteBack** — writes complete at cache insert; a background
//!   flush daemon pushes dirty buffers to the device.

use asupersync::Cx;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use strata_alloc::AllocHints;
use strata_cache::{carve_residuals, Cache, CacheBuffer, CacheMetrics, MemPiece, MemVec};
use strata_device::VirtualDev;
use strata_error::{Result, StrataError};
use strata_io::AlignedBuf;
use strata_types::{BlkId, BlockSize, DISK_ALIGN_SIZE, MAX_READ_BLKS};
use tracing::{debug, error, info, trace, warn};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| StrataError::ShutdownInProgress)
}

/// How writes interact with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    PassThru,
    WriteThrough,
    WriteBack,
}

/// A deferred free: a sub-range of a run whose release waits until the
/// write covering it has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlkEntry {
    pub bid: BlkId,
    pub blk_offset: u8,
    pub nblks: u8,
}

#[derive(Default)]
struct DirtyQueue {
    order: VecDeque<BlkId>,
    members: HashSet<BlkId>,
}

impl DirtyQueue {
    fn mark(&mut self, bid: BlkId) {
        if self.members.insert(bid) {
            self.order.push_back(bid);
        }
    }

    fn drain_batch(&mut self, max: usize) -> Vec<BlkId> {
        let n = self.order.len().min(max);
        let batch: Vec<BlkId> = self.order.drain(..n).collect();
        for bid in &batch {
            let _ = self.members.remove(bid);
        }
        batch
    }

    fn forget(&mut self, bid: BlkId) {
        if self.members.remove(&bid) {
            if let Some(pos) = self.order.iter().position(|k| *k == bid) {
                let _ = self.order.remove(pos);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Block store over one virtual device and one shared cache.
pub struct BlockStore {
    vdev: Arc<VirtualDev>,
    cache: Arc<Cache>,
    mode: CacheMode,
    dirty: Mutex<DirtyQueue>,
}

impl BlockStore {
    #[must_use]
    pub fn new(vdev: Arc<VirtualDev>, cache: Arc<Cache>, mode: CacheMode) -> Self {
        info!(target: "strata::store", event = "store_created", mode = ?mode);
        Self {
            vdev,
            cache,
            mode,
            dirty: Mutex::new(DirtyQueue::default()),
        }
    }

    #[must_use]
    pub fn blk_size(&self) -> BlockSize {
        self.vdev.blk_size()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.vdev.size()
    }

    #[must_use]
    pub fn vdev(&self) -> &Arc<VirtualDev> {
        &self.vdev
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    #[must_use]
    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Pure virtual-device allocation; the cache is not touched.
    pub fn alloc_blk(&self, nblks: u8, hints: &AllocHints) -> Result<BlkId> {
        self.vdev.alloc_blk(nblks, hints)
    }

    /// Allocate a run and install a zero-filled, page-aligned buffer for
    /// it in the cache.
    pub fn alloc_blk_cached(&self, nblks: u8, hints: &AllocHints) -> Result<Arc<CacheBuffer>> {
        let bid = self.vdev.alloc_blk(nblks, hints)?;
        let size = u32::from(nblks) * self.blk_size().get();
        let piece = MemPiece::new(
            Arc::new(AlignedBuf::new(size as usize, DISK_ALIGN_SIZE)),
            0,
        );
        let buf = Arc::new(CacheBuffer::with_memvec(bid, MemVec::with_piece(piece)));
        let (inserted, current) = self.cache.insert(buf);
        debug_assert!(inserted, "freshly allocated id already cached");
        Ok(current)
    }

    /// Allocate space for `blob` (rounded up to whole blocks) and write
    /// it.
    pub fn alloc_and_write(
        &self,
        cx: &Cx,
        blob: &[u8],
        hints: &AllocHints,
    ) -> Result<Arc<CacheBuffer>> {
        let nblks = self.blk_size().blks_for_bytes(blob.len() as u64);
        let nblks = u8::try_from(nblks).map_err(|_| StrataError::RunTooLong {
            requested: nblks,
            max: u32::from(u8::MAX),
        })?;
        let bid = self.vdev.alloc_blk(nblks, hints)?;
        self.write(cx, bid, blob)
    }

    /// Write `blob` at block run `bid`.
    ///
    /// The cache entry for `bid` is created or updated (upvoting an
    /// existing entry); in `WriteThrough` the call returns after every
    /// mirror acked, in `WriteBack` after the cache accepted the bytes.
    pub fn write(&self, cx: &Cx, bid: BlkId, blob: &[u8]) -> Result<Arc<CacheBuffer>> {
        cx_checkpoint(cx)?;
        if blob.len() as u64 > u64::from(bid.nblks()) * u64::from(self.blk_size().get()) {
            return Err(StrataError::UnalignedAccess {
                offset: blob.len() as u64,
                align: self.blk_size().get(),
            });
        }

        match self.mode {
            CacheMode::PassThru => {
                let mv = MemVec::with_piece(MemPiece::from_slice(blob, 0, DISK_ALIGN_SIZE));
                self.vdev.write(cx, bid, &mv)?;
                Ok(Arc::new(CacheBuffer::with_memvec(bid, mv)))
            }
            CacheMode::WriteThrough => {
                let buf = self.cache.insert_blob(bid, blob, 0);
                // Snapshot the memvec; the buffer lock is never held
                // across device I/O.
                let mv = buf.mem().read().clone();
                self.vdev.write(cx, bid, &mv)?;
                Ok(buf)
            }
            CacheMode::WriteBack => {
                let buf = self.cache.insert_blob(bid, blob, 0);
                self.dirty.lock().mark(bid);
                trace!(target: "strata::store", event = "write_back_mark", bid = %bid);
                Ok(buf)
            }
        }
    }

    /// Write a caller-supplied buffer at its key.
    pub fn write_buf(&self, cx: &Cx, buf: &Arc<CacheBuffer>) -> Result<()> {
        cx_checkpoint(cx)?;
        let bid = buf.key();
        match self.mode {
            CacheMode::PassThru => {
                let mv = buf.mem().read().clone();
                self.vdev.write(cx, bid, &mv)
            }
            CacheMode::WriteThrough => {
                let (_, current) = self.cache.insert(Arc::clone(buf));
                let mv = current.mem().read().clone();
                self.vdev.write(cx, bid, &mv)
            }
            CacheMode::WriteBack => {
                let _ = self.cache.insert(Arc::clone(buf));
                self.dirty.lock().mark(bid);
                Ok(())
            }
        }
    }

    /// Read `[offset, offset + size)` of `bid`'s run through the cache.
    ///
    /// `offset` and `size` must be block multiples, the window must stay
    /// inside the run and under [`MAX_READ_BLKS`] blocks. On a miss a
    /// sparse buffer is installed first (the insert picks the single
    /// authoritative entry under a racing read) and holes are then
    /// populated under the buffer's fill lock, one device read per
    /// missing piece.
    pub fn read(&self, cx: &Cx, bid: BlkId, offset: u32, size: u32) -> Result<Arc<CacheBuffer>> {
        cx_checkpoint(cx)?;
        let blk = self.blk_size();
        if !blk.is_aligned(u64::from(offset)) || !blk.is_aligned(u64::from(size)) || size == 0 {
            return Err(StrataError::UnalignedAccess {
                offset: u64::from(offset),
                align: blk.get(),
            });
        }
        let end = offset + size;
        if u64::from(end) > u64::from(MAX_READ_BLKS) * u64::from(blk.get())
            || end > u32::from(bid.nblks()) * blk.get()
        {
            return Err(StrataError::UnalignedAccess {
                offset: u64::from(end),
                align: blk.get(),
            });
        }

        if self.mode == CacheMode::PassThru {
            let buf = Arc::new(CacheBuffer::new_sparse(bid));
            self.fill_missing(cx, &buf, offset, end, false)?;
            return Ok(buf);
        }

        let buf = match self.cache.get(bid) {
            Some(buf) => buf,
            None => {
                // Install the sparse buffer before populating: a racing
                // reader adopts the winner and the loser's empty buffer
                // is dropped before any device I/O.
                let candidate = Arc::new(CacheBuffer::new_sparse(bid));
                self.cache.insert(candidate).1
            }
        };
        self.fill_missing(cx, &buf, offset, end, true)?;
        Ok(buf)
    }

    /// Populate every hole of `buf` in `[offset, end)` from the device.
    fn fill_missing(
        &self,
        cx: &Cx,
        buf: &Arc<CacheBuffer>,
        offset: u32,
        end: u32,
        account: bool,
    ) -> Result<()> {
        let blk = self.blk_size();
        let bid = buf.key();
        let _fill = buf.fill_lock().lock();
        let mut cursor = offset;
        loop {
            let missing = buf.mem().read().next_missing(cursor, end);
            let Some((gap_off, gap_len)) = missing else {
                break;
            };
            debug_assert!(blk.is_aligned(u64::from(gap_off)) && blk.is_aligned(u64::from(gap_len)));

            // The missing piece, named as its own sub-run on the device.
            let sub = bid.sub_id(
                u8::try_from(gap_off / blk.get()).expect("run bounded by u8 blocks"),
                u8::try_from(gap_len / blk.get()).expect("run bounded by u8 blocks"),
            );
            let data = self.vdev.read_piece(cx, sub, 0, gap_len as usize)?;
            buf.mem()
                .write()
                .insert(MemPiece::new(Arc::new(data), gap_off));
            if account {
                self.cache.note_resident_delta(gap_len as isize);
            }
            trace!(
                target: "strata::store",
                event = "read_fill",
                bid = %bid,
                piece_off = gap_off,
                piece_len = gap_len
            );
            cursor = gap_off + gap_len;
        }
        Ok(())
    }

    /// Free a run or a sub-range of it.
    ///
    /// A full free erases the cache entry and releases the blocks. A
    /// partial free erases the entry and, when less than 80 % of the run
    /// is going away, re-inserts the surviving left/right residuals
    /// under their derived identifiers and returns those ids.
    pub fn free_blk(
        &self,
        cx: &Cx,
        bid: BlkId,
        blk_offset: Option<u8>,
        nblks: Option<u8>,
    ) -> Result<Option<[Option<BlkId>; 2]>> {
        cx_checkpoint(cx)?;
        let off = blk_offset.unwrap_or(0);
        let n = nblks.unwrap_or_else(|| bid.nblks().saturating_sub(off));
        if n == 0 || u32::from(off) + u32::from(n) > u32::from(bid.nblks()) {
            return Err(StrataError::UnalignedAccess {
                offset: u64::from(off),
                align: self.blk_size().get(),
            });
        }

        // Full free: drop the entry and the blocks, nothing survives.
        if off == 0 && n == bid.nblks() {
            let _ = self.cache.erase(bid);
            self.dirty.lock().forget(bid);
            self.vdev.free_blk(bid);
            trace!(target: "strata::store", event = "free_full", bid = %bid);
            return Ok(None);
        }

        let erased = self.cache.erase(bid);
        self.dirty.lock().forget(bid);
        let mut residual_ids = None;

        if let Some(buf) = erased {
            // Freeing most of the run? Preserving leftovers costs more
            // than the cache warmth is worth.
            let keep_residuals = u32::from(n) * 10 < u32::from(bid.nblks()) * 8;
            if keep_residuals {
                let to_blk = off + n;
                let [left, right] = carve_residuals(&buf, off, to_blk, self.blk_size().get());
                let mut ids = [None, None];
                for (slot, residual) in [left, right].into_iter().enumerate() {
                    if let Some(residual) = residual {
                        ids[slot] = Some(residual.key());
                        let (inserted, _) = self.cache.insert(residual);
                        debug_assert!(inserted, "residual id already cached");
                    }
                }
                residual_ids = Some(ids);
            } else {
                debug!(
                    target: "strata::store",
                    event = "free_partial_discard",
                    bid = %bid,
                    freed = n
                );
            }
        }

        // The device free always covers exactly the requested sub-range.
        self.vdev.free_blk(bid.sub_id(off, n));
        Ok(residual_ids)
    }

    /// Write every dirty buffer in queue order to the device.
    pub fn flush(&self, cx: &Cx) -> Result<usize> {
        self.flush_batch(cx, usize::MAX)
    }

    /// Write up to `max` dirty buffers; returns how many were flushed.
    pub fn flush_batch(&self, cx: &Cx, max: usize) -> Result<usize> {
        let batch = self.dirty.lock().drain_batch(max);
        let mut flushed = 0_usize;
        for (pos, bid) in batch.iter().copied().enumerate() {
            if let Err(err) = cx_checkpoint(cx) {
                let mut dirty = self.dirty.lock();
                for requeue in &batch[pos..] {
                    dirty.mark(*requeue);
                }
                drop(dirty);
                return Err(err);
            }
            let Some(buf) = self.cache.get(bid) else {
                // Freed while dirty; nothing to persist.
                continue;
            };
            let mv = buf.mem().read().clone();
            match self.vdev.write(cx, bid, &mv) {
                Ok(()) => flushed += 1,
                Err(err) => {
                    // Re-queue this buffer and the unflushed remainder
                    // for the next cycle.
                    let mut dirty = self.dirty.lock();
                    for requeue in &batch[pos..] {
                        dirty.mark(*requeue);
                    }
                    drop(dirty);
                    return Err(err);
                }
            }
        }
        if flushed > 0 {
            trace!(target: "strata::store", event = "flush", flushed);
        }
        Ok(flushed)
    }

    /// Spawn the background flusher for a write-back store.
    pub fn start_flush_daemon(self: &Arc<Self>, config: FlushDaemonConfig) -> Result<FlushDaemon> {
        let stop = Arc::new(AtomicBool::new(false));
        let store = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);

        let join = thread::Builder::new()
            .name("strata-flush".to_owned())
            .spawn(move || {
                // Long-lived context for periodic background work.
                let cx = Cx::for_testing();
                loop {
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    thread::sleep(config.interval);
                    if let Err(err) = store.flush_batch(&cx, config.max_batch) {
                        error!(
                            target: "strata::store",
                            event = "flush_cycle_failed",
                            error = %err,
                            dirty = store.dirty_count()
                        );
                    }
                }
                // Final drain so shutdown leaves nothing dirty.
                if let Err(err) = store.flush(&cx) {
                    error!(
                        target: "strata::store",
                        event = "flush_shutdown_failed",
                        error = %err,
                        dirty = store.dirty_count()
                    );
                }
            })
            .map_err(StrataError::Io)?;

        Ok(FlushDaemon {
            stop,
            join: Some(join),
        })
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("mode", &self.mode)
            .field("dirty", &self.dirty.lock().len())
            .finish_non_exhaustive()
    }
}

// ── Flush daemon ────────────────────────────────────────────────────────────

/// Flush cadence for write-back stores.
#[derive(Debug, Clone)]
pub struct FlushDaemonConfig {
    pub interval: Duration,
    pub max_batch: usize,
}

impl Default for FlushDaemonConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_batch: 64,
        }
    }
}

/// Handle to the background flusher; drops stop and join it.
pub struct FlushDaemon {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl FlushDaemon {
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!(target: "strata::store", event = "flush_daemon_panicked");
            }
        }
    }
}

impl Drop for FlushDaemon {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl std::fmt::Debug for FlushDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushDaemon")
            .field("stopped", &self.stop.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
