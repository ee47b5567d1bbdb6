//! Virtual device: a logical block space striped over chunks, with
//! optional mirroring.
//!
//! Each stripe is a mirror set: N backing chunks on distinct devices
//! sharing one allocator (the copies are block-for-block identical).
//! Writes fan out to every mirror leg and only complete when all legs
//! ack; reads rotate across legs, demoting a failing leg for a cooldown
//! period before it is tried again.

use crate::{cx_checkpoint, engine_read, DeviceManager, PhysicalDev};
use asupersync::Cx;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_alloc::{AllocConfig, AllocHints, Allocator, BlockAllocator};
use strata_cache::MemVec;
use strata_error::{Result, StrataError};
use strata_io::{
    AlignedBuf, Continuation, IoCompletion, IoEndpoint, IoEngine, IoOp,
};
use strata_types::{BlkId, BlockSize, ChunkId, VdevId};
use tracing::{debug, trace, warn};

/// Per-leg write retry bound before the leg is marked degraded.
pub const MAX_WRITE_RETRIES: u32 = 3;

/// How long a failed mirror leg stays demoted for reads.
pub const MIRROR_COOLDOWN: Duration = Duration::from_secs(30);

/// Which allocator variant backs each mirror set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    Fixed,
    VarSize,
}

/// Virtual-device geometry.
#[derive(Debug, Clone)]
pub struct VdevConfig {
    pub vdev_id: VdevId,
    pub blk_size: BlockSize,
    /// Total copies of every block (1 = no mirroring).
    pub nmirrors: u32,
    /// Bytes per chunk.
    pub chunk_size: u64,
    pub allocator: AllocatorKind,
}

#[derive(Debug, Default)]
struct LegHealth {
    degraded: bool,
    demoted_until: Option<Instant>,
    failures: u32,
}

struct MirrorLeg {
    chunk_start: u64,
    chunk_id: ChunkId,
    dev: Arc<PhysicalDev>,
    health: Arc<Mutex<LegHealth>>,
}

impl MirrorLeg {
    fn is_demoted(&self) -> bool {
        self.health
            .lock()
            .demoted_until
            .is_some_and(|until| Instant::now() < until)
    }

    fn demote(&self, detail: &str) {
        let mut health = self.health.lock();
        health.degraded = true;
        health.failures += 1;
        health.demoted_until = Some(Instant::now() + MIRROR_COOLDOWN);
        warn!(
            target: "strata::vdev",
            event = "mirror_demoted",
            dev = self.dev.idx().0,
            chunk = self.chunk_id.0,
            failures = health.failures,
            detail
        );
    }

    fn restore(&self) {
        let mut health = self.health.lock();
        if health.degraded || health.demoted_until.is_some() {
            health.degraded = false;
            health.demoted_until = None;
            debug!(
                target: "strata::vdev",
                event = "mirror_restored",
                dev = self.dev.idx().0,
                chunk = self.chunk_id.0
            );
        }
    }
}

struct MirrorSet {
    allocator: Allocator,
    legs: Vec<MirrorLeg>,
}

/// A logical address space over mirror sets of chunks.
pub struct VirtualDev {
    cfg: VdevConfig,
    sets: Vec<MirrorSet>,
    by_chunk: HashMap<u16, usize>,
    alloc_rotor: AtomicUsize,
    read_rotor: AtomicUsize,
}

impl VirtualDev {
    /// Open the vdev: adopt its chunks from the device manager's table,
    /// or carve fresh ones when none exist yet.
    ///
    /// One mirror set is created per device; legs of a set land on
    /// distinct consecutive devices.
    pub fn open(cx: &Cx, mgr: &DeviceManager, cfg: VdevConfig) -> Result<Self> {
        cx_checkpoint(cx)?;
        let ndev = mgr.ndevices();
        let nmirrors = cfg.nmirrors.max(1) as usize;
        if nmirrors > ndev {
            return Err(StrataError::InvalidDevice(format!(
                "{nmirrors} mirrors need at least {nmirrors} devices, have {ndev}"
            )));
        }
        let total_blks = u32::try_from(cfg.chunk_size / u64::from(cfg.blk_size.get()))
            .map_err(|_| StrataError::InvalidDevice("chunk too large for block index".to_owned()))?;
        if total_blks == 0 {
            return Err(StrataError::InvalidDevice(
                "chunk smaller than one block".to_owned(),
            ));
        }

        let existing = mgr.chunks_for_vdev(cfg.vdev_id);
        let groups: Vec<Vec<crate::ChunkInfo>> = if existing.is_empty() {
            let mut groups = Vec::with_capacity(ndev);
            for primary in 0..ndev {
                let mut group = Vec::with_capacity(nmirrors);
                for mirror in 0..nmirrors {
                    let dev = strata_types::DevId(
                        u16::try_from((primary + mirror) % ndev).expect("device count fits u16"),
                    );
                    group.push(mgr.alloc_chunk(dev, cfg.chunk_size, cfg.vdev_id)?);
                }
                groups.push(group);
            }
            groups
        } else {
            if existing.len() % nmirrors != 0 {
                return Err(StrataError::CorruptMetadata {
                    dev: 0,
                    detail: format!(
                        "vdev {} has {} chunks, not a multiple of {} mirrors",
                        cfg.vdev_id.0,
                        existing.len(),
                        nmirrors
                    ),
                });
            }
            existing.chunks(nmirrors).map(<[_]>::to_vec).collect()
        };

        let mut sets = Vec::with_capacity(groups.len());
        let mut by_chunk = HashMap::new();
        for group in groups {
            let primary_chunk = group[0].chunk_id;
            let mut legs = Vec::with_capacity(group.len());
            for info in &group {
                if info.size != cfg.chunk_size {
                    return Err(StrataError::CorruptMetadata {
                        dev: info.device_idx.0,
                        detail: format!(
                            "chunk {} size {} differs from vdev chunk size {}",
                            info.chunk_id.0, info.size, cfg.chunk_size
                        ),
                    });
                }
                legs.push(MirrorLeg {
                    chunk_start: info.start_offset,
                    chunk_id: info.chunk_id,
                    dev: mgr.device(info.device_idx)?,
                    health: Arc::new(Mutex::new(LegHealth::default())),
                });
            }
            let alloc_cfg = AllocConfig::new(cfg.blk_size, total_blks, primary_chunk);
            let allocator = match cfg.allocator {
                AllocatorKind::Fixed => Allocator::fixed(alloc_cfg),
                AllocatorKind::VarSize => Allocator::var_size(alloc_cfg),
            };
            by_chunk.insert(primary_chunk.0, sets.len());
            sets.push(MirrorSet { allocator, legs });
        }

        debug!(
            target: "strata::vdev",
            event = "vdev_open",
            vdev = cfg.vdev_id.0,
            sets = sets.len(),
            mirrors = nmirrors
        );
        Ok(Self {
            cfg,
            sets,
            by_chunk,
            alloc_rotor: AtomicUsize::new(0),
            read_rotor: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn blk_size(&self) -> BlockSize {
        self.cfg.blk_size
    }

    /// Logical capacity in bytes (one copy).
    #[must_use]
    pub fn size(&self) -> u64 {
        self.sets.len() as u64 * self.cfg.chunk_size
    }

    /// Free blocks across all mirror sets.
    #[must_use]
    pub fn available_blks(&self) -> u64 {
        self.sets.iter().map(|s| s.allocator.available_blks()).sum()
    }

    fn set_for(&self, bid: BlkId) -> Result<&MirrorSet> {
        self.by_chunk
            .get(&bid.chunk().0)
            .map(|idx| &self.sets[*idx])
            .ok_or_else(|| {
                StrataError::InvalidDevice(format!("no chunk {} in this vdev", bid.chunk().0))
            })
    }

    /// Allocate a run, honoring device hints.
    ///
    /// Default placement round-robins over mirror sets. A `dev_hint`
    /// restricts the first pass to sets whose primary leg lives on that
    /// device; `allow_spillover` opens the rest up when those are full.
    pub fn alloc_blk(&self, nblks: u8, hints: &AllocHints) -> Result<BlkId> {
        let nsets = self.sets.len();
        let order: Vec<usize> = match hints.dev_hint {
            Some(dev) => {
                let preferred: Vec<usize> = (0..nsets)
                    .filter(|idx| self.sets[*idx].legs[0].dev.idx() == dev)
                    .collect();
                if preferred.is_empty() {
                    return Err(StrataError::InvalidDevice(format!(
                        "no chunks with primary on device {}",
                        dev.0
                    )));
                }
                if hints.allow_spillover {
                    let rest: Vec<usize> =
                        (0..nsets).filter(|idx| !preferred.contains(idx)).collect();
                    preferred.into_iter().chain(rest).collect()
                } else {
                    preferred
                }
            }
            None => {
                let start = self.alloc_rotor.fetch_add(1, Ordering::Relaxed) % nsets;
                (0..nsets).map(|i| (start + i) % nsets).collect()
            }
        };

        let mut last_err = StrataError::OutOfSpace;
        for idx in order {
            match self.sets[idx].allocator.alloc(nblks, hints) {
                Ok(bid) => return Ok(bid),
                Err(err @ StrataError::RunTooLong { .. }) => return Err(err),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Return a run to its owning chunk's allocator.
    pub fn free_blk(&self, bid: BlkId) {
        match self.set_for(bid) {
            Ok(set) => set.allocator.free(bid),
            Err(_) => warn!(
                target: "strata::vdev",
                event = "free_unknown_chunk",
                chunk = bid.chunk().0
            ),
        }
    }

    fn leg_offset(&self, leg: &MirrorLeg, bid: BlkId, off_in_run: u32) -> u64 {
        leg.chunk_start + self.cfg.blk_size.blk_to_byte(bid.id()) + u64::from(off_in_run)
    }

    /// Write every resident piece of `mv` to all mirror legs.
    ///
    /// Each leg is retried up to [`MAX_WRITE_RETRIES`]; a leg that stays
    /// broken is demoted and the write fails. Success means every mirror
    /// acked every piece.
    pub fn write(&self, cx: &Cx, bid: BlkId, mv: &MemVec) -> Result<()> {
        cx_checkpoint(cx)?;
        let set = self.set_for(bid)?;
        for leg in &set.legs {
            let ops = || -> Vec<IoOp> {
                mv.pieces()
                    .iter()
                    .map(|piece| IoOp::Write {
                        offset: self.leg_offset(leg, bid, piece.offset()),
                        data: Arc::clone(piece.data()),
                    })
                    .collect()
            };
            let mut attempt = 0_u32;
            loop {
                let comps = leg.dev.engine().submit_batch(ops());
                let failed = comps.into_iter().find_map(|c| match c {
                    IoCompletion::Error(err) => Some(err),
                    _ => None,
                });
                match failed {
                    None => {
                        leg.restore();
                        break;
                    }
                    Some(err) if attempt < MAX_WRITE_RETRIES => {
                        attempt += 1;
                        trace!(
                            target: "strata::vdev",
                            event = "write_retry",
                            dev = leg.dev.idx().0,
                            attempt,
                            error = %err
                        );
                    }
                    Some(err) => {
                        leg.demote("write retries exhausted");
                        return Err(StrataError::IoFailure {
                            dev: leg.dev.idx().0,
                            detail: format!("mirror write failed: {err}"),
                        });
                    }
                }
            }
        }
        trace!(target: "strata::vdev", event = "write", bid = %bid, pieces = mv.npieces());
        Ok(())
    }

    /// Read `len` bytes at `off_in_run` within `bid`'s run from one
    /// mirror, rotating across legs and retrying the next mirror on
    /// failure.
    pub fn read_piece(
        &self,
        cx: &Cx,
        bid: BlkId,
        off_in_run: u32,
        len: usize,
    ) -> Result<AlignedBuf> {
        cx_checkpoint(cx)?;
        let set = self.set_for(bid)?;
        let nlegs = set.legs.len();
        let start = self.read_rotor.fetch_add(1, Ordering::Relaxed) % nlegs;

        // Healthy legs first, demoted legs as a last resort.
        let mut order: Vec<usize> = (0..nlegs).map(|i| (start + i) % nlegs).collect();
        order.sort_by_key(|idx| set.legs[*idx].is_demoted());

        let mut last_err = None;
        for idx in order {
            let leg = &set.legs[idx];
            let offset = self.leg_offset(leg, bid, off_in_run);
            match engine_read(leg.dev.engine().as_ref(), offset, len) {
                Ok(buf) => {
                    leg.restore();
                    return Ok(buf);
                }
                Err(err) => {
                    leg.demote("read failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(StrataError::IoFailure {
            dev: 0,
            detail: "no mirror legs".to_owned(),
        }))
    }

    /// Fan a write out to all mirror legs through the submission
    /// endpoint; `on_done` runs (on an I/O worker) once every leg has
    /// acked every piece, or with the first terminal error.
    pub fn write_async(
        &self,
        bid: BlkId,
        mv: &MemVec,
        endpoint: &Arc<IoEndpoint>,
        on_done: Box<dyn FnOnce(Result<()>) + Send>,
    ) -> Result<()> {
        let set = self.set_for(bid)?;
        let mut pieces: Vec<PieceSubmission> = Vec::new();
        for leg in &set.legs {
            for piece in mv.pieces() {
                pieces.push(PieceSubmission {
                    engine: Arc::clone(leg.dev.engine()),
                    offset: self.leg_offset(leg, bid, piece.offset()),
                    data: Arc::clone(piece.data()),
                    health: Arc::clone(&leg.health),
                    dev: leg.dev.idx().0,
                });
            }
        }
        if pieces.is_empty() {
            on_done(Ok(()));
            return Ok(());
        }

        let join = Arc::new(WriteJoin {
            remaining: AtomicUsize::new(pieces.len()),
            first_error: Mutex::new(None),
            on_done: Mutex::new(Some(on_done)),
        });
        for piece in pieces {
            submit_mirror_piece(endpoint, piece, MAX_WRITE_RETRIES, Arc::clone(&join));
        }
        Ok(())
    }
}

impl std::fmt::Debug for VirtualDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDev")
            .field("vdev", &self.cfg.vdev_id.0)
            .field("sets", &self.sets.len())
            .field("nmirrors", &self.cfg.nmirrors)
            .finish_non_exhaustive()
    }
}

// ── Async mirror fan-out ────────────────────────────────────────────────────

struct PieceSubmission {
    engine: Arc<dyn IoEngine>,
    offset: u64,
    data: Arc<AlignedBuf>,
    health: Arc<Mutex<LegHealth>>,
    dev: u16,
}

struct WriteJoin {
    remaining: AtomicUsize,
    first_error: Mutex<Option<StrataError>>,
    on_done: Mutex<Option<Box<dyn FnOnce(Result<()>) + Send>>>,
}

impl WriteJoin {
    fn complete_one(&self, result: Result<()>) {
        if let Err(err) = result {
            self.first_error.lock().get_or_insert(err);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let on_done = self.on_done.lock().take();
            let err = self.first_error.lock().take();
            if let Some(on_done) = on_done {
                on_done(match err {
                    Some(err) => Err(err),
                    None => Ok(()),
                });
            }
        }
    }
}

fn submit_mirror_piece(
    endpoint: &Arc<IoEndpoint>,
    piece: PieceSubmission,
    attempts_left: u32,
    join: Arc<WriteJoin>,
) {
    let ep = Arc::clone(endpoint);
    let engine = Arc::clone(&piece.engine);
    let op = IoOp::Write {
        offset: piece.offset,
        data: Arc::clone(&piece.data),
    };

    let cont: Continuation = Box::new(move |comp| match comp {
        IoCompletion::Write { .. } => join.complete_one(Ok(())),
        IoCompletion::Error(err) => {
            if attempts_left > 0 && !matches!(err, StrataError::ShutdownInProgress) {
                trace!(
                    target: "strata::vdev",
                    event = "async_write_retry",
                    dev = piece.dev,
                    attempts_left,
                    error = %err
                );
                submit_mirror_piece(&ep, piece, attempts_left - 1, join);
            } else {
                {
                    let mut health = piece.health.lock();
                    health.degraded = true;
                    health.failures += 1;
                    health.demoted_until = Some(Instant::now() + MIRROR_COOLDOWN);
                }
                join.complete_one(Err(StrataError::IoFailure {
                    dev: piece.dev,
                    detail: format!("mirror write failed: {err}"),
                }));
            }
        }
        _ => join.complete_one(Err(StrataError::IoFailure {
            dev: piece.dev,
            detail: "unexpected completion kind".to_owned(),
        })),
    });

    let cookie = endpoint.router().register(cont);
    if let Err(err) = endpoint.submit_op(engine, op, cookie) {
        // Never queued: route the failure through the registered
        // continuation so the join still resolves.
        endpoint.router().complete(cookie, IoCompletion::Error(err));
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
