//! Append-only journal virtual device.
//!
//! A single-copy chain of chunks addressed by one logical offset space.
//! `alloc_next_append_blk` linearizes allocation: offsets are handed out
//! strictly increasing, and a record never crosses a chunk boundary.
//! When the tail chunk cannot hold the next record, a one-block
//! `ChunkEof` sentinel is written at the tail and the allocation moves
//! to the start of the next chunk. Replay recognizes the sentinel by its
//! leading magic and jumps ahead.

use crate::{cx_checkpoint, engine_read, engine_write, ChunkInfo, DeviceManager, PhysicalDev};
use asupersync::Cx;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_error::{Result, StrataError};
use strata_io::AlignedBuf;
use strata_types::{BlockSize, DevId, VdevId, DISK_ALIGN_SIZE};
use tracing::{debug, trace, warn};

/// First eight bytes of a chunk-end sentinel block ("JRNL_EOF").
pub const JOURNAL_EOF_MAGIC: u64 = 0x4A52_4E4C_5F45_4F46;

/// Used-space fraction that logs a warning.
const HIGH_WATERMARK_WARN_PCT: u64 = 80;
/// Used-space fraction that back-pressures allocation.
const HIGH_WATERMARK_LIMIT_PCT: u64 = 95;

/// Journal geometry.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub vdev_id: VdevId,
    pub blk_size: BlockSize,
    /// Bytes per chunk.
    pub chunk_size: u64,
    /// Chunks to carve when none exist yet.
    pub nchunks: u32,
}

struct JournalChunk {
    info: ChunkInfo,
    dev: Arc<PhysicalDev>,
}

struct JournalState {
    /// Next unallocated logical offset; always block-aligned.
    tail: u64,
    /// Logical offset where live data begins (advanced by truncate).
    data_start: u64,
    /// Bytes allocated but not yet written.
    reserved: u64,
}

/// Append-only vdev with a seek-free offset space over its chunks.
pub struct JournalVdev {
    cfg: JournalConfig,
    chunks: Vec<JournalChunk>,
    state: Mutex<JournalState>,
    /// Bytes durably written, including chunk-end padding.
    write_total: AtomicU64,
}

impl JournalVdev {
    /// Adopt the journal's chunks from the device manager, or carve
    /// `nchunks` fresh ones round-robin across devices.
    pub fn open(cx: &Cx, mgr: &DeviceManager, cfg: JournalConfig) -> Result<Self> {
        cx_checkpoint(cx)?;
        if cfg.chunk_size % u64::from(cfg.blk_size.get()) != 0 {
            return Err(StrataError::UnalignedAccess {
                offset: cfg.chunk_size,
                align: cfg.blk_size.get(),
            });
        }
        let infos = {
            let existing = mgr.chunks_for_vdev(cfg.vdev_id);
            if existing.is_empty() {
                let ndev = mgr.ndevices();
                (0..cfg.nchunks)
                    .map(|i| {
                        let dev = DevId(
                            u16::try_from(i as usize % ndev).expect("device count fits u16"),
                        );
                        mgr.alloc_chunk(dev, cfg.chunk_size, cfg.vdev_id)
                    })
                    .collect::<Result<Vec<_>>>()?
            } else {
                existing
            }
        };
        let mut chunks = Vec::with_capacity(infos.len());
        for info in infos {
            if info.size != cfg.chunk_size {
                return Err(StrataError::CorruptMetadata {
                    dev: info.device_idx.0,
                    detail: format!(
                        "journal chunk {} size {} differs from configured {}",
                        info.chunk_id.0, info.size, cfg.chunk_size
                    ),
                });
            }
            chunks.push(JournalChunk {
                info,
                dev: mgr.device(info.device_idx)?,
            });
        }
        debug!(
            target: "strata::journal",
            event = "journal_open",
            vdev = cfg.vdev_id.0,
            chunks = chunks.len()
        );
        Ok(Self {
            cfg,
            chunks,
            state: Mutex::new(JournalState {
                tail: 0,
                data_start: 0,
                reserved: 0,
            }),
            write_total: AtomicU64::new(0),
        })
    }

    /// Total logical capacity in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.chunks.len() as u64 * self.cfg.chunk_size
    }

    /// Bytes in use: durably written plus allocated-but-unwritten.
    #[must_use]
    pub fn used_size(&self) -> u64 {
        self.write_total.load(Ordering::Relaxed) + self.state.lock().reserved
    }

    #[must_use]
    pub fn available_size(&self) -> u64 {
        self.total_size() - self.used_size()
    }

    /// Free blocks, with the block size as the unit.
    #[must_use]
    pub fn available_blks(&self) -> u64 {
        self.available_size() / u64::from(self.cfg.blk_size.get())
    }

    /// Logical offset where live data begins.
    #[must_use]
    pub fn data_start_offset(&self) -> u64 {
        self.state.lock().data_start
    }

    /// Logical tail: next unallocated offset, or the durable tail when
    /// `reserve_space_include` is false.
    #[must_use]
    pub fn tail_offset(&self, reserve_space_include: bool) -> u64 {
        let state = self.state.lock();
        if reserve_space_include {
            state.tail
        } else {
            state.tail - state.reserved
        }
    }

    fn chunk_at(&self, log_offset: u64) -> Result<(&JournalChunk, u64)> {
        let idx = (log_offset / self.cfg.chunk_size) as usize;
        let chunk = self.chunks.get(idx).ok_or_else(|| {
            StrataError::InvalidDevice(format!("journal offset {log_offset} beyond the last chunk"))
        })?;
        Ok((chunk, log_offset % self.cfg.chunk_size))
    }

    fn write_eof_sentinel(&self, log_offset: u64) -> Result<()> {
        let blk = self.cfg.blk_size.get() as usize;
        let mut buf = AlignedBuf::new(blk, DISK_ALIGN_SIZE);
        buf.as_mut_slice()[..8].copy_from_slice(&JOURNAL_EOF_MAGIC.to_le_bytes());
        let (chunk, off_in_chunk) = self.chunk_at(log_offset)?;
        engine_write(
            chunk.dev.engine().as_ref(),
            chunk.info.start_offset + off_in_chunk,
            Arc::new(buf),
        )?;
        trace!(
            target: "strata::journal",
            event = "chunk_eof",
            offset = log_offset,
            chunk = chunk.info.chunk_id.0
        );
        Ok(())
    }

    /// Reserve `size` bytes and return their start offset.
    ///
    /// Offsets from successive calls are strictly increasing; the
    /// reserved span never crosses a chunk boundary. Sizes must be
    /// multiples of the journal block size.
    pub fn alloc_next_append_blk(&self, size: usize) -> Result<u64> {
        let size = size as u64;
        let blk = u64::from(self.cfg.blk_size.get());
        if size == 0 || size % blk != 0 {
            return Err(StrataError::UnalignedAccess {
                offset: size,
                align: self.cfg.blk_size.get(),
            });
        }
        if size > self.cfg.chunk_size {
            #[expect(clippy::cast_possible_truncation)]
            return Err(StrataError::RunTooLong {
                requested: (size / blk) as u32,
                max: (self.cfg.chunk_size / blk) as u32,
            });
        }

        let mut state = self.state.lock();
        let total = self.total_size();
        let off_in_chunk = state.tail % self.cfg.chunk_size;
        let pad = if off_in_chunk != 0 && off_in_chunk + size > self.cfg.chunk_size {
            self.cfg.chunk_size - off_in_chunk
        } else {
            0
        };

        let used = self.write_total.load(Ordering::Relaxed) + state.reserved;
        let used_after = used + pad + size;
        if used_after > total {
            return Err(StrataError::OutOfSpace);
        }
        let pct_after = used_after * 100 / total;
        if pct_after >= HIGH_WATERMARK_LIMIT_PCT {
            warn!(
                target: "strata::journal",
                event = "high_watermark_limit",
                used = used_after,
                total,
                "journal back-pressure"
            );
            return Err(StrataError::OutOfSpace);
        }
        if pct_after >= HIGH_WATERMARK_WARN_PCT {
            warn!(
                target: "strata::journal",
                event = "high_watermark_warn",
                used = used_after,
                total
            );
        }

        if pad > 0 {
            // The sentinel occupies one block; the rest of the chunk is
            // dead space that replay skips over.
            self.write_eof_sentinel(state.tail)?;
            state.tail += pad;
            self.write_total.fetch_add(pad, Ordering::Relaxed);
        }

        let offset = state.tail;
        state.tail += size;
        state.reserved += size;
        trace!(
            target: "strata::journal",
            event = "append_blk_alloc",
            offset,
            size,
            pad
        );
        Ok(offset)
    }

    /// Write `buf` at an offset previously returned by
    /// [`Self::alloc_next_append_blk`]. Never crosses a chunk boundary.
    pub fn pwrite_at(&self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        cx_checkpoint(cx)?;
        let (chunk, off_in_chunk) = self.chunk_at(offset)?;
        if off_in_chunk + buf.len() as u64 > self.cfg.chunk_size {
            return Err(StrataError::UnalignedAccess {
                offset,
                align: self.cfg.blk_size.get(),
            });
        }
        engine_write(
            chunk.dev.engine().as_ref(),
            chunk.info.start_offset + off_in_chunk,
            Arc::new(AlignedBuf::from_slice(buf, DISK_ALIGN_SIZE)),
        )?;
        self.write_total.fetch_add(buf.len() as u64, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(buf.len() as u64);
        Ok(())
    }

    /// Allocate and write in one step; returns the record's offset.
    pub fn append(&self, cx: &Cx, buf: &[u8]) -> Result<u64> {
        let offset = self.alloc_next_append_blk(buf.len())?;
        self.pwrite_at(cx, buf, offset)?;
        Ok(offset)
    }

    /// Read up to `len` bytes at `offset`, clipped at the chunk end.
    ///
    /// The returned buffer may be shorter than `len`; a read never
    /// crosses a chunk boundary.
    pub fn pread_at(&self, cx: &Cx, offset: u64, len: usize) -> Result<AlignedBuf> {
        cx_checkpoint(cx)?;
        let (chunk, off_in_chunk) = self.chunk_at(offset)?;
        let clipped = (self.cfg.chunk_size - off_in_chunk).min(len as u64) as usize;
        engine_read(
            chunk.dev.engine().as_ref(),
            chunk.info.start_offset + off_in_chunk,
            clipped,
        )
    }

    /// Release everything before `offset`.
    pub fn truncate(&self, offset: u64) -> Result<()> {
        let mut state = self.state.lock();
        if offset < state.data_start || offset > state.tail {
            return Err(StrataError::NotFound(format!(
                "truncate offset {offset} outside [{}, {}]",
                state.data_start, state.tail
            )));
        }
        let released = offset - state.data_start;
        state.data_start = offset;
        drop(state);
        // Released bytes return to the budget.
        let mut current = self.write_total.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(released);
            match self.write_total.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
        debug!(target: "strata::journal", event = "truncate", offset, released);
        Ok(())
    }
}

impl std::fmt::Debug for JournalVdev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalVdev")
            .field("vdev", &self.cfg.vdev_id.0)
            .field("chunks", &self.chunks.len())
            .field("used", &self.used_size())
            .finish_non_exhaustive()
    }
}

/// Whether a block read from the journal is a chunk-end sentinel.
#[must_use]
pub fn is_chunk_eof(block: &[u8]) -> bool {
    block.len() >= 8
        && u64::from_le_bytes(block[..8].try_into().expect("sliced to 8 bytes"))
            == JOURNAL_EOF_MAGIC
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use strata_io::{IoEngine, MemIoEngine};
    use strata_types::StoreUuid;

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn setup(chunk_size: u64, nchunks: u32) -> (Arc<MemIoEngine>, JournalVdev) {
        let engine = Arc::new(MemIoEngine::new(
            (crate::DATA_START_OFFSET + chunk_size * u64::from(nchunks)) as usize,
        ));
        let pairs = vec![(
            PathBuf::from("/mem/journal"),
            Arc::clone(&engine) as Arc<dyn IoEngine>,
        )];
        let mgr =
            DeviceManager::open_with_engines(&test_cx(), pairs, StoreUuid(5), true).unwrap();
        let journal = JournalVdev::open(
            &test_cx(),
            &mgr,
            JournalConfig {
                vdev_id: VdevId(9),
                blk_size: BlockSize::new(4096).unwrap(),
                chunk_size,
                nchunks,
            },
        )
        .unwrap();
        (engine, journal)
    }

    #[test]
    fn appends_are_monotonic_and_dense() {
        let cx = test_cx();
        let (_engine, journal) = setup(1 << 20, 2);

        let mut prev_end = 0_u64;
        for i in 0..8_u8 {
            let data = vec![i; 4096];
            let offset = journal.append(&cx, &data).unwrap();
            assert!(offset >= prev_end, "offsets must be strictly increasing");
            prev_end = offset + 4096;
        }
        assert_eq!(journal.tail_offset(true), prev_end);
        assert_eq!(journal.used_size(), 8 * 4096);
    }

    #[test]
    fn append_reads_back() {
        let cx = test_cx();
        let (_engine, journal) = setup(1 << 20, 2);

        let data = vec![0x5A_u8; 8192];
        let offset = journal.append(&cx, &data).unwrap();
        let buf = journal.pread_at(&cx, offset, 8192).unwrap();
        assert_eq!(buf.as_slice(), &data[..]);
    }

    #[test]
    fn wrap_pads_with_chunk_eof_sentinel() {
        let cx = test_cx();
        let chunk = 1_u64 << 20;
        let (_engine, journal) = setup(chunk, 2);

        // Fill the first chunk to one block short of its end.
        let fill = vec![0x01_u8; (chunk - 4096) as usize];
        let first = journal.append(&cx, &fill).unwrap();
        assert_eq!(first, 0);
        assert_eq!(journal.tail_offset(true), chunk - 4096);

        // An 8 KiB record cannot fit; a sentinel pads the chunk and the
        // record lands at the start of the next chunk.
        let record = vec![0x02_u8; 8192];
        let offset = journal.append(&cx, &record).unwrap();
        assert_eq!(offset, chunk);

        let pad_block = journal.pread_at(&cx, chunk - 4096, 4096).unwrap();
        assert!(is_chunk_eof(pad_block.as_slice()));

        let data = journal.pread_at(&cx, offset, 8192).unwrap();
        assert!(data.as_slice().iter().all(|b| *b == 0x02));

        // Padding counts as used space.
        assert_eq!(journal.used_size(), chunk + 8192);
    }

    #[test]
    fn reads_clip_at_chunk_boundary() {
        let cx = test_cx();
        let chunk = 64_u64 * 1024;
        let (_engine, journal) = setup(chunk, 2);

        let buf = journal.pread_at(&cx, chunk - 4096, 16384).unwrap();
        assert_eq!(buf.len(), 4096, "read must not cross the chunk");
    }

    #[test]
    fn unaligned_append_rejected() {
        let (_engine, journal) = setup(1 << 20, 1);
        assert!(matches!(
            journal.alloc_next_append_blk(100),
            Err(StrataError::UnalignedAccess { .. })
        ));
        assert!(matches!(
            journal.alloc_next_append_blk(0),
            Err(StrataError::UnalignedAccess { .. })
        ));
    }

    #[test]
    fn oversized_record_rejected() {
        let (_engine, journal) = setup(64 * 1024, 2);
        assert!(matches!(
            journal.alloc_next_append_blk(128 * 1024),
            Err(StrataError::RunTooLong { .. })
        ));
    }

    #[test]
    fn high_watermark_back_pressure() {
        let cx = test_cx();
        // Two 64 KiB chunks: 128 KiB total; the 95% limit sits at
        // 124,518 bytes.
        let (_engine, journal) = setup(64 * 1024, 2);

        let mut appended = 0_u64;
        let record = vec![0xFF_u8; 4096];
        let err = loop {
            match journal.append(&cx, &record) {
                Ok(_) => appended += 4096,
                Err(err) => break err,
            }
        };
        assert!(matches!(err, StrataError::OutOfSpace));
        // Back-pressure triggered below the hard ceiling.
        assert!(appended < 128 * 1024);
        assert!(appended * 100 / (128 * 1024) >= 90);
    }

    #[test]
    fn truncate_releases_space() {
        let cx = test_cx();
        let (_engine, journal) = setup(1 << 20, 1);

        for _ in 0..4 {
            journal.append(&cx, &vec![0xAB_u8; 4096]).unwrap();
        }
        assert_eq!(journal.used_size(), 16384);

        journal.truncate(8192).unwrap();
        assert_eq!(journal.data_start_offset(), 8192);
        assert_eq!(journal.used_size(), 8192);

        assert!(journal.truncate(4096).is_err(), "cannot truncate backwards");
        assert!(
            journal.truncate(journal.tail_offset(true) + 4096).is_err(),
            "cannot truncate past the tail"
        );
    }
}
