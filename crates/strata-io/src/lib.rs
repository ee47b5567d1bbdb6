#![forbid(unsafe_code)]
//! I/O engines and the asynchronous submission endpoint.
//!
//! Two layers live here:
//!
//! 1. **Engines** ([`IoEngine`]): batch submission of positioned
//!    reads/writes against one opened device. [`PreadPwriteEngine`] maps
//!    each operation to a `pread`/`pwrite` syscall; [`MemIoEngine`]
//!    operates on an in-memory byte vector for tests and benchmarks.
//! 2. **Endpoint** ([`IoEndpoint`]): a worker pool with a bounded pool of
//!    I/O control blocks. Callers submit an operation plus a cookie; the
//!    completion is routed through a [`CompletionRouter`] to the
//!    continuation registered under that cookie, running on the worker
//!    that executed the request. No ordering is guaranteed between
//!    requests; callers needing order chain their continuations.

pub mod endpoint;

pub use endpoint::{CompletionRouter, Continuation, EndpointConfig, IoEndpoint};

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;
use strata_error::{Result, StrataError};
use tracing::trace;

/// Default alignment for device-facing buffers.
pub const DEFAULT_IO_ALIGNMENT: usize = 4096;

#[inline]
fn normalized_alignment(requested: usize) -> usize {
    if requested <= 1 {
        1
    } else if requested.is_power_of_two() {
        requested
    } else {
        requested.next_power_of_two()
    }
}

// ── Aligned buffer ──────────────────────────────────────────────────────────

/// Owned byte buffer whose exposed slice starts at a requested alignment.
///
/// Stays fully safe by over-allocating and exposing an aligned subslice
/// of the backing storage.
#[derive(Debug, Clone)]
pub struct AlignedBuf {
    storage: Vec<u8>,
    start: usize,
    len: usize,
    alignment: usize,
}

impl AlignedBuf {
    /// Zero-filled buffer of `size` bytes aligned to `alignment`.
    #[must_use]
    pub fn new(size: usize, alignment: usize) -> Self {
        let alignment = normalized_alignment(alignment);
        if size == 0 {
            return Self {
                storage: Vec::new(),
                start: 0,
                len: 0,
                alignment,
            };
        }

        let storage = vec![0_u8; size + alignment - 1];
        let base = storage.as_ptr() as usize;
        let misalignment = base & (alignment - 1);
        let start = if misalignment == 0 {
            0
        } else {
            alignment - misalignment
        };
        debug_assert!(start + size <= storage.len());
        Self {
            storage,
            start,
            len: size,
            alignment,
        }
    }

    /// Aligned copy of `bytes`.
    #[must_use]
    pub fn from_slice(bytes: &[u8], alignment: usize) -> Self {
        let mut buf = Self::new(bytes.len(), alignment);
        buf.as_mut_slice().copy_from_slice(bytes);
        buf
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        let end = start + self.len;
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

impl PartialEq for AlignedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for AlignedBuf {}

// ── Device open flags ───────────────────────────────────────────────────────

/// How device files are opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenFlags {
    /// Page-cache buffered I/O.
    Buffered,
    /// `O_DIRECT`: submissions bypass the kernel page cache. Buffers and
    /// offsets must be aligned to the device's logical sector size.
    #[default]
    Direct,
}

/// Open a device path for read/write with the requested flags.
pub fn open_device(path: &Path, flags: OpenFlags) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    if flags == OpenFlags::Direct {
        opts.custom_flags(libc::O_DIRECT);
    }
    Ok(opts.open(path)?)
}

/// Discover the device length in bytes.
///
/// Regular files report through metadata; block devices report a zero
/// metadata length, so fall back to seeking to the end.
pub fn device_len(file: &File) -> Result<u64> {
    let len = file.metadata()?.len();
    if len > 0 {
        return Ok(len);
    }
    let mut probe = file.try_clone()?;
    Ok(probe.seek(SeekFrom::End(0))?)
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// A single positioned I/O operation in a batch.
#[derive(Debug)]
pub enum IoOp {
    /// Read `len` bytes from `offset`; the engine allocates the buffer.
    Read { offset: u64, len: usize },
    /// Write `data` at `offset`.
    Write { offset: u64, data: Arc<AlignedBuf> },
    /// Write `pieces` back to back starting at `offset`.
    WriteV {
        offset: u64,
        pieces: Vec<Arc<AlignedBuf>>,
    },
    /// Flush device caches (fdatasync).
    Sync,
}

/// Result of one completed operation.
#[derive(Debug)]
pub enum IoCompletion {
    /// Read completed with the filled buffer.
    Read(AlignedBuf),
    /// Write completed; `len` bytes are on the device.
    Write { len: usize },
    /// Sync completed.
    Sync,
    /// Operation failed.
    Error(StrataError),
}

impl IoCompletion {
    /// Transferred length, or the operation's error.
    pub fn into_result_len(self) -> Result<usize> {
        match self {
            Self::Read(buf) => Ok(buf.len()),
            Self::Write { len } => Ok(len),
            Self::Sync => Ok(0),
            Self::Error(err) => Err(err),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Monotonic per-engine counters.
#[derive(Debug, Clone, Default)]
pub struct IoEngineStats {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub batches: u64,
}

/// Batch I/O interface over one device.
///
/// Completions are returned in submission order. Synchronous engines
/// execute inline; queue-based engines submit and poll.
pub trait IoEngine: Send + Sync {
    fn submit_batch(&self, ops: Vec<IoOp>) -> Vec<IoCompletion>;

    /// Device length in bytes.
    fn len_bytes(&self) -> u64;

    /// Engine name for diagnostics.
    fn name(&self) -> &'static str;

    fn stats(&self) -> IoEngineStats;
}

// ── pread/pwrite engine ─────────────────────────────────────────────────────

/// Positioned-syscall engine: one `pread`/`pwrite` per operation.
pub struct PreadPwriteEngine {
    file: Arc<File>,
    len: u64,
    alignment: usize,
    stats: parking_lot::Mutex<IoEngineStats>,
}

impl PreadPwriteEngine {
    /// Open `path` with `flags` and discover its length.
    pub fn open(path: &Path, flags: OpenFlags) -> Result<Self> {
        let file = open_device(path, flags)?;
        let len = device_len(&file)?;
        Ok(Self::from_file(Arc::new(file), len))
    }

    #[must_use]
    pub fn from_file(file: Arc<File>, len: u64) -> Self {
        Self {
            file,
            len,
            alignment: DEFAULT_IO_ALIGNMENT,
            stats: parking_lot::Mutex::new(IoEngineStats::default()),
        }
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    fn bounds_check(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| StrataError::InvalidDevice("I/O range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(StrataError::InvalidDevice(format!(
                "I/O out of bounds: offset={offset} len={len} device_len={}",
                self.len
            )));
        }
        Ok(())
    }

    fn do_read(&self, offset: u64, len: usize) -> Result<AlignedBuf> {
        self.bounds_check(offset, len)?;
        let mut buf = AlignedBuf::new(len, self.alignment);
        self.file.read_exact_at(buf.as_mut_slice(), offset)?;
        let mut stats = self.stats.lock();
        stats.reads += 1;
        stats.bytes_read += len as u64;
        Ok(buf)
    }

    fn do_write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.bounds_check(offset, data.len())?;
        self.file.write_all_at(data, offset)?;
        let mut stats = self.stats.lock();
        stats.writes += 1;
        stats.bytes_written += data.len() as u64;
        Ok(data.len())
    }
}

impl std::fmt::Debug for PreadPwriteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreadPwriteEngine")
            .field("len", &self.len)
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl IoEngine for PreadPwriteEngine {
    fn submit_batch(&self, ops: Vec<IoOp>) -> Vec<IoCompletion> {
        self.stats.lock().batches += 1;
        ops.into_iter()
            .map(|op| match op {
                IoOp::Read { offset, len } => match self.do_read(offset, len) {
                    Ok(buf) => IoCompletion::Read(buf),
                    Err(err) => IoCompletion::Error(err),
                },
                IoOp::Write { offset, data } => match self.do_write(offset, data.as_slice()) {
                    Ok(len) => IoCompletion::Write { len },
                    Err(err) => IoCompletion::Error(err),
                },
                IoOp::WriteV { offset, pieces } => {
                    let mut cursor = offset;
                    let mut total = 0_usize;
                    let mut failed = None;
                    for piece in &pieces {
                        match self.do_write(cursor, piece.as_slice()) {
                            Ok(len) => {
                                cursor += len as u64;
                                total += len;
                            }
                            Err(err) => {
                                failed = Some(err);
                                break;
                            }
                        }
                    }
                    match failed {
                        None => IoCompletion::Write { len: total },
                        Some(err) => IoCompletion::Error(err),
                    }
                }
                IoOp::Sync => {
                    self.stats.lock().syncs += 1;
                    match self.file.sync_data() {
                        Ok(()) => IoCompletion::Sync,
                        Err(err) => IoCompletion::Error(StrataError::Io(err)),
                    }
                }
            })
            .collect()
    }

    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn name(&self) -> &'static str {
        "pread/pwrite"
    }

    fn stats(&self) -> IoEngineStats {
        self.stats.lock().clone()
    }
}

// ── In-memory engine ────────────────────────────────────────────────────────

/// In-memory engine for tests and benchmarks.
pub struct MemIoEngine {
    data: parking_lot::Mutex<Vec<u8>>,
    stats: parking_lot::Mutex<IoEngineStats>,
}

impl MemIoEngine {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            data: parking_lot::Mutex::new(vec![0_u8; size]),
            stats: parking_lot::Mutex::new(IoEngineStats::default()),
        }
    }

    /// Snapshot of the backing bytes in `offset..offset + len`.
    #[must_use]
    pub fn snapshot(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = self.data.lock();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = (start + len).min(data.len());
        data[start..end].to_vec()
    }

    fn range(data_len: usize, offset: u64, len: usize) -> Result<(usize, usize)> {
        let start = usize::try_from(offset)
            .map_err(|_| StrataError::InvalidDevice("offset exceeds memory size".to_owned()))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= data_len)
            .ok_or_else(|| {
                StrataError::InvalidDevice(format!(
                    "I/O out of bounds: offset={offset} len={len} device_len={data_len}"
                ))
            })?;
        Ok((start, end))
    }
}

impl std::fmt::Debug for MemIoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemIoEngine")
            .field("size", &self.data.lock().len())
            .finish_non_exhaustive()
    }
}

impl IoEngine for MemIoEngine {
    fn submit_batch(&self, ops: Vec<IoOp>) -> Vec<IoCompletion> {
        self.stats.lock().batches += 1;
        let mut data = self.data.lock();
        ops.into_iter()
            .map(|op| match op {
                IoOp::Read { offset, len } => match Self::range(data.len(), offset, len) {
                    Ok((start, end)) => {
                        let buf = AlignedBuf::from_slice(&data[start..end], DEFAULT_IO_ALIGNMENT);
                        let mut stats = self.stats.lock();
                        stats.reads += 1;
                        stats.bytes_read += len as u64;
                        drop(stats);
                        IoCompletion::Read(buf)
                    }
                    Err(err) => IoCompletion::Error(err),
                },
                IoOp::Write { offset, data: wd } => {
                    match Self::range(data.len(), offset, wd.len()) {
                        Ok((start, end)) => {
                            data[start..end].copy_from_slice(wd.as_slice());
                            let mut stats = self.stats.lock();
                            stats.writes += 1;
                            stats.bytes_written += wd.len() as u64;
                            drop(stats);
                            IoCompletion::Write { len: wd.len() }
                        }
                        Err(err) => IoCompletion::Error(err),
                    }
                }
                IoOp::WriteV { offset, pieces } => {
                    let mut cursor = offset;
                    let mut total = 0_usize;
                    let mut failed = None;
                    for piece in &pieces {
                        match Self::range(data.len(), cursor, piece.len()) {
                            Ok((start, end)) => {
                                data[start..end].copy_from_slice(piece.as_slice());
                                cursor += piece.len() as u64;
                                total += piece.len();
                            }
                            Err(err) => {
                                failed = Some(err);
                                break;
                            }
                        }
                    }
                    match failed {
                        None => {
                            let mut stats = self.stats.lock();
                            stats.writes += 1;
                            stats.bytes_written += total as u64;
                            drop(stats);
                            IoCompletion::Write { len: total }
                        }
                        Some(err) => IoCompletion::Error(err),
                    }
                }
                IoOp::Sync => {
                    self.stats.lock().syncs += 1;
                    IoCompletion::Sync
                }
            })
            .collect()
    }

    fn len_bytes(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn stats(&self) -> IoEngineStats {
        self.stats.lock().clone()
    }
}

/// A [`MemIoEngine`] wrapper that fails an armed number of operations.
///
/// Test double for mirror-retry and degradation paths: open and format
/// through it cleanly, then arm the faults before the I/O under test.
pub struct FaultyIoEngine {
    inner: MemIoEngine,
    fail_writes: parking_lot::Mutex<u32>,
    fail_reads: parking_lot::Mutex<u32>,
}

impl FaultyIoEngine {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            inner: MemIoEngine::new(size),
            fail_writes: parking_lot::Mutex::new(0),
            fail_reads: parking_lot::Mutex::new(0),
        }
    }

    /// Fail the next `n` write submissions.
    pub fn arm_write_faults(&self, n: u32) {
        *self.fail_writes.lock() = n;
    }

    /// Fail the next `n` read submissions.
    pub fn arm_read_faults(&self, n: u32) {
        *self.fail_reads.lock() = n;
    }
}

impl std::fmt::Debug for FaultyIoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyIoEngine").finish_non_exhaustive()
    }
}

impl IoEngine for FaultyIoEngine {
    fn submit_batch(&self, ops: Vec<IoOp>) -> Vec<IoCompletion> {
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            let armed = match op {
                IoOp::Write { .. } | IoOp::WriteV { .. } => &self.fail_writes,
                IoOp::Read { .. } => &self.fail_reads,
                IoOp::Sync => {
                    out.extend(self.inner.submit_batch(vec![op]));
                    continue;
                }
            };
            {
                let mut remaining = armed.lock();
                if *remaining > 0 {
                    *remaining -= 1;
                    trace!(target: "strata::io", event = "injected_io_failure");
                    out.push(IoCompletion::Error(StrataError::IoFailure {
                        dev: 0,
                        detail: "injected I/O failure".to_owned(),
                    }));
                    continue;
                }
            }
            out.extend(self.inner.submit_batch(vec![op]));
        }
        out
    }

    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn name(&self) -> &'static str {
        "faulty-memory"
    }

    fn stats(&self) -> IoEngineStats {
        self.inner.stats()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_buf_respects_alignment() {
        for align in [1_usize, 512, 4096, 8192] {
            let buf = AlignedBuf::new(1024, align);
            assert_eq!(buf.len(), 1024);
            assert_eq!(buf.as_slice().as_ptr() as usize % align.max(1), 0);
        }
    }

    #[test]
    fn aligned_buf_from_slice_copies() {
        let buf = AlignedBuf::from_slice(&[1, 2, 3, 4], 4096);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(buf.alignment(), 4096);
    }

    #[test]
    fn aligned_buf_zero_len() {
        let buf = AlignedBuf::new(0, 4096);
        assert!(buf.is_empty());
        assert!(buf.as_slice().is_empty());
    }

    #[test]
    fn mem_engine_read_write_roundtrip() {
        let engine = MemIoEngine::new(8192);
        let data = Arc::new(AlignedBuf::from_slice(&[0xAB_u8; 4096], 4096));
        let comps = engine.submit_batch(vec![IoOp::Write {
            offset: 0,
            data,
        }]);
        assert!(matches!(comps[0], IoCompletion::Write { len: 4096 }));

        let comps = engine.submit_batch(vec![IoOp::Read {
            offset: 0,
            len: 4096,
        }]);
        match &comps[0] {
            IoCompletion::Read(buf) => assert!(buf.as_slice().iter().all(|b| *b == 0xAB)),
            other => panic!("expected Read, got {other:?}"),
        }
    }

    #[test]
    fn mem_engine_vectored_write() {
        let engine = MemIoEngine::new(8192);
        let pieces = vec![
            Arc::new(AlignedBuf::from_slice(&[1_u8; 2048], 4096)),
            Arc::new(AlignedBuf::from_slice(&[2_u8; 2048], 4096)),
        ];
        let comps = engine.submit_batch(vec![IoOp::WriteV { offset: 0, pieces }]);
        assert!(matches!(comps[0], IoCompletion::Write { len: 4096 }));
        assert_eq!(engine.snapshot(0, 1), vec![1]);
        assert_eq!(engine.snapshot(2048, 1), vec![2]);
    }

    #[test]
    fn mem_engine_read_past_end_errors() {
        let engine = MemIoEngine::new(1024);
        let comps = engine.submit_batch(vec![IoOp::Read {
            offset: 512,
            len: 1024,
        }]);
        assert!(comps[0].is_error());
    }

    #[test]
    fn mem_engine_stats_accumulate() {
        let engine = MemIoEngine::new(8192);
        engine.submit_batch(vec![
            IoOp::Write {
                offset: 0,
                data: Arc::new(AlignedBuf::new(1024, 4096)),
            },
            IoOp::Read {
                offset: 0,
                len: 512,
            },
            IoOp::Sync,
        ]);
        let stats = engine.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.syncs, 1);
        assert_eq!(stats.bytes_written, 1024);
        assert_eq!(stats.bytes_read, 512);
        assert_eq!(stats.batches, 1);
    }

    #[test]
    fn faulty_engine_fails_then_recovers() {
        let engine = FaultyIoEngine::new(4096);
        engine.arm_write_faults(1);
        let data = Arc::new(AlignedBuf::from_slice(&[7_u8; 512], 4096));
        let comps = engine.submit_batch(vec![IoOp::Write {
            offset: 0,
            data: Arc::clone(&data),
        }]);
        assert!(comps[0].is_error());
        let comps = engine.submit_batch(vec![IoOp::Write { offset: 0, data }]);
        assert!(matches!(comps[0], IoCompletion::Write { len: 512 }));

        engine.arm_read_faults(1);
        let comps = engine.submit_batch(vec![IoOp::Read { offset: 0, len: 512 }]);
        assert!(comps[0].is_error());
        let comps = engine.submit_batch(vec![IoOp::Read { offset: 0, len: 512 }]);
        assert!(matches!(comps[0], IoCompletion::Read(_)));
    }

    #[test]
    fn pread_pwrite_engine_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.img");
        std::fs::write(&path, vec![0_u8; 8192]).unwrap();

        let engine = PreadPwriteEngine::open(&path, OpenFlags::Buffered).unwrap();
        assert_eq!(engine.len_bytes(), 8192);
        assert_eq!(engine.name(), "pread/pwrite");

        let data = Arc::new(AlignedBuf::from_slice(&[0x42_u8; 512], 4096));
        let comps = engine.submit_batch(vec![IoOp::Write { offset: 4096, data }]);
        assert!(matches!(comps[0], IoCompletion::Write { len: 512 }));

        let comps = engine.submit_batch(vec![IoOp::Read {
            offset: 4096,
            len: 512,
        }]);
        match &comps[0] {
            IoCompletion::Read(buf) => assert!(buf.as_slice().iter().all(|b| *b == 0x42)),
            other => panic!("expected Read, got {other:?}"),
        }
    }

    #[test]
    fn pread_pwrite_engine_bounds_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.img");
        std::fs::write(&path, vec![0_u8; 1024]).unwrap();

        let engine = PreadPwriteEngine::open(&path, OpenFlags::Buffered).unwrap();
        let comps = engine.submit_batch(vec![IoOp::Read {
            offset: 0,
            len: 4096,
        }]);
        assert!(comps[0].is_error());
    }

    #[test]
    fn completion_result_len() {
        assert_eq!(
            IoCompletion::Write { len: 42 }.into_result_len().unwrap(),
            42
        );
        assert_eq!(IoCompletion::Sync.into_result_len().unwrap(), 0);
        assert!(IoCompletion::Error(StrataError::OutOfSpace)
            .into_result_len()
            .is_err());
    }
}
