#![forbid(unsafe_code)]
//! Physical devices, the persisted device header, and chunk management.
//!
//! The device manager opens every configured device at mount, validates
//! (or first-time writes) the super-block header at offset zero, and
//! exposes the chunk table. Virtual devices carve chunks out of the
//! managed devices with a first-fit scan and route their I/O through the
//! per-device engines owned here.

pub mod chunk;
pub mod journal;
pub mod vdev;

pub use chunk::{ChunkInfo, CHUNK_ENTRY_SIZE};
pub use journal::{JournalConfig, JournalVdev, JOURNAL_EOF_MAGIC};
pub use vdev::{AllocatorKind, VdevConfig, VirtualDev};

use asupersync::Cx;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use strata_error::{Result, StrataError};
use strata_io::{AlignedBuf, IoCompletion, IoEngine, IoOp, OpenFlags, PreadPwriteEngine};
use strata_types::{ChunkId, DevId, StoreUuid, VdevId, DISK_ALIGN_SIZE};
use tracing::{debug, info, warn};

#[inline]
pub(crate) fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| StrataError::ShutdownInProgress)
}

// ── Engine helpers ──────────────────────────────────────────────────────────

/// Read exactly `len` bytes at `offset` through a device engine.
pub(crate) fn engine_read(engine: &dyn IoEngine, offset: u64, len: usize) -> Result<AlignedBuf> {
    let mut comps = engine.submit_batch(vec![IoOp::Read { offset, len }]);
    match comps.pop() {
        Some(IoCompletion::Read(buf)) => Ok(buf),
        Some(IoCompletion::Error(err)) => Err(err),
        _ => Err(StrataError::IoFailure {
            dev: 0,
            detail: "engine returned mismatched completion for read".to_owned(),
        }),
    }
}

/// Write `data` at `offset` through a device engine.
pub(crate) fn engine_write(engine: &dyn IoEngine, offset: u64, data: Arc<AlignedBuf>) -> Result<()> {
    let mut comps = engine.submit_batch(vec![IoOp::Write { offset, data }]);
    match comps.pop() {
        Some(IoCompletion::Write { .. }) => Ok(()),
        Some(IoCompletion::Error(err)) => Err(err),
        _ => Err(StrataError::IoFailure {
            dev: 0,
            detail: "engine returned mismatched completion for write".to_owned(),
        }),
    }
}

/// Flush a device engine.
pub(crate) fn engine_sync(engine: &dyn IoEngine) -> Result<()> {
    let mut comps = engine.submit_batch(vec![IoOp::Sync]);
    match comps.pop() {
        Some(IoCompletion::Sync) => Ok(()),
        Some(IoCompletion::Error(err)) => Err(err),
        _ => Err(StrataError::IoFailure {
            dev: 0,
            detail: "engine returned mismatched completion for sync".to_owned(),
        }),
    }
}

// ── On-disk header ──────────────────────────────────────────────────────────

const DEV_HDR_MAGIC: [u8; 8] = *b"STRATADV";
const DEV_HDR_VERSION: u32 = 1;
/// CRC-covered prefix of the header block.
const DEV_HDR_BODY_LEN: usize = 60;

/// Byte offset of the chunk table on every device.
pub const CHUNK_TABLE_OFFSET: u64 = DISK_ALIGN_SIZE as u64;
/// Reserved length of the chunk table region.
pub const CHUNK_TABLE_BYTES: usize = DISK_ALIGN_SIZE;
/// First byte usable for chunk data (header block + chunk table).
pub const DATA_START_OFFSET: u64 = 2 * DISK_ALIGN_SIZE as u64;
/// Chunk-table capacity per device.
pub const MAX_CHUNKS_PER_DEV: usize = CHUNK_TABLE_BYTES / CHUNK_ENTRY_SIZE;

/// Persisted super-block at offset zero of every device.
///
/// Encoded little-endian, padded to `disk_align_size`:
///
/// ```text
///  0..8   magic
///  8..12  version
/// 12..28  device UUID (big-endian bytes)
/// 28..44  system UUID (big-endian bytes)
/// 44..48  device index
/// 48..56  chunk-table offset
/// 56..60  chunk-table entry count
/// 60..64  CRC32C over bytes 0..60
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHeader {
    pub version: u32,
    pub device_uuid: StoreUuid,
    pub system_uuid: StoreUuid,
    pub device_idx: u32,
    pub chunk_table_offset: u64,
    pub chunk_count: u32,
}

impl DeviceHeader {
    #[must_use]
    pub fn encode(&self) -> AlignedBuf {
        let mut buf = AlignedBuf::new(DISK_ALIGN_SIZE, DISK_ALIGN_SIZE);
        let bytes = buf.as_mut_slice();
        bytes[0..8].copy_from_slice(&DEV_HDR_MAGIC);
        bytes[8..12].copy_from_slice(&self.version.to_le_bytes());
        bytes[12..28].copy_from_slice(&self.device_uuid.to_bytes_be());
        bytes[28..44].copy_from_slice(&self.system_uuid.to_bytes_be());
        bytes[44..48].copy_from_slice(&self.device_idx.to_le_bytes());
        bytes[48..56].copy_from_slice(&self.chunk_table_offset.to_le_bytes());
        bytes[56..60].copy_from_slice(&self.chunk_count.to_le_bytes());
        let crc = crc32c::crc32c(&bytes[..DEV_HDR_BODY_LEN]);
        bytes[60..64].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8], dev: DevId) -> Result<Self> {
        if bytes.len() < DISK_ALIGN_SIZE {
            return Err(StrataError::CorruptMetadata {
                dev: dev.0,
                detail: format!("header block truncated to {} bytes", bytes.len()),
            });
        }
        if bytes[0..8] != DEV_HDR_MAGIC {
            return Err(StrataError::CorruptMetadata {
                dev: dev.0,
                detail: "bad header magic".to_owned(),
            });
        }
        let stored = u32::from_le_bytes(bytes[60..64].try_into().expect("sliced to 4 bytes"));
        let computed = crc32c::crc32c(&bytes[..DEV_HDR_BODY_LEN]);
        if stored != computed {
            return Err(StrataError::ChecksumMismatch { stored, computed });
        }
        let version = u32::from_le_bytes(bytes[8..12].try_into().expect("sliced to 4 bytes"));
        if version != DEV_HDR_VERSION {
            return Err(StrataError::CorruptMetadata {
                dev: dev.0,
                detail: format!("unsupported header version {version}"),
            });
        }
        Ok(Self {
            version,
            device_uuid: StoreUuid::from_bytes_be(
                bytes[12..28].try_into().expect("sliced to 16 bytes"),
            ),
            system_uuid: StoreUuid::from_bytes_be(
                bytes[28..44].try_into().expect("sliced to 16 bytes"),
            ),
            device_idx: u32::from_le_bytes(bytes[44..48].try_into().expect("sliced to 4 bytes")),
            chunk_table_offset: u64::from_le_bytes(
                bytes[48..56].try_into().expect("sliced to 8 bytes"),
            ),
            chunk_count: u32::from_le_bytes(bytes[56..60].try_into().expect("sliced to 4 bytes")),
        })
    }
}

// ── Physical device ─────────────────────────────────────────────────────────

/// One opened backing device (file or block device).
pub struct PhysicalDev {
    idx: DevId,
    path: PathBuf,
    engine: Arc<dyn IoEngine>,
    size: u64,
    uuid: StoreUuid,
}

impl PhysicalDev {
    #[must_use]
    pub fn idx(&self) -> DevId {
        self.idx
    }

    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn IoEngine> {
        &self.engine
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn uuid(&self) -> StoreUuid {
        self.uuid
    }
}

impl std::fmt::Debug for PhysicalDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDev")
            .field("idx", &self.idx)
            .field("path", &self.path)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

// ── Device config ───────────────────────────────────────────────────────────

fn default_is_file() -> bool {
    true
}

/// Device-pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Backing paths, one device each.
    pub devices: Vec<PathBuf>,
    /// Open mode; `Direct` bypasses the kernel page cache.
    #[serde(default)]
    pub open_flags: OpenFlags,
    /// Format the devices on open instead of validating headers.
    #[serde(default)]
    pub disk_init: bool,
    /// Files (size from metadata) vs. block devices (size from seek).
    #[serde(default = "default_is_file")]
    pub is_file: bool,
    /// Identity persisted into every device header.
    pub system_uuid: StoreUuid,
}

// ── Device manager ──────────────────────────────────────────────────────────

struct ChunkTable {
    chunks: Vec<ChunkInfo>,
    next_chunk_id: u16,
}

/// Owns the physical devices and the global chunk table.
pub struct DeviceManager {
    devices: Vec<Arc<PhysicalDev>>,
    system_uuid: StoreUuid,
    table: Mutex<ChunkTable>,
}

impl DeviceManager {
    /// Open (or, with `disk_init`, format) every configured device.
    ///
    /// Header validation failure aborts the mount.
    pub fn open(cx: &Cx, cfg: &DeviceConfig) -> Result<Self> {
        if cfg.devices.is_empty() {
            return Err(StrataError::InvalidDevice("no devices configured".to_owned()));
        }
        let mut engines: Vec<(PathBuf, Arc<dyn IoEngine>)> = Vec::new();
        for path in &cfg.devices {
            let engine = PreadPwriteEngine::open(path, cfg.open_flags)?;
            if cfg.is_file && engine.len_bytes() == 0 {
                return Err(StrataError::InvalidDevice(format!(
                    "{} is an empty file",
                    path.display()
                )));
            }
            let engine: Arc<dyn IoEngine> = Arc::new(engine);
            engines.push((path.clone(), engine));
        }
        Self::open_with_engines(cx, engines, cfg.system_uuid, cfg.disk_init)
    }

    /// Open over caller-supplied engines (tests use in-memory engines).
    pub fn open_with_engines(
        cx: &Cx,
        engines: Vec<(PathBuf, Arc<dyn IoEngine>)>,
        system_uuid: StoreUuid,
        disk_init: bool,
    ) -> Result<Self> {
        let mut devices = Vec::with_capacity(engines.len());
        let mut chunks: Vec<ChunkInfo> = Vec::new();

        for (pos, (path, engine)) in engines.into_iter().enumerate() {
            cx_checkpoint(cx)?;
            let idx = DevId(u16::try_from(pos).map_err(|_| {
                StrataError::InvalidDevice("more than 65535 devices".to_owned())
            })?);
            let size = engine.len_bytes();
            if size < DATA_START_OFFSET {
                return Err(StrataError::InvalidDevice(format!(
                    "{} too small for the device header region",
                    path.display()
                )));
            }

            let dev = if disk_init {
                Self::format_device(idx, path, engine, size, system_uuid)?
            } else {
                Self::load_device(idx, path, engine, size, system_uuid, &mut chunks)?
            };
            devices.push(Arc::new(dev));
        }

        // Mount-time invariant: chunks on one device never overlap.
        for (i, a) in chunks.iter().enumerate() {
            for b in &chunks[i + 1..] {
                if a.overlaps(b) {
                    return Err(StrataError::CorruptMetadata {
                        dev: a.device_idx.0,
                        detail: format!(
                            "chunks {} and {} overlap",
                            a.chunk_id.0, b.chunk_id.0
                        ),
                    });
                }
            }
        }

        let next_chunk_id = chunks
            .iter()
            .map(|c| c.chunk_id.0 + 1)
            .max()
            .unwrap_or(0);
        info!(
            target: "strata::device",
            event = "manager_open",
            devices = devices.len(),
            chunks = chunks.len(),
            formatted = disk_init
        );
        Ok(Self {
            devices,
            system_uuid,
            table: Mutex::new(ChunkTable {
                chunks,
                next_chunk_id,
            }),
        })
    }

    fn format_device(
        idx: DevId,
        path: PathBuf,
        engine: Arc<dyn IoEngine>,
        size: u64,
        system_uuid: StoreUuid,
    ) -> Result<PhysicalDev> {
        // Device identity: system identity mixed with the slot index.
        let device_uuid = StoreUuid(system_uuid.0 ^ (u128::from(idx.0) + 1).rotate_left(64));
        let header = DeviceHeader {
            version: DEV_HDR_VERSION,
            device_uuid,
            system_uuid,
            device_idx: u32::from(idx.0),
            chunk_table_offset: CHUNK_TABLE_OFFSET,
            chunk_count: 0,
        };
        engine_write(engine.as_ref(), 0, Arc::new(header.encode()))?;
        // Wipe the chunk-table region.
        engine_write(
            engine.as_ref(),
            CHUNK_TABLE_OFFSET,
            Arc::new(AlignedBuf::new(CHUNK_TABLE_BYTES, DISK_ALIGN_SIZE)),
        )?;
        engine_sync(engine.as_ref())?;
        debug!(target: "strata::device", event = "device_formatted", dev = idx.0, size);
        Ok(PhysicalDev {
            idx,
            path,
            engine,
            size,
            uuid: device_uuid,
        })
    }

    fn load_device(
        idx: DevId,
        path: PathBuf,
        engine: Arc<dyn IoEngine>,
        size: u64,
        system_uuid: StoreUuid,
        chunks: &mut Vec<ChunkInfo>,
    ) -> Result<PhysicalDev> {
        let header_block = engine_read(engine.as_ref(), 0, DISK_ALIGN_SIZE)?;
        let header = DeviceHeader::decode(header_block.as_slice(), idx)?;
        if header.device_idx != u32::from(idx.0) {
            return Err(StrataError::InvalidDevice(format!(
                "{} carries device index {}, expected {}",
                path.display(),
                header.device_idx,
                idx.0
            )));
        }
        if !system_uuid.is_nil() && header.system_uuid != system_uuid {
            return Err(StrataError::InvalidDevice(format!(
                "{} belongs to a different system",
                path.display()
            )));
        }

        let count = header.chunk_count as usize;
        if count > MAX_CHUNKS_PER_DEV {
            return Err(StrataError::CorruptMetadata {
                dev: idx.0,
                detail: format!("chunk count {count} exceeds table capacity"),
            });
        }
        if count > 0 {
            let table = engine_read(
                engine.as_ref(),
                header.chunk_table_offset,
                CHUNK_TABLE_BYTES,
            )?;
            for slot in 0..count {
                let start = slot * CHUNK_ENTRY_SIZE;
                let info =
                    ChunkInfo::decode(&table.as_slice()[start..start + CHUNK_ENTRY_SIZE], idx)?;
                if info.device_idx != idx {
                    return Err(StrataError::CorruptMetadata {
                        dev: idx.0,
                        detail: format!(
                            "chunk {} claims device {}",
                            info.chunk_id.0, info.device_idx.0
                        ),
                    });
                }
                if info.start_offset < DATA_START_OFFSET || info.end_offset() > size {
                    return Err(StrataError::CorruptMetadata {
                        dev: idx.0,
                        detail: format!("chunk {} outside the data region", info.chunk_id.0),
                    });
                }
                chunks.push(info);
            }
        }
        debug!(
            target: "strata::device",
            event = "device_loaded",
            dev = idx.0,
            chunks = count
        );
        Ok(PhysicalDev {
            idx,
            path,
            engine,
            size,
            uuid: header.device_uuid,
        })
    }

    #[must_use]
    pub fn system_uuid(&self) -> StoreUuid {
        self.system_uuid
    }

    #[must_use]
    pub fn ndevices(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, idx: DevId) -> Result<Arc<PhysicalDev>> {
        self.devices
            .get(idx.0 as usize)
            .cloned()
            .ok_or_else(|| StrataError::InvalidDevice(format!("no device {}", idx.0)))
    }

    #[must_use]
    pub fn devices(&self) -> &[Arc<PhysicalDev>] {
        &self.devices
    }

    /// All chunks owned by `vdev_id`, ordered by chunk id.
    #[must_use]
    pub fn chunks_for_vdev(&self, vdev_id: VdevId) -> Vec<ChunkInfo> {
        let table = self.table.lock();
        let mut chunks: Vec<ChunkInfo> = table
            .chunks
            .iter()
            .filter(|c| c.vdev_id == vdev_id)
            .copied()
            .collect();
        chunks.sort_by_key(|c| c.chunk_id);
        chunks
    }

    /// Carve a new chunk of `size` bytes out of device `dev` for
    /// `vdev_id`, first-fit over the device's free regions.
    pub fn alloc_chunk(&self, dev: DevId, size: u64, vdev_id: VdevId) -> Result<ChunkInfo> {
        let device = self.device(dev)?;
        let mut table = self.table.lock();

        let dev_chunks_full = table
            .chunks
            .iter()
            .filter(|c| c.device_idx == dev)
            .count()
            >= MAX_CHUNKS_PER_DEV;
        if dev_chunks_full {
            return Err(StrataError::OutOfSpace);
        }

        let mut existing: Vec<(u64, u64)> = table
            .chunks
            .iter()
            .filter(|c| c.device_idx == dev)
            .map(|c| (c.start_offset, c.end_offset()))
            .collect();
        existing.sort_unstable();

        // First fit: walk the gaps between existing chunks.
        let mut cursor = DATA_START_OFFSET;
        let mut start = None;
        for (lo, hi) in existing {
            if lo.saturating_sub(cursor) >= size {
                start = Some(cursor);
                break;
            }
            cursor = cursor.max(hi);
        }
        if start.is_none() && device.size().saturating_sub(cursor) >= size {
            start = Some(cursor);
        }
        let Some(start_offset) = start else {
            warn!(
                target: "strata::device",
                event = "chunk_alloc_full",
                dev = dev.0,
                requested = size
            );
            return Err(StrataError::OutOfSpace);
        };

        let info = ChunkInfo {
            chunk_id: ChunkId(table.next_chunk_id),
            device_idx: dev,
            start_offset,
            size,
            vdev_id,
            flags: 0,
        };
        table.next_chunk_id = table.next_chunk_id.checked_add(1).ok_or_else(|| {
            StrataError::CorruptMetadata {
                dev: dev.0,
                detail: "chunk id space exhausted".to_owned(),
            }
        })?;
        table.chunks.push(info);
        debug!(
            target: "strata::device",
            event = "chunk_allocated",
            chunk = info.chunk_id.0,
            dev = dev.0,
            start = start_offset,
            size
        );
        Ok(info)
    }

    /// Rewrite every device's header and chunk table.
    pub fn flush_headers(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        let table = self.table.lock();
        for dev in &self.devices {
            let dev_chunks: Vec<&ChunkInfo> = table
                .chunks
                .iter()
                .filter(|c| c.device_idx == dev.idx)
                .collect();

            let mut table_buf = AlignedBuf::new(CHUNK_TABLE_BYTES, DISK_ALIGN_SIZE);
            for (slot, info) in dev_chunks.iter().enumerate() {
                let start = slot * CHUNK_ENTRY_SIZE;
                info.encode_into(&mut table_buf.as_mut_slice()[start..start + CHUNK_ENTRY_SIZE]);
            }

            let header = DeviceHeader {
                version: DEV_HDR_VERSION,
                device_uuid: dev.uuid,
                system_uuid: self.system_uuid,
                device_idx: u32::from(dev.idx.0),
                chunk_table_offset: CHUNK_TABLE_OFFSET,
                chunk_count: u32::try_from(dev_chunks.len()).expect("bounded by table capacity"),
            };
            engine_write(dev.engine.as_ref(), CHUNK_TABLE_OFFSET, Arc::new(table_buf))?;
            engine_write(dev.engine.as_ref(), 0, Arc::new(header.encode()))?;
            engine_sync(dev.engine.as_ref())?;
        }
        debug!(target: "strata::device", event = "headers_flushed");
        Ok(())
    }

    /// Flush headers and log the close. Engines close when the last
    /// reference drops.
    pub fn shutdown(&self, cx: &Cx) -> Result<()> {
        self.flush_headers(cx)?;
        info!(target: "strata::device", event = "manager_shutdown");
        Ok(())
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("devices", &self.devices.len())
            .field("chunks", &self.table.lock().chunks.len())
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use strata_io::MemIoEngine;

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn mem_engines(count: usize, size: usize) -> Vec<(PathBuf, Arc<dyn IoEngine>)> {
        (0..count)
            .map(|i| {
                (
                    PathBuf::from(format!("/mem/dev{i}")),
                    Arc::new(MemIoEngine::new(size)) as Arc<dyn IoEngine>,
                )
            })
            .collect()
    }

    const UUID: StoreUuid = StoreUuid(0xABCD_EF01_2345_6789);

    #[test]
    fn header_encode_decode_roundtrip() {
        let header = DeviceHeader {
            version: 1,
            device_uuid: StoreUuid(42),
            system_uuid: UUID,
            device_idx: 3,
            chunk_table_offset: CHUNK_TABLE_OFFSET,
            chunk_count: 5,
        };
        let buf = header.encode();
        assert_eq!(buf.len(), DISK_ALIGN_SIZE);
        assert_eq!(DeviceHeader::decode(buf.as_slice(), DevId(3)).unwrap(), header);
    }

    #[test]
    fn header_rejects_bad_magic_and_crc() {
        let header = DeviceHeader {
            version: 1,
            device_uuid: StoreUuid(1),
            system_uuid: UUID,
            device_idx: 0,
            chunk_table_offset: CHUNK_TABLE_OFFSET,
            chunk_count: 0,
        };
        let mut buf = header.encode();

        let mut corrupted = buf.as_slice().to_vec();
        corrupted[0] = b'X';
        assert!(matches!(
            DeviceHeader::decode(&corrupted, DevId(0)),
            Err(StrataError::CorruptMetadata { .. })
        ));

        // Flip a body byte: magic intact, CRC mismatch.
        buf.as_mut_slice()[45] ^= 0xFF;
        assert!(matches!(
            DeviceHeader::decode(buf.as_slice(), DevId(0)),
            Err(StrataError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn format_then_reopen_roundtrips_chunks() {
        let cx = test_cx();
        let engines = mem_engines(2, 1 << 20);
        let reuse: Vec<_> = engines.clone();

        let mgr = DeviceManager::open_with_engines(&cx, engines, UUID, true).unwrap();
        let c0 = mgr.alloc_chunk(DevId(0), 256 * 1024, VdevId(1)).unwrap();
        let c1 = mgr.alloc_chunk(DevId(1), 256 * 1024, VdevId(1)).unwrap();
        assert_ne!(c0.chunk_id, c1.chunk_id);
        mgr.shutdown(&cx).unwrap();

        // Reopen without disk_init: headers and chunk table must load.
        let mgr2 = DeviceManager::open_with_engines(&cx, reuse, UUID, false).unwrap();
        let chunks = mgr2.chunks_for_vdev(VdevId(1));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], c0);
        assert_eq!(chunks[1], c1);
    }

    #[test]
    fn reopen_with_wrong_system_uuid_fails() {
        let cx = test_cx();
        let engines = mem_engines(1, 1 << 20);
        let reuse: Vec<_> = engines.clone();

        let mgr = DeviceManager::open_with_engines(&cx, engines, UUID, true).unwrap();
        mgr.shutdown(&cx).unwrap();

        let err = DeviceManager::open_with_engines(&cx, reuse, StoreUuid(999), false).unwrap_err();
        assert!(matches!(err, StrataError::InvalidDevice(_)));
    }

    #[test]
    fn unformatted_device_fails_mount() {
        let cx = test_cx();
        let engines = mem_engines(1, 1 << 20);
        let err = DeviceManager::open_with_engines(&cx, engines, UUID, false).unwrap_err();
        assert!(matches!(err, StrataError::CorruptMetadata { .. }));
    }

    #[test]
    fn chunk_alloc_first_fit_and_exhaustion() {
        let cx = test_cx();
        // Data region: 1 MiB - 8 KiB.
        let mgr =
            DeviceManager::open_with_engines(&cx, mem_engines(1, 1 << 20), UUID, true).unwrap();

        let a = mgr.alloc_chunk(DevId(0), 512 * 1024, VdevId(0)).unwrap();
        assert_eq!(a.start_offset, DATA_START_OFFSET);
        let b = mgr.alloc_chunk(DevId(0), 256 * 1024, VdevId(0)).unwrap();
        assert_eq!(b.start_offset, a.end_offset());

        // Remaining space is under 512 KiB.
        assert!(matches!(
            mgr.alloc_chunk(DevId(0), 512 * 1024, VdevId(0)),
            Err(StrataError::OutOfSpace)
        ));
    }

    #[test]
    fn alloc_chunk_unknown_device() {
        let cx = test_cx();
        let mgr =
            DeviceManager::open_with_engines(&cx, mem_engines(1, 1 << 20), UUID, true).unwrap();
        assert!(matches!(
            mgr.alloc_chunk(DevId(5), 4096, VdevId(0)),
            Err(StrataError::InvalidDevice(_))
        ));
    }
}
