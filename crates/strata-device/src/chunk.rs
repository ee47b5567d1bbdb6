//! Chunk table entries and their fixed on-disk encoding.

use strata_error::{Result, StrataError};
use strata_types::{ChunkId, DevId, VdevId};

/// Fixed encoded size of one chunk-table entry.
pub const CHUNK_ENTRY_SIZE: usize = 26;

/// One contiguous region on a physical device, owned by one virtual
/// device. Created at format or vdev-creation time; never destroyed
/// during normal operation.
///
/// Encoded little-endian at fixed offsets:
///
/// ```text
///  0..2   chunk_id
///  2..4   device_idx
///  4..12  start_offset (bytes)
/// 12..20  size (bytes)
/// 20..22  vdev_id
/// 22..26  flags
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_id: ChunkId,
    pub device_idx: DevId,
    pub start_offset: u64,
    pub size: u64,
    pub vdev_id: VdevId,
    pub flags: u32,
}

impl ChunkInfo {
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.size
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.device_idx == other.device_idx
            && self.start_offset < other.end_offset()
            && other.start_offset < self.end_offset()
    }

    pub fn encode_into(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= CHUNK_ENTRY_SIZE);
        out[0..2].copy_from_slice(&self.chunk_id.0.to_le_bytes());
        out[2..4].copy_from_slice(&self.device_idx.0.to_le_bytes());
        out[4..12].copy_from_slice(&self.start_offset.to_le_bytes());
        out[12..20].copy_from_slice(&self.size.to_le_bytes());
        out[20..22].copy_from_slice(&self.vdev_id.0.to_le_bytes());
        out[22..26].copy_from_slice(&self.flags.to_le_bytes());
    }

    pub fn decode(bytes: &[u8], dev: DevId) -> Result<Self> {
        if bytes.len() < CHUNK_ENTRY_SIZE {
            return Err(StrataError::CorruptMetadata {
                dev: dev.0,
                detail: format!("chunk entry truncated to {} bytes", bytes.len()),
            });
        }
        let le_u16 = |range: std::ops::Range<usize>| {
            u16::from_le_bytes(bytes[range].try_into().expect("sliced to 2 bytes"))
        };
        let le_u64 = |range: std::ops::Range<usize>| {
            u64::from_le_bytes(bytes[range].try_into().expect("sliced to 8 bytes"))
        };
        let info = Self {
            chunk_id: ChunkId(le_u16(0..2)),
            device_idx: DevId(le_u16(2..4)),
            start_offset: le_u64(4..12),
            size: le_u64(12..20),
            vdev_id: VdevId(le_u16(20..22)),
            flags: u32::from_le_bytes(bytes[22..26].try_into().expect("sliced to 4 bytes")),
        };
        if info.size == 0 {
            return Err(StrataError::CorruptMetadata {
                dev: dev.0,
                detail: format!("chunk {} has zero size", info.chunk_id.0),
            });
        }
        Ok(info)
    }
}
