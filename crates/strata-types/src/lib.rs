#![forbid(unsafe_code)]
//! Core value types shared across the strata workspace.
//!
//! Everything here is a plain value: packed block identifiers, validated
//! block sizes, and unit-carrying newtypes that keep bytes, blocks, and
//! device indexes from being mixed up silently.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default virtual-device block size in bytes.
pub const DEFAULT_BLK_SIZE: u32 = 8192;

/// Physical alignment for device I/O and buffer memory.
pub const DISK_ALIGN_SIZE: usize = 4096;

/// Largest page the device commits atomically.
pub const ATOMIC_PAGE_SIZE: u32 = 8192;

/// Upper bound, in blocks, of a single block-store read window.
pub const MAX_READ_BLKS: u32 = 256;

/// Parse/validation failures for on-disk and config values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("truncated input: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

// ── Packed block identifier ─────────────────────────────────────────────────

/// Identifier of a contiguous run of blocks on one chunk.
///
/// Packs into 64 bits as:
///
/// ```text
/// bits  0..32   id      block index within the chunk
/// bits 32..40   nblks   run length
/// bits 40..56   chunk   chunk index
/// bits 56..64   zero    reserved
/// ```
///
/// The packed form is the only representation that ever crosses a
/// serialization boundary; in-memory code uses the fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlkId {
    id: u32,
    nblks: u8,
    chunk: u16,
}

impl BlkId {
    #[must_use]
    pub fn new(id: u32, nblks: u8, chunk: ChunkId) -> Self {
        Self {
            id,
            nblks,
            chunk: chunk.0,
        }
    }

    /// Block index within the owning chunk.
    #[must_use]
    pub fn id(self) -> u32 {
        self.id
    }

    /// Run length in blocks.
    #[must_use]
    pub fn nblks(self) -> u8 {
        self.nblks
    }

    /// Owning chunk.
    #[must_use]
    pub fn chunk(self) -> ChunkId {
        ChunkId(self.chunk)
    }

    /// One past the last block index of the run.
    #[must_use]
    pub fn end_blk(self) -> u32 {
        self.id + u32::from(self.nblks)
    }

    /// Identifier of a sub-run: `blk_offset` blocks in, `nblks` long.
    ///
    /// Callers must keep the sub-run inside the parent run.
    #[must_use]
    pub fn sub_id(self, blk_offset: u8, nblks: u8) -> Self {
        debug_assert!(u32::from(blk_offset) + u32::from(nblks) <= u32::from(self.nblks));
        Self {
            id: self.id + u32::from(blk_offset),
            nblks,
            chunk: self.chunk,
        }
    }

    /// Pack into the canonical 64-bit form.
    #[must_use]
    pub fn encode(self) -> u64 {
        u64::from(self.id) | (u64::from(self.nblks) << 32) | (u64::from(self.chunk) << 40)
    }

    /// Unpack from the canonical 64-bit form.
    ///
    /// The reserved top byte must be zero.
    #[expect(clippy::cast_possible_truncation)]
    pub fn decode(raw: u64) -> Result<Self, ParseError> {
        if raw >> 56 != 0 {
            return Err(ParseError::InvalidField {
                field: "blk_id",
                reason: "reserved bits set",
            });
        }
        Ok(Self {
            id: raw as u32,
            nblks: (raw >> 32) as u8,
            chunk: (raw >> 40) as u16,
        })
    }
}

impl fmt::Display for BlkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk[{}+{}@c{}]", self.id, self.nblks, self.chunk)
    }
}

// ── Unit newtypes ───────────────────────────────────────────────────────────

/// Globally unique chunk index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub u16);

/// Physical device index within the device manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevId(pub u16);

/// Virtual-device index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VdevId(pub u16);

/// Byte offset on a device or logical address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 128-bit identity persisted in device headers (device or system scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreUuid(pub u128);

impl StoreUuid {
    #[must_use]
    pub fn from_bytes_be(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }

    #[must_use]
    pub fn to_bytes_be(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    #[must_use]
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }
}

// ── Validated block size ────────────────────────────────────────────────────

/// Validated block size: a power of two in `4096..=65536`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(4096..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two in 4096..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Bits to shift when converting between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Byte offset of block `blk` (relative to a region start).
    #[must_use]
    pub fn blk_to_byte(self, blk: u32) -> u64 {
        u64::from(blk) << u64::from(self.shift())
    }

    /// Number of blocks needed to cover `bytes` (rounded up).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn blks_for_bytes(self, bytes: u64) -> u32 {
        bytes.div_ceil(u64::from(self.0)) as u32
    }

    /// Whether `value` lies on a block boundary.
    #[must_use]
    pub fn is_aligned(self, value: u64) -> bool {
        value & (u64::from(self.0) - 1) == 0
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(DEFAULT_BLK_SIZE)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blk_id_encode_decode_roundtrip() {
        let bid = BlkId::new(0xDEAD_BEEF, 0x7F, ChunkId(0x1234));
        let raw = bid.encode();
        assert_eq!(BlkId::decode(raw).unwrap(), bid);
    }

    #[test]
    fn blk_id_bit_layout() {
        let bid = BlkId::new(1, 2, ChunkId(3));
        // id in low 32 bits, nblks in the next byte, chunk above that.
        assert_eq!(bid.encode(), 1 | (2 << 32) | (3 << 40));
    }

    #[test]
    fn blk_id_decode_rejects_reserved_bits() {
        let raw = 1_u64 << 60;
        assert!(matches!(
            BlkId::decode(raw),
            Err(ParseError::InvalidField { field: "blk_id", .. })
        ));
    }

    #[test]
    fn blk_id_equality_is_field_wise() {
        let a = BlkId::new(10, 4, ChunkId(1));
        let b = BlkId::new(10, 4, ChunkId(1));
        let c = BlkId::new(10, 4, ChunkId(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn blk_id_sub_id() {
        let bid = BlkId::new(100, 16, ChunkId(7));
        let sub = bid.sub_id(4, 8);
        assert_eq!(sub.id(), 104);
        assert_eq!(sub.nblks(), 8);
        assert_eq!(sub.chunk(), ChunkId(7));
        assert_eq!(bid.end_blk(), 116);
    }

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(8192).is_ok());
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(6000).is_err());
        assert!(BlockSize::new(2048).is_err());
        assert!(BlockSize::new(131_072).is_err());
    }

    #[test]
    fn block_size_conversions() {
        let bs = BlockSize::new(8192).unwrap();
        assert_eq!(bs.shift(), 13);
        assert_eq!(bs.blk_to_byte(3), 24576);
        assert_eq!(bs.blks_for_bytes(1), 1);
        assert_eq!(bs.blks_for_bytes(8192), 1);
        assert_eq!(bs.blks_for_bytes(8193), 2);
        assert!(bs.is_aligned(16384));
        assert!(!bs.is_aligned(16383));
    }

    #[test]
    fn store_uuid_bytes_roundtrip() {
        let uuid = StoreUuid(0x0011_2233_4455_6677_8899_AABB_CCDD_EEFF);
        assert_eq!(StoreUuid::from_bytes_be(uuid.to_bytes_be()), uuid);
        assert!(!uuid.is_nil());
        assert!(StoreUuid(0).is_nil());
    }
}
