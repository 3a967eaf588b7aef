#![forbid(unsafe_code)]
//! Core types and constants shared across the VDO toolkit.
//!
//! Defines the physical-block-number newtype, the fixed constants of the
//! on-disk format revision, and the little-endian slice codecs every
//! metadata encoder and decoder is built from.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of every VDO block, on disk and in memory.
pub const VDO_BLOCK_SIZE: usize = 4096;

/// `VDO_BLOCK_SIZE` as a block-count-friendly width.
pub const VDO_BLOCK_SIZE_U64: u64 = VDO_BLOCK_SIZE as u64;

/// Magic string identifying a volume-geometry block at PBN 0.
pub const GEOMETRY_MAGIC: [u8; 8] = *b"dmvdo001";

/// The single release version this toolkit reads and writes.
pub const CURRENT_RELEASE_VERSION: u32 = 133_524;

/// Number of logical-to-physical entries held by one block-map page.
pub const BLOCK_MAP_ENTRIES_PER_PAGE: u64 = 812;

/// Number of block-map trees a volume is divided across.
pub const DEFAULT_BLOCK_MAP_TREE_ROOT_COUNT: u64 = 60;

/// Smallest supported slab: 2^19 bytes expressed in blocks.
pub const MINIMUM_SLAB_BLOCKS: u64 = (1 << 19) / VDO_BLOCK_SIZE_U64;

/// Largest supported slab, as a bit count (slabs are powers of two).
pub const MAX_SLAB_BITS: u32 = 23;

/// Fewest blocks a slab journal may occupy.
pub const MINIMUM_SLAB_JOURNAL_BLOCKS: u64 = 8;

/// Reference counts are one byte each, so a block holds this many.
pub const REFERENCE_COUNTS_PER_BLOCK: u64 = VDO_BLOCK_SIZE_U64;

/// Hard ceiling on the number of slabs in a depot.
pub const MAX_SLABS: u64 = 8192;

/// Number of physical zones the slab summary reserves space for.
pub const MAX_PHYSICAL_ZONES: u64 = 16;

/// A zero-based block offset into the backing device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PhysicalBlockNumber(pub u64);

impl PhysicalBlockNumber {
    /// Advance by a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Retreat by a block count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, count: u64) -> Option<Self> {
        self.0.checked_sub(count).map(Self)
    }

    /// Byte offset of this block at the standard block size.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<u64> {
        self.0.checked_mul(VDO_BLOCK_SIZE_U64)
    }
}

impl fmt::Display for PhysicalBlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A count of blocks.
pub type BlockCount = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn put_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn put_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn put_fixed<const N: usize>(
    data: &mut [u8],
    offset: usize,
    value: &[u8; N],
) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, N)?.copy_from_slice(value);
    Ok(())
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// The largest power of two that divides `value`, capped at `limit`.
///
/// `value` must be non-zero and `limit` a power of two.
#[must_use]
pub fn largest_power_of_two_divisor(value: u64, limit: u64) -> u64 {
    debug_assert!(value != 0);
    debug_assert!(limit.is_power_of_two());
    let divisor = 1_u64 << value.trailing_zeros();
    divisor.min(limit)
}
