#![forbid(unsafe_code)]
//! Per-slab arithmetic.
//!
//! A slab is a power-of-two-sized region of the depot whose journal and
//! reference-count blocks live at its tail, leaving the data blocks as
//! the leading contiguous region.

use serde::{Deserialize, Serialize};
use vdo_error::{Result, VdoError};
use vdo_types::{
    MAX_SLAB_BITS, MINIMUM_SLAB_BLOCKS, MINIMUM_SLAB_JOURNAL_BLOCKS, REFERENCE_COUNTS_PER_BLOCK,
};

/// Derived division of one slab into journal, refcount, and data blocks.
///
/// Invariant: `slab_journal_blocks + reference_count_blocks + data_blocks
/// == slab_blocks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabConfig {
    pub slab_blocks: u64,
    pub data_blocks: u64,
    pub reference_count_blocks: u64,
    pub slab_journal_blocks: u64,
}

/// Compute the configuration of every slab in a depot.
pub fn configure_slab(slab_size: u64, slab_journal_blocks: u64) -> Result<SlabConfig> {
    if !slab_size.is_power_of_two()
        || slab_size < MINIMUM_SLAB_BLOCKS
        || slab_size > (1 << MAX_SLAB_BITS)
    {
        return Err(VdoError::OutOfRange(format!(
            "slab size {slab_size} must be a power of two in [{MINIMUM_SLAB_BLOCKS}, 2^{MAX_SLAB_BITS}] blocks"
        )));
    }
    if slab_journal_blocks < MINIMUM_SLAB_JOURNAL_BLOCKS {
        return Err(VdoError::OutOfRange(format!(
            "slab journal of {slab_journal_blocks} blocks is below the minimum of \
             {MINIMUM_SLAB_JOURNAL_BLOCKS}"
        )));
    }
    if slab_journal_blocks >= slab_size / 2 {
        return Err(VdoError::OutOfRange(format!(
            "slab journal of {slab_journal_blocks} blocks must be less than half the slab \
             of {slab_size}"
        )));
    }

    let counted = slab_size - slab_journal_blocks;
    let reference_count_blocks = counted.div_ceil(REFERENCE_COUNTS_PER_BLOCK);
    let data_blocks = slab_size - slab_journal_blocks - reference_count_blocks;
    if data_blocks == 0 {
        return Err(VdoError::OutOfRange(format!(
            "slab of {slab_size} blocks leaves no data blocks after metadata"
        )));
    }

    Ok(SlabConfig {
        slab_blocks: slab_size,
        data_blocks,
        reference_count_blocks,
        slab_journal_blocks,
    })
}

/// Hint bits available in a slab-summary entry.
const FULLNESS_HINT_BITS: u32 = 6;

/// One slab's entry in the slab summary.
///
/// Packs to two bytes: the journal tail offset and a flag byte holding
/// the load-refcounts bit, the dirty bit, and a six-bit fullness hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlabSummaryEntry {
    pub tail_block_offset: u8,
    pub load_ref_counts: bool,
    pub is_dirty: bool,
    pub fullness_hint: u8,
}

impl SlabSummaryEntry {
    /// Entry written for every slab of a freshly formatted volume.
    #[must_use]
    pub fn fresh(slab_config: &SlabConfig) -> Self {
        Self {
            tail_block_offset: 0,
            load_ref_counts: false,
            is_dirty: false,
            fullness_hint: compress_fullness_hint(
                slab_config.data_blocks,
                slab_config.slab_blocks,
            ),
        }
    }

    #[must_use]
    pub fn encode(self) -> [u8; 2] {
        let mut flags = (self.fullness_hint & 0x3F) << 2;
        if self.load_ref_counts {
            flags |= 1 << 0;
        }
        if self.is_dirty {
            flags |= 1 << 1;
        }
        [self.tail_block_offset, flags]
    }

    #[must_use]
    pub fn decode(bytes: [u8; 2]) -> Self {
        Self {
            tail_block_offset: bytes[0],
            load_ref_counts: bytes[1] & (1 << 0) != 0,
            is_dirty: bytes[1] & (1 << 1) != 0,
            fullness_hint: bytes[1] >> 2,
        }
    }
}

/// Compress a free-block count into the six hint bits.
///
/// The shift discards the low bits of the count so that a full range of
/// slab sizes maps onto the same hint scale.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // shifted value fits the hint bits
pub fn compress_fullness_hint(free_blocks: u64, slab_blocks: u64) -> u8 {
    let slab_bits = slab_blocks.trailing_zeros();
    let hint_shift = slab_bits.saturating_sub(FULLNESS_HINT_BITS);
    let hint = free_blocks >> hint_shift;
    hint.min((1 << FULLNESS_HINT_BITS) - 1) as u8
}
