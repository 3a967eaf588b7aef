#![forbid(unsafe_code)]
//! The fixed partition layout of the data region.
//!
//! Four partitions are carved contiguously, in declared order, from
//! `[starting_offset, physical_blocks)`: block map, block allocator
//! (slab depot), recovery journal, slab summary. The depot length is
//! rounded down to a whole number of slabs; any remainder past the slab
//! summary is left unused.

use serde::{Deserialize, Serialize};
use vdo_error::{Result, VdoError};
use vdo_types::{MAX_PHYSICAL_ZONES, MAX_SLABS, PhysicalBlockNumber, align_down};

/// Identifiers of the four fixed partitions, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionId {
    BlockMap = 0,
    BlockAllocator = 1,
    RecoveryJournal = 2,
    SlabSummary = 3,
}

/// One partition of the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    pub offset: PhysicalBlockNumber,
    pub length: u64,
}

impl Partition {
    /// First block past the end of this partition.
    #[must_use]
    pub fn end(&self) -> PhysicalBlockNumber {
        PhysicalBlockNumber(self.offset.0 + self.length)
    }
}

/// The derived partition table of a volume. Never persisted; rebuilt
/// from the geometry and the volume config on every load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdoLayout {
    start: PhysicalBlockNumber,
    partitions: [Partition; 4],
}

impl VdoLayout {
    /// Block at which the layout begins (one past the super block).
    #[must_use]
    pub fn start(&self) -> PhysicalBlockNumber {
        self.start
    }

    /// Look up a partition by id.
    #[must_use]
    pub fn partition(&self, id: PartitionId) -> &Partition {
        &self.partitions[id as usize]
    }

    /// All partitions in on-disk order.
    #[must_use]
    pub fn partitions(&self) -> &[Partition; 4] {
        &self.partitions
    }
}

/// Blocks reserved for the slab summary: room for every possible slab's
/// two-byte entry, replicated for every physical zone.
#[must_use]
pub fn slab_summary_size(block_size: u64) -> u64 {
    MAX_SLABS * 2 / block_size * MAX_PHYSICAL_ZONES
}

/// Carve the four partitions from `[starting_offset, physical_blocks)`.
///
/// `block_map_blocks` is computed by the caller from the logical block
/// count (or from the tree root count alone during provisional sizing).
/// Fails with `OutOfRange` if the region cannot hold the three fixed
/// partitions and at least one whole slab.
pub fn make_layout(
    physical_blocks: u64,
    starting_offset: PhysicalBlockNumber,
    block_map_blocks: u64,
    recovery_journal_blocks: u64,
    slab_summary_blocks: u64,
    slab_size: u64,
) -> Result<VdoLayout> {
    if starting_offset.0 >= physical_blocks {
        return Err(VdoError::OutOfRange(format!(
            "layout offset {starting_offset} is beyond the device of {physical_blocks} blocks"
        )));
    }
    if block_map_blocks == 0 || recovery_journal_blocks == 0 || slab_summary_blocks == 0 {
        return Err(VdoError::OutOfRange(
            "every partition must hold at least one block".to_owned(),
        ));
    }

    let region = physical_blocks - starting_offset.0;
    let fixed = block_map_blocks
        .checked_add(recovery_journal_blocks)
        .and_then(|sum| sum.checked_add(slab_summary_blocks))
        .ok_or_else(|| VdoError::OutOfRange("partition sizes overflow".to_owned()))?;
    let Some(depot_region) = region.checked_sub(fixed) else {
        return Err(VdoError::OutOfRange(format!(
            "{region} blocks cannot hold {fixed} blocks of fixed partitions"
        )));
    };

    let depot_blocks = align_down(depot_region, slab_size).ok_or_else(|| {
        VdoError::OutOfRange(format!("slab size {slab_size} is not a power of two"))
    })?;
    if depot_blocks == 0 {
        return Err(VdoError::OutOfRange(format!(
            "{depot_region} remaining blocks cannot hold a single slab of {slab_size}"
        )));
    }

    let block_map = Partition {
        id: PartitionId::BlockMap,
        offset: starting_offset,
        length: block_map_blocks,
    };
    let block_allocator = Partition {
        id: PartitionId::BlockAllocator,
        offset: block_map.end(),
        length: depot_blocks,
    };
    let recovery_journal = Partition {
        id: PartitionId::RecoveryJournal,
        offset: block_allocator.end(),
        length: recovery_journal_blocks,
    };
    let slab_summary = Partition {
        id: PartitionId::SlabSummary,
        offset: recovery_journal.end(),
        length: slab_summary_blocks,
    };
    debug_assert!(slab_summary.end().0 <= physical_blocks);

    Ok(VdoLayout {
        start: starting_offset,
        partitions: [block_map, block_allocator, recovery_journal, slab_summary],
    })
}
