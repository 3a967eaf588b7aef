#![forbid(unsafe_code)]
//! The format sequence: validate, lay out, zero, seed, commit.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;
use vdo_error::{Result, VdoError};
use vdo_geometry::{IndexConfig, VolumeGeometry, clear_geometry, write_geometry};
use vdo_layer::PhysicalLayer;
use vdo_layout::{
    Partition, PartitionId, SlabConfig, SlabSummaryEntry, VdoLayout, block_map_page_count,
    compute_logical_blocks, configure_slab, make_layout, slab_summary_size,
};
use vdo_superblock::{
    SlabDepotState, SuperBlock, VdoComponent, VdoConfig, VdoState, write_super_block,
};
use vdo_types::{
    DEFAULT_BLOCK_MAP_TREE_ROOT_COUNT, MAX_PHYSICAL_ZONES, MAX_SLABS, PhysicalBlockNumber,
    VDO_BLOCK_SIZE_U64, largest_power_of_two_divisor, u64_to_usize,
};

/// Ceiling on the logical address space: 4 PB of 4 KiB blocks.
const MAXIMUM_LOGICAL_BLOCKS: u64 = 1 << 40;

/// Fewest blocks a recovery journal may occupy.
const MINIMUM_RECOVERY_JOURNAL_BLOCKS: u64 = 8;

/// Largest number of blocks zeroed per write while clearing a partition.
const MAX_ZERO_CHUNK_BLOCKS: u64 = 4096;

/// User-facing configuration accepted by the format driver.
///
/// A zero `physical_blocks` means "use the whole device"; a zero
/// `logical_blocks` means "derive the maximum logical capacity".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatConfig {
    pub physical_blocks: u64,
    pub logical_blocks: u64,
    pub slab_size: u64,
    pub slab_journal_blocks: u64,
    pub recovery_journal_size: u64,
    pub index_config: Option<IndexConfig>,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            physical_blocks: 0,
            logical_blocks: 0,
            // 2 GiB slabs, the upstream default.
            slab_size: 524_288,
            slab_journal_blocks: 224,
            // 32 MiB journal.
            recovery_journal_size: 8192,
            index_config: None,
        }
    }
}

struct ValidatedConfig {
    physical_blocks: u64,
    logical_blocks: u64,
    slab_config: SlabConfig,
    recovery_journal_size: u64,
    index_config: Option<IndexConfig>,
}

fn validate_config(config: &FormatConfig, device_blocks: u64) -> Result<ValidatedConfig> {
    let physical_blocks = if config.physical_blocks == 0 {
        device_blocks
    } else if config.physical_blocks == device_blocks {
        config.physical_blocks
    } else {
        return Err(VdoError::OutOfRange(format!(
            "configured physical size of {} blocks does not match the device's {device_blocks}",
            config.physical_blocks
        )));
    };

    let slab_config = configure_slab(config.slab_size, config.slab_journal_blocks)?;

    if config.recovery_journal_size < MINIMUM_RECOVERY_JOURNAL_BLOCKS
        || !config.recovery_journal_size.is_power_of_two()
    {
        return Err(VdoError::OutOfRange(format!(
            "recovery journal of {} blocks must be a power of two of at least \
             {MINIMUM_RECOVERY_JOURNAL_BLOCKS}",
            config.recovery_journal_size
        )));
    }

    if config.logical_blocks > MAXIMUM_LOGICAL_BLOCKS {
        return Err(VdoError::OutOfRange(format!(
            "logical size of {} blocks exceeds the maximum of {MAXIMUM_LOGICAL_BLOCKS}",
            config.logical_blocks
        )));
    }

    // The data region must at least hold the super block, a roots-only
    // block map, one slab, the journal, and the slab summary.
    let index_blocks = config
        .index_config
        .as_ref()
        .map_or(0, IndexConfig::index_blocks);
    let minimum = 1 + index_blocks
        + 1
        + DEFAULT_BLOCK_MAP_TREE_ROOT_COUNT
        + config.slab_size
        + config.recovery_journal_size
        + slab_summary_size(VDO_BLOCK_SIZE_U64);
    if physical_blocks < minimum {
        return Err(VdoError::OutOfRange(format!(
            "device of {physical_blocks} blocks is below the minimum of {minimum} for this \
             configuration"
        )));
    }

    Ok(ValidatedConfig {
        physical_blocks,
        logical_blocks: config.logical_blocks,
        slab_config,
        recovery_journal_size: config.recovery_journal_size,
        index_config: config.index_config,
    })
}

/// A 64-bit nonce derived from the clock and the thread RNG, so that two
/// formats of the same device are distinguishable.
fn generate_nonce() -> u64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    micros ^ rand::random::<u64>()
}

/// Format a VDO volume with a freshly drawn nonce and UUID.
pub fn format(config: &FormatConfig, layer: &dyn PhysicalLayer) -> Result<()> {
    format_with_nonce(config, layer, generate_nonce(), Uuid::new_v4())
}

/// Format a VDO volume with the caller's nonce and UUID.
///
/// Write order is the commit protocol: the geometry block is zeroed
/// before any metadata is written and rewritten only after every other
/// write has succeeded, so a torn format leaves an unrecognisable
/// device.
pub fn format_with_nonce(
    config: &FormatConfig,
    layer: &dyn PhysicalLayer,
    nonce: u64,
    uuid: Uuid,
) -> Result<()> {
    let validated = validate_config(config, layer.block_count())?;
    let geometry = VolumeGeometry::build(
        nonce,
        uuid,
        validated.index_config,
        validated.physical_blocks,
    )?;

    clear_geometry(layer)?;

    let (layout, logical_blocks) = configure_layout(&validated, &geometry)?;
    let depot = layout.partition(PartitionId::BlockAllocator);
    let slab_count = depot.length / validated.slab_config.slab_blocks;
    if slab_count > MAX_SLABS {
        return Err(VdoError::OutOfRange(format!(
            "{slab_count} slabs exceed the depot maximum of {MAX_SLABS}"
        )));
    }
    info!(
        target: "vdo::format",
        event = "layout_configured",
        physical_blocks = validated.physical_blocks,
        logical_blocks,
        slab_count,
        depot_start = depot.offset.0
    );

    clear_partition(layer, &layout, PartitionId::BlockMap)?;
    clear_partition(layer, &layout, PartitionId::RecoveryJournal)?;
    write_initial_slab_summary(
        layer,
        layout.partition(PartitionId::SlabSummary),
        &validated.slab_config,
        slab_count,
    )?;

    let super_block = SuperBlock::new(
        VdoComponent {
            state: VdoState::New,
            nonce,
            config: VdoConfig {
                logical_blocks,
                physical_blocks: validated.physical_blocks,
                slab_size: validated.slab_config.slab_blocks,
                recovery_journal_size: validated.recovery_journal_size,
                slab_journal_blocks: validated.slab_config.slab_journal_blocks,
            },
            complete_recoveries: 0,
            read_only_recoveries: 0,
        },
        SlabDepotState {
            first_block: depot.offset,
            slab_count,
            slab_config: validated.slab_config,
            zone_count: 1,
        },
    );
    write_super_block(layer, geometry.super_block_location(), &super_block)?;

    // Commit point: only now does the device identify as a VDO.
    write_geometry(layer, &geometry)?;
    info!(
        target: "vdo::format",
        event = "format_complete",
        nonce,
        uuid = %uuid,
        logical_blocks
    );
    Ok(())
}

/// Build the final layout, deriving the logical capacity when asked to
/// fill the device.
///
/// The layout starts one block past the data-region origin; that block
/// holds the super block. When `logical_blocks` is zero a provisional
/// layout with a roots-only block-map partition sizes the depot, the
/// logical capacity comes from the depot's data blocks less the forest
/// overhead, and the final layout is rebuilt from the derived value.
fn configure_layout(
    config: &ValidatedConfig,
    geometry: &VolumeGeometry,
) -> Result<(VdoLayout, u64)> {
    let layout_start = PhysicalBlockNumber(geometry.data_region.start.0 + 1);
    let summary_blocks = slab_summary_size(VDO_BLOCK_SIZE_U64);
    let root_count = DEFAULT_BLOCK_MAP_TREE_ROOT_COUNT;

    let logical_blocks = if config.logical_blocks == 0 {
        let provisional = make_layout(
            config.physical_blocks,
            layout_start,
            root_count,
            config.recovery_journal_size,
            summary_blocks,
            config.slab_config.slab_blocks,
        )?;
        let provisional_depot = provisional.partition(PartitionId::BlockAllocator);
        let slab_count = provisional_depot.length / config.slab_config.slab_blocks;
        let data_blocks = slab_count * config.slab_config.data_blocks;
        let derived = compute_logical_blocks(data_blocks, root_count)?;
        debug!(
            target: "vdo::format",
            event = "logical_derived",
            data_blocks,
            logical_blocks = derived
        );
        derived
    } else {
        config.logical_blocks
    };

    let block_map_blocks = block_map_page_count(logical_blocks, root_count);
    let layout = make_layout(
        config.physical_blocks,
        layout_start,
        block_map_blocks,
        config.recovery_journal_size,
        summary_blocks,
        config.slab_config.slab_blocks,
    )?;
    Ok((layout, logical_blocks))
}

/// Zero every block of a partition.
///
/// Writes run in chunks of the largest power-of-two divisor of the
/// partition size, capped at 4096 blocks, so each block is overwritten
/// exactly once. The first failing write aborts; nothing is rolled back
/// because the geometry has not yet been written.
pub(crate) fn clear_partition(
    layer: &dyn PhysicalLayer,
    layout: &VdoLayout,
    id: PartitionId,
) -> Result<()> {
    let partition = layout.partition(id);
    let chunk_blocks = largest_power_of_two_divisor(partition.length, MAX_ZERO_CHUNK_BLOCKS);
    let chunk_bytes = u64_to_usize(chunk_blocks * VDO_BLOCK_SIZE_U64, "zero chunk")?;
    let buffer = layer.allocate_io_buffer(chunk_bytes, "zero buffer")?;

    let mut pbn = partition.offset;
    let end = partition.end();
    while pbn < end {
        layer.write(pbn, chunk_blocks, buffer.as_slice())?;
        pbn = pbn
            .checked_add(chunk_blocks)
            .ok_or_else(|| VdoError::OutOfRange("partition end overflows".to_owned()))?;
    }
    debug!(
        target: "vdo::format",
        event = "partition_cleared",
        partition = ?id,
        blocks = partition.length,
        chunk_blocks
    );
    Ok(())
}

/// Seed the slab summary partition.
///
/// Zone 0 receives one fresh entry per slab (journal tail at the first
/// journal block, reference counts not yet loaded, full free-block
/// hint); the remaining entry slots and the other zones' blocks are
/// written as zeros.
fn write_initial_slab_summary(
    layer: &dyn PhysicalLayer,
    partition: &Partition,
    slab_config: &SlabConfig,
    slab_count: u64,
) -> Result<()> {
    let zone_blocks = partition.length / MAX_PHYSICAL_ZONES;
    let zone_bytes = u64_to_usize(zone_blocks * VDO_BLOCK_SIZE_U64, "summary zone")?;
    let mut zone = layer.allocate_io_buffer(zone_bytes, "slab summary zone")?;

    let entry = SlabSummaryEntry::fresh(slab_config).encode();
    let slots = u64_to_usize(slab_count, "slab count")?;
    for slot in 0..slots {
        zone.as_mut_slice()[slot * 2..slot * 2 + 2].copy_from_slice(&entry);
    }
    layer.write(partition.offset, zone_blocks, zone.as_slice())?;

    // The other zones hold no slabs yet; zero them in one pass.
    let rest_blocks = partition.length - zone_blocks;
    if rest_blocks > 0 {
        let rest_bytes = u64_to_usize(rest_blocks * VDO_BLOCK_SIZE_U64, "summary rest")?;
        let zeroes = layer.allocate_io_buffer(rest_bytes, "slab summary zero")?;
        let rest_start = PhysicalBlockNumber(partition.offset.0 + zone_blocks);
        layer.write(rest_start, rest_blocks, zeroes.as_slice())?;
    }
    debug!(
        target: "vdo::format",
        event = "slab_summary_seeded",
        slabs = slab_count,
        zone_blocks
    );
    Ok(())
}
