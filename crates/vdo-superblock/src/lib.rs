#![forbid(unsafe_code)]
//! The super block: one block at the start of the data region holding
//! the persisted component states of a VDO.
//!
//! Encodes the recovery-journal state, the slab-depot state, and the VDO
//! component (volume state, nonce, config, recovery counters) behind a
//! strictly version-gated header. The version is validated before the
//! checksum so a flipped version byte reports `UnsupportedVersion`, not
//! `BadChecksum`.
//!
//! On-disk layout of the first 4 KiB:
//!
//! ```text
//! 0..16    header {id=0, major=12, minor=0, size}
//! 16..20   release version (u32)
//! 20..24   CRC-32C over bytes 24..168
//! 24..40   recovery journal state {head u64, tail u64}
//! 40..96   slab depot state {first_block, slab_count, slab config (4 x u64),
//!          zone_count u32, pad u32}
//! 96..168  VDO component {state u8, pad, nonce, config (5 x u64),
//!          complete_recoveries u64, read_only_recoveries u64}
//! 168..    zero fill
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;
use vdo_codec::{
    ComponentId, Header, VersionNumber, block_checksum, require_block_len,
    validate_release_version, validate_version_exact, verify_checksum,
};
use vdo_error::{Result, VdoError};
use vdo_layer::PhysicalLayer;
use vdo_layout::SlabConfig;
use vdo_types::{
    CURRENT_RELEASE_VERSION, PhysicalBlockNumber, VDO_BLOCK_SIZE, put_le_u32, put_le_u64,
    read_le_u32, read_le_u64,
};

/// Version of the super-block format.
pub const SUPER_BLOCK_VERSION: VersionNumber = VersionNumber::new(12, 0);

const RELEASE_VERSION_OFFSET: usize = 16;
const CHECKSUM_OFFSET: usize = 20;
const JOURNAL_STATE_OFFSET: usize = 24;
const DEPOT_STATE_OFFSET: usize = 40;
const COMPONENT_OFFSET: usize = 96;

/// Total encoded length; everything beyond stays zero.
pub const SUPER_BLOCK_ENCODED_SIZE: usize = 168;

const SUPER_BLOCK_HEADER: Header = Header {
    id: ComponentId::SuperBlock,
    version: SUPER_BLOCK_VERSION,
    size: (SUPER_BLOCK_ENCODED_SIZE - 16) as u32,
};

/// Persisted operating state of a volume, stored as a one-byte tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VdoState {
    New = 0,
    Clean = 1,
    Dirty = 2,
    ReadOnlyMode = 3,
    ForceRebuild = 4,
    Recovering = 5,
    RebuildForUpgrade = 6,
    Replaying = 7,
}

impl VdoState {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::New,
            1 => Self::Clean,
            2 => Self::Dirty,
            3 => Self::ReadOnlyMode,
            4 => Self::ForceRebuild,
            5 => Self::Recovering,
            6 => Self::RebuildForUpgrade,
            7 => Self::Replaying,
            other => {
                return Err(VdoError::Corrupt(format!("unknown VDO state tag {other}")));
            }
        })
    }
}

/// The user-visible sizing configuration persisted with the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdoConfig {
    pub logical_blocks: u64,
    pub physical_blocks: u64,
    pub slab_size: u64,
    pub recovery_journal_size: u64,
    pub slab_journal_blocks: u64,
}

/// Persisted head/tail of the recovery journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryJournalState {
    pub head: u64,
    pub tail: u64,
}

impl RecoveryJournalState {
    /// State of a freshly formatted journal.
    #[must_use]
    pub fn fresh() -> Self {
        Self { head: 1, tail: 1 }
    }
}

/// Persisted shape of the slab depot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabDepotState {
    pub first_block: PhysicalBlockNumber,
    pub slab_count: u64,
    pub slab_config: SlabConfig,
    pub zone_count: u32,
}

/// The VDO component proper: volume identity and lifecycle counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdoComponent {
    pub state: VdoState,
    pub nonce: u64,
    pub config: VdoConfig,
    pub complete_recoveries: u64,
    pub read_only_recoveries: u64,
}

/// The decoded super block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub release_version: u32,
    pub journal: RecoveryJournalState,
    pub depot: SlabDepotState,
    pub component: VdoComponent,
}

impl SuperBlock {
    /// Assemble the super block of a freshly formatted volume.
    #[must_use]
    pub fn new(component: VdoComponent, depot: SlabDepotState) -> Self {
        Self {
            release_version: CURRENT_RELEASE_VERSION,
            journal: RecoveryJournalState::fresh(),
            depot,
            component,
        }
    }

    /// Encode into a full block.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut block = vec![0_u8; VDO_BLOCK_SIZE];
        SUPER_BLOCK_HEADER.encode_into(&mut block, 0)?;
        put_le_u32(&mut block, RELEASE_VERSION_OFFSET, self.release_version)?;

        put_le_u64(&mut block, JOURNAL_STATE_OFFSET, self.journal.head)?;
        put_le_u64(&mut block, JOURNAL_STATE_OFFSET + 8, self.journal.tail)?;

        let depot = DEPOT_STATE_OFFSET;
        put_le_u64(&mut block, depot, self.depot.first_block.0)?;
        put_le_u64(&mut block, depot + 8, self.depot.slab_count)?;
        put_le_u64(&mut block, depot + 16, self.depot.slab_config.slab_blocks)?;
        put_le_u64(&mut block, depot + 24, self.depot.slab_config.data_blocks)?;
        put_le_u64(
            &mut block,
            depot + 32,
            self.depot.slab_config.reference_count_blocks,
        )?;
        put_le_u64(
            &mut block,
            depot + 40,
            self.depot.slab_config.slab_journal_blocks,
        )?;
        put_le_u32(&mut block, depot + 48, self.depot.zone_count)?;

        let component = COMPONENT_OFFSET;
        block[component] = self.component.state.as_u8();
        put_le_u64(&mut block, component + 8, self.component.nonce)?;
        let config = &self.component.config;
        put_le_u64(&mut block, component + 16, config.logical_blocks)?;
        put_le_u64(&mut block, component + 24, config.physical_blocks)?;
        put_le_u64(&mut block, component + 32, config.slab_size)?;
        put_le_u64(&mut block, component + 40, config.recovery_journal_size)?;
        put_le_u64(&mut block, component + 48, config.slab_journal_blocks)?;
        put_le_u64(&mut block, component + 56, self.component.complete_recoveries)?;
        put_le_u64(
            &mut block,
            component + 64,
            self.component.read_only_recoveries,
        )?;

        let checksum = block_checksum(&block[JOURNAL_STATE_OFFSET..SUPER_BLOCK_ENCODED_SIZE]);
        put_le_u32(&mut block, CHECKSUM_OFFSET, checksum)?;
        Ok(block)
    }

    /// Decode and validate a super block.
    ///
    /// Validation order: header (component id, exact version, size),
    /// release version, checksum, then field decoding.
    pub fn decode(block: &[u8]) -> Result<Self> {
        require_block_len(block, VDO_BLOCK_SIZE, "super block")?;

        let header = Header::decode_validated(block, 0, &SUPER_BLOCK_HEADER, "super block")?;
        validate_version_exact(SUPER_BLOCK_VERSION, header.version, "super block")?;

        let release_version = read_le_u32(block, RELEASE_VERSION_OFFSET)?;
        validate_release_version(release_version)?;

        let stored = read_le_u32(block, CHECKSUM_OFFSET)?;
        verify_checksum(stored, &block[JOURNAL_STATE_OFFSET..SUPER_BLOCK_ENCODED_SIZE])?;

        let journal = RecoveryJournalState {
            head: read_le_u64(block, JOURNAL_STATE_OFFSET)?,
            tail: read_le_u64(block, JOURNAL_STATE_OFFSET + 8)?,
        };

        let depot_base = DEPOT_STATE_OFFSET;
        let depot = SlabDepotState {
            first_block: PhysicalBlockNumber(read_le_u64(block, depot_base)?),
            slab_count: read_le_u64(block, depot_base + 8)?,
            slab_config: SlabConfig {
                slab_blocks: read_le_u64(block, depot_base + 16)?,
                data_blocks: read_le_u64(block, depot_base + 24)?,
                reference_count_blocks: read_le_u64(block, depot_base + 32)?,
                slab_journal_blocks: read_le_u64(block, depot_base + 40)?,
            },
            zone_count: read_le_u32(block, depot_base + 48)?,
        };

        let component_base = COMPONENT_OFFSET;
        let component = VdoComponent {
            state: VdoState::from_u8(block[component_base])?,
            nonce: read_le_u64(block, component_base + 8)?,
            config: VdoConfig {
                logical_blocks: read_le_u64(block, component_base + 16)?,
                physical_blocks: read_le_u64(block, component_base + 24)?,
                slab_size: read_le_u64(block, component_base + 32)?,
                recovery_journal_size: read_le_u64(block, component_base + 40)?,
                slab_journal_blocks: read_le_u64(block, component_base + 48)?,
            },
            complete_recoveries: read_le_u64(block, component_base + 56)?,
            read_only_recoveries: read_le_u64(block, component_base + 64)?,
        };

        Ok(Self {
            release_version,
            journal,
            depot,
            component,
        })
    }
}

/// Write a super block at `location` (the data-region origin).
pub fn write_super_block(
    layer: &dyn PhysicalLayer,
    location: PhysicalBlockNumber,
    super_block: &SuperBlock,
) -> Result<()> {
    let block = super_block.encode()?;
    layer.write(location, 1, &block)?;
    debug!(
        target: "vdo::superblock",
        event = "super_block_written",
        location = location.0,
        state = ?super_block.component.state
    );
    Ok(())
}

/// Read and validate the super block at `location`.
pub fn load_super_block(
    layer: &dyn PhysicalLayer,
    location: PhysicalBlockNumber,
) -> Result<SuperBlock> {
    let mut buf = layer.allocate_io_buffer(VDO_BLOCK_SIZE, "super block read")?;
    layer.read(location, 1, buf.as_mut_slice())?;
    SuperBlock::decode(buf.as_slice())
}
