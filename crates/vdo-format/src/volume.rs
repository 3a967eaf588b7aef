#![forbid(unsafe_code)]
//! Loading a formatted volume and the out-of-band state mutations.

use tracing::info;
use vdo_error::{Result, VdoError};
use vdo_geometry::{VolumeGeometry, load_geometry};
use vdo_layer::PhysicalLayer;
use vdo_superblock::{SuperBlock, VdoState, load_super_block, write_super_block};
use vdo_types::PhysicalBlockNumber;

/// A loaded volume: geometry, super block, and the derived slab
/// addressing parameters tooling needs.
#[derive(Debug, Clone)]
pub struct Volume {
    pub geometry: VolumeGeometry,
    pub super_block: SuperBlock,
    slab_size_shift: u32,
    slab_offset_mask: u64,
    depot_last_block: PhysicalBlockNumber,
}

impl Volume {
    /// Read and validate the geometry and super block of a device.
    pub fn load(layer: &dyn PhysicalLayer) -> Result<Self> {
        let geometry = load_geometry(layer)?;
        let super_block = load_super_block(layer, geometry.super_block_location())?;
        Self::assemble(geometry, super_block)
    }

    fn assemble(geometry: VolumeGeometry, super_block: SuperBlock) -> Result<Self> {
        if super_block.component.nonce != geometry.nonce {
            return Err(VdoError::Corrupt(format!(
                "super block nonce {:#018x} does not match geometry nonce {:#018x}",
                super_block.component.nonce, geometry.nonce
            )));
        }

        let slab_size = super_block.depot.slab_config.slab_blocks;
        if slab_size == 0 || !slab_size.is_power_of_two() {
            return Err(VdoError::Corrupt(format!(
                "persisted slab size {slab_size} is not a power of two"
            )));
        }

        let depot_last_block = super_block
            .depot
            .slab_count
            .checked_mul(slab_size)
            .and_then(|blocks| super_block.depot.first_block.checked_add(blocks))
            .ok_or_else(|| VdoError::Corrupt("depot extent overflows".to_owned()))?;

        Ok(Self {
            geometry,
            super_block,
            slab_size_shift: slab_size.trailing_zeros(),
            slab_offset_mask: slab_size - 1,
            depot_last_block,
        })
    }

    /// Persisted operating state.
    #[must_use]
    pub fn state(&self) -> VdoState {
        self.super_block.component.state
    }

    /// Index of the slab containing `pbn`.
    pub fn slab_number(&self, pbn: PhysicalBlockNumber) -> Result<u64> {
        let depot = &self.super_block.depot;
        if pbn < depot.first_block || pbn >= self.depot_last_block {
            return Err(VdoError::OutOfRange(format!(
                "{pbn} is outside the depot [{}, {})",
                depot.first_block, self.depot_last_block
            )));
        }
        Ok((pbn.0 - depot.first_block.0) >> self.slab_size_shift)
    }

    /// Offset of `pbn` within its slab's data blocks.
    ///
    /// Fails for blocks in the slab's metadata tail.
    pub fn slab_block_number(&self, pbn: PhysicalBlockNumber) -> Result<u64> {
        self.slab_number(pbn)?;
        let offset = (pbn.0 - self.super_block.depot.first_block.0) & self.slab_offset_mask;
        if offset >= self.super_block.depot.slab_config.data_blocks {
            return Err(VdoError::OutOfRange(format!(
                "{pbn} falls in a slab's metadata tail"
            )));
        }
        Ok(offset)
    }

    /// Whether `pbn` addresses a slab data block.
    #[must_use]
    pub fn is_valid_data_block(&self, pbn: PhysicalBlockNumber) -> bool {
        self.slab_block_number(pbn).is_ok()
    }
}

/// Change the state of an inactive VDO image.
///
/// Loads the geometry and super block, optionally requires the volume to
/// already be in read-only mode, overwrites the state, and rewrites the
/// single super-block block with a fresh checksum.
pub fn update_super_block_state(
    layer: &dyn PhysicalLayer,
    require_read_only: bool,
    new_state: VdoState,
) -> Result<()> {
    let volume = Volume::load(layer)?;
    if require_read_only && volume.state() != VdoState::ReadOnlyMode {
        return Err(VdoError::NotReadOnly);
    }

    let mut super_block = volume.super_block;
    super_block.component.state = new_state;
    write_super_block(layer, volume.geometry.super_block_location(), &super_block)?;
    info!(
        target: "vdo::reconfigure",
        event = "state_updated",
        new_state = ?new_state
    );
    Ok(())
}

/// Mark a read-only VDO for a full rebuild at next start.
pub fn force_rebuild(layer: &dyn PhysicalLayer) -> Result<()> {
    update_super_block_state(layer, true, VdoState::ForceRebuild)
}

/// Put a VDO into read-only mode.
pub fn set_read_only_mode(layer: &dyn PhysicalLayer) -> Result<()> {
    update_super_block_state(layer, false, VdoState::ReadOnlyMode)
}
