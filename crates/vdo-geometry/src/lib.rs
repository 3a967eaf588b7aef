#![forbid(unsafe_code)]
//! The volume-geometry block: the single block at PBN 0 that identifies
//! a device as a VDO.
//!
//! The geometry pins the dedup-index region, the data-region offset, the
//! per-volume nonce, and the UUID. It is written last during a format so
//! that a torn format leaves a device that refuses to load rather than
//! one that loads with stale metadata.
//!
//! On-disk layout of the first 4 KiB:
//!
//! ```text
//! 0..8     magic "dmvdo001"
//! 8..24    header {id=5, major=5, minor=0, size}
//! 24..28   release version (u32)
//! 28..32   CRC-32C over bytes 32..108
//! 32..40   nonce (u64)
//! 40..56   uuid
//! 56..96   region table: 2 x {id u32, start u64, length u64}
//! 96..108  index config {memory u32, checkpoint_frequency u32, flags u32}
//! 108..    zero fill
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;
use vdo_codec::{
    ComponentId, ENCODED_HEADER_SIZE, Header, VersionNumber, block_checksum,
    require_block_len, validate_release_version, verify_checksum,
};
use vdo_error::{Result, VdoError};
use vdo_layer::PhysicalLayer;
use vdo_types::{
    CURRENT_RELEASE_VERSION, GEOMETRY_MAGIC, PhysicalBlockNumber, VDO_BLOCK_SIZE, put_fixed,
    put_le_u32, put_le_u64, read_fixed, read_le_u32, read_le_u64,
};

/// Version of the geometry block format.
pub const GEOMETRY_BLOCK_VERSION: VersionNumber = VersionNumber::new(5, 0);

const MAGIC_OFFSET: usize = 0;
const HEADER_OFFSET: usize = 8;
const RELEASE_VERSION_OFFSET: usize = 24;
const CHECKSUM_OFFSET: usize = 28;
const NONCE_OFFSET: usize = 32;
const UUID_OFFSET: usize = 40;
const REGION_TABLE_OFFSET: usize = 56;
const REGION_ENTRY_SIZE: usize = 20;
const INDEX_CONFIG_OFFSET: usize = 96;

/// Total encoded length; everything beyond stays zero.
pub const GEOMETRY_ENCODED_SIZE: usize = 108;

const GEOMETRY_PAYLOAD_SIZE: u32 =
    (GEOMETRY_ENCODED_SIZE - HEADER_OFFSET - ENCODED_HEADER_SIZE) as u32;

const GEOMETRY_HEADER: Header = Header {
    id: ComponentId::GeometryBlock,
    version: GEOMETRY_BLOCK_VERSION,
    size: GEOMETRY_PAYLOAD_SIZE,
};

const INDEX_CONFIG_FLAG_SPARSE: u32 = 1 << 0;
const INDEX_CONFIG_FLAG_PRESENT: u32 = 1 << 1;

/// The two fixed regions named by the geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionId {
    DedupIndex = 0,
    DataRegion = 1,
}

impl RegionId {
    fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::DedupIndex),
            1 => Ok(Self::DataRegion),
            other => Err(VdoError::Corrupt(format!(
                "unknown volume region id {other}"
            ))),
        }
    }
}

/// One entry of the geometry's region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRegion {
    pub id: RegionId,
    pub start: PhysicalBlockNumber,
    pub length: u64,
}

/// Memory footprint class of the dedup index.
///
/// Stored as a `u32`: gigabyte counts are stored directly, while the
/// sub-gigabyte classes use the negative sentinels -256, -512, and -768
/// in two's complement, as the index encodes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexMemoryClass {
    Mem256Mb,
    Mem512Mb,
    Mem768Mb,
    Gigabytes(u32),
}

const MAX_INDEX_MEMORY_GB: u32 = 1024;

#[allow(clippy::cast_sign_loss)] // sentinel values are defined in two's complement
impl IndexMemoryClass {
    const SENTINEL_256MB: u32 = -256_i32 as u32;
    const SENTINEL_512MB: u32 = -512_i32 as u32;
    const SENTINEL_768MB: u32 = -768_i32 as u32;

    fn to_u32(self) -> u32 {
        match self {
            Self::Mem256Mb => Self::SENTINEL_256MB,
            Self::Mem512Mb => Self::SENTINEL_512MB,
            Self::Mem768Mb => Self::SENTINEL_768MB,
            Self::Gigabytes(gb) => gb,
        }
    }

    fn from_u32(value: u32) -> Result<Self> {
        match value {
            Self::SENTINEL_256MB => Ok(Self::Mem256Mb),
            Self::SENTINEL_512MB => Ok(Self::Mem512Mb),
            Self::SENTINEL_768MB => Ok(Self::Mem768Mb),
            gb if (1..=MAX_INDEX_MEMORY_GB).contains(&gb) => Ok(Self::Gigabytes(gb)),
            other => Err(VdoError::Corrupt(format!(
                "invalid index memory class {other:#x}"
            ))),
        }
    }

    /// Validate a user-supplied gigabyte count.
    pub fn gigabytes(gb: u32) -> Result<Self> {
        if !(1..=MAX_INDEX_MEMORY_GB).contains(&gb) {
            return Err(VdoError::OutOfRange(format!(
                "index memory must be 1..={MAX_INDEX_MEMORY_GB} GB, got {gb}"
            )));
        }
        Ok(Self::Gigabytes(gb))
    }
}

/// Configuration of the dedup index region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub memory: IndexMemoryClass,
    pub checkpoint_frequency: u32,
    pub sparse: bool,
}

impl IndexConfig {
    /// Blocks reserved for the index region.
    ///
    /// The index itself is opaque to this toolkit; the sizes are the
    /// tabulated constants of the current release. A sparse index covers
    /// ten times the chapter space of a dense one.
    #[must_use]
    pub fn index_blocks(&self) -> u64 {
        let dense = match self.memory {
            IndexMemoryClass::Mem256Mb => 65_536,
            IndexMemoryClass::Mem512Mb => 131_072,
            IndexMemoryClass::Mem768Mb => 196_608,
            IndexMemoryClass::Gigabytes(gb) => u64::from(gb) * 262_144,
        };
        if self.sparse { dense * 10 } else { dense }
    }
}

/// In-memory form of the block at PBN 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGeometry {
    pub release_version: u32,
    pub nonce: u64,
    pub uuid: Uuid,
    pub index_region: VolumeRegion,
    pub data_region: VolumeRegion,
    pub index_config: Option<IndexConfig>,
}

impl VolumeGeometry {
    /// Lay out the index and data regions for a device of
    /// `physical_blocks` blocks.
    ///
    /// The index region starts at PBN 1; the data region starts one past
    /// its end and runs to the end of the device.
    pub fn build(
        nonce: u64,
        uuid: Uuid,
        index_config: Option<IndexConfig>,
        physical_blocks: u64,
    ) -> Result<Self> {
        let index_length = index_config.as_ref().map_or(0, IndexConfig::index_blocks);
        let data_start = 1 + index_length;
        if data_start >= physical_blocks {
            return Err(VdoError::OutOfRange(format!(
                "device of {physical_blocks} blocks cannot hold a {index_length}-block index \
                 and a data region"
            )));
        }

        Ok(Self {
            release_version: CURRENT_RELEASE_VERSION,
            nonce,
            uuid,
            index_region: VolumeRegion {
                id: RegionId::DedupIndex,
                start: PhysicalBlockNumber(1),
                length: index_length,
            },
            data_region: VolumeRegion {
                id: RegionId::DataRegion,
                start: PhysicalBlockNumber(data_start),
                length: physical_blocks - data_start,
            },
            index_config,
        })
    }

    /// PBN of the super block: the first block of the data region.
    #[must_use]
    pub fn super_block_location(&self) -> PhysicalBlockNumber {
        self.data_region.start
    }

    /// Encode into a full geometry block.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut block = vec![0_u8; VDO_BLOCK_SIZE];
        put_fixed::<8>(&mut block, MAGIC_OFFSET, &GEOMETRY_MAGIC)?;
        GEOMETRY_HEADER.encode_into(&mut block, HEADER_OFFSET)?;
        put_le_u32(&mut block, RELEASE_VERSION_OFFSET, self.release_version)?;
        put_le_u64(&mut block, NONCE_OFFSET, self.nonce)?;
        put_fixed::<16>(&mut block, UUID_OFFSET, self.uuid.as_bytes())?;

        for (slot, region) in [self.index_region, self.data_region].iter().enumerate() {
            let base = REGION_TABLE_OFFSET + slot * REGION_ENTRY_SIZE;
            put_le_u32(&mut block, base, region.id as u32)?;
            put_le_u64(&mut block, base + 4, region.start.0)?;
            put_le_u64(&mut block, base + 12, region.length)?;
        }

        let (memory, frequency, mut flags) = match &self.index_config {
            Some(config) => (
                config.memory.to_u32(),
                config.checkpoint_frequency,
                INDEX_CONFIG_FLAG_PRESENT,
            ),
            None => (0, 0, 0),
        };
        if self.index_config.is_some_and(|config| config.sparse) {
            flags |= INDEX_CONFIG_FLAG_SPARSE;
        }
        put_le_u32(&mut block, INDEX_CONFIG_OFFSET, memory)?;
        put_le_u32(&mut block, INDEX_CONFIG_OFFSET + 4, frequency)?;
        put_le_u32(&mut block, INDEX_CONFIG_OFFSET + 8, flags)?;

        let checksum = block_checksum(&block[NONCE_OFFSET..GEOMETRY_ENCODED_SIZE]);
        put_le_u32(&mut block, CHECKSUM_OFFSET, checksum)?;
        Ok(block)
    }

    /// Decode and validate a geometry block.
    ///
    /// Validation order: magic, header (component id, version, size),
    /// release version, checksum, then derived region invariants.
    pub fn decode(block: &[u8]) -> Result<Self> {
        require_block_len(block, VDO_BLOCK_SIZE, "geometry block")?;

        if read_fixed::<8>(block, MAGIC_OFFSET)? != GEOMETRY_MAGIC {
            return Err(VdoError::BadMagic { block: 0 });
        }

        Header::decode_validated(block, HEADER_OFFSET, &GEOMETRY_HEADER, "geometry block")?;

        let release_version = read_le_u32(block, RELEASE_VERSION_OFFSET)?;
        validate_release_version(release_version)?;

        let stored = read_le_u32(block, CHECKSUM_OFFSET)?;
        verify_checksum(stored, &block[NONCE_OFFSET..GEOMETRY_ENCODED_SIZE])?;

        let nonce = read_le_u64(block, NONCE_OFFSET)?;
        let uuid = Uuid::from_bytes(read_fixed::<16>(block, UUID_OFFSET)?);

        let read_region = |slot: usize| -> Result<VolumeRegion> {
            let base = REGION_TABLE_OFFSET + slot * REGION_ENTRY_SIZE;
            Ok(VolumeRegion {
                id: RegionId::from_u32(read_le_u32(block, base)?)?,
                start: PhysicalBlockNumber(read_le_u64(block, base + 4)?),
                length: read_le_u64(block, base + 12)?,
            })
        };
        let index_region = read_region(0)?;
        let data_region = read_region(1)?;

        let flags = read_le_u32(block, INDEX_CONFIG_OFFSET + 8)?;
        let index_config = if flags & INDEX_CONFIG_FLAG_PRESENT != 0 {
            Some(IndexConfig {
                memory: IndexMemoryClass::from_u32(read_le_u32(block, INDEX_CONFIG_OFFSET)?)?,
                checkpoint_frequency: read_le_u32(block, INDEX_CONFIG_OFFSET + 4)?,
                sparse: flags & INDEX_CONFIG_FLAG_SPARSE != 0,
            })
        } else {
            None
        };

        let geometry = Self {
            release_version,
            nonce,
            uuid,
            index_region,
            data_region,
            index_config,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    fn validate(&self) -> Result<()> {
        if self.index_region.id != RegionId::DedupIndex
            || self.data_region.id != RegionId::DataRegion
        {
            return Err(VdoError::Corrupt(
                "geometry region table is misordered".to_owned(),
            ));
        }
        if self.data_region.start.0 == 0 {
            return Err(VdoError::Corrupt(
                "data region cannot start at PBN 0".to_owned(),
            ));
        }
        let index_end = 1 + self.index_region.length;
        if self.data_region.start.0 < index_end {
            return Err(VdoError::Corrupt(format!(
                "data region at {} overlaps the index region ending at {index_end}",
                self.data_region.start
            )));
        }
        if self.data_region.length == 0 {
            return Err(VdoError::Corrupt("data region is empty".to_owned()));
        }
        Ok(())
    }
}

/// Write the geometry block at PBN 0.
pub fn write_geometry(layer: &dyn PhysicalLayer, geometry: &VolumeGeometry) -> Result<()> {
    let block = geometry.encode()?;
    layer.write(PhysicalBlockNumber(0), 1, &block)?;
    debug!(
        target: "vdo::geometry",
        event = "geometry_written",
        nonce = geometry.nonce,
        data_region_start = geometry.data_region.start.0
    );
    Ok(())
}

/// Zero the geometry block at PBN 0.
///
/// Called before any other format write so that a crash mid-format
/// leaves a device that refuses to load.
pub fn clear_geometry(layer: &dyn PhysicalLayer) -> Result<()> {
    let buf = layer.allocate_io_buffer(VDO_BLOCK_SIZE, "zeroed geometry")?;
    layer.write(PhysicalBlockNumber(0), 1, buf.as_slice())?;
    debug!(target: "vdo::geometry", event = "geometry_cleared");
    Ok(())
}

/// Read and validate the geometry block at PBN 0.
pub fn load_geometry(layer: &dyn PhysicalLayer) -> Result<VolumeGeometry> {
    let mut buf = layer.allocate_io_buffer(VDO_BLOCK_SIZE, "geometry read")?;
    layer.read(PhysicalBlockNumber(0), 1, buf.as_mut_slice())?;
    VolumeGeometry::decode(buf.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdo_layer::RamLayer;

    fn sample_config() -> IndexConfig {
        IndexConfig {
            memory: IndexMemoryClass::Mem256Mb,
            checkpoint_frequency: 0,
            sparse: false,
        }
    }

    fn sample_geometry() -> VolumeGeometry {
        VolumeGeometry::build(
            0xDEAD_BEEF_0123_4567,
            Uuid::from_bytes([0x11; 16]),
            Some(sample_config()),
            1 << 20,
        )
        .expect("build")
    }

    #[test]
    fn build_lays_out_regions() {
        let geometry = sample_geometry();
        assert_eq!(geometry.index_region.start, PhysicalBlockNumber(1));
        assert_eq!(geometry.index_region.length, 65_536);
        assert_eq!(geometry.data_region.start, PhysicalBlockNumber(65_537));
        assert_eq!(geometry.data_region.length, (1 << 20) - 65_537);
        assert_eq!(geometry.super_block_location(), PhysicalBlockNumber(65_537));
    }

    #[test]
    fn build_without_index() {
        let geometry =
            VolumeGeometry::build(1, Uuid::from_bytes([0; 16]), None, 131_072).expect("build");
        assert_eq!(geometry.index_region.length, 0);
        assert_eq!(geometry.data_region.start, PhysicalBlockNumber(1));
        assert_eq!(geometry.data_region.length, 131_071);
    }

    #[test]
    fn build_rejects_index_larger_than_device() {
        let result = VolumeGeometry::build(
            1,
            Uuid::from_bytes([0; 16]),
            Some(sample_config()),
            1024,
        );
        assert!(matches!(result, Err(VdoError::OutOfRange(_))));
    }

    #[test]
    fn index_block_table() {
        let mut config = sample_config();
        assert_eq!(config.index_blocks(), 65_536);
        config.memory = IndexMemoryClass::Mem768Mb;
        assert_eq!(config.index_blocks(), 196_608);
        config.memory = IndexMemoryClass::Gigabytes(2);
        assert_eq!(config.index_blocks(), 524_288);
        config.sparse = true;
        assert_eq!(config.index_blocks(), 5_242_880);
    }

    #[test]
    fn memory_class_bounds() {
        assert!(IndexMemoryClass::gigabytes(0).is_err());
        assert!(IndexMemoryClass::gigabytes(1).is_ok());
        assert!(IndexMemoryClass::gigabytes(1025).is_err());
        assert!(matches!(
            IndexMemoryClass::from_u32(2000),
            Err(VdoError::Corrupt(_))
        ));
    }

    #[test]
    fn memory_class_encoding_round_trips() {
        for class in [
            IndexMemoryClass::Mem256Mb,
            IndexMemoryClass::Mem512Mb,
            IndexMemoryClass::Mem768Mb,
            IndexMemoryClass::Gigabytes(1),
            // Gigabyte counts colliding with the sub-GB sizes must
            // survive the sentinel encoding.
            IndexMemoryClass::Gigabytes(256),
            IndexMemoryClass::Gigabytes(1024),
        ] {
            assert_eq!(
                IndexMemoryClass::from_u32(class.to_u32()).expect("round trip"),
                class
            );
        }
    }

    #[test]
    fn sparse_gigabyte_config_round_trips() {
        let geometry = VolumeGeometry::build(
            3,
            Uuid::from_bytes([7; 16]),
            Some(IndexConfig {
                memory: IndexMemoryClass::Gigabytes(2),
                checkpoint_frequency: 16,
                sparse: true,
            }),
            1 << 24,
        )
        .expect("build");
        assert_eq!(geometry.index_region.length, 5_242_880);
        let decoded =
            VolumeGeometry::decode(&geometry.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, geometry);
    }

    #[test]
    fn encode_decode_round_trip() {
        let geometry = sample_geometry();
        let block = geometry.encode().expect("encode");
        assert_eq!(block.len(), VDO_BLOCK_SIZE);
        assert!(block[GEOMETRY_ENCODED_SIZE..].iter().all(|byte| *byte == 0));
        let decoded = VolumeGeometry::decode(&block).expect("decode");
        assert_eq!(decoded, geometry);
    }

    #[test]
    fn round_trip_without_index_config() {
        let geometry =
            VolumeGeometry::build(7, Uuid::from_bytes([3; 16]), None, 131_072).expect("build");
        let decoded = VolumeGeometry::decode(&geometry.encode().expect("encode"))
            .expect("decode");
        assert_eq!(decoded.index_config, None);
        assert_eq!(decoded, geometry);
    }

    #[test]
    fn zeroed_block_is_bad_magic() {
        let block = vec![0_u8; VDO_BLOCK_SIZE];
        assert!(matches!(
            VolumeGeometry::decode(&block),
            Err(VdoError::BadMagic { block: 0 })
        ));
    }

    #[test]
    fn corrupt_nonce_is_bad_checksum() {
        let mut block = sample_geometry().encode().expect("encode");
        block[NONCE_OFFSET + 2] ^= 0xFF;
        assert!(matches!(
            VolumeGeometry::decode(&block),
            Err(VdoError::BadChecksum { .. })
        ));
    }

    #[test]
    fn version_flip_is_unsupported_not_checksum() {
        let mut block = sample_geometry().encode().expect("encode");
        // Header major version lives at bytes 12..16.
        block[12] ^= 0x02;
        assert!(matches!(
            VolumeGeometry::decode(&block),
            Err(VdoError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn unknown_release_version_is_unsupported() {
        let mut geometry = sample_geometry();
        geometry.release_version = CURRENT_RELEASE_VERSION + 7;
        let block = geometry.encode().expect("encode");
        assert!(matches!(
            VolumeGeometry::decode(&block),
            Err(VdoError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn write_clear_load_cycle() {
        let layer = RamLayer::new(1 << 20);
        let geometry = sample_geometry();
        write_geometry(&layer, &geometry).expect("write");
        let loaded = load_geometry(&layer).expect("load");
        assert_eq!(loaded, geometry);

        clear_geometry(&layer).expect("clear");
        assert!(matches!(
            load_geometry(&layer),
            Err(VdoError::BadMagic { block: 0 })
        ));
    }
}
