#![forbid(unsafe_code)]
//! End-to-end format and reconfigure scenarios against a RAM-backed
//! device.
//!
//! Scenarios covered:
//! 1. Minimum format: fill-the-device sizing on a 512 MiB device.
//! 2. Over-provisioned logical capacity, and one that cannot fit.
//! 3. Force rebuild on a healthy volume is refused.
//! 4. Read-only then force rebuild succeeds and persists.
//! 5. A corrupted geometry byte fails the checksum.
//! 6. A torn format (injected super-block write failure) leaves an
//!    unrecognisable device.

use uuid::Uuid;
use vdo_error::VdoError;
use vdo_format::{FormatConfig, Volume, force_rebuild, format_with_nonce, set_read_only_mode};
use vdo_geometry::{IndexConfig, IndexMemoryClass, load_geometry};
use vdo_layer::{PhysicalLayer, RamLayer};
use vdo_superblock::VdoState;
use vdo_types::{PhysicalBlockNumber, VDO_BLOCK_SIZE};

const NONCE: u64 = 0x5EED_CAFE_0000_0001;

fn test_uuid() -> Uuid {
    Uuid::from_bytes(*b"vdo-e2e-test-uid")
}

fn minimum_config() -> FormatConfig {
    FormatConfig {
        physical_blocks: 0,
        logical_blocks: 0,
        slab_size: 8192,
        slab_journal_blocks: 224,
        recovery_journal_size: 2048,
        index_config: None,
    }
}

/// Layer wrapper that injects an `IO_ERROR` on any write touching one
/// chosen block.
struct FailingLayer<'a> {
    inner: &'a RamLayer,
    fail_write_at: u64,
}

impl PhysicalLayer for FailingLayer<'_> {
    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn read(&self, start: PhysicalBlockNumber, count: u64, buf: &mut [u8]) -> vdo_error::Result<()> {
        self.inner.read(start, count, buf)
    }

    fn write(&self, start: PhysicalBlockNumber, count: u64, buf: &[u8]) -> vdo_error::Result<()> {
        if start.0 <= self.fail_write_at && self.fail_write_at < start.0 + count {
            return Err(VdoError::Io(std::io::Error::other(
                "injected write failure",
            )));
        }
        self.inner.write(start, count, buf)
    }
}

// ── Scenario 1: minimum format ──────────────────────────────────────────────

#[test]
fn minimum_format_produces_loadable_volume() {
    let layer = RamLayer::new(131_072);
    format_with_nonce(&minimum_config(), &layer, NONCE, test_uuid()).expect("format");

    let geometry = load_geometry(&layer).expect("geometry loads");
    assert_eq!(geometry.nonce, NONCE);
    assert_eq!(geometry.uuid, test_uuid());
    assert_eq!(geometry.index_region.length, 0);
    assert_eq!(geometry.data_region.start, PhysicalBlockNumber(1));

    let volume = Volume::load(&layer).expect("volume loads");
    assert_eq!(volume.state(), VdoState::New);
    assert_eq!(volume.super_block.component.complete_recoveries, 0);
    assert_eq!(volume.super_block.journal.head, 1);
    assert_eq!(volume.super_block.journal.tail, 1);

    let depot = &volume.super_block.depot;
    assert!(depot.slab_count >= 1);
    assert_eq!(depot.slab_count, 15);
    assert_eq!(depot.first_block, PhysicalBlockNumber(209));
    assert_eq!(depot.zone_count, 1);

    // Fill-the-device sizing: the largest logical capacity whose block
    // map still fits beside the depot's data blocks.
    let config = &volume.super_block.component.config;
    assert_eq!(config.logical_blocks, 119_283);
    assert_eq!(config.physical_blocks, 131_072);
    assert_eq!(config.slab_size, 8192);
}

#[test]
fn format_zeroes_the_metadata_partitions() {
    let layer = RamLayer::new(131_072);

    // Dirty a block that will land inside the block-map partition.
    let junk = vec![0xEE_u8; VDO_BLOCK_SIZE];
    layer.write(PhysicalBlockNumber(50), 1, &junk).expect("dirty");

    format_with_nonce(&minimum_config(), &layer, NONCE, test_uuid()).expect("format");

    let block = layer
        .snapshot_block(PhysicalBlockNumber(50))
        .expect("snapshot");
    assert!(block.iter().all(|byte| *byte == 0));
}

#[test]
fn format_with_dedup_index_offsets_the_data_region() {
    let layer = RamLayer::new(262_144);
    let config = FormatConfig {
        index_config: Some(IndexConfig {
            memory: IndexMemoryClass::Mem256Mb,
            checkpoint_frequency: 0,
            sparse: false,
        }),
        ..minimum_config()
    };
    format_with_nonce(&config, &layer, NONCE, test_uuid()).expect("format");

    let geometry = load_geometry(&layer).expect("geometry");
    assert_eq!(geometry.index_region.start, PhysicalBlockNumber(1));
    assert_eq!(geometry.index_region.length, 65_536);
    assert_eq!(geometry.data_region.start, PhysicalBlockNumber(65_537));

    let volume = Volume::load(&layer).expect("volume");
    assert!(volume.super_block.depot.first_block > geometry.data_region.start);
}

// ── Scenario 2: over-provisioned logical capacity ───────────────────────────

#[test]
fn over_provisioned_logical_formats_when_the_block_map_fits() {
    let layer = RamLayer::new(262_144);
    let config = FormatConfig {
        logical_blocks: 1_048_576,
        ..minimum_config()
    };
    format_with_nonce(&config, &layer, NONCE, test_uuid()).expect("format");

    let volume = Volume::load(&layer).expect("volume");
    assert_eq!(volume.super_block.component.config.logical_blocks, 1_048_576);
    // Logical capacity deliberately exceeds the physical data blocks.
    let depot = &volume.super_block.depot;
    assert!(depot.slab_count * depot.slab_config.data_blocks < 1_048_576);
}

#[test]
fn over_provisioned_logical_fails_when_the_block_map_cannot_fit() {
    let layer = RamLayer::new(10_368);
    let config = FormatConfig {
        logical_blocks: 1_048_576,
        ..minimum_config()
    };
    assert!(matches!(
        format_with_nonce(&config, &layer, NONCE, test_uuid()),
        Err(VdoError::OutOfRange(_))
    ));
    // Nothing was committed.
    assert!(matches!(
        load_geometry(&layer),
        Err(VdoError::BadMagic { block: 0 })
    ));
}

// ── Scenarios 3 and 4: reconfigure ──────────────────────────────────────────

#[test]
fn force_rebuild_is_refused_on_a_healthy_volume() {
    let layer = RamLayer::new(131_072);
    format_with_nonce(&minimum_config(), &layer, NONCE, test_uuid()).expect("format");

    assert!(matches!(force_rebuild(&layer), Err(VdoError::NotReadOnly)));
    assert_eq!(Volume::load(&layer).expect("volume").state(), VdoState::New);
}

#[test]
fn read_only_then_force_rebuild_persists() {
    let layer = RamLayer::new(131_072);
    format_with_nonce(&minimum_config(), &layer, NONCE, test_uuid()).expect("format");

    set_read_only_mode(&layer).expect("set read-only");
    assert_eq!(
        Volume::load(&layer).expect("volume").state(),
        VdoState::ReadOnlyMode
    );

    force_rebuild(&layer).expect("force rebuild");
    assert_eq!(
        Volume::load(&layer).expect("volume").state(),
        VdoState::ForceRebuild
    );
}

#[test]
fn repeated_reconfigure_is_byte_identical() {
    let layer = RamLayer::new(131_072);
    format_with_nonce(&minimum_config(), &layer, NONCE, test_uuid()).expect("format");
    let super_block_pbn = load_geometry(&layer)
        .expect("geometry")
        .super_block_location();

    set_read_only_mode(&layer).expect("first");
    let first = layer.snapshot_block(super_block_pbn).expect("snapshot");
    set_read_only_mode(&layer).expect("second");
    let second = layer.snapshot_block(super_block_pbn).expect("snapshot");
    assert_eq!(first, second);
}

#[test]
fn reconfigure_touches_only_the_super_block() {
    let layer = RamLayer::new(131_072);
    format_with_nonce(&minimum_config(), &layer, NONCE, test_uuid()).expect("format");

    let geometry_before = layer
        .snapshot_block(PhysicalBlockNumber(0))
        .expect("snapshot");
    set_read_only_mode(&layer).expect("set read-only");
    let geometry_after = layer
        .snapshot_block(PhysicalBlockNumber(0))
        .expect("snapshot");
    assert_eq!(geometry_before, geometry_after);
}

// ── Scenario 5: corrupt geometry ────────────────────────────────────────────

#[test]
fn corrupted_geometry_byte_fails_the_checksum() {
    let layer = RamLayer::new(131_072);
    format_with_nonce(&minimum_config(), &layer, NONCE, test_uuid()).expect("format");

    let original = layer
        .snapshot_block(PhysicalBlockNumber(0))
        .expect("snapshot");
    layer
        .poke(PhysicalBlockNumber(0), 40, original[40] ^ 0xFF)
        .expect("poke");

    assert!(matches!(
        load_geometry(&layer),
        Err(VdoError::BadChecksum { .. })
    ));
}

// ── Scenario 6: torn format ─────────────────────────────────────────────────

#[test]
fn torn_format_leaves_an_unrecognisable_device() {
    let ram = RamLayer::new(131_072);
    // With no index, the super block lands at PBN 1.
    let layer = FailingLayer {
        inner: &ram,
        fail_write_at: 1,
    };

    assert!(matches!(
        format_with_nonce(&minimum_config(), &layer, NONCE, test_uuid()),
        Err(VdoError::Io(_))
    ));
    assert!(matches!(
        load_geometry(&ram),
        Err(VdoError::BadMagic { block: 0 })
    ));
}

#[test]
fn failed_metadata_zeroing_also_leaves_an_unrecognisable_device() {
    let ram = RamLayer::new(131_072);
    // Fail somewhere inside the block-map partition.
    let layer = FailingLayer {
        inner: &ram,
        fail_write_at: 100,
    };

    assert!(matches!(
        format_with_nonce(&minimum_config(), &layer, NONCE, test_uuid()),
        Err(VdoError::Io(_))
    ));
    assert!(matches!(
        load_geometry(&ram),
        Err(VdoError::BadMagic { block: 0 })
    ));
}

// ── Slab addressing on a real format ────────────────────────────────────────

#[test]
fn loaded_volume_exposes_slab_addressing() {
    let layer = RamLayer::new(131_072);
    format_with_nonce(&minimum_config(), &layer, NONCE, test_uuid()).expect("format");

    let volume = Volume::load(&layer).expect("volume");
    let depot = &volume.super_block.depot;
    let first = depot.first_block;

    assert_eq!(volume.slab_number(first).expect("first slab"), 0);
    assert!(volume.is_valid_data_block(first));
    // The tail of each slab is metadata, not data.
    let tail = PhysicalBlockNumber(first.0 + depot.slab_config.data_blocks);
    assert!(!volume.is_valid_data_block(tail));
    // One block before the depot is not addressable.
    assert!(volume.slab_number(PhysicalBlockNumber(first.0 - 1)).is_err());
}
