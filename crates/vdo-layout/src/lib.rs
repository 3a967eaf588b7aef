#![forbid(unsafe_code)]
//! Layout mathematics for a VDO volume.
//!
//! Three pure, I/O-free concerns: per-slab arithmetic (journal,
//! reference-count, and data blocks), block-map forest sizing from the
//! logical block count, and the fixed partition layout carved across the
//! data region.

pub mod forest;
pub mod layout;
pub mod slab;

pub use forest::{block_map_page_count, compute_logical_blocks};
pub use layout::{Partition, PartitionId, VdoLayout, make_layout, slab_summary_size};
pub use slab::{SlabConfig, SlabSummaryEntry, configure_slab};
