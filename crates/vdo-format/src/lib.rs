#![forbid(unsafe_code)]
//! Format and reconfigure driver for VDO volumes.
//!
//! `format` validates a configuration against the backing device, draws
//! a nonce and UUID, and writes a complete, loadable volume: geometry,
//! zeroed block-map and recovery-journal partitions, a seeded slab
//! summary, and the super block. The geometry block is written last so
//! that any earlier failure leaves a device that refuses to load.
//!
//! `force_rebuild` and `set_read_only_mode` are the only post-format
//! mutations; each rewrites exactly one block.

mod driver;
mod volume;

pub use driver::{FormatConfig, format, format_with_nonce};
pub use volume::{Volume, force_rebuild, set_read_only_mode, update_super_block_state};
