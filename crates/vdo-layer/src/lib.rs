#![forbid(unsafe_code)]
//! The synchronous physical layer the format engine runs against.
//!
//! Provides the `PhysicalLayer` trait (block count, aligned buffer
//! allocation, bulk block reads/writes), a file-backed implementation
//! using `pread`/`pwrite` semantics, and a RAM-backed implementation for
//! tests and image staging. Writes are durable on return or fail.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;
use vdo_error::{Result, VdoError};
use vdo_types::{PhysicalBlockNumber, VDO_BLOCK_SIZE, VDO_BLOCK_SIZE_U64};

const DIRECT_IO_ALIGNMENT: usize = 4096;

/// Owned byte buffer whose exposed slice starts at direct-I/O alignment.
///
/// Remains fully safe by keeping the original backing allocation and
/// exposing an aligned subslice. The buffer is zeroed on allocation.
#[derive(Debug, Clone)]
pub struct IoBuffer {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl IoBuffer {
    /// Allocate a zeroed buffer of exactly `len` bytes.
    ///
    /// Allocation is fallible; exhaustion surfaces as `OutOfMemory`
    /// rather than aborting the process.
    pub fn allocate(len: usize, tag: &'static str) -> Result<Self> {
        if len == 0 {
            return Ok(Self {
                storage: Vec::new(),
                start: 0,
                len: 0,
            });
        }

        let storage_len = len.saturating_add(DIRECT_IO_ALIGNMENT - 1);
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(storage_len)
            .map_err(|_| VdoError::OutOfMemory(storage_len))?;
        storage.resize(storage_len, 0);

        let base = storage.as_ptr() as usize;
        let misalignment = base & (DIRECT_IO_ALIGNMENT - 1);
        let start = if misalignment == 0 {
            0
        } else {
            DIRECT_IO_ALIGNMENT - misalignment
        };
        debug_assert!(start + len <= storage.len());
        trace!(target: "vdo::layer", event = "buffer_alloc", size = len, tag = tag);
        Ok(Self {
            storage,
            start,
            len,
        })
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        let end = start + self.len;
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The narrow synchronous contract the format engine consumes.
///
/// PBNs are expected in-bounds; implementations still range-check and
/// report `OutOfRange` rather than corrupting neighbouring state. Writes
/// are durable when the call returns.
pub trait PhysicalLayer {
    /// Total blocks available, stable for the duration of a format.
    fn block_count(&self) -> u64;

    /// Allocate a zeroed buffer of exactly `bytes`, aligned for direct I/O.
    fn allocate_io_buffer(&self, bytes: usize, tag: &'static str) -> Result<IoBuffer> {
        IoBuffer::allocate(bytes, tag)
    }

    /// Read `count` blocks starting at `start` into `buf`.
    fn read(&self, start: PhysicalBlockNumber, count: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `count` blocks starting at `start` from `buf`.
    fn write(&self, start: PhysicalBlockNumber, count: u64, buf: &[u8]) -> Result<()>;
}

fn check_extent(
    block_count: u64,
    start: PhysicalBlockNumber,
    count: u64,
    buf_len: usize,
) -> Result<u64> {
    let end = start
        .checked_add(count)
        .ok_or_else(|| VdoError::OutOfRange(format!("extent {start}+{count} overflows")))?;
    if end.0 > block_count {
        return Err(VdoError::OutOfRange(format!(
            "extent {start}+{count} exceeds device of {block_count} blocks"
        )));
    }

    let expected = count
        .checked_mul(VDO_BLOCK_SIZE_U64)
        .and_then(|bytes| usize::try_from(bytes).ok())
        .ok_or_else(|| VdoError::OutOfRange(format!("extent of {count} blocks overflows")))?;
    if buf_len != expected {
        return Err(VdoError::OutOfRange(format!(
            "buffer is {buf_len} bytes for a {count}-block extent"
        )));
    }

    start
        .to_byte_offset()
        .ok_or_else(|| VdoError::OutOfRange(format!("byte offset of {start} overflows")))
}

/// File-backed layer using Linux `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. The file length must be a whole
/// number of blocks.
#[derive(Debug, Clone)]
pub struct FileLayer {
    file: Arc<File>,
    block_count: u64,
}

impl FileLayer {
    /// Open a device or image file read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len % VDO_BLOCK_SIZE_U64 != 0 {
            return Err(VdoError::OutOfRange(format!(
                "device length {len} is not a multiple of the {VDO_BLOCK_SIZE}-byte block size"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            block_count: len / VDO_BLOCK_SIZE_U64,
        })
    }
}

impl PhysicalLayer for FileLayer {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read(&self, start: PhysicalBlockNumber, count: u64, buf: &mut [u8]) -> Result<()> {
        let offset = check_extent(self.block_count, start, count, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        trace!(target: "vdo::layer", event = "read", start = start.0, blocks = count);
        Ok(())
    }

    fn write(&self, start: PhysicalBlockNumber, count: u64, buf: &[u8]) -> Result<()> {
        let offset = check_extent(self.block_count, start, count, buf.len())?;
        self.file.write_all_at(buf, offset)?;
        self.file.sync_data()?;
        trace!(target: "vdo::layer", event = "write", start = start.0, blocks = count);
        Ok(())
    }
}

/// RAM-backed layer for tests and image staging.
///
/// Storage is sparse: unwritten blocks read as zeros, and writing an
/// all-zero block releases its storage, so zeroing whole partitions of a
/// device-sized layer stays cheap.
#[derive(Debug)]
pub struct RamLayer {
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    block_count: u64,
}

impl RamLayer {
    /// Create a zero-filled layer of `block_count` blocks.
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            block_count,
        }
    }

    /// Copy out one block, for inspection in tests and tooling.
    pub fn snapshot_block(&self, pbn: PhysicalBlockNumber) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; VDO_BLOCK_SIZE];
        self.read(pbn, 1, &mut buf)?;
        Ok(buf)
    }

    /// Overwrite a single byte, for corruption scenarios in tests.
    pub fn poke(&self, pbn: PhysicalBlockNumber, offset: usize, value: u8) -> Result<()> {
        if pbn.0 >= self.block_count || offset >= VDO_BLOCK_SIZE {
            return Err(VdoError::OutOfRange(format!(
                "poke at block {pbn} offset {offset}"
            )));
        }
        let mut blocks = self.blocks.lock();
        blocks
            .entry(pbn.0)
            .or_insert_with(|| vec![0_u8; VDO_BLOCK_SIZE])[offset] = value;
        Ok(())
    }
}

impl PhysicalLayer for RamLayer {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read(&self, start: PhysicalBlockNumber, count: u64, buf: &mut [u8]) -> Result<()> {
        check_extent(self.block_count, start, count, buf.len())?;
        let blocks = self.blocks.lock();
        for (index, chunk) in buf.chunks_exact_mut(VDO_BLOCK_SIZE).enumerate() {
            match blocks.get(&(start.0 + index as u64)) {
                Some(stored) => chunk.copy_from_slice(stored),
                None => chunk.fill(0),
            }
        }
        Ok(())
    }

    fn write(&self, start: PhysicalBlockNumber, count: u64, buf: &[u8]) -> Result<()> {
        check_extent(self.block_count, start, count, buf.len())?;
        let mut blocks = self.blocks.lock();
        for (index, chunk) in buf.chunks_exact(VDO_BLOCK_SIZE).enumerate() {
            let pbn = start.0 + index as u64;
            if chunk.iter().all(|byte| *byte == 0) {
                blocks.remove(&pbn);
            } else {
                blocks.insert(pbn, chunk.to_vec());
            }
        }
        Ok(())
    }
}
