use crate::fs::FsError;
use crate::io::Offset;

/// Size of one block of file content.
pub const DEFAULT_BLOCK_SIZE: u64 = 32;
/// File content starts after the first 100 blocks, which hold the snapshot.
pub const DEFAULT_METADATA_SIZE: u64 = 100 * DEFAULT_BLOCK_SIZE;
/// Total size of the backing store.
pub const DEFAULT_CAPACITY: u64 = 1024 * 10;

/// Shape of the backing store.
///
/// # Layout
/// ==========================================================
/// | Metadata region (snapshot) | Block 0 | Block 1 | ... |
/// ==========================================================
///
/// Block addresses are absolute byte offsets, so block `i` lives at
/// `metadata_size + i * block_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    block_size: u64,
    metadata_size: u64,
    capacity: u64,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            metadata_size: DEFAULT_METADATA_SIZE,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl Geometry {
    pub fn new(block_size: u64, metadata_size: u64, capacity: u64) -> Result<Self, FsError> {
        if block_size == 0 {
            return Err(FsError::InvalidGeometry("block size must be positive"));
        }
        if metadata_size == 0 || metadata_size % block_size != 0 {
            return Err(FsError::InvalidGeometry(
                "metadata region must be a positive multiple of the block size",
            ));
        }
        if metadata_size < crate::snapshot::HEADER_LEN as u64 {
            return Err(FsError::InvalidGeometry(
                "metadata region cannot hold the snapshot header",
            ));
        }
        if capacity < metadata_size + block_size {
            return Err(FsError::InvalidGeometry(
                "capacity leaves no room for a single block",
            ));
        }
        Ok(Self {
            block_size,
            metadata_size,
            capacity,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn metadata_size(&self) -> u64 {
        self.metadata_size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of allocatable blocks. A trailing partial block is unused.
    pub fn block_count(&self) -> usize {
        ((self.capacity - self.metadata_size) / self.block_size) as usize
    }

    pub fn block_address(&self, index: usize) -> Offset {
        self.metadata_size + index as u64 * self.block_size
    }

    /// Inverse of [`Geometry::block_address`]. Returns `None` for offsets that
    /// are unaligned or outside the allocatable region.
    pub fn block_index(&self, address: Offset) -> Option<usize> {
        if address < self.metadata_size {
            return None;
        }
        let relative = address - self.metadata_size;
        if relative % self.block_size != 0 {
            return None;
        }
        let index = (relative / self.block_size) as usize;
        (index < self.block_count()).then_some(index)
    }

    /// Number of blocks needed to hold `len` bytes.
    pub fn blocks_for(&self, len: u64) -> usize {
        len.div_ceil(self.block_size) as usize
    }
}
