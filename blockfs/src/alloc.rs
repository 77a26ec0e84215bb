use crate::fs::FsError;
use crate::io::Offset;
use crate::layout::Geometry;
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// One bit per allocatable block. A set bit marks a free block; bits past
/// `len` in the last word are always clear so they are never handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// A bitmap of `len` blocks, all free.
    pub fn new(len: usize) -> Self {
        let mut words = vec![u64::MAX; len / 64];
        if len % 64 != 0 {
            words.push((1_u64 << (len % 64)) - 1);
        }
        Self { words, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, blocknr: usize) -> State {
        assert!(blocknr < self.len, "block {} outside bitmap", blocknr);
        let mask = 0b01_u64 << (blocknr % 64);
        if self.words[blocknr / 64] & mask != 0 {
            State::Free
        } else {
            State::Used
        }
    }

    pub fn set_reserved(&mut self, blocknr: usize) {
        assert!(blocknr < self.len, "block {} outside bitmap", blocknr);
        self.words[blocknr / 64] &= !(0b01_u64 << (blocknr % 64));
    }

    pub fn set_free(&mut self, blocknr: usize) {
        assert!(blocknr < self.len, "block {} outside bitmap", blocknr);
        self.words[blocknr / 64] |= 0b01_u64 << (blocknr % 64);
    }

    /// Lowest free index.
    pub fn first_free(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find_map(|(word, &bits)| {
                (bits != 0).then(|| word * 64 + bits.trailing_zeros() as usize)
            })
    }

    pub fn free_count(&self) -> usize {
        self.words.iter().map(|bits| bits.count_ones() as usize).sum()
    }

    /// Checks that the word vector matches `len` and no tail bit is set.
    pub fn validate(&self) -> Result<(), FsError> {
        if self.words.len() != self.len.div_ceil(64) {
            return Err(FsError::Inconsistent(format!(
                "bitmap of {} blocks stored in {} words",
                self.len,
                self.words.len()
            )));
        }
        let tail = self.len % 64;
        if tail != 0 && self.words.last().is_some_and(|&last| last >> tail != 0) {
            return Err(FsError::Inconsistent("bitmap marks blocks past its end free".to_string()));
        }
        Ok(())
    }
}

/// First-fit allocator over the bitmap. Lowest index always wins, which keeps
/// block placement reproducible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAllocator {
    map: Bitmap,
    geometry: Geometry,
}

impl BlockAllocator {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            map: Bitmap::new(geometry.block_count()),
            geometry,
        }
    }

    /// Rebuilds an allocator from a persisted bitmap.
    pub fn from_bitmap(map: Bitmap, geometry: Geometry) -> Result<Self, FsError> {
        if map.len() != geometry.block_count() {
            return Err(FsError::CorruptSnapshot(format!(
                "bitmap tracks {} blocks, layout has {}",
                map.len(),
                geometry.block_count()
            )));
        }
        map.validate()?;
        Ok(Self { map, geometry })
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.map
    }

    pub fn free_count(&self) -> usize {
        self.map.free_count()
    }

    /// Number of blocks managed, free or not.
    pub fn block_count(&self) -> usize {
        self.map.len()
    }

    /// Fails unless `needed` blocks can be handed out right now. Callers that
    /// allocate several blocks check this first so a shortage never leaves a
    /// partial allocation behind.
    pub fn reserve(&self, needed: usize) -> Result<(), FsError> {
        if needed > self.free_count() {
            return Err(FsError::OutOfSpace);
        }
        Ok(())
    }

    pub fn allocate(&mut self) -> Result<Offset, FsError> {
        let index = self.map.first_free().ok_or(FsError::OutOfSpace)?;
        self.map.set_reserved(index);
        let address = self.geometry.block_address(index);
        debug!("allocated block {} at {}", index, address);
        Ok(address)
    }

    /// Returns a block to the pool. The caller guarantees the address is
    /// allocated and no longer referenced.
    pub fn free(&mut self, address: Offset) {
        match self.geometry.block_index(address) {
            Some(index) => {
                debug_assert_eq!(self.map.get(index), State::Used, "double free of {}", address);
                self.map.set_free(index);
                debug!("freed block {} at {}", index, address);
            }
            None => unreachable!("freeing {} which is not a block address", address),
        }
    }

    pub fn is_free(&self, address: Offset) -> bool {
        match self.geometry.block_index(address) {
            Some(index) => self.map.get(index) == State::Free,
            None => false,
        }
    }
}
