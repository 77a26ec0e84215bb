use crate::alloc::BlockAllocator;
use crate::fs::FsError;
use crate::io::BlockStorage;
use crate::node::{FileNode, Mode};
use log::debug;

/// Byte-level operations on one file's block list. Borrows the device and the
/// allocator for the duration of a single call from the file system.
pub(crate) struct BlockIo<'a, T: BlockStorage> {
    dev: &'a mut T,
    alloc: &'a mut BlockAllocator,
    block_size: u64,
}

fn require(mode: Mode, op: &'static str, read: bool, write: bool) -> Result<(), FsError> {
    if (read && !mode.can_read()) || (write && !mode.can_write()) {
        return Err(FsError::InvalidModeForOperation { op, mode });
    }
    Ok(())
}

impl<'a, T: BlockStorage> BlockIo<'a, T> {
    pub(crate) fn new(dev: &'a mut T, alloc: &'a mut BlockAllocator, block_size: u64) -> Self {
        Self {
            dev,
            alloc,
            block_size,
        }
    }

    fn blocks_for(&self, len: u64) -> usize {
        len.div_ceil(self.block_size) as usize
    }

    /// How many new blocks `file` needs to cover `[0, end)`. Fails with
    /// `OutOfSpace` unless all of them are free right now.
    fn shortfall(&self, file: &FileNode, end: u64) -> Result<usize, FsError> {
        let limit = self.alloc.block_count() as u64 * self.block_size;
        if end > limit {
            return Err(FsError::OutOfSpace);
        }
        let needed = self.blocks_for(end).saturating_sub(file.blocks.len());
        self.alloc.reserve(needed)?;
        Ok(needed)
    }

    /// Grows the block list until it covers `[0, end)`. Either every needed
    /// block is allocated or none is.
    fn grow(&mut self, file: &mut FileNode, end: u64) -> Result<(), FsError> {
        let needed = self.shortfall(file, end)?;
        for _ in 0..needed {
            let block = self.alloc.allocate()?;
            file.blocks.push(block);
        }
        Ok(())
    }

    /// Copies `data` into the file's blocks starting at logical offset `at`.
    /// The block list must already cover the span.
    fn write_span(&mut self, file: &FileNode, at: u64, data: &[u8]) -> Result<(), FsError> {
        let mut pos = at;
        let mut rest = data;
        while !rest.is_empty() {
            let offset = pos % self.block_size;
            let n = rest.len().min((self.block_size - offset) as usize);
            let block = file.blocks[(pos / self.block_size) as usize];
            self.dev.write_at(block + offset, &rest[..n])?;
            pos += n as u64;
            rest = &rest[n..];
        }
        Ok(())
    }

    fn read_span(&mut self, file: &FileNode, at: u64, len: u64) -> Result<Vec<u8>, FsError> {
        let mut data = vec![0; len as usize];
        let mut pos = at;
        let mut filled = 0;
        while filled < data.len() {
            let offset = pos % self.block_size;
            let n = (data.len() - filled).min((self.block_size - offset) as usize);
            let block = file.blocks[(pos / self.block_size) as usize];
            self.dev.read_at(block + offset, &mut data[filled..filled + n])?;
            pos += n as u64;
            filled += n;
        }
        Ok(data)
    }

    /// Zeroes `[file.size, end)` and moves the size up to `end`. Freshly
    /// allocated blocks may hold bytes of files deleted earlier, so the gap is
    /// always written out explicitly.
    fn extend_zeroed(&mut self, file: &mut FileNode, end: u64) -> Result<(), FsError> {
        if end <= file.size {
            return Ok(());
        }
        self.grow(file, end)?;
        let gap = vec![0; (end - file.size) as usize];
        self.write_span(file, file.size, &gap)?;
        file.size = end;
        Ok(())
    }

    pub(crate) fn append(&mut self, file: &mut FileNode, data: &[u8]) -> Result<(), FsError> {
        require(file.mode, "append", false, true)?;
        if data.is_empty() {
            return Ok(());
        }
        let end = file.size + data.len() as u64;
        self.grow(file, end)?;
        self.write_span(file, file.size, data)?;
        file.size = end;
        debug!("appended {} bytes, size now {}", data.len(), file.size);
        Ok(())
    }

    /// Writes `data` at `at`. Writing past the end first fills the gap from
    /// the old end with zeroes.
    pub(crate) fn write_at(&mut self, file: &mut FileNode, data: &[u8], at: u64) -> Result<(), FsError> {
        require(file.mode, "write", false, true)?;
        let end = at + data.len() as u64;
        self.shortfall(file, end)?;
        if at >= file.size {
            self.extend_zeroed(file, at)?;
            return self.append(file, data);
        }
        self.grow(file, end)?;
        self.write_span(file, at, data)?;
        file.size = file.size.max(end);
        debug!("wrote {} bytes at {}, size now {}", data.len(), at, file.size);
        Ok(())
    }

    pub(crate) fn read_all(&mut self, file: &FileNode) -> Result<Vec<u8>, FsError> {
        require(file.mode, "read", true, false)?;
        self.read_span(file, 0, file.size)
    }

    /// Reads up to `len` bytes from `start`. Reading at or past the end yields
    /// nothing.
    pub(crate) fn read_range(&mut self, file: &FileNode, start: u64, len: u64) -> Result<Vec<u8>, FsError> {
        require(file.mode, "read", true, false)?;
        if start >= file.size {
            return Ok(Vec::new());
        }
        let len = len.min(file.size - start);
        self.read_span(file, start, len)
    }

    /// Moves `len` bytes from `source` to `dest`: the source span is captured,
    /// then zeroed, then the captured bytes land at `dest`.
    pub(crate) fn move_within(
        &mut self,
        file: &mut FileNode,
        source: u64,
        dest: u64,
        len: u64,
    ) -> Result<(), FsError> {
        require(file.mode, "move", true, true)?;
        let captured = self.read_range(file, source, len)?;
        let end = (source + len).max(dest + captured.len() as u64);
        self.shortfall(file, end)?;

        self.write_at(file, &vec![0; len as usize], source)?;
        self.write_at(file, &captured, dest)?;
        Ok(())
    }

    /// Shrinks the file to `new_size`, returning every block past the new end
    /// to the allocator. Growing zero-extends instead. Returns the number of
    /// blocks freed.
    pub(crate) fn truncate(&mut self, file: &mut FileNode, new_size: u64) -> Result<usize, FsError> {
        if new_size > file.size {
            self.extend_zeroed(file, new_size)?;
            return Ok(0);
        }
        Ok(self.release(file, new_size))
    }

    /// Truncation that never allocates, so it cannot fail.
    pub(crate) fn release(&mut self, file: &mut FileNode, new_size: u64) -> usize {
        let keep = self.blocks_for(new_size.min(file.size));
        let freed = file.blocks.len().saturating_sub(keep);
        for block in file.blocks.drain(keep.min(file.blocks.len())..) {
            self.alloc.free(block);
        }
        file.size = new_size.min(file.size);
        if freed > 0 {
            debug!("released {} blocks, size now {}", freed, file.size);
        }
        freed
    }
}
