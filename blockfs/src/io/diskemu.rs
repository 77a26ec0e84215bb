use crate::io::block::{BlockStorage, Offset};
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

/// Zero-fill chunk used when clearing a medium.
const CLEAR_CHUNK: usize = 4096;

/// Emulates a fixed-size storage device in userspace using a regular file.
pub struct FileBlockEmulator {
    /// The file must be at least `capacity` bytes long.
    fd: File,
    /// The total number of bytes available in the store.
    capacity: u64,
}

impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn check_range(&self, offset: Offset, len: usize) -> std::io::Result<()> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "access out of range",
            )),
        }
    }
}

impl BlockStorage for FileBlockEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, capacity: u64) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        // Return error if the file does not exist rather than create one.
        let file = OpenOptions::new().read(true).write(true).open(dest)?;
        if file.metadata()?.len() < capacity {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                "medium is smaller than the requested capacity",
            ));
        }

        Ok(FileBlockEmulator { fd: file, capacity })
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: Offset, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(offset, buf.len())?;
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.read_exact(buf)
    }

    fn write_at(&mut self, offset: Offset, buf: &[u8]) -> std::io::Result<()> {
        self.check_range(offset, buf.len())?;
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.write_all(buf)
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    capacity: u64,
    clear: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            capacity: 0,
            clear: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of bytes in the emulated device.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = bytes;
        self
    }

    /// Whether to zero the medium on build. Defaults to true; set to false to
    /// reattach to a medium that already holds a file system.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and does
    /// destructive things to prepare the file for use unless told otherwise.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        if self.capacity == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "capacity must be set before building",
            ));
        }

        if self.clear {
            self.zero_medium()?;
        } else if self.fd.metadata()?.len() < self.capacity {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                "medium is smaller than the requested capacity",
            ));
        }

        Ok(FileBlockEmulator {
            fd: self.fd,
            capacity: self.capacity,
        })
    }

    fn zero_medium(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let zeroes = [0x00; CLEAR_CHUNK];
        let mut remaining = self.capacity;
        let mut bfd = BufWriter::new(&self.fd);
        // Buffer each chunk to prevent excessive small writes.
        while remaining > 0 {
            let n = remaining.min(CLEAR_CHUNK as u64) as usize;
            bfd.write_all(&zeroes[..n])?;
            remaining -= n as u64;
        }
        bfd.flush()?;
        drop(bfd);
        self.fd.set_len(self.capacity)
    }
}
