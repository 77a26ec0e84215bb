use std::path::Path;

/// An absolute byte offset into the backing store.
pub type Offset = u64;

/// Byte-addressed storage of a fixed capacity. The file system never asks for
/// anything but positioned reads and writes, so there is no notion of a
/// current position here.
pub trait BlockStorage {
    /// Opens an existing medium at the specified path. This method does not
    /// validate the contents, it is up for clients to ensure media are formatted.
    ///
    /// # Errors
    ///
    /// Fails if the file does not exist or is smaller than `capacity` bytes.
    fn open_disk<P: AsRef<Path>>(path: P, capacity: u64) -> std::io::Result<Self>
    where
        Self: std::marker::Sized;
    /// Total number of addressable bytes.
    fn capacity(&self) -> u64;
    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Attempting to read past the capacity will return an error.
    fn read_at(&mut self, offset: Offset, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes all of `buf` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Attempting to write past the capacity will return an error.
    fn write_at(&mut self, offset: Offset, buf: &[u8]) -> std::io::Result<()>;
    /// Flush any buffered IO from memory. This is useful if it must guaranteed
    /// the writes actually occurred, for instance, if being re-read by another
    /// process.
    fn sync_disk(&mut self) -> std::io::Result<()>;
}
