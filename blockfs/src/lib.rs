//! A block file system emulated inside a single backing file.
//!
//! The store is split into a metadata region holding a snapshot of the whole
//! namespace and a run of fixed-size blocks holding file content. Files map
//! their byte stream onto a non-contiguous list of blocks handed out by a
//! first-fit bitmap allocator.
//!
//! ```no_run
//! use blockfs::{FileSystem, Geometry, OpenMode};
//!
//! let mut fs = FileSystem::open_image("sample.dat", Geometry::default())?;
//! fs.mkdir("/docs")?;
//! let handle = fs.open("/docs/notes", OpenMode::WriteUpdate)?;
//! fs.write_to_file(handle, b"hello", None)?;
//! assert_eq!(fs.read_from_file(handle, None)?, b"hello");
//! fs.close(handle)?;
//! # Ok::<(), blockfs::FsError>(())
//! ```
mod alloc;
mod file;
mod fs;
pub mod io;
mod layout;
mod node;
mod path;
mod shared;
mod snapshot;

pub use crate::alloc::{Bitmap, BlockAllocator, State};
pub use crate::fs::{DirEntry, FileExtent, FileHandle, FileSystem, FsError, MemoryMap, OpenMode};
pub use crate::layout::{Geometry, DEFAULT_BLOCK_SIZE, DEFAULT_CAPACITY, DEFAULT_METADATA_SIZE};
pub use crate::node::{Kind, Mode};
pub use crate::shared::SharedFileSystem;
