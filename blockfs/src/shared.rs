use crate::fs::FileSystem;
use crate::io::BlockStorage;
use log::warn;
use std::sync::{Arc, Mutex, MutexGuard};

/// A file system shared between threads. Each call holds one lock over the
/// whole instance for its full duration, covering the tree, the bitmap and
/// the device together.
pub struct SharedFileSystem<T: BlockStorage> {
    inner: Arc<Mutex<FileSystem<T>>>,
}

impl<T: BlockStorage> Clone for SharedFileSystem<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: BlockStorage> SharedFileSystem<T> {
    pub fn new(fs: FileSystem<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(fs)),
        }
    }

    /// Takes the lock. Hold the guard across a sequence of calls that must
    /// not interleave with other threads.
    pub fn lock(&self) -> MutexGuard<'_, FileSystem<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("recovering file system lock poisoned by a panicked thread");
            poisoned.into_inner()
        })
    }

    /// Runs `op` under the lock.
    pub fn with<R>(&self, op: impl FnOnce(&mut FileSystem<T>) -> R) -> R {
        op(&mut self.lock())
    }
}
