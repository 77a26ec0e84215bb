mod block;
mod diskemu;

pub use block::{BlockStorage, Offset};
pub use diskemu::{FileBlockEmulator, FileBlockEmulatorBuilder};
