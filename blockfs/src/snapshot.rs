use crate::alloc::Bitmap;
use crate::fs::FsError;
use crate::io::BlockStorage;
use crate::layout::Geometry;
use crate::node::Tree;
use log::trace;
use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

const SNAPSHOT_MAGIC: u32 = 0x4246_5353; // BFSS
const SNAPSHOT_VERSION: u32 = 1;

/// Bytes taken by [`SnapshotHeader`] at the start of the metadata region.
pub const HEADER_LEN: usize = std::mem::size_of::<SnapshotHeader>();

/// Fixed prefix of the metadata region. Records the layout the snapshot was
/// written for and how many payload bytes follow; the rest of the region is
/// zero padding.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, PartialEq)]
struct SnapshotHeader {
    magic: u32,
    version: u32,
    block_size: u64,
    metadata_size: u64,
    capacity: u64,
    payload_len: u64,
}

impl SnapshotHeader {
    fn new(geometry: &Geometry, payload_len: usize) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            block_size: geometry.block_size(),
            metadata_size: geometry.metadata_size(),
            capacity: geometry.capacity(),
            payload_len: payload_len as u64,
        }
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    free: &'a Bitmap,
    tree: &'a Tree,
}

/// Everything the metadata region holds.
#[derive(Deserialize, Debug)]
pub struct Snapshot {
    pub free: Bitmap,
    pub tree: Tree,
}

/// Encodes the bitmap and tree into a full metadata region image. The image
/// is only produced when it fits.
pub fn encode(geometry: &Geometry, free: &Bitmap, tree: &Tree) -> Result<Vec<u8>, FsError> {
    let payload = bincode::serialize(&SnapshotRef { free, tree })?;
    let budget = geometry.metadata_size() as usize;
    let size = HEADER_LEN + payload.len();
    if size > budget {
        return Err(FsError::SnapshotTooLarge { size, budget });
    }

    let mut region = vec![0; budget];
    region[..HEADER_LEN].copy_from_slice(SnapshotHeader::new(geometry, payload.len()).as_bytes());
    region[HEADER_LEN..size].copy_from_slice(&payload);
    Ok(region)
}

pub fn decode(geometry: &Geometry, region: &[u8]) -> Result<Snapshot, FsError> {
    let header = SnapshotHeader::read_from_prefix(region)
        .ok_or_else(|| FsError::CorruptSnapshot("metadata region too short".to_string()))?;
    if header.magic != SNAPSHOT_MAGIC {
        return Err(FsError::CorruptSnapshot("medium is not formatted".to_string()));
    }
    if header.version != SNAPSHOT_VERSION {
        return Err(FsError::CorruptSnapshot(format!(
            "unsupported snapshot version {}",
            header.version
        )));
    }
    let written_for = (header.block_size, header.metadata_size, header.capacity);
    if written_for != (geometry.block_size(), geometry.metadata_size(), geometry.capacity()) {
        return Err(FsError::CorruptSnapshot(format!(
            "snapshot was written for layout {:?}",
            written_for
        )));
    }

    let end = HEADER_LEN as u64 + header.payload_len;
    if end > region.len() as u64 {
        return Err(FsError::CorruptSnapshot("payload overruns metadata region".to_string()));
    }
    let snapshot: Snapshot = bincode::deserialize(&region[HEADER_LEN..end as usize])?;
    Ok(snapshot)
}

/// Writes the snapshot at offset 0. A snapshot that does not fit is rejected
/// before any byte on the medium changes.
pub fn save<T: BlockStorage>(
    dev: &mut T,
    geometry: &Geometry,
    free: &Bitmap,
    tree: &Tree,
) -> Result<(), FsError> {
    let region = encode(geometry, free, tree)?;
    dev.write_at(0, &region)?;
    trace!("saved snapshot into {} byte metadata region", region.len());
    Ok(())
}

pub fn load<T: BlockStorage>(dev: &mut T, geometry: &Geometry) -> Result<Snapshot, FsError> {
    let mut region = vec![0; geometry.metadata_size() as usize];
    dev.read_at(0, &mut region)?;
    decode(geometry, &region)
}
