use crate::alloc::BlockAllocator;
use crate::file::BlockIo;
use crate::io::{BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder, Offset};
use crate::layout::Geometry;
use crate::node::{FileNode, Kind, Mode, NodeId, Tree};
use crate::path::{Located, ParsedPath};
use crate::shared::SharedFileSystem;
use crate::snapshot;

use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("{0} does not exist")]
    PathNotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("file {0} is already open")]
    AlreadyOpen(String),
    #[error("file is not open")]
    NotOpen,
    #[error("invalid mode: {0}")]
    InvalidMode(String),
    #[error("cannot {op} a file opened in {mode:?} mode")]
    InvalidModeForOperation { op: &'static str, mode: Mode },
    #[error("arguments cannot be negative, got {0}")]
    NegativeArgument(i64),
    #[error("no free blocks left on the medium")]
    OutOfSpace,
    #[error("snapshot of {size} bytes exceeds the {budget} byte metadata region")]
    SnapshotTooLarge { size: usize, budget: usize },
    #[error("cannot move {0} into itself")]
    MoveIntoDescendant(String),
    #[error("invalid layout: {0}")]
    InvalidGeometry(&'static str),
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
    #[error("snapshot encoding failed")]
    Encoding(#[from] bincode::Error),
    #[error("inconsistent file system: {0}")]
    Inconsistent(String),
    #[error("storage error")]
    Io(#[from] std::io::Error),
}

/// The mode string accepted by [`FileSystem::open`]: `r`, `a`, `w`, or any of
/// those followed by `+` for both reading and writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `r`: the file must exist.
    Read,
    /// `a`: the file is created if missing.
    Append,
    /// `w`: the file is recreated empty.
    Write,
    ReadUpdate,
    AppendUpdate,
    WriteUpdate,
}

impl OpenMode {
    /// Access granted to the returned handle.
    pub fn access(self) -> Mode {
        match self {
            OpenMode::Read => Mode::Read,
            OpenMode::Append => Mode::Append,
            OpenMode::Write => Mode::Write,
            OpenMode::ReadUpdate | OpenMode::AppendUpdate | OpenMode::WriteUpdate => Mode::All,
        }
    }

    fn creates(self) -> bool {
        !matches!(self, OpenMode::Read | OpenMode::ReadUpdate)
    }

    fn recreates(self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::WriteUpdate)
    }
}

impl FromStr for OpenMode {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "r" => Ok(OpenMode::Read),
            "a" => Ok(OpenMode::Append),
            "w" => Ok(OpenMode::Write),
            "r+" => Ok(OpenMode::ReadUpdate),
            "a+" => Ok(OpenMode::AppendUpdate),
            "w+" => Ok(OpenMode::WriteUpdate),
            _ => Err(FsError::InvalidMode(s.to_string())),
        }
    }
}

/// Capability for one open file. Handles are only valid until the file is
/// closed or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle {
    node: NodeId,
    serial: u64,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: Kind,
}

/// Where a file's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileExtent {
    pub name: String,
    pub size: u64,
    pub blocks: Vec<Offset>,
}

impl fmt::Display for FileExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} bytes", self.name, self.size)?;
        if !self.blocks.is_empty() {
            write!(f, " at blocks {:?}", self.blocks)?;
        }
        Ok(())
    }
}

/// Rendered directory tree plus every file's extent in depth-first order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    pub tree: String,
    pub files: Vec<FileExtent>,
}

impl fmt::Display for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tree)?;
        if !self.files.is_empty() {
            writeln!(f, "\nFile Memory")?;
            for file in &self.files {
                writeln!(f, "{}", file)?;
            }
        }
        Ok(())
    }
}

struct OpenFile {
    serial: u64,
}

fn non_negative(value: i64) -> Result<u64, FsError> {
    u64::try_from(value).map_err(|_| FsError::NegativeArgument(value))
}

/// An inconsistency found while mounting means the snapshot itself is bad.
fn corrupt(err: FsError) -> FsError {
    match err {
        FsError::Inconsistent(msg) => {
            warn!("refusing to mount: {}", msg);
            FsError::CorruptSnapshot(msg)
        }
        other => other,
    }
}

/// A block file system living inside one backing store.
///
/// Namespace operations resolve slash-delimited paths, absolute or relative
/// to the current directory. Every call that changes the tree or the block
/// bitmap rewrites the snapshot before returning, so the medium always
/// reflects the last successful call.
pub struct FileSystem<T: BlockStorage> {
    dev: T,
    geometry: Geometry,
    alloc: BlockAllocator,
    tree: Tree,
    /// Root first, current directory last. Never empty.
    cwd: Vec<NodeId>,
    open: BTreeMap<NodeId, OpenFile>,
    next_serial: u64,
}

impl FileSystem<FileBlockEmulator> {
    /// Mounts the image at `path`, creating and formatting it first if it
    /// does not exist yet.
    pub fn open_image<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self, FsError> {
        let path = path.as_ref();
        if path.exists() {
            let dev = FileBlockEmulator::open_disk(path, geometry.capacity())?;
            return Self::mount(dev, geometry);
        }
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let dev = FileBlockEmulatorBuilder::from(fd)
            .with_capacity(geometry.capacity())
            .build()?;
        Self::format(dev, geometry)
    }
}

impl<T: BlockStorage> FileSystem<T> {
    /// Writes an empty file system onto `dev`: a bare root directory and every
    /// block free.
    pub fn format(mut dev: T, geometry: Geometry) -> Result<Self, FsError> {
        if dev.capacity() < geometry.capacity() {
            return Err(FsError::InvalidGeometry("device is smaller than the layout"));
        }
        let alloc = BlockAllocator::new(geometry);
        let tree = Tree::new();
        snapshot::save(&mut dev, &geometry, alloc.bitmap(), &tree)?;
        dev.sync_disk()?;
        info!(
            "formatted {} byte medium with {} blocks of {} bytes",
            geometry.capacity(),
            geometry.block_count(),
            geometry.block_size()
        );
        Ok(Self::assemble(dev, geometry, alloc, tree))
    }

    /// Reads the snapshot back from a formatted `dev`. A snapshot that fails
    /// [`FileSystem::verify`] is rejected as `CorruptSnapshot`.
    pub fn mount(mut dev: T, geometry: Geometry) -> Result<Self, FsError> {
        if dev.capacity() < geometry.capacity() {
            return Err(FsError::InvalidGeometry("device is smaller than the layout"));
        }
        let snapshot = snapshot::load(&mut dev, &geometry)?;
        let alloc = BlockAllocator::from_bitmap(snapshot.free, geometry).map_err(corrupt)?;
        let fs = Self::assemble(dev, geometry, alloc, snapshot.tree);
        fs.verify().map_err(corrupt)?;
        info!("mounted file system, {} blocks free", fs.free_blocks());
        Ok(fs)
    }

    fn assemble(dev: T, geometry: Geometry, alloc: BlockAllocator, tree: Tree) -> Self {
        Self {
            dev,
            geometry,
            alloc,
            tree,
            cwd: vec![NodeId::ROOT],
            open: BTreeMap::new(),
            next_serial: 0,
        }
    }

    /// Hands the instance over to a lock so several threads can share it.
    pub fn into_shared(self) -> SharedFileSystem<T> {
        SharedFileSystem::new(self)
    }

    /// Returns the backing store, dropping all open handles.
    pub fn into_device(self) -> T {
        self.dev
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn free_blocks(&self) -> usize {
        self.alloc.free_count()
    }

    pub fn sync(&mut self) -> Result<(), FsError> {
        self.dev.sync_disk()?;
        Ok(())
    }

    fn save(&mut self) -> Result<(), FsError> {
        snapshot::save(&mut self.dev, &self.geometry, self.alloc.bitmap(), &self.tree)
    }

    fn cwd(&self) -> NodeId {
        self.cwd.last().copied().unwrap_or(NodeId::ROOT)
    }

    fn locate(&self, path: &str, kind: Kind) -> Result<Located, FsError> {
        self.tree
            .resolve(self.cwd(), &ParsedPath::parse(path), kind)
            .ok_or_else(|| FsError::PathNotFound(path.to_string()))
    }

    fn locate_with_parent(&self, path: &str, kind: Kind) -> Result<(NodeId, NodeId), FsError> {
        let located = self.locate(path, kind)?;
        match located.parent {
            Some(parent) => Ok((located.node, parent)),
            None => Err(FsError::PathNotFound(path.to_string())),
        }
    }

    /// Creates `path` and any missing directories leading to it.
    fn create_node(&mut self, path: &str, kind: Kind) -> Result<NodeId, FsError> {
        let parsed = ParsedPath::parse(path);
        let leaf = parsed
            .leaf()
            .ok_or_else(|| FsError::PathNotFound(path.to_string()))?;
        let (mut dir, existing) = self.tree.deepest_existing(self.cwd(), &parsed);
        if existing == parsed.segments.len() - 1 && self.tree.find_child(dir, leaf, kind).is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }

        for segment in &parsed.segments[existing..parsed.segments.len() - 1] {
            dir = self.tree.insert(dir, segment, Kind::Directory);
        }
        let node = self.tree.insert(dir, leaf, kind);
        self.save()?;
        debug!("created {} {}", kind, path);
        Ok(node)
    }

    pub fn create(&mut self, path: &str) -> Result<(), FsError> {
        self.create_node(path, Kind::File).map(|_| ())
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        self.create_node(path, Kind::Directory).map(|_| ())
    }

    /// Detaches `node` from `parent` after releasing the blocks of every file
    /// beneath it. Descendants are collected before any child list changes.
    fn remove_subtree(&mut self, node: NodeId, parent: NodeId) {
        let doomed = self.tree.post_order(node);
        let block_size = self.geometry.block_size();
        for &id in &doomed {
            if let Some(file) = self.tree.file_mut(id) {
                BlockIo::new(&mut self.dev, &mut self.alloc, block_size).release(file, 0);
            }
            if self.open.remove(&id).is_some() {
                debug!("dropped open handle of deleted node {:?}", id);
            }
        }
        self.tree.detach(parent, node);

        if let Some(pos) = self.cwd.iter().position(|dir| doomed.contains(dir)) {
            self.cwd.truncate(pos.max(1));
        }
        for id in doomed {
            self.tree.release(id);
        }
    }

    pub fn delete_file(&mut self, path: &str) -> Result<(), FsError> {
        let (node, parent) = self.locate_with_parent(path, Kind::File)?;
        self.remove_subtree(node, parent);
        self.save()?;
        debug!("deleted file {}", path);
        Ok(())
    }

    pub fn delete_dir(&mut self, path: &str) -> Result<(), FsError> {
        let (node, parent) = self.locate_with_parent(path, Kind::Directory)?;
        self.remove_subtree(node, parent);
        self.save()?;
        debug!("deleted directory {}", path);
        Ok(())
    }

    fn move_node(&mut self, src: &str, dest: &str, kind: Kind) -> Result<(), FsError> {
        let (node, parent) = self.locate_with_parent(src, kind)?;
        let target = self.locate(dest, Kind::Directory)?.node;
        if kind == Kind::Directory && self.tree.post_order(node).contains(&target) {
            return Err(FsError::MoveIntoDescendant(src.to_string()));
        }
        let name = self.tree.node(node).name().to_string();
        if target != parent && self.tree.find_child(target, &name, kind).is_some() {
            return Err(FsError::AlreadyExists(format!("{}/{}", dest.trim_end_matches('/'), name)));
        }

        let current = self.cwd();
        self.tree.detach(parent, node);
        self.tree.attach(target, node);
        if let Some(chain) = self.tree.path_to(current) {
            self.cwd = chain;
        }
        self.save()?;
        debug!("moved {} {} to {}", kind, src, dest);
        Ok(())
    }

    pub fn move_file(&mut self, src: &str, dest: &str) -> Result<(), FsError> {
        self.move_node(src, dest, Kind::File)
    }

    /// Moves a directory with everything beneath it. A directory cannot be
    /// moved into itself or one of its descendants.
    pub fn move_dir(&mut self, src: &str, dest: &str) -> Result<(), FsError> {
        self.move_node(src, dest, Kind::Directory)
    }

    /// Changes the current directory. `..` steps up one level (staying at the
    /// root), `.` is ignored. Traversal stops at the first missing directory,
    /// keeping the directories entered so far.
    pub fn chdir(&mut self, path: &str) -> Result<(), FsError> {
        let parsed = ParsedPath::parse(path);
        if parsed.absolute {
            self.cwd.truncate(1);
        }
        for (i, segment) in parsed.segments.iter().enumerate() {
            match *segment {
                "." => {}
                ".." => {
                    if self.cwd.len() > 1 {
                        self.cwd.pop();
                    }
                }
                name => match self.tree.find_child(self.cwd(), name, Kind::Directory) {
                    Some(dir) => self.cwd.push(dir),
                    None => return Err(FsError::PathNotFound(parsed.prefix(i + 1))),
                },
            }
        }
        Ok(())
    }

    /// The current directory as an absolute path.
    pub fn current_path(&self) -> String {
        let names: Vec<&str> = self.cwd[1..]
            .iter()
            .map(|&dir| self.tree.node(dir).name())
            .collect();
        format!("/{}", names.join("/"))
    }

    /// Children of the current directory in creation order. An empty listing
    /// means an empty directory.
    pub fn ls(&self) -> Vec<DirEntry> {
        self.tree
            .children(self.cwd())
            .iter()
            .map(|&child| {
                let node = self.tree.node(child);
                DirEntry {
                    name: node.name().to_string(),
                    kind: node.kind(),
                }
            })
            .collect()
    }

    /// Opens the file at `path`. `w` modes recreate the file, `a` modes create
    /// it when missing. A file can only be open once at a time.
    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, FsError> {
        let found = self.tree.resolve(self.cwd(), &ParsedPath::parse(path), Kind::File);
        if let Some(located) = found {
            if self.open.contains_key(&located.node) {
                return Err(FsError::AlreadyOpen(path.to_string()));
            }
        }

        let node = match found {
            Some(located) if mode.recreates() => {
                if let Some(parent) = located.parent {
                    self.remove_subtree(located.node, parent);
                }
                self.create_node(path, Kind::File)?
            }
            Some(located) => located.node,
            None if mode.creates() => self.create_node(path, Kind::File)?,
            None => return Err(FsError::PathNotFound(path.to_string())),
        };

        if let Some(file) = self.tree.file_mut(node) {
            file.mode = mode.access();
        }
        let serial = self.next_serial;
        self.next_serial += 1;
        self.open.insert(node, OpenFile { serial });
        info!("opened {} as {:?}", path, mode);
        Ok(FileHandle { node, serial })
    }

    pub fn close(&mut self, handle: FileHandle) -> Result<(), FsError> {
        self.check_handle(handle)?;
        self.open.remove(&handle.node);
        if let Some(file) = self.tree.file_mut(handle.node) {
            file.mode = Mode::Unset;
        }
        info!("closed {:?}", handle.node);
        Ok(())
    }

    fn check_handle(&self, handle: FileHandle) -> Result<(), FsError> {
        match self.open.get(&handle.node) {
            Some(open) if open.serial == handle.serial => Ok(()),
            _ => Err(FsError::NotOpen),
        }
    }

    /// Runs `op` against the open file behind `handle`.
    fn with_file<R>(
        &mut self,
        handle: FileHandle,
        op: impl FnOnce(&mut BlockIo<'_, T>, &mut FileNode) -> Result<R, FsError>,
    ) -> Result<R, FsError> {
        self.check_handle(handle)?;
        let block_size = self.geometry.block_size();
        let file = self.tree.file_mut(handle.node).ok_or(FsError::NotOpen)?;
        let mut io = BlockIo::new(&mut self.dev, &mut self.alloc, block_size);
        op(&mut io, file)
    }

    /// Appends `data`, or writes it at `at` when given. Writing past the end
    /// zero-fills the gap.
    pub fn write_to_file(&mut self, handle: FileHandle, data: &[u8], at: Option<i64>) -> Result<(), FsError> {
        let at = at.map(non_negative).transpose()?;
        self.with_file(handle, |io, file| match at {
            Some(at) => io.write_at(file, data, at),
            None => io.append(file, data),
        })?;
        self.save()
    }

    /// Reads the whole file, or `(start, length)` of it. A start beyond the
    /// end reads nothing; the length is clamped to the end of the file.
    pub fn read_from_file(&mut self, handle: FileHandle, range: Option<(i64, i64)>) -> Result<Vec<u8>, FsError> {
        let range = match range {
            Some((start, len)) => Some((non_negative(start)?, non_negative(len)?)),
            None => None,
        };
        self.with_file(handle, |io, file| match range {
            Some((start, len)) => io.read_range(file, start, len),
            None => io.read_all(file),
        })
    }

    pub fn move_within_file(
        &mut self,
        handle: FileHandle,
        source: i64,
        dest: i64,
        len: i64,
    ) -> Result<(), FsError> {
        let (source, dest, len) = (non_negative(source)?, non_negative(dest)?, non_negative(len)?);
        self.with_file(handle, |io, file| io.move_within(file, source, dest, len))?;
        self.save()
    }

    /// Returns the number of blocks given back to the free pool.
    pub fn truncate_file(&mut self, handle: FileHandle, new_size: u64) -> Result<usize, FsError> {
        let freed = self.with_file(handle, |io, file| io.truncate(file, new_size))?;
        self.save()?;
        Ok(freed)
    }

    pub fn stat(&self, handle: FileHandle) -> Result<FileExtent, FsError> {
        self.check_handle(handle)?;
        let node = self.tree.node(handle.node);
        let file = node.as_file().ok_or(FsError::NotOpen)?;
        Ok(FileExtent {
            name: node.name().to_string(),
            size: file.size(),
            blocks: file.blocks().to_vec(),
        })
    }

    /// Draws the directory tree and lists where every file's bytes live.
    pub fn show_memory_map(&self) -> MemoryMap {
        let order = self.tree.pre_order(NodeId::ROOT);
        let mut tree = String::new();
        let mut files = Vec::new();
        // Whether the ancestor at each depth was the last of its siblings.
        let mut last_at_depth: Vec<bool> = Vec::new();

        for (i, &(id, depth)) in order.iter().enumerate() {
            let node = self.tree.node(id);
            if depth == 0 {
                tree.push_str(node.name());
                tree.push('\n');
            } else {
                let is_last = order[i + 1..]
                    .iter()
                    .find(|&&(_, d)| d <= depth)
                    .map_or(true, |&(_, d)| d < depth);
                last_at_depth.truncate(depth - 1);
                for &ancestor_last in &last_at_depth {
                    tree.push_str(if ancestor_last { "     " } else { "│    " });
                }
                tree.push_str(if is_last { "└── " } else { "├── " });
                tree.push_str(node.name());
                if node.kind() == Kind::Directory {
                    tree.push('/');
                }
                tree.push('\n');
                last_at_depth.push(is_last);
            }
            if let Some(file) = node.as_file() {
                files.push(FileExtent {
                    name: node.name().to_string(),
                    size: file.size(),
                    blocks: file.blocks().to_vec(),
                });
            }
        }
        MemoryMap { tree, files }
    }

    /// Checks the bitmap and tree shape, then that every allocated block
    /// belongs to exactly one file, that no file references a free block, and
    /// that every file holds exactly the blocks its size calls for.
    pub fn verify(&self) -> Result<(), FsError> {
        self.alloc.bitmap().validate()?;
        self.tree.validate()?;
        let mut owned = BTreeSet::new();
        for (_, node, file) in self.tree.files() {
            if file.blocks().len() != self.geometry.blocks_for(file.size()) {
                return Err(FsError::Inconsistent(format!(
                    "{} has {} bytes in {} blocks",
                    node.name(),
                    file.size(),
                    file.blocks().len()
                )));
            }
            for &block in file.blocks() {
                if self.geometry.block_index(block).is_none() {
                    return Err(FsError::Inconsistent(format!(
                        "{} references {} which is not a block",
                        node.name(),
                        block
                    )));
                }
                if !owned.insert(block) {
                    return Err(FsError::Inconsistent(format!("block {} is shared", block)));
                }
                if self.alloc.is_free(block) {
                    return Err(FsError::Inconsistent(format!(
                        "{} references free block {}",
                        node.name(),
                        block
                    )));
                }
            }
        }
        let used = self.geometry.block_count() - self.alloc.free_count();
        if used != owned.len() {
            return Err(FsError::Inconsistent(format!(
                "{} blocks allocated but {} referenced",
                used,
                owned.len()
            )));
        }
        Ok(())
    }
}
