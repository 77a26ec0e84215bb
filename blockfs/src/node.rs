use crate::fs::FsError;
use crate::io::Offset;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the root directory.
pub const ROOT_NAME: &str = "/";

/// Index of a node slot in the [`Tree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    Directory,
    File,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Directory => write!(f, "directory"),
            Kind::File => write!(f, "file"),
        }
    }
}

/// Access granted to the handle that currently has a file open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Unset,
    Read,
    Append,
    Write,
    All,
}

impl Mode {
    pub fn can_read(self) -> bool {
        matches!(self, Mode::Read | Mode::All)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Mode::Append | Mode::Write | Mode::All)
    }
}

/// A file's content map. `blocks[i]` holds bytes `[i * block_size, (i + 1) * block_size)`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileNode {
    pub(crate) size: u64,
    pub(crate) blocks: Vec<Offset>,
    /// Runtime only: no handle survives a remount.
    #[serde(skip)]
    pub(crate) mode: Mode,
}

impl FileNode {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn blocks(&self) -> &[Offset] {
        &self.blocks
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Directory(Vec<NodeId>),
    File(FileNode),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    name: String,
    kind: NodeKind,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Kind {
        match self.kind {
            NodeKind::Directory(_) => Kind::Directory,
            NodeKind::File(_) => Kind::File,
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match &self.kind {
            NodeKind::File(file) => Some(file),
            NodeKind::Directory(_) => None,
        }
    }
}

/// All directories and files of one file system. The tree owns every node by
/// slot; directories list their children by id and nothing points upward, so
/// walks start at the root or at an id the caller already holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    slots: Vec<Option<Node>>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            slots: vec![Some(Node {
                name: ROOT_NAME.to_string(),
                kind: NodeKind::Directory(Vec::new()),
            })],
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        match self.get(id) {
            Some(node) => node,
            None => unreachable!("dangling node id {:?}", id),
        }
    }

    pub fn children(&self, dir: NodeId) -> &[NodeId] {
        match &self.node(dir).kind {
            NodeKind::Directory(children) => children,
            NodeKind::File(_) => &[],
        }
    }

    pub fn file_mut(&mut self, id: NodeId) -> Option<&mut FileNode> {
        match self.slots.get_mut(id.index()) {
            Some(Some(Node {
                kind: NodeKind::File(file),
                ..
            })) => Some(file),
            _ => None,
        }
    }

    /// Looks up a direct child of `dir` by exact name and kind.
    pub fn find_child(&self, dir: NodeId, name: &str, kind: Kind) -> Option<NodeId> {
        self.children(dir).iter().copied().find(|&child| {
            let node = self.node(child);
            node.name == name && node.kind() == kind
        })
    }

    /// Creates a node and appends it to `parent`'s children.
    pub fn insert(&mut self, parent: NodeId, name: &str, kind: Kind) -> NodeId {
        let node = Node {
            name: name.to_string(),
            kind: match kind {
                Kind::Directory => NodeKind::Directory(Vec::new()),
                Kind::File => NodeKind::File(FileNode::default()),
            },
        };
        let id = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(node);
                NodeId(free as u32)
            }
            None => {
                self.slots.push(Some(node));
                NodeId((self.slots.len() - 1) as u32)
            }
        };
        self.attach(parent, id);
        id
    }

    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        if let Some(Some(Node {
            kind: NodeKind::Directory(children),
            ..
        })) = self.slots.get_mut(parent.index())
        {
            children.push(child);
        }
    }

    pub fn detach(&mut self, parent: NodeId, child: NodeId) {
        if let Some(Some(Node {
            kind: NodeKind::Directory(children),
            ..
        })) = self.slots.get_mut(parent.index())
        {
            children.retain(|&c| c != child);
        }
    }

    /// Frees the slot of a node that is already detached from its parent.
    pub fn release(&mut self, id: NodeId) {
        if id != NodeId::ROOT {
            if let Some(slot) = self.slots.get_mut(id.index()) {
                *slot = None;
            }
        }
        // Keep the arena from growing with dead slots at the end.
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
    }

    /// `id` and all of its descendants, children before parents.
    pub fn post_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            stack.push((node, true));
            for &child in self.children(node).iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }

    /// Depth-first, parents before children, in child-list order, paired with
    /// the node's depth below `id`.
    pub fn pre_order(&self, id: NodeId) -> Vec<(NodeId, usize)> {
        let mut order = Vec::new();
        let mut stack = vec![(id, 0)];
        while let Some((node, depth)) = stack.pop() {
            order.push((node, depth));
            for &child in self.children(node).iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        order
    }

    /// The chain of directories from the root down to `target`.
    pub fn path_to(&self, target: NodeId) -> Option<Vec<NodeId>> {
        let mut chain = vec![NodeId::ROOT];
        if self.descend_to(NodeId::ROOT, target, &mut chain) {
            Some(chain)
        } else {
            None
        }
    }

    fn descend_to(&self, from: NodeId, target: NodeId, chain: &mut Vec<NodeId>) -> bool {
        if from == target {
            return true;
        }
        for &child in self.children(from) {
            chain.push(child);
            if self.descend_to(child, target, chain) {
                return true;
            }
            chain.pop();
        }
        false
    }

    /// Checks the arena shape: the root is a directory, every child id names a
    /// live slot, and every live node hangs off exactly one directory reachable
    /// from the root. Cycles and shared children fail the last check.
    pub fn validate(&self) -> Result<(), FsError> {
        if self.get(NodeId::ROOT).map(Node::kind) != Some(Kind::Directory) {
            return Err(FsError::Inconsistent("root is not a directory".to_string()));
        }
        let mut seen = vec![false; self.slots.len()];
        seen[NodeId::ROOT.index()] = true;
        let mut pending = vec![NodeId::ROOT];
        while let Some(dir) = pending.pop() {
            for &child in self.children(dir) {
                if self.get(child).is_none() {
                    return Err(FsError::Inconsistent(format!("dangling child {:?}", child)));
                }
                if seen[child.index()] {
                    return Err(FsError::Inconsistent(format!("{:?} is linked more than once", child)));
                }
                seen[child.index()] = true;
                pending.push(child);
            }
        }
        let live = self.slots.iter().filter(|slot| slot.is_some()).count();
        let reached = seen.iter().filter(|&&s| s).count();
        if live != reached {
            return Err(FsError::Inconsistent(format!(
                "{} nodes are unreachable from the root",
                live - reached
            )));
        }
        Ok(())
    }

    /// Every live file node.
    pub fn files(&self) -> impl Iterator<Item = (NodeId, &Node, &FileNode)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            let node = slot.as_ref()?;
            let file = node.as_file()?;
            Some((NodeId(i as u32), node, file))
        })
    }
}
