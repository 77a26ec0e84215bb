use crate::node::{Kind, NodeId, Tree};

/// Path separator.
pub const SEPARATOR: char = '/';

/// A path split into its non-empty segments.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedPath<'a> {
    pub absolute: bool,
    pub segments: Vec<&'a str>,
}

impl<'a> ParsedPath<'a> {
    pub fn parse(path: &'a str) -> Self {
        Self {
            absolute: path.starts_with(SEPARATOR),
            segments: path.split(SEPARATOR).filter(|s| !s.is_empty()).collect(),
        }
    }

    /// The first `n` segments rendered back as a path, for error reporting.
    pub fn prefix(&self, n: usize) -> String {
        let joined = self.segments[..n.min(self.segments.len())].join("/");
        if self.absolute {
            format!("/{}", joined)
        } else {
            joined
        }
    }

    pub fn leaf(&self) -> Option<&'a str> {
        self.segments.last().copied()
    }
}

/// Where a resolved path landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub node: NodeId,
    /// The directory holding `node`. `None` only when the path names the
    /// starting directory itself.
    pub parent: Option<NodeId>,
}

impl Tree {
    /// Walks `path` from `start` (or the root when the path is absolute).
    /// Every segment but the last must name a directory; the last must name a
    /// node of `kind`. An empty path names the start directory.
    pub fn resolve(&self, start: NodeId, path: &ParsedPath<'_>, kind: Kind) -> Option<Located> {
        let mut dir = if path.absolute { NodeId::ROOT } else { start };
        let (leaf, intermediate) = match path.segments.split_last() {
            Some(split) => split,
            None => {
                return (kind == Kind::Directory).then_some(Located {
                    node: dir,
                    parent: None,
                })
            }
        };
        for segment in intermediate {
            dir = self.find_child(dir, segment, Kind::Directory)?;
        }
        let node = self.find_child(dir, leaf, kind)?;
        Some(Located {
            node,
            parent: Some(dir),
        })
    }

    /// Walks as far down `path`'s intermediate directories as exist. Returns
    /// the deepest directory reached and how many segments it consumed.
    pub fn deepest_existing(&self, start: NodeId, path: &ParsedPath<'_>) -> (NodeId, usize) {
        let mut dir = if path.absolute { NodeId::ROOT } else { start };
        let intermediate = path.segments.len().saturating_sub(1);
        for (i, segment) in path.segments[..intermediate].iter().enumerate() {
            match self.find_child(dir, segment, Kind::Directory) {
                Some(next) => dir = next,
                None => return (dir, i),
            }
        }
        (dir, intermediate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Tree, NodeId, NodeId, NodeId) {
        let mut tree = Tree::new();
        let a = tree.insert(NodeId::ROOT, "a", Kind::Directory);
        let b = tree.insert(a, "b", Kind::Directory);
        let f = tree.insert(b, "f", Kind::File);
        (tree, a, b, f)
    }

    #[test]
    fn empty_segments_are_dropped() {
        let parsed = ParsedPath::parse("//a///b/");
        assert!(parsed.absolute);
        assert_eq!(parsed.segments, vec!["a", "b"]);

        let parsed = ParsedPath::parse("a/b");
        assert!(!parsed.absolute);
        assert_eq!(parsed.prefix(1), "a");
        assert_eq!(ParsedPath::parse("/a/b").prefix(2), "/a/b");
    }

    #[test]
    fn resolves_absolute_and_relative_paths() {
        let (tree, a, b, f) = sample();

        let found = tree.resolve(NodeId::ROOT, &ParsedPath::parse("/a/b/f"), Kind::File);
        assert_eq!(found, Some(Located { node: f, parent: Some(b) }));

        let found = tree.resolve(a, &ParsedPath::parse("b/f"), Kind::File);
        assert_eq!(found, Some(Located { node: f, parent: Some(b) }));

        // Absolute paths ignore the starting directory.
        let found = tree.resolve(b, &ParsedPath::parse("/a"), Kind::Directory);
        assert_eq!(found, Some(Located { node: a, parent: Some(NodeId::ROOT) }));
    }

    #[test]
    fn kind_must_match() {
        let (tree, ..) = sample();
        assert_eq!(tree.resolve(NodeId::ROOT, &ParsedPath::parse("/a/b/f"), Kind::Directory), None);
        assert_eq!(tree.resolve(NodeId::ROOT, &ParsedPath::parse("/a/b"), Kind::File), None);
        // A file cannot be walked through.
        assert_eq!(tree.resolve(NodeId::ROOT, &ParsedPath::parse("/a/b/f/g"), Kind::File), None);
    }

    #[test]
    fn empty_path_names_the_start_directory() {
        let (tree, a, ..) = sample();
        assert_eq!(
            tree.resolve(a, &ParsedPath::parse(""), Kind::Directory),
            Some(Located { node: a, parent: None })
        );
        assert_eq!(
            tree.resolve(a, &ParsedPath::parse("/"), Kind::Directory),
            Some(Located { node: NodeId::ROOT, parent: None })
        );
        assert_eq!(tree.resolve(a, &ParsedPath::parse("/"), Kind::File), None);
    }

    #[test]
    fn deepest_existing_stops_at_first_gap() {
        let (tree, a, b, _) = sample();
        assert_eq!(tree.deepest_existing(NodeId::ROOT, &ParsedPath::parse("/a/b/c/d/leaf")), (b, 2));
        assert_eq!(tree.deepest_existing(NodeId::ROOT, &ParsedPath::parse("a/x/leaf")), (a, 1));
        assert_eq!(tree.deepest_existing(a, &ParsedPath::parse("leaf")), (a, 0));
    }
}
