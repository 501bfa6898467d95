//! Index of known folders.
//!
//! Folders are kept in a sorted set keyed by normalized path, plus a map of
//! direct children per parent. Because every strict descendant of `/a`
//! starts with `/a/`, descendants form one contiguous range of the sorted
//! set and never need string splitting to find.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

use tvault_protocol::FolderPath;

/// Set of folder paths with a parent -> children index.
///
/// Root is always present. Inserting a path also inserts its ancestors.
#[derive(Debug, Clone)]
pub struct FolderTree {
    folders: BTreeSet<FolderPath>,
    children: HashMap<FolderPath, BTreeSet<FolderPath>>,
}

impl Default for FolderTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderTree {
    /// A tree holding only root.
    pub fn new() -> Self {
        let mut folders = BTreeSet::new();
        folders.insert(FolderPath::root());
        Self {
            folders,
            children: HashMap::new(),
        }
    }

    /// Builds a tree from arbitrary paths, filling in missing ancestors.
    pub fn from_paths<'a, I>(paths: I) -> Self
    where
        I: IntoIterator<Item = &'a FolderPath>,
    {
        let mut tree = Self::new();
        for path in paths {
            tree.insert(path.clone());
        }
        tree
    }

    pub fn contains(&self, path: &FolderPath) -> bool {
        self.folders.contains(path)
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    /// Always `false`: root is never removed.
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    /// Inserts `path` and any missing ancestors.
    ///
    /// Returns the paths that were actually added, shallowest first.
    pub fn insert(&mut self, path: FolderPath) -> Vec<FolderPath> {
        let mut added = Vec::new();
        let mut current = Some(path);
        while let Some(p) = current {
            if self.folders.contains(&p) {
                break;
            }
            current = p.parent();
            if let Some(parent) = &current {
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .insert(p.clone());
            }
            self.folders.insert(p.clone());
            added.push(p);
        }
        added.reverse();
        added
    }

    /// Direct children of `path`, sorted.
    pub fn children(&self, path: &FolderPath) -> impl Iterator<Item = &FolderPath> {
        self.children.get(path).into_iter().flatten()
    }

    /// Every strict descendant of `path`, sorted.
    pub fn descendants(&self, path: &FolderPath) -> impl Iterator<Item = &FolderPath> {
        let prefix = path.descendant_prefix();
        self.folders
            .range::<str, _>((Bound::Excluded(prefix.as_str()), Bound::Unbounded))
            .take_while(move |p| p.as_str().starts_with(prefix.as_str()))
    }

    /// Removes `path` and all of its descendants, returning them sorted.
    ///
    /// Removing root clears every other folder but keeps root itself.
    pub fn remove_subtree(&mut self, path: &FolderPath) -> Vec<FolderPath> {
        let mut removed: Vec<FolderPath> = self.descendants(path).cloned().collect();
        if !path.is_root() && self.folders.contains(path) {
            removed.insert(0, path.clone());
        }

        for p in &removed {
            self.folders.remove(p);
            self.children.remove(p);
        }
        if let Some(parent) = path.parent() {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.remove(path);
                if siblings.is_empty() {
                    self.children.remove(&parent);
                }
            }
        }
        if path.is_root() {
            self.children.clear();
        }
        removed
    }

    /// All folders in path order, root first.
    pub fn iter(&self) -> impl Iterator<Item = &FolderPath> {
        self.folders.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> FolderPath {
        FolderPath::parse(s).unwrap()
    }

    #[test]
    fn new_tree_has_root() {
        let tree = FolderTree::new();
        assert!(tree.contains(&FolderPath::root()));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn insert_fills_ancestors() {
        let mut tree = FolderTree::new();
        let added = tree.insert(p("/a/b/c"));
        assert_eq!(added, vec![p("/a"), p("/a/b"), p("/a/b/c")]);
        assert!(tree.contains(&p("/a/b")));
        assert!(tree.insert(p("/a/b")).is_empty());
    }

    #[test]
    fn children_are_direct_only() {
        let tree = FolderTree::from_paths(&[p("/a/b/c"), p("/a/x"), p("/z")]);
        let root_children: Vec<_> = tree.children(&FolderPath::root()).collect();
        assert_eq!(root_children, vec![&p("/a"), &p("/z")]);
        let a_children: Vec<_> = tree.children(&p("/a")).collect();
        assert_eq!(a_children, vec![&p("/a/b"), &p("/a/x")]);
        assert_eq!(tree.children(&p("/a/b/c")).count(), 0);
    }

    #[test]
    fn descendants_respect_segment_boundaries() {
        let tree = FolderTree::from_paths(&[p("/A/B"), p("/AB"), p("/A-1")]);
        let d: Vec<_> = tree.descendants(&p("/A")).collect();
        assert_eq!(d, vec![&p("/A/B")]);
        assert_eq!(tree.descendants(&FolderPath::root()).count(), 4);
    }

    #[test]
    fn remove_subtree_cascades() {
        let mut tree = FolderTree::from_paths(&[p("/A/B/C"), p("/A/D"), p("/E")]);
        let removed = tree.remove_subtree(&p("/A"));
        assert_eq!(removed, vec![p("/A"), p("/A/B"), p("/A/B/C"), p("/A/D")]);
        let left: Vec<_> = tree.iter().collect();
        assert_eq!(left, vec![&FolderPath::root(), &p("/E")]);
        let root_children: Vec<_> = tree.children(&FolderPath::root()).collect();
        assert_eq!(root_children, vec![&p("/E")]);
    }

    #[test]
    fn remove_root_keeps_root() {
        let mut tree = FolderTree::from_paths(&[p("/A"), p("/B")]);
        let removed = tree.remove_subtree(&FolderPath::root());
        assert_eq!(removed.len(), 2);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.children(&FolderPath::root()).count(), 0);
    }
}
