//! Path reconstruction from (id -> name, parent) links
//!
//! Every parser feeds the names it finds (MFT `$FILE_NAME` parents, ext4
//! directory entries, APFS directory records) into a [`DirectoryTree`] and
//! asks it for full paths afterwards.

use std::collections::{HashMap, HashSet};

/// Directory under which entries with a broken parent chain are listed
pub const ORPHAN_DIR: &str = "$Orphan";

#[derive(Debug, Clone)]
struct DirNode {
    name: String,
    parent: u64,
    /// Came from a live directory entry rather than residual data
    live: bool,
}

/// Name/parent graph with cached path lookups
#[derive(Debug, Clone)]
pub struct DirectoryTree {
    nodes: HashMap<u64, DirNode>,
    paths: HashMap<u64, String>,
    root: u64,
    max_depth: u32,
}

impl DirectoryTree {
    pub fn new(root: u64, max_depth: u32) -> Self {
        Self {
            nodes: HashMap::new(),
            paths: HashMap::new(),
            root,
            max_depth,
        }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// Record a name from a live directory entry. Replaces residual names.
    pub fn insert(&mut self, id: u64, name: impl Into<String>, parent: u64) {
        if let Some(existing) = self.nodes.get(&id) {
            if existing.live {
                return;
            }
        }
        self.nodes.insert(
            id,
            DirNode {
                name: name.into(),
                parent,
                live: true,
            },
        );
        self.paths.clear();
    }

    /// Record a name recovered from slack or a deleted entry. Never replaces
    /// an existing name.
    pub fn insert_residual(&mut self, id: u64, name: impl Into<String>, parent: u64) {
        if self.nodes.contains_key(&id) {
            return;
        }
        self.nodes.insert(
            id,
            DirNode {
                name: name.into(),
                parent,
                live: false,
            },
        );
        self.paths.clear();
    }

    pub fn contains(&self, id: u64) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn name_of(&self, id: u64) -> Option<&str> {
        self.nodes.get(&id).map(|n| n.name.as_str())
    }

    pub fn parent_of(&self, id: u64) -> Option<u64> {
        self.nodes.get(&id).map(|n| n.parent)
    }

    /// Whether the name for `id` came only from residual data
    pub fn is_residual(&self, id: u64) -> bool {
        self.nodes.get(&id).is_some_and(|n| !n.live)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Absolute path for `id`.
    ///
    /// A chain that never reaches the root (unknown parent, cycle or depth
    /// bound) is placed under `/$Orphan`.
    pub fn resolve(&mut self, id: u64) -> Option<String> {
        if id == self.root {
            return Some("/".to_string());
        }
        if let Some(path) = self.paths.get(&id) {
            return Some(path.clone());
        }
        self.nodes.get(&id)?;

        let mut components = Vec::new();
        let mut visited = HashSet::new();
        let mut current = id;
        let mut reached_root = false;

        while components.len() < self.max_depth as usize {
            if !visited.insert(current) {
                tracing::debug!("Parent chain of {} loops at {}", id, current);
                break;
            }
            let Some(node) = self.nodes.get(&current) else {
                break;
            };
            components.push(node.name.as_str());
            if node.parent == self.root {
                reached_root = true;
                break;
            }
            if node.parent == current {
                break;
            }
            current = node.parent;
        }

        components.reverse();
        let joined = components.join("/");
        let path = if reached_root {
            format!("/{}", joined)
        } else {
            format!("/{}/{}", ORPHAN_DIR, joined)
        };

        self.paths.insert(id, path.clone());
        Some(path)
    }
}
