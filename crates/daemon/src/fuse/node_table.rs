//! Inode ↔ node mapping for the mounted tree
//!
//! The kernel addresses everything by 64-bit inode. Each virtual path gets a
//! stable inode the first time it is looked up or listed, and the node stored
//! under it is refreshed on every later lookup.
//!
//! Entries handed to the kernel by a lookup are reference counted the way the
//! kernel counts them, and evicted once the kernel forgets them. Entries that
//! were only listed are evicted when the listing is released.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::node::Node;

#[derive(Debug)]
struct TableState {
    path_to_inode: HashMap<String, u64>,
    nodes: HashMap<u64, Node>,
    lookups: HashMap<u64, u64>,
    next_inode: u64,
}

impl TableState {
    fn evict(&mut self, inode: u64) {
        self.lookups.remove(&inode);
        if let Some(node) = self.nodes.remove(&inode) {
            let path = normalize_path(node.path());
            if self.path_to_inode.get(&path) == Some(&inode) {
                self.path_to_inode.remove(&path);
            }
        }
    }
}

/// Thread-safe table of known nodes
#[derive(Debug)]
pub struct NodeTable {
    state: Mutex<TableState>,
}

impl NodeTable {
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    /// Creates a table holding only `root`
    pub fn new(root: Node) -> Self {
        let mut state = TableState {
            path_to_inode: HashMap::new(),
            nodes: HashMap::new(),
            lookups: HashMap::new(),
            next_inode: Self::ROOT_INODE + 1,
        };
        state.path_to_inode.insert("/".to_string(), Self::ROOT_INODE);
        state.nodes.insert(Self::ROOT_INODE, root);

        Self {
            state: Mutex::new(state),
        }
    }

    /// Stores the node built for `path`, reusing the inode already assigned
    /// to that path or allocating a fresh one.
    pub fn upsert<F>(&self, path: &str, build: F) -> Node
    where
        F: FnOnce(u64) -> Node,
    {
        let normalized = normalize_path(path);
        let mut state = self.state.lock();

        // reuse the inode the kernel may already know for this path
        let inode = match state.path_to_inode.get(&normalized) {
            Some(&inode) => inode,
            None => {
                let inode = state.next_inode;
                state.next_inode += 1;
                state.path_to_inode.insert(normalized, inode);
                inode
            }
        };

        let node = build(inode);
        state.nodes.insert(inode, node.clone());
        node
    }

    /// Counts one kernel reference to `node`, the reply to a lookup or a
    /// create. The node is put back if it was evicted in the meantime.
    pub fn remember(&self, node: &Node) {
        let inode = node.inode();
        let mut state = self.state.lock();
        *state.lookups.entry(inode).or_insert(0) += 1;
        if !state.nodes.contains_key(&inode) {
            state.nodes.insert(inode, node.clone());
            state
                .path_to_inode
                .entry(normalize_path(node.path()))
                .or_insert(inode);
        }
    }

    /// Drops `nlookup` kernel references to `inode`. Returns true when that
    /// was the last one and the node has been evicted. The root is never
    /// evicted.
    pub fn forget(&self, inode: u64, nlookup: u64) -> bool {
        if inode == Self::ROOT_INODE {
            return false;
        }
        let mut state = self.state.lock();
        let remaining = state
            .lookups
            .get(&inode)
            .copied()
            .unwrap_or(0)
            .saturating_sub(nlookup);
        if remaining > 0 {
            state.lookups.insert(inode, remaining);
            return false;
        }
        state.evict(inode);
        true
    }

    /// Evicts those of `inodes` the kernel holds no reference to.
    pub fn evict_unreferenced(&self, inodes: impl IntoIterator<Item = u64>) {
        let mut state = self.state.lock();
        for inode in inodes {
            if inode != Self::ROOT_INODE && !state.lookups.contains_key(&inode) {
                state.evict(inode);
            }
        }
    }

    /// Outstanding kernel references to `inode`.
    pub fn lookup_count(&self, inode: u64) -> u64 {
        self.state.lock().lookups.get(&inode).copied().unwrap_or(0)
    }

    /// Node stored under `inode`, if it has not been evicted.
    pub fn get(&self, inode: u64) -> Option<Node> {
        self.state.lock().nodes.get(&inode).cloned()
    }

    /// Inode currently assigned to `path`.
    pub fn inode_of(&self, path: &str) -> Option<u64> {
        self.state
            .lock()
            .path_to_inode
            .get(&normalize_path(path))
            .copied()
    }

    /// Forgets `path` and everything beneath it.
    pub fn remove_path(&self, path: &str) -> Option<u64> {
        let normalized = normalize_path(path);
        let mut state = self.state.lock();
        let removed = state.path_to_inode.get(&normalized).copied();

        let doomed: Vec<String> = state
            .path_to_inode
            .keys()
            .filter(|candidate| is_same_or_beneath(candidate, &normalized))
            .cloned()
            .collect();
        for key in doomed {
            if let Some(inode) = state.path_to_inode.remove(&key) {
                state.nodes.remove(&inode);
                state.lookups.remove(&inode);
            }
        }
        removed
    }

    /// Moves `old_path` and its descendants under `new_path`, keeping their
    /// inodes. Any node previously known at the destination is forgotten.
    /// Nodes that cannot follow a move (archive contents) are dropped and
    /// will be looked up again.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Option<u64> {
        let old_normalized = normalize_path(old_path);
        let new_normalized = normalize_path(new_path);
        if old_normalized == new_normalized {
            return self.inode_of(&old_normalized);
        }

        self.remove_path(&new_normalized);

        let mut state = self.state.lock();
        let moved: Vec<(String, u64)> = state
            .path_to_inode
            .iter()
            .filter(|(candidate, _)| is_same_or_beneath(candidate, &old_normalized))
            .map(|(path, inode)| (path.clone(), *inode))
            .collect();

        let mut renamed = None;
        for (path, inode) in moved {
            state.path_to_inode.remove(&path);
            let relocated_path = format!("{}{}", new_normalized, &path[old_normalized.len()..]);
            if path == old_normalized {
                renamed = Some(inode);
            }

            let relocated = state
                .nodes
                .remove(&inode)
                .and_then(|node| node.relocated(&relocated_path));
            match relocated {
                Some(node) => {
                    state.path_to_inode.insert(relocated_path, inode);
                    state.nodes.insert(inode, node);
                }
                None => {
                    state.lookups.remove(&inode);
                }
            }
        }
        renamed
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_same_or_beneath(candidate: &str, path: &str) -> bool {
    if path == "/" {
        return true;
    }
    candidate
        .strip_prefix(path)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Normalizes a path to a leading slash and no trailing slash
pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }

    let mut normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Parent of a path (`/` for top-level entries and for `/` itself)
pub fn parent_path(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => normalized[..pos].to_string(),
    }
}

/// Last component of a path
pub fn filename(path: &str) -> &str {
    let trimmed = path.trim().trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}
