use dfs_lib::{DfsError, DfsPath, DfsResult, StorageId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// One node of the directory tree. A file node carries the identities of
/// every storage node currently hosting its contents.
#[derive(Debug, Clone)]
pub enum FsNode {
    Dir { children: HashMap<String, FsNode> },
    File { replicas: Vec<StorageId> },
}

impl FsNode {
    pub fn new_dir() -> Self {
        FsNode::Dir {
            children: HashMap::new(),
        }
    }

    pub fn new_file(storage: StorageId) -> Self {
        FsNode::File {
            replicas: vec![storage],
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            FsNode::Dir { .. } => NodeKind::Directory,
            FsNode::File { .. } => NodeKind::File,
        }
    }
}

/// Outcome of offering a file during storage registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    /// Something already occupies the path (or an intermediate component is
    /// a file); the offering storage node must drop its local copy.
    Duplicate,
}

/// The in-memory directory tree. The tree itself is not synchronized; the
/// owner guards it with a mutex and keeps critical sections short. Semantic
/// serialization between clients is the lock table's job.
#[derive(Debug)]
pub struct DirTree {
    root: FsNode,
}

impl DirTree {
    pub fn new() -> Self {
        Self {
            root: FsNode::new_dir(),
        }
    }

    pub fn resolve(&self, path: &DfsPath) -> Option<&FsNode> {
        let mut current = &self.root;
        for component in path.iter() {
            match current {
                FsNode::Dir { children } => current = children.get(component)?,
                FsNode::File { .. } => return None,
            }
        }
        Some(current)
    }

    fn resolve_mut(&mut self, path: &DfsPath) -> Option<&mut FsNode> {
        let mut current = &mut self.root;
        for component in path.iter() {
            match current {
                FsNode::Dir { children } => current = children.get_mut(component)?,
                FsNode::File { .. } => return None,
            }
        }
        Some(current)
    }

    pub fn contains(&self, path: &DfsPath) -> bool {
        self.resolve(path).is_some()
    }

    pub fn node_kind(&self, path: &DfsPath) -> Option<NodeKind> {
        self.resolve(path).map(|n| n.kind())
    }

    /// Snapshot of a directory's child names. `None` when the path does not
    /// resolve to a directory.
    pub fn children(&self, path: &DfsPath) -> Option<Vec<String>> {
        match self.resolve(path)? {
            FsNode::Dir { children } => Some(children.keys().cloned().collect()),
            FsNode::File { .. } => None,
        }
    }

    /// Inserts a node at `path`. The parent must already resolve to a
    /// directory and the leaf must be absent.
    pub fn insert(&mut self, path: &DfsPath, node: FsNode) -> DfsResult<()> {
        let (parent, name) = match (path.parent(), path.last()) {
            (Some(parent), Some(name)) => (parent, name.to_string()),
            _ => {
                return Err(DfsError::InvalidArgument(
                    "cannot insert at the root".to_string(),
                ))
            }
        };
        match self.resolve_mut(&parent) {
            Some(FsNode::Dir { children }) => {
                if children.contains_key(&name) {
                    return Err(DfsError::AlreadyExists(path.to_string()));
                }
                children.insert(name, node);
                Ok(())
            }
            _ => Err(DfsError::NotFound(format!("no directory at {}", parent))),
        }
    }

    /// Removes the node at `path` from its parent and returns it. `None`
    /// when the path is the root or does not resolve.
    pub fn remove(&mut self, path: &DfsPath) -> Option<FsNode> {
        let parent = path.parent()?;
        let name = path.last()?.to_string();
        match self.resolve_mut(&parent)? {
            FsNode::Dir { children } => children.remove(&name),
            FsNode::File { .. } => None,
        }
    }

    /// Places a file offered at registration time, creating intermediate
    /// directories as needed. Collisions of any kind are duplicates.
    pub fn register_file(&mut self, path: &DfsPath, storage: StorageId) -> RegisterOutcome {
        if path.is_root() {
            return RegisterOutcome::Duplicate;
        }

        let components = path.components();
        let mut current = &mut self.root;
        for (i, component) in components.iter().enumerate() {
            let is_last = i + 1 == components.len();
            let children = match current {
                FsNode::Dir { children } => children,
                // An intermediate component is a file; the offered path can
                // never enter the tree.
                FsNode::File { .. } => return RegisterOutcome::Duplicate,
            };
            if is_last {
                if children.contains_key(component.as_str()) {
                    return RegisterOutcome::Duplicate;
                }
                children.insert(component.clone(), FsNode::new_file(storage));
                return RegisterOutcome::Inserted;
            }
            current = children
                .entry(component.clone())
                .or_insert_with(FsNode::new_dir);
        }
        RegisterOutcome::Duplicate
    }

    pub fn replicas(&self, path: &DfsPath) -> Option<Vec<StorageId>> {
        match self.resolve(path)? {
            FsNode::File { replicas } => Some(replicas.clone()),
            FsNode::Dir { .. } => None,
        }
    }

    pub fn add_replica(&mut self, path: &DfsPath, storage: StorageId) {
        if let Some(FsNode::File { replicas }) = self.resolve_mut(path) {
            if !replicas.contains(&storage) {
                replicas.push(storage);
            }
        }
    }

    pub fn remove_replica(&mut self, path: &DfsPath, storage: &StorageId) {
        if let Some(FsNode::File { replicas }) = self.resolve_mut(path) {
            replicas.retain(|s| s != storage);
        }
    }
}

impl Default for DirTree {
    fn default() -> Self {
        Self::new()
    }
}
