//! Nodes of the mounted tree
//!
//! A closed set of node kinds covers everything the kernel can address: the
//! mount root, remote directories and files, and the virtual contents of
//! expanded archives. The bridge resolves an inode to a [`Node`] and
//! dispatches on its variant.

use std::sync::Arc;

use common::accessor::{join_path, FileStatus};
use fuser::FileType;
use tracing::debug;

use super::archive::{
    archive_name_of, expanded_name, is_archive_name, ArchiveDirNode, ArchiveEntryNode,
    ArchiveSource,
};
use super::attrs::Attrs;
use super::error::{FsError, Result};
use super::file_system::FileSystem;
use super::handles::{FileHandle, OpenHandle, Opened};
use super::node_table::filename;

#[derive(Debug, Clone)]
pub enum Node {
    Root(DirNode),
    Dir(DirNode),
    File(FileNode),
    ArchiveDir(ArchiveDirNode),
    ArchiveEntry(ArchiveEntryNode),
}

impl Node {
    pub fn attrs(&self) -> &Attrs {
        match self {
            Node::Root(dir) | Node::Dir(dir) => &dir.attrs,
            Node::File(file) => &file.attrs,
            Node::ArchiveDir(dir) => &dir.attrs,
            Node::ArchiveEntry(entry) => entry.attr(),
        }
    }

    pub fn inode(&self) -> u64 {
        self.attrs().inode
    }

    pub fn kind(&self) -> FileType {
        self.attrs().kind
    }

    pub fn is_dir(&self) -> bool {
        self.attrs().is_dir()
    }

    /// Virtual path of the node under the mount point.
    pub fn path(&self) -> &str {
        match self {
            Node::Root(dir) | Node::Dir(dir) => &dir.path,
            Node::File(file) => &file.path,
            Node::ArchiveDir(dir) => &dir.path,
            Node::ArchiveEntry(entry) => &entry.path,
        }
    }

    /// Whether the node lives inside an expanded archive.
    pub fn is_archive_content(&self) -> bool {
        matches!(self, Node::ArchiveDir(_) | Node::ArchiveEntry(_))
    }

    /// The node moved to `new_path`, or `None` if it cannot follow a rename.
    pub(crate) fn relocated(self, new_path: &str) -> Option<Node> {
        match self {
            Node::Dir(mut dir) => {
                dir.relocate(new_path);
                Some(Node::Dir(dir))
            }
            Node::File(mut file) => {
                file.path = new_path.to_string();
                file.attrs.name = filename(new_path).to_string();
                Some(Node::File(file))
            }
            Node::Root(_) | Node::ArchiveDir(_) | Node::ArchiveEntry(_) => None,
        }
    }

    /// Current attributes. Remote nodes are re-read from the cluster;
    /// a node that disappeared upstream is forgotten.
    pub async fn attr(&self, fs: &FileSystem) -> Result<Attrs> {
        let path = match self {
            Node::Dir(dir) => &dir.path,
            Node::File(file) => &file.path,
            Node::Root(_) | Node::ArchiveDir(_) | Node::ArchiveEntry(_) => {
                return Ok(self.attrs().clone())
            }
        };

        match fs.accessor().stat(path).await {
            Ok(status) => Ok(remote_node(fs, path, &status).attrs().clone()),
            Err(e) => {
                if matches!(e, common::error::AccessorError::NotFound(_)) {
                    fs.nodes().remove_path(path);
                }
                Err(e.into())
            }
        }
    }

    pub async fn list(&self, fs: &FileSystem) -> Result<Vec<Node>> {
        match self {
            Node::Root(dir) | Node::Dir(dir) => dir.list(fs).await,
            Node::ArchiveDir(dir) => dir.list(fs).await,
            Node::File(_) | Node::ArchiveEntry(_) => {
                Err(FsError::NotADirectory(self.path().to_string()))
            }
        }
    }

    pub async fn lookup(&self, fs: &FileSystem, name: &str) -> Result<Node> {
        match self {
            Node::Root(dir) | Node::Dir(dir) => dir.lookup(fs, name).await,
            Node::ArchiveDir(dir) => dir.lookup(fs, name).await,
            Node::File(_) | Node::ArchiveEntry(_) => {
                Err(FsError::NotADirectory(self.path().to_string()))
            }
        }
    }

    pub async fn open(&self, fs: &FileSystem, flags: i32) -> Result<Opened> {
        match self {
            Node::File(file) => file.open(fs, flags).await,
            Node::ArchiveEntry(entry) => {
                if is_write_open(flags) {
                    return Err(FsError::ReadOnly);
                }
                entry.open().await
            }
            Node::Root(_) | Node::Dir(_) | Node::ArchiveDir(_) => {
                Err(FsError::IsADirectory(self.path().to_string()))
            }
        }
    }
}

fn is_write_open(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0
}

/// Remote directory, or the mount root.
#[derive(Debug, Clone)]
pub struct DirNode {
    pub path: String,
    pub attrs: Attrs,
}

impl DirNode {
    fn relocate(&mut self, new_path: &str) {
        self.path = new_path.to_string();
        self.attrs.name = filename(new_path).to_string();
    }

    /// Children visible through the path policy. With archive expansion
    /// on, every archive is followed by its expanded directory.
    pub async fn list(&self, fs: &FileSystem) -> Result<Vec<Node>> {
        let statuses = fs.accessor().read_dir(&self.path).await?;
        let mut nodes = Vec::with_capacity(statuses.len());

        for status in statuses {
            let child = join_path(&self.path, &status.name);
            if !fs.is_path_allowed(&child) {
                continue;
            }
            let expand = fs.expand_zips() && !status.is_dir() && is_archive_name(&status.name);
            nodes.push(remote_node(fs, &child, &status));
            if expand {
                nodes.push(archive_root_node(fs, &child, &status));
            }
        }

        debug!(path = %self.path, entries = nodes.len(), "listed directory");
        Ok(nodes)
    }

    pub async fn lookup(&self, fs: &FileSystem, name: &str) -> Result<Node> {
        if fs.expand_zips() {
            if let Some(archive) = archive_name_of(name) {
                let archive_path = join_path(&self.path, archive);
                if !fs.is_path_allowed(&archive_path) {
                    return Err(FsError::NotFound(join_path(&self.path, name)));
                }
                let status = fs.accessor().stat(&archive_path).await?;
                if status.is_dir() {
                    return Err(FsError::NotFound(join_path(&self.path, name)));
                }
                return Ok(archive_root_node(fs, &archive_path, &status));
            }
        }

        let child = join_path(&self.path, name);
        if !fs.is_path_allowed(&child) {
            return Err(FsError::NotFound(child));
        }
        let status = fs.accessor().stat(&child).await?;
        Ok(remote_node(fs, &child, &status))
    }
}

/// Remote regular file.
#[derive(Debug, Clone)]
pub struct FileNode {
    pub path: String,
    pub attrs: Attrs,
}

impl FileNode {
    /// Opens the file for reading. Writing through the mount is not
    /// supported; on a read-only mount it is refused as such.
    pub async fn open(&self, fs: &FileSystem, flags: i32) -> Result<Opened> {
        if is_write_open(flags) {
            return Err(if fs.is_read_only() {
                FsError::ReadOnly
            } else {
                FsError::NotSupported("write")
            });
        }

        let handle = FileHandle::new(fs.accessor().clone(), self.path.clone());
        let fh = fs.register(OpenHandle::File(handle))?;
        Ok(Opened { fh, flags: 0 })
    }
}

/// Node for a remote path, refreshed in the node table.
pub(crate) fn remote_node(fs: &FileSystem, path: &str, status: &FileStatus) -> Node {
    fs.nodes().upsert(path, |inode| {
        let attrs = Attrs::from_status(inode, status, fs.identity());
        if status.is_dir() {
            Node::Dir(DirNode {
                path: path.to_string(),
                attrs,
            })
        } else {
            Node::File(FileNode {
                path: path.to_string(),
                attrs,
            })
        }
    })
}

/// Expanded directory of the archive at `archive_path`. The loaded index is
/// kept as long as the archive's size and modification time are unchanged.
fn archive_root_node(fs: &FileSystem, archive_path: &str, status: &FileStatus) -> Node {
    let path = expanded_name(archive_path);
    let known = fs.nodes().inode_of(&path).and_then(|inode| fs.nodes().get(inode));
    let source = match known {
        Some(Node::ArchiveDir(dir)) if dir.source().matches(status.size, status.mtime) => {
            dir.source().clone()
        }
        _ => Arc::new(ArchiveSource::new(archive_path, status.size, status.mtime)),
    };

    fs.nodes().upsert(&path, |inode| {
        let mut attrs = Attrs::from_status(inode, status, fs.identity());
        attrs.name = expanded_name(&status.name);
        attrs.kind = FileType::Directory;
        attrs.perm = 0o555;
        attrs.size = 0;
        Node::ArchiveDir(ArchiveDirNode::root(path.clone(), attrs, source))
    })
}
