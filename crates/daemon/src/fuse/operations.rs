//! Inode-addressed operations behind the kernel bridge
//!
//! Each method resolves the inodes it is given, applies the path policy and
//! the read-only flag, and delegates to the node model or the accessor.

use std::ffi::OsStr;

use bytes::Bytes;
use common::accessor::join_path;
use fuser::FileType;
use tracing::{debug, trace};

use super::attrs::Attrs;
use super::error::{FsError, Result};
use super::file_system::FileSystem;
use super::handles::{DirEntry, DirHandle, OpenHandle, Opened};
use super::node::{remote_node, Node};
use super::node_table::{parent_path, NodeTable};

fn name_str(name: &OsStr) -> Result<&str> {
    let name = name.to_str().ok_or(FsError::InvalidName)?;
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidName);
    }
    Ok(name)
}

impl FileSystem {
    /// Resolves `name` under `parent`. A found node counts as one kernel
    /// reference until it is forgotten.
    pub async fn lookup(&self, parent: u64, name: &OsStr) -> Result<Node> {
        let name = name_str(name)?;
        let node = self.node(parent)?.lookup(self, name).await?;
        self.nodes().remember(&node);
        Ok(node)
    }

    /// Drops kernel references to `inode`.
    pub fn forget(&self, inode: u64, nlookup: u64) {
        if self.nodes().forget(inode, nlookup) {
            trace!(inode, "evicted forgotten node");
        }
    }

    pub async fn getattr(&self, inode: u64) -> Result<Attrs> {
        self.node(inode)?.attr(self).await
    }

    /// Lists the directory once and registers the snapshot as a handle.
    pub async fn open_dir(&self, inode: u64) -> Result<u64> {
        let node = self.node(inode)?;
        if !node.is_dir() {
            return Err(FsError::NotADirectory(node.path().to_string()));
        }

        let children = node.list(self).await?;
        let parent_inode = match &node {
            Node::Root(_) => NodeTable::ROOT_INODE,
            _ => self
                .nodes()
                .inode_of(&parent_path(node.path()))
                .unwrap_or(NodeTable::ROOT_INODE),
        };

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push(DirEntry {
            inode,
            kind: FileType::Directory,
            name: ".".to_string(),
        });
        entries.push(DirEntry {
            inode: parent_inode,
            kind: FileType::Directory,
            name: "..".to_string(),
        });
        entries.extend(children.iter().map(|child| DirEntry {
            inode: child.inode(),
            kind: child.kind(),
            name: child.attrs().name.clone(),
        }));

        Ok(self.register(OpenHandle::Directory(DirHandle::new(entries)))?)
    }

    pub async fn open(&self, inode: u64, flags: i32) -> Result<Opened> {
        self.node(inode)?.open(self, flags).await
    }

    pub async fn read(&self, fh: u64, offset: i64, size: u32) -> Result<Bytes> {
        let offset = u64::try_from(offset)
            .map_err(|_| FsError::Io(std::io::Error::from_raw_os_error(libc::EINVAL)))?;
        self.handle(fh)?.read(offset, size).await
    }

    pub async fn mkdir(&self, parent: u64, name: &OsStr) -> Result<Node> {
        let path = self.writable_child(parent, name)?;
        self.accessor().mkdir(&path).await?;
        let status = self.accessor().stat(&path).await?;
        debug!(path = %path, "created directory");
        let node = remote_node(self, &path, &status);
        self.nodes().remember(&node);
        Ok(node)
    }

    pub async fn unlink(&self, parent: u64, name: &OsStr) -> Result<()> {
        let path = self.writable_child(parent, name)?;
        if self.accessor().stat(&path).await?.is_dir() {
            return Err(FsError::IsADirectory(path));
        }
        self.remove(&path).await
    }

    pub async fn rmdir(&self, parent: u64, name: &OsStr) -> Result<()> {
        let path = self.writable_child(parent, name)?;
        if !self.accessor().stat(&path).await?.is_dir() {
            return Err(FsError::NotADirectory(path));
        }
        self.remove(&path).await
    }

    pub async fn rename(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> Result<()> {
        let from = self.writable_child(parent, name)?;
        let to = self.writable_child(new_parent, new_name)?;
        self.accessor().rename(&from, &to).await?;
        self.nodes().rename(&from, &to);
        debug!(from = %from, to = %to, "renamed");
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.accessor().remove(path).await?;
        self.nodes().remove_path(path);
        debug!(path = %path, "removed");
        Ok(())
    }

    /// Remote path of `name` under `parent`, if the tree may be modified
    /// there.
    fn writable_child(&self, parent: u64, name: &OsStr) -> Result<String> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        let name = name_str(name)?;
        let parent = match self.node(parent)? {
            Node::Root(dir) | Node::Dir(dir) => dir.path,
            Node::ArchiveDir(_) | Node::ArchiveEntry(_) => return Err(FsError::ReadOnly),
            Node::File(file) => return Err(FsError::NotADirectory(file.path)),
        };

        let path = join_path(&parent, name);
        if !self.is_path_allowed(&path) {
            return Err(FsError::Forbidden(path));
        }
        Ok(path)
    }
}
