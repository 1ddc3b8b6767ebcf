//! Remote storage accessor interface
//!
//! Everything the FUSE layer knows about the remote cluster goes through
//! [`HdfsAccessor`]. Implementations: [`WebHdfsAccessor`](crate::webhdfs::WebHdfsAccessor)
//! talks to a real NameNode, [`FaultTolerantAccessor`](crate::fault_tolerant::FaultTolerantAccessor)
//! adds retries around any other accessor.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;

use crate::error::Result;

/// Cluster-wide usage, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsInfo {
    pub capacity: u64,
    pub remaining: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Metadata of a single remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    /// Last path component (empty for `/`)
    pub name: String,
    pub kind: FileKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Permission bits, e.g. `0o755`
    pub mode: u32,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub owner: String,
    pub group: String,
}

impl FileStatus {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Operations against the remote file system.
///
/// Paths are absolute and `/`-separated without a trailing slash (except `/`).
#[async_trait::async_trait]
pub trait HdfsAccessor: Send + Sync {
    /// Capacity, free and used space of the whole cluster.
    async fn stat_fs(&self) -> Result<FsInfo>;

    /// Verifies that the cluster is reachable.
    async fn ensure_connected(&self) -> Result<()>;

    async fn stat(&self, path: &str) -> Result<FileStatus>;

    async fn read_dir(&self, path: &str) -> Result<Vec<FileStatus>>;

    /// Reads up to `len` bytes starting at `offset`. Returns fewer bytes at
    /// end of file and an empty buffer at or past it.
    async fn read_at(&self, path: &str, offset: u64, len: u32) -> Result<Bytes>;

    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Removes a file or an empty directory.
    async fn remove(&self, path: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

#[async_trait::async_trait]
impl<T: HdfsAccessor + ?Sized> HdfsAccessor for Arc<T> {
    async fn stat_fs(&self) -> Result<FsInfo> {
        (**self).stat_fs().await
    }

    async fn ensure_connected(&self) -> Result<()> {
        (**self).ensure_connected().await
    }

    async fn stat(&self, path: &str) -> Result<FileStatus> {
        (**self).stat(path).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileStatus>> {
        (**self).read_dir(path).await
    }

    async fn read_at(&self, path: &str, offset: u64, len: u32) -> Result<Bytes> {
        (**self).read_at(path, offset, len).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        (**self).remove(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }
}

/// Joins a parent directory path and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" || parent.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}
