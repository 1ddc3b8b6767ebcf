//! Open file and directory handles tracked by the registry

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use common::accessor::HdfsAccessor;
use fuser::FileType;
use tracing::trace;

use super::archive::ArchiveEntryHandle;
use super::error::FsError;
use super::registry::Resource;

pub use fuser::consts::{FOPEN_DIRECT_IO, FOPEN_NONSEEKABLE};

/// Reply to a successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    pub fh: u64,
    pub flags: u32,
}

impl Opened {
    pub fn is_seekable(&self) -> bool {
        self.flags & FOPEN_NONSEEKABLE == 0
    }
}

/// Remote file opened for reading. Reads go straight to the accessor.
pub struct FileHandle {
    accessor: Arc<dyn HdfsAccessor>,
    path: String,
    closed: AtomicBool,
}

impl FileHandle {
    pub fn new(accessor: Arc<dyn HdfsAccessor>, path: impl Into<String>) -> Self {
        Self {
            accessor,
            path: path.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads straight from the cluster; fails with `Closed` once closed.
    pub async fn read(&self, offset: u64, size: u32) -> Result<Bytes, FsError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::Closed);
        }
        Ok(self.accessor.read_at(&self.path, offset, size).await?)
    }
}

/// One row of a directory snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u64,
    pub kind: FileType,
    pub name: String,
}

/// Listing captured at opendir and served to successive readdir calls.
#[derive(Debug)]
pub struct DirHandle {
    entries: Vec<DirEntry>,
}

impl DirHandle {
    pub fn new(entries: Vec<DirEntry>) -> Self {
        Self { entries }
    }

    /// Entries from `offset` on, paired with the offset of the next entry.
    pub fn entries_from(&self, offset: usize) -> impl Iterator<Item = (i64, &DirEntry)> {
        self.entries
            .iter()
            .enumerate()
            .skip(offset)
            .map(|(i, entry)| ((i + 1) as i64, entry))
    }

    /// Inodes listed under the directory, without `.` and `..`.
    pub fn child_inodes(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries
            .iter()
            .filter(|entry| entry.name != "." && entry.name != "..")
            .map(|entry| entry.inode)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Anything a node can open on behalf of the kernel.
pub enum OpenHandle {
    File(FileHandle),
    Directory(DirHandle),
    ArchiveEntry(ArchiveEntryHandle),
}

impl OpenHandle {
    /// Reads up to `size` bytes at `offset`. Archive streams block, so they
    /// are moved to the blocking pool.
    pub async fn read(self: Arc<Self>, offset: u64, size: u32) -> Result<Bytes, FsError> {
        match &*self {
            OpenHandle::File(file) => file.read(offset, size).await,
            OpenHandle::ArchiveEntry(_) => {
                let handle = self.clone();
                tokio::task::spawn_blocking(move || match &*handle {
                    OpenHandle::ArchiveEntry(entry) => entry.read(offset, size).map(Bytes::from),
                    _ => Err(FsError::NotSupported("read")),
                })
                .await
                .map_err(|e| FsError::Io(io::Error::other(e)))?
            }
            OpenHandle::Directory(_) => Err(FsError::IsADirectory(String::new())),
        }
    }

    pub fn as_dir(&self) -> Option<&DirHandle> {
        match self {
            OpenHandle::Directory(dir) => Some(dir),
            _ => None,
        }
    }
}

impl Resource for OpenHandle {
    fn close(&self) -> io::Result<()> {
        match self {
            OpenHandle::File(file) => {
                if !file.closed.swap(true, Ordering::AcqRel) {
                    trace!(path = %file.path, "closed file handle");
                }
                Ok(())
            }
            OpenHandle::Directory(_) => Ok(()),
            OpenHandle::ArchiveEntry(entry) => entry.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use common::testkit::MemoryAccessor;

    use super::*;

    #[tokio::test]
    async fn test_file_handle_reads_until_closed() {
        let memory = MemoryAccessor::new();
        memory.add_file("/data/a.txt", b"hello world");
        let handle = Arc::new(OpenHandle::File(FileHandle::new(Arc::new(memory), "/data/a.txt")));

        let data = handle.clone().read(6, 100).await.unwrap();
        assert_eq!(&data[..], b"world");

        handle.close().unwrap();
        assert!(matches!(handle.clone().read(0, 5).await, Err(FsError::Closed)));
    }

    #[test]
    fn test_dir_handle_offsets() {
        let dir = DirHandle::new(vec![
            DirEntry {
                inode: 1,
                kind: FileType::Directory,
                name: ".".into(),
            },
            DirEntry {
                inode: 5,
                kind: FileType::RegularFile,
                name: "a".into(),
            },
        ]);

        let all: Vec<_> = dir.entries_from(0).map(|(next, e)| (next, e.inode)).collect();
        assert_eq!(all, vec![(1, 1), (2, 5)]);
        assert_eq!(dir.entries_from(1).count(), 1);
        assert_eq!(dir.entries_from(2).count(), 0);
        assert_eq!(dir.child_inodes().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn test_nonseekable_flag() {
        let opened = Opened {
            fh: 1,
            flags: FOPEN_NONSEEKABLE,
        };
        assert!(!opened.is_seekable());
        assert!(Opened { fh: 1, flags: 0 }.is_seekable());
    }
}
