//! Node attributes and their conversion to the FUSE wire struct

use std::time::SystemTime;

use common::accessor::{FileKind, FileStatus};
use fuser::{FileAttr, FileType};

use crate::identity::UserIdentity;

/// Virtual block size reported to the kernel.
pub const BLOCK_SIZE: u32 = 1024;

/// Attributes of a single node.
#[derive(Debug, Clone, PartialEq)]
pub struct Attrs {
    pub inode: u64,
    pub name: String,
    pub kind: FileType,
    pub perm: u16,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
}

impl Attrs {
    /// Directory attributes owned by `identity`, timestamped now.
    pub fn directory(
        inode: u64,
        name: impl Into<String>,
        perm: u16,
        identity: &UserIdentity,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            inode,
            name: name.into(),
            kind: FileType::Directory,
            perm,
            size: 0,
            uid: identity.uid,
            gid: identity.gid,
            mtime: now,
            atime: now,
            ctime: now,
            crtime: now,
        }
    }

    /// Attributes of a remote path. Remote owners are not mapped to local
    /// accounts; everything appears owned by the mounting user.
    pub fn from_status(inode: u64, status: &FileStatus, identity: &UserIdentity) -> Self {
        let kind = match status.kind {
            FileKind::Directory => FileType::Directory,
            FileKind::File => FileType::RegularFile,
        };
        Self {
            inode,
            name: status.name.clone(),
            kind,
            perm: (status.mode & 0o7777) as u16,
            size: status.size,
            uid: identity.uid,
            gid: identity.gid,
            mtime: status.mtime,
            atime: status.atime,
            ctime: status.mtime,
            crtime: status.mtime,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    pub fn to_file_attr(&self) -> FileAttr {
        FileAttr {
            ino: self.inode,
            size: self.size,
            blocks: self.size.div_ceil(512),
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
            kind: self.kind,
            perm: self.perm,
            nlink: if self.is_dir() { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}
