//! Errors surfaced to the kernel and their errno mapping

use common::error::AccessorError;

use super::archive::ArchiveError;
use super::registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error(transparent)]
    Accessor(#[from] AccessorError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("Path not found: {0}")]
    NotFound(String),
    #[error("Path outside the allowed prefixes: {0}")]
    Forbidden(String),
    #[error("File system is mounted read-only")]
    ReadOnly,
    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),
    #[error("Not a directory: {0}")]
    NotADirectory(String),
    #[error("Is a directory: {0}")]
    IsADirectory(String),
    #[error("Unknown inode {0}")]
    UnknownInode(u64),
    #[error("Unknown file handle {0}")]
    UnknownHandle(u64),
    #[error("Invalid file name")]
    InvalidName,
    #[error("Stream only reads forward: requested offset {requested}, at {position}")]
    IllegalSeek { requested: u64, position: u64 },
    #[error("Handle is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::Accessor(e) => match e {
                AccessorError::NotFound(_) => libc::ENOENT,
                AccessorError::PermissionDenied(_) => libc::EACCES,
                AccessorError::AlreadyExists(_) => libc::EEXIST,
                AccessorError::NotEmpty(_) => libc::ENOTEMPTY,
                _ => libc::EIO,
            },
            FsError::Archive(e) => e.errno(),
            FsError::Registry(_) => libc::ENODEV,
            FsError::NotFound(_) | FsError::UnknownInode(_) => libc::ENOENT,
            FsError::Forbidden(_) => libc::EACCES,
            FsError::ReadOnly => libc::EROFS,
            FsError::NotSupported(_) => libc::ENOTSUP,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::UnknownHandle(_) | FsError::Closed => libc::EBADF,
            FsError::InvalidName => libc::EINVAL,
            FsError::IllegalSeek { .. } => libc::ESPIPE,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
