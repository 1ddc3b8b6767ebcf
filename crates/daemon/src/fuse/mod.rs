//! FUSE view of a remote HDFS namespace
//!
//! # Architecture
//!
//! - `FileSystem`: the mount controller; owns mount state, the open-handle
//!   registry and the node table, and performs mount/unmount
//! - `HdfsFs`: fuser `Filesystem` implementation dispatching onto tokio
//! - `Node`: closed set of node kinds (root, directory, file, archive
//!   directory, archive entry)
//! - `ResourceRegistry`: open handles closed on unmount
//! - `PathPolicy`: prefix allow-list for exposed paths
//! - `NodeTable`: inode ↔ node mapping

mod archive;
mod attrs;
mod error;
mod file_system;
mod handles;
mod hdfs_fs;
mod node;
mod node_table;
mod operations;
mod path_policy;
mod registry;

pub use archive::{
    archive_name_of, expanded_name, is_archive_name, ArchiveDirNode, ArchiveEntryHandle,
    ArchiveEntryNode, ArchiveError, ArchiveIndex, ArchiveSource, EntryCompression, IndexEntry,
    RemoteReader,
};
pub use attrs::{Attrs, BLOCK_SIZE};
pub use error::FsError;
pub use file_system::{
    Connection, FileSystem, MountConfig, MountError, MountOptions, StatFs, UnmountError,
    UnmountTool,
};
pub use handles::{DirEntry, DirHandle, FileHandle, OpenHandle, Opened, FOPEN_DIRECT_IO, FOPEN_NONSEEKABLE};
pub use hdfs_fs::HdfsFs;
pub use node::{DirNode, FileNode, Node};
pub use node_table::NodeTable;
pub use path_policy::{PathPolicy, WILDCARD};
pub use registry::{DrainReport, RegistryError, Resource, ResourceRegistry};
