//! Shared fixtures for the FUSE integration tests

#![allow(dead_code)]

use std::ffi::OsStr;
use std::io::{Cursor, Write};
use std::sync::Arc;

use common::accessor::HdfsAccessor;
use common::fault_tolerant::FaultTolerantAccessor;
use common::retry::RetryPolicy;
use common::testkit::MemoryAccessor;
use hdfs_mount::fuse::{FileSystem, MountConfig, Node, PathPolicy, UnmountTool};
use hdfs_mount::identity::UserIdentity;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

pub struct Fixture {
    pub fs: Arc<FileSystem>,
    pub memory: Arc<MemoryAccessor>,
}

pub struct Options {
    pub read_only: bool,
    pub expand_zips: bool,
    pub allowed_prefixes: &'static str,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            read_only: false,
            expand_zips: true,
            allowed_prefixes: "*",
        }
    }
}

pub fn identity() -> UserIdentity {
    UserIdentity {
        uid: 1000,
        gid: 1000,
        name: "alice".to_string(),
    }
}

/// A mounted-state file system over `memory`. The kernel side is never
/// attached; `true` stands in for the unmount tool.
pub fn mounted(memory: MemoryAccessor, options: Options) -> Fixture {
    let memory = Arc::new(memory);
    let accessor: Arc<dyn HdfsAccessor> = memory.clone();
    build(memory, accessor, options, Arc::new(RetryPolicy::default()))
}

/// Like [`mounted`], with every remote call retried under `retry_policy`.
pub fn mounted_with_retries(
    memory: MemoryAccessor,
    options: Options,
    retry_policy: Arc<RetryPolicy>,
) -> Fixture {
    let memory = Arc::new(memory);
    let accessor: Arc<dyn HdfsAccessor> = Arc::new(FaultTolerantAccessor::new(
        memory.clone(),
        retry_policy.clone(),
    ));
    build(memory, accessor, options, retry_policy)
}

fn build(
    memory: Arc<MemoryAccessor>,
    accessor: Arc<dyn HdfsAccessor>,
    options: Options,
    retry_policy: Arc<RetryPolicy>,
) -> Fixture {
    let mut config = MountConfig::new("/nonexistent/hdfs-mount-it");
    config.path_policy = PathPolicy::parse(options.allowed_prefixes);
    config.expand_zips = options.expand_zips;
    config.options.read_only = options.read_only;
    config.unmount_tool = UnmountTool {
        program: "true".to_string(),
        args: Vec::new(),
    };

    let fs = FileSystem::new(config, accessor, retry_policy, identity());
    fs.registry().mark_mounted().unwrap();
    Fixture { fs, memory }
}

/// Walks `path` from the root with lookups.
pub async fn resolve(fs: &FileSystem, path: &str) -> Node {
    let mut node = fs.root();
    for name in path.split('/').filter(|s| !s.is_empty()) {
        node = fs.lookup(node.inode(), OsStr::new(name)).await.unwrap();
    }
    node
}

/// Names returned by a full readdir of `inode`, without `.` and `..`.
pub async fn list_names(fs: &FileSystem, inode: u64) -> Vec<String> {
    let fh = fs.open_dir(inode).await.unwrap();
    let handle = fs.handle(fh).unwrap();
    let names = handle
        .as_dir()
        .unwrap()
        .entries_from(0)
        .map(|(_, entry)| entry.name.clone())
        .filter(|name| name != "." && name != "..")
        .collect();
    fs.close_handle(fh).unwrap();
    names
}

pub fn sample_zip() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    writer.start_file("hello.txt", stored).unwrap();
    writer.write_all(b"hello from inside").unwrap();
    writer.start_file("logs/app.log", deflated).unwrap();
    for i in 0..2000 {
        writeln!(writer, "line {}", i).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn app_log() -> Vec<u8> {
    let mut expected = Vec::new();
    for i in 0..2000 {
        writeln!(expected, "line {}", i).unwrap();
    }
    expected
}
