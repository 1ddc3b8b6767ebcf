//! Integration tests for browsing and reading zip archives through the
//! expanded `<name>.zip@` directories.

mod support;

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::error::AccessorError;
use common::retry::RetryPolicy;
use common::testkit::MemoryAccessor;
use fuser::FileType;
use hdfs_mount::fuse::{Node, NodeTable, FOPEN_DIRECT_IO, FOPEN_NONSEEKABLE};

use support::{
    app_log, list_names, mounted, mounted_with_retries, resolve, sample_zip, Options,
};

fn cluster() -> MemoryAccessor {
    let memory = MemoryAccessor::new();
    memory.add_file("/data/bundle.zip", &sample_zip());
    memory.add_file("/data/notes.txt", b"plain");
    memory
}

#[tokio::test]
async fn test_listing_shows_expanded_directory() {
    let fixture = mounted(cluster(), Options::default());
    let data = resolve(&fixture.fs, "/data").await;

    assert_eq!(
        list_names(&fixture.fs, data.inode()).await,
        vec!["bundle.zip", "bundle.zip@", "notes.txt"]
    );
}

#[tokio::test]
async fn test_expansion_disabled() {
    let fixture = mounted(
        cluster(),
        Options {
            expand_zips: false,
            ..Default::default()
        },
    );
    let fs = &fixture.fs;
    let data = resolve(fs, "/data").await;

    assert_eq!(
        list_names(fs, data.inode()).await,
        vec!["bundle.zip", "notes.txt"]
    );
    let err = fs.lookup(data.inode(), OsStr::new("bundle.zip@")).await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_browse_archive() {
    let fixture = mounted(cluster(), Options::default());
    let fs = &fixture.fs;

    let root = resolve(fs, "/data/bundle.zip@").await;
    assert!(matches!(root, Node::ArchiveDir(_)));
    assert_eq!(root.kind(), FileType::Directory);
    assert_eq!(root.attrs().perm, 0o555);
    assert_eq!(list_names(fs, root.inode()).await, vec!["hello.txt", "logs"]);

    let logs = fs.lookup(root.inode(), OsStr::new("logs")).await.unwrap();
    assert!(logs.is_dir());
    assert_eq!(list_names(fs, logs.inode()).await, vec!["app.log"]);

    let log = fs.lookup(logs.inode(), OsStr::new("app.log")).await.unwrap();
    assert_eq!(log.attrs().size, app_log().len() as u64);
    assert_eq!(log.path(), "/data/bundle.zip@/logs/app.log");

    let missing = fs.lookup(root.inode(), OsStr::new("absent")).await.unwrap_err();
    assert_eq!(missing.errno(), libc::ENOENT);

    // `..` of the archive root is the directory holding the archive
    let fh = fs.open_dir(root.inode()).await.unwrap();
    let handle = fs.handle(fh).unwrap();
    let (_, parent) = handle.as_dir().unwrap().entries_from(1).next().unwrap();
    assert_eq!(parent.inode, fs.nodes().inode_of("/data").unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_index_is_read_once() {
    let fixture = mounted(cluster(), Options::default());
    let fs = &fixture.fs;

    let root = resolve(fs, "/data/bundle.zip@").await;
    list_names(fs, root.inode()).await;
    let reads = fixture.memory.calls("read");
    assert!(reads > 0);

    // a fresh lookup of an unchanged archive reuses the loaded index
    let again = resolve(fs, "/data/bundle.zip@").await;
    assert_eq!(again.inode(), root.inode());
    list_names(fs, again.inode()).await;
    fs.lookup(again.inode(), OsStr::new("hello.txt")).await.unwrap();
    assert_eq!(fixture.memory.calls("read"), reads);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_archive_entries() {
    let fixture = mounted(cluster(), Options::default());
    let fs = &fixture.fs;

    let hello = resolve(fs, "/data/bundle.zip@/hello.txt").await;
    let opened = fs.open(hello.inode(), libc::O_RDONLY).await.unwrap();
    assert_eq!(opened.flags, FOPEN_NONSEEKABLE | FOPEN_DIRECT_IO);
    assert!(!opened.is_seekable());
    assert!(fs.registry().get(opened.fh).is_some());
    assert_eq!(
        &fs.read(opened.fh, 0, 64).await.unwrap()[..],
        b"hello from inside"
    );
    fs.close_handle(opened.fh).unwrap();

    // deflated entry read sequentially in small chunks
    let log = resolve(fs, "/data/bundle.zip@/logs/app.log").await;
    let opened = fs.open(log.inode(), libc::O_RDONLY).await.unwrap();
    let mut content = Vec::new();
    loop {
        let chunk = fs.read(opened.fh, content.len() as i64, 4096).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        content.extend_from_slice(&chunk);
    }
    assert_eq!(content, app_log());

    // no going back
    let err = fs.read(opened.fh, 0, 10).await.unwrap_err();
    assert_eq!(err.errno(), libc::ESPIPE);
    fs.close_handle(opened.fh).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_archive_is_read_only() {
    let fixture = mounted(cluster(), Options::default());
    let fs = &fixture.fs;

    let root = resolve(fs, "/data/bundle.zip@").await;
    let hello = fs.lookup(root.inode(), OsStr::new("hello.txt")).await.unwrap();

    let err = fs.open(hello.inode(), libc::O_WRONLY).await.unwrap_err();
    assert_eq!(err.errno(), libc::EROFS);
    let err = fs.mkdir(root.inode(), OsStr::new("new")).await.unwrap_err();
    assert_eq!(err.errno(), libc::EROFS);
    let err = fs.unlink(root.inode(), OsStr::new("hello.txt")).await.unwrap_err();
    assert_eq!(err.errno(), libc::EROFS);
    assert!(fs.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unmount_closes_archive_streams() {
    let fixture = mounted(cluster(), Options::default());
    let fs = &fixture.fs;

    let log = resolve(fs, "/data/bundle.zip@/logs/app.log").await;
    let opened = fs.open(log.inode(), libc::O_RDONLY).await.unwrap();
    let held = fs.handle(opened.fh).unwrap();
    assert!(!fs.read(opened.fh, 0, 16).await.unwrap().is_empty());

    fs.unmount().unwrap();

    assert!(fs.registry().is_empty());
    let err = held.clone().read(16, 16).await.unwrap_err();
    assert_eq!(err.errno(), libc::EBADF);

    let err = fs.open(log.inode(), libc::O_RDONLY).await.unwrap_err();
    assert_eq!(err.errno(), libc::ENODEV);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_corrupt_archive() {
    let memory = MemoryAccessor::new();
    memory.add_file("/broken.zip", b"not really a zip file");
    let fixture = mounted(memory, Options::default());
    let fs = &fixture.fs;

    let root = fs
        .lookup(NodeTable::ROOT_INODE, OsStr::new("broken.zip@"))
        .await
        .unwrap();
    let err = fs.open_dir(root.inode()).await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
}

#[tokio::test]
async fn test_expanded_name_of_directory_is_missing() {
    let memory = MemoryAccessor::new();
    memory.add_dir("/odd.zip");
    let fixture = mounted(memory, Options::default());

    let err = fixture
        .fs
        .lookup(NodeTable::ROOT_INODE, OsStr::new("odd.zip@"))
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unmount_does_not_wait_for_a_retrying_read() {
    let retry_policy = Arc::new(RetryPolicy::new(
        Duration::from_secs(4),
        u32::MAX,
        Duration::from_millis(10),
        Duration::from_millis(100),
    ));
    let fixture = mounted_with_retries(cluster(), Options::default(), retry_policy.clone());
    let fs = fixture.fs.clone();

    let log = resolve(&fs, "/data/bundle.zip@/logs/app.log").await;
    let opened = fs.open(log.inode(), libc::O_RDONLY).await.unwrap();
    let held = fs.handle(opened.fh).unwrap();

    // the cluster goes away while the first chunk is being fetched
    fixture
        .memory
        .fail_next(u32::MAX, || AccessorError::Unavailable("standby".into()));
    let reads = fixture.memory.calls("read");
    let reader = {
        let fs = fs.clone();
        tokio::spawn(async move { fs.read(opened.fh, 0, 4096).await })
    };
    while fixture.memory.calls("read") < reads + 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    let unmounting = fs.clone();
    tokio::task::spawn_blocking(move || unmounting.unmount())
        .await
        .unwrap()
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!fs.is_mounted());
    assert!(fs.registry().is_empty());

    retry_policy.disable();
    let result = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap_err().errno(), libc::EBADF);
    assert_eq!(held.clone().read(0, 16).await.unwrap_err().errno(), libc::EBADF);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_corrupted_entry_fails_checksum() {
    let mut bytes = sample_zip();
    let payload = b"hello from inside";
    let at = bytes
        .windows(payload.len())
        .position(|window| window == payload)
        .unwrap();
    bytes[at + 6] ^= 0x01;

    let memory = MemoryAccessor::new();
    memory.add_file("/data/bundle.zip", &bytes);
    let fixture = mounted(memory, Options::default());
    let fs = &fixture.fs;

    let hello = resolve(fs, "/data/bundle.zip@/hello.txt").await;
    let opened = fs.open(hello.inode(), libc::O_RDONLY).await.unwrap();
    let err = fs.read(opened.fh, 0, 64).await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    fs.close_handle(opened.fh).unwrap();

    // the intact entry next to it still reads
    let log = resolve(fs, "/data/bundle.zip@/logs/app.log").await;
    let opened = fs.open(log.inode(), libc::O_RDONLY).await.unwrap();
    let mut content = Vec::new();
    loop {
        let chunk = fs.read(opened.fh, content.len() as i64, 65536).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        content.extend_from_slice(&chunk);
    }
    assert_eq!(content, app_log());
}
