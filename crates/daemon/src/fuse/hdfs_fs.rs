//! fuser `Filesystem` implementation
//!
//! fuser calls into the file system from its session thread. Every request
//! that may touch the cluster is moved onto the tokio runtime and answered
//! from there, so slow remote calls never hold up unrelated requests.

use std::ffi::OsStr;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fuser::consts::FUSE_WRITEBACK_CACHE;
use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, Request,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::error::FsError;
use super::file_system::FileSystem;

/// How long the kernel may cache entries and attributes.
const TTL: Duration = Duration::from_secs(1);

/// Kernel read-ahead window.
const MAX_READAHEAD: u32 = 64 * 1024;

/// Longest file name reported by statfs.
const MAX_NAME_LEN: u32 = 255;

fn log_failure(operation: &'static str, error: &FsError) {
    match error.errno() {
        libc::ENOENT | libc::EROFS | libc::ENOTSUP | libc::EACCES => {
            debug!(operation, error = %error, "request failed")
        }
        _ => warn!(operation, error = %error, "request failed"),
    }
}

/// Kernel-facing adapter around a [`FileSystem`].
pub struct HdfsFs {
    fs: Arc<FileSystem>,
    runtime: Handle,
}

impl HdfsFs {
    pub fn new(fs: Arc<FileSystem>, runtime: Handle) -> Self {
        Self { fs, runtime }
    }

    fn spawn<F, Fut>(&self, request: F)
    where
        F: FnOnce(Arc<FileSystem>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(request(self.fs.clone()));
    }
}

impl Filesystem for HdfsFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), libc::c_int> {
        if let Err(nearest) = config.set_max_readahead(MAX_READAHEAD) {
            debug!(nearest, "kernel rejected max readahead");
            let _ = config.set_max_readahead(nearest);
        }
        if config.add_capabilities(FUSE_WRITEBACK_CACHE).is_err() {
            debug!("kernel does not support writeback cache");
        }
        info!(mount_point = %self.fs.mount_point().display(), "file system initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!(mount_point = %self.fs.mount_point().display(), "file system destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_os_string();
        self.spawn(move |fs| async move {
            match fs.lookup(parent, &name).await {
                Ok(node) => reply.entry(&TTL, &node.attrs().to_file_attr(), 0),
                Err(e) => {
                    log_failure("lookup", &e);
                    reply.error(e.errno());
                }
            }
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.fs.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        for node in nodes {
            self.fs.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        self.spawn(move |fs| async move {
            match fs.getattr(ino).await {
                Ok(attrs) => reply.attr(&TTL, &attrs.to_file_attr()),
                Err(e) => {
                    log_failure("getattr", &e);
                    reply.error(e.errno());
                }
            }
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.spawn(move |fs| async move {
            match fs.open_dir(ino).await {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => {
                    log_failure("opendir", &e);
                    reply.error(e.errno());
                }
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let handle = match self.fs.handle(fh) {
            Ok(handle) => handle,
            Err(e) => {
                log_failure("readdir", &e);
                reply.error(e.errno());
                return;
            }
        };
        let Some(dir) = handle.as_dir() else {
            reply.error(libc::ENOTDIR);
            return;
        };

        let offset = usize::try_from(offset).unwrap_or(0);
        for (next, entry) in dir.entries_from(offset) {
            if reply.add(entry.inode, next, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        // handles drained by an unmount are already gone
        if let Err(e) = self.fs.close_handle(fh) {
            debug!(fh, error = %e, "releasedir");
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.spawn(move |fs| async move {
            match fs.open(ino, flags).await {
                Ok(opened) => reply.opened(opened.fh, opened.flags),
                Err(e) => {
                    log_failure("open", &e);
                    reply.error(e.errno());
                }
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.spawn(move |fs| async move {
            match fs.read(fh, offset, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => {
                    log_failure("read", &e);
                    reply.error(e.errno());
                }
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Err(e) = self.fs.close_handle(fh) {
            debug!(fh, error = %e, "release");
        }
        reply.ok();
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        self.spawn(move |fs| async move {
            match fs.stat_fs().await {
                Ok(stat) => reply.statfs(
                    stat.blocks,
                    stat.free,
                    stat.available,
                    0,
                    0,
                    stat.block_size,
                    MAX_NAME_LEN,
                    stat.block_size,
                ),
                Err(e) => reply.error(FsError::from(e).errno()),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_os_string();
        self.spawn(move |fs| async move {
            match fs.mkdir(parent, &name).await {
                Ok(node) => reply.entry(&TTL, &node.attrs().to_file_attr(), 0),
                Err(e) => {
                    log_failure("mkdir", &e);
                    reply.error(e.errno());
                }
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_os_string();
        self.spawn(move |fs| async move {
            match fs.unlink(parent, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => {
                    log_failure("unlink", &e);
                    reply.error(e.errno());
                }
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_os_string();
        self.spawn(move |fs| async move {
            match fs.rmdir(parent, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => {
                    log_failure("rmdir", &e);
                    reply.error(e.errno());
                }
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_os_string();
        let newname = newname.to_os_string();
        self.spawn(move |fs| async move {
            match fs.rename(parent, &name, newparent, &newname).await {
                Ok(()) => reply.ok(),
                Err(e) => {
                    log_failure("rename", &e);
                    reply.error(e.errno());
                }
            }
        });
    }
}
