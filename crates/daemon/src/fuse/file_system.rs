//! Mount controller
//!
//! [`FileSystem`] owns everything a mounted tree shares across concurrent
//! requests: the accessor, the path policy, the node table and the resource
//! registry whose lock also guards the mount flag. It performs the mount
//! (handing back a [`Connection`] to serve) and the once-only unmount.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::{Arc, Weak};

use common::accessor::{FsInfo, HdfsAccessor};
use common::error::AccessorError;
use common::retry::RetryPolicy;
use fuser::MountOption;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::attrs::{Attrs, BLOCK_SIZE};
use super::error::FsError;
use super::handles::OpenHandle;
use super::hdfs_fs::HdfsFs;
use super::node::{DirNode, Node};
use super::node_table::NodeTable;
use super::path_policy::PathPolicy;
use super::registry::{DrainReport, RegistryError, Resource, ResourceRegistry};
use crate::identity::UserIdentity;

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("Mount point {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("Failed to mount {mount_point}: {source}")]
    Mount {
        mount_point: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum UnmountError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Options passed to the kernel at mount time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub fs_name: String,
    /// Volume label, shown by macOS only
    pub volume_label: String,
    pub allow_other: bool,
    pub read_only: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            fs_name: "hdfs".to_string(),
            volume_label: "HDFS filesystem".to_string(),
            allow_other: true,
            read_only: false,
        }
    }
}

impl MountOptions {
    pub fn to_mount_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.fs_name.clone()),
            MountOption::Subtype(self.fs_name.clone()),
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        if self.read_only {
            options.push(MountOption::RO);
        }
        if cfg!(target_os = "macos") {
            options.push(MountOption::CUSTOM(format!("volname={}", self.volume_label)));
        }
        options
    }
}

/// External command detaching the mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmountTool {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for UnmountTool {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self {
                program: "umount".to_string(),
                args: Vec::new(),
            }
        } else {
            Self {
                program: "fusermount".to_string(),
                args: vec!["-zu".to_string()],
            }
        }
    }
}

impl UnmountTool {
    pub fn run(&self, mount_point: &Path) -> Result<(), UnmountError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(mount_point)
            .output()
            .map_err(|source| UnmountError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }
        Err(UnmountError::Failed {
            program: self.program.clone(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MountConfig {
    pub mount_point: PathBuf,
    pub path_policy: PathPolicy,
    pub expand_zips: bool,
    pub options: MountOptions,
    pub unmount_tool: UnmountTool,
}

impl MountConfig {
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            path_policy: PathPolicy::default(),
            expand_zips: false,
            options: MountOptions::default(),
            unmount_tool: UnmountTool::default(),
        }
    }
}

/// Capacity as reported to statfs, in [`BLOCK_SIZE`] blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks: u64,
    pub free: u64,
    pub available: u64,
}

impl From<FsInfo> for StatFs {
    fn from(info: FsInfo) -> Self {
        let block_size = u64::from(BLOCK_SIZE);
        let free = info.remaining / block_size;
        Self {
            block_size: BLOCK_SIZE,
            blocks: info.capacity / block_size,
            free,
            available: free,
        }
    }
}

/// A mounted kernel session, ready to serve.
pub struct Connection {
    session: fuser::Session<HdfsFs>,
    mount_point: PathBuf,
}

impl Connection {
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Serves kernel requests until the file system is unmounted.
    pub fn serve(mut self) -> io::Result<()> {
        debug!(mount_point = %self.mount_point.display(), "serving requests");
        self.session.run()
    }
}

/// The mount controller.
pub struct FileSystem {
    config: MountConfig,
    accessor: Arc<dyn HdfsAccessor>,
    retry_policy: Arc<RetryPolicy>,
    identity: UserIdentity,
    registry: ResourceRegistry<OpenHandle>,
    nodes: NodeTable,
    root: Node,
    weak_self: Weak<FileSystem>,
}

impl FileSystem {
    pub fn new(
        config: MountConfig,
        accessor: Arc<dyn HdfsAccessor>,
        retry_policy: Arc<RetryPolicy>,
        identity: UserIdentity,
    ) -> Arc<Self> {
        let root = Node::Root(DirNode {
            path: "/".to_string(),
            attrs: Attrs::directory(NodeTable::ROOT_INODE, "", 0o755, &identity),
        });

        Arc::new_cyclic(|weak_self| Self {
            config,
            accessor,
            retry_policy,
            identity,
            registry: ResourceRegistry::new(),
            nodes: NodeTable::new(root.clone()),
            root,
            weak_self: weak_self.clone(),
        })
    }

    /// Mounts at the configured mount point. Requests are dispatched onto
    /// `runtime` once the returned connection is served.
    pub fn mount(self: &Arc<Self>, runtime: Handle) -> Result<Connection, MountError> {
        let mount_point = self.config.mount_point.clone();
        if !mount_point.is_dir() {
            return Err(MountError::NotADirectory(mount_point));
        }
        // reserved before the kernel is involved; a racing mount fails here
        self.registry.mark_mounted()?;

        let options = self.config.options.to_mount_options();
        let filesystem = HdfsFs::new(self.clone(), runtime);
        let session = match fuser::Session::new(filesystem, mount_point.as_path(), &options) {
            Ok(session) => session,
            Err(source) => {
                self.registry.begin_unmount();
                return Err(MountError::Mount {
                    mount_point,
                    source,
                });
            }
        };

        info!(
            mount_point = %mount_point.display(),
            read_only = self.config.options.read_only,
            expand_zips = self.config.expand_zips,
            "mounted"
        );
        Ok(Connection {
            session,
            mount_point,
        })
    }

    /// Detaches the mount point and closes every tracked handle. Only the
    /// first call after a mount does anything; later calls return `Ok`.
    /// The handles are closed even when the unmount tool fails, and the
    /// failure is returned afterwards.
    pub fn unmount(&self) -> Result<(), UnmountError> {
        if !self.registry.begin_unmount() {
            debug!("not mounted, nothing to unmount");
            return Ok(());
        }

        info!(mount_point = %self.config.mount_point.display(), "unmounting");
        let result = self.config.unmount_tool.run(&self.config.mount_point);

        let DrainReport { closed, failed } = self.registry.drain_and_close_all();
        info!(closed, failed, "closed open handles");

        if let Err(e) = &result {
            error!(error = %e, "unmount tool failed");
        }
        result
    }

    pub async fn stat_fs(&self) -> Result<StatFs, AccessorError> {
        let info = self.accessor.stat_fs().await.inspect_err(|e| {
            warn!(error = %e, "failed to get cluster capacity");
        })?;
        Ok(info.into())
    }

    /// Node of the mount root, which is never evicted.
    pub fn root(&self) -> Node {
        self.root.clone()
    }

    /// Whether `path` falls under one of the configured allowed prefixes.
    pub fn is_path_allowed(&self, path: &str) -> bool {
        self.config.path_policy.is_path_allowed(path)
    }

    /// Tracks an opened handle for close-on-unmount.
    pub fn register(&self, handle: OpenHandle) -> Result<u64, RegistryError> {
        self.registry.register(Arc::new(handle))
    }

    /// Looks up a tracked handle without taking it out of the registry.
    pub fn handle(&self, fh: u64) -> Result<Arc<OpenHandle>, FsError> {
        self.registry.get(fh).ok_or(FsError::UnknownHandle(fh))
    }

    /// Stops tracking `fh` and closes it. Handles already closed by an
    /// unmount are no longer tracked and report `UnknownHandle`.
    ///
    /// Releasing a directory listing evicts the listed nodes the kernel
    /// never looked up.
    pub fn close_handle(&self, fh: u64) -> Result<(), FsError> {
        let handle = self.registry.release(fh).ok_or(FsError::UnknownHandle(fh))?;
        if let Some(dir) = handle.as_dir() {
            self.nodes.evict_unreferenced(dir.child_inodes());
        }
        handle.close()?;
        Ok(())
    }

    /// Node known under `inode`. Inodes evicted from the table report
    /// `UnknownInode`, which the kernel sees as `ENOENT`.
    pub fn node(&self, inode: u64) -> Result<Node, FsError> {
        if inode == NodeTable::ROOT_INODE {
            return Ok(self.root());
        }
        self.nodes.get(inode).ok_or(FsError::UnknownInode(inode))
    }

    pub fn is_mounted(&self) -> bool {
        self.registry.is_mounted()
    }

    /// Mounted with `-o ro`; every mutating request fails with `EROFS`.
    pub fn is_read_only(&self) -> bool {
        self.config.options.read_only
    }

    /// Whether `name.zip` files get a browsable `name.zip@` sibling.
    pub fn expand_zips(&self) -> bool {
        self.config.expand_zips
    }

    pub fn mount_point(&self) -> &Path {
        &self.config.mount_point
    }

    /// Configuration the file system was built with.
    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// Accessor every remote call goes through, retries included.
    pub fn accessor(&self) -> &Arc<dyn HdfsAccessor> {
        &self.accessor
    }

    /// Shared retry budget, revoked once the file system is unmounted.
    pub fn retry_policy(&self) -> &Arc<RetryPolicy> {
        &self.retry_policy
    }

    /// Owner reported for every node.
    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    /// Open handles, closed all at once on unmount. Its lock also guards
    /// the mount flag.
    pub fn registry(&self) -> &ResourceRegistry<OpenHandle> {
        &self.registry
    }

    /// Inode table shared by every request.
    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub(crate) fn weak_ref(&self) -> Weak<FileSystem> {
        self.weak_self.clone()
    }
}

#[cfg(test)]
mod tests {
    use common::testkit::MemoryAccessor;

    use super::super::handles::FileHandle;
    use super::*;

    fn identity() -> UserIdentity {
        UserIdentity {
            uid: 1000,
            gid: 1000,
            name: "alice".to_string(),
        }
    }

    fn file_system(accessor: MemoryAccessor, tool: &str) -> Arc<FileSystem> {
        let tool = UnmountTool {
            program: tool.to_string(),
            args: Vec::new(),
        };
        file_system_at("/nonexistent/hdfs-mount-test", accessor, tool)
    }

    fn file_system_at(
        mount_point: impl Into<PathBuf>,
        accessor: MemoryAccessor,
        tool: UnmountTool,
    ) -> Arc<FileSystem> {
        let mut config = MountConfig::new(mount_point);
        config.unmount_tool = tool;
        FileSystem::new(
            config,
            Arc::new(accessor),
            Arc::new(RetryPolicy::default()),
            identity(),
        )
    }

    fn open_file(fs: &FileSystem) -> Result<u64, RegistryError> {
        fs.register(OpenHandle::File(FileHandle::new(fs.accessor().clone(), "/a")))
    }

    #[test]
    fn test_mount_options() {
        let options = MountOptions {
            read_only: true,
            ..Default::default()
        }
        .to_mount_options();

        assert!(options.contains(&MountOption::FSName("hdfs".to_string())));
        assert!(options.contains(&MountOption::Subtype("hdfs".to_string())));
        assert!(options.contains(&MountOption::AllowOther));
        assert!(options.contains(&MountOption::RO));

        let writable = MountOptions::default().to_mount_options();
        assert!(!writable.contains(&MountOption::RO));
    }

    #[test]
    fn test_unmount_without_mount_is_noop() {
        let fs = file_system(MemoryAccessor::new(), "false");
        assert!(fs.unmount().is_ok());
        assert!(fs.unmount().is_ok());
    }

    #[test]
    fn test_unmount_closes_handles_once() {
        let fs = file_system(MemoryAccessor::new(), "true");
        fs.registry().mark_mounted().unwrap();
        let fh = open_file(&fs).unwrap();
        let handle = fs.handle(fh).unwrap();

        fs.unmount().unwrap();
        assert!(!fs.is_mounted());
        assert!(fs.registry().is_empty());
        assert!(fs.handle(fh).is_err());
        // second unmount is a no-op
        fs.unmount().unwrap();
        drop(handle);

        assert_eq!(open_file(&fs), Err(RegistryError::NotMounted));
    }

    #[test]
    fn test_failed_unmount_tool_still_drains() {
        let fs = file_system(MemoryAccessor::new(), "false");
        fs.registry().mark_mounted().unwrap();
        open_file(&fs).unwrap();
        open_file(&fs).unwrap();

        let result = fs.unmount();

        assert!(matches!(result, Err(UnmountError::Failed { .. })));
        assert!(fs.registry().is_empty());
        assert!(!fs.is_mounted());
        assert!(fs.unmount().is_ok());
    }

    #[test]
    fn test_missing_unmount_tool() {
        let fs = file_system(MemoryAccessor::new(), "/nonexistent/unmount-tool");
        fs.registry().mark_mounted().unwrap();
        assert!(matches!(fs.unmount(), Err(UnmountError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_stat_fs_blocks() {
        let memory = MemoryAccessor::new();
        memory.set_fs_info(FsInfo {
            capacity: 2048,
            remaining: 1024,
            used: 1024,
        });
        let fs = file_system(memory, "true");

        let stat = fs.stat_fs().await.unwrap();
        assert_eq!(
            stat,
            StatFs {
                block_size: 1024,
                blocks: 2,
                free: 1,
                available: 1
            }
        );
    }

    #[tokio::test]
    async fn test_stat_fs_failure_is_returned() {
        let memory = MemoryAccessor::new();
        memory.fail_next(1, || AccessorError::Unavailable("namenode down".into()));
        let fs = file_system(memory, "true");
        assert!(fs.stat_fs().await.is_err());
    }

    #[test]
    fn test_root_node() {
        let fs = file_system(MemoryAccessor::new(), "true");
        let root = fs.root();
        assert_eq!(root.inode(), NodeTable::ROOT_INODE);
        assert!(root.is_dir());
        assert_eq!(root.attrs().uid, 1000);
        assert!(fs.is_path_allowed("/anything"));
    }

    #[test]
    fn test_mount_requires_directory() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let fs = file_system(MemoryAccessor::new(), "true");
        let result = fs.mount(runtime.handle().clone());
        assert!(matches!(result, Err(MountError::NotADirectory(_))));
        assert!(!fs.is_mounted());
    }

    #[test]
    fn test_mount_is_refused_while_mounted() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mount_point = tempfile::tempdir().unwrap();
        let fs = file_system_at(
            mount_point.path(),
            MemoryAccessor::new(),
            UnmountTool {
                program: "true".to_string(),
                args: Vec::new(),
            },
        );
        fs.registry().mark_mounted().unwrap();
        let fh = open_file(&fs).unwrap();

        let result = fs.mount(runtime.handle().clone());

        assert!(matches!(
            result,
            Err(MountError::Registry(RegistryError::AlreadyMounted))
        ));
        // the existing mount is left alone
        assert!(fs.is_mounted());
        assert!(fs.handle(fh).is_ok());
    }

    #[test]
    fn test_racing_unmounts_run_the_tool_once() {
        const CALLERS: usize = 8;
        let temp = tempfile::tempdir().unwrap();
        let log = temp.path().join("unmounts.log");
        let fs = file_system_at(
            "/nonexistent/hdfs-mount-test",
            MemoryAccessor::new(),
            UnmountTool {
                program: "sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    "echo \"$1\" >> \"$0\"".to_string(),
                    log.display().to_string(),
                ],
            },
        );
        fs.registry().mark_mounted().unwrap();
        let handles: Vec<_> = (0..16)
            .map(|_| fs.handle(open_file(&fs).unwrap()).unwrap())
            .collect();

        let barrier = std::sync::Barrier::new(CALLERS);
        std::thread::scope(|scope| {
            for _ in 0..CALLERS {
                scope.spawn(|| {
                    barrier.wait();
                    fs.unmount().unwrap();
                });
            }
        });

        let runs = std::fs::read_to_string(&log).unwrap();
        assert_eq!(runs.lines().collect::<Vec<_>>(), vec!["/nonexistent/hdfs-mount-test"]);
        assert!(!fs.is_mounted());
        assert!(fs.registry().is_empty());

        let runtime = tokio::runtime::Runtime::new().unwrap();
        for handle in handles {
            let result = runtime.block_on(handle.read(0, 1));
            assert!(matches!(result, Err(FsError::Closed)));
        }
    }
}
