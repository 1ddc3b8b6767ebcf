//! Process lifecycle: startup, mount, serve, signal-driven shutdown

use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use common::accessor::HdfsAccessor;
use common::fault_tolerant::FaultTolerantAccessor;
use common::retry::RetryPolicy;
use common::webhdfs::WebHdfsAccessor;
use tokio::runtime::Handle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::cli::Args;
use crate::fuse::FileSystem;
use crate::identity::UserIdentity;

/// Open file limit requested once mounted.
const MAX_OPEN_FILES: libc::rlim_t = 1024 * 1024;

/// Runs the mount until it is unmounted, by signal or externally.
pub async fn run(args: Args) -> anyhow::Result<()> {
    info!(build = %crate::build_info(), "starting hdfs-mount");
    info!(
        stage_dir = %args.stage_dir.display(),
        tls = args.tls,
        "staging directory and transport"
    );
    create_staging_dir(&args.stage_dir);

    let identity = UserIdentity::current().context("failed to resolve the current user")?;
    let retry_policy = Arc::new(args.retry_policy());

    let user = args.user.clone().unwrap_or_else(|| identity.name.clone());
    let webhdfs = WebHdfsAccessor::new(&args.namenode, args.tls, user)
        .with_context(|| format!("invalid NameNode address {}", args.namenode))?;
    let accessor: Arc<dyn HdfsAccessor> =
        Arc::new(FaultTolerantAccessor::new(webhdfs, retry_policy.clone()));

    if !args.lazy {
        accessor.ensure_connected().await.context(
            "can't establish connection to HDFS, mounting will not be performed (use --lazy to skip this check)",
        )?;
    }

    let fs = FileSystem::new(args.mount_config(), accessor, retry_policy.clone(), identity);
    let connection = fs
        .mount(Handle::current())
        .with_context(|| format!("failed to mount {}", args.mount_point.display()))?;
    info!(mount_point = %args.mount_point.display(), "mounted successfully");

    raise_open_file_limit();

    let (served_tx, served_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("fuse-session".to_string())
        .spawn(move || {
            let _ = served_tx.send(connection.serve());
        })
        .context("failed to start the session thread")?;

    let served = tokio::select! {
        served = served_rx => served,
        failure = watch_signals(fs.clone(), retry_policy.clone()) => {
            return Err(failure);
        }
    };

    info!("closing");
    let unmounted = unmount(&fs).await;
    retry_policy.disable();
    match served {
        Ok(Ok(())) => info!("session ended"),
        Ok(Err(e)) => return Err(anyhow!(e).context("session failed")),
        Err(_) => return Err(anyhow!("session thread exited without a result")),
    }
    unmounted
}

/// Handles SIGINT/SIGTERM for the life of the mount. Each signal unmounts
/// (which ends the session) and revokes the retry budget so in-flight
/// operations stop retrying. Returns only if unmounting fails.
async fn watch_signals(fs: Arc<FileSystem>, retry_policy: Arc<RetryPolicy>) -> anyhow::Error {
    let (mut interrupt, mut terminate) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "failed to install signal handlers");
                return std::future::pending().await;
            }
        };

    loop {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        info!(signal = name, "signal received, unmounting");

        let result = unmount(&fs).await;
        retry_policy.disable();
        if let Err(e) = result {
            return e;
        }
    }
}

/// Runs the unmount on the blocking pool. The unmount tool and the handle
/// drain both block, and the runtime keeps answering requests meanwhile.
async fn unmount(fs: &Arc<FileSystem>) -> anyhow::Result<()> {
    let fs = fs.clone();
    tokio::task::spawn_blocking(move || fs.unmount())
        .await
        .context("unmount task failed")?
        .context("unmount failed")
}

fn create_staging_dir(path: &Path) {
    if let Err(e) = std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
    {
        error!(stage_dir = %path.display(), error = %e, "failed to create staging directory");
    }
}

fn raise_open_file_limit() {
    let limit = libc::rlimit {
        rlim_cur: MAX_OPEN_FILES,
        rlim_max: MAX_OPEN_FILES,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of the call.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) };
    if rc != 0 {
        warn!(
            error = %std::io::Error::last_os_error(),
            "failed to raise the open file limit to {}",
            MAX_OPEN_FILES
        );
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use common::testkit::MemoryAccessor;

    use super::*;
    use crate::fuse::{MountConfig, UnmountTool};

    fn file_system(tool: UnmountTool) -> Arc<FileSystem> {
        let mut config = MountConfig::new("/nonexistent/hdfs-mount-process");
        config.unmount_tool = tool;
        let identity = UserIdentity {
            uid: 1000,
            gid: 1000,
            name: "alice".to_string(),
        };
        FileSystem::new(
            config,
            Arc::new(MemoryAccessor::new()),
            Arc::new(RetryPolicy::default()),
            identity,
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_unmount_leaves_the_runtime_free() {
        let fs = file_system(UnmountTool {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 0.3".to_string(), "sh".to_string()],
        });
        fs.registry().mark_mounted().unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        unmount(&fs).await.unwrap();
        ticker.abort();

        assert!(!fs.is_mounted());
        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test]
    async fn test_unmount_failure_is_reported() {
        let fs = file_system(UnmountTool {
            program: "false".to_string(),
            args: Vec::new(),
        });
        fs.registry().mark_mounted().unwrap();

        let err = unmount(&fs).await.unwrap_err();
        assert!(format!("{:#}", err).contains("unmount failed"));
        assert!(!fs.is_mounted());
    }

    #[test]
    fn test_staging_dir_is_private() {
        let temp = tempfile::tempdir().unwrap();
        let stage = temp.path().join("a/b");

        create_staging_dir(&stage);

        let mode = std::fs::metadata(&stage).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        // existing directory is fine
        create_staging_dir(&stage);
    }
}
