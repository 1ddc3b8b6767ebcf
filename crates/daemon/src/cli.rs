use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use common::retry::RetryPolicy;

use crate::fuse::{MountConfig, MountOptions, PathPolicy, UnmountTool};

/// Mount an HDFS cluster as a local file system
#[derive(Parser, Debug, Clone)]
#[command(name = "hdfs-mount", version, about)]
pub struct Args {
    /// NameNode HTTP address, NAMENODE:PORT
    #[arg(value_name = "NAMENODE:PORT", env = "HDFS_MOUNT_NAMENODE")]
    pub namenode: String,

    /// Local directory to mount on
    #[arg(value_name = "MOUNTPOINT", env = "HDFS_MOUNT_MOUNTPOINT")]
    pub mount_point: PathBuf,

    /// Mount before HDFS is reachable, skipping the connectivity check
    #[arg(long, env = "HDFS_MOUNT_LAZY")]
    pub lazy: bool,

    /// Time limit for all retry attempts of a failed operation
    #[arg(long, default_value = "5m", env = "HDFS_MOUNT_RETRY_TIME_LIMIT")]
    pub retry_time_limit: humantime::Duration,

    /// Maximum retry attempts for a failed operation
    #[arg(long, default_value_t = 99_999_999, env = "HDFS_MOUNT_RETRY_MAX_ATTEMPTS")]
    pub retry_max_attempts: u32,

    /// Minimum delay between retries (the first retry is immediate)
    #[arg(long, default_value = "1s", env = "HDFS_MOUNT_RETRY_MIN_DELAY")]
    pub retry_min_delay: humantime::Duration,

    /// Maximum delay between retries
    #[arg(long, default_value = "60s", env = "HDFS_MOUNT_RETRY_MAX_DELAY")]
    pub retry_max_delay: humantime::Duration,

    /// Comma-separated top-level prefixes to expose, `*` for everything
    #[arg(long, default_value = "*", env = "HDFS_MOUNT_ALLOWED_PREFIXES")]
    pub allowed_prefixes: String,

    /// Expose every .zip file as a browsable `<name>.zip@` directory
    #[arg(long, env = "HDFS_MOUNT_EXPAND_ZIPS")]
    pub expand_zips: bool,

    /// Mount read-only
    #[arg(long, env = "HDFS_MOUNT_READ_ONLY")]
    pub read_only: bool,

    /// Log level: error, warn, info, debug, trace (RUST_LOG overrides)
    #[arg(long, default_value = "warn", env = "HDFS_MOUNT_LOG_LEVEL")]
    pub log_level: String,

    /// Staging directory for buffered writes
    #[arg(long = "stage-dir", default_value = "/var/hdfs-mount", env = "HDFS_MOUNT_STAGE_DIR")]
    pub stage_dir: PathBuf,

    /// Talk to the NameNode over HTTPS
    #[arg(long, env = "HDFS_MOUNT_TLS")]
    pub tls: bool,

    /// Remote user name (defaults to the local user)
    #[arg(long, env = "HDFS_MOUNT_USER")]
    pub user: Option<String>,
}

impl Args {
    /// The configured retry count converted to a total attempt budget.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from(self.retry_time_limit),
            self.retry_max_attempts.saturating_add(1),
            Duration::from(self.retry_min_delay),
            Duration::from(self.retry_max_delay),
        )
    }

    pub fn mount_config(&self) -> MountConfig {
        MountConfig {
            mount_point: self.mount_point.clone(),
            path_policy: PathPolicy::parse(&self.allowed_prefixes),
            expand_zips: self.expand_zips,
            options: MountOptions {
                read_only: self.read_only,
                ..Default::default()
            },
            unmount_tool: UnmountTool::default(),
        }
    }
}
