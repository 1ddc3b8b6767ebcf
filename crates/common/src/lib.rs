//! Remote side of hdfs-mount
//!
//! The FUSE daemon never talks to the cluster directly. It goes through an
//! [`accessor::HdfsAccessor`], normally a [`webhdfs::WebHdfsAccessor`]
//! wrapped in a [`fault_tolerant::FaultTolerantAccessor`] that retries
//! transient failures according to a live [`retry::RetryPolicy`].

pub mod accessor;
pub mod error;
pub mod fault_tolerant;
pub mod retry;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
pub mod version;
pub mod webhdfs;

pub mod prelude {
    pub use crate::accessor::{join_path, FileKind, FileStatus, FsInfo, HdfsAccessor};
    pub use crate::error::AccessorError;
    pub use crate::fault_tolerant::FaultTolerantAccessor;
    pub use crate::retry::RetryPolicy;
    pub use crate::webhdfs::WebHdfsAccessor;
}
