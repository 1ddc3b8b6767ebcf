//! Retrying decorator around any [`HdfsAccessor`]

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::accessor::{FileStatus, FsInfo, HdfsAccessor};
use crate::error::Result;
use crate::retry::RetryPolicy;

/// Wraps an accessor so every call is retried according to a live
/// [`RetryPolicy`].
pub struct FaultTolerantAccessor<A> {
    inner: A,
    retry_policy: Arc<RetryPolicy>,
}

impl<A: HdfsAccessor> FaultTolerantAccessor<A> {
    pub fn new(inner: A, retry_policy: Arc<RetryPolicy>) -> Self {
        Self {
            inner,
            retry_policy,
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn retry_policy(&self) -> &Arc<RetryPolicy> {
        &self.retry_policy
    }

    async fn with_retries<T, F, Fut>(
        &self,
        operation: &'static str,
        path: &str,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut op = self.retry_policy.start_operation();
        loop {
            match call().await {
                Ok(value) => {
                    if op.attempts() > 0 {
                        debug!(
                            operation,
                            path,
                            attempts = op.attempts() + 1,
                            "succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !op.should_retry(&e).await {
                        return Err(e);
                    }
                    warn!(
                        operation,
                        path,
                        attempt = op.attempts(),
                        error = %e,
                        "retrying failed operation"
                    );
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<A: HdfsAccessor> HdfsAccessor for FaultTolerantAccessor<A> {
    async fn stat_fs(&self) -> Result<FsInfo> {
        let inner = &self.inner;
        self.with_retries("statfs", "/", move || inner.stat_fs()).await
    }

    async fn ensure_connected(&self) -> Result<()> {
        let inner = &self.inner;
        self.with_retries("connect", "/", move || inner.ensure_connected())
            .await
    }

    async fn stat(&self, path: &str) -> Result<FileStatus> {
        let inner = &self.inner;
        self.with_retries("stat", path, move || inner.stat(path)).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileStatus>> {
        let inner = &self.inner;
        self.with_retries("readdir", path, move || inner.read_dir(path))
            .await
    }

    async fn read_at(&self, path: &str, offset: u64, len: u32) -> Result<Bytes> {
        let inner = &self.inner;
        self.with_retries("read", path, move || inner.read_at(path, offset, len))
            .await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let inner = &self.inner;
        self.with_retries("mkdir", path, move || inner.mkdir(path)).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let inner = &self.inner;
        self.with_retries("remove", path, move || inner.remove(path)).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let inner = &self.inner;
        self.with_retries("rename", from, move || inner.rename(from, to))
            .await
    }
}
