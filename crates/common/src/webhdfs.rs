//! [`HdfsAccessor`] backed by the NameNode's WebHDFS REST gateway

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::accessor::{FileKind, FileStatus, FsInfo, HdfsAccessor};
use crate::error::{AccessorError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const NAMESYSTEM_BEAN: &str = "Hadoop:service=NameNode,name=FSNamesystemState";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFileStatus {
    #[serde(default)]
    access_time: u64,
    #[serde(default)]
    length: u64,
    #[serde(default)]
    modification_time: u64,
    #[serde(default)]
    owner: String,
    #[serde(default)]
    group: String,
    #[serde(default)]
    path_suffix: String,
    permission: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct FileStatusResponse {
    #[serde(rename = "FileStatus")]
    file_status: WireFileStatus,
}

#[derive(Debug, Deserialize)]
struct FileStatusList {
    #[serde(rename = "FileStatus")]
    file_status: Vec<WireFileStatus>,
}

#[derive(Debug, Deserialize)]
struct FileStatusesResponse {
    #[serde(rename = "FileStatuses")]
    file_statuses: FileStatusList,
}

#[derive(Debug, Deserialize)]
struct BooleanResponse {
    boolean: bool,
}

#[derive(Debug, Deserialize)]
struct RemoteException {
    exception: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RemoteExceptionResponse {
    #[serde(rename = "RemoteException")]
    remote_exception: RemoteException,
}

#[derive(Debug, Deserialize)]
struct JmxBean {
    #[serde(rename = "CapacityTotal")]
    capacity_total: u64,
    #[serde(rename = "CapacityRemaining")]
    capacity_remaining: u64,
    #[serde(rename = "CapacityUsed")]
    capacity_used: u64,
}

#[derive(Debug, Deserialize)]
struct JmxResponse {
    beans: Vec<JmxBean>,
}

fn millis_to_time(millis: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_millis(millis)
}

fn last_component(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

impl WireFileStatus {
    fn into_status(self, fallback_name: &str) -> Result<FileStatus> {
        let kind = match self.kind.as_str() {
            "DIRECTORY" => FileKind::Directory,
            "FILE" | "SYMLINK" => FileKind::File,
            other => {
                return Err(AccessorError::Decode(format!(
                    "unknown file type {:?}",
                    other
                )))
            }
        };
        let mode = u32::from_str_radix(&self.permission, 8).map_err(|_| {
            AccessorError::Decode(format!("invalid permission {:?}", self.permission))
        })?;
        let name = if self.path_suffix.is_empty() {
            fallback_name.to_string()
        } else {
            self.path_suffix
        };

        Ok(FileStatus {
            name,
            kind,
            size: if kind == FileKind::Directory { 0 } else { self.length },
            mode,
            mtime: millis_to_time(self.modification_time),
            atime: millis_to_time(self.access_time),
            owner: self.owner,
            group: self.group,
        })
    }
}

/// Maps a Java exception name reported by the NameNode onto the accessor
/// error taxonomy.
fn map_remote_exception(path: &str, exception: String, message: String) -> AccessorError {
    match exception.as_str() {
        "FileNotFoundException" => AccessorError::NotFound(path.to_string()),
        "AccessControlException" | "SecurityException" => {
            AccessorError::PermissionDenied(path.to_string())
        }
        "FileAlreadyExistsException" => AccessorError::AlreadyExists(path.to_string()),
        "PathIsNotEmptyDirectoryException" => AccessorError::NotEmpty(path.to_string()),
        "RetriableException" | "StandbyException" | "SafeModeException" => {
            AccessorError::Unavailable(format!("{}: {}", exception, message))
        }
        _ => AccessorError::Remote { exception, message },
    }
}

/// Talks to a NameNode over HTTP(S).
#[derive(Debug, Clone)]
pub struct WebHdfsAccessor {
    client: Client,
    base_url: Url,
    user: String,
}

impl WebHdfsAccessor {
    /// `endpoint` is the NameNode HTTP address, `host:port`.
    pub fn new(endpoint: &str, tls: bool, user: impl Into<String>) -> Result<Self> {
        let scheme = if tls { "https" } else { "http" };
        let base_url = Url::parse(&format!("{}://{}/", scheme, endpoint))
            .map_err(|e| AccessorError::Decode(format!("invalid endpoint {}: {}", endpoint, e)))?;
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url,
            user: user.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn op_url(&self, path: &str, op: &str, params: &[(&str, String)]) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(&format!("/webhdfs/v1{}", path));
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("op", op);
            query.append_pair("user.name", &self.user);
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        url
    }

    async fn send(&self, method: Method, url: Url, path: &str) -> Result<Response> {
        debug!(%method, %url, "webhdfs request");
        let response = self.client.request(method, url).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(Self::error_from(response, path).await)
    }

    async fn error_from(response: Response, path: &str) -> AccessorError {
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return AccessorError::Http(e),
        };

        if let Ok(parsed) = serde_json::from_str::<RemoteExceptionResponse>(&body) {
            let RemoteException { exception, message } = parsed.remote_exception;
            return map_remote_exception(path, exception, message);
        }

        match status {
            StatusCode::NOT_FOUND => AccessorError::NotFound(path.to_string()),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                AccessorError::PermissionDenied(path.to_string())
            }
            s if s.is_server_error() => AccessorError::Unavailable(format!("{}: {}", s, body)),
            s => AccessorError::Remote {
                exception: s.to_string(),
                message: body,
            },
        }
    }

    async fn json<T: DeserializeOwned>(&self, method: Method, url: Url, path: &str) -> Result<T> {
        let response = self.send(method, url, path).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| AccessorError::Decode(e.to_string()))
    }
}

#[async_trait::async_trait]
impl HdfsAccessor for WebHdfsAccessor {
    async fn stat_fs(&self) -> Result<FsInfo> {
        let mut url = self.base_url.clone();
        url.set_path("/jmx");
        url.query_pairs_mut().append_pair("qry", NAMESYSTEM_BEAN);

        let jmx: JmxResponse = self.json(Method::GET, url, "/").await?;
        let bean = jmx
            .beans
            .into_iter()
            .next()
            .ok_or_else(|| AccessorError::Decode(format!("missing JMX bean {}", NAMESYSTEM_BEAN)))?;

        Ok(FsInfo {
            capacity: bean.capacity_total,
            remaining: bean.capacity_remaining,
            used: bean.capacity_used,
        })
    }

    async fn ensure_connected(&self) -> Result<()> {
        self.stat("/").await.map(|_| ())
    }

    async fn stat(&self, path: &str) -> Result<FileStatus> {
        let url = self.op_url(path, "GETFILESTATUS", &[]);
        let response: FileStatusResponse = self.json(Method::GET, url, path).await?;
        response.file_status.into_status(last_component(path))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileStatus>> {
        let url = self.op_url(path, "LISTSTATUS", &[]);
        let response: FileStatusesResponse = self.json(Method::GET, url, path).await?;
        response
            .file_statuses
            .file_status
            .into_iter()
            .map(|status| status.into_status(""))
            .collect()
    }

    async fn read_at(&self, path: &str, offset: u64, len: u32) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let url = self.op_url(
            path,
            "OPEN",
            &[("offset", offset.to_string()), ("length", len.to_string())],
        );
        let response = self.send(Method::GET, url, path).await?;
        Ok(response.bytes().await?)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let url = self.op_url(path, "MKDIRS", &[]);
        let response: BooleanResponse = self.json(Method::PUT, url, path).await?;
        if response.boolean {
            Ok(())
        } else {
            Err(AccessorError::AlreadyExists(path.to_string()))
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let url = self.op_url(path, "DELETE", &[("recursive", "false".to_string())]);
        let response: BooleanResponse = self.json(Method::DELETE, url, path).await?;
        if response.boolean {
            Ok(())
        } else {
            Err(AccessorError::NotFound(path.to_string()))
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let url = self.op_url(from, "RENAME", &[("destination", to.to_string())]);
        let response: BooleanResponse = self.json(Method::PUT, url, from).await?;
        if response.boolean {
            Ok(())
        } else {
            Err(AccessorError::Remote {
                exception: "RenameFailed".to_string(),
                message: format!("rename {} -> {} was refused", from, to),
            })
        }
    }
}
