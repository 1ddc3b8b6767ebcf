//! In-memory accessor for tests
//!
//! Enabled with the `testkit` feature so downstream crates can drive the
//! FUSE layer without a cluster.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::accessor::{FileKind, FileStatus, FsInfo, HdfsAccessor};
use crate::error::{AccessorError, Result};

type FailureFactory = Box<dyn Fn() -> AccessorError + Send + Sync>;

#[derive(Debug, Clone)]
enum Entry {
    Dir,
    File(Bytes),
}

struct State {
    entries: BTreeMap<String, Entry>,
    fs_info: FsInfo,
    pending_failures: u32,
    failure: Option<FailureFactory>,
    calls: HashMap<&'static str, u64>,
}

/// A remote file system held entirely in memory.
pub struct MemoryAccessor {
    state: Mutex<State>,
    mtime: SystemTime,
}

impl Default for MemoryAccessor {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

fn name_of(path: &str) -> &str {
    if path == "/" {
        return "";
    }
    path.rsplit('/').next().unwrap_or(path)
}

impl MemoryAccessor {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("/".to_string(), Entry::Dir);
        Self {
            state: Mutex::new(State {
                entries,
                fs_info: FsInfo::default(),
                pending_failures: 0,
                failure: None,
                calls: HashMap::new(),
            }),
            mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000),
        }
    }

    /// Creates a directory and any missing parents.
    pub fn add_dir(&self, path: &str) {
        let mut state = self.state.lock();
        Self::create_parents(&mut state, path);
        state.entries.insert(path.to_string(), Entry::Dir);
    }

    /// Creates a file and any missing parent directories.
    pub fn add_file(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock();
        Self::create_parents(&mut state, path);
        state
            .entries
            .insert(path.to_string(), Entry::File(Bytes::copy_from_slice(data)));
    }

    pub fn set_fs_info(&self, fs_info: FsInfo) {
        self.state.lock().fs_info = fs_info;
    }

    /// Makes the next `count` calls fail with the error built by `make`.
    pub fn fail_next<F>(&self, count: u32, make: F)
    where
        F: Fn() -> AccessorError + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        state.pending_failures = count;
        state.failure = Some(Box::new(make));
    }

    /// How many times the named operation was invoked.
    pub fn calls(&self, operation: &str) -> u64 {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().entries.contains_key(path)
    }

    fn create_parents(state: &mut State, path: &str) {
        let mut parent = parent_of(path);
        let mut missing = Vec::new();
        while !state.entries.contains_key(parent) {
            missing.push(parent.to_string());
            parent = parent_of(parent);
        }
        for dir in missing {
            state.entries.insert(dir, Entry::Dir);
        }
    }

    /// Records the call and returns an injected failure, if one is pending.
    fn enter(&self, operation: &'static str) -> Result<parking_lot::MutexGuard<'_, State>> {
        let mut state = self.state.lock();
        *state.calls.entry(operation).or_insert(0) += 1;
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            if let Some(make) = &state.failure {
                return Err(make());
            }
        }
        Ok(state)
    }

    fn status(&self, path: &str, entry: &Entry) -> FileStatus {
        let (kind, size, mode) = match entry {
            Entry::Dir => (FileKind::Directory, 0, 0o755),
            Entry::File(data) => (FileKind::File, data.len() as u64, 0o644),
        };
        FileStatus {
            name: name_of(path).to_string(),
            kind,
            size,
            mode,
            mtime: self.mtime,
            atime: self.mtime,
            owner: "hdfs".to_string(),
            group: "supergroup".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl HdfsAccessor for MemoryAccessor {
    async fn stat_fs(&self) -> Result<FsInfo> {
        let state = self.enter("statfs")?;
        Ok(state.fs_info)
    }

    async fn ensure_connected(&self) -> Result<()> {
        self.enter("connect")?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FileStatus> {
        let state = self.enter("stat")?;
        let entry = state
            .entries
            .get(path)
            .ok_or_else(|| AccessorError::NotFound(path.to_string()))?;
        Ok(self.status(path, entry))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileStatus>> {
        let state = self.enter("readdir")?;
        match state.entries.get(path) {
            Some(Entry::Dir) => {}
            Some(Entry::File(_)) => {
                return Err(AccessorError::Remote {
                    exception: "FileNotFoundException".to_string(),
                    message: format!("{} is not a directory", path),
                })
            }
            None => return Err(AccessorError::NotFound(path.to_string())),
        }

        Ok(state
            .entries
            .iter()
            .filter(|(child, _)| child.as_str() != "/" && parent_of(child) == path)
            .map(|(child, entry)| self.status(child, entry))
            .collect())
    }

    async fn read_at(&self, path: &str, offset: u64, len: u32) -> Result<Bytes> {
        let state = self.enter("read")?;
        match state.entries.get(path) {
            Some(Entry::File(data)) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(len as usize).min(data.len());
                Ok(data.slice(start..end))
            }
            Some(Entry::Dir) => Err(AccessorError::Remote {
                exception: "FileNotFoundException".to_string(),
                message: format!("Path is not a file: {}", path),
            }),
            None => Err(AccessorError::NotFound(path.to_string())),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let mut state = self.enter("mkdir")?;
        if state.entries.contains_key(path) {
            return Err(AccessorError::AlreadyExists(path.to_string()));
        }
        if !matches!(state.entries.get(parent_of(path)), Some(Entry::Dir)) {
            return Err(AccessorError::NotFound(parent_of(path).to_string()));
        }
        state.entries.insert(path.to_string(), Entry::Dir);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let mut state = self.enter("remove")?;
        if !state.entries.contains_key(path) {
            return Err(AccessorError::NotFound(path.to_string()));
        }
        let has_children = state
            .entries
            .keys()
            .any(|child| child != "/" && child != path && parent_of(child) == path);
        if has_children {
            return Err(AccessorError::NotEmpty(path.to_string()));
        }
        state.entries.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.enter("rename")?;
        if !state.entries.contains_key(from) {
            return Err(AccessorError::NotFound(from.to_string()));
        }
        if state.entries.contains_key(to) {
            return Err(AccessorError::AlreadyExists(to.to_string()));
        }

        let prefix = format!("{}/", from);
        let moved: Vec<String> = state
            .entries
            .keys()
            .filter(|path| path.as_str() == from || path.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(entry) = state.entries.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                state.entries.insert(new, entry);
            }
        }
        Ok(())
    }
}
