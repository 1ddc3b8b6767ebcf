//! Zip archives exposed as read-only directories
//!
//! With archive expansion on, every remote `name.zip` file gets a sibling
//! directory `name.zip@` listing the archive contents. The central directory
//! is read once per archive version through [`RemoteReader`], a blocking
//! `Read + Seek` view of the remote file. Entry contents are streamed forward
//! only: stored entries straight from the remote file, deflated ones through
//! a decoder. Each stream is checked against the entry's CRC-32 once its last
//! byte has been read.

use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{NaiveDate, TimeZone, Utc};
use common::accessor::HdfsAccessor;
use common::error::AccessorError;
use flate2::read::DeflateDecoder;
use flate2::CrcReader;
use fuser::FileType;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tracing::{debug, error};
use zip::result::ZipError;
use zip::{CompressionMethod, ZipArchive};

use super::attrs::Attrs;
use super::error::FsError;
use super::file_system::FileSystem;
use super::handles::{OpenHandle, Opened, FOPEN_DIRECT_IO, FOPEN_NONSEEKABLE};
use super::node::Node;
use super::node_table::filename;
use super::registry::Resource;

/// Extension of files treated as archives.
pub const ARCHIVE_EXTENSION: &str = ".zip";
/// Appended to an archive name to form its expanded directory.
pub const EXPANDED_MARKER: char = '@';

/// Bytes fetched per remote round trip while reading an archive.
const READ_AHEAD: u64 = 64 * 1024;

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const LOCAL_HEADER_LEN: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Failed to read archive {archive}: {source}")]
    Read {
        archive: String,
        #[source]
        source: AccessorError,
    },
    #[error("Corrupt archive {archive}: {source}")]
    Corrupt {
        archive: String,
        #[source]
        source: ZipError,
    },
    #[error("Invalid local header for {entry} in {archive}")]
    BadLocalHeader { archive: String, entry: String },
    #[error("Unsupported compression {method} for {entry} in {archive}")]
    UnsupportedCompression {
        archive: String,
        entry: String,
        method: String,
    },
    #[error("No entry {entry} in {archive}")]
    EntryNotFound { archive: String, entry: String },
    #[error("I/O error on archive {archive}: {source}")]
    Io {
        archive: String,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    pub fn errno(&self) -> libc::c_int {
        match self {
            ArchiveError::Read { source, .. } => match source {
                AccessorError::NotFound(_) => libc::ENOENT,
                AccessorError::PermissionDenied(_) => libc::EACCES,
                _ => libc::EIO,
            },
            ArchiveError::EntryNotFound { .. } => libc::ENOENT,
            ArchiveError::UnsupportedCompression { .. } => libc::ENOTSUP,
            _ => libc::EIO,
        }
    }
}

/// Whether `name` is a remote file that gets an expanded directory.
pub fn is_archive_name(name: &str) -> bool {
    name.len() > ARCHIVE_EXTENSION.len()
        && name
            .get(name.len() - ARCHIVE_EXTENSION.len()..)
            .is_some_and(|ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
}

/// Name of the expanded directory for an archive called `name`.
pub fn expanded_name(name: &str) -> String {
    format!("{}{}", name, EXPANDED_MARKER)
}

/// Archive name behind an expanded directory name, if it is one.
pub fn archive_name_of(expanded: &str) -> Option<&str> {
    expanded
        .strip_suffix(EXPANDED_MARKER)
        .filter(|name| is_archive_name(name))
}

/// Blocking, seekable reader over a remote file.
///
/// Must be driven from a thread outside the async runtime (for example a
/// `spawn_blocking` task): each buffer refill blocks on the accessor.
pub struct RemoteReader {
    accessor: Arc<dyn HdfsAccessor>,
    path: String,
    size: u64,
    position: u64,
    buffer: Bytes,
    buffer_start: u64,
    runtime: Handle,
}

impl RemoteReader {
    pub fn new(
        accessor: Arc<dyn HdfsAccessor>,
        path: impl Into<String>,
        size: u64,
        runtime: Handle,
    ) -> Self {
        Self {
            accessor,
            path: path.into(),
            size,
            position: 0,
            buffer: Bytes::new(),
            buffer_start: 0,
            runtime,
        }
    }

    pub fn starting_at(mut self, position: u64) -> Self {
        self.position = position;
        self
    }

    fn is_buffered(&self, position: u64) -> bool {
        position >= self.buffer_start && position < self.buffer_start + self.buffer.len() as u64
    }

    fn fill(&mut self) -> io::Result<()> {
        let len = READ_AHEAD.min(self.size - self.position) as u32;
        let data = self
            .runtime
            .block_on(self.accessor.read_at(&self.path, self.position, len))
            .map_err(io::Error::other)?;
        if data.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} ended at {} of {} bytes", self.path, self.position, self.size),
            ));
        }
        self.buffer = data;
        self.buffer_start = self.position;
        Ok(())
    }
}

impl Read for RemoteReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() || self.position >= self.size {
            return Ok(0);
        }
        if !self.is_buffered(self.position) {
            self.fill()?;
        }

        let offset = (self.position - self.buffer_start) as usize;
        let available = &self.buffer[offset..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for RemoteReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        self.position = target;
        Ok(target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryCompression {
    Stored,
    Deflated,
    Unsupported(String),
}

/// One file or directory inside an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Path inside the archive, without leading or trailing slash
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub compressed_size: u64,
    /// CRC-32 of the uncompressed contents
    pub crc32: u32,
    pub header_start: u64,
    pub compression: EntryCompression,
    pub mode: u16,
    pub mtime: SystemTime,
}

impl IndexEntry {
    fn implicit_dir(name: String, mtime: SystemTime) -> Self {
        Self {
            name,
            is_dir: true,
            size: 0,
            compressed_size: 0,
            crc32: 0,
            header_start: 0,
            compression: EntryCompression::Stored,
            mode: 0o555,
            mtime,
        }
    }

    fn attrs(&self, inode: u64, fs: &FileSystem) -> Attrs {
        let identity = fs.identity();
        Attrs {
            inode,
            name: filename(&self.name).to_string(),
            kind: if self.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: self.mode,
            size: self.size,
            uid: identity.uid,
            gid: identity.gid,
            mtime: self.mtime,
            atime: self.mtime,
            ctime: self.mtime,
            crtime: self.mtime,
        }
    }
}

/// Contents of an archive's central directory.
#[derive(Debug, Default)]
pub struct ArchiveIndex {
    entries: BTreeMap<String, IndexEntry>,
}

impl ArchiveIndex {
    /// Reads the central directory. Entries with unsafe names (absolute,
    /// containing `..`) are skipped; parents missing from the archive are
    /// synthesized as directories.
    pub fn load<R: Read + Seek>(
        reader: R,
        archive: &str,
        archive_mtime: SystemTime,
    ) -> Result<Self, ArchiveError> {
        let corrupt = |source| ArchiveError::Corrupt {
            archive: archive.to_string(),
            source,
        };
        let mut zip = ZipArchive::new(reader).map_err(corrupt)?;
        let mut entries = BTreeMap::new();

        for i in 0..zip.len() {
            let file = zip.by_index_raw(i).map_err(corrupt)?;
            let Some(name) = sanitize_entry_name(file.name()) else {
                debug!(archive, entry = file.name(), "skipping archive entry with unsafe name");
                continue;
            };

            let is_dir = file.is_dir();
            let compression = match file.compression() {
                CompressionMethod::Stored => EntryCompression::Stored,
                CompressionMethod::Deflated => EntryCompression::Deflated,
                other => EntryCompression::Unsupported(format!("{:?}", other)),
            };
            let default_mode = if is_dir { 0o555 } else { 0o444 };
            let mode = file
                .unix_mode()
                .map(|mode| (mode & 0o777) as u16)
                .filter(|mode| *mode != 0)
                .unwrap_or(default_mode);
            let mtime = file
                .last_modified()
                .and_then(|dt| {
                    dos_time_to_system(dt.year(), dt.month(), dt.day(), dt.hour(), dt.minute(), dt.second())
                })
                .unwrap_or(archive_mtime);

            let entry = IndexEntry {
                name: name.clone(),
                is_dir,
                size: if is_dir { 0 } else { file.size() },
                compressed_size: file.compressed_size(),
                crc32: file.crc32(),
                header_start: file.header_start(),
                compression,
                mode,
                mtime,
            };
            entries.insert(name, entry);
        }

        let implicit: Vec<String> = entries
            .keys()
            .flat_map(|name| ancestors(name))
            .filter(|dir| !entries.contains_key(dir))
            .collect();
        for dir in implicit {
            entries
                .entry(dir.clone())
                .or_insert_with(|| IndexEntry::implicit_dir(dir, archive_mtime));
        }

        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&IndexEntry> {
        self.entries.get(name)
    }

    /// Direct children of the directory `dir` (`""` for the archive root).
    pub fn children<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = &'a IndexEntry> + 'a {
        self.entries
            .values()
            .filter(move |entry| inner_parent(&entry.name) == dir)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn sanitize_entry_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.contains('\\') {
        return None;
    }
    if trimmed
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return None;
    }
    Some(trimmed.to_string())
}

fn ancestors(name: &str) -> Vec<String> {
    name.match_indices('/')
        .map(|(pos, _)| name[..pos].to_string())
        .collect()
}

fn inner_parent(name: &str) -> &str {
    name.rfind('/').map(|pos| &name[..pos]).unwrap_or("")
}

fn inner_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn dos_time_to_system(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
) -> Option<SystemTime> {
    let naive = NaiveDate::from_ymd_opt(year.into(), month.into(), day.into())?.and_hms_opt(
        hour.into(),
        minute.into(),
        second.into(),
    )?;
    Some(Utc.from_utc_datetime(&naive).into())
}

/// Size of the local file header starting at `header`, including the
/// variable-length name and extra fields.
fn local_header_len(header: &[u8]) -> Option<u64> {
    if header.len() < LOCAL_HEADER_LEN as usize {
        return None;
    }
    let signature = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if signature != LOCAL_HEADER_SIGNATURE {
        return None;
    }
    let name_len = u16::from_le_bytes([header[26], header[27]]) as u64;
    let extra_len = u16::from_le_bytes([header[28], header[29]]) as u64;
    Some(LOCAL_HEADER_LEN + name_len + extra_len)
}

/// A specific version of a remote archive and its lazily loaded index.
#[derive(Debug)]
pub struct ArchiveSource {
    path: String,
    size: u64,
    mtime: SystemTime,
    index: OnceCell<Arc<ArchiveIndex>>,
}

impl ArchiveSource {
    pub fn new(path: impl Into<String>, size: u64, mtime: SystemTime) -> Self {
        Self {
            path: path.into(),
            size,
            mtime,
            index: OnceCell::new(),
        }
    }

    /// Remote path of the archive file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Archive size in bytes when the index was requested.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    /// Whether this source still describes a remote file of the given
    /// size and modification time.
    pub fn matches(&self, size: u64, mtime: SystemTime) -> bool {
        self.size == size && self.mtime == mtime
    }

    /// Central directory of this version, read from the cluster on first
    /// use and shared afterwards.
    pub async fn index(
        &self,
        accessor: &Arc<dyn HdfsAccessor>,
    ) -> Result<Arc<ArchiveIndex>, ArchiveError> {
        self.index
            .get_or_try_init(|| async {
                let reader =
                    RemoteReader::new(accessor.clone(), self.path.clone(), self.size, Handle::current());
                let archive = self.path.clone();
                let mtime = self.mtime;
                let index = tokio::task::spawn_blocking(move || {
                    ArchiveIndex::load(reader, &archive, mtime)
                })
                .await
                .map_err(|e| ArchiveError::Io {
                    archive: self.path.clone(),
                    source: io::Error::other(e),
                })??;

                debug!(archive = %self.path, entries = index.len(), "loaded archive index");
                Ok::<_, ArchiveError>(Arc::new(index))
            })
            .await
            .cloned()
    }
}

/// A directory inside an expanded archive, including the archive root.
#[derive(Debug, Clone)]
pub struct ArchiveDirNode {
    pub path: String,
    pub attrs: Attrs,
    source: Arc<ArchiveSource>,
    /// Path inside the archive (`""` for the root)
    inner: String,
}

impl ArchiveDirNode {
    pub fn root(path: String, attrs: Attrs, source: Arc<ArchiveSource>) -> Self {
        Self {
            path,
            attrs,
            source,
            inner: String::new(),
        }
    }

    pub fn source(&self) -> &Arc<ArchiveSource> {
        &self.source
    }

    pub async fn list(&self, fs: &FileSystem) -> Result<Vec<Node>, FsError> {
        let index = self.load_index(fs).await?;
        Ok(index
            .children(&self.inner)
            .map(|entry| self.child_node(fs, entry))
            .collect())
    }

    pub async fn lookup(&self, fs: &FileSystem, name: &str) -> Result<Node, FsError> {
        let index = self.load_index(fs).await?;
        let inner = inner_join(&self.inner, name);
        let entry = index.get(&inner).ok_or_else(|| ArchiveError::EntryNotFound {
            archive: self.source.path().to_string(),
            entry: inner.clone(),
        })?;
        Ok(self.child_node(fs, entry))
    }

    async fn load_index(&self, fs: &FileSystem) -> Result<Arc<ArchiveIndex>, ArchiveError> {
        self.source.index(fs.accessor()).await.inspect_err(|e| {
            error!(archive = %self.source.path(), error = %e, "failed to read archive index");
        })
    }

    fn child_node(&self, fs: &FileSystem, entry: &IndexEntry) -> Node {
        let path = format!("{}/{}", self.path, filename(&entry.name));
        fs.nodes().upsert(&path, |inode| {
            let attrs = entry.attrs(inode, fs);
            if entry.is_dir {
                Node::ArchiveDir(ArchiveDirNode {
                    path: path.clone(),
                    attrs,
                    source: self.source.clone(),
                    inner: entry.name.clone(),
                })
            } else {
                Node::ArchiveEntry(ArchiveEntryNode {
                    path: path.clone(),
                    attrs,
                    source: self.source.clone(),
                    entry: entry.clone(),
                    file_system: fs.weak_ref(),
                })
            }
        })
    }
}

/// A file inside an archive, read as a forward-only stream.
#[derive(Debug, Clone)]
pub struct ArchiveEntryNode {
    pub path: String,
    pub attrs: Attrs,
    source: Arc<ArchiveSource>,
    entry: IndexEntry,
    file_system: Weak<FileSystem>,
}

impl ArchiveEntryNode {
    pub fn attr(&self) -> &Attrs {
        &self.attrs
    }

    /// Opens a stream over the entry contents and registers it for
    /// close-on-unmount. The stream cannot seek backwards.
    pub async fn open(&self) -> Result<Opened, FsError> {
        let fs = self
            .file_system
            .upgrade()
            .ok_or(super::registry::RegistryError::NotMounted)?;

        let handle = self.open_stream(fs.accessor()).await.inspect_err(|e| {
            error!(
                archive = %self.source.path(),
                entry = %self.entry.name,
                error = %e,
                "failed to open archive entry"
            );
        })?;

        let fh = fs.register(OpenHandle::ArchiveEntry(handle))?;
        debug!(archive = %self.source.path(), entry = %self.entry.name, fh, "opened archive entry");
        Ok(Opened {
            fh,
            flags: FOPEN_NONSEEKABLE | FOPEN_DIRECT_IO,
        })
    }

    async fn open_stream(
        &self,
        accessor: &Arc<dyn HdfsAccessor>,
    ) -> Result<ArchiveEntryHandle, ArchiveError> {
        let archive = self.source.path();
        let method = match &self.entry.compression {
            EntryCompression::Unsupported(method) => {
                return Err(ArchiveError::UnsupportedCompression {
                    archive: archive.to_string(),
                    entry: self.entry.name.clone(),
                    method: method.clone(),
                })
            }
            method => method.clone(),
        };

        let header = accessor
            .read_at(archive, self.entry.header_start, (LOCAL_HEADER_LEN + 512) as u32)
            .await
            .map_err(|source| ArchiveError::Read {
                archive: archive.to_string(),
                source,
            })?;
        let header_len = local_header_len(&header).ok_or_else(|| ArchiveError::BadLocalHeader {
            archive: archive.to_string(),
            entry: self.entry.name.clone(),
        })?;

        let raw = RemoteReader::new(accessor.clone(), archive, self.source.size(), Handle::current())
            .starting_at(self.entry.header_start + header_len)
            .take(self.entry.compressed_size);
        let decoded: Box<dyn Read + Send> = match method {
            EntryCompression::Deflated => Box::new(DeflateDecoder::new(raw)),
            _ => Box::new(raw),
        };
        let stream = Box::new(ChecksummedReader::new(
            decoded,
            self.entry.crc32,
            self.entry.size,
        ));

        Ok(ArchiveEntryHandle::new(archive, &self.entry.name, stream))
    }
}

/// Checks the CRC-32 and length of everything read through it once the
/// expected length has been reached or the inner reader ends.
struct ChecksummedReader<R> {
    inner: CrcReader<R>,
    expected_crc: u32,
    expected_len: u64,
    read: u64,
    verified: bool,
    failed: bool,
}

impl<R: Read> ChecksummedReader<R> {
    fn new(inner: R, expected_crc: u32, expected_len: u64) -> Self {
        Self {
            inner: CrcReader::new(inner),
            expected_crc,
            expected_len,
            read: 0,
            verified: false,
            failed: false,
        }
    }

    fn mismatch(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "archive entry checksum mismatch: expected crc {:08x} over {} bytes, got {:08x} over {} bytes",
                self.expected_crc,
                self.expected_len,
                self.inner.crc().sum(),
                self.read
            ),
        )
    }
}

impl<R: Read> Read for ChecksummedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.failed {
            return Err(self.mismatch());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let n = self.inner.read(buf)?;
        self.read += n as u64;
        if !self.verified && (n == 0 || self.read >= self.expected_len) {
            self.verified = true;
            if self.read != self.expected_len || self.inner.crc().sum() != self.expected_crc {
                self.failed = true;
                return Err(self.mismatch());
            }
        }
        Ok(n)
    }
}

struct EntryStream {
    reader: Box<dyn Read + Send>,
    position: u64,
}

impl EntryStream {
    fn read_at(&mut self, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        if offset < self.position {
            return Err(FsError::IllegalSeek {
                requested: offset,
                position: self.position,
            });
        }
        if offset > self.position {
            let gap = offset - self.position;
            let skipped = io::copy(&mut self.reader.by_ref().take(gap), &mut io::sink())?;
            self.position += skipped;
            if skipped < gap {
                return Ok(Vec::new());
            }
        }

        let mut data = Vec::with_capacity(size as usize);
        let read = self.reader.by_ref().take(size.into()).read_to_end(&mut data)?;
        self.position += read as u64;
        Ok(data)
    }
}

/// Open decompression stream of one archive entry.
///
/// Closing never waits for a read in progress: the reader notices the
/// closed flag when it finishes and drops the stream itself.
pub struct ArchiveEntryHandle {
    archive: String,
    entry: String,
    closed: AtomicBool,
    stream: Mutex<Option<EntryStream>>,
}

impl std::fmt::Debug for ArchiveEntryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveEntryHandle")
            .field("archive", &self.archive)
            .field("entry", &self.entry)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ArchiveEntryHandle {
    pub(crate) fn new(archive: &str, entry: &str, reader: Box<dyn Read + Send>) -> Self {
        Self {
            archive: archive.to_string(),
            entry: entry.to_string(),
            closed: AtomicBool::new(false),
            stream: Mutex::new(Some(EntryStream {
                reader,
                position: 0,
            })),
        }
    }

    /// Reads up to `size` bytes at `offset`. Offsets ahead of the stream are
    /// reached by discarding data; offsets behind it fail with
    /// [`FsError::IllegalSeek`]. Blocks on remote I/O.
    pub fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        if self.is_closed() {
            return Err(FsError::Closed);
        }
        let mut guard = self.stream.lock();
        if self.is_closed() {
            guard.take();
            return Err(FsError::Closed);
        }
        let stream = guard.as_mut().ok_or(FsError::Closed)?;
        let result = stream.read_at(offset, size);

        if self.is_closed() {
            guard.take();
            debug!(archive = %self.archive, entry = %self.entry, "dropped stream closed during read");
            return Err(FsError::Closed);
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Resource for ArchiveEntryHandle {
    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // a read holding the stream drops it once it returns
        if let Some(mut guard) = self.stream.try_lock() {
            guard.take();
        }
        debug!(archive = %self.archive, entry = %self.entry, "closed archive entry stream");
        Ok(())
    }
}
