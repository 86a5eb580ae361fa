//! Lazily fetched, read-only workspace filesystem
//!
//! Each session owns one [`WorkspaceFilesystem`]. Nothing is fetched until
//! the first access; the first `stat("/")` (or any other call) downloads the
//! whole archive through the [`RemoteSource`], and every later call is
//! served from memory.
//!
//! # Concurrency
//!
//! - The archive fetch is single-flight: concurrent first accesses wait on
//!   the same `OnceCell` and trigger exactly one download.
//! - Decoded documents (text + line index) are single-flight per path.
//! - A failed fetch is not cached; the next caller tries again.

pub mod archive;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::error::FetchError;
use crate::uri::WorkspaceRoot;

pub use archive::{unpack_tarball, ArchiveSource};

/// Remote provider of workspace snapshots
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch the complete tree of `root` at its revision
    async fn fetch_archive(&self, root: &WorkspaceRoot) -> anyhow::Result<Snapshot>;
}

/// Immutable file tree of one workspace
///
/// Paths are stored relative to the workspace root, without a leading `/`.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    files: BTreeMap<String, Arc<[u8]>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: Into<Vec<u8>>,
    {
        let mut snapshot = Self::new();
        for (path, contents) in files {
            snapshot.insert(path.as_ref(), contents);
        }
        snapshot
    }

    pub fn insert(&mut self, path: &str, contents: impl Into<Vec<u8>>) {
        if let Some(path) = normalize(path) {
            if !path.is_empty() {
                self.files.insert(path, Arc::from(contents.into()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All file paths, sorted
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    fn file(&self, path: &str) -> Option<&Arc<[u8]>> {
        self.files.get(path)
    }

    fn is_dir(&self, path: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        let prefix = format!("{}/", path);
        self.files
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(p, _)| p.starts_with(&prefix))
    }

    fn children(&self, dir: &str) -> Vec<FileInfo> {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };

        let mut entries = Vec::new();
        let mut seen_dirs = BTreeSet::new();
        for (path, contents) in self.files.range(prefix.clone()..) {
            let Some(rest) = path.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((child, _)) => {
                    if seen_dirs.insert(child.to_string()) {
                        entries.push(FileInfo::dir(format!("{}{}", prefix, child)));
                    }
                }
                None => entries.push(FileInfo::file(path.clone(), contents.len())),
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

/// Result of `stat` and `read_dir`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Base name (empty for the root)
    pub name: String,
    /// Path relative to the workspace root
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

impl FileInfo {
    fn dir(path: String) -> Self {
        Self {
            name: base_name(&path).to_string(),
            path,
            is_dir: true,
            size: 0,
        }
    }

    fn file(path: String, size: usize) -> Self {
        Self {
            name: base_name(&path).to_string(),
            path,
            is_dir: false,
            size: size as u64,
        }
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Normalize a workspace path; `None` if it escapes the root
fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

/// Decoded text of a file with a line index
///
/// Positions are 0-based and characters are counted as Unicode scalar
/// values, so a multi-byte character is a single unit.
#[derive(Debug)]
pub struct Document {
    text: String,
    /// Byte offset of the start of each line
    line_starts: Vec<usize>,
}

impl Document {
    pub fn new(text: String) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            text.bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i + 1),
        );
        Self { text, line_starts }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Text of a line without its terminator
    pub fn line(&self, line: usize) -> Option<&str> {
        let start = *self.line_starts.get(line)?;
        let end = self
            .line_starts
            .get(line + 1)
            .map(|next| next - 1)
            .unwrap_or(self.text.len());
        let text = &self.text[start..end];
        Some(text.strip_suffix('\r').unwrap_or(text))
    }

    /// Number of characters on a line
    pub fn line_len(&self, line: usize) -> Option<usize> {
        self.line(line).map(|text| text.chars().count())
    }

    /// Check that `(line, character)` addresses a location in this document
    ///
    /// The position just past the last character of a line is valid.
    pub fn check_position(&self, line: u32, character: u32) -> Result<(), String> {
        let line_idx = line as usize;
        let Some(len) = self.line_len(line_idx) else {
            return Err(format!(
                "line {} is beyond the end of the document ({} lines)",
                line,
                self.line_count()
            ));
        };
        if character as usize > len {
            return Err(format!(
                "character {} is beyond the end of line {} ({} characters)",
                character, line, len
            ));
        }
        Ok(())
    }
}

/// Read-only, lazily populated view of one workspace
pub struct WorkspaceFilesystem {
    root: WorkspaceRoot,
    source: Arc<dyn RemoteSource>,
    snapshot: OnceCell<Arc<Snapshot>>,
    documents: Mutex<HashMap<String, Arc<OnceCell<Arc<Document>>>>>,
}

impl WorkspaceFilesystem {
    pub fn new(root: WorkspaceRoot, source: Arc<dyn RemoteSource>) -> Self {
        Self {
            root,
            source,
            snapshot: OnceCell::new(),
            documents: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &WorkspaceRoot {
        &self.root
    }

    /// Whether the archive has been fetched
    pub fn is_loaded(&self) -> bool {
        self.snapshot.initialized()
    }

    /// Number of decoded documents held in the cache
    pub fn cached_documents(&self) -> usize {
        self.documents
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    async fn snapshot(&self, path: &str) -> Result<Arc<Snapshot>, FetchError> {
        self.snapshot
            .get_or_try_init(|| async {
                tracing::info!("Fetching workspace archive for {}", self.root);
                let snapshot = self.source.fetch_archive(&self.root).await?;
                tracing::info!("Fetched {} files for {}", snapshot.len(), self.root);
                Ok::<_, anyhow::Error>(Arc::new(snapshot))
            })
            .await
            .cloned()
            .map_err(|e| FetchError::Remote {
                path: path.to_string(),
                message: format!("{:#}", e),
            })
    }

    fn resolve(path: &str) -> Result<String, FetchError> {
        normalize(path).ok_or_else(|| FetchError::NotFound {
            path: path.to_string(),
        })
    }

    pub async fn stat(&self, path: &str) -> Result<FileInfo, FetchError> {
        let snapshot = self.snapshot(path).await?;
        let resolved = Self::resolve(path)?;
        if let Some(contents) = snapshot.file(&resolved) {
            Ok(FileInfo::file(resolved, contents.len()))
        } else if snapshot.is_dir(&resolved) {
            Ok(FileInfo::dir(resolved))
        } else {
            Err(FetchError::NotFound {
                path: path.to_string(),
            })
        }
    }

    pub async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, FetchError> {
        let snapshot = self.snapshot(path).await?;
        let resolved = Self::resolve(path)?;
        if snapshot.is_dir(&resolved) {
            Ok(snapshot.children(&resolved))
        } else if snapshot.file(&resolved).is_some() {
            Err(FetchError::NotADirectory {
                path: path.to_string(),
            })
        } else {
            Err(FetchError::NotFound {
                path: path.to_string(),
            })
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<Arc<[u8]>, FetchError> {
        let snapshot = self.snapshot(path).await?;
        let resolved = Self::resolve(path)?;
        match snapshot.file(&resolved) {
            Some(contents) => Ok(contents.clone()),
            None if snapshot.is_dir(&resolved) => Err(FetchError::IsADirectory {
                path: path.to_string(),
            }),
            None => Err(FetchError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    /// All file paths in the workspace, sorted
    pub async fn list_files(&self) -> Result<Vec<String>, FetchError> {
        let snapshot = self.snapshot("/").await?;
        Ok(snapshot.paths().map(str::to_string).collect())
    }

    /// Decoded text of a file, cached per path
    pub async fn read_document(&self, path: &str) -> Result<Arc<Document>, FetchError> {
        let resolved = Self::resolve(path)?;
        let cell = self
            .documents
            .lock()
            .entry(resolved.clone())
            .or_default()
            .clone();

        let result = cell
            .get_or_try_init(|| async {
                let bytes = self.read_file(path).await?;
                let text = std::str::from_utf8(&bytes).map_err(|_| FetchError::NotText {
                    path: path.to_string(),
                })?;
                Ok::<_, FetchError>(Arc::new(Document::new(text.to_string())))
            })
            .await
            .cloned();

        if result.is_err() {
            let mut documents = self.documents.lock();
            if documents
                .get(&resolved)
                .is_some_and(|c| Arc::ptr_eq(c, &cell) && !c.initialized())
            {
                documents.remove(&resolved);
            }
        }
        result
    }
}

impl std::fmt::Debug for WorkspaceFilesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceFilesystem")
            .field("root", &self.root)
            .field("loaded", &self.is_loaded())
            .field("cached_documents", &self.cached_documents())
            .finish()
    }
}
