//! Disk-backed file provider over `tokio::fs`.
//!
//! Shared roots are plain directories. Hierarchy paths are resolved one
//! sanitized segment at a time in an explicit loop — never by handing peer
//! input to the OS path parser wholesale, and never recursively.
//!
//! Incoming files land in a downloads directory under a random short prefix
//! so repeated transfers of the same name cannot collide.

use super::{
    sort_entries, DirEntry, DirectoryListing, EntryKind, FileMetadata, FileProvider, WriteSink,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::debug;
use uuid::Uuid;

/// Strip a peer-supplied name segment down to a safe filename component.
///
/// Keeps alphanumerics, `.`, `-`, `_` and spaces; rejects `.`/`..` and
/// anything that sanitizes to the empty string.
fn sanitize_segment(segment: &str) -> Option<String> {
    if segment == "." || segment == ".." {
        return None;
    }
    let safe: String = segment
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    (!safe.is_empty()).then_some(safe)
}

/// File provider serving one or more local root directories.
pub struct DiskProvider {
    /// Shared roots; the first hierarchy segment selects one by directory name.
    roots: Vec<PathBuf>,
    /// Where incoming files are written.
    download_dir: PathBuf,
}

impl DiskProvider {
    pub fn new(roots: Vec<PathBuf>, download_dir: PathBuf) -> Self {
        Self {
            roots,
            download_dir,
        }
    }

    /// Find the shared root whose directory name matches `name`.
    fn root_by_name(&self, name: &str) -> Option<&PathBuf> {
        self.roots
            .iter()
            .find(|r| r.file_name().map(|n| n.to_string_lossy() == name).unwrap_or(false))
    }

    /// Walk `path` (root name first) down to a filesystem path.
    ///
    /// Iterative: one sanitized segment per step, verifying each
    /// intermediate step is a directory. Returns `None` when any segment is
    /// missing or unsafe.
    async fn walk(&self, path: &[String]) -> Result<Option<PathBuf>> {
        let Some((root_name, rest)) = path.split_first() else {
            return Ok(None);
        };
        let Some(root) = self.root_by_name(root_name) else {
            return Ok(None);
        };

        let mut current = root.clone();
        for segment in rest {
            let Some(safe) = sanitize_segment(segment) else {
                debug!(event = "path_segment_rejected", segment = %segment, "Dropping unsafe path segment");
                return Ok(None);
            };
            let Ok(meta) = fs::metadata(&current).await else {
                return Ok(None);
            };
            if !meta.is_dir() {
                return Ok(None);
            }
            current.push(safe);
            if fs::metadata(&current).await.is_err() {
                return Ok(None);
            }
        }
        Ok(Some(current))
    }

    /// One-level listing of the directory at `dir`, entry paths rooted at
    /// `hierarchy`.
    async fn list_directory(dir: &Path, hierarchy: &[String]) -> Result<DirectoryListing> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut content = Vec::new();
        let mut read_dir = fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let entry_name = entry.file_name().to_string_lossy().into_owned();
            let mut path = hierarchy.to_vec();
            path.push(entry_name.clone());
            content.push(DirEntry {
                name: entry_name,
                kind: if meta.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                path,
                size: (!meta.is_dir()).then(|| meta.len()),
            });
        }
        sort_entries(&mut content);

        Ok(DirectoryListing {
            name,
            kind: EntryKind::Directory,
            hierarchy: hierarchy.to_vec(),
            content,
        })
    }
}

#[async_trait]
impl FileProvider for DiskProvider {
    async fn list_roots(&self) -> Result<Vec<DirectoryListing>> {
        let mut listings = Vec::with_capacity(self.roots.len());
        for root in &self.roots {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            listings.push(Self::list_directory(root, &[name]).await?);
        }
        Ok(listings)
    }

    async fn read_dir(&self, path: &[String]) -> Result<Option<DirectoryListing>> {
        let Some(dir) = self.walk(path).await? else {
            return Ok(None);
        };
        if !fs::metadata(&dir).await?.is_dir() {
            return Ok(None);
        }
        Ok(Some(Self::list_directory(&dir, path).await?))
    }

    async fn resolve(&self, path: &[String]) -> Result<Option<FileMetadata>> {
        let Some(file) = self.walk(path).await? else {
            return Ok(None);
        };
        let meta = fs::metadata(&file).await?;
        if meta.is_dir() {
            return Ok(None);
        }
        Ok(Some(FileMetadata {
            name: file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: meta.len(),
        }))
    }

    async fn read_range(&self, path: &[String], offset: u64, len: usize) -> Result<Bytes> {
        let file_path = self
            .walk(path)
            .await?
            .ok_or_else(|| anyhow!("no file at requested path"))?;

        let mut file = fs::File::open(&file_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .await
            .with_context(|| format!("short read at offset {offset}"))?;
        Ok(Bytes::from(buf))
    }

    async fn open_write_target(&self, name: &str, size: u64) -> Result<Box<dyn WriteSink>> {
        fs::create_dir_all(&self.download_dir).await?;

        let safe_name = sanitize_segment(name).unwrap_or_else(|| "file".to_string());
        let prefix = Uuid::new_v4().simple().to_string();
        let target = self.download_dir.join(format!("{}-{}", &prefix[..6], safe_name));

        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&target)
            .await?;
        file.set_len(size).await?;

        debug!(event = "write_target_opened", path = %target.display(), size, "Opened incoming file target");
        Ok(Box::new(DiskSink { file }))
    }
}

/// Sequential writer over one open download file.
struct DiskSink {
    file: fs::File,
}

#[async_trait]
impl WriteSink for DiskSink {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes).await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}
