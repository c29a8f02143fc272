//! In-memory file provider used by protocol tests.
//!
//! Files are registered up front under hierarchy paths; everything written
//! to a sink stays inspectable so tests can assert on received bytes and on
//! whether the completion handshake actually closed the target.

use super::{
    sort_entries, DirEntry, DirectoryListing, EntryKind, FileMetadata, FileProvider, WriteSink,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Contents of one finished or in-progress incoming file.
#[derive(Debug, Default)]
pub struct ReceivedFile {
    pub bytes: Vec<u8>,
    pub declared_size: u64,
    pub closed: bool,
}

/// A provider whose files live in a map of hierarchy path → bytes.
#[derive(Default)]
pub struct MemoryProvider {
    files: BTreeMap<Vec<String>, Bytes>,
    received: Arc<Mutex<BTreeMap<String, ReceivedFile>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file at `path` (root name first).
    pub fn with_file(mut self, path: &[&str], bytes: impl Into<Bytes>) -> Self {
        self.files
            .insert(path.iter().map(|s| s.to_string()).collect(), bytes.into());
        self
    }

    /// Everything written through sinks, keyed by incoming file name.
    pub fn received(&self) -> Arc<Mutex<BTreeMap<String, ReceivedFile>>> {
        self.received.clone()
    }

    fn root_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .files
            .keys()
            .filter_map(|p| p.first().cloned())
            .collect();
        names.dedup();
        names
    }

    /// One-level listing of the directory at `path`.
    fn listing_at(&self, path: &[String]) -> Option<DirectoryListing> {
        let mut content: Vec<DirEntry> = Vec::new();
        let mut seen_dirs: Vec<String> = Vec::new();

        for (file_path, bytes) in &self.files {
            if file_path.len() <= path.len() || !file_path.starts_with(path) {
                continue;
            }
            let name = file_path[path.len()].clone();
            let mut entry_path = path.to_vec();
            entry_path.push(name.clone());

            if file_path.len() == path.len() + 1 {
                content.push(DirEntry {
                    name,
                    kind: EntryKind::File,
                    path: entry_path,
                    size: Some(bytes.len() as u64),
                });
            } else if !seen_dirs.contains(&name) {
                seen_dirs.push(name.clone());
                content.push(DirEntry {
                    name,
                    kind: EntryKind::Directory,
                    path: entry_path,
                    size: None,
                });
            }
        }

        if content.is_empty() && !self.root_names().contains(&path[0]) {
            return None;
        }
        sort_entries(&mut content);
        Some(DirectoryListing {
            name: path.last().cloned().unwrap_or_default(),
            kind: EntryKind::Directory,
            hierarchy: path.to_vec(),
            content,
        })
    }
}

#[async_trait]
impl FileProvider for MemoryProvider {
    async fn list_roots(&self) -> Result<Vec<DirectoryListing>> {
        Ok(self
            .root_names()
            .into_iter()
            .filter_map(|root| self.listing_at(&[root]))
            .collect())
    }

    async fn read_dir(&self, path: &[String]) -> Result<Option<DirectoryListing>> {
        if path.is_empty() {
            return Ok(None);
        }
        Ok(self.listing_at(path))
    }

    async fn resolve(&self, path: &[String]) -> Result<Option<FileMetadata>> {
        Ok(self.files.get(path).map(|bytes| FileMetadata {
            name: path.last().cloned().unwrap_or_default(),
            size: bytes.len() as u64,
        }))
    }

    async fn read_range(&self, path: &[String], offset: u64, len: usize) -> Result<Bytes> {
        let bytes = self
            .files
            .get(path)
            .ok_or_else(|| anyhow!("no file at requested path"))?;
        let start = offset as usize;
        if start + len > bytes.len() {
            return Err(anyhow!("range past end of file"));
        }
        Ok(bytes.slice(start..start + len))
    }

    async fn open_write_target(&self, name: &str, size: u64) -> Result<Box<dyn WriteSink>> {
        let mut received = self.received.lock().unwrap();
        received.insert(
            name.to_string(),
            ReceivedFile {
                bytes: Vec::new(),
                declared_size: size,
                closed: false,
            },
        );
        Ok(Box::new(MemorySink {
            name: name.to_string(),
            received: self.received.clone(),
        }))
    }
}

struct MemorySink {
    name: String,
    received: Arc<Mutex<BTreeMap<String, ReceivedFile>>>,
}

#[async_trait]
impl WriteSink for MemorySink {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut received = self.received.lock().unwrap();
        let file = received
            .get_mut(&self.name)
            .ok_or_else(|| anyhow!("sink target vanished"))?;
        file.bytes.extend_from_slice(bytes);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut received = self.received.lock().unwrap();
        if let Some(file) = received.get_mut(&self.name) {
            file.closed = true;
        }
        Ok(())
    }
}
