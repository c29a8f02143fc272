//! Storage boundary: the engine never touches disks or pickers directly.
//!
//! A [`FileProvider`] enumerates shared roots, resolves hierarchy paths to
//! files, serves ranged reads for outgoing chunks, and opens pre-truncated
//! write targets for incoming transfers. The engine is agnostic to where the
//! bytes live; [`fs::DiskProvider`] is the production implementation and
//! [`memory::MemoryProvider`] backs the protocol tests.

pub mod fs;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ── Listing types ────────────────────────────────────────────────────────────

/// Entry kind inside a directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

/// One entry of a single-level directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Full hierarchy path of this entry, root name first.
    pub path: Vec<String>,
    /// File size in bytes; absent for directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A single-level listing of one directory, as shared with peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub name: String,
    pub kind: EntryKind,
    /// Hierarchy path of the listed directory, root name first.
    pub hierarchy: Vec<String>,
    /// Entries sorted directories-first, then files, each alphabetically.
    pub content: Vec<DirEntry>,
}

/// Name and size of a resolvable file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
}

/// Sort listing entries the way they are presented to peers:
/// directories before files, each group alphabetically by name.
pub fn sort_entries(entries: &mut Vec<DirEntry>) {
    entries.sort_by(|a, b| match (a.kind, b.kind) {
        (EntryKind::Directory, EntryKind::File) => std::cmp::Ordering::Less,
        (EntryKind::File, EntryKind::Directory) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });
}

// ── Traits ───────────────────────────────────────────────────────────────────

/// An open write target for one incoming transfer, pre-truncated to the
/// negotiated size. Chunks arrive strictly in order; `write` appends.
#[async_trait]
pub trait WriteSink: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Close the target. Called only after the completion handshake.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// The storage backend the engine shares from and downloads into.
#[async_trait]
pub trait FileProvider: Send + Sync {
    /// Listings of every shared root.
    async fn list_roots(&self) -> Result<Vec<DirectoryListing>>;

    /// Listing of one directory by hierarchy path, or `None` when the path
    /// resolves to nothing.
    async fn read_dir(&self, path: &[String]) -> Result<Option<DirectoryListing>>;

    /// Metadata of the file at `path`, or `None` when absent.
    async fn resolve(&self, path: &[String]) -> Result<Option<FileMetadata>>;

    /// Exactly `len` bytes of the file at `path`, starting at `offset`.
    async fn read_range(&self, path: &[String], offset: u64, len: usize) -> Result<Bytes>;

    /// Open a write target for an incoming file, truncated to `size`.
    async fn open_write_target(&self, name: &str, size: u64) -> Result<Box<dyn WriteSink>>;
}
