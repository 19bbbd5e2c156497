//! The entry tree exposed by a mounted filesystem.
//!
//! The extraction engine never parses on-disk structures itself; it walks
//! entries handed out by a [`Filesystem`] implementation.  An entry is a
//! file, a folder or a link.  Files carry one or more named forks: always
//! a data fork, and possibly a resource fork.

use std::{sync::Arc, time::SystemTime};

use anyhow::Result;

use crate::source::ByteSource;

/// Timestamps attached to an entry.  Each one is independently present or
/// absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryMetadata {
    /// Creation time.
    pub created: Option<SystemTime>,
    /// Last access time.
    pub accessed: Option<SystemTime>,
    /// Last content modification time.
    pub modified: Option<SystemTime>,
}

/// A regular file entry.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// The entry's name within its parent folder.
    pub name: String,
    /// Opaque identifier assigned by the filesystem, used for fork
    /// lookups.
    pub id: u64,
    /// Timestamps.
    pub metadata: EntryMetadata,
}

/// A folder entry.  The volume root presents itself with the name `"/"`.
#[derive(Debug, Clone)]
pub struct FolderEntry {
    /// The entry's name within its parent folder.
    pub name: String,
    /// Opaque identifier assigned by the filesystem, used for child
    /// listings.
    pub id: u64,
    /// Timestamps.
    pub metadata: EntryMetadata,
}

/// A link entry.  Links are listed but not extracted.
#[derive(Debug, Clone)]
pub struct LinkEntry {
    /// The entry's name within its parent folder.
    pub name: String,
    /// Opaque identifier assigned by the filesystem.
    pub id: u64,
    /// Timestamps.
    pub metadata: EntryMetadata,
}

/// A node in the filesystem tree.
///
/// New kinds are added by extending this variant set; the extraction
/// engine pattern-matches over it.
#[derive(Debug, Clone)]
pub enum Entry {
    /// A regular file with one or more forks.
    File(FileEntry),
    /// A folder containing further entries.
    Folder(FolderEntry),
    /// A link.  Not followed, not extracted.
    Link(LinkEntry),
}

impl Entry {
    /// The entry's name.
    pub fn name(&self) -> &str {
        match self {
            Entry::File(f) => &f.name,
            Entry::Folder(f) => &f.name,
            Entry::Link(l) => &l.name,
        }
    }

    /// The entry's timestamps.
    pub fn metadata(&self) -> &EntryMetadata {
        match self {
            Entry::File(f) => &f.metadata,
            Entry::Folder(f) => &f.metadata,
            Entry::Link(l) => &l.metadata,
        }
    }
}

/// The named byte streams a file is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkKind {
    /// The primary data stream.
    Data,
    /// The secondary "resource" stream.
    Resource,
}

/// One fork of a file: a declared length plus the source its bytes are
/// read from.  Draining the source exactly once yields `length` bytes.
pub struct Fork {
    /// Declared length in bytes.
    pub length: u64,
    /// Where the fork's bytes come from.
    pub source: Arc<dyn ByteSource>,
}

/// A successfully opened filesystem region.
///
/// The contract the extraction engine consumes: path lookup, child
/// listing and per-file fork access.
pub trait Filesystem {
    /// Resolves a POSIX-style path to an entry, or `None` if absent.
    fn lookup(&self, path: &str) -> Result<Option<Entry>>;

    /// Lists the entries directly contained in `folder`.
    fn list(&self, folder: &FolderEntry) -> Result<Vec<Entry>>;

    /// Fetches one fork of `file`, or `None` if the file has no fork of
    /// that kind.
    fn fork(&self, file: &FileEntry, kind: ForkKind) -> Result<Option<Fork>>;
}
