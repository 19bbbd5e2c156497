//! End-to-end extraction tests against a scripted filesystem.

use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::Result;
use similar_asserts::assert_eq;
use tempfile::TempDir;

use hfsunpack::{
    appledouble::encode_resource_fork,
    extract::{extract, sanitize, ExtractError, ExtractOptions},
    source::{ByteSource, SourceError},
    tree::{
        Entry, EntryMetadata, FileEntry, Filesystem, FolderEntry, Fork, ForkKind, LinkEntry,
    },
};

struct MemSource(Vec<u8>);

impl ByteSource for MemSource {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        let offset = offset as usize;
        if offset >= self.0.len() {
            return Ok(0);
        }
        let available = &self.0[offset..];
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }
}

/// Yields its bytes and then fails instead of reporting end of stream.
struct FailingSource {
    good: Vec<u8>,
    declared: u64,
}

impl ByteSource for FailingSource {
    fn len(&self) -> u64 {
        self.declared
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        let offset = offset as usize;
        if offset >= self.good.len() {
            return Err(SourceError::Io(std::io::Error::other("bad sector")));
        }
        let available = &self.good[offset..];
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }
}

#[derive(Default)]
struct MockFile {
    data: Vec<u8>,
    resource: Option<Vec<u8>>,
    broken: bool,
}

/// An in-memory filesystem scripted by the tests.
struct MockFs {
    children: HashMap<u64, Vec<Entry>>,
    files: HashMap<u64, MockFile>,
    root: FolderEntry,
    next_id: u64,
}

impl MockFs {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            files: HashMap::new(),
            root: FolderEntry {
                name: "/".to_string(),
                id: 2,
                metadata: EntryMetadata::default(),
            },
            next_id: 16,
        }
    }

    fn take_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn add_folder(&mut self, parent: u64, name: &str) -> u64 {
        let id = self.take_id();
        self.children.entry(parent).or_default().push(Entry::Folder(FolderEntry {
            name: name.to_string(),
            id,
            metadata: EntryMetadata::default(),
        }));
        id
    }

    fn add_file(&mut self, parent: u64, name: &str, file: MockFile) -> u64 {
        self.add_file_with(parent, name, file, EntryMetadata::default())
    }

    fn add_file_with(
        &mut self,
        parent: u64,
        name: &str,
        file: MockFile,
        metadata: EntryMetadata,
    ) -> u64 {
        let id = self.take_id();
        self.files.insert(id, file);
        self.children.entry(parent).or_default().push(Entry::File(FileEntry {
            name: name.to_string(),
            id,
            metadata,
        }));
        id
    }

    fn add_link(&mut self, parent: u64, name: &str) {
        let id = self.take_id();
        self.children.entry(parent).or_default().push(Entry::Link(LinkEntry {
            name: name.to_string(),
            id,
            metadata: EntryMetadata::default(),
        }));
    }
}

impl Filesystem for MockFs {
    fn lookup(&self, path: &str) -> Result<Option<Entry>> {
        let mut current = Entry::Folder(self.root.clone());
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let Entry::Folder(folder) = &current else {
                return Ok(None);
            };
            let children = self.children.get(&folder.id);
            match children.and_then(|c| c.iter().find(|e| e.name() == component)) {
                Some(entry) => current = entry.clone(),
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn list(&self, folder: &FolderEntry) -> Result<Vec<Entry>> {
        Ok(self.children.get(&folder.id).cloned().unwrap_or_default())
    }

    fn fork(&self, file: &FileEntry, kind: ForkKind) -> Result<Option<Fork>> {
        let mock = &self.files[&file.id];
        Ok(match kind {
            ForkKind::Data if mock.broken => Some(Fork {
                length: mock.data.len() as u64 + 100,
                source: Arc::new(FailingSource {
                    good: mock.data.clone(),
                    declared: mock.data.len() as u64 + 100,
                }),
            }),
            ForkKind::Data => Some(Fork {
                length: mock.data.len() as u64,
                source: Arc::new(MemSource(mock.data.clone())),
            }),
            ForkKind::Resource => mock.resource.as_ref().map(|bytes| Fork {
                length: bytes.len() as u64,
                source: Arc::new(MemSource(bytes.clone())),
            }),
        })
    }
}

fn read(path: impl AsRef<Path>) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[test]
fn test_two_level_tree_round_trip() {
    let mut fs = MockFs::new();
    // a payload larger than one copy buffer
    let big: Vec<u8> = (0..300_000u32).map(|i| i as u8).collect();
    fs.add_file(2, "a.txt", MockFile { data: b"alpha".to_vec(), ..Default::default() });
    let docs = fs.add_folder(2, "docs");
    fs.add_file(docs, "b.bin", MockFile { data: big.clone(), ..Default::default() });
    fs.add_file(docs, "empty", MockFile::default());

    let out = TempDir::new().unwrap();
    let summary = extract(&fs, "/", out.path(), &ExtractOptions::default()).unwrap();

    assert_eq!(summary.written, 3);
    assert_eq!(summary.skipped, 0);
    assert!(summary.failures.is_empty());
    assert!(summary.warnings.is_empty());
    assert_eq!(read(out.path().join("a.txt")), b"alpha");
    assert_eq!(read(out.path().join("docs/b.bin")), big);
    assert_eq!(read(out.path().join("docs/empty")), b"");
}

#[test]
fn test_failing_fork_does_not_stop_siblings() {
    let mut fs = MockFs::new();
    fs.add_file(2, "bad", MockFile { data: b"partial".to_vec(), broken: true, ..Default::default() });
    fs.add_file(2, "good", MockFile { data: b"fine".to_vec(), ..Default::default() });

    let out = TempDir::new().unwrap();
    let summary = extract(&fs, "/", out.path(), &ExtractOptions::default()).unwrap();

    assert_eq!(summary.written, 1);
    assert_eq!(summary.failures.len(), 1);
    assert!(summary.failures[0].path.ends_with("bad"));
    assert!(summary.failures[0].reason.contains("bad sector"));
    assert_eq!(read(out.path().join("good")), b"fine");
}

#[test]
fn test_resource_fork_sidecar() {
    let mut fs = MockFs::new();
    let resource = b"ICON data".to_vec();
    fs.add_file(2, "app", MockFile {
        data: b"binary".to_vec(),
        resource: Some(resource.clone()),
        ..Default::default()
    });
    fs.add_file(2, "plain", MockFile { data: b"text".to_vec(), ..Default::default() });

    let out = TempDir::new().unwrap();
    let options = ExtractOptions { resource_forks: true, ..Default::default() };
    let summary = extract(&fs, "/", out.path(), &options).unwrap();

    assert!(summary.failures.is_empty());
    assert_eq!(read(out.path().join("._app")), encode_resource_fork(&resource));
    assert!(!out.path().join("._plain").exists());
}

#[test]
fn test_sidecar_written_even_when_data_fork_fails() {
    let mut fs = MockFs::new();
    fs.add_file(2, "cursed", MockFile {
        data: b"partial".to_vec(),
        resource: Some(b"RSRC".to_vec()),
        broken: true,
    });

    let out = TempDir::new().unwrap();
    let options = ExtractOptions { resource_forks: true, ..Default::default() };
    let summary = extract(&fs, "/", out.path(), &options).unwrap();

    // the data fork failed, but the resource fork still made it out
    assert_eq!(summary.written, 0);
    assert_eq!(summary.failures.len(), 1);
    assert!(summary.failures[0].path.ends_with("cursed"));
    assert_eq!(read(out.path().join("._cursed")), encode_resource_fork(b"RSRC"));
}

#[test]
fn test_sidecar_timestamps_are_restored() {
    let mut fs = MockFs::new();
    let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_234_567_890);
    let metadata = EntryMetadata { modified: Some(stamp), ..Default::default() };
    fs.add_file_with(2, "app", MockFile {
        data: b"binary".to_vec(),
        resource: Some(b"rsrc".to_vec()),
        ..Default::default()
    }, metadata);

    let out = TempDir::new().unwrap();
    let options = ExtractOptions { resource_forks: true, ..Default::default() };
    extract(&fs, "/", out.path(), &options).unwrap();

    let sidecar = std::fs::metadata(out.path().join("._app")).unwrap();
    assert_eq!(sidecar.modified().unwrap(), stamp);
}

#[test]
fn test_pre_epoch_mtime_is_clamped() {
    let mut fs = MockFs::new();
    let metadata = EntryMetadata {
        modified: Some(SystemTime::UNIX_EPOCH - Duration::from_secs(86_400)),
        ..Default::default()
    };
    fs.add_file_with(2, "old", MockFile { data: b"x".to_vec(), ..Default::default() }, metadata);

    let out = TempDir::new().unwrap();
    let summary = extract(&fs, "/", out.path(), &ExtractOptions::default()).unwrap();

    assert_eq!(summary.written, 1);
    assert_eq!(summary.warnings.len(), 1);
    assert!(summary.warnings[0].contains("predates 1970"));
    let written = std::fs::metadata(out.path().join("old")).unwrap();
    assert_eq!(written.modified().unwrap(), SystemTime::UNIX_EPOCH);
}

#[test]
fn test_modern_mtime_is_restored() {
    let mut fs = MockFs::new();
    let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000);
    let metadata = EntryMetadata { modified: Some(stamp), ..Default::default() };
    fs.add_file_with(2, "dated", MockFile { data: b"x".to_vec(), ..Default::default() }, metadata);

    let out = TempDir::new().unwrap();
    extract(&fs, "/", out.path(), &ExtractOptions::default()).unwrap();

    let written = std::fs::metadata(out.path().join("dated")).unwrap();
    assert_eq!(written.modified().unwrap(), stamp);
}

#[test]
fn test_links_are_skipped_inside_folders() {
    let mut fs = MockFs::new();
    fs.add_link(2, "alias");
    fs.add_file(2, "real", MockFile { data: b"data".to_vec(), ..Default::default() });

    let out = TempDir::new().unwrap();
    let summary = extract(&fs, "/", out.path(), &ExtractOptions::default()).unwrap();

    assert_eq!(summary.written, 1);
    assert_eq!(summary.skipped, 1);
    assert!(!out.path().join("alias").exists());
}

#[test]
fn test_link_root_is_an_error() {
    let mut fs = MockFs::new();
    fs.add_link(2, "alias");

    let out = TempDir::new().unwrap();
    let err = extract(&fs, "/alias", out.path(), &ExtractOptions::default()).unwrap_err();
    assert!(matches!(err, ExtractError::NotFileOrFolder(_)));
}

#[test]
fn test_missing_root_is_an_error() {
    let fs = MockFs::new();
    let out = TempDir::new().unwrap();
    let err = extract(&fs, "/nope", out.path(), &ExtractOptions::default()).unwrap_err();
    assert!(matches!(err, ExtractError::PathNotFound(_)));
}

#[test]
fn test_file_root_extracts_single_file() {
    let mut fs = MockFs::new();
    let docs = fs.add_folder(2, "docs");
    fs.add_file(docs, "only.txt", MockFile { data: b"one".to_vec(), ..Default::default() });

    let out = TempDir::new().unwrap();
    let summary =
        extract(&fs, "/docs/only.txt", out.path(), &ExtractOptions::default()).unwrap();

    assert_eq!(summary.written, 1);
    assert_eq!(read(out.path().join("only.txt")), b"one");
}

#[test]
fn test_unflattened_folder_root_gets_its_own_directory() {
    let mut fs = MockFs::new();
    let docs = fs.add_folder(2, "docs");
    fs.add_file(docs, "inner", MockFile { data: b"x".to_vec(), ..Default::default() });

    let out = TempDir::new().unwrap();
    let options = ExtractOptions { flatten_root: false, ..Default::default() };
    extract(&fs, "/docs", out.path(), &options).unwrap();
    assert_eq!(read(out.path().join("docs/inner")), b"x");

    // the volume root never gets a wrapper directory, even unflattened
    let out = TempDir::new().unwrap();
    extract(&fs, "/", out.path(), &options).unwrap();
    assert_eq!(read(out.path().join("docs/inner")), b"x");
}

#[test]
fn test_names_are_sanitized_on_disk() {
    let mut fs = MockFs::new();
    fs.add_file(2, "bell\u{7}name", MockFile { data: b"ding".to_vec(), ..Default::default() });

    let out = TempDir::new().unwrap();
    extract(&fs, "/", out.path(), &ExtractOptions::default()).unwrap();

    assert_eq!(sanitize("bell\u{7}name"), "bell_name");
    assert_eq!(read(out.path().join("bell_name")), b"ding");
}

#[test]
fn test_declared_length_mismatch_is_a_warning() {
    struct Short;
    impl Filesystem for Short {
        fn lookup(&self, _: &str) -> Result<Option<Entry>> {
            Ok(Some(Entry::File(FileEntry {
                name: "short".to_string(),
                id: 1,
                metadata: EntryMetadata::default(),
            })))
        }
        fn list(&self, _: &FolderEntry) -> Result<Vec<Entry>> {
            Ok(Vec::new())
        }
        fn fork(&self, _: &FileEntry, kind: ForkKind) -> Result<Option<Fork>> {
            Ok(match kind {
                // declares 10 bytes, delivers 4
                ForkKind::Data => Some(Fork {
                    length: 10,
                    source: Arc::new(MemSource(b"oops".to_vec())),
                }),
                ForkKind::Resource => None,
            })
        }
    }

    let out = TempDir::new().unwrap();
    let summary = extract(&Short, "/short", out.path(), &ExtractOptions::default()).unwrap();

    assert_eq!(summary.written, 1);
    assert_eq!(summary.warnings.len(), 1);
    assert!(summary.warnings[0].contains("declared 10 bytes"));
    assert_eq!(read(out.path().join("short")), b"oops");
}
