//! Read-only HFS+ and HFSX volume access.
//!
//! This is deliberately a small reader, not a full implementation of the
//! format: it loads the catalog B-tree's leaf chain into memory once at
//! mount time and serves lookups and listings from that index.  Fork
//! contents are read lazily through extent-stitched views over the
//! volume source.  The extents overflow file, attributes and hardlink
//! resolution are out of scope; a fork fragmented beyond its eight
//! in-record extents is reported as an error when opened.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::{bail, ensure, Context, Result};
use log::debug;
use zerocopy::FromBytes;

use crate::{
    detect::FilesystemKind,
    source::{ByteSource, SourceError},
    tree::{Entry, EntryMetadata, FileEntry, FolderEntry, Fork, ForkKind, LinkEntry},
};

pub mod format;

use format::{
    mac_date_to_system_time, CatalogFile, CatalogFolder, CatalogKeyHeader, ForkData,
    HeaderRecord, NodeDescriptor, VolumeHeader, FILE_TYPE_SYMLINK, HFSPLUS_SIGNATURE,
    HFSX_SIGNATURE, NODE_KIND_HEADER, NODE_KIND_LEAF, RECORD_TYPE_FILE, RECORD_TYPE_FILE_THREAD,
    RECORD_TYPE_FOLDER, RECORD_TYPE_FOLDER_THREAD, ROOT_FOLDER_CNID, ROOT_PARENT_CNID,
    VOLUME_HEADER_OFFSET,
};

/// Reads one fixed-size structure from `source` at `offset`.
fn read_struct<T: FromBytes>(source: &dyn ByteSource, offset: u64) -> Result<T, SourceError> {
    let mut buf = vec![0u8; size_of::<T>()];
    source.read_exact_at(offset, &mut buf)?;
    // the buffer is exactly sized, so this cannot fail
    Ok(T::read_from_bytes(&buf).unwrap())
}

/// One contiguous byte run of a fork, located on the volume.
struct Segment {
    volume_offset: u64,
    length: u64,
}

/// A fork's logical byte stream, stitched together from its extents.
struct ForkSource {
    volume: Arc<dyn ByteSource>,
    length: u64,
    segments: Vec<Segment>,
}

impl ByteSource for ForkSource {
    fn len(&self) -> u64 {
        self.length
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        if offset >= self.length || buf.is_empty() {
            return Ok(0);
        }
        let mut logical = 0;
        for segment in &self.segments {
            if offset < logical + segment.length {
                let within = offset - logical;
                // stop at the segment boundary and at the logical size,
                // whichever comes first
                let available = (segment.length - within).min(self.length - offset);
                let want = buf
                    .len()
                    .min(available.try_into().unwrap_or(usize::MAX));
                return self
                    .volume
                    .read_at(segment.volume_offset + within, &mut buf[..want]);
            }
            logical += segment.length;
        }
        Ok(0)
    }
}

/// Builds the extent-stitched view of one fork.
fn fork_source(
    volume: &Arc<dyn ByteSource>,
    block_size: u64,
    fork: &ForkData,
) -> Result<Arc<dyn ByteSource>> {
    let length = fork.logical_size.get();
    let mut segments = Vec::new();
    let mut mapped = 0;
    for extent in &fork.extents {
        let blocks = u64::from(extent.block_count.get());
        if blocks == 0 {
            break;
        }
        segments.push(Segment {
            volume_offset: u64::from(extent.start_block.get()) * block_size,
            length: blocks * block_size,
        });
        mapped += blocks * block_size;
    }
    ensure!(
        mapped >= length,
        "fork spills into the extents overflow file ({mapped} of {length} bytes mapped), \
         which this reader does not support"
    );
    Ok(Arc::new(ForkSource {
        volume: Arc::clone(volume),
        length,
        segments,
    }))
}

/// A mounted HFS+ or HFSX volume.
///
/// Opening walks the catalog once and indexes every entry by its parent
/// folder id; all [`Filesystem`](crate::tree::Filesystem) operations are
/// then answered without touching the catalog again.
pub struct HfsVolume {
    source: Arc<dyn ByteSource>,
    block_size: u64,
    root: FolderEntry,
    children: BTreeMap<u32, Vec<Entry>>,
    forks: HashMap<u64, (ForkData, ForkData)>,
}

impl HfsVolume {
    /// Mounts the volume found at the start of `source`.
    ///
    /// `kind` is the detected filesystem type; classic HFS is rejected
    /// here since only the HFS+ family is readable.
    pub fn open(source: Arc<dyn ByteSource>, kind: FilesystemKind) -> Result<Self> {
        let expected = match kind {
            FilesystemKind::Hfs => {
                bail!("classic HFS volumes are recognized but cannot be read; only HFS+ and HFSX are supported")
            }
            FilesystemKind::HfsPlus => HFSPLUS_SIGNATURE,
            FilesystemKind::Hfsx => HFSX_SIGNATURE,
        };

        let header: VolumeHeader = read_struct(&*source, VOLUME_HEADER_OFFSET)
            .context("reading volume header")?;
        ensure!(
            header.signature == expected,
            "volume header signature {:?} does not match detected filesystem {kind}",
            header.signature
        );
        let block_size = u64::from(header.block_size.get());
        ensure!(
            block_size >= 512 && block_size.is_power_of_two(),
            "implausible allocation block size {block_size}"
        );

        let mut volume = Self {
            source: Arc::clone(&source),
            block_size,
            root: FolderEntry {
                name: "/".to_string(),
                id: u64::from(ROOT_FOLDER_CNID),
                metadata: EntryMetadata::default(),
            },
            children: BTreeMap::new(),
            forks: HashMap::new(),
        };

        let catalog = fork_source(&source, block_size, &header.catalog_file)
            .context("opening catalog file")?;
        volume
            .load_catalog(&catalog)
            .context("reading catalog B-tree")?;
        Ok(volume)
    }

    /// Walks the catalog leaf chain and populates the in-memory index.
    fn load_catalog(&mut self, catalog: &Arc<dyn ByteSource>) -> Result<()> {
        let descriptor: NodeDescriptor = read_struct(&**catalog, 0)?;
        ensure!(
            descriptor.kind == NODE_KIND_HEADER,
            "catalog does not start with a header node (kind {})",
            descriptor.kind
        );
        let header: HeaderRecord =
            read_struct(&**catalog, size_of::<NodeDescriptor>() as u64)?;
        let node_size = usize::from(header.node_size.get());
        ensure!(
            node_size >= 512 && node_size.is_power_of_two(),
            "implausible catalog node size {node_size}"
        );

        let mut node = vec![0u8; node_size];
        let mut node_index = header.first_leaf_node.get();
        let mut visited = 0u32;
        while node_index != 0 {
            ensure!(
                visited < header.total_nodes.get(),
                "catalog leaf chain does not terminate"
            );
            visited += 1;

            catalog.read_exact_at(u64::from(node_index) * node_size as u64, &mut node)?;
            let (descriptor, _) = NodeDescriptor::read_from_prefix(node.as_slice())
                .ok()
                .context("truncated node descriptor")?;
            ensure!(
                descriptor.kind == NODE_KIND_LEAF,
                "node {node_index} on the leaf chain has kind {}",
                descriptor.kind
            );

            for i in 0..usize::from(descriptor.num_records.get()) {
                let slot = node_size - 2 * (i + 1);
                let offset =
                    usize::from(u16::from_be_bytes([node[slot], node[slot + 1]]));
                ensure!(
                    (size_of::<NodeDescriptor>()..node_size).contains(&offset),
                    "record {i} of node {node_index} has offset {offset} outside the node"
                );
                self.load_record(&node[offset..slot])
                    .with_context(|| format!("record {i} of node {node_index}"))?;
            }

            node_index = descriptor.forward_link.get();
        }
        Ok(())
    }

    /// Parses one leaf record and files it under its parent folder.
    fn load_record(&mut self, record: &[u8]) -> Result<()> {
        let (key, _) = CatalogKeyHeader::read_from_prefix(record)
            .ok()
            .context("truncated catalog key")?;
        let name_length = usize::from(key.name_length.get());
        let name_bytes = record
            .get(size_of::<CatalogKeyHeader>()..size_of::<CatalogKeyHeader>() + 2 * name_length)
            .context("catalog key name overruns the record")?;
        let name = String::from_utf16_lossy(
            &name_bytes
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect::<Vec<_>>(),
        );

        // the key length does not count its own length field
        let mut data_offset = 2 + usize::from(key.key_length.get());
        data_offset += data_offset & 1;
        let data = record
            .get(data_offset..)
            .context("catalog record has no data")?;
        ensure!(data.len() >= 2, "catalog record data is truncated");

        let parent = key.parent_id.get();
        match u16::from_be_bytes([data[0], data[1]]) {
            RECORD_TYPE_FOLDER => {
                let (folder, _) = CatalogFolder::read_from_prefix(data)
                    .ok()
                    .context("truncated folder record")?;
                let entry = FolderEntry {
                    name,
                    id: u64::from(folder.folder_id.get()),
                    metadata: metadata_of(
                        folder.create_date.get(),
                        folder.access_date.get(),
                        folder.content_mod_date.get(),
                    ),
                };
                if parent == ROOT_PARENT_CNID && folder.folder_id.get() == ROOT_FOLDER_CNID {
                    debug!("mounting volume {:?}", entry.name);
                    self.root.metadata = entry.metadata;
                } else {
                    self.children.entry(parent).or_default().push(Entry::Folder(entry));
                }
            }
            RECORD_TYPE_FILE => {
                let (file, _) = CatalogFile::read_from_prefix(data)
                    .ok()
                    .context("truncated file record")?;
                let id = u64::from(file.file_id.get());
                let metadata = metadata_of(
                    file.create_date.get(),
                    file.access_date.get(),
                    file.content_mod_date.get(),
                );
                let entry = if file.user_info.file_type == FILE_TYPE_SYMLINK {
                    Entry::Link(LinkEntry { name, id, metadata })
                } else {
                    self.forks.insert(id, (file.data_fork, file.resource_fork));
                    Entry::File(FileEntry { name, id, metadata })
                };
                self.children.entry(parent).or_default().push(entry);
            }
            RECORD_TYPE_FOLDER_THREAD | RECORD_TYPE_FILE_THREAD => {}
            other => bail!("unknown catalog record type {other}"),
        }
        Ok(())
    }
}

fn metadata_of(created: u32, accessed: u32, modified: u32) -> EntryMetadata {
    EntryMetadata {
        created: mac_date_to_system_time(created),
        accessed: mac_date_to_system_time(accessed),
        modified: mac_date_to_system_time(modified),
    }
}

impl crate::tree::Filesystem for HfsVolume {
    fn lookup(&self, path: &str) -> Result<Option<Entry>> {
        let mut current = Entry::Folder(self.root.clone());
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let Entry::Folder(folder) = &current else {
                return Ok(None);
            };
            let children = self.children.get(&(folder.id as u32));
            // name comparison is byte-exact, like HFSX
            match children.and_then(|c| c.iter().find(|e| e.name() == component)) {
                Some(entry) => current = entry.clone(),
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn list(&self, folder: &FolderEntry) -> Result<Vec<Entry>> {
        Ok(self
            .children
            .get(&(folder.id as u32))
            .cloned()
            .unwrap_or_default())
    }

    fn fork(&self, file: &FileEntry, kind: ForkKind) -> Result<Option<Fork>> {
        let Some((data, resource)) = self.forks.get(&file.id) else {
            bail!("no catalog record for file id {}", file.id);
        };
        let fork = match kind {
            ForkKind::Data => data,
            // an absent resource fork is represented as zero-length
            ForkKind::Resource if resource.logical_size.get() == 0 => return Ok(None),
            ForkKind::Resource => resource,
        };
        Ok(Some(Fork {
            length: fork.logical_size.get(),
            source: fork_source(&self.source, self.block_size, fork)?,
        }))
    }
}

impl std::fmt::Debug for HfsVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfsVolume")
            .field("block_size", &self.block_size)
            .field("folders", &self.children.len())
            .field("files", &self.forks.len())
            .finish()
    }
}
