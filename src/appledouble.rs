//! AppleSingle/AppleDouble container encoding.
//!
//! When the destination filesystem cannot store dual-stream files, the
//! resource fork travels in a sidecar file next to the data fork.  The
//! sidecar is an AppleDouble version 2 container: a fixed big-endian
//! header, a table of entry descriptors, then the entry payloads.  The
//! encoder is a pure function of its inputs -- the same fork bytes and
//! metadata always produce byte-identical output.

use zerocopy::{
    big_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

/// Magic number of an AppleSingle file (data and resource fork in one
/// container).
pub const APPLESINGLE_MAGIC: u32 = 0x0005_1600;
/// Magic number of an AppleDouble file (resource fork sidecar).
pub const APPLEDOUBLE_MAGIC: u32 = 0x0005_1607;

const VERSION_2: u32 = 0x0002_0000;

/// Entry id of the data fork.
pub const ENTRY_DATA_FORK: u32 = 1;
/// Entry id of the resource fork.
pub const ENTRY_RESOURCE_FORK: u32 = 2;

#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct FileHeader {
    magic: U32,
    version: U32,
    filesystem: [u8; 16],
    num_entries: U16,
}

#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct EntryDescriptor {
    entry_id: U32,
    offset: U32,
    length: U32,
}

/// Which container flavor to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Self-contained: carries the data fork too.
    AppleSingle,
    /// Sidecar: the data fork lives in the ordinary neighboring file.
    AppleDouble,
}

impl ContainerKind {
    fn magic(self) -> u32 {
        match self {
            ContainerKind::AppleSingle => APPLESINGLE_MAGIC,
            ContainerKind::AppleDouble => APPLEDOUBLE_MAGIC,
        }
    }
}

/// The home filesystem tag recorded in the header's filler field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemTag {
    /// "Mac OS X", space-padded, as modern encoders write it.
    MacOsX,
}

impl FilesystemTag {
    fn as_field(self) -> [u8; 16] {
        let mut field = [b' '; 16];
        let name: &[u8] = match self {
            FilesystemTag::MacOsX => b"Mac OS X",
        };
        field[..name.len()].copy_from_slice(name);
        field
    }
}

/// Assembles an AppleSingle/AppleDouble container from fork payloads.
///
/// Entries are written in the order they were added.
pub struct AppleDoubleBuilder {
    kind: ContainerKind,
    tag: FilesystemTag,
    entries: Vec<(u32, Vec<u8>)>,
}

impl AppleDoubleBuilder {
    /// A builder for the given container flavor and filesystem tag.
    pub fn new(kind: ContainerKind, tag: FilesystemTag) -> Self {
        Self {
            kind,
            tag,
            entries: Vec::new(),
        }
    }

    /// Adds the data fork entry (AppleSingle containers).
    pub fn add_data_fork(&mut self, data: Vec<u8>) -> &mut Self {
        self.entries.push((ENTRY_DATA_FORK, data));
        self
    }

    /// Adds the resource fork entry.
    pub fn add_resource_fork(&mut self, data: Vec<u8>) -> &mut Self {
        self.entries.push((ENTRY_RESOURCE_FORK, data));
        self
    }

    /// Serializes the container.
    pub fn build(&self) -> Vec<u8> {
        let header_size = size_of::<FileHeader>() + self.entries.len() * size_of::<EntryDescriptor>();
        let total = header_size + self.entries.iter().map(|(_, d)| d.len()).sum::<usize>();
        let mut out = Vec::with_capacity(total);

        let header = FileHeader {
            magic: self.kind.magic().into(),
            version: VERSION_2.into(),
            filesystem: self.tag.as_field(),
            num_entries: (self.entries.len() as u16).into(),
        };
        out.extend_from_slice(header.as_bytes());

        let mut payload_offset = header_size as u32;
        for (entry_id, data) in &self.entries {
            let descriptor = EntryDescriptor {
                entry_id: (*entry_id).into(),
                offset: payload_offset.into(),
                length: (data.len() as u32).into(),
            };
            out.extend_from_slice(descriptor.as_bytes());
            payload_offset += data.len() as u32;
        }

        for (_, data) in &self.entries {
            out.extend_from_slice(data);
        }

        out
    }
}

/// Encodes a resource fork into the sidecar container the extraction
/// engine writes next to the data file.
pub fn encode_resource_fork(resource: &[u8]) -> Vec<u8> {
    let mut builder = AppleDoubleBuilder::new(ContainerKind::AppleDouble, FilesystemTag::MacOsX);
    builder.add_resource_fork(resource.to_vec());
    builder.build()
}
