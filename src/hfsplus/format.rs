//! HFS+ on-disk format definitions.
//!
//! Binary layouts for the structures the reader needs: the volume
//! header, fork extent records and catalog B-tree nodes, defined with
//! zerocopy over explicit big-endian integers.  Field layout follows
//! Apple Technote 1150.

use std::time::{Duration, SystemTime};

use zerocopy::{
    big_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

/// Volume header signature of an HFS+ volume (`H+`).
pub const HFSPLUS_SIGNATURE: [u8; 2] = *b"H+";
/// Volume header signature of a case-sensitive HFSX volume (`HX`).
pub const HFSX_SIGNATURE: [u8; 2] = *b"HX";
/// Master directory block signature of a classic HFS volume (`BD`).
pub const HFS_SIGNATURE: [u8; 2] = *b"BD";

/// The volume header lives at this fixed byte offset, after the two
/// reserved boot blocks.
pub const VOLUME_HEADER_OFFSET: u64 = 1024;

/// Catalog node id of the root folder.
pub const ROOT_FOLDER_CNID: u32 = 2;
/// Catalog node id owning the root folder's record (the "parent of the
/// root").
pub const ROOT_PARENT_CNID: u32 = 1;

/// One contiguous run of allocation blocks.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExtentDescriptor {
    pub start_block: U32,
    pub block_count: U32,
}

/// Size and placement of one fork.  Only the eight in-record extents are
/// described here; further fragments live in the extents overflow file.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ForkData {
    pub logical_size: U64,
    pub clump_size: U32,
    pub total_blocks: U32,
    pub extents: [ExtentDescriptor; 8],
}

/// The HFS+ volume header (512 bytes at offset 1024).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct VolumeHeader {
    pub signature: [u8; 2],
    pub version: U16,
    pub attributes: U32,
    pub last_mounted_version: U32,
    pub journal_info_block: U32,

    pub create_date: U32,
    pub modify_date: U32,
    pub backup_date: U32,
    pub checked_date: U32,

    pub file_count: U32,
    pub folder_count: U32,

    pub block_size: U32,
    pub total_blocks: U32,
    pub free_blocks: U32,

    pub next_allocation: U32,
    pub rsrc_clump_size: U32,
    pub data_clump_size: U32,
    pub next_catalog_id: U32,

    pub write_count: U32,
    pub encodings_bitmap: U64,

    pub finder_info: [U32; 8],

    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
}

/* B-tree structures */

pub const NODE_KIND_LEAF: i8 = -1;
pub const NODE_KIND_INDEX: i8 = 0;
pub const NODE_KIND_HEADER: i8 = 1;

/// Descriptor at the start of every B-tree node.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct NodeDescriptor {
    pub forward_link: U32,
    pub backward_link: U32,
    pub kind: i8,
    pub height: u8,
    pub num_records: U16,
    pub reserved: U16,
}

/// Header record of a B-tree, directly after the descriptor of node 0.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HeaderRecord {
    pub tree_depth: U16,
    pub root_node: U32,
    pub leaf_records: U32,
    pub first_leaf_node: U32,
    pub last_leaf_node: U32,
    pub node_size: U16,
    pub max_key_length: U16,
    pub total_nodes: U32,
    pub free_nodes: U32,
}

/* Catalog records */

/// Fixed-width prefix of a catalog key: total key length (excluding the
/// length field itself), parent folder id and the length in UTF-16 code
/// units of the name that follows.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CatalogKeyHeader {
    pub key_length: U16,
    pub parent_id: U32,
    pub name_length: U16,
}

pub const RECORD_TYPE_FOLDER: u16 = 1;
pub const RECORD_TYPE_FILE: u16 = 2;
pub const RECORD_TYPE_FOLDER_THREAD: u16 = 3;
pub const RECORD_TYPE_FILE_THREAD: u16 = 4;

/// POSIX-ish permissions block embedded in catalog records.  Carried but
/// not interpreted by the reader.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BsdInfo {
    pub owner_id: U32,
    pub group_id: U32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: U16,
    pub special: U32,
}

/// Finder metadata of a file.  The type/creator pair distinguishes
/// symlinks and hardlinks from plain files.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FileInfo {
    pub file_type: [u8; 4],
    pub file_creator: [u8; 4],
    pub finder_flags: U16,
    pub location: [u8; 4],
    pub reserved: U16,
}

/// Finder type of a symbolic link.
pub const FILE_TYPE_SYMLINK: [u8; 4] = *b"slnk";
/// Finder type of an indirect-node hardlink reference.
pub const FILE_TYPE_HARDLINK: [u8; 4] = *b"hlnk";

/// Catalog data record for a folder.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CatalogFolder {
    pub record_type: U16,
    pub flags: U16,
    pub valence: U32,
    pub folder_id: U32,
    pub create_date: U32,
    pub content_mod_date: U32,
    pub attribute_mod_date: U32,
    pub access_date: U32,
    pub backup_date: U32,
    pub permissions: BsdInfo,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: U32,
    pub reserved: U32,
}

/// Catalog data record for a file.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CatalogFile {
    pub record_type: U16,
    pub flags: U16,
    pub reserved1: U32,
    pub file_id: U32,
    pub create_date: U32,
    pub content_mod_date: U32,
    pub attribute_mod_date: U32,
    pub access_date: U32,
    pub backup_date: U32,
    pub permissions: BsdInfo,
    pub user_info: FileInfo,
    pub finder_info: [u8; 16],
    pub text_encoding: U32,
    pub reserved2: U32,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
}

/// Seconds between the HFS epoch (1904-01-01T00:00:00Z) and the Unix
/// epoch.
const MAC_EPOCH_OFFSET: i64 = 2_082_844_800;

/// Converts an HFS+ date to a `SystemTime`.
///
/// HFS+ stores seconds since 1904 as an unsigned 32-bit value and uses 0
/// for "not set", which maps to `None`.  Dates between 1904 and 1970
/// come out as pre-epoch `SystemTime`s.
pub fn mac_date_to_system_time(seconds: u32) -> Option<SystemTime> {
    if seconds == 0 {
        return None;
    }
    let unix = i64::from(seconds) - MAC_EPOCH_OFFSET;
    Some(if unix >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(unix as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(unix.unsigned_abs())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<ExtentDescriptor>(), 8);
        assert_eq!(size_of::<ForkData>(), 80);
        assert_eq!(size_of::<VolumeHeader>(), 512);
        assert_eq!(size_of::<NodeDescriptor>(), 14);
        assert_eq!(size_of::<CatalogKeyHeader>(), 8);
        assert_eq!(size_of::<BsdInfo>(), 16);
        assert_eq!(size_of::<FileInfo>(), 16);
        assert_eq!(size_of::<CatalogFolder>(), 88);
        assert_eq!(size_of::<CatalogFile>(), 248);
    }

    #[test]
    fn test_mac_dates() {
        assert_eq!(mac_date_to_system_time(0), None);
        assert_eq!(
            mac_date_to_system_time(2_082_844_800),
            Some(SystemTime::UNIX_EPOCH)
        );
        assert_eq!(
            mac_date_to_system_time(2_082_844_800 + 86_400),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(86_400))
        );
        // a date in 1950 lands before the Unix epoch
        let before = mac_date_to_system_time(1_500_000_000).unwrap();
        assert!(before < SystemTime::UNIX_EPOCH);
    }
}
