//! Apple Partition Map parsing.
//!
//! The classic Apple scheme: an optional driver descriptor record in
//! block 0 ("ER"), then one 512-byte partition map entry per partition
//! starting at block 1, each carrying the "PM" signature, the partition's
//! physical extent in blocks, a name and a type string.  The map counts
//! itself as a partition (`Apple_partition_map`).

use anyhow::{Context, Result};
use log::warn;
use zerocopy::{
    big_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::{
    detect::{PartitionDescriptor, PartitionKind, PartitionSchemeProber},
    source::ByteSource,
};

const DDR_SIGNATURE: [u8; 2] = *b"ER";
const ENTRY_SIGNATURE: [u8; 2] = *b"PM";

/// Block size assumed when no driver descriptor record is present.
const DEFAULT_BLOCK_SIZE: u64 = 512;

/// Leading fields of the block-0 driver descriptor record.
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct DriverDescriptorRecord {
    signature: [u8; 2],
    block_size: U16,
    block_count: U32,
}

/// Leading fields of one partition map entry.  The trailing driver and
/// boot fields are not interpreted.
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct PartitionMapEntry {
    signature: [u8; 2],
    signature_pad: U16,
    map_block_count: U32,
    physical_start: U32,
    physical_count: U32,
    name: [u8; 32],
    kind: [u8; 32],
}

/// Interprets a NUL-padded fixed-size name field.
fn fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn partition_kind(type_name: &str) -> PartitionKind {
    match type_name {
        "Apple_HFS" => PartitionKind::HfsContainer,
        "Apple_HFSX" => PartitionKind::Hfsx,
        _ => PartitionKind::Other,
    }
}

fn read_entry(source: &dyn ByteSource, offset: u64) -> Result<PartitionMapEntry> {
    let mut block = [0u8; 512];
    source
        .read_exact_at(offset, &mut block)
        .context("reading partition map block")?;
    let entry = PartitionMapEntry::read_from_prefix(&block)
        .map(|(entry, _rest)| entry)
        .expect("partition map entry fits in a block");
    Ok(entry)
}

/// Detects and enumerates Apple Partition Map layouts.
pub struct ApmProber;

impl PartitionSchemeProber for ApmProber {
    fn name(&self) -> &'static str {
        "Apple Partition Map"
    }

    fn probe(&self, source: &dyn ByteSource) -> Result<Option<Vec<PartitionDescriptor>>> {
        // Need at least the descriptor block and the first map entry.
        if source.len() < 2 * DEFAULT_BLOCK_SIZE + 512 {
            return Ok(None);
        }

        let mut block0 = [0u8; 8];
        source.read_exact_at(0, &mut block0)?;
        let ddr = DriverDescriptorRecord::read_from_prefix(&block0)
            .map(|(ddr, _rest)| ddr)
            .expect("descriptor prefix fits in 8 bytes");
        let block_size = if ddr.signature == DDR_SIGNATURE {
            u64::from(ddr.block_size.get()).max(DEFAULT_BLOCK_SIZE)
        } else {
            DEFAULT_BLOCK_SIZE
        };

        let first = read_entry(source, block_size)?;
        if first.signature != ENTRY_SIGNATURE {
            return Ok(None);
        }

        let count = first.map_block_count.get() as usize;
        let mut partitions = Vec::with_capacity(count);
        for index in 0..count {
            let entry = match read_entry(source, block_size * (1 + index as u64)) {
                Ok(entry) => entry,
                // a corrupt map count can point past the image
                Err(err) => {
                    warn!("partition map entry {index} is unreadable ({err:#}); stopping enumeration");
                    break;
                }
            };
            if entry.signature != ENTRY_SIGNATURE {
                warn!("partition map entry {index} has a bad signature; stopping enumeration");
                break;
            }

            let start_offset = u64::from(entry.physical_start.get()) * block_size;
            let length = u64::from(entry.physical_count.get()) * block_size;
            let type_name = fixed_str(&entry.kind);
            if start_offset + length > source.len() {
                warn!(
                    "partition {index} ({type_name}) extends past the end of the image; skipping"
                );
                continue;
            }

            partitions.push(PartitionDescriptor {
                index,
                kind: partition_kind(&type_name),
                start_offset,
                length,
                name: fixed_str(&entry.name),
            });
        }

        Ok(Some(partitions))
    }
}
