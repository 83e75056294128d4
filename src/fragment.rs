//! Data Fragment support

use deku::prelude::*;
use tracing::trace;

use crate::data::DataSize;
use crate::error::SquashfsError;
use crate::metadata;
use crate::reader::{BlockDevice, DeviceReader};
use crate::superblock::SuperBlock;

/// On-disk size of one fragment table entry
pub(crate) const SIZE: usize = 16;

/// Fragment-index value of an inode without a trailing fragment
pub(crate) const NO_FRAGMENT: u32 = 0xffff_ffff;

/// Fragment entries per fragment-table metadata block
const ENTRIES_PER_BLOCK: u32 = 512;

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct Fragment {
    /// Absolute image byte offset of the fragment block
    pub start: u64,
    /// Same encoding as a data block size field
    pub size: u32,
    pub unused: u32,
}

impl Fragment {
    pub fn data_size(&self) -> DataSize {
        DataSize::new(self.size)
    }
}

/// Resolve `fragment_index` to its table entry.
///
/// The index table at `frag_table` is `ceil(frag_count / 512)` absolute
/// 64-bit offsets, one per metadata block of fragment entries; it is read in
/// full on every lookup, independent of any later table sections.
pub(crate) fn lookup<D: BlockDevice>(
    reader: &mut DeviceReader<'_, D>,
    superblock: &SuperBlock,
    fragment_index: u32,
) -> Result<Fragment, SquashfsError> {
    if fragment_index >= superblock.frag_count {
        return Err(SquashfsError::CorruptImage);
    }

    let block = fragment_index / ENTRIES_PER_BLOCK;
    let offset = fragment_index % ENTRIES_PER_BLOCK;

    let index_count = (superblock.frag_count + ENTRIES_PER_BLOCK - 1) / ENTRIES_PER_BLOCK;
    let index = reader.read_vec(superblock.frag_table, index_count as usize * 8)?;
    let at = block as usize * 8;
    let bytes: [u8; 8] = index
        .get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .ok_or(SquashfsError::CorruptImage)?;
    let block_start = u64::from_le_bytes(bytes);
    trace!(
        "fragment {fragment_index}: block {block} at {:#02x?}, entry {offset}",
        block_start
    );

    let payload = metadata::read_block(reader, superblock.compressor, block_start)?;
    let entry_offset = offset as usize * SIZE;
    let bytes = payload
        .get(entry_offset..entry_offset + SIZE)
        .ok_or(SquashfsError::CorruptImage)?;
    let (_, fragment) = Fragment::from_bytes((bytes, 0))?;
    Ok(fragment)
}
