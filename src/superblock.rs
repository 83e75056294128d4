//! Superblock and its validation

use deku::prelude::*;

use crate::compressor::Compressor;
use crate::error::SquashfsError;

/// `hsqs` on disk
pub(crate) const MAGIC: u32 = 0x7371_7368;

/// 4KiB
pub const MIN_BLOCK_SIZE: u32 = 0x1000;

/// 1MiB
pub const MAX_BLOCK_SIZE: u32 = 0x10_0000;

/// Value of a table-offset field whose table is not present
pub(crate) const NOT_SET: u64 = 0xffff_ffff_ffff_ffff;

/// Contains important information about the archive, including the locations of other sections
#[derive(Debug, Copy, Clone, DekuRead, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct SuperBlock {
    /// Must be set to 0x73717368 ("hsqs" on disk).
    pub magic: u32,
    /// The number of inodes stored in the archive.
    pub inode_count: u32,
    /// Last modification time of the archive, seconds since the epoch.
    pub mod_time: u32,
    /// The size of a data block in bytes. Must be a power of two between 4096 and 1048576.
    pub block_size: u32,
    /// The number of entries in the fragment table.
    pub frag_count: u32,
    /// Compressor used for data
    pub compressor: Compressor,
    /// The log2 of the block size. If the two fields do not agree, the archive is considered corrupted.
    pub block_log: u16,
    /// Bit wise OR of the flag bits. The read path never consults these:
    /// whether any given block is compressed is encoded in that block's own
    /// header or size field.
    pub flags: u16,
    /// The number of entries in the ID lookup table.
    pub id_count: u16,
    /// Major version of the format. Must be set to 4.
    pub version_major: u16,
    /// Minor version of the format. Must be set to 0.
    pub version_minor: u16,
    /// A reference to the inode of the root directory.
    pub root_inode: u64,
    /// The number of bytes used by the archive.
    pub bytes_used: u64,
    pub id_table: u64,
    pub xattr_table: u64,
    pub inode_table: u64,
    pub dir_table: u64,
    pub frag_table: u64,
    pub export_table: u64,
}

impl SuperBlock {
    /// Format-consistency checks beyond the magic, run once at probe time.
    pub(crate) fn validate(&self) -> Result<(), SquashfsError> {
        if self.version_major != 4 || self.version_minor != 0 {
            return Err(SquashfsError::CorruptImage);
        }

        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
            || !self.block_size.is_power_of_two()
        {
            return Err(SquashfsError::CorruptImage);
        }
        if self.block_log >= 32 || 1u32 << self.block_log != self.block_size {
            return Err(SquashfsError::CorruptImage);
        }

        // Tables appear on disk in the order inode, directory, fragment,
        // export, id; fields of absent tables hold NOT_SET.
        if self.inode_table >= self.dir_table {
            return Err(SquashfsError::CorruptImage);
        }
        let mut prev = self.dir_table;
        for table in [self.frag_table, self.export_table, self.id_table] {
            if table == NOT_SET {
                continue;
            }
            if table < prev {
                return Err(SquashfsError::CorruptImage);
            }
            prev = table;
        }

        Ok(())
    }
}
