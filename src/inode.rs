//! Index Node for file or directory
//!
//! The inode table is a packed sequence of variable-length inodes keyed only
//! by position. There is no index: looking a number up walks from offset 0,
//! decoding each inode's fixed part and skipping its variable tail. The
//! per-type footprint lives in one place ([`Inode::read`]) so the walker can
//! never advance past the end of a variant.

use deku::prelude::*;

use crate::data::DataSize;
use crate::error::SquashfsError;
use crate::fragment::NO_FRAGMENT;
use crate::metadata::MetadataTable;

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(type = "u16")]
#[deku(endian = "little")]
#[rustfmt::skip]
pub(crate) enum InodeId {
    BasicDirectory          = 1,
    BasicFile               = 2,
    BasicSymlink            = 3,
    BasicBlockDevice        = 4,
    BasicCharacterDevice    = 5,
    BasicNamedPipe          = 6,
    BasicSocket             = 7,
    ExtendedDirectory       = 8,
    ExtendedFile            = 9,
    ExtendedSymlink         = 10,
    ExtendedBlockDevice     = 11,
    ExtendedCharacterDevice = 12,
    ExtendedNamedPipe       = 13,
    ExtendedSocket          = 14,
}

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct InodeHeader {
    pub permissions: u16,
    pub uid: u16,
    pub gid: u16,
    pub mtime: u32,
    pub inode_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Inode {
    pub id: InodeId,
    pub header: InodeHeader,
    pub inner: InodeInner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InodeInner {
    BasicDirectory(BasicDirectory),
    BasicFile(BasicFile),
    BasicSymlink(BasicSymlink),
    BasicBlockDevice(BasicDeviceSpecialFile),
    BasicCharacterDevice(BasicDeviceSpecialFile),
    BasicNamedPipe(BasicIpc),
    BasicSocket(BasicIpc),
    ExtendedDirectory(ExtendedDirectory),
    ExtendedFile(ExtendedFile),
    ExtendedSymlink(BasicSymlink),
    ExtendedBlockDevice(ExtendedDeviceSpecialFile),
    ExtendedCharacterDevice(ExtendedDeviceSpecialFile),
    ExtendedNamedPipe(ExtendedIpc),
    ExtendedSocket(ExtendedIpc),
}

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct BasicDirectory {
    pub block_index: u32,
    pub link_count: u32,
    pub file_size: u16,
    pub block_offset: u16,
    pub parent_inode: u32,
}

#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct ExtendedDirectory {
    pub link_count: u32,
    pub file_size: u32,
    pub block_index: u32,
    pub parent_inode: u32,
    pub index_count: u16,
    pub block_offset: u16,
    pub xattr_index: u32,
    #[deku(count = "dir_index_count(*index_count)")]
    pub dir_index: Vec<DirectoryIndex>,
}

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct BasicFile {
    pub blocks_start: u32,
    pub frag_index: u32,
    pub block_offset: u32,
    pub file_size: u32,
}

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct ExtendedFile {
    pub blocks_start: u64,
    pub file_size: u64,
    pub sparse: u64,
    pub link_count: u32,
    pub frag_index: u32,
    pub block_offset: u32,
    pub xattr_index: u32,
}

#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct BasicSymlink {
    pub link_count: u32,
    pub target_size: u32,
    #[deku(count = "*target_size as usize")]
    pub target_path: Vec<u8>,
}

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct BasicDeviceSpecialFile {
    pub link_count: u32,
    pub device_number: u32,
}

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct ExtendedDeviceSpecialFile {
    pub link_count: u32,
    pub device_number: u32,
    pub xattr_index: u32,
}

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct BasicIpc {
    pub link_count: u32,
}

#[derive(Debug, DekuRead, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub(crate) struct ExtendedIpc {
    pub link_count: u32,
    pub xattr_index: u32,
}

#[derive(Debug, DekuRead, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub(crate) struct DirectoryIndex {
    pub index: u32,
    pub start: u32,
    pub name_size: u32,
    #[deku(count = "*name_size as usize + 1")]
    pub name: Vec<u8>,
}

/// A directory with indexes stores `index_count + 1` of them; without any,
/// nothing follows the fixed part.
fn dir_index_count(index_count: u16) -> usize {
    if index_count == 0 {
        0
    } else {
        usize::from(index_count) + 1
    }
}

/// Number of data blocks backing a regular file: fragmented files round down
/// (the tail lives in the fragment), whole-block files round up.
pub(crate) fn block_count(block_size: u32, block_log: u16, fragment: u32, file_size: u64) -> u64 {
    if fragment == NO_FRAGMENT {
        (file_size + u64::from(block_size) - 1) >> block_log
    } else {
        file_size >> block_log
    }
}

impl Inode {
    /// Decode the inode at `offset` within the materialized table, returning
    /// it together with its total on-disk length.
    pub(crate) fn read(
        buf: &[u8],
        offset: usize,
        block_size: u32,
        block_log: u16,
    ) -> Result<(Self, usize), SquashfsError> {
        let slice = buf.get(offset..).ok_or(SquashfsError::CorruptImage)?;
        let (_, id) = InodeId::from_bytes((slice, 0))?;
        let (_, header) =
            InodeHeader::from_bytes((slice.get(2..).ok_or(SquashfsError::CorruptImage)?, 0))?;
        let body = slice.get(16..).ok_or(SquashfsError::CorruptImage)?;

        let (inner, len) = match id {
            InodeId::BasicDirectory => {
                let (_, dir) = BasicDirectory::from_bytes((body, 0))?;
                (InodeInner::BasicDirectory(dir), 32)
            }
            InodeId::BasicFile => {
                let (_, file) = BasicFile::from_bytes((body, 0))?;
                let blocks = block_count(
                    block_size,
                    block_log,
                    file.frag_index,
                    u64::from(file.file_size),
                );
                (InodeInner::BasicFile(file), 32 + blocks as usize * 4)
            }
            InodeId::BasicSymlink => {
                let (_, symlink) = BasicSymlink::from_bytes((body, 0))?;
                let len = 24 + symlink.target_path.len();
                (InodeInner::BasicSymlink(symlink), len)
            }
            InodeId::BasicBlockDevice => {
                let (_, dev) = BasicDeviceSpecialFile::from_bytes((body, 0))?;
                (InodeInner::BasicBlockDevice(dev), 24)
            }
            InodeId::BasicCharacterDevice => {
                let (_, dev) = BasicDeviceSpecialFile::from_bytes((body, 0))?;
                (InodeInner::BasicCharacterDevice(dev), 24)
            }
            InodeId::BasicNamedPipe => {
                let (_, ipc) = BasicIpc::from_bytes((body, 0))?;
                (InodeInner::BasicNamedPipe(ipc), 20)
            }
            InodeId::BasicSocket => {
                let (_, ipc) = BasicIpc::from_bytes((body, 0))?;
                (InodeInner::BasicSocket(ipc), 20)
            }
            InodeId::ExtendedDirectory => {
                let (_, dir) = ExtendedDirectory::from_bytes((body, 0))?;
                let indexes: usize = dir.dir_index.iter().map(|i| 12 + i.name.len()).sum();
                (InodeInner::ExtendedDirectory(dir), 40 + indexes)
            }
            InodeId::ExtendedFile => {
                let (_, file) = ExtendedFile::from_bytes((body, 0))?;
                let blocks = block_count(block_size, block_log, file.frag_index, file.file_size);
                (InodeInner::ExtendedFile(file), 56 + blocks as usize * 4)
            }
            InodeId::ExtendedSymlink => {
                let (_, symlink) = BasicSymlink::from_bytes((body, 0))?;
                let len = 24 + symlink.target_path.len();
                (InodeInner::ExtendedSymlink(symlink), len)
            }
            InodeId::ExtendedBlockDevice => {
                let (_, dev) = ExtendedDeviceSpecialFile::from_bytes((body, 0))?;
                (InodeInner::ExtendedBlockDevice(dev), 28)
            }
            InodeId::ExtendedCharacterDevice => {
                let (_, dev) = ExtendedDeviceSpecialFile::from_bytes((body, 0))?;
                (InodeInner::ExtendedCharacterDevice(dev), 28)
            }
            InodeId::ExtendedNamedPipe => {
                let (_, ipc) = ExtendedIpc::from_bytes((body, 0))?;
                (InodeInner::ExtendedNamedPipe(ipc), 24)
            }
            InodeId::ExtendedSocket => {
                let (_, ipc) = ExtendedIpc::from_bytes((body, 0))?;
                (InodeInner::ExtendedSocket(ipc), 24)
            }
        };

        Ok((Self { id, header, inner }, len))
    }
}

/// The materialized inode table plus the superblock state its walk depends on.
pub(crate) struct InodeTable {
    pub(crate) decoded: Vec<u8>,
    inode_count: u32,
    block_size: u32,
    block_log: u16,
}

impl InodeTable {
    pub fn new(table: MetadataTable, inode_count: u32, block_size: u32, block_log: u16) -> Self {
        Self {
            decoded: table.decoded,
            inode_count,
            block_size,
            block_log,
        }
    }

    /// Find inode `number`, walking the packed table from offset 0.
    ///
    /// Running past `inode_count` iterations or past the buffer means the
    /// image is inconsistent: every number reachable from a directory entry
    /// must decode somewhere in the table.
    pub fn inode(&self, number: u32) -> Result<(usize, Inode), SquashfsError> {
        let mut offset = 0;
        for _ in 0..self.inode_count {
            if offset >= self.decoded.len() {
                return Err(SquashfsError::CorruptImage);
            }
            let (inode, len) =
                Inode::read(&self.decoded, offset, self.block_size, self.block_log)
                    .map_err(|_| SquashfsError::CorruptImage)?;
            if inode.header.inode_number == number {
                return Ok((offset, inode));
            }
            offset += len;
        }
        Err(SquashfsError::CorruptImage)
    }

    /// Copy a regular file's per-block size list out of the table.
    pub fn block_sizes(
        &self,
        sizes_offset: usize,
        count: u64,
    ) -> Result<Vec<DataSize>, SquashfsError> {
        let len = usize::try_from(count)
            .ok()
            .and_then(|c| c.checked_mul(4))
            .ok_or(SquashfsError::CorruptImage)?;
        let end = sizes_offset
            .checked_add(len)
            .ok_or(SquashfsError::CorruptImage)?;
        let raw = self
            .decoded
            .get(sizes_offset..end)
            .ok_or(SquashfsError::CorruptImage)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| DataSize::new(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect())
    }
}
