//! Module containing [`Squashfs`], the mount over a block device
//!
//! A mount owns the device handle and the decoded superblock, nothing else.
//! Each operation materializes the metadata tables it needs, resolves its
//! path against them, and releases everything on return; `open_dir` instead
//! hands the materialized tables to the returned [`DirStream`].

use deku::prelude::*;
use tracing::{debug, instrument, trace};

use crate::compressor::decompress;
use crate::dir::{entry_inode_number, DirCursor, DirStream, DIR_EMPTY_FILE_SIZE};
use crate::error::SquashfsError;
use crate::fragment::{self, NO_FRAGMENT};
use crate::inode::{block_count, Inode, InodeInner, InodeTable};
use crate::metadata::MetadataTable;
use crate::reader::{BlockDevice, DeviceReader};
use crate::superblock::{SuperBlock, MAGIC, NOT_SET};

const SUPERBLOCK_SIZE: usize = 96;

/// A read-only squashfs mount.
pub struct Squashfs<D: BlockDevice> {
    device: D,
    /// Partition start, in sectors
    part_start: u64,
    superblock: SuperBlock,
}

/// The two metadata tables every lookup walks.
struct Tables {
    inodes: InodeTable,
    dirs: MetadataTable,
}

impl<D: BlockDevice> Squashfs<D> {
    /// Read and validate the superblock at the start of `part_start`.
    ///
    /// A magic mismatch is [`SquashfsError::BadMagic`]; any other
    /// inconsistency in the superblock is [`SquashfsError::CorruptImage`].
    #[instrument(skip_all)]
    pub fn probe(mut device: D, part_start: u64) -> Result<Self, SquashfsError> {
        let mut reader = DeviceReader::new(&mut device, part_start);
        let raw = reader.read_vec(0, SUPERBLOCK_SIZE)?;

        let magic = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if magic != MAGIC {
            return Err(SquashfsError::BadMagic);
        }

        let (_, superblock) = SuperBlock::from_bytes((&raw, 0))?;
        superblock.validate()?;
        trace!("{superblock:#08x?}");

        Ok(Self {
            device,
            part_start,
            superblock,
        })
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.superblock
    }

    /// Hand the device back to the host. The mount holds no other resources.
    pub fn into_device(self) -> D {
        self.device
    }

    /// Open the directory at `path`, positioned at its first entry.
    ///
    /// The returned stream owns the materialized inode and directory tables;
    /// dropping it releases them.
    #[instrument(skip(self))]
    pub fn open_dir(&mut self, path: &str) -> Result<DirStream, SquashfsError> {
        let tables = self.tables()?;
        let (_, inode) = resolve(&tables, self.superblock.inode_count, path)?;
        let location = dir_location(&inode)?;
        let cursor = listing_cursor(&tables.dirs, &location)?;
        Ok(DirStream::new(tables.inodes, tables.dirs, cursor))
    }

    /// Decompressed size of the object at `path`: file size for regular
    /// files, target length for symlinks, 0 for everything else.
    #[instrument(skip(self))]
    pub fn size(&mut self, path: &str) -> Result<u64, SquashfsError> {
        let tables = self.tables()?;
        let (_, inode) = resolve(&tables, self.superblock.inode_count, path)?;
        Ok(match &inode.inner {
            InodeInner::BasicFile(file) => file.file_size.into(),
            InodeInner::ExtendedFile(file) => file.file_size,
            InodeInner::BasicSymlink(link) | InodeInner::ExtendedSymlink(link) => {
                link.target_size.into()
            }
            _ => 0,
        })
    }

    /// Whether `path` resolves to anything.
    #[instrument(skip(self))]
    pub fn exists(&mut self, path: &str) -> Result<bool, SquashfsError> {
        let tables = self.tables()?;
        match resolve(&tables, self.superblock.inode_count, path) {
            Ok(_) => Ok(true),
            Err(
                SquashfsError::NotFound
                | SquashfsError::NotADirectory
                | SquashfsError::EmptyDirectory,
            ) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read the regular file at `path` into `dst`, starting at `offset`
    /// within `dst`. A `len` of 0 reads the whole file; a non-zero `len`
    /// must not exceed the file size. Returns the number of bytes written.
    #[instrument(skip(self, dst))]
    pub fn read(
        &mut self,
        path: &str,
        dst: &mut [u8],
        offset: usize,
        len: u64,
    ) -> Result<usize, SquashfsError> {
        let superblock = self.superblock;
        let tables = self.tables()?;
        let (inode_offset, inode) = resolve(&tables, superblock.inode_count, path)?;
        let file = FileInfo::new(&inode, inode_offset, &superblock)?;

        if len > file.file_size {
            return Err(SquashfsError::LengthExceedsFile {
                requested: len,
                file_size: file.file_size,
            });
        }
        let effective_size = if len == 0 { file.file_size } else { len };
        let effective_size =
            usize::try_from(effective_size).map_err(|_| SquashfsError::BufferTooSmall)?;
        let out = dst
            .get_mut(offset..)
            .ok_or(SquashfsError::BufferTooSmall)?;
        if out.len() < effective_size {
            return Err(SquashfsError::BufferTooSmall);
        }

        let block_sizes = tables.inodes.block_sizes(file.sizes_offset, file.block_count)?;
        debug!(
            "{} data blocks, fragment: {}",
            block_sizes.len(),
            file.frag_index != NO_FRAGMENT
        );

        let block_size = superblock.block_size as usize;
        let mut reader = DeviceReader::new(&mut self.device, self.part_start);
        let mut written = 0usize;
        let mut data_offset = file.blocks_start;
        for size in &block_sizes {
            if written == effective_size {
                break;
            }
            if size.size() > superblock.block_size {
                return Err(SquashfsError::CorruptImage);
            }
            let payload = if size.is_sparse() {
                // a hole: one block of zeros, no bytes on disk
                vec![0u8; block_size]
            } else {
                let raw = reader.read_vec(data_offset, size.size() as usize)?;
                if size.is_uncompressed() {
                    raw
                } else {
                    let mut decoded = Vec::with_capacity(block_size);
                    decompress(&raw, &mut decoded, superblock.compressor)?;
                    if decoded.len() > block_size {
                        return Err(SquashfsError::CorruptImage);
                    }
                    decoded
                }
            };
            let n = payload.len().min(effective_size - written);
            out[written..written + n].copy_from_slice(&payload[..n]);
            written += n;
            data_offset += u64::from(size.size());
        }

        if file.frag_index != NO_FRAGMENT && written < effective_size {
            let fragment = fragment::lookup(&mut reader, &superblock, file.frag_index)?;
            let frag_size = fragment.data_size();
            if frag_size.size() > superblock.block_size {
                return Err(SquashfsError::CorruptImage);
            }
            let raw = reader.read_vec(fragment.start, frag_size.size() as usize)?;
            let block = if frag_size.is_uncompressed() {
                raw
            } else {
                let mut decoded = Vec::with_capacity(block_size);
                decompress(&raw, &mut decoded, superblock.compressor)?;
                if decoded.len() > block_size {
                    return Err(SquashfsError::CorruptImage);
                }
                decoded
            };
            let tail_offset = file.block_offset as usize;
            let need = effective_size - written;
            let slice = block
                .get(tail_offset..tail_offset + need)
                .ok_or(SquashfsError::CorruptImage)?;
            out[written..written + need].copy_from_slice(slice);
            written += need;
        }

        if written < effective_size {
            // the inode claims more bytes than its blocks provide
            return Err(SquashfsError::CorruptImage);
        }
        Ok(written)
    }

    /// Materialize the inode and directory tables.
    #[instrument(skip_all)]
    fn tables(&mut self) -> Result<Tables, SquashfsError> {
        let superblock = self.superblock;
        let mut reader = DeviceReader::new(&mut self.device, self.part_start);

        debug!("materializing inode table");
        let inodes = MetadataTable::read(
            &mut reader,
            superblock.compressor,
            superblock.inode_table,
            superblock.dir_table,
        )?;
        debug!("materializing directory table");
        let dirs = MetadataTable::read(
            &mut reader,
            superblock.compressor,
            superblock.dir_table,
            dir_table_end(&superblock),
        )?;

        Ok(Tables {
            inodes: InodeTable::new(
                inodes,
                superblock.inode_count,
                superblock.block_size,
                superblock.block_log,
            ),
            dirs,
        })
    }
}

/// The directory table runs to the next section present on disk. The
/// fragment-table metadata blocks that may sit in between parse as ordinary
/// metadata blocks and are never referenced by a listing.
fn dir_table_end(superblock: &SuperBlock) -> u64 {
    [
        superblock.frag_table,
        superblock.export_table,
        superblock.id_table,
    ]
    .into_iter()
    .filter(|table| *table != NOT_SET)
    .min()
    .unwrap_or(superblock.bytes_used)
}

/// A directory inode's reference into the directory table.
struct DirLocation {
    /// On-disk offset of the metadata block holding the listing, relative to
    /// the table start
    block_index: u64,
    /// Offset of the listing within that block's payload
    block_offset: u64,
    file_size: u64,
}

fn dir_location(inode: &Inode) -> Result<DirLocation, SquashfsError> {
    match &inode.inner {
        InodeInner::BasicDirectory(dir) => Ok(DirLocation {
            block_index: dir.block_index.into(),
            block_offset: dir.block_offset.into(),
            file_size: dir.file_size.into(),
        }),
        InodeInner::ExtendedDirectory(dir) => Ok(DirLocation {
            block_index: dir.block_index.into(),
            block_offset: dir.block_offset.into(),
            file_size: dir.file_size.into(),
        }),
        _ => Err(SquashfsError::NotADirectory),
    }
}

/// Translate a directory reference to a cursor over the materialized table.
fn listing_cursor(
    dirs: &MetadataTable,
    location: &DirLocation,
) -> Result<DirCursor, SquashfsError> {
    let ordinal = dirs
        .ordinal_of(location.block_index)
        .ok_or(SquashfsError::CorruptImage)?;
    let listing = dirs.payload_start(ordinal) + location.block_offset;
    let len = location
        .file_size
        .checked_sub(DIR_EMPTY_FILE_SIZE)
        .ok_or(SquashfsError::CorruptImage)?;
    if listing + len > dirs.decoded.len() as u64 {
        return Err(SquashfsError::CorruptImage);
    }
    DirCursor::new(listing, location.file_size)
}

/// Walk `path` from the root inode, one component at a time.
///
/// The root inode number equals the superblock's inode count by format
/// convention, so `/` and the empty path short-circuit to it.
fn resolve(
    tables: &Tables,
    root_inode_number: u32,
    path: &str,
) -> Result<(usize, Inode), SquashfsError> {
    let mut current = tables.inodes.inode(root_inode_number)?;

    for component in path.split('/').filter(|c| !c.is_empty()) {
        let location = dir_location(&current.1)?;
        if location.file_size <= DIR_EMPTY_FILE_SIZE {
            return Err(SquashfsError::EmptyDirectory);
        }
        let mut cursor = listing_cursor(&tables.dirs, &location)?;
        current = loop {
            match cursor.next_raw(&tables.dirs.decoded)? {
                Some((base_inode, entry)) => {
                    if entry.name == component.as_bytes() {
                        let number = entry_inode_number(base_inode, entry.inode_offset)?;
                        break tables.inodes.inode(number)?;
                    }
                }
                None => return Err(SquashfsError::NotFound),
            }
        };
    }

    Ok(current)
}

/// Everything a read needs from a regular file's inode, copied out of the
/// materialized table up front.
struct FileInfo {
    file_size: u64,
    /// Absolute image byte offset of the first data block
    blocks_start: u64,
    frag_index: u32,
    /// Byte offset of the file's tail within its fragment block
    block_offset: u32,
    /// Offset of the block-size list within the inode table
    sizes_offset: usize,
    block_count: u64,
}

impl FileInfo {
    fn new(
        inode: &Inode,
        inode_offset: usize,
        superblock: &SuperBlock,
    ) -> Result<Self, SquashfsError> {
        match &inode.inner {
            InodeInner::BasicFile(file) => Ok(Self {
                file_size: file.file_size.into(),
                blocks_start: file.blocks_start.into(),
                frag_index: file.frag_index,
                block_offset: file.block_offset,
                sizes_offset: inode_offset + 32,
                block_count: block_count(
                    superblock.block_size,
                    superblock.block_log,
                    file.frag_index,
                    file.file_size.into(),
                ),
            }),
            InodeInner::ExtendedFile(file) => Ok(Self {
                file_size: file.file_size,
                blocks_start: file.blocks_start,
                frag_index: file.frag_index,
                block_offset: file.block_offset,
                sizes_offset: inode_offset + 56,
                block_count: block_count(
                    superblock.block_size,
                    superblock.block_log,
                    file.frag_index,
                    file.file_size,
                ),
            }),
            _ => Err(SquashfsError::UnsupportedInode),
        }
    }
}
