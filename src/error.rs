//! Errors

use std::collections::TryReserveError;
use std::io;

use thiserror::Error;

use crate::compressor::Compressor;

/// Errors generated from library
#[derive(Error, Debug)]
pub enum SquashfsError {
    /// The block device failed or returned fewer sectors than asked for
    #[error("std io error: {0}")]
    Io(#[from] io::Error),

    /// An on-disk structure failed to decode. Equivalent to [`Self::CorruptImage`]
    /// at the public boundary, kept separate for diagnostics.
    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("superblock magic mismatch")]
    BadMagic,

    #[error("unsupported compression: {0:?}")]
    UnsupportedCompressor(Compressor),

    #[error("corrupted or invalid squashfs image")]
    CorruptImage,

    #[error("file or directory not found")]
    NotFound,

    #[error("path component is not a directory")]
    NotADirectory,

    #[error("directory is empty")]
    EmptyDirectory,

    #[error("inode type does not support this operation")]
    UnsupportedInode,

    #[error("read length {requested} exceeds file size {file_size}")]
    LengthExceedsFile { requested: u64, file_size: u64 },

    #[error("destination buffer too small for requested read")]
    BufferTooSmall,

    #[error("allocator try_reserve error")]
    TryReserve(#[from] TryReserveError),
}
