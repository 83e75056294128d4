#![doc = include_str!("../README.md")]

mod compressor;
mod data;
mod dir;
pub mod error;
mod fragment;
mod inode;
mod metadata;
mod reader;
mod squashfs;
mod superblock;

pub use crate::compressor::Compressor;
pub use crate::data::DataSize;
pub use crate::dir::{DirStream, Entry, EntryKind};
pub use crate::error::SquashfsError;
pub use crate::reader::BlockDevice;
pub use crate::squashfs::Squashfs;
pub use crate::superblock::{SuperBlock, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
