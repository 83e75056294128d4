//! Types of supported compression algorithms

#[cfg(any(feature = "gzip", feature = "xz"))]
use std::io::Read;

use deku::prelude::*;

use crate::error::SquashfsError;

/// Compressor id as stored in the superblock
#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[deku(type = "u16")]
#[rustfmt::skip]
pub enum Compressor {
    None = 0,
    Gzip = 1,
    Lzma = 2,
    Lzo =  3,
    Xz =   4,
    Lz4 =  5,
    Zstd = 6,
}

/// Using the current compressor from the superblock, decompress bytes
///
/// Decoded bytes are appended to `out`. The lzo and lz4 decoders write into
/// `out`'s spare capacity, so callers pass a `Vec` created with a capacity of
/// the expected decoded upper bound; the caller enforces that bound afterwards.
/// A payload the codec rejects is a format-consistency violation and surfaces
/// as [`SquashfsError::CorruptImage`].
pub(crate) fn decompress(
    bytes: &[u8],
    out: &mut Vec<u8>,
    compressor: Compressor,
) -> Result<(), SquashfsError> {
    match compressor {
        #[cfg(feature = "gzip")]
        Compressor::Gzip => {
            let mut decoder = flate2::read::ZlibDecoder::new(bytes);
            decoder
                .read_to_end(out)
                .map_err(|_| SquashfsError::CorruptImage)?;
        }
        #[cfg(feature = "xz")]
        Compressor::Xz => {
            let mut decoder = xz2::read::XzDecoder::new(bytes);
            decoder
                .read_to_end(out)
                .map_err(|_| SquashfsError::CorruptImage)?;
        }
        #[cfg(feature = "lzo")]
        Compressor::Lzo => {
            out.resize(out.capacity(), 0);
            let (out_size, error) = rust_lzo::LZOContext::decompress_to_slice(bytes, out);
            let out_size = out_size.len();
            out.truncate(out_size);
            if error != rust_lzo::LZOError::OK {
                return Err(SquashfsError::CorruptImage);
            }
        }
        #[cfg(feature = "lz4")]
        Compressor::Lz4 => {
            out.resize(out.capacity(), 0);
            let out_size = lz4_flex::decompress_into(bytes, out.as_mut_slice())
                .map_err(|_| SquashfsError::CorruptImage)?;
            out.truncate(out_size);
        }
        #[cfg(feature = "zstd")]
        Compressor::Zstd => {
            let mut decoder = zstd::bulk::Decompressor::new()?;
            decoder
                .decompress_to_buffer(bytes, out)
                .map_err(|_| SquashfsError::CorruptImage)?;
        }
        _ => return Err(SquashfsError::UnsupportedCompressor(compressor)),
    }
    Ok(())
}
