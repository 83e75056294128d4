//! Metadata block streams

use tracing::{instrument, trace};

use crate::compressor::{decompress, Compressor};
use crate::error::SquashfsError;
use crate::reader::{BlockDevice, DeviceReader};

/// Maximum decompressed payload of one metadata block
pub(crate) const METADATA_MAXSIZE: usize = 0x2000;

const METADATA_UNCOMPRESSED: u16 = 1 << 15;

/// Check the stored-uncompressed bit within a raw block header
pub(crate) fn is_compressed(header: u16) -> bool {
    header & METADATA_UNCOMPRESSED == 0
}

/// On-disk payload length encoded in a raw block header
pub(crate) fn payload_len(header: u16) -> usize {
    usize::from(header & !METADATA_UNCOMPRESSED)
}

/// A metadata table materialized from its run of on-disk blocks.
///
/// `decoded` concatenates every block's payload in on-disk order. Table
/// references carry the on-disk offset of a block header plus an offset into
/// that block's payload; translating them needs both the on-disk start and
/// the decoded start of every block, so the reconstruction records the two
/// position maps side by side.
pub(crate) struct MetadataTable {
    pub(crate) decoded: Vec<u8>,
    /// On-disk offset of each block header, relative to the table start
    block_starts: Vec<u64>,
    /// Cumulative decoded length through each block
    positions: Vec<u64>,
}

impl MetadataTable {
    /// Reconstruct the run of metadata blocks within `[start, end)` of the image.
    #[instrument(skip(reader))]
    pub fn read<D: BlockDevice>(
        reader: &mut DeviceReader<'_, D>,
        compressor: Compressor,
        start: u64,
        end: u64,
    ) -> Result<Self, SquashfsError> {
        let mut decoded = Vec::new();
        let mut block_starts = Vec::new();
        let mut positions = Vec::new();

        let mut cursor = start;
        while cursor < end {
            block_starts.push(cursor - start);
            let (payload, advance) = read_block_at(reader, compressor, cursor, end)?;
            decoded.try_reserve(payload.len())?;
            decoded.extend_from_slice(&payload);
            positions.push(decoded.len() as u64);
            cursor += advance;
        }
        trace!(
            "{} blocks, {:#02x?} decoded bytes",
            block_starts.len(),
            decoded.len()
        );

        Ok(Self {
            decoded,
            block_starts,
            positions,
        })
    }

    /// Ordinal of the block whose header begins at `start_block` within the table
    pub fn ordinal_of(&self, start_block: u64) -> Option<usize> {
        self.block_starts.binary_search(&start_block).ok()
    }

    /// Offset within `decoded` at which block `ordinal`'s payload begins
    pub fn payload_start(&self, ordinal: usize) -> u64 {
        if ordinal == 0 {
            0
        } else {
            self.positions[ordinal - 1]
        }
    }
}

/// Read the single metadata block starting at `offset`, without a bounding
/// table. Used for the fragment-table blocks the fragment index points into.
pub(crate) fn read_block<D: BlockDevice>(
    reader: &mut DeviceReader<'_, D>,
    compressor: Compressor,
    offset: u64,
) -> Result<Vec<u8>, SquashfsError> {
    let (payload, _) = read_block_at(reader, compressor, offset, u64::MAX)?;
    Ok(payload)
}

/// One step of the reconstruction protocol: header, payload, decompress.
/// Returns the decoded payload and the on-disk length consumed.
fn read_block_at<D: BlockDevice>(
    reader: &mut DeviceReader<'_, D>,
    compressor: Compressor,
    offset: u64,
    end: u64,
) -> Result<(Vec<u8>, u64), SquashfsError> {
    let payload_offset = offset.checked_add(2).ok_or(SquashfsError::CorruptImage)?;
    if payload_offset > end {
        return Err(SquashfsError::CorruptImage);
    }
    let header = reader.read_u16_le(offset)?;
    let on_disk_len = payload_len(header);
    if on_disk_len > METADATA_MAXSIZE {
        return Err(SquashfsError::CorruptImage);
    }
    if payload_offset
        .checked_add(on_disk_len as u64)
        .map_or(true, |tail| tail > end)
    {
        return Err(SquashfsError::CorruptImage);
    }
    trace!(
        "block at {:#02x?}: {:#02x?} bytes, compressed {}",
        offset,
        on_disk_len,
        is_compressed(header)
    );

    let raw = reader.read_vec(payload_offset, on_disk_len)?;
    let payload = if is_compressed(header) {
        let mut out = Vec::with_capacity(METADATA_MAXSIZE);
        decompress(&raw, &mut out, compressor)?;
        if out.len() > METADATA_MAXSIZE {
            return Err(SquashfsError::CorruptImage);
        }
        out
    } else {
        raw
    };

    Ok((payload, 2 + on_disk_len as u64))
}
