//! Block device access

use std::io;

use tracing::trace;

use crate::error::SquashfsError;

/// Byte-addressable storage backing a squashfs image.
///
/// The driver issues whole-sector reads only; scattering a byte range across
/// sectors is handled internally through [`sector_span`]. Implementations that
/// require stricter buffer alignment than `Vec<u8>` provides should bounce
/// through their own staging buffer.
pub trait BlockDevice {
    /// Sector size in bytes. A power of two, typically 512 – 4096.
    fn sector_size(&self) -> u32;

    /// Read `dst.len() / sector_size` sectors starting at `sector` into `dst`.
    ///
    /// `dst.len()` is always a multiple of the sector size. A short read must
    /// be reported as an error, not truncated output.
    fn read(&mut self, sector: u64, dst: &mut [u8]) -> io::Result<()>;
}

/// A byte range translated to whole sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SectorSpan {
    /// First sector covering the range
    pub sector: u64,
    /// Number of sectors covering the range
    pub count: u64,
    /// Offset of the range's first byte within the first sector
    pub offset: usize,
}

/// Translate `(byte_offset, byte_len)` into the covering run of sectors.
///
/// Every read site goes through this one helper so the alignment arithmetic
/// exists in exactly one place.
pub(crate) fn sector_span(sector_size: u32, byte_offset: u64, byte_len: u64) -> SectorSpan {
    let sector_size = u64::from(sector_size);
    let sector = byte_offset / sector_size;
    let offset = (byte_offset % sector_size) as usize;
    let count = (offset as u64 + byte_len + sector_size - 1) / sector_size;
    SectorSpan {
        sector,
        count,
        offset,
    }
}

/// Sector-aligned reads over absolute byte offsets within one partition.
pub(crate) struct DeviceReader<'d, D: BlockDevice> {
    device: &'d mut D,
    /// Partition start, in sectors
    part_start: u64,
}

impl<'d, D: BlockDevice> DeviceReader<'d, D> {
    pub fn new(device: &'d mut D, part_start: u64) -> Self {
        Self { device, part_start }
    }

    /// Fill `dst` from the image bytes starting at `byte_offset`.
    pub fn read_at(&mut self, byte_offset: u64, dst: &mut [u8]) -> Result<(), SquashfsError> {
        if dst.is_empty() {
            return Ok(());
        }
        let sector_size = self.device.sector_size();
        let span = sector_span(sector_size, byte_offset, dst.len() as u64);
        trace!(
            "read {:#02x?} len {:#02x?} -> {span:02x?}",
            byte_offset,
            dst.len()
        );

        if span.offset == 0 && dst.len() % sector_size as usize == 0 {
            self.device.read(self.part_start + span.sector, dst)?;
            return Ok(());
        }

        let byte_count = (span.count * u64::from(sector_size)) as usize;
        let mut staging = Vec::new();
        staging.try_reserve_exact(byte_count)?;
        staging.resize(byte_count, 0u8);
        self.device.read(self.part_start + span.sector, &mut staging)?;
        dst.copy_from_slice(&staging[span.offset..span.offset + dst.len()]);
        Ok(())
    }

    /// Allocate and fill a buffer of `len` image bytes starting at `byte_offset`.
    pub fn read_vec(&mut self, byte_offset: u64, len: usize) -> Result<Vec<u8>, SquashfsError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)?;
        buf.resize(len, 0u8);
        self.read_at(byte_offset, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u16_le(&mut self, byte_offset: u64) -> Result<u16, SquashfsError> {
        let mut buf = [0u8; 2];
        self.read_at(byte_offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }
}
