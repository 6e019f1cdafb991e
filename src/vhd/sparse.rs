mod header;
use std::cell::{Cell, RefCell};
use std::path::Path;
use log::{debug, info, warn};

pub use header::*;

pub mod bat;
pub use bat::{VhdBat, DD_BLOCK_UNUSED};

use crate::{math, sizes, Flush, FormatError, ReadAt, Result, StorageSize, Uuid, VhdError, VhdFile, WriteAt};

use super::{parse_uuid, unix_to_vhd_timestamp, vhd_time_now, DiskType, VhdFooter, DEFAULT_HEADER_OFFSET, DEFAULT_TABLE_OFFSET};

/// Largest disk a VHD can describe.
pub const MAX_VHD_SIZE: u64 = 2040 * sizes::GIB;

/// Caller-supplied knobs for a new dynamic disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    /// Disk UUID in `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` form, random v4 when absent.
    pub uuid: Option<String>,
    /// Creation time in Unix seconds, now when absent.
    pub timestamp: Option<i64>,
    /// Bytes per block. Power of two, at least one sector.
    pub block_size: u32,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            uuid: None,
            timestamp: None,
            block_size: DD_BLOCKSIZE_DEFAULT,
        }
    }
}

fn check_block_size(block_size: u32) -> Result<()> {
    if !block_size.is_power_of_two() || block_size < sizes::SECTOR {
        return Err(VhdError::InvalidBlockSize(block_size));
    }

    Ok(())
}

/// Validates `size` and `options` and builds the footer and dynamic header of a new disk.
/// Touches no storage.
fn plan(size: u64, options: &CreateOptions) -> Result<(VhdFooter, VhdHeader)> {
    if size == 0 {
        return Err(VhdError::InvalidSize(size));
    }
    if size > MAX_VHD_SIZE {
        return Err(VhdError::DiskSizeTooBig(size));
    }
    check_block_size(options.block_size)?;

    let size = math::round_up(size, sizes::SECTOR_U64);
    let entries = u32::try_from(math::ceil(size, options.block_size as u64))
        .map_err(|_| VhdError::DiskSizeTooBig(size))?;

    let uuid = match &options.uuid {
        Some(s) => parse_uuid(s)?,
        None => *Uuid::new_v4().as_bytes(),
    };
    let timestamp = match options.timestamp {
        Some(unix) => unix_to_vhd_timestamp(unix)?,
        None => vhd_time_now(),
    };

    let footer = VhdFooter::new(size, DiskType::Dynamic, uuid, timestamp);
    let header = VhdHeader::new(entries, DEFAULT_TABLE_OFFSET, options.block_size);

    Ok((footer, header))
}

/// Dynamic disk over a positional byte store. Block regions are appended on first
/// write and the trailing footer copy always follows the last region.
pub struct SparseDisk<S> {
    file: S,
    footer: RefCell<VhdFooter>,
    header: VhdHeader,
    bat: RefCell<VhdBat>,
    bitmap_size: u32,
    next_block_pos: Cell<u64>,
}

impl<S> SparseDisk<S> {
    pub fn footer(&self) -> VhdFooter {
        self.footer.borrow().clone()
    }

    pub fn header(&self) -> &VhdHeader {
        &self.header
    }

    pub fn bat(&self) -> VhdBat {
        self.bat.borrow().clone()
    }

    pub fn block_size(&self) -> u32 {
        self.header.block_size()
    }

    pub fn bitmap_size(&self) -> u32 {
        self.bitmap_size
    }

    /// Virtual disk size in bytes.
    pub fn capacity(&self) -> u64 {
        self.footer.borrow().current_size()
    }

    /// Byte offset of the trailing footer copy.
    pub fn footer_pos(&self) -> u64 {
        self.next_block_pos.get()
    }

    pub fn lookup(&self, block_index: usize) -> Result<Option<u32>> {
        Ok(self.bat.borrow().lookup(block_index)?)
    }

    pub fn into_inner(self) -> S {
        self.file
    }
}

impl<S: ReadAt + WriteAt + Flush + StorageSize> SparseDisk<S> {
    fn new(file: S, footer: VhdFooter, header: VhdHeader, bat: VhdBat, next_block_pos: u64) -> Self {
        let bitmap_size = header.bitmap_size();
        SparseDisk {
            file,
            footer: RefCell::new(footer),
            header,
            bat: RefCell::new(bat),
            bitmap_size,
            next_block_pos: Cell::new(next_block_pos),
        }
    }

    /// Lays out a new dynamic disk of `size` bytes: footer copy, dynamic header,
    /// an all-unallocated BAT and the trailing footer.
    pub fn create(file: S, size: u64, options: &CreateOptions) -> Result<Self> {
        let (footer, header) = plan(size, options)?;
        Self::create_with(file, footer, header)
    }

    fn create_with(file: S, footer: VhdFooter, header: VhdHeader) -> Result<Self> {
        let bat = VhdBat::new(header.max_bat_size(), header.table_offset(), header.block_size());

        header.write(&file, DEFAULT_HEADER_OFFSET)?;
        let bat_size = bat.persist(&file)?;
        let next_block_pos = header.table_offset() + bat_size as u64;

        info!(
            "creating dynamic disk: {} bytes, {} blocks of {} bytes",
            footer.current_size(),
            header.max_bat_size(),
            header.block_size()
        );

        let this = Self::new(file, footer, header, bat, next_block_pos);
        this.write_footer()?;

        Ok(this)
    }

    /// Opens an existing dynamic disk for further writes.
    pub fn open(file: S) -> Result<Self> {
        let file_size = file.storage_size()?;
        let min_size = (sizes::SECTOR_U64 * 2) + super::HEADER_SIZE as u64;
        if file_size < min_size {
            return Err(FormatError::Truncated {
                structure: "dynamic disk",
                expected: min_size as usize,
                actual: file_size as usize,
            }
            .into());
        }

        let footer_pos = file_size - sizes::SECTOR_U64;
        let footer = Self::read_usable_footer(&file, footer_pos)?;

        match DiskType::try_from(footer.disk_type)? {
            DiskType::Dynamic => {}
            DiskType::Differential => return Err(VhdError::DiffNotWritable),
            _ => return Err(VhdError::NeedDyncOrDiffImage),
        }

        let header = VhdHeader::read(&file, footer.data_offset())?;
        if !header.checksum_valid {
            return Err(VhdError::ChecksumMismatch("dynamic header"));
        }
        let header = header.inner;

        if check_block_size(header.block_size()).is_err() {
            return Err(FormatError::InvalidField {
                field: "block size",
                reason: "not a power of two of at least one sector",
            }
            .into());
        }

        let bat_size = math::round_up(header.max_bat_size() as u64 * 4, sizes::SECTOR_U64);
        let bat_end = header.table_offset().checked_add(bat_size);
        if bat_end.map_or(true, |end| end > footer_pos) {
            return Err(FormatError::InvalidField {
                field: "table offset",
                reason: "BAT extends past the footer",
            }
            .into());
        }

        let bat = VhdBat::read(&file, header.table_offset(), header.max_bat_size(), header.block_size())?;
        if bat.first_free_sector() * sizes::SECTOR_U64 > footer_pos {
            return Err(FormatError::InvalidField {
                field: "BAT",
                reason: "block region extends past the footer",
            }
            .into());
        }

        Ok(Self::new(file, footer, header, bat, footer_pos))
    }

    /// Head footer if its checksum holds, otherwise the trailing copy.
    fn read_usable_footer(file: &S, footer_pos: u64) -> Result<VhdFooter> {
        let head = VhdFooter::read(file, 0);
        if let Ok(head) = &head {
            if head.checksum_valid {
                return Ok(head.inner.clone());
            }
        }

        match VhdFooter::read(file, footer_pos) {
            Ok(tail) if tail.checksum_valid => {
                warn!("head footer unusable, using the copy at {:#x}", footer_pos);
                Ok(tail.inner)
            }
            Ok(_) => Err(VhdError::ChecksumMismatch("footer")),
            Err(e) => match head {
                Ok(_) => Err(VhdError::ChecksumMismatch("footer")),
                Err(_) => Err(e),
            },
        }
    }

    /// Writes the footer at offset 0 and right after the last block region.
    fn write_footer(&self) -> Result<()> {
        let footer = self.footer.borrow();
        footer.write(&self.file, 0)?;
        footer.write(&self.file, self.next_block_pos.get())
    }

    fn check_bitmap_len(&self, len: usize) -> Result<()> {
        if len > self.bitmap_size as usize {
            return Err(VhdError::BufferSize {
                expected: self.bitmap_size as usize,
                actual: len,
            });
        }

        Ok(())
    }

    fn check_data_len(&self, len: usize) -> Result<()> {
        if len != self.block_size() as usize {
            return Err(VhdError::BufferSize {
                expected: self.block_size() as usize,
                actual: len,
            });
        }

        Ok(())
    }

    fn block_pos(sector: u32) -> u64 {
        sector as u64 * sizes::SECTOR_U64
    }

    /// Writes a whole block: sector bitmap (zero padded to its on-disk size) and
    /// `block_size` bytes of data. Allocates the block on first write. Returns the
    /// sector where the block region starts.
    pub fn write_logical_block(&self, block_index: usize, bitmap: &[u8], data: &[u8]) -> Result<u32> {
        self.check_bitmap_len(bitmap.len())?;
        self.check_data_len(data.len())?;

        let mut region_bitmap = vec![0_u8; self.bitmap_size as usize];
        region_bitmap[..bitmap.len()].copy_from_slice(bitmap);

        match self.lookup(block_index)? {
            Some(sector) => {
                self.write_region(sector, &region_bitmap, Some(data))?;
                Ok(sector)
            }
            None => self.append_block(block_index, &region_bitmap, Some(data)),
        }
    }

    /// Reads a whole block. Returns `false`, with both buffers zeroed, for an
    /// unallocated block.
    pub fn read_logical_block(&self, block_index: usize, bitmap: &mut [u8], data: &mut [u8]) -> Result<bool> {
        self.check_bitmap_len(bitmap.len())?;
        self.check_data_len(data.len())?;

        match self.lookup(block_index)? {
            Some(sector) => {
                let pos = Self::block_pos(sector);
                self.file.read_exact_at(pos, bitmap)?;
                self.file.read_exact_at(pos + self.bitmap_size as u64, data)?;
                Ok(true)
            }
            None => {
                bitmap.fill(0);
                data.fill(0);
                Ok(false)
            }
        }
    }

    fn write_region(&self, sector: u32, bitmap: &[u8], data: Option<&[u8]>) -> Result<()> {
        let pos = Self::block_pos(sector);
        self.file.write_all_at(pos, bitmap)?;

        let data_pos = pos + self.bitmap_size as u64;
        match data {
            Some(data) => self.file.write_all_at(data_pos, data),
            None => write_zeroes(&self.file, data_pos, self.block_size() as u64),
        }
    }

    /// Appends a block region at the current end of data, moves the trailing
    /// footer behind it, then records the block in the BAT. If any of those
    /// writes fails the block stays unallocated and the footer goes back to
    /// where it was.
    fn append_block(&self, block_index: usize, bitmap: &[u8], data: Option<&[u8]>) -> Result<u32> {
        let end_of_file = self.next_block_pos.get();
        let sector = self.bat.borrow_mut().allocate(block_index, end_of_file)?;
        let region_end = Self::block_pos(sector) + self.bitmap_size as u64 + self.block_size() as u64;

        let appended = self.write_region(sector, bitmap, data).and_then(|()| {
            self.next_block_pos.set(region_end);
            self.write_footer()?;
            self.bat.borrow().persist_entry(&self.file, block_index)
        });

        if let Err(e) = appended {
            self.bat.borrow_mut().release(block_index);
            self.next_block_pos.set(end_of_file);
            if let Err(restore) = self.write_footer() {
                warn!("could not restore footer at {:#x}: {}", end_of_file, restore);
            }
            return Err(e);
        }

        debug!("block {} appended at sector {:#010x}, footer now at {:#x}", block_index, sector, region_end);

        Ok(sector)
    }

    /// Changes the virtual size. It may grow up to what the BAT can map and may not
    /// shrink below the highest allocated block. The original size is left alone.
    pub fn set_current_size(&self, new_size: u64) -> Result<()> {
        if new_size == 0 || new_size % sizes::SECTOR_U64 != 0 {
            return Err(VhdError::InvalidSize(new_size));
        }

        let block_size = self.block_size() as u64;
        let limit = self.header.max_bat_size() as u64 * block_size;
        if new_size > limit {
            return Err(VhdError::DiskSizeTooBig(new_size));
        }

        let current = self.capacity();
        let used = self
            .bat
            .borrow()
            .allocated()
            .map(|(index, _)| (index as u64 + 1) * block_size)
            .max()
            .map_or(0, |end| end.min(current));
        if new_size < used {
            return Err(VhdError::InvalidSize(new_size));
        }

        {
            let mut footer = self.footer.borrow_mut();
            footer.curr_size = new_size;
            footer.update_checksum();
        }
        info!("resized disk from {} to {} bytes", current, new_size);

        self.write_footer()
    }

    /// Zeroes one data sector on disk.
    fn zero_sector(&self, block_pos: u64, sector_in_block: u64) -> Result<()> {
        let pos = block_pos + self.bitmap_size as u64 + sector_in_block * sizes::SECTOR_U64;
        write_zeroes(&self.file, pos, sizes::SECTOR_U64)
    }

    fn read_bitmap(&self, block_pos: u64) -> Result<Vec<u8>> {
        let mut bitmap = vec![0_u8; self.bitmap_size as usize];
        self.file.read_exact_at(block_pos, &mut bitmap)?;
        Ok(bitmap)
    }

    fn read_chunk(&self, block_index: usize, within: u64, buf: &mut [u8]) -> Result<()> {
        let sector = match self.lookup(block_index)? {
            Some(sector) => sector,
            None => {
                buf.fill(0);
                return Ok(());
            }
        };

        let block_pos = Self::block_pos(sector);
        let bitmap = self.read_bitmap(block_pos)?;
        self.file.read_exact_at(block_pos + self.bitmap_size as u64 + within, buf)?;

        // Sectors not marked in the bitmap read as zeros
        let mut pos = 0_usize;
        while pos < buf.len() {
            let sector_in_block = (within + pos as u64) / sizes::SECTOR_U64;
            let sector_end = ((sector_in_block + 1) * sizes::SECTOR_U64 - within) as usize;
            let end = sector_end.min(buf.len());
            if !bitmap_get(&bitmap, sector_in_block) {
                buf[pos..end].fill(0);
            }
            pos = end;
        }

        Ok(())
    }

    fn write_chunk(&self, block_index: usize, within: u64, data: &[u8]) -> Result<()> {
        let sector = match self.lookup(block_index)? {
            Some(sector) => sector,
            None => {
                let bitmap = vec![0_u8; self.bitmap_size as usize];
                self.append_block(block_index, &bitmap, None)?
            }
        };

        let block_pos = Self::block_pos(sector);
        let mut bitmap = self.read_bitmap(block_pos)?;

        let first = within / sizes::SECTOR_U64;
        let last = (within + data.len() as u64 - 1) / sizes::SECTOR_U64;
        for sector_in_block in first..=last {
            if bitmap_get(&bitmap, sector_in_block) {
                continue;
            }

            let start = sector_in_block * sizes::SECTOR_U64;
            let covered = within <= start && within + data.len() as u64 >= start + sizes::SECTOR_U64;
            if !covered {
                self.zero_sector(block_pos, sector_in_block)?;
            }
            bitmap_set(&mut bitmap, sector_in_block);
        }

        self.file.write_all_at(block_pos + self.bitmap_size as u64 + within, data)?;
        self.file.write_all_at(block_pos, &bitmap)
    }
}

impl<S: ReadAt + WriteAt + Flush + StorageSize> ReadAt for SparseDisk<S> {
    fn read_at(&self, offset: u64, data: &mut [u8]) -> Result<usize> {
        let len = match math::bound_to(self.capacity(), offset, data.len()) {
            Some(len) => len,
            None => return Err(VhdError::ReadBeyondEOD),
        };

        let block_size = self.block_size() as u64;
        let mut done = 0_usize;
        while done < len {
            let abs = offset + done as u64;
            let block_index = (abs / block_size) as usize;
            let within = abs % block_size;
            let chunk = ((block_size - within) as usize).min(len - done);

            self.read_chunk(block_index, within, &mut data[done..done + chunk])?;
            done += chunk;
        }

        Ok(len)
    }
}

impl<S: ReadAt + WriteAt + Flush + StorageSize> WriteAt for SparseDisk<S> {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let len = match math::bound_to(self.capacity(), offset, data.len()) {
            Some(len) => len,
            None => return Err(VhdError::WriteBeyondEOD),
        };

        let block_size = self.block_size() as u64;
        let mut done = 0_usize;
        while done < len {
            let abs = offset + done as u64;
            let block_index = (abs / block_size) as usize;
            let within = abs % block_size;
            let chunk = ((block_size - within) as usize).min(len - done);

            self.write_chunk(block_index, within, &data[done..done + chunk])?;
            done += chunk;
        }

        Ok(len)
    }
}

impl<S: ReadAt + WriteAt + Flush + StorageSize> Flush for SparseDisk<S> {
    fn flush(&self) -> Result<()> {
        self.file.flush()
    }
}

fn bitmap_get(bitmap: &[u8], sector_in_block: u64) -> bool {
    let byte = (sector_in_block / 8) as usize;
    let bit = 7 - (sector_in_block % 8) as u8;
    bitmap.get(byte).map_or(false, |b| b & (1 << bit) != 0)
}

fn bitmap_set(bitmap: &mut [u8], sector_in_block: u64) {
    let byte = (sector_in_block / 8) as usize;
    let bit = 7 - (sector_in_block % 8) as u8;
    if let Some(b) = bitmap.get_mut(byte) {
        *b |= 1 << bit;
    }
}

fn write_zeroes(file: &impl WriteAt, mut offset: u64, mut len: u64) -> Result<()> {
    const CHUNK: usize = 64 * 1024;
    let buf = [0_u8; CHUNK];
    while len > 0 {
        let n = (len as usize).min(CHUNK);
        file.write_all_at(offset, &buf[..n])?;
        offset += n as u64;
        len -= n as u64;
    }

    Ok(())
}

/// Creates a dynamic VHD of `size_bytes` at `destination`. Options are validated
/// before the file is touched, and a file left half-written by an I/O failure is
/// removed. An existing file at `destination` is never replaced.
pub fn create_sparse_disk<P: AsRef<Path>>(size_bytes: u64, destination: P, options: &CreateOptions) -> Result<()> {
    let (footer, header) = plan(size_bytes, options)?;

    let path = destination.as_ref();
    let file = VhdFile::create(path)?;
    let result = SparseDisk::create_with(file, footer, header).and_then(|disk| disk.flush());

    if let Err(e) = result {
        if let Err(rm) = std::fs::remove_file(path) {
            warn!("could not remove partial image {}: {}", path.display(), rm);
        }
        return Err(e);
    }

    Ok(())
}
