use log::debug;
use crate::traits::{ReadAt, WriteAt};
use crate::{math, sizes, AllocationError, Result};

/// Block allocation table: one big-endian sector number per logical block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdBat {
    bat: Vec<u32>,
    // Absolute byte offset of the table itself
    table_offset: u64,
    // Sectors per block region (bitmap + data)
    block_sectors: u64,
}

/// Unallocated BAT entry.
pub const DD_BLOCK_UNUSED: u32 = 0xFFFF_FFFF;

impl VhdBat {
    /// Table with every entry unallocated.
    pub fn new(entries: u32, table_offset: u64, block_size: u32) -> Self {
        VhdBat {
            bat: vec![DD_BLOCK_UNUSED; entries as usize],
            table_offset,
            block_sectors: Self::region_sectors(block_size),
        }
    }

    pub fn read(stream: &impl ReadAt, table_offset: u64, entries: u32, block_size: u32) -> Result<Self> {
        let mut buffer = vec![0_u8; entries as usize * 4];
        stream.read_exact_at(table_offset, &mut buffer)?;

        let bat = buffer
            .chunks_exact(4)
            .map(|entry| u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]))
            .collect();

        Ok(VhdBat {
            bat,
            table_offset,
            block_sectors: Self::region_sectors(block_size),
        })
    }

    fn region_sectors(block_size: u32) -> u64 {
        let bitmap = super::header::bitmap_size(block_size) as u64;
        (bitmap + block_size as u64) / sizes::SECTOR_U64
    }

    /// Bytes occupied on disk, the table is always extended to a sector boundary.
    pub fn size_on_disk(&self) -> u64 {
        math::round_up(self.bat.len() as u64 * 4, sizes::SECTOR_U64)
    }

    pub fn entries(&self) -> usize {
        self.bat.len()
    }

    fn check_index(&self, index: usize) -> std::result::Result<(), AllocationError> {
        if index >= self.bat.len() {
            return Err(AllocationError::OutOfRange {
                block: index,
                entries: self.bat.len(),
            });
        }

        Ok(())
    }

    /// Sector where block `index` starts, `None` while unallocated.
    pub fn lookup(&self, index: usize) -> std::result::Result<Option<u32>, AllocationError> {
        self.check_index(index)?;

        Ok(match self.bat[index] {
            DD_BLOCK_UNUSED => None,
            sector => Some(sector),
        })
    }

    /// Records block `index` at `end_of_file` (rounded up to a sector) and returns
    /// the sector number. New blocks only ever go after the BAT and after every
    /// block already allocated.
    pub fn allocate(&mut self, index: usize, end_of_file: u64) -> std::result::Result<u32, AllocationError> {
        if let Some(sector) = self.lookup(index)? {
            return Err(AllocationError::AlreadyAllocated { block: index, sector });
        }

        let offset = math::checked_round_up(end_of_file, sizes::SECTOR_U64).ok_or(AllocationError::OffsetOverflow)?;
        let sector = offset / sizes::SECTOR_U64;

        if sector < self.first_free_sector() {
            return Err(AllocationError::Overlap { block: index, sector });
        }

        let sector = u32::try_from(sector)
            .ok()
            .filter(|s| *s != DD_BLOCK_UNUSED)
            .ok_or(AllocationError::OffsetOverflow)?;

        self.bat[index] = sector;
        debug!("bat: block {} allocated at sector {:#010x}", index, sector);

        Ok(sector)
    }

    /// Forgets the allocation of block `index`, used to undo an append whose
    /// region never made it to disk.
    pub(crate) fn release(&mut self, index: usize) {
        if let Some(entry) = self.bat.get_mut(index) {
            debug!("bat: block {} released from sector {:#010x}", index, *entry);
            *entry = DD_BLOCK_UNUSED;
        }
    }

    /// First sector past the BAT and past the highest allocated block region.
    pub fn first_free_sector(&self) -> u64 {
        let bat_end = (self.table_offset + self.size_on_disk()) / sizes::SECTOR_U64;

        self.allocated()
            .map(|(_, sector)| sector as u64 + self.block_sectors)
            .fold(bat_end, u64::max)
    }

    /// `(block index, sector)` of every allocated block, in index order.
    pub fn allocated(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.bat
            .iter()
            .enumerate()
            .filter(|(_, sector)| **sector != DD_BLOCK_UNUSED)
            .map(|(index, sector)| (index, *sector))
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated().count()
    }

    /// Rewrites the whole table, padding with unused entries to the sector boundary.
    pub fn persist(&self, stream: &impl WriteAt) -> Result<usize> {
        let size = self.size_on_disk() as usize;
        let mut buffer = vec![0xFF_u8; size];
        for (chunk, entry) in buffer.chunks_exact_mut(4).zip(&self.bat) {
            chunk.copy_from_slice(&entry.to_be_bytes());
        }

        stream.write_all_at(self.table_offset, &buffer)?;
        debug!("bat: persisted {} entries at {:#x}", self.bat.len(), self.table_offset);

        Ok(buffer.len())
    }

    /// Writes the single entry for block `index`.
    pub fn persist_entry(&self, stream: &impl WriteAt, index: usize) -> Result<()> {
        self.check_index(index)?;

        let pos = self.table_offset + 4 * index as u64;
        stream.write_all_at(pos, &self.bat[index].to_be_bytes())
    }
}
