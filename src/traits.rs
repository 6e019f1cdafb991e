use crate::{Result, VhdError};

/// Positional read. Implementations keep their own cursor state behind `&self`.
pub trait ReadAt {
    fn read_at(&self, offset: u64, data: &mut [u8]) -> Result<usize>;

    fn read_exact_at(&self, mut offset: u64, mut data: &mut [u8]) -> Result<()> {
        while !data.is_empty() {
            match self.read_at(offset, data)? {
                0 => return Err(VhdError::UnexpectedEOD),
                n => {
                    data = &mut data[n..];
                    offset += n as u64;
                }
            }
        }

        Ok(())
    }
}

/// Positional write.
pub trait WriteAt {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize>;

    fn write_all_at(&self, mut offset: u64, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.write_at(offset, data)? {
                0 => return Err(VhdError::WriteZero),
                n => {
                    data = &data[n..];
                    offset += n as u64;
                }
            }
        }

        Ok(())
    }
}

pub trait Flush {
    fn flush(&self) -> Result<()>;
}

/// Length in bytes of the backing store.
pub trait StorageSize {
    fn storage_size(&self) -> Result<u64>;
}
