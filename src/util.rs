use crate::{traits, Result};
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{prelude::*, SeekFrom};
use std::path::Path;

// Big-endian field access over fixed-layout records. Callers pass offsets from
// their layout tables and guarantee `buf` covers the field.

pub fn read_be_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

pub fn read_be_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0_u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

pub fn read_be_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

pub fn read_fixed<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0_u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

pub fn write_be_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub fn write_be_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn write_be_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// vhd file open/create/size/read_at/write_at/flush
#[derive(Debug)]
pub struct VhdFile(RefCell<File>);

impl traits::ReadAt for VhdFile {
    fn read_at(&self, offset: u64, data: &mut [u8]) -> Result<usize> {
        let mut file = self.0.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.read(data).map_err(From::from)
    }
}

impl traits::WriteAt for VhdFile {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut file = self.0.borrow_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.write(data).map_err(From::from)
    }
}

impl traits::Flush for VhdFile {
    fn flush(&self) -> Result<()> {
        let mut file = self.0.borrow_mut();
        file.flush()?;
        file.sync_data().map_err(From::from)
    }
}

impl traits::StorageSize for VhdFile {
    fn storage_size(&self) -> Result<u64> {
        let metadata = self.0.borrow().metadata()?;
        Ok(metadata.len())
    }
}

impl VhdFile {
    /// Opens an existing image read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(VhdFile(RefCell::new(file)))
    }

    /// Opens an existing image for reading and writing.
    pub fn open_rw<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(VhdFile(RefCell::new(file)))
    }

    /// Creates a new image file opened for reading and writing. Fails if the
    /// path already exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        Ok(VhdFile(RefCell::new(file)))
    }
}

/// In-memory backing store. Writes past the end grow the buffer, zero-filling any gap.
#[derive(Debug, Default)]
pub struct MemFile(RefCell<Vec<u8>>);

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0.into_inner()
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

impl From<Vec<u8>> for MemFile {
    fn from(bytes: Vec<u8>) -> Self {
        MemFile(RefCell::new(bytes))
    }
}

impl traits::ReadAt for MemFile {
    fn read_at(&self, offset: u64, data: &mut [u8]) -> Result<usize> {
        let buffer = self.0.borrow();
        let len = buffer.len() as u64;
        if offset >= len {
            return Ok(0);
        }

        let start = offset as usize;
        let n = data.len().min(buffer.len() - start);
        data[..n].copy_from_slice(&buffer[start..start + n]);
        Ok(n)
    }
}

impl traits::WriteAt for MemFile {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut buffer = self.0.borrow_mut();
        let start = offset as usize;
        let end = start + data.len();
        if buffer.len() < end {
            buffer.resize(end, 0);
        }

        buffer[start..end].copy_from_slice(data);
        Ok(data.len())
    }
}

impl traits::Flush for MemFile {
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl traits::StorageSize for MemFile {
    fn storage_size(&self) -> Result<u64> {
        Ok(self.0.borrow().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReadAt, StorageSize, VhdError, WriteAt};

    #[test]
    fn be_fields_round_trip() {
        let mut buf = [0_u8; 16];
        write_be_u16(&mut buf, 0, 0x1326);
        write_be_u32(&mut buf, 2, 0xDEAD_BEEF);
        write_be_u64(&mut buf, 6, 0x0102_0304_0506_0708);

        assert_eq!(buf[..2], [0x13, 0x26]);
        assert_eq!(buf[2..6], [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(read_be_u16(&buf, 0), 0x1326);
        assert_eq!(read_be_u32(&buf, 2), 0xDEAD_BEEF);
        assert_eq!(read_be_u64(&buf, 6), 0x0102_0304_0506_0708);
        assert_eq!(read_fixed::<2>(&buf, 6), [0x01, 0x02]);
    }

    #[test]
    fn mem_file_grows_on_write() {
        let file = MemFile::new();
        file.write_all_at(4, &[1, 2]).unwrap();
        assert_eq!(file.storage_size().unwrap(), 6);
        assert_eq!(file.to_vec(), vec![0, 0, 0, 0, 1, 2]);

        let mut buf = [0xAA_u8; 4];
        assert_eq!(file.read_at(4, &mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2, 0xAA, 0xAA]);
    }

    #[test]
    fn read_exact_past_end_fails() {
        let file = MemFile::from(vec![0_u8; 8]);
        let mut buf = [0_u8; 4];
        assert!(matches!(
            file.read_exact_at(6, &mut buf),
            Err(VhdError::UnexpectedEOD)
        ));
    }

    #[test]
    fn vhd_file_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.bin");

        let file = VhdFile::create(&path).unwrap();
        file.write_all_at(510, &[0x55, 0xAA]).unwrap();
        traits::Flush::flush(&file).unwrap();
        drop(file);

        let file = VhdFile::open(&path).unwrap();
        assert_eq!(file.storage_size().unwrap(), 512);
        let mut sig = [0_u8; 2];
        file.read_exact_at(510, &mut sig).unwrap();
        assert_eq!(sig, [0x55, 0xAA]);

        let err = VhdFile::create(&path).unwrap_err();
        assert!(matches!(err, VhdError::Io(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 512);
    }
}
