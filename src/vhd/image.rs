use std::path::Path;
use log::{debug, warn};
use serde::Serialize;

use crate::{sizes, FormatError, ReadAt, Result, StorageSize, VhdFile};

use super::sparse::{VhdBat, VhdHeader};
use super::{Checksummed, VhdFooter, FOOTER_SIZE, HEADER_SIZE};

/// Which copy of the footer an image was described from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FooterSource {
    Head,
    Tail,
}

/// Everything decoded from an image, read-only. Structure-level failures past the
/// footer are kept alongside what did decode.
#[derive(Debug, Clone)]
pub struct ParsedImage {
    pub file_size: u64,
    pub footer: Checksummed<VhdFooter>,
    pub footer_source: FooterSource,
    /// Byte comparison of the two footer copies, `None` when the file is too
    /// small to hold both.
    pub footers_identical: Option<bool>,
    /// The footer copy that was not used, when it decodes.
    pub other_footer: Option<Checksummed<VhdFooter>>,
    /// Dynamic-disk header, only looked for on dynamic and differencing disks.
    pub header: Option<std::result::Result<Checksummed<VhdHeader>, FormatError>>,
    pub bat: Option<std::result::Result<VhdBat, FormatError>>,
}

fn read_footer_bytes<S: ReadAt>(source: &S, pos: u64) -> Result<[u8; FOOTER_SIZE]> {
    let mut raw = [0_u8; FOOTER_SIZE];
    source.read_exact_at(pos, &mut raw)?;
    Ok(raw)
}

impl ParsedImage {
    pub fn open<S: ReadAt + StorageSize>(source: &S) -> Result<Self> {
        let file_size = source.storage_size()?;
        if file_size < FOOTER_SIZE as u64 {
            return Err(FormatError::Truncated {
                structure: "footer",
                expected: FOOTER_SIZE,
                actual: file_size as usize,
            }
            .into());
        }

        let tail_pos = file_size - FOOTER_SIZE as u64;
        let head_raw = read_footer_bytes(source, 0)?;
        let tail_raw = if tail_pos >= FOOTER_SIZE as u64 {
            Some(read_footer_bytes(source, tail_pos)?)
        } else {
            None
        };

        let head = VhdFooter::decode(&head_raw);
        let tail = tail_raw.as_ref().map(|raw| VhdFooter::decode(raw));
        let footers_identical = tail_raw.map(|raw| raw == head_raw);

        let (footer, footer_source, other_footer) = match (head, tail) {
            (Ok(head), tail) => (head, FooterSource::Head, tail.and_then(|t| t.ok())),
            (Err(FormatError::BadCookie { .. }), Some(Ok(tail))) => {
                warn!("no footer at offset 0, using the copy at {:#x}", tail_pos);
                (tail, FooterSource::Tail, None)
            }
            (Err(e), _) => return Err(e.into()),
        };

        if !footer.checksum_valid {
            warn!("footer checksum mismatch");
        }
        if footer.inner.disk_type().is_none() {
            warn!("unrecognized disk type {}", footer.inner.disk_type);
        }

        let mut image = ParsedImage {
            file_size,
            footer,
            footer_source,
            footers_identical,
            other_footer,
            header: None,
            bat: None,
        };

        if image.is_sparse() {
            image.header = Some(image.read_header(source)?);
            image.bat = image.read_bat(source)?;
        }

        Ok(image)
    }

    pub fn is_sparse(&self) -> bool {
        self.footer.inner.disk_type().map_or(false, |t| t.is_sparse())
    }

    fn read_header<S: ReadAt>(&self, source: &S) -> Result<std::result::Result<Checksummed<VhdHeader>, FormatError>> {
        let pos = self.footer.inner.data_offset();
        let end = pos.checked_add(HEADER_SIZE as u64);
        if end.map_or(true, |end| end > self.file_size) {
            return Ok(Err(FormatError::Truncated {
                structure: "dynamic header",
                expected: HEADER_SIZE,
                actual: self.file_size.saturating_sub(pos) as usize,
            }));
        }

        let mut raw = vec![0_u8; HEADER_SIZE];
        source.read_exact_at(pos, &mut raw)?;

        let header = VhdHeader::decode(&raw);
        match &header {
            Ok(h) if !h.checksum_valid => warn!("dynamic header checksum mismatch"),
            Ok(_) => {}
            Err(e) => warn!("dynamic header at {:#x}: {}", pos, e),
        }

        Ok(header)
    }

    fn read_bat<S: ReadAt>(&self, source: &S) -> Result<Option<std::result::Result<VhdBat, FormatError>>> {
        let header = match &self.header {
            Some(Ok(header)) => &header.inner,
            _ => return Ok(None),
        };

        let len = header.max_bat_size() as u64 * 4;
        let end = header.table_offset().checked_add(len);
        if end.map_or(true, |end| end > self.file_size) {
            return Ok(Some(Err(FormatError::Truncated {
                structure: "BAT",
                expected: len as usize,
                actual: self.file_size.saturating_sub(header.table_offset()) as usize,
            })));
        }

        let bat = VhdBat::read(source, header.table_offset(), header.max_bat_size(), header.block_size())?;
        debug!("bat: {} of {} blocks allocated", bat.allocated_count(), bat.entries());

        Ok(Some(Ok(bat)))
    }

    /// Byte size implied by the stored CHS geometry, not the footer's size fields.
    pub fn geometry_size(&self) -> u64 {
        self.footer.inner.geometry().capacity()
    }

    pub fn sector_count(&self) -> u64 {
        self.footer.inner.current_size() / sizes::SECTOR_U64
    }
}

/// Decodes `source` and builds its report.
pub fn open_and_report<S: ReadAt + StorageSize>(source: &S) -> Result<super::VhdReport> {
    ParsedImage::open(source)?.report()
}

/// [`open_and_report`] on a file opened read-only.
pub fn inspect_file<P: AsRef<Path>>(path: P) -> Result<super::VhdReport> {
    let file = VhdFile::open(path)?;

    open_and_report(&file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhd::{create_sparse_disk, CreateOptions, DiskType, SparseDisk, DD_BLOCK_UNUSED};
    use crate::{MemFile, VhdError, VhdFile};

    const SIZE: u64 = 10_485_760;

    fn scenario_a(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("disk.vhd");
        create_sparse_disk(SIZE, &path, &CreateOptions::default()).unwrap();
        path
    }

    #[test]
    fn fresh_dynamic_disk_reports_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = scenario_a(&dir);

        let report = inspect_file(&path).unwrap();
        assert_eq!(report.footer.disk_type, Some(DiskType::Dynamic));
        assert_eq!(report.footer.original_size, SIZE);
        assert_eq!(report.footer.current_size, SIZE);
        assert!(report.footer.checksum_valid);
        assert_eq!(report.footer_source, FooterSource::Head);
        assert_eq!(report.footers_identical, Some(true));

        let header = report.dynamic_header.as_ref().unwrap();
        assert_eq!(header.max_table_entries, 5);
        assert_eq!(header.block_size, 2 << 20);
        assert!(header.checksum_valid);
        assert_eq!(report.dynamic_header_error, None);

        let bat = report.bat.as_ref().unwrap();
        assert_eq!(bat.entries, 5);
        assert!(bat.allocated.is_empty());
    }

    #[test]
    fn first_block_write_is_visible_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = scenario_a(&dir);

        {
            let disk = SparseDisk::open(VhdFile::open_rw(&path).unwrap()).unwrap();
            disk.write_logical_block(0, &[0xFF; 512], &vec![0x5A; 2 << 20]).unwrap();
            crate::Flush::flush(&disk).unwrap();
        }

        let file = VhdFile::open(&path).unwrap();
        let image = ParsedImage::open(&file).unwrap();
        let bat = image.bat.clone().unwrap().unwrap();
        let sector = bat.lookup(0).unwrap().unwrap();
        assert_ne!(sector, DD_BLOCK_UNUSED);
        for index in 1..5 {
            assert_eq!(bat.lookup(index).unwrap(), None);
        }

        let region_end = sector as u64 * 512 + 512 + (2 << 20);
        assert_eq!(image.file_size, region_end + 512);
        assert_eq!(image.footers_identical, Some(true));

        let report = image.report().unwrap();
        let allocated = &report.bat.unwrap().allocated;
        assert_eq!(allocated.len(), 1);
        assert_eq!(allocated[0].block, 0);
        assert_eq!(allocated[0].sector, sector);
    }

    #[test]
    fn reserved_byte_corruption_only_breaks_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = scenario_a(&dir);
        let clean = inspect_file(&path).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        raw[200] ^= 0x01;
        std::fs::write(&path, &raw).unwrap();

        let report = inspect_file(&path).unwrap();
        assert!(!report.footer.checksum_valid);
        assert_eq!(report.footers_identical, Some(false));

        let mut expected = clean.footer.clone();
        expected.checksum_valid = false;
        assert_eq!(report.footer, expected);
        assert_eq!(report.dynamic_header, clean.dynamic_header);
    }

    #[test]
    fn bad_head_cookie_uses_tail() {
        let disk = SparseDisk::create(MemFile::new(), SIZE, &CreateOptions::default()).unwrap();
        let mut raw = disk.into_inner().into_inner();
        raw[..8].copy_from_slice(b"garbage!");

        let image = ParsedImage::open(&MemFile::from(raw.clone())).unwrap();
        assert_eq!(image.footer_source, FooterSource::Tail);
        assert!(image.footer.checksum_valid);
        assert!(image.header.as_ref().unwrap().is_ok());

        let tail = raw.len() - 512;
        raw[tail..tail + 8].copy_from_slice(b"garbage!");
        assert!(matches!(
            ParsedImage::open(&MemFile::from(raw)),
            Err(VhdError::Format(FormatError::BadCookie { structure: "footer", .. }))
        ));
    }

    #[test]
    fn fixed_disk_footer_only_at_end() {
        let size = 1 << 20;
        let mut raw = vec![0_u8; size + 512];
        let footer = VhdFooter::new(size as u64, DiskType::Fixed, [7; 16], 0);
        raw[size..].copy_from_slice(&footer.encode());

        let report = open_and_report(&MemFile::from(raw)).unwrap();
        assert_eq!(report.footer_source, FooterSource::Tail);
        assert_eq!(report.footer.disk_type, Some(DiskType::Fixed));
        assert!(report.dynamic_header.is_none());
        assert!(report.bat.is_none());
        assert_eq!(report.footer.geometry.cylinders, 30);
        assert_eq!(report.footer.geometry.implied_size, 30 * 4 * 17 * 512);
    }

    #[test]
    fn header_problems_do_not_abort() {
        let disk = SparseDisk::create(MemFile::new(), SIZE, &CreateOptions::default()).unwrap();
        let mut raw = disk.into_inner().into_inner();
        raw[512..520].copy_from_slice(b"notspars");

        let report = open_and_report(&MemFile::from(raw)).unwrap();
        assert!(report.footer.checksum_valid);
        assert!(report.dynamic_header.is_none());
        assert!(report.dynamic_header_error.unwrap().contains("cookie"));
        assert!(report.bat.is_none());
    }

    #[test]
    fn bat_past_end_of_file_is_reported() {
        let disk = SparseDisk::create(MemFile::new(), SIZE, &CreateOptions::default()).unwrap();
        let mut raw = disk.into_inner().into_inner();
        let mut header = VhdHeader::decode(&raw[512..1536]).unwrap().inner;
        header.table_offset = 1 << 30;
        header.update_checksum();
        raw[512..1536].copy_from_slice(&header.encode());

        let image = ParsedImage::open(&MemFile::from(raw)).unwrap();
        assert!(matches!(image.bat, Some(Err(FormatError::Truncated { structure: "BAT", .. }))));
        assert!(image.report().unwrap().bat_error.is_some());
    }

    #[test]
    fn unknown_disk_type_is_marked() {
        let mut footer = VhdFooter::new(SIZE, DiskType::Fixed, [1; 16], 0);
        footer.disk_type = 9;
        footer.update_checksum();
        let mut raw = vec![0_u8; 4096];
        raw[..512].copy_from_slice(&footer.encode());
        raw[4096 - 512..].copy_from_slice(&footer.encode());

        let report = open_and_report(&MemFile::from(raw)).unwrap();
        assert_eq!(report.footer.disk_type, None);
        assert_eq!(report.footer.disk_type_raw, 9);
        assert!(report.to_string().contains("Unrecognized (9)"));
    }

    #[test]
    fn tiny_source_is_truncated() {
        assert!(matches!(
            ParsedImage::open(&MemFile::from(vec![0_u8; 100])),
            Err(VhdError::Format(FormatError::Truncated { structure: "footer", .. }))
        ));
    }
}
