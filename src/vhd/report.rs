use std::fmt;
use serde::Serialize;

use crate::{sizes, Result};

use super::sparse::{VhdHeader, VhdParentLocator};
use super::{format_uuid, format_vhd_timestamp, DiskType, FooterSource, ParsedImage, VhdFooter, HD_TEMPORARY};

/// Stored CHS triple and the byte size it implies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeometryReport {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
    pub implied_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FooterReport {
    pub cookie: String,
    pub features: u32,
    pub temporary: bool,
    pub format_version: String,
    pub data_offset: u64,
    pub timestamp: u32,
    pub created: String,
    pub creator_application: String,
    pub creator_version: String,
    pub creator_os: String,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: GeometryReport,
    /// `None` when the stored value is not a known disk type.
    pub disk_type: Option<DiskType>,
    pub disk_type_raw: u32,
    pub checksum: u32,
    pub checksum_valid: bool,
    pub uuid: String,
    pub saved_state: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatorReport {
    pub index: usize,
    pub code: String,
    pub data_space: u32,
    pub data_len: u32,
    pub data_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DynamicHeaderReport {
    pub cookie: String,
    pub data_offset: u64,
    pub table_offset: u64,
    pub header_version: String,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub bitmap_size: u32,
    pub checksum: u32,
    pub checksum_valid: bool,
    pub parent_uuid: String,
    pub parent_timestamp: u32,
    pub parent_modified: String,
    /// Only decoded for differencing disks.
    pub parent_name: Option<String>,
    pub parent_locators: Vec<LocatorReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatedBlock {
    pub block: usize,
    pub sector: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatReport {
    pub entries: usize,
    pub allocated: Vec<AllocatedBlock>,
}

/// Flat, serializable view of a [`ParsedImage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VhdReport {
    pub file_size: u64,
    pub footer_source: FooterSource,
    pub footers_identical: Option<bool>,
    pub other_footer_checksum_valid: Option<bool>,
    pub footer: FooterReport,
    pub dynamic_header: Option<DynamicHeaderReport>,
    pub dynamic_header_error: Option<String>,
    pub bat: Option<BatReport>,
    pub bat_error: Option<String>,
}

fn version(v: u32) -> String {
    format!("{}.{}", v >> 16, v & 0xFFFF)
}

impl FooterReport {
    fn new(footer: &VhdFooter, checksum_valid: bool) -> Result<Self> {
        let geometry = &footer.geometry;

        Ok(FooterReport {
            cookie: footer.cookie(),
            features: footer.features,
            temporary: footer.features & HD_TEMPORARY != 0,
            format_version: version(footer.ff_version),
            data_offset: footer.data_offset,
            timestamp: footer.timestamp,
            created: format_vhd_timestamp(footer.timestamp)?,
            creator_application: footer.crtr_app(),
            creator_version: version(footer.crtr_ver),
            creator_os: footer.crtr_os(),
            original_size: footer.original_size(),
            current_size: footer.current_size(),
            geometry: GeometryReport {
                cylinders: geometry.cylinders,
                heads: geometry.heads,
                sectors_per_track: geometry.sectors_per_track,
                implied_size: footer.geometry().capacity(),
            },
            disk_type: footer.disk_type(),
            disk_type_raw: footer.disk_type,
            checksum: footer.checksum,
            checksum_valid,
            uuid: format_uuid(footer.uuid()),
            saved_state: footer.saved != 0,
        })
    }
}

impl LocatorReport {
    fn new(index: usize, loc: &VhdParentLocator) -> Self {
        LocatorReport {
            index,
            code: loc.code_str(),
            data_space: loc.data_space,
            data_len: loc.data_len,
            data_offset: loc.data_offset,
        }
    }
}

impl DynamicHeaderReport {
    fn new(header: &VhdHeader, checksum_valid: bool, differencing: bool) -> Result<Self> {
        let parent_locators = header
            .prt_loc()
            .iter()
            .enumerate()
            .filter(|(_, loc)| loc.is_used())
            .map(|(index, loc)| LocatorReport::new(index, loc))
            .collect();

        Ok(DynamicHeaderReport {
            cookie: header.cookie(),
            data_offset: header.data_offset,
            table_offset: header.table_offset(),
            header_version: version(header.hdr_ver),
            max_table_entries: header.max_bat_size(),
            block_size: header.block_size(),
            bitmap_size: header.bitmap_size(),
            checksum: header.checksum,
            checksum_valid,
            parent_uuid: format_uuid(&header.prt_uuid),
            parent_timestamp: header.prt_ts,
            parent_modified: format_vhd_timestamp(header.prt_ts)?,
            parent_name: differencing.then(|| header.prt_name()),
            parent_locators,
        })
    }
}

impl VhdReport {
    /// Pretty-printed JSON form of the report.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl ParsedImage {
    pub fn report(&self) -> Result<VhdReport> {
        let differencing = self.footer.inner.disk_type() == Some(DiskType::Differential);

        let (dynamic_header, dynamic_header_error) = match &self.header {
            Some(Ok(h)) => (Some(DynamicHeaderReport::new(&h.inner, h.checksum_valid, differencing)?), None),
            Some(Err(e)) => (None, Some(e.to_string())),
            None => (None, None),
        };

        let (bat, bat_error) = match &self.bat {
            Some(Ok(bat)) => {
                let allocated = bat
                    .allocated()
                    .map(|(block, sector)| AllocatedBlock {
                        block,
                        sector,
                        offset: sector as u64 * sizes::SECTOR_U64,
                    })
                    .collect();
                (Some(BatReport { entries: bat.entries(), allocated }), None)
            }
            Some(Err(e)) => (None, Some(e.to_string())),
            None => (None, None),
        };

        Ok(VhdReport {
            file_size: self.file_size,
            footer_source: self.footer_source,
            footers_identical: self.footers_identical,
            other_footer_checksum_valid: self.other_footer.as_ref().map(|f| f.checksum_valid),
            footer: FooterReport::new(&self.footer.inner, self.footer.checksum_valid)?,
            dynamic_header,
            dynamic_header_error,
            bat,
            bat_error,
        })
    }
}

fn validity(valid: bool) -> &'static str {
    if valid {
        "valid"
    } else {
        "INVALID"
    }
}

impl fmt::Display for FooterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VHD Footer Summary:\n-------------------\n")?;

        let disk_type = match self.disk_type {
            Some(t) => t.to_string(),
            None => format!("Unrecognized ({})", self.disk_type_raw),
        };

        writeln!(f, "{:<20}: {}", "Cookie", self.cookie)?;
        writeln!(f, "{:<20}: {:#010X}{}", "Features", self.features, if self.temporary { " (temporary)" } else { "" })?;
        writeln!(f, "{:<20}: {}", "File format version", self.format_version)?;
        writeln!(f, "{:<20}: {:#018X}", "Data offset", self.data_offset)?;
        writeln!(f, "{:<20}: {} ({})", "Timestamp", self.created, self.timestamp)?;
        writeln!(f, "{:<20}: {}", "Creator Application", self.creator_application)?;
        writeln!(f, "{:<20}: {}", "Creator version", self.creator_version)?;
        writeln!(f, "{:<20}: {}", "Creator OS", self.creator_os)?;
        writeln!(f, "{:<20}: {} Mb, ({} bytes)", "Original disk size", self.original_size >> 20, self.original_size)?;
        writeln!(f, "{:<20}: {} Mb, ({} bytes)", "Current disk size", self.current_size >> 20, self.current_size)?;
        writeln!(
            f,
            "{:<20}: Cyl: {}, Hds: {}, Sctrs: {}",
            "Geometry", self.geometry.cylinders, self.geometry.heads, self.geometry.sectors_per_track
        )?;
        writeln!(f, "{:<20}: {} bytes", "Geometry size", self.geometry.implied_size)?;
        writeln!(f, "{:<20}: {}", "Disk type", disk_type)?;
        writeln!(f, "{:<20}: {:#010X} ({})", "Checksum", self.checksum, validity(self.checksum_valid))?;
        writeln!(f, "{:<20}: {}", "UUID", self.uuid)?;
        writeln!(f, "{:<20}: {}", "Saved state", if self.saved_state { "Yes" } else { "No" })
    }
}

impl fmt::Display for DynamicHeaderReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VHD Header Summary:\n-------------------\n")?;

        writeln!(f, "{:<20}: {}", "Cookie", self.cookie)?;
        writeln!(f, "{:<20}: {:#018X}", "Data offset (unused)", self.data_offset)?;
        writeln!(f, "{:<20}: {:#018X}", "Table offset", self.table_offset)?;
        writeln!(f, "{:<20}: {}", "Header version", self.header_version)?;
        writeln!(f, "{:<20}: {}", "Max BAT size", self.max_table_entries)?;
        writeln!(f, "{:<20}: {} Mb, ({} bytes)", "Block size", self.block_size >> 20, self.block_size)?;
        writeln!(f, "{:<20}: {} bytes", "Bitmap size", self.bitmap_size)?;
        writeln!(f, "{:<20}: {:#010X} ({})", "Checksum", self.checksum, validity(self.checksum_valid))?;
        writeln!(f, "{:<20}: {}", "Parent UUID", self.parent_uuid)?;
        writeln!(f, "{:<20}: {} ({})", "Parent timestamp", self.parent_modified, self.parent_timestamp)?;

        if let Some(name) = &self.parent_name {
            writeln!(f, "{:<20}: {}", "Parent name", name)?;
        }

        for loc in &self.parent_locators {
            writeln!(f, "{:<20}: {}", "Locator", loc.index)?;
            writeln!(f, "{:^20}: {}", "code", loc.code)?;
            writeln!(f, "{:^20}: {:#010X} bytes", "data_space", loc.data_space)?;
            writeln!(f, "{:^20}: {:#010X} bytes", "data_length", loc.data_len)?;
            writeln!(f, "{:^20}: {:#018X}", "data_offset", loc.data_offset)?;
        }

        Ok(())
    }
}

impl fmt::Display for VhdReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.footer_source {
            FooterSource::Head => "offset 0",
            FooterSource::Tail => "end of file (head copy unusable)",
        };
        writeln!(f, "{:<20}: {} bytes", "File size", self.file_size)?;
        writeln!(f, "{:<20}: {}", "Footer read from", source)?;
        if let Some(identical) = self.footers_identical {
            writeln!(f, "{:<20}: {}", "Footer copies", if identical { "identical" } else { "DIFFER" })?;
        }
        writeln!(f)?;

        write!(f, "{}", self.footer)?;

        if let Some(header) = &self.dynamic_header {
            writeln!(f)?;
            write!(f, "{}", header)?;
        }
        if let Some(err) = &self.dynamic_header_error {
            writeln!(f)?;
            writeln!(f, "{:<20}: {}", "Dynamic header", err)?;
        }

        if let Some(bat) = &self.bat {
            writeln!(f)?;
            f.write_str("VHD BAT Summary:\n-------------------\n")?;
            writeln!(f, "{:<20}: {} of {}", "Allocated blocks", bat.allocated.len(), bat.entries)?;
            for block in &bat.allocated {
                writeln!(f, "{:^20}: sector {:#010X}, offset {:#X}", block.block, block.sector, block.offset)?;
            }
        }
        if let Some(err) = &self.bat_error {
            writeln!(f)?;
            writeln!(f, "{:<20}: {}", "BAT", err)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhd::sparse::{PLAT_CODE_W2KU, PLAT_CODE_W2RU};
    use crate::vhd::{Checksummed, HD_TEMPORARY};

    fn differencing_image() -> ParsedImage {
        let footer = VhdFooter::new(4 << 20, DiskType::Differential, [3; 16], 31_536_000);

        let mut header = VhdHeader::new(2, 1536, 2 << 20);
        for (i, unit) in "base.vhd".encode_utf16().enumerate() {
            header.prt_name[i * 2..i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
        }
        header.prt_loc[0].code = PLAT_CODE_W2KU;
        header.prt_loc[0].data_space = 1;
        header.prt_loc[0].data_len = 16;
        header.prt_loc[0].data_offset = 0x800;
        header.prt_loc[3].code = PLAT_CODE_W2RU;
        header.prt_ts = 31_622_400;
        header.update_checksum();

        ParsedImage {
            file_size: 4096,
            footer: Checksummed { inner: footer, checksum_valid: true },
            footer_source: FooterSource::Head,
            footers_identical: Some(true),
            other_footer: None,
            header: Some(Ok(Checksummed { inner: header, checksum_valid: true })),
            bat: None,
        }
    }

    #[test]
    fn differencing_parent_fields() {
        let report = differencing_image().report().unwrap();
        assert_eq!(report.footer.created, "2000-12-31T00:00:00Z");
        assert_eq!(report.footer.format_version, "1.0");

        let header = report.dynamic_header.unwrap();
        assert_eq!(header.parent_timestamp, 31_622_400);
        assert_eq!(header.parent_modified, "2001-01-01T00:00:00Z");
        assert_eq!(header.parent_name.as_deref(), Some("base.vhd"));
        assert_eq!(header.parent_locators.len(), 2);
        assert_eq!(header.parent_locators[0].code, "W2ku");
        assert_eq!(header.parent_locators[0].data_offset, 0x800);
        assert_eq!(header.parent_locators[1].index, 3);
        assert_eq!(header.parent_locators[1].code, "W2ru");
    }

    #[test]
    fn dynamic_disk_has_no_parent_name() {
        let mut image = differencing_image();
        image.footer.inner.disk_type = DiskType::Dynamic.raw();
        let report = image.report().unwrap();
        assert_eq!(report.dynamic_header.unwrap().parent_name, None);
    }

    #[test]
    fn text_report_rows() {
        let mut image = differencing_image();
        image.footer.checksum_valid = false;
        image.footer.inner.features |= HD_TEMPORARY;
        let text = image.report().unwrap().to_string();

        assert!(text.contains("Disk type           : Differencing"));
        assert!(text.contains("(INVALID)"));
        assert!(text.contains("(temporary)"));
        assert!(text.contains("Parent name         : base.vhd"));
        assert!(text.contains("Timestamp           : 2000-12-31T00:00:00Z (31536000)"));
        assert!(text.contains("Parent timestamp    : 2001-01-01T00:00:00Z (31622400)"));
    }

    #[test]
    fn json_report_fields() {
        let report = differencing_image().report().unwrap();
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["footer_source"], "head");
        assert_eq!(json["footer"]["disk_type"], "Differential");
        assert_eq!(json["footer"]["current_size"], 4 << 20);
        assert_eq!(json["footer"]["geometry"]["heads"], 4);
        assert_eq!(json["dynamic_header"]["parent_name"], "base.vhd");
        assert_eq!(json["dynamic_header"]["parent_modified"], "2001-01-01T00:00:00Z");
        assert!(json["bat"].is_null());
    }

    #[test]
    fn json_text_matches_value() {
        let report = differencing_image().report().unwrap();
        let text = report.to_json().unwrap();
        assert!(text.contains("\n  \"footer_source\": \"head\""));

        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, serde_json::to_value(&report).unwrap());
    }
}
