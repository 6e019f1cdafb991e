use std::time::{SystemTime, UNIX_EPOCH};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use crate::{FormatError, Result, Uuid, VhdError};

/// One's complement of the byte sum of `bytes`, with the 4-byte checksum field at
/// `checksum_offset` counted as zero.
pub fn compute_checksum(bytes: &[u8], checksum_offset: usize) -> u32 {
    let field = checksum_offset..checksum_offset + 4;

    let sum = bytes
        .iter()
        .enumerate()
        .filter(|(i, _)| !field.contains(i))
        .fold(0_u32, |sum, (_, b)| sum.wrapping_add(*b as u32));

    !sum
}

/// VHD uses an epoch of 12:00AM, Jan 1, 2000. This is the Unix timestamp for the start of the VHD epoch.
pub const VHD_EPOCH_START: u32 = 9_4668_4800;

pub const FOOTER_SIZE: usize = 512;
pub const HEADER_SIZE: usize = 1024;
pub const DEFAULT_HEADER_OFFSET: u64 = FOOTER_SIZE as u64;
pub const DEFAULT_TABLE_OFFSET: u64 = DEFAULT_HEADER_OFFSET + HEADER_SIZE as u64;

pub(crate) fn vhd_time_now() -> u32 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_secs().saturating_sub(VHD_EPOCH_START as u64).min(u32::MAX as u64) as u32,
        Err(_) => 0,
    }
}

/// Converts Unix seconds to VHD-epoch seconds.
pub fn unix_to_vhd_timestamp(unix: i64) -> Result<u32> {
    unix.checked_sub(VHD_EPOCH_START as i64)
        .and_then(|secs| u32::try_from(secs).ok())
        .ok_or(VhdError::InvalidTimestamp(unix))
}

/// The stored value counts seconds from 2000-01-01T00:00:00Z, not from the Unix epoch.
pub fn vhd_timestamp_to_calendar(timestamp: u32) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(VHD_EPOCH_START as i64 + timestamp as i64)
}

/// RFC 3339 rendering, e.g. `2000-01-01T00:00:00Z`.
pub fn format_vhd_timestamp(timestamp: u32) -> Result<String> {
    Ok(vhd_timestamp_to_calendar(timestamp).format(&Rfc3339)?)
}

/// Lowercase `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`, bytes in on-disk order.
pub fn format_uuid(bytes: &[u8; 16]) -> String {
    Uuid::from_bytes(*bytes).to_string()
}

pub fn parse_uuid(s: &str) -> Result<[u8; 16]> {
    let uuid = Uuid::parse_str(s.trim()).map_err(|_| VhdError::InvalidUuid(s.to_string()))?;
    Ok(*uuid.as_bytes())
}

/// Decodes a null-padded UTF-16BE buffer. Decoding stops at the first null or
/// unpaired surrogate; a dangling odd byte becomes U+FFFD.
pub fn decode_utf16be_padded(bytes: &[u8]) -> String {
    let mut terminated = false;
    let mut units = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let unit = u16::from_be_bytes([pair[0], pair[1]]);
        if unit == 0 {
            terminated = true;
            break;
        }
        units.push(unit);
    }

    let mut name = String::with_capacity(units.len());
    for ch in char::decode_utf16(units) {
        match ch {
            Ok(c) => name.push(c),
            Err(_) => {
                terminated = true;
                break;
            }
        }
    }

    if !terminated && bytes.len() % 2 == 1 {
        name.push(char::REPLACEMENT_CHARACTER);
    }

    name
}

/// Four-character tags such as the creator application ("rvhd") or host OS ("Wi2k").
pub fn fourcc(tag: &[u8; 4]) -> String {
    String::from_utf8_lossy(tag).trim_end_matches('\0').to_string()
}

pub mod footer;
pub use footer::*;

pub mod sparse;
pub use sparse::*;

pub mod image;
pub use image::*;

pub mod report;
pub use report::*;

#[derive(Debug, Copy, Clone, FromPrimitive, ToPrimitive, Eq, PartialEq, Serialize)]
pub enum DiskType {
    None = 0,
    Deprecated = 1,
    Fixed = 2,
    Dynamic = 3,
    Differential = 4,
    Reserved5 = 5,
    Reserved6 = 6,
}

impl DiskType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        num_traits::FromPrimitive::from_u32(raw)
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Dynamic and differencing disks carry a dynamic-disk header and a BAT.
    pub fn is_sparse(self) -> bool {
        matches!(self, DiskType::Dynamic | DiskType::Differential)
    }
}

impl TryFrom<u32> for DiskType {
    type Error = FormatError;

    fn try_from(raw: u32) -> std::result::Result<Self, Self::Error> {
        Self::from_raw(raw).ok_or(FormatError::UnknownDiskType(raw))
    }
}

impl std::fmt::Display for DiskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DiskType::None => "None",
            DiskType::Deprecated => "Deprecated",
            DiskType::Fixed => "Fixed",
            DiskType::Dynamic => "Dynamic",
            DiskType::Differential => "Differencing",
            DiskType::Reserved5 | DiskType::Reserved6 => "Reserved",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_skips_field() {
        let mut buf = [0_u8; 16];
        buf[0] = 1;
        buf[15] = 2;
        assert_eq!(compute_checksum(&buf, 4), !3_u32);

        buf[4..8].copy_from_slice(&[0xFF; 4]);
        assert_eq!(compute_checksum(&buf, 4), !3_u32);
    }

    #[test]
    fn checksum_sum_wraps_not_crc() {
        let buf = vec![0xFF_u8; 1024];
        let expected = !(0xFF_u32 * 1020);
        assert_eq!(compute_checksum(&buf, 36), expected);
    }

    #[test]
    fn timestamps_use_2000_epoch() {
        assert_eq!(format_vhd_timestamp(0).unwrap(), "2000-01-01T00:00:00Z");
        // 2000 is a leap year, so 365 days land on Dec 31.
        assert_eq!(format_vhd_timestamp(31_536_000).unwrap(), "2000-12-31T00:00:00Z");
        assert_eq!(format_vhd_timestamp(31_622_400).unwrap(), "2001-01-01T00:00:00Z");
        assert_eq!(vhd_timestamp_to_calendar(0).unix_timestamp(), 946_684_800);
    }

    #[test]
    fn unix_timestamp_conversion() {
        assert_eq!(unix_to_vhd_timestamp(946_684_800).unwrap(), 0);
        assert_eq!(unix_to_vhd_timestamp(978_307_200).unwrap(), 31_622_400);
        assert!(matches!(unix_to_vhd_timestamp(0), Err(VhdError::InvalidTimestamp(0))));
    }

    #[test]
    fn unix_timestamp_extremes_are_rejected() {
        assert!(matches!(unix_to_vhd_timestamp(i64::MIN), Err(VhdError::InvalidTimestamp(i64::MIN))));
        assert!(matches!(unix_to_vhd_timestamp(i64::MAX), Err(VhdError::InvalidTimestamp(i64::MAX))));
        let last = VHD_EPOCH_START as i64 + u32::MAX as i64;
        assert_eq!(unix_to_vhd_timestamp(last).unwrap(), u32::MAX);
        assert!(unix_to_vhd_timestamp(last + 1).is_err());
    }

    #[test]
    fn uuid_format_and_parse() {
        let bytes = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef,
        ];
        let s = format_uuid(&bytes);
        assert_eq!(s, "12345678-9abc-def0-0123-456789abcdef");
        assert_eq!(parse_uuid(&s).unwrap(), bytes);
        assert_eq!(parse_uuid("12345678-9ABC-DEF0-0123-456789ABCDEF").unwrap(), bytes);
        assert!(matches!(parse_uuid("not-a-uuid"), Err(VhdError::InvalidUuid(_))));
    }

    #[test]
    fn utf16_names() {
        let mut buf = [0_u8; 16];
        for (i, unit) in "base.vhd".encode_utf16().take(7).enumerate() {
            buf[i * 2..i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
        }
        assert_eq!(decode_utf16be_padded(&buf), "base.vh");

        // no terminator, odd trailing byte
        assert_eq!(decode_utf16be_padded(&[0x00, 0x41, 0x00]), "A\u{FFFD}");

        // stops at a lone surrogate
        assert_eq!(decode_utf16be_padded(&[0x00, 0x41, 0xD8, 0x00, 0x00, 0x42]), "A");

        assert_eq!(decode_utf16be_padded(&[]), "");
    }

    #[test]
    fn disk_type_from_raw() {
        assert_eq!(DiskType::from_raw(3), Some(DiskType::Dynamic));
        assert_eq!(DiskType::from_raw(4), Some(DiskType::Differential));
        assert_eq!(DiskType::from_raw(7), None);
        assert!(DiskType::Differential.is_sparse());
        assert!(!DiskType::Fixed.is_sparse());
        assert_eq!(DiskType::Dynamic.raw(), 3);
        assert_eq!(DiskType::try_from(7), Err(FormatError::UnknownDiskType(7)));
    }

    #[test]
    fn fourcc_tags() {
        assert_eq!(fourcc(b"Wi2k"), "Wi2k");
        assert_eq!(fourcc(b"tim\0"), "tim");
    }
}
