use crate::util::{read_be_u32, read_be_u64, read_fixed, write_be_u32, write_be_u64};
use crate::vhd::{compute_checksum, decode_utf16be_padded, fourcc, Checksummed, HEADER_SIZE};
use crate::{sizes, FormatError, ReadAt, Result, WriteAt};

/// Parent locator entry. Kept as an opaque record: nothing here walks a parent chain.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct VhdParentLocator {
    // Platform code -- see defines below
    pub code: u32,
    // Number of 512-byte sectors to store locator
    pub data_space: u32,
    // Actual length of parent locator in bytes
    pub data_len: u32,
    // Must be zero
    pub res: u32,
    // Absolute offset of locator data (bytes)
    pub data_offset: u64,
}

pub const PLAT_CODE_NONE: u32 = 0x0000_0000;
/// Windows relative path (UTF-16) litter endian (W2ru)
pub const PLAT_CODE_W2RU: u32 = 0x5732_7275;
/// Windows absolute path (UTF-16) litter endian (W2ku)
pub const PLAT_CODE_W2KU: u32 = 0x5732_6B75;

const LOCATOR_SIZE: usize = 24;
const LOCATOR_COUNT: usize = 8;

impl VhdParentLocator {
    fn decode(raw: &[u8]) -> Self {
        VhdParentLocator {
            code: read_be_u32(raw, 0),
            data_space: read_be_u32(raw, 4),
            data_len: read_be_u32(raw, 8),
            res: read_be_u32(raw, 12),
            data_offset: read_be_u64(raw, 16),
        }
    }

    fn encode(&self, raw: &mut [u8]) {
        write_be_u32(raw, 0, self.code);
        write_be_u32(raw, 4, self.data_space);
        write_be_u32(raw, 8, self.data_len);
        write_be_u32(raw, 12, self.res);
        write_be_u64(raw, 16, self.data_offset);
    }

    pub fn is_used(&self) -> bool {
        self.code != PLAT_CODE_NONE
    }

    pub fn code_str(&self) -> String {
        fourcc(&self.code.to_be_bytes())
    }
}

/// Dynamic disk header, located by the footer's data offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdHeader {
    // Should contain "cxsparse"
    pub cookie: [u8; 8],
    // Byte offset of next record. (Unused) 0xffs
    pub data_offset: u64,
    // Absolute offset to the BAT
    pub table_offset: u64,
    // Version of the dd_hdr (major,minor)
    pub hdr_ver: u32,
    // Maximum number of entries in the BAT
    pub max_bat_size: u32,
    // Block size in bytes. Must be power of 2
    pub block_size: u32,
    // Header checksum.  1's comp of all fields
    pub checksum: u32,
    // ID of the parent disk
    pub prt_uuid: [u8; 16],
    // Modification time of the parent disk
    pub prt_ts: u32,
    // Reserved
    pub res1: u32,
    // Parent unicode name, UTF-16BE
    pub prt_name: [u8; 512],
    // Parent locator entries
    pub prt_loc: [VhdParentLocator; LOCATOR_COUNT],
    // Reserved
    pub res2: [u8; 256],
}

/// (Unused) 0xffs
pub const DD_OFFSET: u64 = 0xFFFF_FFFF_FFFF_FFFF;
/// VHD cookie string
pub const DD_COOKIE: [u8; 8] = *b"cxsparse";
/// Version field in VhdHeader
pub const DD_VERSION: u32 = 0x0001_0000;
/// Default blocksize is 2 meg
pub const DD_BLOCKSIZE_DEFAULT: u32 = 0x0020_0000;

const OFF_COOKIE: usize = 0;
const OFF_DATA_OFFSET: usize = 8;
const OFF_TABLE_OFFSET: usize = 16;
const OFF_HDR_VER: usize = 24;
const OFF_MAX_BAT_SIZE: usize = 28;
const OFF_BLOCK_SIZE: usize = 32;
const OFF_CHECKSUM: usize = 36;
const OFF_PRT_UUID: usize = 40;
const OFF_PRT_TS: usize = 56;
const OFF_RES1: usize = 60;
const OFF_PRT_NAME: usize = 64;
const OFF_PRT_LOC: usize = 576;
const OFF_RES2: usize = 768;

impl VhdHeader {
    /// Header for a dynamic disk without a parent. The checksum is already filled in.
    pub fn new(max_bat_size: u32, table_offset: u64, block_size: u32) -> Self {
        let mut header = VhdHeader {
            cookie: DD_COOKIE,
            data_offset: DD_OFFSET,
            table_offset,
            hdr_ver: DD_VERSION,
            max_bat_size,
            block_size,
            checksum: 0,
            prt_uuid: [0_u8; 16],
            prt_ts: 0,
            res1: 0,
            prt_name: [0_u8; 512],
            prt_loc: [VhdParentLocator::default(); LOCATOR_COUNT],
            res2: [0_u8; 256],
        };
        header.update_checksum();

        header
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Checksummed<Self>, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Truncated {
                structure: "dynamic header",
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let raw = &bytes[..HEADER_SIZE];

        let cookie = read_fixed::<8>(raw, OFF_COOKIE);
        if cookie != DD_COOKIE {
            return Err(FormatError::BadCookie { structure: "dynamic header", found: cookie });
        }

        let mut prt_loc = [VhdParentLocator::default(); LOCATOR_COUNT];
        for (index, loc) in prt_loc.iter_mut().enumerate() {
            let start = OFF_PRT_LOC + index * LOCATOR_SIZE;
            *loc = VhdParentLocator::decode(&raw[start..start + LOCATOR_SIZE]);
        }

        let header = VhdHeader {
            cookie,
            data_offset: read_be_u64(raw, OFF_DATA_OFFSET),
            table_offset: read_be_u64(raw, OFF_TABLE_OFFSET),
            hdr_ver: read_be_u32(raw, OFF_HDR_VER),
            max_bat_size: read_be_u32(raw, OFF_MAX_BAT_SIZE),
            block_size: read_be_u32(raw, OFF_BLOCK_SIZE),
            checksum: read_be_u32(raw, OFF_CHECKSUM),
            prt_uuid: read_fixed(raw, OFF_PRT_UUID),
            prt_ts: read_be_u32(raw, OFF_PRT_TS),
            res1: read_be_u32(raw, OFF_RES1),
            prt_name: read_fixed(raw, OFF_PRT_NAME),
            prt_loc,
            res2: read_fixed(raw, OFF_RES2),
        };

        let checksum_valid = compute_checksum(raw, OFF_CHECKSUM) == header.checksum;

        Ok(Checksummed { inner: header, checksum_valid })
    }

    /// Big-endian image of the header with a freshly computed checksum.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut raw = self.encode_fields();
        let checksum = compute_checksum(&raw, OFF_CHECKSUM);
        write_be_u32(&mut raw, OFF_CHECKSUM, checksum);
        raw
    }

    fn encode_fields(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0_u8; HEADER_SIZE];
        raw[OFF_COOKIE..OFF_COOKIE + 8].copy_from_slice(&self.cookie);
        write_be_u64(&mut raw, OFF_DATA_OFFSET, self.data_offset);
        write_be_u64(&mut raw, OFF_TABLE_OFFSET, self.table_offset);
        write_be_u32(&mut raw, OFF_HDR_VER, self.hdr_ver);
        write_be_u32(&mut raw, OFF_MAX_BAT_SIZE, self.max_bat_size);
        write_be_u32(&mut raw, OFF_BLOCK_SIZE, self.block_size);
        raw[OFF_PRT_UUID..OFF_PRT_UUID + 16].copy_from_slice(&self.prt_uuid);
        write_be_u32(&mut raw, OFF_PRT_TS, self.prt_ts);
        write_be_u32(&mut raw, OFF_RES1, self.res1);
        raw[OFF_PRT_NAME..OFF_PRT_LOC].copy_from_slice(&self.prt_name);
        for (index, loc) in self.prt_loc.iter().enumerate() {
            let start = OFF_PRT_LOC + index * LOCATOR_SIZE;
            loc.encode(&mut raw[start..start + LOCATOR_SIZE]);
        }
        raw[OFF_RES2..].copy_from_slice(&self.res2);
        raw
    }

    pub fn update_checksum(&mut self) {
        self.checksum = compute_checksum(&self.encode_fields(), OFF_CHECKSUM);
    }

    pub fn read(stream: &impl ReadAt, pos: u64) -> Result<Checksummed<Self>> {
        let mut raw = [0_u8; HEADER_SIZE];
        stream.read_exact_at(pos, &mut raw)?;
        Ok(Self::decode(&raw)?)
    }

    pub fn write(&self, stream: &impl WriteAt, pos: u64) -> Result<()> {
        stream.write_all_at(pos, &self.encode())
    }

    pub fn table_offset(&self) -> u64 {
        self.table_offset
    }

    pub fn max_bat_size(&self) -> u32 {
        self.max_bat_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Per-block sector bitmap size, rounded up to a whole sector.
    pub fn bitmap_size(&self) -> u32 {
        bitmap_size(self.block_size)
    }

    pub fn cookie(&self) -> String {
        String::from_utf8_lossy(&self.cookie).into_owned()
    }

    pub fn prt_name(&self) -> String {
        decode_utf16be_padded(&self.prt_name)
    }

    pub fn prt_loc(&self) -> &[VhdParentLocator] {
        &self.prt_loc
    }
}

/// One bit per data sector, padded to a sector boundary.
pub fn bitmap_size(block_size: u32) -> u32 {
    let sectors = block_size / sizes::SECTOR;
    crate::math::round_up(crate::math::ceil(sectors, 8).max(1), sizes::SECTOR)
}
