use crate::util::{read_be_u16, read_be_u32, read_be_u64, read_fixed, write_be_u16, write_be_u32, write_be_u64};
use crate::{geometry, sizes, FormatError, Geometry, Result, ReadAt, WriteAt};
use super::{compute_checksum, DiskType, FOOTER_SIZE};

/// Decoded structure plus the result of checking its stored checksum.
/// A mismatch never stops decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksummed<T> {
    pub inner: T,
    pub checksum_valid: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

/// Hard disk footer. The same 512 bytes sit at offset 0 and at the end of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdFooter {
    // Identifies original creator of the disk
    pub cookie: [u8; 8],
    // Feature Support
    pub features: u32,
    // (major,minor) version of disk file
    pub ff_version: u32,
    // Abs. offset from SOF to next structure
    pub data_offset: u64,
    // Creation time.  secs since 1/1/2000GMT
    pub timestamp: u32,
    // Creator application
    pub crtr_app: [u8; 4],
    // Creator version (major,minor)
    pub crtr_ver: u32,
    // Creator host OS
    pub crtr_os: [u8; 4],
    // Size at creation (bytes)
    pub orig_size: u64,
    // Current size of disk (bytes)
    pub curr_size: u64,
    // Disk geometry
    pub geometry: DiskGeometry,
    // Disk type, raw so unknown values survive decoding
    pub disk_type: u32,
    // 1's comp sum of this struct
    pub checksum: u32,
    // Unique disk ID, used for naming parents
    pub uuid: [u8; 16],
    // one-bit -- is this disk/VM in a saved state
    pub saved: u8,
    // padding
    pub reserved: [u8; 427],
}

/// VHD cookie string
pub const HD_COOKIE: [u8; 8] = *b"conectix";

/// Feature fields in VhdFooter
pub const HD_NO_FEATURES: u32 = 0x0000_0000;
pub const HD_TEMPORARY: u32 = 0x0000_0001;
pub const HD_RESERVED: u32 = 0x0000_0002;

/// Version field in VhdFooter
pub const HD_FF_VERSION: u32 = 0x0001_0000;

pub const HD_CR_OS_WINDOWS: [u8; 4] = *b"Wi2k";
pub const HD_CR_OS_MAC: [u8; 4] = *b"Mac ";

pub const HD_CR_APP: [u8; 4] = *b"rvhd";
pub const HD_CR_VERSION: u32 = 0x0001_0000;

/// Data offset of disks without a dynamic header.
pub const HD_NO_DATA_OFFSET: u64 = 0xFFFF_FFFF_FFFF_FFFF;

// Field offsets.
const OFF_COOKIE: usize = 0;
const OFF_FEATURES: usize = 8;
const OFF_FF_VERSION: usize = 12;
const OFF_DATA_OFFSET: usize = 16;
const OFF_TIMESTAMP: usize = 24;
const OFF_CRTR_APP: usize = 28;
const OFF_CRTR_VER: usize = 32;
const OFF_CRTR_OS: usize = 36;
const OFF_ORIG_SIZE: usize = 40;
const OFF_CURR_SIZE: usize = 48;
const OFF_CYLINDERS: usize = 56;
const OFF_HEADS: usize = 58;
const OFF_SECTORS: usize = 59;
const OFF_DISK_TYPE: usize = 60;
pub(crate) const OFF_CHECKSUM: usize = 64;
const OFF_UUID: usize = 68;
const OFF_SAVED: usize = 84;
const OFF_RESERVED: usize = 85;

impl VhdFooter {
    /// Footer for a new disk of `size` bytes. The checksum is already filled in.
    pub fn new(size: u64, disk_type: DiskType, uuid: [u8; 16], timestamp: u32) -> Self {
        let data_offset = match disk_type {
            DiskType::Dynamic | DiskType::Differential => sizes::SECTOR_U64,
            _ => HD_NO_DATA_OFFSET,
        };

        let (cylinders, heads, sectors_per_track) = geometry::derive_geometry(size);

        let mut footer = VhdFooter {
            cookie: HD_COOKIE,
            features: HD_RESERVED,
            ff_version: HD_FF_VERSION,
            data_offset,
            timestamp,
            crtr_app: HD_CR_APP,
            crtr_ver: HD_CR_VERSION,
            crtr_os: HD_CR_OS_WINDOWS,
            orig_size: size,
            curr_size: size,
            geometry: DiskGeometry { cylinders, heads, sectors_per_track },
            disk_type: disk_type.raw(),
            checksum: 0,
            uuid,
            saved: 0,
            reserved: [0_u8; 427],
        };
        footer.update_checksum();

        footer
    }

    /// Decodes 512 bytes. Only a wrong cookie or a short buffer is an error.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Checksummed<Self>, FormatError> {
        if bytes.len() < FOOTER_SIZE {
            return Err(FormatError::Truncated {
                structure: "footer",
                expected: FOOTER_SIZE,
                actual: bytes.len(),
            });
        }
        let raw = &bytes[..FOOTER_SIZE];

        let cookie = read_fixed::<8>(raw, OFF_COOKIE);
        if cookie != HD_COOKIE {
            return Err(FormatError::BadCookie { structure: "footer", found: cookie });
        }

        let footer = VhdFooter {
            cookie,
            features: read_be_u32(raw, OFF_FEATURES),
            ff_version: read_be_u32(raw, OFF_FF_VERSION),
            data_offset: read_be_u64(raw, OFF_DATA_OFFSET),
            timestamp: read_be_u32(raw, OFF_TIMESTAMP),
            crtr_app: read_fixed(raw, OFF_CRTR_APP),
            crtr_ver: read_be_u32(raw, OFF_CRTR_VER),
            crtr_os: read_fixed(raw, OFF_CRTR_OS),
            orig_size: read_be_u64(raw, OFF_ORIG_SIZE),
            curr_size: read_be_u64(raw, OFF_CURR_SIZE),
            geometry: DiskGeometry {
                cylinders: read_be_u16(raw, OFF_CYLINDERS),
                heads: raw[OFF_HEADS],
                sectors_per_track: raw[OFF_SECTORS],
            },
            disk_type: read_be_u32(raw, OFF_DISK_TYPE),
            checksum: read_be_u32(raw, OFF_CHECKSUM),
            uuid: read_fixed(raw, OFF_UUID),
            saved: raw[OFF_SAVED],
            reserved: read_fixed(raw, OFF_RESERVED),
        };

        let checksum_valid = compute_checksum(raw, OFF_CHECKSUM) == footer.checksum;

        Ok(Checksummed { inner: footer, checksum_valid })
    }

    /// Big-endian image of the footer with a freshly computed checksum.
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut raw = self.encode_fields();
        let checksum = compute_checksum(&raw, OFF_CHECKSUM);
        write_be_u32(&mut raw, OFF_CHECKSUM, checksum);
        raw
    }

    fn encode_fields(&self) -> [u8; FOOTER_SIZE] {
        let mut raw = [0_u8; FOOTER_SIZE];
        raw[OFF_COOKIE..OFF_COOKIE + 8].copy_from_slice(&self.cookie);
        write_be_u32(&mut raw, OFF_FEATURES, self.features);
        write_be_u32(&mut raw, OFF_FF_VERSION, self.ff_version);
        write_be_u64(&mut raw, OFF_DATA_OFFSET, self.data_offset);
        write_be_u32(&mut raw, OFF_TIMESTAMP, self.timestamp);
        raw[OFF_CRTR_APP..OFF_CRTR_APP + 4].copy_from_slice(&self.crtr_app);
        write_be_u32(&mut raw, OFF_CRTR_VER, self.crtr_ver);
        raw[OFF_CRTR_OS..OFF_CRTR_OS + 4].copy_from_slice(&self.crtr_os);
        write_be_u64(&mut raw, OFF_ORIG_SIZE, self.orig_size);
        write_be_u64(&mut raw, OFF_CURR_SIZE, self.curr_size);
        write_be_u16(&mut raw, OFF_CYLINDERS, self.geometry.cylinders);
        raw[OFF_HEADS] = self.geometry.heads;
        raw[OFF_SECTORS] = self.geometry.sectors_per_track;
        write_be_u32(&mut raw, OFF_DISK_TYPE, self.disk_type);
        raw[OFF_UUID..OFF_UUID + 16].copy_from_slice(&self.uuid);
        raw[OFF_SAVED] = self.saved;
        raw[OFF_RESERVED..].copy_from_slice(&self.reserved);
        raw
    }

    /// Brings the in-memory checksum in line with the other fields.
    pub fn update_checksum(&mut self) {
        self.checksum = compute_checksum(&self.encode_fields(), OFF_CHECKSUM);
    }

    pub fn read(stream: &impl ReadAt, pos: u64) -> Result<Checksummed<Self>> {
        let mut raw = [0_u8; FOOTER_SIZE];
        stream.read_exact_at(pos, &mut raw)?;
        Ok(Self::decode(&raw)?)
    }

    pub fn write(&self, stream: &impl WriteAt, pos: u64) -> Result<()> {
        stream.write_all_at(pos, &self.encode())
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::chs(
            self.geometry.cylinders as u64,
            self.geometry.heads as u32,
            self.geometry.sectors_per_track as u32,
        )
    }

    pub fn uuid(&self) -> &[u8; 16] {
        &self.uuid
    }

    pub fn original_size(&self) -> u64 {
        self.orig_size
    }

    pub fn current_size(&self) -> u64 {
        self.curr_size
    }

    /// `None` for values outside the known disk types.
    pub fn disk_type(&self) -> Option<DiskType> {
        DiskType::from_raw(self.disk_type)
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn cookie(&self) -> String {
        String::from_utf8_lossy(&self.cookie).into_owned()
    }

    pub fn crtr_app(&self) -> String {
        super::fourcc(&self.crtr_app)
    }

    pub fn crtr_os(&self) -> String {
        super::fourcc(&self.crtr_os)
    }
}
