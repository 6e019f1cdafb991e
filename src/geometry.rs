use crate::sizes;

/// Largest CHS addressable capacity in sectors: 65535 cylinders, 16 heads, 255 sectors.
pub const MAX_CHS_SECTORS: u64 = 65535 * 16 * 255;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u64,
    pub heads: u32,
    pub sectors_per_track: u32,
    pub bytes_per_sector: u32,
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.bytes_per_sector == sizes::SECTOR {
            write!(f, "({}/{}/{})", self.cylinders, self.heads, self.sectors_per_track)
        } else {
            write!(f, "({}/{}/{}:{})", self.cylinders, self.heads, self.sectors_per_track, self.bytes_per_sector)
        }
    }
}

impl Geometry {
    pub fn chs(cylinders: u64, heads: u32, sectors_per_track: u32) -> Self {
        Geometry {
            cylinders,
            heads,
            sectors_per_track,
            bytes_per_sector: sizes::SECTOR,
        }
    }

    /// CHS approximation used by VHD footers. The product never exceeds `capacity`
    /// and, below the CHS maximum, stays within one cylinder of it.
    pub fn with_vhd_capacity(capacity: u64) -> Self {
        //                                      Cylinders   Heads    Sectors
        let total_sectors = (capacity / sizes::SECTOR_U64).min(MAX_CHS_SECTORS) as u32;

        let (heads_per_cylinder, sectors_per_track) = if total_sectors as u64 >= 65535 * 16 * 63 {
            (16, 255)
        } else {
            let mut sectors_per_track = 17_u32;
            let mut cylinders_times_heads = total_sectors / sectors_per_track;
            let mut heads_per_cylinder = (cylinders_times_heads + 1023) / 1024;

            if heads_per_cylinder < 4 {
                heads_per_cylinder = 4
            }

            if cylinders_times_heads >= heads_per_cylinder * 1024 || heads_per_cylinder > 16 {
                sectors_per_track = 31;
                heads_per_cylinder = 16;
                cylinders_times_heads = total_sectors / sectors_per_track;
            }

            if cylinders_times_heads >= heads_per_cylinder * 1024 {
                sectors_per_track = 63;
                heads_per_cylinder = 16;
            }

            (heads_per_cylinder, sectors_per_track)
        };

        let cylinders = total_sectors / sectors_per_track / heads_per_cylinder;

        Geometry::chs(cylinders as u64, heads_per_cylinder, sectors_per_track)
    }

    /// Bytes addressable through this geometry.
    pub fn capacity(&self) -> u64 {
        self.capacity_in_sectors() * (self.bytes_per_sector as u64)
    }

    pub fn capacity_in_sectors(&self) -> u64 {
        self.cylinders * (self.heads as u64) * (self.sectors_per_track as u64)
    }
}

/// `(cylinders, heads, sectors_per_track)` as stored in the footer.
pub fn derive_geometry(disk_byte_size: u64) -> (u16, u8, u8) {
    let geo = Geometry::with_vhd_capacity(disk_byte_size);
    (geo.cylinders as u16, geo.heads as u8, geo.sectors_per_track as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_bounds(size: u64) {
        let geo = Geometry::with_vhd_capacity(size);
        assert!(geo.capacity() <= size, "{} > {}", geo.capacity(), size);
        assert!(geo.cylinders <= 65535);

        if size <= sizes::SECTOR_U64 * MAX_CHS_SECTORS {
            let row = geo.heads as u64 * geo.sectors_per_track as u64 * sizes::SECTOR_U64;
            assert!(size - geo.capacity() < row + sizes::SECTOR_U64, "size {} geometry {}", size, geo);
        }
    }

    #[test]
    fn geometry_stays_within_capacity() {
        for size in [512_u64, 1 << 20, 10 << 20, 1 << 30, 127 << 30, 1 << 40] {
            check_bounds(size);
        }
    }

    #[test]
    fn known_geometries() {
        assert_eq!(derive_geometry(1 << 20), (30, 4, 17));
        assert_eq!(derive_geometry(1 << 30), (2080, 16, 63));
        assert_eq!(derive_geometry(512), (0, 4, 17));
    }

    #[test]
    fn large_disks_clamp() {
        let geo = Geometry::with_vhd_capacity(1 << 40);
        assert_eq!(geo, Geometry::chs(65535, 16, 255));
        assert_eq!(geo.capacity_in_sectors(), MAX_CHS_SECTORS);
    }

    #[test]
    fn display() {
        assert_eq!(Geometry::chs(30, 4, 17).to_string(), "(30/4/17)");
    }
}
