//! Microsoft VHD images: footer and dynamic-header codec, CHS geometry, block
//! allocation table, a sparse (dynamic) disk writer and an image inspector.
#[macro_use]
extern crate num_derive;

mod error;
pub use error::{AllocationError, FormatError, VhdError};
pub type Result<T> = std::result::Result<T, VhdError>;

pub use uuid::Uuid;

mod traits;
pub use traits::*;

mod util;
pub use util::*;

mod geometry;
pub use geometry::*;

mod math;
pub use math::*;

pub mod vhd;
pub use vhd::*;

pub mod sizes {
    pub const SECTOR: u32 = 512;
    pub const SECTOR_U64: u64 = SECTOR as u64;
    pub const KIB: u64 = 1024;
    pub const MIB: u64 = 1024 * KIB;
    pub const GIB: u64 = 1024 * MIB;
}

/* Layout of a dynamic disk:
 *
 * +-------------------------------------------------+
 * | Mirror image of HD footer (hd_ftr) (512 bytes)  |
 * +-------------------------------------------------+
 * | Sparse drive header (dd_hdr) (1024 bytes)       |
 * +-------------------------------------------------+
 * | BAT (Block allocation table)                    |
 * |   - Array of absolute sector offsets into the   |
 * |     file (u32).                                 |
 * |   - Rounded up to a sector boundary.            |
 * |   - Unused entries are marked as 0xFFFFFFFF     |
 * |   - max entries in dd_hdr->max_bat_size         |
 * +-------------------------------------------------+
 * | Data Block 0                                    |
 * | Bitmap (padded to 512 byte sector boundary)     |
 * |   - one bit per data sector, MSB first          |
 * | Data                                            |
 * |   - power-of-two multiple of sectors.           |
 * |   - default 2MB (4096 * 512)                    |
 * +-------------------------------------------------+
 * | Data Block 1                                    |
 * +-------------------------------------------------+
 * | ...                                             |
 * +-------------------------------------------------+
 * | Data Block n                                    |
 * +-------------------------------------------------+
 * | HD Footer (512 bytes)                           |
 * +-------------------------------------------------+
 *
 * New blocks are appended where the trailing footer sits, and the footer is
 * rewritten after them.
 */
