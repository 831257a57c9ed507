//! NTFS on-disk engine.
//!
//! Everything under this module is read-only and synchronous. Callers hold
//! the volume lock (see [`crate::volume`]) for the duration of each call.

pub mod attribute;
pub mod boot;
pub mod filename;
pub mod index;
pub mod inode;
pub mod mft;
pub mod path;
pub mod record;
pub mod runlist;
pub mod time;
pub mod upcase;

use crate::device::Disk;

pub use attribute::AttributeStream;
pub use boot::BootSector;
pub use index::{DirectoryIndex, IndexCursor, IndexEntry};
pub use inode::{FileAttributes, Inode, InodeCache, InodeId};
pub use mft::MftReader;
pub use record::{Attribute, FileRecord, MftReference};
pub use time::NtfsTime;
pub use upcase::UpcaseTable;

// Well-known MFT record numbers
pub const MFT_RECORD_MFT: u64 = 0;
pub const MFT_RECORD_MFT_MIRR: u64 = 1;
pub const MFT_RECORD_VOLUME: u64 = 3;
pub const MFT_RECORD_ROOT: u64 = 5;
pub const MFT_RECORD_BITMAP: u64 = 6;
pub const MFT_RECORD_UPCASE: u64 = 10;
/// Records below this number are reserved for metafiles.
pub const MFT_RECORD_FIRST_USER: u64 = 16;

// Attribute type codes
pub const ATTR_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_ATTRIBUTE_LIST: u32 = 0x20;
pub const ATTR_FILE_NAME: u32 = 0x30;
pub const ATTR_VOLUME_NAME: u32 = 0x60;
pub const ATTR_VOLUME_INFORMATION: u32 = 0x70;
pub const ATTR_DATA: u32 = 0x80;
pub const ATTR_INDEX_ROOT: u32 = 0x90;
pub const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
pub const ATTR_BITMAP: u32 = 0xB0;
pub const ATTR_END: u32 = 0xFFFF_FFFF;

/// Name of the filename index on directories.
pub const I30: &str = "$I30";

/// Stride of the update sequence array, independent of the sector size.
pub const USA_STRIDE: usize = 512;

/// Everything needed to read metadata from a mounted volume.
pub struct Ntfs {
    pub disk: Disk,
    pub boot: BootSector,
    pub mft: MftReader,
    pub upcase: UpcaseTable,
}

impl Ntfs {
    /// Read the boot sector, bootstrap `$MFT` and load `$UpCase`.
    pub fn open(mut disk: Disk) -> crate::error::Result<Self> {
        let mut sector = vec![0u8; 512.max(disk.block_size())];
        disk.read_at(0, &mut sector)?;
        let boot = BootSector::parse(&sector)?;
        log::debug!(
            "ntfs: {} bytes/cluster, MFT at LCN {}, {} byte records, {} byte index blocks",
            boot.cluster_size(),
            boot.mft_lcn,
            boot.mft_record_size,
            boot.index_record_size
        );

        let mft = MftReader::bootstrap(&mut disk, &boot)?;
        let upcase = UpcaseTable::load(&mut disk, &mft)?;
        Ok(Self {
            disk,
            boot,
            mft,
            upcase,
        })
    }

    pub fn load_record(&mut self, reference: MftReference) -> crate::error::Result<FileRecord> {
        self.mft.load(&mut self.disk, reference)
    }
}

/// Decode a UTF-16LE byte slice into code units.
pub(crate) fn utf16_units(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}
