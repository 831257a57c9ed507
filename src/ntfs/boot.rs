use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::error::{corrupt, NtfsError, Result};

/// NTFS boot sector (BIOS parameter block + NTFS extension).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    pub mft_record_size: u32,
    pub index_record_size: u32,
    pub serial_number: u64,
}

impl BootSector {
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < 512 {
            return Err(corrupt("boot sector shorter than 512 bytes"));
        }
        // OEM ID: "NTFS    " at offset 3
        if !is_ntfs(sector) {
            return Err(NtfsError::Unsupported(
                "not an NTFS volume (OEM ID mismatch)".into(),
            ));
        }
        if sector[510] != 0x55 || sector[511] != 0xAA {
            return Err(corrupt("boot sector signature 0x55AA missing"));
        }

        let bytes_per_sector = LittleEndian::read_u16(&sector[0x0B..0x0D]) as u32;
        if !(256..=4096).contains(&bytes_per_sector) || !bytes_per_sector.is_power_of_two() {
            return Err(corrupt(format!(
                "invalid NTFS bytes per sector: {bytes_per_sector}"
            )));
        }

        let sectors_per_cluster = decode_sectors_per_cluster(sector[0x0D])?;
        let cluster_size = bytes_per_sector * sectors_per_cluster;

        // Reserved sectors and FAT count must be zero on NTFS
        if LittleEndian::read_u16(&sector[0x0E..0x10]) != 0 || sector[0x10] != 0 {
            return Err(corrupt("non-zero reserved sectors or FAT count"));
        }

        let total_sectors = LittleEndian::read_u64(&sector[0x28..0x30]);
        let mft_lcn = LittleEndian::read_u64(&sector[0x30..0x38]);
        let mft_mirror_lcn = LittleEndian::read_u64(&sector[0x38..0x40]);

        let mft_record_size = decode_record_size(sector[0x40] as i8, cluster_size)
            .ok_or_else(|| corrupt(format!("invalid clusters per MFT record: {:#x}", sector[0x40])))?;
        let index_record_size = decode_record_size(sector[0x44] as i8, cluster_size)
            .ok_or_else(|| corrupt(format!("invalid clusters per index record: {:#x}", sector[0x44])))?;

        if mft_record_size < 512 || (mft_record_size as usize) % super::USA_STRIDE != 0 {
            return Err(corrupt(format!("MFT record size {mft_record_size} too small")));
        }
        if index_record_size < 512 || (index_record_size as usize) % super::USA_STRIDE != 0 {
            return Err(corrupt(format!("index record size {index_record_size} too small")));
        }

        // MFTs must be within bounds
        let nclusters = total_sectors / sectors_per_cluster as u64;
        if mft_lcn >= nclusters {
            return Err(corrupt(format!(
                "MFT LCN {mft_lcn:#x} beyond volume ({nclusters:#x} clusters)"
            )));
        }
        if mft_mirror_lcn >= nclusters {
            // The mirror is never read; a bad value only deserves a warning
            warn!("boot sector: MFT mirror LCN {mft_mirror_lcn:#x} >= {nclusters:#x} clusters");
        }

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors,
            mft_lcn,
            mft_mirror_lcn,
            mft_record_size,
            index_record_size,
            serial_number: LittleEndian::read_u64(&sector[0x48..0x50]),
        })
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / self.sectors_per_cluster as u64
    }

    pub fn total_size(&self) -> u64 {
        self.total_sectors * self.bytes_per_sector as u64
    }
}

/// Check if a boot sector contains NTFS magic.
pub fn is_ntfs(boot_sector: &[u8]) -> bool {
    boot_sector.len() >= 11 && &boot_sector[3..11] == b"NTFS    "
}

/// Sectors per cluster: either a plain power of two up to 128, or (newer
/// formats with clusters above 64 KiB) `256 - n` encoding a shift.
fn decode_sectors_per_cluster(raw: u8) -> Result<u32> {
    let spc = match raw {
        0 => 0,
        1..=0x80 => raw as u32,
        0xF4..=0xFF => 1u32 << (256 - raw as u32),
        _ => 0,
    };
    if spc == 0 || !spc.is_power_of_two() {
        return Err(corrupt(format!("invalid NTFS sectors per cluster: {raw:#x}")));
    }
    Ok(spc)
}

/// Clusters per record: if negative, record size = 2^|value| bytes.
fn decode_record_size(raw: i8, cluster_size: u32) -> Option<u32> {
    match raw {
        0 => None,
        r if r < 0 => {
            let shift = (-(r as i32)) as u32;
            if shift > 31 {
                None
            } else {
                Some(1u32 << shift)
            }
        }
        r => (r as u32).checked_mul(cluster_size),
    }
}
