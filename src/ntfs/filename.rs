//! `$FILE_NAME` and `$STANDARD_INFORMATION` attribute values.

use byteorder::{ByteOrder, LittleEndian};

use super::record::MftReference;
use super::time::NtfsTime;
use super::utf16_units;
use crate::error::{corrupt, Result};

/// Set in `$FILE_NAME` file attributes when the file has a `$I30` index.
pub const FILE_NAME_INDEX_PRESENT: u32 = 0x1000_0000;

/// Filename namespace of a `$FILE_NAME` attribute or index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Posix,
    Win32,
    Dos,
    Win32AndDos,
}

impl Namespace {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Posix),
            1 => Some(Self::Win32),
            2 => Some(Self::Dos),
            3 => Some(Self::Win32AndDos),
            _ => None,
        }
    }

    /// An 8.3 alias that shadows a separate long name.
    pub fn is_dos_only(self) -> bool {
        self == Self::Dos
    }

    /// Lower is better for display.
    fn display_rank(self) -> u8 {
        match self {
            Self::Win32 | Self::Win32AndDos => 0,
            Self::Posix => 1,
            Self::Dos => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameAttr {
    pub parent: MftReference,
    pub creation_time: NtfsTime,
    pub modification_time: NtfsTime,
    pub mft_change_time: NtfsTime,
    pub access_time: NtfsTime,
    pub allocated_size: u64,
    pub data_size: u64,
    pub file_attributes: u32,
    pub namespace: Namespace,
    pub name: Vec<u16>,
}

fn time_at(value: &[u8], offset: usize) -> NtfsTime {
    NtfsTime(LittleEndian::read_i64(&value[offset..offset + 8]))
}

impl FileNameAttr {
    pub fn parse(value: &[u8]) -> Result<Self> {
        if value.len() < 0x42 {
            return Err(corrupt(format!("$FILE_NAME value too short: {}", value.len())));
        }
        let name_len = value[0x40] as usize;
        let namespace = Namespace::from_u8(value[0x41])
            .ok_or_else(|| corrupt(format!("unknown filename namespace {}", value[0x41])))?;
        let end = 0x42 + name_len * 2;
        if end > value.len() {
            return Err(corrupt("$FILE_NAME name out of bounds"));
        }

        Ok(Self {
            parent: MftReference::from_raw(LittleEndian::read_u64(&value[0x00..0x08])),
            creation_time: time_at(value, 0x08),
            modification_time: time_at(value, 0x10),
            mft_change_time: time_at(value, 0x18),
            access_time: time_at(value, 0x20),
            allocated_size: LittleEndian::read_u64(&value[0x28..0x30]),
            data_size: LittleEndian::read_u64(&value[0x30..0x38]),
            file_attributes: LittleEndian::read_u32(&value[0x38..0x3C]),
            namespace,
            name: utf16_units(&value[0x42..end]),
        })
    }

    pub fn name_string(&self) -> String {
        String::from_utf16_lossy(&self.name)
    }

    pub fn is_directory(&self) -> bool {
        self.file_attributes & FILE_NAME_INDEX_PRESENT != 0
    }
}

/// Pick the name to show for a file with several `$FILE_NAME`s: a Win32
/// name over POSIX over DOS.
pub fn preferred_name<'a, I>(names: I) -> Option<&'a FileNameAttr>
where
    I: IntoIterator<Item = &'a FileNameAttr>,
{
    names
        .into_iter()
        .min_by_key(|n| n.namespace.display_rank())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StandardInformation {
    pub creation_time: NtfsTime,
    pub modification_time: NtfsTime,
    pub mft_change_time: NtfsTime,
    pub access_time: NtfsTime,
    pub file_attributes: u32,
}

impl StandardInformation {
    pub fn parse(value: &[u8]) -> Result<Self> {
        // NTFS 1.2 layout is 0x30 bytes; 3.x appends owner/security ids
        if value.len() < 0x24 {
            return Err(corrupt(format!(
                "$STANDARD_INFORMATION value too short: {}",
                value.len()
            )));
        }
        Ok(Self {
            creation_time: time_at(value, 0x00),
            modification_time: time_at(value, 0x08),
            mft_change_time: time_at(value, 0x10),
            access_time: time_at(value, 0x18),
            file_attributes: LittleEndian::read_u32(&value[0x20..0x24]),
        })
    }
}
