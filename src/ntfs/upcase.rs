//! `$UpCase` table and filename collation.

use std::cmp::Ordering;

use log::{debug, warn};

use super::attribute::open_attribute;
use super::mft::MftReader;
use super::record::MftReference;
use super::{ATTR_DATA, MFT_RECORD_UPCASE};
use crate::device::Disk;
use crate::error::{corrupt, NtfsError, Result};

const UPCASE_UNITS: usize = 0x10000;

/// Maps every UTF-16 code unit to its upper-case form.
#[derive(Clone)]
pub struct UpcaseTable {
    table: Vec<u16>,
}

impl std::fmt::Debug for UpcaseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpcaseTable").finish_non_exhaustive()
    }
}

impl UpcaseTable {
    /// Load `$UpCase` from the volume, falling back to the built-in table
    /// when it is missing or malformed. Device errors still propagate.
    pub fn load(disk: &mut Disk, mft: &MftReader) -> Result<Self> {
        match Self::read_from_volume(disk, mft) {
            Ok(table) => {
                debug!("upcase: loaded $UpCase from volume");
                Ok(table)
            }
            Err(NtfsError::Device(e)) => Err(NtfsError::Device(e)),
            Err(e) => {
                warn!("upcase: $UpCase unusable ({e}), using built-in table");
                Ok(Self::builtin())
            }
        }
    }

    fn read_from_volume(disk: &mut Disk, mft: &MftReader) -> Result<Self> {
        let record = mft.load(disk, MftReference::new(MFT_RECORD_UPCASE, 0))?;
        if !record.is_in_use() {
            return Err(NtfsError::NotFound("$UpCase record not in use".into()));
        }
        let stream = open_attribute(disk, mft, &record, ATTR_DATA, "")?
            .ok_or_else(|| NtfsError::NotFound("$UpCase has no $DATA".into()))?;
        let bytes = stream.read_all(disk, (UPCASE_UNITS * 2) as u64)?;
        if bytes.len() != UPCASE_UNITS * 2 {
            return Err(corrupt(format!("$UpCase is {} bytes", bytes.len())));
        }
        Ok(Self {
            table: super::utf16_units(&bytes),
        })
    }

    /// Table derived from Unicode simple upper-casing of the BMP. Mappings
    /// that expand to several characters or leave the BMP are identity.
    pub fn builtin() -> Self {
        let table = (0..UPCASE_UNITS as u32)
            .map(|unit| {
                let Some(c) = char::from_u32(unit) else {
                    return unit as u16;
                };
                let mut upper = c.to_uppercase();
                match (upper.next(), upper.next()) {
                    (Some(u), None) if (u as u32) < 0x10000 => u as u32 as u16,
                    _ => unit as u16,
                }
            })
            .collect();
        Self { table }
    }

    pub fn upcase(&self, unit: u16) -> u16 {
        self.table[unit as usize]
    }

    /// Collation order of two names: ordinal comparison of upcased units.
    pub fn compare(&self, a: &[u16], b: &[u16]) -> Ordering {
        a.iter()
            .map(|&u| self.upcase(u))
            .cmp(b.iter().map(|&u| self.upcase(u)))
    }

    pub fn eq_ignore_case(&self, a: &[u16], b: &[u16]) -> bool {
        a.len() == b.len() && self.compare(a, b) == Ordering::Equal
    }
}
