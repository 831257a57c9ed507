//! Loading FILE records by reference through the `$MFT` data stream.

use log::{debug, trace};

use super::attribute::{open_attribute, AttributeStream};
use super::boot::BootSector;
use super::record::{FileRecord, MftReference};
use super::{ATTR_DATA, MFT_RECORD_FIRST_USER, MFT_RECORD_MFT};
use crate::device::Disk;
use crate::error::{corrupt, NtfsError, Result};

/// Reads FILE records out of the (possibly fragmented) `$MFT`.
#[derive(Debug, Clone)]
pub struct MftReader {
    stream: AttributeStream,
    record_size: u64,
    pub cluster_size: u64,
    pub total_clusters: u64,
}

impl MftReader {
    /// Read record 0 straight from the boot sector's MFT location and build
    /// the full `$MFT` data stream from it.
    pub fn bootstrap(disk: &mut Disk, boot: &BootSector) -> Result<Self> {
        let cluster_size = boot.cluster_size();
        let total_clusters = boot.total_clusters();
        let record_size = boot.mft_record_size as u64;

        let mut buf = vec![0u8; record_size as usize];
        disk.read_at(boot.mft_lcn * cluster_size, &mut buf)?;
        let record = FileRecord::parse(MFT_RECORD_MFT, buf)?;
        if !record.is_in_use() {
            return Err(corrupt("$MFT record is not in use"));
        }

        // The first extent alone is enough to reach $MFT's extension records
        let head = record
            .find_all(ATTR_DATA)
            .find(|a| {
                a.has_name("") && a.non_resident().map(|nr| nr.lowest_vcn == 0).unwrap_or(false)
            })
            .ok_or_else(|| corrupt("$MFT has no non-resident $DATA"))?;
        let provisional = Self {
            stream: AttributeStream::first_extent(head, cluster_size, total_clusters)?,
            record_size,
            cluster_size,
            total_clusters,
        };

        let stream = open_attribute(disk, &provisional, &record, ATTR_DATA, "")?
            .ok_or_else(|| corrupt("$MFT has no $DATA"))?;
        if stream.is_resident() || stream.is_compressed() || stream.is_encrypted() {
            return Err(corrupt("$MFT $DATA must be plain non-resident"));
        }
        if stream.len() < MFT_RECORD_FIRST_USER * record_size {
            return Err(corrupt(format!(
                "$MFT holds only {} records",
                stream.len() / record_size
            )));
        }
        debug!(
            "mft: {} records, {} run(s)",
            stream.len() / record_size,
            stream.runlist().map(|r| r.runs().len()).unwrap_or(0)
        );

        Ok(Self {
            stream,
            record_size,
            cluster_size,
            total_clusters,
        })
    }

    pub fn record_size(&self) -> u64 {
        self.record_size
    }

    pub fn record_count(&self) -> u64 {
        self.stream.len() / self.record_size
    }

    /// Load and validate the record `reference` points at.
    ///
    /// A non-zero sequence number that differs from the record's is reported
    /// as [`NtfsError::StaleReference`]. Free records load normally.
    pub fn load(&self, disk: &mut Disk, reference: MftReference) -> Result<FileRecord> {
        let number = reference.record_number();
        if number >= self.record_count() {
            return Err(NtfsError::NotFound(format!(
                "MFT record {number} beyond end of $MFT"
            )));
        }
        trace!("mft: load record {reference}");

        let mut buf = vec![0u8; self.record_size as usize];
        let n = self.stream.read(disk, number * self.record_size, &mut buf)?;
        if n != buf.len() {
            return Err(corrupt(format!("MFT record {number} truncated")));
        }
        let record = FileRecord::parse(number, buf)?;

        if reference.sequence() != 0 && reference.sequence() != record.sequence() {
            return Err(NtfsError::StaleReference {
                reference,
                actual: record.sequence(),
            });
        }
        Ok(record)
    }
}
