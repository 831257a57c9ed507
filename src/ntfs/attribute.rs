//! Attribute streams: random-access reads of resident and non-resident
//! attribute values, with `$ATTRIBUTE_LIST` resolution.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};

use super::mft::MftReader;
use super::record::{Attribute, AttributeBody, FileRecord, MftReference};
use super::runlist::Runlist;
use super::{utf16_units, ATTR_ATTRIBUTE_LIST};
use crate::device::Disk;
use crate::error::{corrupt, NtfsError, Result};

/// Largest attribute list we are willing to read into memory.
const MAX_ATTRIBUTE_LIST: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
enum StreamData {
    Resident(Vec<u8>),
    NonResident { runlist: Runlist, cluster_size: u64 },
}

/// Bytes covered by `runlist`. Runs reaching past the allocated size, or
/// past what a `u64` byte offset can express, are `Corrupt`.
fn mapped_bytes(
    runlist: &Runlist,
    cluster_size: u64,
    allocated_size: u64,
    type_code: u32,
) -> Result<u64> {
    let mapped = runlist.end_vcn().checked_mul(cluster_size).ok_or_else(|| {
        corrupt(format!(
            "attribute {type_code:#x}: run-list of {} clusters overflows",
            runlist.end_vcn()
        ))
    })?;
    let allocated_clusters = allocated_size.div_ceil(cluster_size);
    if runlist.end_vcn() > allocated_clusters {
        return Err(corrupt(format!(
            "attribute {type_code:#x}: run-list maps {} clusters, {allocated_size} bytes allocated",
            runlist.end_vcn()
        )));
    }
    Ok(mapped)
}

/// Readable view of one attribute's value.
#[derive(Debug, Clone)]
pub struct AttributeStream {
    data: StreamData,
    type_code: u32,
    flags: u16,
    data_size: u64,
    allocated_size: u64,
    initialized_size: u64,
}

impl AttributeStream {
    pub fn resident(attr: &Attribute, value: &[u8]) -> Self {
        let len = value.len() as u64;
        Self {
            data: StreamData::Resident(value.to_vec()),
            type_code: attr.type_code,
            flags: attr.flags,
            data_size: len,
            allocated_size: (len + 7) & !7,
            initialized_size: len,
        }
    }

    /// Build a stream from every extent of one attribute, in any order.
    pub fn from_extents(
        extents: &[&Attribute],
        cluster_size: u64,
        total_clusters: u64,
    ) -> Result<Self> {
        let first = extents
            .first()
            .ok_or_else(|| NtfsError::NotFound("attribute has no extents".into()))?;
        if let AttributeBody::Resident(value) = &first.body {
            if extents.len() != 1 {
                return Err(corrupt("resident attribute split across records"));
            }
            return Ok(Self::resident(first, value));
        }

        let mut parts = Vec::with_capacity(extents.len());
        for attr in extents {
            let nr = attr
                .non_resident()
                .ok_or_else(|| corrupt("resident and non-resident extents mixed"))?;
            parts.push(nr);
        }
        parts.sort_by_key(|nr| nr.lowest_vcn);

        // Sizes are only valid in the extent starting at VCN 0
        let head = parts[0];
        if head.lowest_vcn != 0 {
            return Err(corrupt(format!(
                "attribute {:#x} has no extent at VCN 0",
                first.type_code
            )));
        }

        let mut runlist = Runlist::default();
        for nr in &parts {
            runlist.append(Runlist::decode(
                &nr.mapping_pairs,
                nr.lowest_vcn,
                nr.highest_vcn,
            )?)?;
        }
        runlist.check_bounds(total_clusters)?;

        if head.initialized_size > head.data_size || head.data_size > head.allocated_size {
            return Err(corrupt(format!(
                "attribute {:#x}: sizes allocated {} data {} initialized {}",
                first.type_code, head.allocated_size, head.data_size, head.initialized_size
            )));
        }
        let mapped = mapped_bytes(&runlist, cluster_size, head.allocated_size, first.type_code)?;
        if !first.is_compressed() && mapped < head.data_size {
            return Err(corrupt(format!(
                "attribute {:#x}: {} clusters cannot hold {} bytes",
                first.type_code,
                runlist.end_vcn(),
                head.data_size
            )));
        }

        Ok(Self {
            data: StreamData::NonResident {
                runlist,
                cluster_size,
            },
            type_code: first.type_code,
            flags: first.flags,
            data_size: head.data_size,
            allocated_size: head.allocated_size,
            initialized_size: head.initialized_size,
        })
    }

    /// Stream over the VCN-0 extent only, sized to what its runs map. Used to
    /// reach `$MFT`'s own extension records before the full stream exists.
    pub(crate) fn first_extent(
        attr: &Attribute,
        cluster_size: u64,
        total_clusters: u64,
    ) -> Result<Self> {
        let nr = attr
            .non_resident()
            .ok_or_else(|| corrupt("expected a non-resident attribute"))?;
        let runlist = Runlist::decode(&nr.mapping_pairs, nr.lowest_vcn, nr.highest_vcn)?;
        runlist.check_bounds(total_clusters)?;
        let mapped = mapped_bytes(&runlist, cluster_size, nr.allocated_size, attr.type_code)?;
        Ok(Self {
            data: StreamData::NonResident {
                runlist,
                cluster_size,
            },
            type_code: attr.type_code,
            flags: attr.flags,
            data_size: nr.data_size.min(mapped),
            allocated_size: nr.allocated_size.min(mapped),
            initialized_size: nr.initialized_size.min(mapped),
        })
    }

    pub fn type_code(&self) -> u32 {
        self.type_code
    }

    pub fn len(&self) -> u64 {
        self.data_size
    }

    pub fn is_empty(&self) -> bool {
        self.data_size == 0
    }

    pub fn allocated_size(&self) -> u64 {
        self.allocated_size
    }

    pub fn initialized_size(&self) -> u64 {
        self.initialized_size
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.data, StreamData::Resident(_))
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & super::record::ATTR_FLAG_COMPRESSED != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & super::record::ATTR_FLAG_ENCRYPTED != 0
    }

    pub fn runlist(&self) -> Option<&Runlist> {
        match &self.data {
            StreamData::NonResident { runlist, .. } => Some(runlist),
            StreamData::Resident(_) => None,
        }
    }

    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read, short at end of data and zero at or past it.
    pub fn read(&self, disk: &mut Disk, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.is_compressed() {
            return Err(NtfsError::Unsupported("compressed attribute".into()));
        }
        if self.is_encrypted() {
            return Err(NtfsError::Unsupported("encrypted attribute".into()));
        }
        if offset >= self.data_size || buf.is_empty() {
            return Ok(0);
        }
        let len = (self.data_size - offset).min(buf.len() as u64) as usize;

        let (runlist, cluster_size) = match &self.data {
            StreamData::Resident(value) => {
                let start = offset as usize;
                buf[..len].copy_from_slice(&value[start..start + len]);
                return Ok(len);
            }
            StreamData::NonResident {
                runlist,
                cluster_size,
            } => (runlist, *cluster_size),
        };

        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let remaining = len - done;

            // Past the initialized size everything reads as zero
            if pos >= self.initialized_size {
                buf[done..len].fill(0);
                break;
            }

            let vcn = pos / cluster_size;
            let run = runlist.find(vcn).ok_or_else(|| {
                corrupt(format!("VCN {vcn} not mapped by attribute run-list"))
            })?;
            // Bounded by `mapped_bytes` at construction
            let run_end = run.end_vcn() * cluster_size;
            let chunk = (remaining as u64)
                .min(run_end - pos)
                .min(self.initialized_size - pos) as usize;

            match run.lcn {
                None => {
                    trace!("attr: sparse VCN {vcn}, {chunk} zero bytes");
                    buf[done..done + chunk].fill(0);
                }
                Some(lcn) => {
                    let disk_offset = (lcn + (vcn - run.vcn)) * cluster_size + pos % cluster_size;
                    disk.read_at(disk_offset, &mut buf[done..done + chunk])?;
                }
            }
            done += chunk;
        }

        Ok(len)
    }

    /// Read the whole value, refusing anything larger than `limit` bytes.
    pub fn read_all(&self, disk: &mut Disk, limit: u64) -> Result<Vec<u8>> {
        if self.data_size > limit {
            return Err(corrupt(format!(
                "attribute {:#x} is {} bytes, limit {limit}",
                self.type_code, self.data_size
            )));
        }
        let mut buf = vec![0u8; self.data_size as usize];
        let n = self.read(disk, 0, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// One entry of an `$ATTRIBUTE_LIST` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeListEntry {
    pub type_code: u32,
    pub name: Vec<u16>,
    pub lowest_vcn: u64,
    pub reference: MftReference,
    pub instance: u16,
}

impl AttributeListEntry {
    fn has_name(&self, name: &str) -> bool {
        self.name.iter().copied().eq(name.encode_utf16())
    }
}

pub fn parse_attribute_list(data: &[u8]) -> Result<Vec<AttributeListEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos + 0x1A <= data.len() {
        let e = &data[pos..];
        let length = LittleEndian::read_u16(&e[0x04..0x06]) as usize;
        if length < 0x1A || pos + length > data.len() {
            return Err(corrupt(format!(
                "attribute list entry at {pos:#x} has bad length {length}"
            )));
        }
        let name_len = e[0x06] as usize;
        let name_offset = e[0x07] as usize;
        let name = if name_len > 0 {
            let end = name_offset + name_len * 2;
            if end > length {
                return Err(corrupt("attribute list entry name out of bounds"));
            }
            utf16_units(&e[name_offset..end])
        } else {
            Vec::new()
        };
        entries.push(AttributeListEntry {
            type_code: LittleEndian::read_u32(&e[0x00..0x04]),
            name,
            lowest_vcn: LittleEndian::read_u64(&e[0x08..0x10]),
            reference: MftReference::from_raw(LittleEndian::read_u64(&e[0x10..0x18])),
            instance: LittleEndian::read_u16(&e[0x18..0x1A]),
        });
        pos += length;
    }
    Ok(entries)
}

/// Read and parse the attribute list of `record`, if it has one.
fn attribute_list(
    disk: &mut Disk,
    mft: &MftReader,
    record: &FileRecord,
) -> Result<Option<Vec<AttributeListEntry>>> {
    let Some(list_attr) = record.find(ATTR_ATTRIBUTE_LIST, "") else {
        return Ok(None);
    };
    let stream = AttributeStream::from_extents(&[list_attr], mft.cluster_size, mft.total_clusters)?;
    let data = stream.read_all(disk, MAX_ATTRIBUTE_LIST)?;
    Ok(Some(parse_attribute_list(&data)?))
}

/// Load every record referenced by `entries` and pull out the matching
/// attribute instances.
fn gather_from_list(
    disk: &mut Disk,
    mft: &MftReader,
    record: &FileRecord,
    entries: &[&AttributeListEntry],
) -> Result<Vec<Attribute>> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let number = entry.reference.record_number();
        let found = if number == record.number() {
            record
                .attributes()
                .iter()
                .find(|a| a.type_code == entry.type_code && a.instance == entry.instance)
                .cloned()
        } else {
            let ext = mft.load(disk, entry.reference)?;
            match ext.base_reference() {
                Some(base) if base.record_number() == record.number() => {}
                _ => {
                    return Err(corrupt(format!(
                        "record {number} listed by record {} is not its extension",
                        record.number()
                    )))
                }
            }
            ext.attributes()
                .iter()
                .find(|a| a.type_code == entry.type_code && a.instance == entry.instance)
                .cloned()
        };
        let attr = found.ok_or_else(|| {
            corrupt(format!(
                "attribute {:#x} instance {} missing from record {number}",
                entry.type_code, entry.instance
            ))
        })?;
        out.push(attr);
    }
    Ok(out)
}

/// Open attribute `type_code`/`name` of `record` as a stream, following the
/// attribute list into extension records when there is one.
///
/// Returns `Ok(None)` when the record has no such attribute.
pub fn open_attribute(
    disk: &mut Disk,
    mft: &MftReader,
    record: &FileRecord,
    type_code: u32,
    name: &str,
) -> Result<Option<AttributeStream>> {
    match attribute_list(disk, mft, record)? {
        None => {
            let extents: Vec<&Attribute> = record
                .find_all(type_code)
                .filter(|a| a.has_name(name))
                .collect();
            if extents.is_empty() {
                return Ok(None);
            }
            AttributeStream::from_extents(&extents, mft.cluster_size, mft.total_clusters).map(Some)
        }
        Some(list) => {
            let wanted: Vec<&AttributeListEntry> = list
                .iter()
                .filter(|e| e.type_code == type_code && e.has_name(name))
                .collect();
            if wanted.is_empty() {
                return Ok(None);
            }
            debug!(
                "attr: record {} type {type_code:#x} spread over {} extent(s)",
                record.number(),
                wanted.len()
            );
            let attrs = gather_from_list(disk, mft, record, &wanted)?;
            let extents: Vec<&Attribute> = attrs.iter().collect();
            AttributeStream::from_extents(&extents, mft.cluster_size, mft.total_clusters).map(Some)
        }
    }
}

/// Every instance of `type_code` (any name) across the base record and its
/// extension records.
pub fn collect_attributes(
    disk: &mut Disk,
    mft: &MftReader,
    record: &FileRecord,
    type_code: u32,
) -> Result<Vec<Attribute>> {
    match attribute_list(disk, mft, record)? {
        None => Ok(record.find_all(type_code).cloned().collect()),
        Some(list) => {
            let wanted: Vec<&AttributeListEntry> =
                list.iter().filter(|e| e.type_code == type_code).collect();
            gather_from_list(disk, mft, record, &wanted)
        }
    }
}
