//! In-memory inodes and the reference-counted inode cache.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, trace};

use super::attribute::{collect_attributes, open_attribute, AttributeStream};
use super::filename::{preferred_name, FileNameAttr, StandardInformation};
use super::index::DirectoryIndex;
use super::record::{FileRecord, MftReference};
use super::time::NtfsTime;
use super::{Ntfs, ATTR_DATA, ATTR_FILE_NAME, ATTR_STANDARD_INFORMATION};
use crate::device::Disk;
use crate::error::{corrupt, NtfsError, Result};

bitflags! {
    /// DOS-style file attribute bits as stored in `$STANDARD_INFORMATION`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileAttributes: u32 {
        const READ_ONLY = 0x0001;
        const HIDDEN = 0x0002;
        const SYSTEM = 0x0004;
        const DIRECTORY = 0x0010;
        const ARCHIVE = 0x0020;
        const SPARSE_FILE = 0x0200;
        const REPARSE_POINT = 0x0400;
        const COMPRESSED = 0x0800;
        const ENCRYPTED = 0x4000;
    }
}

/// A loaded base record with the attributes the engine cares about.
#[derive(Debug)]
pub struct Inode {
    reference: MftReference,
    record: FileRecord,
    std_info: StandardInformation,
    names: Vec<FileNameAttr>,
    data: Option<AttributeStream>,
    index: Option<DirectoryIndex>,
}

impl Inode {
    /// Load the base record `reference` and resolve its standard
    /// information, names and unnamed data stream or filename index.
    pub fn load(fs: &mut Ntfs, reference: MftReference) -> Result<Self> {
        let Ntfs { disk, mft, .. } = fs;
        let record = mft.load(disk, reference)?;
        let number = record.number();
        if !record.is_in_use() {
            return Err(NtfsError::NotFound(format!("MFT record {number} is free")));
        }
        if let Some(base) = record.base_reference() {
            return Err(NtfsError::NotFound(format!(
                "MFT record {number} is an extension of {base}"
            )));
        }

        let std_info = record
            .find(ATTR_STANDARD_INFORMATION, "")
            .and_then(|a| a.resident_value())
            .ok_or_else(|| corrupt(format!("record {number} lacks $STANDARD_INFORMATION")))
            .and_then(StandardInformation::parse)?;

        let names = collect_attributes(disk, mft, &record, ATTR_FILE_NAME)?
            .iter()
            .map(|a| {
                a.resident_value()
                    .ok_or_else(|| corrupt(format!("record {number}: non-resident $FILE_NAME")))
                    .and_then(FileNameAttr::parse)
            })
            .collect::<Result<Vec<_>>>()?;

        let (data, index) = if record.is_directory() {
            (None, Some(DirectoryIndex::open(disk, mft, &record)?))
        } else {
            (open_attribute(disk, mft, &record, ATTR_DATA, "")?, None)
        };

        trace!(
            "inode: loaded record {number} ({} name(s), dir={})",
            names.len(),
            record.is_directory()
        );
        Ok(Self {
            reference: record.reference(),
            record,
            std_info,
            names,
            data,
            index,
        })
    }

    /// Reference carrying the record's current sequence number.
    pub fn reference(&self) -> MftReference {
        self.reference
    }

    pub fn record_number(&self) -> u64 {
        self.reference.record_number()
    }

    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    pub fn is_directory(&self) -> bool {
        self.record.is_directory()
    }

    /// Display name (Win32 over POSIX over DOS); `None` for nameless records.
    pub fn name(&self) -> Option<&FileNameAttr> {
        preferred_name(&self.names)
    }

    pub fn names(&self) -> &[FileNameAttr] {
        &self.names
    }

    pub fn standard_information(&self) -> &StandardInformation {
        &self.std_info
    }

    pub fn attributes(&self) -> FileAttributes {
        let mut attrs = FileAttributes::from_bits_truncate(self.std_info.file_attributes);
        attrs.set(FileAttributes::DIRECTORY, self.is_directory());
        attrs
    }

    pub fn creation_time(&self) -> NtfsTime {
        self.std_info.creation_time
    }

    pub fn modification_time(&self) -> NtfsTime {
        self.std_info.modification_time
    }

    pub fn mft_change_time(&self) -> NtfsTime {
        self.std_info.mft_change_time
    }

    pub fn access_time(&self) -> NtfsTime {
        self.std_info.access_time
    }

    pub fn data_size(&self) -> u64 {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    pub fn allocated_size(&self) -> u64 {
        self.data.as_ref().map(|d| d.allocated_size()).unwrap_or(0)
    }

    pub fn initialized_size(&self) -> u64 {
        self.data.as_ref().map(|d| d.initialized_size()).unwrap_or(0)
    }

    pub fn data(&self) -> Option<&AttributeStream> {
        self.data.as_ref()
    }

    pub fn index(&self) -> Result<&DirectoryIndex> {
        self.index.as_ref().ok_or_else(|| {
            NtfsError::NotADirectory(format!("MFT record {}", self.record_number()))
        })
    }

    /// Read file contents at `offset`; short at end of file.
    pub fn read(&self, disk: &mut Disk, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.is_directory() {
            return Err(NtfsError::NotAFile(format!(
                "MFT record {}",
                self.record_number()
            )));
        }
        match &self.data {
            Some(stream) => stream.read(disk, offset, buf),
            None => Ok(0),
        }
    }
}

/// Handle to a cached inode. Only meaningful for the cache that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId(usize);

#[derive(Debug)]
struct Slot {
    inode: Arc<Inode>,
    refs: usize,
}

/// Arena of open inodes, one per MFT record, with explicit open/close
/// reference counting.
#[derive(Debug, Default)]
pub struct InodeCache {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    by_record: HashMap<u64, usize>,
}

impl InodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `reference`, sharing an already cached inode when there is one.
    pub fn open(&mut self, fs: &mut Ntfs, reference: MftReference) -> Result<InodeId> {
        if let Some(&idx) = self.by_record.get(&reference.record_number()) {
            if let Some(slot) = self.slots[idx].as_mut() {
                let current = slot.inode.reference().sequence();
                if reference.sequence() != 0 && reference.sequence() != current {
                    return Err(NtfsError::StaleReference {
                        reference,
                        actual: current,
                    });
                }
                slot.refs += 1;
                return Ok(InodeId(idx));
            }
        }

        let inode = Inode::load(fs, reference)?;
        Ok(self.insert(inode))
    }

    fn insert(&mut self, inode: Inode) -> InodeId {
        let record = inode.record_number();
        let slot = Slot {
            inode: Arc::new(inode),
            refs: 1,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.by_record.insert(record, idx);
        InodeId(idx)
    }

    /// Already cached inode for `reference`, without taking a reference.
    pub fn cached(&self, reference: MftReference) -> Result<Option<Arc<Inode>>> {
        let Some(slot) = self
            .by_record
            .get(&reference.record_number())
            .and_then(|&idx| self.slots[idx].as_ref())
        else {
            return Ok(None);
        };
        let current = slot.inode.reference().sequence();
        if reference.sequence() != 0 && reference.sequence() != current {
            return Err(NtfsError::StaleReference {
                reference,
                actual: current,
            });
        }
        Ok(Some(slot.inode.clone()))
    }

    pub fn get(&self, id: InodeId) -> Result<Arc<Inode>> {
        self.slots
            .get(id.0)
            .and_then(|s| s.as_ref())
            .map(|s| s.inode.clone())
            .ok_or_else(|| NtfsError::InvalidParameter(format!("inode id {} is not open", id.0)))
    }

    /// Take another reference on an open inode.
    pub fn retain(&mut self, id: InodeId) -> Result<()> {
        let slot = self
            .slots
            .get_mut(id.0)
            .and_then(|s| s.as_mut())
            .ok_or_else(|| NtfsError::InvalidParameter(format!("inode id {} is not open", id.0)))?;
        slot.refs += 1;
        Ok(())
    }

    /// Drop one reference. Returns true when the inode was evicted.
    pub fn close(&mut self, id: InodeId) -> bool {
        let Some(entry) = self.slots.get_mut(id.0) else {
            return false;
        };
        let Some(slot) = entry.as_mut() else {
            return false;
        };
        slot.refs -= 1;
        if slot.refs > 0 {
            return false;
        }
        let record = slot.inode.record_number();
        *entry = None;
        self.by_record.remove(&record);
        self.free.push(id.0);
        debug!("inode: evicted record {record}");
        true
    }

    pub fn ref_count(&self, id: InodeId) -> usize {
        self.slots
            .get(id.0)
            .and_then(|s| s.as_ref())
            .map(|s| s.refs)
            .unwrap_or(0)
    }

    /// Number of distinct inodes currently cached.
    pub fn len(&self) -> usize {
        self.by_record.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_record.is_empty()
    }

    /// Forget everything. Outstanding ids become invalid.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.by_record.clear();
    }
}
