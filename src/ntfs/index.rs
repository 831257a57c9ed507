//! Directory `$I30` B+-tree: `$INDEX_ROOT`, `INDX` blocks, lookup and
//! in-order iteration.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use super::attribute::{open_attribute, AttributeStream};
use super::filename::FileNameAttr;
use super::mft::MftReader;
use super::record::{apply_fixup, FileRecord, MftReference};
use super::upcase::UpcaseTable;
use super::{ATTR_FILE_NAME, ATTR_INDEX_ALLOCATION, ATTR_INDEX_ROOT, I30, USA_STRIDE};
use crate::device::Disk;
use crate::error::{corrupt, NtfsError, Result};

/// Deepest B+-tree we will walk before calling the index corrupt.
pub const MAX_INDEX_DEPTH: usize = 32;

const COLLATION_FILENAME: u32 = 0x01;
const INDEX_HEADER_LARGE: u8 = 0x01;
const ENTRY_SUBNODE: u16 = 0x01;
const ENTRY_END: u16 = 0x02;

/// A filename index entry: child reference plus its `$FILE_NAME` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub reference: MftReference,
    pub key: FileNameAttr,
    pub subnode: Option<u64>,
}

/// One slot in a node. The last slot of every node is the END marker,
/// which has no key but may still point at a sub-node.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeEntry {
    entry: Option<IndexEntry>,
    subnode: Option<u64>,
}

/// Parse the entries described by the index header at `header` in `buf`.
fn parse_node(buf: &[u8], header: usize, what: &str) -> Result<Vec<NodeEntry>> {
    if header + 0x10 > buf.len() {
        return Err(corrupt(format!("{what}: index header truncated")));
    }
    let entries_offset = LittleEndian::read_u32(&buf[header..header + 4]) as usize;
    let index_length = LittleEndian::read_u32(&buf[header + 4..header + 8]) as usize;
    let start = header + entries_offset;
    let end = header + index_length;
    if entries_offset < 0x10 || end > buf.len() || start >= end {
        return Err(corrupt(format!(
            "{what}: entries {entries_offset:#x}..{index_length:#x} out of bounds"
        )));
    }

    let mut entries = Vec::new();
    let mut pos = start;
    loop {
        if pos + 0x10 > end {
            return Err(corrupt(format!("{what}: missing END entry")));
        }
        let e = &buf[pos..end];
        let length = LittleEndian::read_u16(&e[0x08..0x0A]) as usize;
        let key_length = LittleEndian::read_u16(&e[0x0A..0x0C]) as usize;
        let flags = LittleEndian::read_u16(&e[0x0C..0x0E]);
        if length < 0x10 || length % 8 != 0 || length > e.len() {
            return Err(corrupt(format!(
                "{what}: entry at {pos:#x} has bad length {length}"
            )));
        }

        let subnode = if flags & ENTRY_SUBNODE != 0 {
            if length < 0x18 {
                return Err(corrupt(format!("{what}: entry at {pos:#x} too short for VCN")));
            }
            Some(LittleEndian::read_u64(&e[length - 8..length]))
        } else {
            None
        };

        if flags & ENTRY_END != 0 {
            entries.push(NodeEntry {
                entry: None,
                subnode,
            });
            return Ok(entries);
        }

        let key_end = 0x10 + key_length;
        let key_limit = if subnode.is_some() { length - 8 } else { length };
        if key_end > key_limit {
            return Err(corrupt(format!("{what}: entry at {pos:#x} key overruns entry")));
        }
        let key = FileNameAttr::parse(&e[0x10..key_end])?;
        entries.push(NodeEntry {
            entry: Some(IndexEntry {
                reference: MftReference::from_raw(LittleEndian::read_u64(&e[0x00..0x08])),
                key,
                subnode,
            }),
            subnode,
        });
        pos += length;
    }
}

/// The `$I30` index of one directory.
#[derive(Debug, Clone)]
pub struct DirectoryIndex {
    root: Vec<NodeEntry>,
    allocation: Option<AttributeStream>,
    block_size: u64,
    vcn_size: u64,
}

impl DirectoryIndex {
    /// Open the filename index of directory `record`.
    pub fn open(disk: &mut Disk, mft: &MftReader, record: &FileRecord) -> Result<Self> {
        let root = open_attribute(disk, mft, record, ATTR_INDEX_ROOT, I30)?.ok_or_else(|| {
            corrupt(format!("directory {} has no $INDEX_ROOT", record.number()))
        })?;
        if !root.is_resident() {
            return Err(corrupt(format!(
                "directory {}: $INDEX_ROOT is non-resident",
                record.number()
            )));
        }
        let root_value = root.read_all(disk, mft.record_size())?;
        let allocation = open_attribute(disk, mft, record, ATTR_INDEX_ALLOCATION, I30)?;
        Self::from_parts(&root_value, allocation, mft.cluster_size)
    }

    /// Build from a raw `$INDEX_ROOT` value and the optional
    /// `$INDEX_ALLOCATION` stream.
    pub fn from_parts(
        root_value: &[u8],
        allocation: Option<AttributeStream>,
        cluster_size: u64,
    ) -> Result<Self> {
        if root_value.len() < 0x20 {
            return Err(corrupt("$INDEX_ROOT too short"));
        }
        let indexed_type = LittleEndian::read_u32(&root_value[0x00..0x04]);
        let collation = LittleEndian::read_u32(&root_value[0x04..0x08]);
        let block_size = LittleEndian::read_u32(&root_value[0x08..0x0C]) as u64;
        if indexed_type != ATTR_FILE_NAME {
            return Err(NtfsError::Unsupported(format!(
                "index of attribute type {indexed_type:#x}"
            )));
        }
        if collation != COLLATION_FILENAME {
            return Err(NtfsError::Unsupported(format!("collation rule {collation:#x}")));
        }
        if block_size < USA_STRIDE as u64 || !block_size.is_power_of_two() {
            return Err(corrupt(format!("index block size {block_size}")));
        }

        let root = parse_node(root_value, 0x10, "$INDEX_ROOT")?;
        let large = root_value[0x10 + 0x0C] & INDEX_HEADER_LARGE != 0;
        if large && allocation.is_none() {
            return Err(corrupt("large index without $INDEX_ALLOCATION"));
        }

        let vcn_size = if block_size >= cluster_size {
            cluster_size
        } else {
            USA_STRIDE as u64
        };

        Ok(Self {
            root,
            allocation,
            block_size,
            vcn_size,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Read and validate the `INDX` block at `vcn`.
    fn read_node(&self, disk: &mut Disk, vcn: u64) -> Result<Vec<NodeEntry>> {
        let allocation = self
            .allocation
            .as_ref()
            .ok_or_else(|| corrupt(format!("sub-node VCN {vcn} without $INDEX_ALLOCATION")))?;
        trace!("index: read node VCN {vcn}");

        let offset = vcn
            .checked_mul(self.vcn_size)
            .ok_or_else(|| corrupt(format!("index VCN {vcn} overflows")))?;
        let mut block = vec![0u8; self.block_size as usize];
        let n = allocation.read(disk, offset, &mut block)?;
        if n != block.len() {
            return Err(corrupt(format!("index block VCN {vcn} beyond allocation")));
        }
        if &block[0..4] != b"INDX" {
            return Err(corrupt(format!("index block VCN {vcn}: bad magic")));
        }
        let what = format!("index block VCN {vcn}");
        apply_fixup(&mut block, &what)?;

        let stored = LittleEndian::read_u64(&block[0x10..0x18]);
        if stored != vcn {
            return Err(corrupt(format!("{what}: block claims VCN {stored}")));
        }
        parse_node(&block, 0x18, &what)
    }

    /// Find `name` by descending the B+-tree in collation order. Any
    /// namespace matches.
    pub fn lookup(&self, disk: &mut Disk, upcase: &UpcaseTable, name: &[u16]) -> Result<IndexEntry> {
        let mut node = self.root.clone();
        for _ in 0..=MAX_INDEX_DEPTH {
            let mut next = None;
            for slot in &node {
                match &slot.entry {
                    Some(entry) => match upcase.compare(name, &entry.key.name) {
                        Ordering::Equal => return Ok(entry.clone()),
                        Ordering::Less => {
                            next = slot.subnode;
                            break;
                        }
                        Ordering::Greater => {}
                    },
                    None => next = slot.subnode,
                }
            }
            match next {
                Some(vcn) => node = self.read_node(disk, vcn)?,
                None => {
                    return Err(NtfsError::NotFound(String::from_utf16_lossy(name)));
                }
            }
        }
        Err(corrupt(format!("index deeper than {MAX_INDEX_DEPTH} levels")))
    }

    /// All entries in collation order.
    pub fn entries(&self, disk: &mut Disk) -> Result<Vec<IndexEntry>> {
        let mut cursor = IndexCursor::new();
        let mut out = Vec::new();
        while let Some(entry) = cursor.next_entry(self, disk)? {
            out.push(entry);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
struct Frame {
    entries: Vec<NodeEntry>,
    pos: usize,
    descended: bool,
}

/// Lazy in-order walk over a [`DirectoryIndex`].
///
/// The cursor holds a stack of partially visited nodes. After an error it is
/// exhausted; [`IndexCursor::rewind`] starts over.
#[derive(Debug, Clone, Default)]
pub struct IndexCursor {
    stack: Vec<Frame>,
    started: bool,
    exhausted: bool,
}

impl IndexCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rewind(&mut self) {
        self.stack.clear();
        self.started = false;
        self.exhausted = false;
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn next_entry(
        &mut self,
        index: &DirectoryIndex,
        disk: &mut Disk,
    ) -> Result<Option<IndexEntry>> {
        if self.exhausted {
            return Ok(None);
        }
        if !self.started {
            self.started = true;
            self.stack.push(Frame {
                entries: index.root.clone(),
                pos: 0,
                descended: false,
            });
        }

        loop {
            let depth = self.stack.len();
            let Some(frame) = self.stack.last_mut() else {
                self.exhausted = true;
                return Ok(None);
            };
            if frame.pos >= frame.entries.len() {
                self.stack.pop();
                continue;
            }

            // Visit the sub-node left of this slot before the slot itself
            if !frame.descended {
                frame.descended = true;
                if let Some(vcn) = frame.entries[frame.pos].subnode {
                    if depth >= MAX_INDEX_DEPTH {
                        self.exhausted = true;
                        return Err(corrupt(format!(
                            "index deeper than {MAX_INDEX_DEPTH} levels"
                        )));
                    }
                    match index.read_node(disk, vcn) {
                        Ok(entries) => {
                            self.stack.push(Frame {
                                entries,
                                pos: 0,
                                descended: false,
                            });
                            continue;
                        }
                        Err(e) => {
                            self.exhausted = true;
                            return Err(e);
                        }
                    }
                }
            }

            let entry = frame.entries[frame.pos].entry.clone();
            frame.pos += 1;
            frame.descended = false;
            if let Some(entry) = entry {
                return Ok(Some(entry));
            }
        }
    }
}
