//! Synthetic NTFS images for the integration tests.
//!
//! Geometry: 512 byte sectors, 1 KiB clusters, 1 KiB MFT records and 1 KiB
//! index blocks on a 4 MiB volume. `$MFT` is split in two runs (records
//! 0-15 at LCN 16, the rest at LCN 64) and file data starts at LCN 320.
//! Directory indexes are real B+-trees once they outgrow `$INDEX_ROOT`.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use rusty_ntfs::ntfs::UpcaseTable;
use rusty_ntfs::{BlockDevice, MftReference, MountConfig, StreamDevice, Volume};

pub const SECTOR: usize = 512;
pub const CLUSTER: usize = 1024;
pub const RECORD: usize = 1024;
pub const TOTAL_CLUSTERS: u64 = 4096;
pub const MFT_RECORDS: u64 = 256;
pub const SERIAL: u64 = 0x1234_5678_9ABC_DEF0;
pub const LABEL: &str = "TESTVOL";
/// 2020-01-01 00:00:00 UTC in NTFS ticks.
pub const BASE_TIME: i64 = 132_223_104_000_000_000;

const MFT_HEAD: (u64, u64) = (16, 16);
const MFT_TAIL: (u64, u64) = (64, 240);
const MFT_MIRROR_LCN: u64 = 8;
const FIRST_DATA_LCN: u64 = 320;

/// Entries (END included) kept in `$INDEX_ROOT` before the index goes large.
const ROOT_BUDGET: usize = 400;
/// Entry bytes available in one INDX block.
const NODE_BUDGET: usize = CLUSTER - 0x40;

const ATTR_STANDARD_INFORMATION: u32 = 0x10;
const ATTR_ATTRIBUTE_LIST: u32 = 0x20;
const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_VOLUME_NAME: u32 = 0x60;
const ATTR_VOLUME_INFORMATION: u32 = 0x70;
const ATTR_DATA: u32 = 0x80;
const ATTR_INDEX_ROOT: u32 = 0x90;
const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
const ATTR_BITMAP: u32 = 0xB0;

pub const FLAG_COMPRESSED: u16 = 0x0001;
pub const FLAG_SPARSE: u16 = 0x8000;

pub const DOS_HIDDEN: u32 = 0x0002;
pub const DOS_SYSTEM: u32 = 0x0004;
pub const DOS_ARCHIVE: u32 = 0x0020;

const NAMESPACE_WIN32: u8 = 1;
const NAMESPACE_DOS: u8 = 2;
const NAMESPACE_WIN32_AND_DOS: u8 = 3;

/// Byte offset of MFT record `number` in a built image.
pub fn record_offset(number: u64) -> usize {
    let lcn = if number < MFT_HEAD.1 {
        MFT_HEAD.0 + number
    } else {
        MFT_TAIL.0 + (number - MFT_HEAD.1)
    };
    lcn as usize * CLUSTER
}

/// Timestamps given to record `number`: creation, modification, MFT change,
/// access, one hour apart.
pub fn times_of(number: u64) -> [i64; 4] {
    let hour = 36_000_000_000i64;
    let c = BASE_TIME + number as i64 * 10_000_000;
    [c, c + hour, c + 2 * hour, c + 3 * hour]
}

/// Deterministic file content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32 * 7 + i as u32 / 1024) as u8)
        .collect()
}

type Runs = Vec<(Option<u64>, u64)>;

#[derive(Debug, Clone)]
enum Data {
    None,
    Resident(Vec<u8>),
    NonResident {
        runs: Runs,
        size: u64,
        initialized: u64,
        flags: u16,
    },
}

impl Data {
    /// (allocated, data) sizes as recorded in `$FILE_NAME`.
    fn sizes(&self) -> (u64, u64) {
        match self {
            Data::None => (0, 0),
            Data::Resident(v) => (align8(v.len()) as u64, v.len() as u64),
            Data::NonResident { runs, size, .. } => {
                (runs.iter().map(|r| r.1).sum::<u64>() * CLUSTER as u64, *size)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    sequence: u16,
    parent: u64,
    names: Vec<(String, u8)>,
    attributes: u32,
    directory: bool,
    data: Data,
    extra: Vec<Attr>,
    /// Records carrying `$DATA` extents. One: head stays in the base record.
    /// Two: head and tail both live in extension records.
    extensions: Vec<u64>,
}

#[derive(Debug, Clone)]
enum Body {
    Resident(Vec<u8>),
    NonResident {
        lowest: u64,
        highest: i64,
        pairs: Vec<u8>,
        sizes: (u64, u64, u64),
        compression_unit: u8,
    },
}

#[derive(Debug, Clone)]
struct Attr {
    type_code: u32,
    name: String,
    flags: u16,
    body: Body,
}

impl Attr {
    fn resident(type_code: u32, name: &str, value: Vec<u8>) -> Self {
        Self {
            type_code,
            name: name.to_string(),
            flags: 0,
            body: Body::Resident(value),
        }
    }

    fn non_resident(
        type_code: u32,
        name: &str,
        flags: u16,
        runs: &[(Option<u64>, u64)],
        lowest: u64,
        sizes: (u64, u64, u64),
    ) -> Self {
        let clusters: u64 = runs.iter().map(|r| r.1).sum();
        Self {
            type_code,
            name: name.to_string(),
            flags,
            body: Body::NonResident {
                lowest,
                highest: (lowest + clusters) as i64 - 1,
                pairs: encode_runs(runs),
                sizes,
                compression_unit: if flags & FLAG_COMPRESSED != 0 { 4 } else { 0 },
            },
        }
    }
}

/// How a test file is laid out on disk.
#[derive(Debug, Clone, Default)]
pub struct FileLayout {
    pub content: Vec<u8>,
    /// DOS attribute bits stored in `$STANDARD_INFORMATION` and `$FILE_NAME`.
    pub attributes: u32,
    /// Adds a separate DOS-namespace name next to the Win32 one.
    pub dos_name: Option<String>,
    pub non_resident: bool,
    /// Number of runs the data is split into, placed out of order on disk.
    pub fragments: usize,
    /// Initialized size when smaller than the content.
    pub initialized: Option<u64>,
    pub compressed: bool,
    /// Spread `$DATA` over two extension records behind an `$ATTRIBUTE_LIST`.
    pub attribute_list: bool,
    pub sequence: Option<u16>,
}

/// One piece of a sparse file.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// Allocated data, a whole number of clusters.
    Data(Vec<u8>),
    /// Unallocated clusters.
    Hole(u64),
}

pub struct ImageBuilder {
    nodes: BTreeMap<u64, Node>,
    image: Vec<u8>,
    used: Vec<bool>,
    next_lcn: u64,
    next_record: u64,
    version: (u8, u8),
    dirty: bool,
    /// Records whose `$I30` keys carry outdated `$FILE_NAME` copies.
    stale_keys: BTreeSet<u64>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        let mut b = Self {
            nodes: BTreeMap::new(),
            image: vec![0u8; TOTAL_CLUSTERS as usize * CLUSTER],
            used: vec![false; TOTAL_CLUSTERS as usize],
            next_lcn: FIRST_DATA_LCN,
            next_record: 16,
            version: (3, 1),
            dirty: false,
            stale_keys: BTreeSet::new(),
        };
        b.mark(0, 1);
        b.mark(MFT_MIRROR_LCN, 4);
        b.mark(MFT_HEAD.0, MFT_HEAD.1);
        b.mark(MFT_TAIL.0, MFT_TAIL.1);

        let mft_size = MFT_RECORDS * RECORD as u64;
        b.meta(
            0,
            "$MFT",
            Data::NonResident {
                runs: vec![(Some(MFT_HEAD.0), MFT_HEAD.1), (Some(MFT_TAIL.0), MFT_TAIL.1)],
                size: mft_size,
                initialized: mft_size,
                flags: 0,
            },
        );
        b.meta(
            1,
            "$MFTMirr",
            Data::NonResident {
                runs: vec![(Some(MFT_MIRROR_LCN), 4)],
                size: 4 * RECORD as u64,
                initialized: 4 * RECORD as u64,
                flags: 0,
            },
        );
        b.meta(2, "$LogFile", Data::Resident(Vec::new()));
        b.meta(3, "$Volume", Data::Resident(Vec::new()));
        b.meta(4, "$AttrDef", Data::Resident(Vec::new()));
        b.nodes.insert(
            5,
            Node {
                sequence: 5,
                parent: 5,
                names: vec![(".".to_string(), NAMESPACE_WIN32_AND_DOS)],
                attributes: DOS_HIDDEN | DOS_SYSTEM,
                directory: true,
                data: Data::None,
                extra: Vec::new(),
                extensions: Vec::new(),
            },
        );

        let bitmap_lcn = b.alloc(1);
        b.meta(
            6,
            "$Bitmap",
            Data::NonResident {
                runs: vec![(Some(bitmap_lcn), 1)],
                size: TOTAL_CLUSTERS / 8,
                initialized: TOTAL_CLUSTERS / 8,
                flags: 0,
            },
        );
        b.meta(
            7,
            "$Boot",
            Data::NonResident {
                runs: vec![(Some(0), 1)],
                size: CLUSTER as u64,
                initialized: CLUSTER as u64,
                flags: 0,
            },
        );
        b.meta(8, "$BadClus", Data::Resident(Vec::new()));
        b.meta(9, "$Secure", Data::Resident(Vec::new()));

        let table = UpcaseTable::builtin();
        let upcase: Vec<u8> = (0..=0xFFFFu32)
            .flat_map(|u| table.upcase(u as u16).to_le_bytes())
            .collect();
        let runs = b.store(&upcase, 1);
        b.meta(
            10,
            "$UpCase",
            Data::NonResident {
                runs,
                size: upcase.len() as u64,
                initialized: upcase.len() as u64,
                flags: 0,
            },
        );

        b.nodes.insert(
            11,
            Node {
                sequence: 11,
                parent: 5,
                names: vec![("$Extend".to_string(), NAMESPACE_WIN32_AND_DOS)],
                attributes: DOS_HIDDEN | DOS_SYSTEM,
                directory: true,
                data: Data::None,
                extra: Vec::new(),
                extensions: Vec::new(),
            },
        );
        b
    }

    /// Leave record 10 free so the engine has to fall back to its own table.
    pub fn without_upcase(mut self) -> Self {
        self.nodes.remove(&10);
        self
    }

    /// Move the second `$MFT` run into extension record 15 behind an
    /// attribute list.
    pub fn with_mft_attribute_list(mut self) -> Self {
        if let Some(mft) = self.nodes.get_mut(&0) {
            mft.extensions = vec![15];
        }
        self
    }

    pub fn with_version(mut self, major: u8, minor: u8) -> Self {
        self.version = (major, minor);
        self
    }

    pub fn dirty(mut self) -> Self {
        self.dirty = true;
        self
    }

    /// Leave the index keys of `number` out of date: size 1, no allocation,
    /// zero timestamps, hidden, and no directory bit.
    pub fn stale_index_key(&mut self, number: u64) {
        self.stale_keys.insert(number);
    }

    pub fn root(&self) -> u64 {
        5
    }

    fn meta(&mut self, number: u64, name: &str, data: Data) {
        self.nodes.insert(
            number,
            Node {
                sequence: number.max(1) as u16,
                parent: 5,
                names: vec![(name.to_string(), NAMESPACE_WIN32_AND_DOS)],
                attributes: DOS_HIDDEN | DOS_SYSTEM,
                directory: false,
                data,
                extra: Vec::new(),
                extensions: Vec::new(),
            },
        );
    }

    fn mark(&mut self, lcn: u64, count: u64) {
        for c in lcn..lcn + count {
            self.used[c as usize] = true;
        }
    }

    fn alloc(&mut self, count: u64) -> u64 {
        let lcn = self.next_lcn;
        assert!(lcn + count <= TOTAL_CLUSTERS, "test image full");
        self.next_lcn += count;
        self.mark(lcn, count);
        lcn
    }

    fn next_record(&mut self) -> u64 {
        let number = self.next_record;
        assert!(number < MFT_RECORDS, "test MFT full");
        self.next_record += 1;
        number
    }

    fn write_at(&mut self, lcn: u64, bytes: &[u8]) {
        let start = lcn as usize * CLUSTER;
        self.image[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Write `content` in `fragments` runs. Later fragments sit at lower
    /// LCNs so some run deltas are negative. Slack is filled with 0xEE.
    fn store(&mut self, content: &[u8], fragments: usize) -> Runs {
        let clusters = content.len().div_ceil(CLUSTER) as u64;
        if clusters == 0 {
            return Vec::new();
        }
        let pieces = fragments.clamp(1, clusters as usize) as u64;
        let mut ranges = Vec::new();
        let mut vcn = 0;
        for i in 0..pieces {
            let len = clusters / pieces + u64::from(i < clusters % pieces);
            ranges.push((vcn, len));
            vcn += len;
        }

        let mut lcns = vec![0; ranges.len()];
        for i in (0..ranges.len()).rev() {
            lcns[i] = self.alloc(ranges[i].1);
            if pieces > 1 {
                // Gap so neighbouring fragments never merge
                self.next_lcn += 1;
            }
        }

        let mut padded = content.to_vec();
        padded.resize(clusters as usize * CLUSTER, 0xEE);
        let mut runs = Vec::new();
        for (&(vcn, len), &lcn) in ranges.iter().zip(&lcns) {
            let start = vcn as usize * CLUSTER;
            let end = (vcn + len) as usize * CLUSTER;
            let bytes = padded[start..end].to_vec();
            self.write_at(lcn, &bytes);
            runs.push((Some(lcn), len));
        }
        runs
    }

    pub fn add_dir(&mut self, parent: u64, name: &str) -> u64 {
        let number = self.next_record();
        self.nodes.insert(
            number,
            Node {
                sequence: 1,
                parent,
                names: vec![(name.to_string(), NAMESPACE_WIN32)],
                attributes: 0,
                directory: true,
                data: Data::None,
                extra: Vec::new(),
                extensions: Vec::new(),
            },
        );
        number
    }

    /// Resident below 256 bytes, one contiguous run otherwise.
    pub fn add_file(&mut self, parent: u64, name: &str, content: &[u8]) -> u64 {
        self.add_file_with(
            parent,
            name,
            FileLayout {
                content: content.to_vec(),
                attributes: DOS_ARCHIVE,
                non_resident: content.len() >= 256,
                ..Default::default()
            },
        )
    }

    pub fn add_file_with(&mut self, parent: u64, name: &str, layout: FileLayout) -> u64 {
        let number = self.next_record();
        let mut names = vec![(
            name.to_string(),
            if layout.dos_name.is_some() {
                NAMESPACE_WIN32
            } else {
                NAMESPACE_WIN32_AND_DOS
            },
        )];
        if let Some(dos) = &layout.dos_name {
            names.push((dos.clone(), NAMESPACE_DOS));
        }

        let mut attributes = layout.attributes;
        let mut extensions = Vec::new();
        let non_resident = layout.non_resident
            || layout.fragments > 1
            || layout.compressed
            || layout.attribute_list
            || layout.initialized.is_some();
        let data = if non_resident {
            let size = layout.content.len() as u64;
            let initialized = layout.initialized.unwrap_or(size).min(size);
            let mut stored = layout.content.clone();
            stored[initialized as usize..].fill(0xEE);
            let fragments = if layout.attribute_list {
                layout.fragments.max(2)
            } else {
                layout.fragments
            };
            let runs = self.store(&stored, fragments);
            let mut flags = 0;
            if layout.compressed {
                flags |= FLAG_COMPRESSED;
                attributes |= 0x0800;
            }
            if layout.attribute_list {
                extensions = vec![self.next_record(), self.next_record()];
            }
            Data::NonResident {
                runs,
                size,
                initialized,
                flags,
            }
        } else {
            Data::Resident(layout.content.clone())
        };

        self.nodes.insert(
            number,
            Node {
                sequence: layout.sequence.unwrap_or(1),
                parent,
                names,
                attributes,
                directory: false,
                data,
                extra: Vec::new(),
                extensions,
            },
        );
        number
    }

    pub fn add_sparse_file(&mut self, parent: u64, name: &str, chunks: &[Chunk]) -> u64 {
        let number = self.next_record();
        let mut runs = Vec::new();
        for chunk in chunks {
            match chunk {
                Chunk::Hole(clusters) => runs.push((None, *clusters)),
                Chunk::Data(bytes) => {
                    assert_eq!(bytes.len() % CLUSTER, 0, "sparse data chunks are whole clusters");
                    runs.extend(self.store(bytes, 1));
                }
            }
        }
        let size = runs.iter().map(|r| r.1).sum::<u64>() * CLUSTER as u64;
        self.nodes.insert(
            number,
            Node {
                sequence: 1,
                parent,
                names: vec![(name.to_string(), NAMESPACE_WIN32_AND_DOS)],
                attributes: DOS_ARCHIVE | 0x0200,
                directory: false,
                data: Data::NonResident {
                    runs,
                    size,
                    initialized: size,
                    flags: FLAG_SPARSE,
                },
                extra: Vec::new(),
                extensions: Vec::new(),
            },
        );
        number
    }

    fn file_name_value(&self, number: u64, name: &str, namespace: u8) -> Vec<u8> {
        let node = &self.nodes[&number];
        let parent_seq = self.nodes.get(&node.parent).map(|p| p.sequence).unwrap_or(0);
        let (allocated, size) = node.data.sizes();
        let mut flags = node.attributes;
        if node.directory {
            flags |= 0x1000_0000;
        }
        let units: Vec<u16> = name.encode_utf16().collect();
        let mut v = vec![0u8; 0x42 + units.len() * 2];
        LittleEndian::write_u64(&mut v[0x00..0x08], reference(node.parent, parent_seq));
        for (i, t) in times_of(number).iter().enumerate() {
            LittleEndian::write_i64(&mut v[0x08 + i * 8..0x10 + i * 8], *t);
        }
        LittleEndian::write_u64(&mut v[0x28..0x30], allocated);
        LittleEndian::write_u64(&mut v[0x30..0x38], size);
        LittleEndian::write_u32(&mut v[0x38..0x3C], flags);
        v[0x40] = units.len() as u8;
        v[0x41] = namespace;
        for (i, u) in units.iter().enumerate() {
            LittleEndian::write_u16(&mut v[0x42 + i * 2..0x44 + i * 2], *u);
        }
        v
    }

    fn standard_information(&self, number: u64) -> Vec<u8> {
        let mut v = vec![0u8; 0x48];
        for (i, t) in times_of(number).iter().enumerate() {
            LittleEndian::write_i64(&mut v[i * 8..i * 8 + 8], *t);
        }
        LittleEndian::write_u32(&mut v[0x20..0x24], self.nodes[&number].attributes);
        v
    }

    /// Build the `$I30` index of `dir`, writing INDX blocks to disk.
    /// Returns the attributes for the directory record and the block LCNs.
    fn build_index(&mut self, dir: u64) -> (Vec<Attr>, Vec<u64>) {
        let upcase = UpcaseTable::builtin();
        let mut keyed: Vec<(Vec<u16>, Item)> = Vec::new();
        for (&number, node) in &self.nodes {
            if node.parent != dir {
                continue;
            }
            for (name, namespace) in &node.names {
                let mut key = self.file_name_value(number, name, *namespace);
                if self.stale_keys.contains(&number) {
                    key[0x08..0x28].fill(0);
                    LittleEndian::write_u64(&mut key[0x28..0x30], 0);
                    LittleEndian::write_u64(&mut key[0x30..0x38], 1);
                    LittleEndian::write_u32(&mut key[0x38..0x3C], DOS_HIDDEN);
                }
                keyed.push((
                    name.encode_utf16().collect(),
                    Item {
                        reference: reference(number, node.sequence),
                        key,
                        child: None,
                    },
                ));
            }
        }
        keyed.sort_by(|a, b| upcase.compare(&a.0, &b.0));
        let items: Vec<Item> = keyed.into_iter().map(|(_, item)| item).collect();

        let (root_entries, blocks) = build_tree(items);
        let large = !blocks.is_empty();

        let mut root = vec![0u8; 0x20];
        LittleEndian::write_u32(&mut root[0x00..0x04], ATTR_FILE_NAME);
        LittleEndian::write_u32(&mut root[0x04..0x08], 1);
        LittleEndian::write_u32(&mut root[0x08..0x0C], CLUSTER as u32);
        root[0x0C] = 1;
        LittleEndian::write_u32(&mut root[0x10..0x14], 0x10);
        LittleEndian::write_u32(&mut root[0x14..0x18], 0x10 + root_entries.len() as u32);
        LittleEndian::write_u32(&mut root[0x18..0x1C], 0x10 + root_entries.len() as u32);
        root[0x1C] = u8::from(large);
        root.extend_from_slice(&root_entries);

        let mut attrs = vec![Attr::resident(ATTR_INDEX_ROOT, "$I30", root)];
        let mut lcns = Vec::new();
        if large {
            let first = self.alloc(blocks.len() as u64);
            for (vcn, (entries, internal)) in blocks.iter().enumerate() {
                let block = encode_indx(vcn as u64, entries, *internal);
                self.write_at(first + vcn as u64, &block);
                lcns.push(first + vcn as u64);
            }
            let bytes = (blocks.len() * CLUSTER) as u64;
            attrs.push(Attr::non_resident(
                ATTR_INDEX_ALLOCATION,
                "$I30",
                0,
                &[(Some(first), blocks.len() as u64)],
                0,
                (bytes, bytes, bytes),
            ));
            let mut bitmap = vec![0u8; align8(blocks.len().div_ceil(8))];
            for i in 0..blocks.len() {
                bitmap[i / 8] |= 1 << (i % 8);
            }
            attrs.push(Attr::resident(ATTR_BITMAP, "$I30", bitmap));
        }
        (attrs, lcns)
    }

    /// Encode the base record of `number` plus any extension records.
    fn encode_node(&self, number: u64, index_attrs: Vec<Attr>) -> Vec<(u64, Vec<u8>)> {
        let node = &self.nodes[&number];
        let own = reference(number, node.sequence);
        let mut base: Vec<Attr> = vec![Attr::resident(
            ATTR_STANDARD_INFORMATION,
            "",
            self.standard_information(number),
        )];
        let names: Vec<Attr> = node
            .names
            .iter()
            .map(|(name, ns)| Attr::resident(ATTR_FILE_NAME, "", self.file_name_value(number, name, *ns)))
            .collect();

        let mut out = Vec::new();
        match &node.data {
            Data::NonResident {
                runs,
                size,
                initialized,
                flags,
            } if !node.extensions.is_empty() => {
                let allocated = runs.iter().map(|r| r.1).sum::<u64>() * CLUSTER as u64;
                let head_clusters = runs[0].1;
                let head = Attr::non_resident(
                    ATTR_DATA,
                    "",
                    *flags,
                    &runs[..1],
                    0,
                    (allocated, *size, *initialized),
                );
                let tail = Attr::non_resident(ATTR_DATA, "", *flags, &runs[1..], head_clusters, (0, 0, 0));

                let mut list = Vec::new();
                list.extend(list_entry(ATTR_STANDARD_INFORMATION, 0, number, node.sequence, 0));
                for i in 0..names.len() {
                    list.extend(list_entry(ATTR_FILE_NAME, 0, number, node.sequence, 2 + i as u16));
                }
                let mut base_tail = names;
                if node.extensions.len() == 1 {
                    list.extend(list_entry(ATTR_DATA, 0, number, node.sequence, 2 + base_tail.len() as u16));
                    list.extend(list_entry(ATTR_DATA, head_clusters, node.extensions[0], 1, 0));
                    base_tail.push(head);
                    out.push((
                        node.extensions[0],
                        encode_record(node.extensions[0], 1, 0x0001, own, &[tail]),
                    ));
                } else {
                    list.extend(list_entry(ATTR_DATA, 0, node.extensions[0], 1, 0));
                    list.extend(list_entry(ATTR_DATA, head_clusters, node.extensions[1], 1, 0));
                    out.push((
                        node.extensions[0],
                        encode_record(node.extensions[0], 1, 0x0001, own, &[head]),
                    ));
                    out.push((
                        node.extensions[1],
                        encode_record(node.extensions[1], 1, 0x0001, own, &[tail]),
                    ));
                }
                base.push(Attr::resident(ATTR_ATTRIBUTE_LIST, "", list));
                base.extend(base_tail);
            }
            data => {
                base.extend(names);
                base.extend(node.extra.iter().cloned());
                match data {
                    Data::None => {}
                    Data::Resident(v) => base.push(Attr::resident(ATTR_DATA, "", v.clone())),
                    Data::NonResident {
                        runs,
                        size,
                        initialized,
                        flags,
                    } => {
                        let allocated = runs.iter().map(|r| r.1).sum::<u64>() * CLUSTER as u64;
                        base.push(Attr::non_resident(
                            ATTR_DATA,
                            "",
                            *flags,
                            runs,
                            0,
                            (allocated, *size, *initialized),
                        ));
                    }
                }
            }
        }
        base.extend(index_attrs);

        let flags = if node.directory { 0x0003 } else { 0x0001 };
        out.insert(0, (number, encode_record(number, node.sequence, flags, 0, &base)));
        out
    }

    pub fn build(mut self) -> Image {
        let dirs: Vec<u64> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.directory)
            .map(|(&number, _)| number)
            .collect();
        let mut index_attrs = BTreeMap::new();
        let mut index_blocks = BTreeMap::new();
        for dir in dirs {
            let (attrs, lcns) = self.build_index(dir);
            index_attrs.insert(dir, attrs);
            index_blocks.insert(dir, lcns);
        }

        let mut info = vec![0u8; 12];
        info[8] = self.version.0;
        info[9] = self.version.1;
        LittleEndian::write_u16(&mut info[10..12], u16::from(self.dirty));
        let label: Vec<u8> = LABEL.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        if let Some(volume) = self.nodes.get_mut(&3) {
            volume.extra = vec![
                Attr::resident(ATTR_VOLUME_NAME, "", label),
                Attr::resident(ATTR_VOLUME_INFORMATION, "", info),
            ];
        }

        // $Bitmap goes last, after every allocation
        let mut bitmap = vec![0u8; (TOTAL_CLUSTERS / 8) as usize];
        for (lcn, used) in self.used.iter().enumerate() {
            if *used {
                bitmap[lcn / 8] |= 1 << (lcn % 8);
            }
        }
        let bitmap_lcn = match &self.nodes[&6].data {
            Data::NonResident { runs, .. } => runs[0].0,
            _ => None,
        };
        if let Some(lcn) = bitmap_lcn {
            self.write_at(lcn, &bitmap);
        }
        let free_clusters = self.used.iter().filter(|u| !**u).count() as u64;

        let mut records: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        let numbers: Vec<u64> = self.nodes.keys().copied().collect();
        for number in numbers {
            let attrs = index_attrs.remove(&number).unwrap_or_default();
            for (n, bytes) in self.encode_node(number, attrs) {
                records.insert(n, bytes);
            }
        }
        for number in 0..MFT_RECORDS {
            let bytes = records
                .remove(&number)
                .unwrap_or_else(|| encode_record(number, 1, 0, 0, &[]));
            let offset = record_offset(number);
            self.image[offset..offset + RECORD].copy_from_slice(&bytes);
        }

        let boot = boot_sector();
        self.image[..SECTOR].copy_from_slice(&boot);

        let sequences = self.nodes.iter().map(|(&n, node)| (n, node.sequence)).collect();
        Image {
            bytes: self.image,
            free_clusters,
            index_blocks,
            sequences,
        }
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A finished image plus what the tests need to know about its layout.
#[derive(Clone)]
pub struct Image {
    pub bytes: Vec<u8>,
    pub free_clusters: u64,
    /// LCN of every INDX block, per directory record, in VCN order.
    pub index_blocks: BTreeMap<u64, Vec<u64>>,
    sequences: BTreeMap<u64, u16>,
}

impl Image {
    pub fn reference(&self, number: u64) -> MftReference {
        MftReference::new(number, self.sequences[&number])
    }

    pub fn device(&self) -> Box<dyn BlockDevice> {
        Box::new(StreamDevice::new(Cursor::new(self.bytes.clone()), SECTOR))
    }

    pub fn mount(&self) -> Arc<Volume> {
        self.mount_with(MountConfig::default())
    }

    pub fn mount_with(&self, config: MountConfig) -> Arc<Volume> {
        Volume::mount(self.device(), config).unwrap()
    }

    /// Break the update sequence of record `number` in its second sector.
    pub fn corrupt_record(&mut self, number: u64) {
        let offset = record_offset(number) + SECTOR * 2 - 2;
        self.bytes[offset] ^= 0xFF;
    }

    /// Break the update sequence of INDX block `vcn` of directory `dir`.
    pub fn corrupt_index_block(&mut self, dir: u64, vcn: usize) {
        let offset = self.index_blocks[&dir][vcn] as usize * CLUSTER + SECTOR - 2;
        self.bytes[offset] ^= 0xFF;
    }

    /// The image placed `offset` bytes into a larger disk.
    pub fn at_offset(&self, offset: usize) -> Vec<u8> {
        let mut disk = vec![0u8; offset];
        disk.extend_from_slice(&self.bytes);
        disk
    }
}

/// In-memory device that counts block reads and can be unplugged.
pub struct CountingDevice {
    data: Arc<Vec<u8>>,
    block_size: usize,
    monitor: DeviceMonitor,
}

/// Shared view on a [`CountingDevice`] that outlives the mount.
#[derive(Clone, Default)]
pub struct DeviceMonitor {
    reads: Arc<AtomicUsize>,
    gone: Arc<AtomicBool>,
}

impl DeviceMonitor {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.reads.store(0, Ordering::SeqCst);
    }

    pub fn unplug(&self) {
        self.gone.store(true, Ordering::SeqCst);
    }
}

impl CountingDevice {
    pub fn new(data: Vec<u8>, block_size: usize) -> (Self, DeviceMonitor) {
        let monitor = DeviceMonitor::default();
        (
            Self {
                data: Arc::new(data),
                block_size,
                monitor: monitor.clone(),
            },
            monitor,
        )
    }
}

impl BlockDevice for CountingDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        if self.monitor.gone.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device unplugged"));
        }
        self.monitor.reads.fetch_add(1, Ordering::SeqCst);
        let start = lba as usize * self.block_size;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of device"));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

fn reference(number: u64, sequence: u16) -> u64 {
    number | ((sequence as u64) << 48)
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Minimal little-endian two's complement encoding of `v`.
fn signed_bytes(v: i64) -> Vec<u8> {
    let bytes = v.to_le_bytes();
    for n in 1..=8 {
        let shift = 64 - 8 * n as u32;
        if n == 8 || (v << shift) >> shift == v {
            return bytes[..n].to_vec();
        }
    }
    bytes.to_vec()
}

fn encode_runs(runs: &[(Option<u64>, u64)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = 0i64;
    for &(lcn, length) in runs {
        let len_bytes = signed_bytes(length as i64);
        let off_bytes = match lcn {
            Some(lcn) => {
                let delta = signed_bytes(lcn as i64 - prev);
                prev = lcn as i64;
                delta
            }
            None => Vec::new(),
        };
        out.push(((off_bytes.len() as u8) << 4) | len_bytes.len() as u8);
        out.extend(len_bytes);
        out.extend(off_bytes);
    }
    out.push(0);
    out
}

fn encode_attr(attr: &Attr, instance: u16) -> Vec<u8> {
    let name: Vec<u8> = attr.name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    let name_len = name.len() / 2;
    match &attr.body {
        Body::Resident(value) => {
            let value_offset = align8(0x18 + name.len());
            let length = align8(value_offset + value.len());
            let mut a = vec![0u8; length];
            LittleEndian::write_u32(&mut a[0x00..0x04], attr.type_code);
            LittleEndian::write_u32(&mut a[0x04..0x08], length as u32);
            a[0x09] = name_len as u8;
            LittleEndian::write_u16(&mut a[0x0A..0x0C], 0x18);
            LittleEndian::write_u16(&mut a[0x0C..0x0E], attr.flags);
            LittleEndian::write_u16(&mut a[0x0E..0x10], instance);
            LittleEndian::write_u32(&mut a[0x10..0x14], value.len() as u32);
            LittleEndian::write_u16(&mut a[0x14..0x16], value_offset as u16);
            if attr.type_code == ATTR_FILE_NAME {
                a[0x16] = 1;
            }
            a[0x18..0x18 + name.len()].copy_from_slice(&name);
            a[value_offset..value_offset + value.len()].copy_from_slice(value);
            a
        }
        Body::NonResident {
            lowest,
            highest,
            pairs,
            sizes,
            compression_unit,
        } => {
            let pairs_offset = align8(0x40 + name.len());
            let length = align8(pairs_offset + pairs.len());
            let mut a = vec![0u8; length];
            LittleEndian::write_u32(&mut a[0x00..0x04], attr.type_code);
            LittleEndian::write_u32(&mut a[0x04..0x08], length as u32);
            a[0x08] = 1;
            a[0x09] = name_len as u8;
            LittleEndian::write_u16(&mut a[0x0A..0x0C], 0x40);
            LittleEndian::write_u16(&mut a[0x0C..0x0E], attr.flags);
            LittleEndian::write_u16(&mut a[0x0E..0x10], instance);
            LittleEndian::write_u64(&mut a[0x10..0x18], *lowest);
            LittleEndian::write_i64(&mut a[0x18..0x20], *highest);
            LittleEndian::write_u16(&mut a[0x20..0x22], pairs_offset as u16);
            a[0x22] = *compression_unit;
            LittleEndian::write_u64(&mut a[0x28..0x30], sizes.0);
            LittleEndian::write_u64(&mut a[0x30..0x38], sizes.1);
            LittleEndian::write_u64(&mut a[0x38..0x40], sizes.2);
            a[0x40..0x40 + name.len()].copy_from_slice(&name);
            a[pairs_offset..pairs_offset + pairs.len()].copy_from_slice(pairs);
            a
        }
    }
}

fn list_entry(type_code: u32, lowest_vcn: u64, record: u64, sequence: u16, instance: u16) -> Vec<u8> {
    let mut e = vec![0u8; 0x20];
    LittleEndian::write_u32(&mut e[0x00..0x04], type_code);
    LittleEndian::write_u16(&mut e[0x04..0x06], 0x20);
    e[0x07] = 0x1A;
    LittleEndian::write_u64(&mut e[0x08..0x10], lowest_vcn);
    LittleEndian::write_u64(&mut e[0x10..0x18], reference(record, sequence));
    LittleEndian::write_u16(&mut e[0x18..0x1A], instance);
    e
}

/// Install an update sequence array at `usa_offset`.
fn protect(buf: &mut [u8], usa_offset: usize, usn: u16) {
    let count = buf.len() / SECTOR + 1;
    LittleEndian::write_u16(&mut buf[usa_offset..usa_offset + 2], usn);
    for i in 1..count {
        let end = i * SECTOR - 2;
        let (saved0, saved1) = (buf[end], buf[end + 1]);
        buf[usa_offset + i * 2] = saved0;
        buf[usa_offset + i * 2 + 1] = saved1;
        LittleEndian::write_u16(&mut buf[end..end + 2], usn);
    }
}

fn encode_record(number: u64, sequence: u16, flags: u16, base: u64, attrs: &[Attr]) -> Vec<u8> {
    let mut rec = vec![0u8; RECORD];
    rec[0..4].copy_from_slice(b"FILE");
    LittleEndian::write_u16(&mut rec[0x04..0x06], 0x30);
    LittleEndian::write_u16(&mut rec[0x06..0x08], (RECORD / SECTOR + 1) as u16);
    LittleEndian::write_u16(&mut rec[0x10..0x12], sequence);
    LittleEndian::write_u16(&mut rec[0x12..0x14], 1);
    LittleEndian::write_u16(&mut rec[0x14..0x16], 0x38);
    LittleEndian::write_u16(&mut rec[0x16..0x18], flags);
    LittleEndian::write_u32(&mut rec[0x1C..0x20], RECORD as u32);
    LittleEndian::write_u64(&mut rec[0x20..0x28], base);
    LittleEndian::write_u16(&mut rec[0x28..0x2A], attrs.len() as u16);
    LittleEndian::write_u32(&mut rec[0x2C..0x30], number as u32);

    let mut pos = 0x38;
    for (i, attr) in attrs.iter().enumerate() {
        let bytes = encode_attr(attr, i as u16);
        assert!(pos + bytes.len() + 8 <= RECORD, "record {number} overflows");
        rec[pos..pos + bytes.len()].copy_from_slice(&bytes);
        pos += bytes.len();
    }
    LittleEndian::write_u32(&mut rec[pos..pos + 4], 0xFFFF_FFFF);
    pos += 8;
    LittleEndian::write_u32(&mut rec[0x18..0x1C], pos as u32);

    protect(&mut rec, 0x30, 0x0001 + (number as u16 & 0x0FFF));
    rec
}

#[derive(Debug, Clone)]
struct Item {
    reference: u64,
    key: Vec<u8>,
    /// Sub-node holding the entries that sort before this one.
    child: Option<u64>,
}

fn entry_len(item: &Item) -> usize {
    align8(0x10 + item.key.len()) + if item.child.is_some() { 8 } else { 0 }
}

fn end_len(child: Option<u64>) -> usize {
    if child.is_some() {
        0x18
    } else {
        0x10
    }
}

fn encode_entries(items: &[Item], end_child: Option<u64>) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        let len = entry_len(item);
        let mut e = vec![0u8; len];
        LittleEndian::write_u64(&mut e[0x00..0x08], item.reference);
        LittleEndian::write_u16(&mut e[0x08..0x0A], len as u16);
        LittleEndian::write_u16(&mut e[0x0A..0x0C], item.key.len() as u16);
        if let Some(vcn) = item.child {
            LittleEndian::write_u16(&mut e[0x0C..0x0E], 0x01);
            LittleEndian::write_u64(&mut e[len - 8..len], vcn);
        }
        e[0x10..0x10 + item.key.len()].copy_from_slice(&item.key);
        out.extend(e);
    }
    let len = end_len(end_child);
    let mut e = vec![0u8; len];
    LittleEndian::write_u16(&mut e[0x08..0x0A], len as u16);
    match end_child {
        Some(vcn) => {
            LittleEndian::write_u16(&mut e[0x0C..0x0E], 0x03);
            LittleEndian::write_u64(&mut e[0x10..0x18], vcn);
        }
        None => LittleEndian::write_u16(&mut e[0x0C..0x0E], 0x02),
    }
    out.extend(e);
    out
}

/// Pack sorted entries into a B+-tree bottom-up. Returns the root node's
/// entries and every INDX block (entries, has sub-nodes) in VCN order.
fn build_tree(mut items: Vec<Item>) -> (Vec<u8>, Vec<(Vec<u8>, bool)>) {
    let mut blocks: Vec<(Vec<u8>, bool)> = Vec::new();
    let mut last: Option<u64> = None;
    loop {
        let size: usize = items.iter().map(entry_len).sum::<usize>() + end_len(last);
        if size <= ROOT_BUDGET {
            return (encode_entries(&items, last), blocks);
        }

        let mut parents = Vec::new();
        let mut start = 0;
        let n = items.len();
        loop {
            let mut end = start;
            let mut used = end_len(Some(0));
            while end < n && used + entry_len(&items[end]) <= NODE_BUDGET {
                used += entry_len(&items[end]);
                end += 1;
            }
            let vcn = blocks.len() as u64;
            if end == n {
                let internal = last.is_some();
                blocks.push((encode_entries(&items[start..], last), internal));
                last = Some(vcn);
                break;
            }
            // Keep at least one entry after the separator
            if end + 1 == n {
                end -= 1;
            }
            assert!(end > start, "index entry too large for a block");
            let separator = &items[end];
            let internal = separator.child.is_some();
            blocks.push((encode_entries(&items[start..end], separator.child), internal));
            parents.push(Item {
                reference: separator.reference,
                key: separator.key.clone(),
                child: Some(vcn),
            });
            start = end + 1;
        }
        items = parents;
    }
}

fn encode_indx(vcn: u64, entries: &[u8], internal: bool) -> Vec<u8> {
    let mut b = vec![0u8; CLUSTER];
    b[0..4].copy_from_slice(b"INDX");
    LittleEndian::write_u16(&mut b[0x04..0x06], 0x28);
    LittleEndian::write_u16(&mut b[0x06..0x08], (CLUSTER / SECTOR + 1) as u16);
    LittleEndian::write_u64(&mut b[0x10..0x18], vcn);
    LittleEndian::write_u32(&mut b[0x18..0x1C], 0x28);
    LittleEndian::write_u32(&mut b[0x1C..0x20], 0x28 + entries.len() as u32);
    LittleEndian::write_u32(&mut b[0x20..0x24], (CLUSTER - 0x18) as u32);
    b[0x24] = u8::from(internal);
    b[0x40..0x40 + entries.len()].copy_from_slice(entries);
    protect(&mut b, 0x28, 0x0100 + vcn as u16);
    b
}

fn boot_sector() -> Vec<u8> {
    let mut b = vec![0u8; SECTOR];
    b[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
    b[3..11].copy_from_slice(b"NTFS    ");
    LittleEndian::write_u16(&mut b[0x0B..0x0D], SECTOR as u16);
    b[0x0D] = (CLUSTER / SECTOR) as u8;
    b[0x15] = 0xF8;
    LittleEndian::write_u16(&mut b[0x18..0x1A], 63);
    LittleEndian::write_u16(&mut b[0x1A..0x1C], 255);
    LittleEndian::write_u64(&mut b[0x28..0x30], TOTAL_CLUSTERS * (CLUSTER / SECTOR) as u64);
    LittleEndian::write_u64(&mut b[0x30..0x38], MFT_HEAD.0);
    LittleEndian::write_u64(&mut b[0x38..0x40], MFT_MIRROR_LCN);
    b[0x40] = (-10i8) as u8;
    b[0x44] = 1;
    LittleEndian::write_u64(&mut b[0x48..0x50], SERIAL);
    b[510] = 0x55;
    b[511] = 0xAA;
    b
}
