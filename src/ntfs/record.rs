//! MFT FILE records: header, update sequence fix-up and attribute headers.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::{utf16_units, ATTR_END, USA_STRIDE};
use crate::error::{corrupt, Result};

/// Record in-use flag.
pub const RECORD_IN_USE: u16 = 0x0001;
/// Record describes a directory (has a filename index).
pub const RECORD_IS_DIRECTORY: u16 = 0x0002;

/// Attribute header flags
pub const ATTR_FLAG_COMPRESSED: u16 = 0x0001;
pub const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;

/// 48-bit record number plus 16-bit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MftReference(u64);

impl MftReference {
    pub fn new(record: u64, sequence: u16) -> Self {
        Self((record & 0x0000_FFFF_FFFF_FFFF) | ((sequence as u64) << 48))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn record_number(self) -> u64 {
        self.0 & 0x0000_FFFF_FFFF_FFFF
    }

    /// Sequence number; zero means the reference is not checked.
    pub fn sequence(self) -> u16 {
        (self.0 >> 48) as u16
    }
}

impl fmt::Display for MftReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.record_number(), self.sequence())
    }
}

/// Validate and undo the update sequence array of a multi-sector record.
///
/// The USA stride is always 512 bytes. Every stride must end with the
/// update sequence number, which is then replaced by the saved bytes.
pub(crate) fn apply_fixup(record: &mut [u8], what: &str) -> Result<()> {
    if record.len() < USA_STRIDE || record.len() % USA_STRIDE != 0 {
        return Err(corrupt(format!(
            "{what}: size {} is not a multiple of {USA_STRIDE}",
            record.len()
        )));
    }

    let usa_ofs = LittleEndian::read_u16(&record[0x04..0x06]) as usize;
    let usa_count = LittleEndian::read_u16(&record[0x06..0x08]) as usize;
    let strides = record.len() / USA_STRIDE;

    if usa_count != strides + 1 {
        return Err(corrupt(format!(
            "{what}: update sequence count {usa_count}, expected {}",
            strides + 1
        )));
    }
    if usa_ofs < 0x08 || usa_ofs % 2 != 0 || usa_ofs + usa_count * 2 > USA_STRIDE - 2 {
        return Err(corrupt(format!(
            "{what}: update sequence array at {usa_ofs:#x} out of bounds"
        )));
    }

    let usn = [record[usa_ofs], record[usa_ofs + 1]];
    for i in 1..usa_count {
        let pos = i * USA_STRIDE - 2;
        if record[pos..pos + 2] != usn {
            return Err(corrupt(format!(
                "{what}: fixup mismatch at stride {i}: expected {:#06x}, got {:#06x}",
                u16::from_le_bytes(usn),
                u16::from_le_bytes([record[pos], record[pos + 1]])
            )));
        }
        let saved = usa_ofs + i * 2;
        record[pos] = record[saved];
        record[pos + 1] = record[saved + 1];
    }

    Ok(())
}

/// Non-resident attribute header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonResident {
    pub lowest_vcn: u64,
    pub highest_vcn: i64,
    pub compression_unit: u8,
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
    /// Raw mapping pairs, decoded on demand by [`super::runlist::Runlist`].
    pub mapping_pairs: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeBody {
    Resident(Vec<u8>),
    NonResident(NonResident),
}

/// One attribute header plus its value or run-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub type_code: u32,
    pub name: Vec<u16>,
    pub flags: u16,
    pub instance: u16,
    pub body: AttributeBody,
}

impl Attribute {
    pub fn is_resident(&self) -> bool {
        matches!(self.body, AttributeBody::Resident(_))
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & ATTR_FLAG_COMPRESSED != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & ATTR_FLAG_ENCRYPTED != 0
    }

    pub fn resident_value(&self) -> Option<&[u8]> {
        match &self.body {
            AttributeBody::Resident(value) => Some(value),
            AttributeBody::NonResident(_) => None,
        }
    }

    pub fn non_resident(&self) -> Option<&NonResident> {
        match &self.body {
            AttributeBody::NonResident(nr) => Some(nr),
            AttributeBody::Resident(_) => None,
        }
    }

    /// Ordinal comparison of the attribute name; `""` matches unnamed attributes.
    pub fn has_name(&self, name: &str) -> bool {
        self.name.iter().copied().eq(name.encode_utf16())
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf16_lossy(&self.name)
    }

    fn parse(data: &[u8], record: u64, offset: usize) -> Result<Self> {
        let err = |what: &str| corrupt(format!("record {record}: attribute at {offset:#x}: {what}"));

        if data.len() < 0x18 {
            return Err(err("header truncated"));
        }
        let type_code = LittleEndian::read_u32(&data[0x00..0x04]);
        let non_resident = data[0x08] != 0;
        let name_len = data[0x09] as usize;
        let name_offset = LittleEndian::read_u16(&data[0x0A..0x0C]) as usize;
        let flags = LittleEndian::read_u16(&data[0x0C..0x0E]);
        let instance = LittleEndian::read_u16(&data[0x0E..0x10]);

        let name = if name_len > 0 {
            let end = name_offset + name_len * 2;
            if end > data.len() {
                return Err(err("name out of bounds"));
            }
            utf16_units(&data[name_offset..end])
        } else {
            Vec::new()
        };

        let body = if !non_resident {
            let value_len = LittleEndian::read_u32(&data[0x10..0x14]) as usize;
            let value_offset = LittleEndian::read_u16(&data[0x14..0x16]) as usize;
            let end = value_offset
                .checked_add(value_len)
                .filter(|&end| end <= data.len())
                .ok_or_else(|| err("resident value out of bounds"))?;
            AttributeBody::Resident(data[value_offset..end].to_vec())
        } else {
            if data.len() < 0x40 {
                return Err(err("non-resident header truncated"));
            }
            let pairs_offset = LittleEndian::read_u16(&data[0x20..0x22]) as usize;
            if pairs_offset < 0x40 || pairs_offset > data.len() {
                return Err(err("mapping pairs out of bounds"));
            }
            AttributeBody::NonResident(NonResident {
                lowest_vcn: LittleEndian::read_u64(&data[0x10..0x18]),
                highest_vcn: LittleEndian::read_i64(&data[0x18..0x20]),
                compression_unit: data[0x22],
                allocated_size: LittleEndian::read_u64(&data[0x28..0x30]),
                data_size: LittleEndian::read_u64(&data[0x30..0x38]),
                initialized_size: LittleEndian::read_u64(&data[0x38..0x40]),
                mapping_pairs: data[pairs_offset..].to_vec(),
            })
        };

        Ok(Self {
            type_code,
            name,
            flags,
            instance,
            body,
        })
    }
}

/// A fix-up validated FILE record with its attributes parsed.
#[derive(Debug, Clone)]
pub struct FileRecord {
    number: u64,
    sequence: u16,
    link_count: u16,
    flags: u16,
    base: MftReference,
    attributes: Vec<Attribute>,
}

impl FileRecord {
    /// Parse record `number` from its raw on-disk bytes.
    pub fn parse(number: u64, mut buf: Vec<u8>) -> Result<Self> {
        if buf.len() < 0x30 {
            return Err(corrupt(format!("record {number}: too small")));
        }
        match &buf[0..4] {
            b"FILE" => {}
            b"BAAD" => return Err(corrupt(format!("record {number}: marked BAAD"))),
            other => {
                return Err(corrupt(format!(
                    "record {number}: bad magic {:02x?}",
                    other
                )))
            }
        }
        apply_fixup(&mut buf, &format!("record {number}"))?;

        let sequence = LittleEndian::read_u16(&buf[0x10..0x12]);
        let link_count = LittleEndian::read_u16(&buf[0x12..0x14]);
        let attrs_offset = LittleEndian::read_u16(&buf[0x14..0x16]) as usize;
        let flags = LittleEndian::read_u16(&buf[0x16..0x18]);
        let bytes_in_use = LittleEndian::read_u32(&buf[0x18..0x1C]) as usize;
        let base = MftReference::from_raw(LittleEndian::read_u64(&buf[0x20..0x28]));

        if bytes_in_use > buf.len() || attrs_offset < 0x30 || attrs_offset >= bytes_in_use {
            return Err(corrupt(format!(
                "record {number}: attributes at {attrs_offset:#x}, {bytes_in_use} bytes in use"
            )));
        }

        let mut attributes = Vec::new();
        let mut offset = attrs_offset;
        loop {
            if offset + 4 > bytes_in_use {
                return Err(corrupt(format!("record {number}: missing end marker")));
            }
            let type_code = LittleEndian::read_u32(&buf[offset..offset + 4]);
            if type_code == ATTR_END {
                break;
            }
            if offset + 8 > bytes_in_use {
                return Err(corrupt(format!("record {number}: attribute header truncated")));
            }
            let length = LittleEndian::read_u32(&buf[offset + 4..offset + 8]) as usize;
            if length < 0x18 || length % 8 != 0 || offset + length > bytes_in_use {
                return Err(corrupt(format!(
                    "record {number}: attribute at {offset:#x} has bad length {length}"
                )));
            }
            attributes.push(Attribute::parse(&buf[offset..offset + length], number, offset)?);
            offset += length;
        }

        Ok(Self {
            number,
            sequence,
            link_count,
            flags,
            base,
            attributes,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn link_count(&self) -> u16 {
        self.link_count
    }

    /// Reference to this record carrying its current sequence number.
    pub fn reference(&self) -> MftReference {
        MftReference::new(self.number, self.sequence)
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & RECORD_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & RECORD_IS_DIRECTORY != 0
    }

    /// Base record of an extension record; `None` for base records.
    pub fn base_reference(&self) -> Option<MftReference> {
        (self.base.record_number() != 0 || self.base.sequence() != 0).then_some(self.base)
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn find(&self, type_code: u32, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.type_code == type_code && a.has_name(name))
    }

    pub fn find_all(&self, type_code: u32) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(move |a| a.type_code == type_code)
    }
}
