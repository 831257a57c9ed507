//! Run-list (mapping pairs) decoding and VCN lookup.

use crate::error::{corrupt, Result};

/// One contiguous run of clusters. `lcn == None` is a sparse hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub vcn: u64,
    pub lcn: Option<u64>,
    pub length: u64,
}

impl Run {
    pub fn end_vcn(&self) -> u64 {
        self.vcn + self.length
    }
}

/// Ordered, gap-free list of runs covering `[start_vcn, end_vcn)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Runlist {
    runs: Vec<Run>,
    start_vcn: u64,
    end_vcn: u64,
}

/// Read a little-endian signed integer of `size` bytes (1..=8).
fn read_signed(bytes: &[u8]) -> i64 {
    let mut value: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as i64) << (i * 8);
    }
    // Sign-extend
    let size = bytes.len();
    if size < 8 && bytes[size - 1] & 0x80 != 0 {
        for i in size..8 {
            value |= 0xFF_i64 << (i * 8);
        }
    }
    value
}

impl Runlist {
    /// Decode mapping pairs for an extent covering `lowest_vcn..=highest_vcn`.
    ///
    /// Any truncated pair, overflow, negative length or LCN, or a decoded
    /// extent that does not end at `highest_vcn + 1` is `Corrupt`.
    pub fn decode(data: &[u8], lowest_vcn: u64, highest_vcn: i64) -> Result<Self> {
        let mut runs = Vec::new();
        let mut pos = 0;
        let mut vcn = lowest_vcn;
        let mut prev_lcn: i64 = 0;

        loop {
            let header = *data
                .get(pos)
                .ok_or_else(|| corrupt("run-list not terminated"))?;
            if header == 0 {
                break;
            }
            pos += 1;

            let length_size = (header & 0x0F) as usize;
            let offset_size = ((header >> 4) & 0x0F) as usize;
            if length_size == 0 || length_size > 8 || offset_size > 8 {
                return Err(corrupt(format!("run-list header {header:#04x} invalid")));
            }
            if pos + length_size + offset_size > data.len() {
                return Err(corrupt("run-list truncated"));
            }

            let length = read_signed(&data[pos..pos + length_size]);
            pos += length_size;
            if length <= 0 {
                return Err(corrupt(format!("run-list length {length} not positive")));
            }
            let length = length as u64;

            let lcn = if offset_size == 0 {
                // Sparse run; the previous LCN stays the reference point
                None
            } else {
                let delta = read_signed(&data[pos..pos + offset_size]);
                pos += offset_size;
                let lcn = prev_lcn
                    .checked_add(delta)
                    .ok_or_else(|| corrupt("run-list LCN overflow"))?;
                if lcn < 0 {
                    return Err(corrupt(format!("run-list LCN {lcn} negative")));
                }
                prev_lcn = lcn;
                Some(lcn as u64)
            };

            let end = vcn
                .checked_add(length)
                .ok_or_else(|| corrupt("run-list VCN overflow"))?;
            if let Some(lcn) = lcn {
                lcn.checked_add(length)
                    .ok_or_else(|| corrupt("run-list LCN overflow"))?;
            }
            runs.push(Run { vcn, lcn, length });
            vcn = end;
        }

        let expected_end = highest_vcn
            .checked_add(1)
            .filter(|&e| e >= 0)
            .ok_or_else(|| corrupt(format!("highest VCN {highest_vcn} invalid")))?;
        if vcn as i64 != expected_end {
            return Err(corrupt(format!(
                "run-list ends at VCN {vcn}, header says {expected_end}"
            )));
        }

        Ok(Self {
            runs,
            start_vcn: lowest_vcn,
            end_vcn: vcn,
        })
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn start_vcn(&self) -> u64 {
        self.start_vcn
    }

    pub fn end_vcn(&self) -> u64 {
        self.end_vcn
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Number of clusters actually allocated on disk (sparse runs excluded).
    pub fn allocated_clusters(&self) -> u64 {
        self.runs
            .iter()
            .filter(|r| r.lcn.is_some())
            .map(|r| r.length)
            .sum()
    }

    /// Run containing `vcn`, by binary search.
    pub fn find(&self, vcn: u64) -> Option<&Run> {
        let idx = self.runs.partition_point(|r| r.end_vcn() <= vcn);
        self.runs.get(idx).filter(|r| r.vcn <= vcn)
    }

    /// Append the run-list of the next attribute extent. The extents must be
    /// contiguous in VCN space.
    pub fn append(&mut self, next: Runlist) -> Result<()> {
        if self.runs.is_empty() && self.end_vcn == self.start_vcn && self.start_vcn == 0 {
            if next.start_vcn != 0 {
                return Err(corrupt(format!(
                    "first attribute extent starts at VCN {}",
                    next.start_vcn
                )));
            }
            *self = next;
            return Ok(());
        }
        if next.start_vcn != self.end_vcn {
            return Err(corrupt(format!(
                "attribute extents not contiguous: {} then {}",
                self.end_vcn, next.start_vcn
            )));
        }
        self.end_vcn = next.end_vcn;
        self.runs.extend(next.runs);
        Ok(())
    }

    /// Every allocated run must fit inside a volume of `total_clusters`.
    pub fn check_bounds(&self, total_clusters: u64) -> Result<()> {
        for run in &self.runs {
            if let Some(lcn) = run.lcn {
                if lcn + run.length > total_clusters {
                    return Err(corrupt(format!(
                        "run at LCN {lcn} x{} exceeds volume of {total_clusters} clusters",
                        run.length
                    )));
                }
            }
        }
        Ok(())
    }
}
