//! Block device adapter.
//!
//! The engine only ever sees byte ranges. Whatever sits underneath (an image
//! file, a raw disk, a firmware read callback) is wrapped in a [`BlockDevice`]
//! and [`Disk`] turns arbitrary byte ranges into whole-block reads.

use std::io::{self, Read, Seek, SeekFrom};

use log::trace;

use crate::error::{NtfsError, Result};

/// A device addressed in fixed-size blocks.
///
/// Reads are blocking and are never retried by the engine; a retry policy,
/// if any, belongs to the implementation.
pub trait BlockDevice: Send {
    /// Size of one block in bytes. Must not change while mounted.
    fn block_size(&self) -> usize;

    /// Fill `buf` (a whole number of blocks) starting at block `lba`.
    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// A device backed by any seekable reader (image files, `Cursor<Vec<u8>>`).
pub struct StreamDevice<R> {
    inner: R,
    block_size: usize,
}

impl<R: Read + Seek + Send> StreamDevice<R> {
    pub fn new(inner: R, block_size: usize) -> Self {
        Self { inner, block_size }
    }
}

impl<R: Read + Seek + Send> BlockDevice for StreamDevice<R> {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        self.inner
            .seek(SeekFrom::Start(lba * self.block_size as u64))?;
        self.inner.read_exact(buf)
    }
}

/// A device backed by a plain read callback `(lba, buf)`.
pub struct FnDevice<F> {
    read: F,
    block_size: usize,
}

impl<F> FnDevice<F>
where
    F: FnMut(u64, &mut [u8]) -> io::Result<()> + Send,
{
    pub fn new(block_size: usize, read: F) -> Self {
        Self { read, block_size }
    }
}

impl<F> BlockDevice for FnDevice<F>
where
    F: FnMut(u64, &mut [u8]) -> io::Result<()> + Send,
{
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        (self.read)(lba, buf)
    }
}

/// Byte-range view over a [`BlockDevice`], starting at a partition offset.
pub struct Disk {
    dev: Box<dyn BlockDevice>,
    block_size: u64,
    base_offset: u64,
    bounce: Vec<u8>,
}

impl Disk {
    pub fn new(dev: Box<dyn BlockDevice>, base_offset: u64) -> Result<Self> {
        let block_size = dev.block_size();
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(NtfsError::InvalidParameter(format!(
                "device block size {block_size} is not a power of two"
            )));
        }
        Ok(Self {
            dev,
            block_size: block_size as u64,
            base_offset,
            bounce: vec![0u8; block_size],
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    /// Read `buf.len()` bytes at byte `offset` from the partition start.
    ///
    /// Block-aligned middles go straight into `buf` in one device call;
    /// unaligned heads and tails go through a one-block bounce buffer.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut pos = self
            .base_offset
            .checked_add(offset)
            .ok_or_else(|| NtfsError::InvalidParameter(format!("offset {offset:#x} overflows")))?;
        let bs = self.block_size;
        let mut done = 0usize;

        while done < buf.len() {
            let lba = pos / bs;
            let within = (pos % bs) as usize;
            let remaining = buf.len() - done;

            if within == 0 && remaining as u64 >= bs {
                let whole = remaining - remaining % bs as usize;
                trace!("disk: read lba {lba} x{}", whole as u64 / bs);
                self.dev.read_blocks(lba, &mut buf[done..done + whole])?;
                done += whole;
                pos += whole as u64;
            } else {
                trace!("disk: bounce read lba {lba}");
                self.dev.read_blocks(lba, &mut self.bounce)?;
                let n = (bs as usize - within).min(remaining);
                buf[done..done + n].copy_from_slice(&self.bounce[within..within + n]);
                done += n;
                pos += n as u64;
            }
        }

        Ok(())
    }
}
