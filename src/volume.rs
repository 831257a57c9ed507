//! Volume lifecycle: mount, shared state behind one lock, unmount.
//!
//! Every public operation takes the volume lock exactly once and then works
//! on [`Mounted`] without further locking. Handles are created and dropped
//! outside the lock.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};

use crate::config::MountConfig;
use crate::device::{BlockDevice, Disk, FnDevice};
use crate::error::{corrupt, NtfsError, Result};
use crate::handle::{DirEntryInfo, FileHandle, FileInfo};
use crate::ntfs::attribute::open_attribute;
use crate::ntfs::index::{IndexCursor, IndexEntry};
use crate::ntfs::path::{self, DirectoryLookup};
use crate::ntfs::{
    FileAttributes, FileRecord, Inode, InodeCache, InodeId, MftReference, Ntfs, ATTR_DATA,
    ATTR_VOLUME_INFORMATION, ATTR_VOLUME_NAME, MFT_RECORD_BITMAP, MFT_RECORD_FIRST_USER,
    MFT_RECORD_ROOT, MFT_RECORD_VOLUME,
};

/// `$VOLUME_INFORMATION` dirty flag.
const VOLUME_IS_DIRTY: u16 = 0x0001;

/// Chunk size used when scanning `$Bitmap`.
const BITMAP_CHUNK: usize = 64 * 1024;

/// Summary of a mounted volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub label: String,
    pub serial_number: u64,
    pub ntfs_version: (u8, u8),
    pub cluster_size: u64,
    pub total_size: u64,
    pub free_size: u64,
    pub read_only: bool,
    pub dirty: bool,
}

/// State of a mounted volume. Only reachable through the volume lock.
pub(crate) struct Mounted {
    pub(crate) fs: Ntfs,
    pub(crate) cache: InodeCache,
    pub(crate) root: InodeId,
    pub(crate) root_ref: MftReference,
    pub(crate) open_handles: usize,
    pub(crate) config: MountConfig,
    label: String,
    version: (u8, u8),
    dirty: bool,
}

enum VolumeState {
    Mounted(Box<Mounted>),
    Unmounted,
}

/// A mounted NTFS volume, shareable across threads through `Arc`.
pub struct Volume {
    state: Mutex<VolumeState>,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

/// Combine on-disk attribute bits with what a read-only volume implies.
pub(crate) fn translate_attributes(record: u64, is_directory: bool, raw: u32) -> FileAttributes {
    let mut attrs = FileAttributes::from_bits_truncate(raw)
        & (FileAttributes::READ_ONLY
            | FileAttributes::HIDDEN
            | FileAttributes::SYSTEM
            | FileAttributes::ARCHIVE);
    if record < MFT_RECORD_FIRST_USER {
        attrs |= FileAttributes::SYSTEM | FileAttributes::READ_ONLY;
    }
    if is_directory {
        attrs |= FileAttributes::DIRECTORY | FileAttributes::READ_ONLY;
    }
    attrs
}

impl Mounted {
    /// Inode for `reference`: the cached one if open, else a transient load.
    fn inode(&mut self, reference: MftReference) -> Result<Arc<Inode>> {
        match self.cache.cached(reference)? {
            Some(inode) => Ok(inode),
            None => Ok(Arc::new(Inode::load(&mut self.fs, reference)?)),
        }
    }

    pub(crate) fn lookup(&mut self, dir: MftReference, name: &str) -> Result<IndexEntry> {
        let inode = self.inode(dir)?;
        let index = inode.index()?;
        let name16: Vec<u16> = name.encode_utf16().collect();
        index.lookup(&mut self.fs.disk, &self.fs.upcase, &name16)
    }

    /// Resolve `path` against `base` and open the target in the cache.
    pub(crate) fn open_path(
        &mut self,
        base: &[MftReference],
        path: &str,
    ) -> Result<(Vec<MftReference>, InodeId)> {
        let stack = path::resolve(self, base, path)?;
        let target = *stack
            .last()
            .ok_or_else(|| NtfsError::InvalidParameter("empty path stack".into()))?;
        let id = self.cache.open(&mut self.fs, target)?;
        self.open_handles += 1;
        Ok((stack, id))
    }

    pub(crate) fn release(&mut self, id: InodeId) {
        self.cache.close(id);
        self.open_handles = self.open_handles.saturating_sub(1);
    }

    /// Whether an index entry names something worth loading for a listing.
    /// DOS-only aliases, the self entry and hidden metafiles are skipped.
    fn is_listed(&self, dir: MftReference, entry: &IndexEntry) -> bool {
        let record = entry.reference.record_number();
        if entry.key.namespace.is_dos_only() || record == dir.record_number() {
            return false;
        }
        record >= MFT_RECORD_FIRST_USER || self.config.show_system_files
    }

    /// Visibility of a listing entry under the current config.
    fn is_visible(&self, info: &FileInfo) -> bool {
        if info.attributes.contains(FileAttributes::SYSTEM) && !self.config.show_system_files {
            return false;
        }
        if info.attributes.contains(FileAttributes::HIDDEN) && !self.config.show_hidden_files {
            return false;
        }
        true
    }

    /// Next visible entry of the directory `id` from `cursor`. Metadata comes
    /// from each entry's own record; the index key only supplies the name.
    pub(crate) fn next_visible(
        &mut self,
        id: InodeId,
        cursor: &mut IndexCursor,
    ) -> Result<Option<DirEntryInfo>> {
        let dir = self.cache.get(id)?;
        let index = dir.index()?;
        while let Some(entry) = cursor.next_entry(index, &mut self.fs.disk)? {
            if !self.is_listed(dir.reference(), &entry) {
                continue;
            }
            let inode = self.inode(entry.reference)?;
            let mut info = DirEntryInfo::from_inode(&inode);
            info.name = entry.key.name_string();
            if self.is_visible(&info) {
                return Ok(Some(info));
            }
        }
        Ok(None)
    }

    fn read_label(volume: &FileRecord) -> String {
        match volume.find(ATTR_VOLUME_NAME, "").and_then(|a| a.resident_value()) {
            Some(value) => String::from_utf16_lossy(&crate::ntfs::utf16_units(value)),
            None => {
                debug!("volume: no $VOLUME_NAME");
                String::new()
            }
        }
    }

    fn read_version(volume: &FileRecord) -> Result<((u8, u8), bool)> {
        let value = volume
            .find(ATTR_VOLUME_INFORMATION, "")
            .and_then(|a| a.resident_value())
            .ok_or_else(|| corrupt("$Volume lacks $VOLUME_INFORMATION"))?;
        if value.len() < 0x0C {
            return Err(corrupt("$VOLUME_INFORMATION too short"));
        }
        let flags = LittleEndian::read_u16(&value[0x0A..0x0C]);
        Ok(((value[0x08], value[0x09]), flags & VOLUME_IS_DIRTY != 0))
    }

    /// Free bytes according to `$Bitmap`.
    fn free_space(&mut self) -> Result<u64> {
        let Ntfs {
            disk, mft, boot, ..
        } = &mut self.fs;
        let record = mft.load(disk, MftReference::new(MFT_RECORD_BITMAP, 0))?;
        let bitmap = open_attribute(disk, mft, &record, ATTR_DATA, "")?
            .ok_or_else(|| corrupt("$Bitmap has no $DATA"))?;

        let total_clusters = boot.total_clusters();
        let needed = total_clusters.div_ceil(8);
        if bitmap.len() < needed {
            return Err(corrupt(format!(
                "$Bitmap is {} bytes, volume needs {needed}",
                bitmap.len()
            )));
        }

        let mut used = 0u64;
        let mut chunk = vec![0u8; BITMAP_CHUNK];
        let mut offset = 0u64;
        while offset < needed {
            let want = ((needed - offset) as usize).min(BITMAP_CHUNK);
            let n = bitmap.read(disk, offset, &mut chunk[..want])?;
            if n != want {
                return Err(corrupt("$Bitmap short read"));
            }
            used += count_set_bits(&chunk[..n]);
            offset += n as u64;
        }
        // Bits past the last cluster in the final byte do not count
        let tail_bits = total_clusters % 8;
        if tail_bits != 0 {
            let mut last = [0u8; 1];
            bitmap.read(disk, needed - 1, &mut last)?;
            used -= (last[0] >> tail_bits).count_ones() as u64;
        }

        Ok(total_clusters.saturating_sub(used) * boot.cluster_size())
    }
}

/// Count set bits in a bitmap.
fn count_set_bits(data: &[u8]) -> u64 {
    data.iter().map(|b| b.count_ones() as u64).sum()
}

impl DirectoryLookup for Mounted {
    fn lookup_child(&mut self, dir: MftReference, name: &str) -> Result<MftReference> {
        Ok(self.lookup(dir, name)?.reference)
    }

    fn is_directory(&mut self, reference: MftReference) -> Result<bool> {
        if let Some(inode) = self.cache.cached(reference)? {
            return Ok(inode.is_directory());
        }
        let record = self.fs.load_record(reference)?;
        if !record.is_in_use() {
            return Err(NtfsError::NotFound(format!(
                "MFT record {} is free",
                record.number()
            )));
        }
        Ok(record.is_directory())
    }
}

impl Volume {
    /// Mount the NTFS volume found at `config.partition_offset` on `device`.
    pub fn mount(device: Box<dyn BlockDevice>, config: MountConfig) -> Result<Arc<Self>> {
        let disk = Disk::new(device, config.partition_offset)?;
        let mut fs = Ntfs::open(disk)?;

        let volume_record = fs.load_record(MftReference::new(MFT_RECORD_VOLUME, 0))?;
        let label = Mounted::read_label(&volume_record);
        let (version, dirty) = Mounted::read_version(&volume_record)?;
        if version.0 < 1 || version.0 > 3 {
            return Err(NtfsError::Unsupported(format!(
                "NTFS version {}.{}",
                version.0, version.1
            )));
        }
        if dirty {
            warn!("volume: dirty flag set, journal will not be replayed");
        }

        let mut cache = InodeCache::new();
        let root = cache.open(&mut fs, MftReference::new(MFT_RECORD_ROOT, 0))?;
        let root_inode = cache.get(root)?;
        if !root_inode.is_directory() {
            return Err(corrupt("root record is not a directory"));
        }
        let root_ref = root_inode.reference();

        info!(
            "volume: mounted NTFS {}.{} \"{}\" serial {:016X}, {} byte clusters",
            version.0,
            version.1,
            label,
            fs.boot.serial_number,
            fs.boot.cluster_size()
        );

        Ok(Arc::new(Self {
            state: Mutex::new(VolumeState::Mounted(Box::new(Mounted {
                fs,
                cache,
                root,
                root_ref,
                open_handles: 0,
                config,
                label,
                version,
                dirty,
            }))),
        }))
    }

    /// Mount over a plain `(lba, buf)` read callback.
    pub fn mount_fn<F>(block_size: usize, read: F, config: MountConfig) -> Result<Arc<Self>>
    where
        F: FnMut(u64, &mut [u8]) -> io::Result<()> + Send + 'static,
    {
        Self::mount(Box::new(FnDevice::new(block_size, read)), config)
    }

    fn lock(&self) -> MutexGuard<'_, VolumeState> {
        // A panic inside an operation leaves no partial state worth refusing
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` on the mounted state under the volume lock.
    pub(crate) fn with_mounted<T>(&self, f: impl FnOnce(&mut Mounted) -> Result<T>) -> Result<T> {
        match &mut *self.lock() {
            VolumeState::Mounted(m) => f(m),
            VolumeState::Unmounted => Err(NtfsError::DeviceGone),
        }
    }

    pub fn is_mounted(&self) -> bool {
        matches!(*self.lock(), VolumeState::Mounted(_))
    }

    /// Handles other than the pinned root.
    pub fn open_handle_count(&self) -> usize {
        match &*self.lock() {
            VolumeState::Mounted(m) => m.open_handles,
            VolumeState::Unmounted => 0,
        }
    }

    /// Open a handle on the root directory.
    pub fn open_root(self: &Arc<Self>) -> Result<FileHandle> {
        let (stack, id) = self.with_mounted(|m| {
            let root_ref = m.root_ref;
            m.cache.retain(m.root)?;
            m.open_handles += 1;
            Ok((vec![root_ref], m.root))
        })?;
        Ok(FileHandle::new(self.clone(), id, stack, "\\".to_string(), true))
    }

    /// Unmount. Refused with [`NtfsError::Busy`] while handles are open,
    /// unless `force` is set; then outstanding handles fail with
    /// [`NtfsError::DeviceGone`].
    pub fn unmount(&self, force: bool) -> Result<()> {
        let mut state = self.lock();
        match &*state {
            VolumeState::Unmounted => return Err(NtfsError::DeviceGone),
            VolumeState::Mounted(m) if m.open_handles > 0 && !force => {
                return Err(NtfsError::Busy(m.open_handles));
            }
            VolumeState::Mounted(m) => {
                if m.open_handles > 0 {
                    warn!(
                        "volume: forced unmount with {} handle(s) open",
                        m.open_handles
                    );
                }
            }
        }
        // Dropping the mounted state releases the device and every cached inode
        *state = VolumeState::Unmounted;
        info!("volume: unmounted");
        Ok(())
    }

    pub fn info(&self) -> Result<VolumeInfo> {
        self.with_mounted(|m| {
            let free_size = m.free_space()?;
            Ok(VolumeInfo {
                label: m.label.clone(),
                serial_number: m.fs.boot.serial_number,
                ntfs_version: m.version,
                cluster_size: m.fs.boot.cluster_size(),
                total_size: m.fs.boot.total_size(),
                free_size,
                read_only: true,
                dirty: m.dirty,
            })
        })
    }

    pub fn config(&self) -> Result<MountConfig> {
        self.with_mounted(|m| Ok(m.config.clone()))
    }

    pub fn root_reference(&self) -> Result<MftReference> {
        self.with_mounted(|m| Ok(m.root_ref))
    }

    /// Load one MFT record directly.
    pub fn load_record(&self, reference: MftReference) -> Result<FileRecord> {
        self.with_mounted(|m| m.fs.load_record(reference))
    }

    /// Look `name` up in directory `dir`.
    pub fn lookup(&self, dir: MftReference, name: &str) -> Result<IndexEntry> {
        self.with_mounted(|m| m.lookup(dir, name))
    }

    /// Resolve an absolute path to the target's reference.
    pub fn resolve(&self, path: &str) -> Result<MftReference> {
        self.with_mounted(|m| {
            let root = m.root_ref;
            let stack = path::resolve(m, &[root], path)?;
            stack
                .last()
                .copied()
                .ok_or_else(|| NtfsError::InvalidParameter("empty path stack".into()))
        })
    }

    /// Visible entries of the directory at `path`, in collation order.
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntryInfo>> {
        self.with_mounted(|m| {
            let root = m.root_ref;
            let stack = path::resolve(m, &[root], path)?;
            let target = *stack
                .last()
                .ok_or_else(|| NtfsError::InvalidParameter("empty path stack".into()))?;
            let id = m.cache.open(&mut m.fs, target)?;
            let mut cursor = IndexCursor::new();
            let mut entries = Vec::new();
            let result = loop {
                match m.next_visible(id, &mut cursor) {
                    Ok(Some(entry)) => entries.push(entry),
                    Ok(None) => break Ok(entries),
                    Err(e) => break Err(e),
                }
            };
            m.cache.close(id);
            result
        })
    }

    /// Metadata of the file or directory at `path`.
    pub fn stat(&self, path: &str) -> Result<FileInfo> {
        self.with_mounted(|m| {
            let root = m.root_ref;
            let stack = path::resolve(m, &[root], path)?;
            let target = *stack
                .last()
                .ok_or_else(|| NtfsError::InvalidParameter("empty path stack".into()))?;
            let inode = m.inode(target)?;
            Ok(FileInfo::from_inode(&inode))
        })
    }
}
