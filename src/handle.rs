//! Open file and directory handles.

use std::sync::Arc;

use bitflags::bitflags;
use log::trace;

use crate::error::{NtfsError, Result};
use crate::ntfs::index::IndexCursor;
use crate::ntfs::{
    FileAttributes, Inode, InodeId, MftReference, NtfsTime, MFT_RECORD_FIRST_USER, MFT_RECORD_ROOT,
};
use crate::volume::{translate_attributes, Volume};

bitflags! {
    /// How a handle is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenMode: u64 {
        const READ = 0x0000_0000_0000_0001;
        const WRITE = 0x0000_0000_0000_0002;
        const CREATE = 0x8000_0000_0000_0000;
    }
}

/// Attribute bits a caller may ask for when creating.
const VALID_CREATE_ATTRIBUTES: FileAttributes = FileAttributes::READ_ONLY
    .union(FileAttributes::HIDDEN)
    .union(FileAttributes::SYSTEM)
    .union(FileAttributes::DIRECTORY)
    .union(FileAttributes::ARCHIVE);

/// Metadata of a file, a directory, or a directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub reference: MftReference,
    pub attributes: FileAttributes,
    pub size: u64,
    /// Bytes allocated on disk.
    pub physical_size: u64,
    pub creation_time: NtfsTime,
    pub modification_time: NtfsTime,
    pub access_time: NtfsTime,
}

/// One entry produced by [`FileHandle::read_dir`].
pub type DirEntryInfo = FileInfo;

impl FileInfo {
    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }

    pub(crate) fn from_inode(inode: &Inode) -> Self {
        let name = match inode.record_number() {
            MFT_RECORD_ROOT => "\\".to_string(),
            _ => inode.name().map(|n| n.name_string()).unwrap_or_default(),
        };
        Self {
            name,
            reference: inode.reference(),
            attributes: translate_attributes(
                inode.record_number(),
                inode.is_directory(),
                inode.standard_information().file_attributes,
            ),
            size: inode.data_size(),
            physical_size: inode.allocated_size(),
            creation_time: inode.creation_time(),
            modification_time: inode.modification_time(),
            access_time: inode.access_time(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FileCursor {
    position: u64,
}

#[derive(Debug, Default)]
pub struct DirectoryCursor {
    cursor: IndexCursor,
    /// Entries returned since the last rewind.
    position: u64,
}

#[derive(Debug)]
pub enum HandleState {
    File(FileCursor),
    Directory(DirectoryCursor),
}

/// An open file or directory on a [`Volume`]. Closed on drop.
#[derive(Debug)]
pub struct FileHandle {
    volume: Arc<Volume>,
    inode: InodeId,
    /// Ancestry from the root, this handle's target last.
    path: Vec<MftReference>,
    name: String,
    state: HandleState,
}

impl FileHandle {
    pub(crate) fn new(
        volume: Arc<Volume>,
        inode: InodeId,
        path: Vec<MftReference>,
        name: String,
        is_directory: bool,
    ) -> Self {
        let state = if is_directory {
            HandleState::Directory(DirectoryCursor::default())
        } else {
            HandleState::File(FileCursor::default())
        };
        Self {
            volume,
            inode,
            path,
            name,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reference(&self) -> MftReference {
        self.path
            .last()
            .copied()
            .unwrap_or_else(|| MftReference::new(MFT_RECORD_ROOT, 0))
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.state, HandleState::Directory(_))
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    /// Open `path` relative to this handle (or from the root when it starts
    /// with a separator).
    ///
    /// The volume is read-only: creating a missing entry fails with
    /// [`NtfsError::ReadOnly`], and creating a directory over an existing
    /// entry with [`NtfsError::AlreadyExists`]. Creating an existing file
    /// opens it.
    pub fn open(&self, path: &str, mode: OpenMode, attributes: FileAttributes) -> Result<FileHandle> {
        let valid_modes = [
            OpenMode::READ,
            OpenMode::READ | OpenMode::WRITE,
            OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE,
        ];
        if !valid_modes.contains(&mode) {
            return Err(NtfsError::InvalidParameter(format!("open mode {mode:?}")));
        }
        let create = mode.contains(OpenMode::CREATE);
        if create
            && (attributes.contains(FileAttributes::READ_ONLY)
                || !VALID_CREATE_ATTRIBUTES.contains(attributes))
        {
            return Err(NtfsError::InvalidParameter(format!(
                "create attributes {attributes:?}"
            )));
        }
        if !self.is_directory() {
            return Err(NtfsError::NotADirectory(self.name.clone()));
        }

        let base = self.path.clone();
        let opened = self.volume.with_mounted(|m| match m.open_path(&base, path) {
            Ok((stack, id)) => {
                let inode = m.cache.get(id)?;
                if create && attributes.contains(FileAttributes::DIRECTORY) {
                    m.release(id);
                    return Err(NtfsError::AlreadyExists(path.to_string()));
                }
                Ok((stack, id, FileInfo::from_inode(&inode)))
            }
            Err(e) if create && e.is_not_found() => Err(NtfsError::ReadOnly),
            Err(e) => Err(e),
        })?;

        let (stack, id, info) = opened;
        trace!("handle: opened {path:?} as {}", info.reference);
        let name = last_component(path).unwrap_or(&info.name).to_string();
        Ok(FileHandle::new(
            self.volume.clone(),
            id,
            stack,
            name,
            info.is_directory(),
        ))
    }

    /// Read file contents at the current position; short at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Self {
            volume,
            inode,
            state,
            name,
            ..
        } = self;
        let cursor = match state {
            HandleState::File(cursor) => cursor,
            HandleState::Directory(_) => return Err(NtfsError::NotAFile(name.clone())),
        };
        let id = *inode;
        let n = volume.with_mounted(|m| {
            let inode = m.cache.get(id)?;
            inode.read(&mut m.fs.disk, cursor.position, buf)
        })?;
        cursor.position += n as u64;
        Ok(n)
    }

    /// Next visible directory entry, `None` once the listing is exhausted.
    pub fn read_dir(&mut self) -> Result<Option<DirEntryInfo>> {
        let Self {
            volume,
            inode,
            state,
            name,
            ..
        } = self;
        let dir = match state {
            HandleState::Directory(dir) => dir,
            HandleState::File(_) => return Err(NtfsError::NotADirectory(name.clone())),
        };
        let id = *inode;
        let entry = volume.with_mounted(|m| m.next_visible(id, &mut dir.cursor))?;
        if entry.is_some() {
            dir.position += 1;
        }
        Ok(entry)
    }

    pub fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        self.volume.with_mounted(|_| Err(NtfsError::ReadOnly))
    }

    /// Delete is never possible on a read-only volume; the handle is closed
    /// either way.
    pub fn delete(self) -> Result<()> {
        let record = self.reference().record_number();
        self.volume.with_mounted(|_| {
            if record < MFT_RECORD_FIRST_USER {
                Err(NtfsError::PermissionDenied(format!(
                    "MFT record {record} is a metafile"
                )))
            } else {
                Err(NtfsError::ReadOnly)
            }
        })
    }

    /// Nothing is ever dirty.
    pub fn flush(&self) -> Result<()> {
        self.volume.with_mounted(|_| Ok(()))
    }

    /// Byte offset for files, entries returned so far for directories.
    pub fn position(&self) -> u64 {
        match &self.state {
            HandleState::File(cursor) => cursor.position,
            HandleState::Directory(dir) => dir.position,
        }
    }

    /// Seek a file anywhere (`u64::MAX` means end of file). Directories
    /// only accept 0, which restarts the listing.
    pub fn set_position(&mut self, position: u64) -> Result<()> {
        match &mut self.state {
            HandleState::File(cursor) => {
                cursor.position = if position == u64::MAX {
                    let id = self.inode;
                    self.volume
                        .with_mounted(|m| Ok(m.cache.get(id)?.data_size()))?
                } else {
                    position
                };
                Ok(())
            }
            HandleState::Directory(dir) => {
                if position != 0 {
                    return Err(NtfsError::Unsupported(format!(
                        "directory position {position}"
                    )));
                }
                dir.cursor.rewind();
                dir.position = 0;
                Ok(())
            }
        }
    }

    pub fn info(&self) -> Result<FileInfo> {
        let id = self.inode;
        let mut info = self.volume.with_mounted(|m| {
            let inode = m.cache.get(id)?;
            Ok(FileInfo::from_inode(&inode))
        })?;
        if info.name.is_empty() {
            info.name = self.name.clone();
        }
        Ok(info)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let id = self.inode;
        // After a forced unmount there is nothing left to release
        let _ = self.volume.with_mounted(|m| {
            m.release(id);
            Ok(())
        });
    }
}

fn last_component(path: &str) -> Option<&str> {
    path.rsplit(|c| c == '\\' || c == '/')
        .find(|c| !c.is_empty() && *c != "." && *c != "..")
}
