//! Read-only NTFS filesystem engine.
//!
//! Mount a volume from any [`device::BlockDevice`], then walk it through
//! [`handle::FileHandle`]s or the direct lookup helpers on
//! [`volume::Volume`].

pub mod config;
pub mod device;
pub mod error;
pub mod handle;
pub mod ntfs;
pub mod volume;

pub use config::MountConfig;
pub use device::{BlockDevice, FnDevice, StreamDevice};
pub use error::{NtfsError, Result};
pub use handle::{DirEntryInfo, FileHandle, FileInfo, OpenMode};
pub use ntfs::{FileAttributes, MftReference, NtfsTime};
pub use volume::{Volume, VolumeInfo};
