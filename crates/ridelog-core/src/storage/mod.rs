//! Card storage: the volume adapter contract, on-card layout, fixed-layout
//! records and the session directory manager.

pub mod directory;
pub mod layout;
pub mod record;
pub mod sdmmc;

#[cfg(test)]
pub mod mock;

use core::fmt::Write;

use log::debug;
use thiserror_no_std::Error;

pub use directory::*;
pub use layout::*;
pub use record::*;

/// Longest single path component (8.3 short names).
pub const MAX_NAME_LEN: usize = 12;

/// Longest path the core ever builds, e.g. `RIDELOG/0042/SAMPLES.BIN`.
pub const MAX_PATH_LEN: usize = 32;

pub type EntryName = heapless::String<MAX_NAME_LEN>;
pub type VolumePath = heapless::String<MAX_PATH_LEN>;

/// Failures reported by a [`StorageVolume`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeError {
    #[error("volume not mounted")]
    NotMounted,
    #[error("no such file or directory")]
    NotFound,
    #[error("file or directory already exists")]
    AlreadyExists,
    #[error("invalid path")]
    InvalidPath,
    #[error("too many open handles")]
    TooManyOpen,
    #[error("volume full")]
    Full,
    #[error("operation not supported by this volume")]
    Unsupported,
    #[error("short write: {written} of {requested} bytes")]
    ShortWrite { written: usize, requested: usize },
    #[error("block device error")]
    Device,
    #[error("I/O error")]
    Io,
}

/// One entry yielded by [`StorageVolume::list_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    pub name: EntryName,
    pub is_dir: bool,
    /// File length in bytes (zero for directories)
    pub size: u64,
}

/// Mountable filesystem on the removable card.
///
/// Paths are `/`-separated and relative to the volume root. Every call is
/// synchronous and may stall for as long as the card does, so the core
/// only calls into a volume from main-loop context.
pub trait StorageVolume {
    /// Handle to an open file.
    type File;

    /// Mounts the volume. Calling it on a mounted volume is a no-op.
    fn mount(&mut self) -> Result<(), VolumeError>;

    fn is_mounted(&self) -> bool;

    /// Creates a directory. Fails with `AlreadyExists` if it is present.
    fn create_dir(&mut self, path: &str) -> Result<(), VolumeError>;

    /// Creates a file for writing, truncating any existing content.
    fn open_create(&mut self, path: &str) -> Result<Self::File, VolumeError>;

    /// Opens an existing file for appending.
    fn open_append(&mut self, path: &str) -> Result<Self::File, VolumeError>;

    /// Opens an existing file for reading from the start.
    fn open_read(&mut self, path: &str) -> Result<Self::File, VolumeError>;

    /// Writes up to `bytes.len()` bytes and returns how many were accepted.
    ///
    /// A short count is not an error; see [`write_all`].
    fn write(&mut self, file: &mut Self::File, bytes: &[u8]) -> Result<usize, VolumeError>;

    /// Reads into `buffer`, returning zero at end of file.
    fn read(&mut self, file: &mut Self::File, buffer: &mut [u8]) -> Result<usize, VolumeError>;

    /// Pushes buffered data for `file` down to the card.
    fn flush(&mut self, file: &mut Self::File) -> Result<(), VolumeError>;

    /// Flushes and closes `file`.
    fn close(&mut self, file: Self::File) -> Result<(), VolumeError>;

    /// Removes a file or an empty directory.
    fn remove(&mut self, path: &str) -> Result<(), VolumeError>;

    /// Calls `visit` once per entry of the directory at `path`.
    ///
    /// `.` and `..` are never reported. The listing can be repeated at any
    /// time and reflects the current contents.
    fn list_dir(
        &mut self,
        path: &str,
        visit: &mut dyn FnMut(&VolumeEntry),
    ) -> Result<(), VolumeError>;

    /// Bytes still available for logging.
    fn free_space(&mut self) -> Result<u64, VolumeError>;
}

/// Writes all of `bytes`, retrying short writes.
///
/// More than `max_short_writes` short writes in a row is treated as a card
/// fault and reported as [`VolumeError::ShortWrite`].
pub fn write_all<V>(
    volume: &mut V,
    file: &mut V::File,
    bytes: &[u8],
    max_short_writes: u8,
) -> Result<(), VolumeError>
where
    V: StorageVolume + ?Sized,
{
    let mut offset = 0;
    let mut short_writes = 0u8;

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        let written = volume.write(file, &bytes[offset..])?.min(remaining);
        offset += written;

        if written < remaining {
            short_writes += 1;
            debug!(
                "Short write ({} of {} bytes), attempt {}",
                written, remaining, short_writes
            );
            if short_writes > max_short_writes {
                return Err(VolumeError::ShortWrite {
                    written: offset,
                    requested: bytes.len(),
                });
            }
        }
    }

    Ok(())
}

/// Joins `parent` and `name` with a `/`.
pub fn join_path(parent: &str, name: &str) -> Result<VolumePath, VolumeError> {
    let mut path = VolumePath::new();
    let result: Result<(), ()> = if parent.is_empty() {
        path.push_str(name).map_err(|_| ())
    } else {
        write!(path, "{}/{}", parent, name).map_err(|_| ())
    };
    result.map_err(|_| VolumeError::InvalidPath)?;
    Ok(path)
}

/// Splits a path into its parent directory and final component.
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path.trim_end_matches('/')),
    }
}

/// Iterates the non-empty components of a path.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}
