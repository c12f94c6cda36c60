//! Host directory standing in for the SD card.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use log::debug;
use ridelog_core::storage::{EntryName, StorageVolume, VolumeEntry, VolumeError};

pub struct HostFile {
    file: File,
}

/// [`StorageVolume`] over a host directory.
///
/// Free space is reported against a fixed card size, since the host's own
/// free space says nothing about the card being simulated.
pub struct HostVolume {
    root: PathBuf,
    card_bytes: u64,
    mounted: bool,
}

impl HostVolume {
    pub fn new(root: impl Into<PathBuf>, card_bytes: u64) -> Self {
        Self {
            root: root.into(),
            card_bytes,
            mounted: false,
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, VolumeError> {
        if !self.mounted {
            return Err(VolumeError::NotMounted);
        }
        if path.split('/').any(|c| c == "..") {
            return Err(VolumeError::InvalidPath);
        }
        Ok(self.root.join(path))
    }
}

fn map_io(e: io::Error) -> VolumeError {
    match e.kind() {
        ErrorKind::NotFound => VolumeError::NotFound,
        ErrorKind::AlreadyExists => VolumeError::AlreadyExists,
        ErrorKind::StorageFull => VolumeError::Full,
        ErrorKind::InvalidInput | ErrorKind::InvalidFilename => VolumeError::InvalidPath,
        _ => VolumeError::Io,
    }
}

fn used_bytes(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        total += if meta.is_dir() {
            used_bytes(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}

impl StorageVolume for HostVolume {
    type File = HostFile;

    fn mount(&mut self) -> Result<(), VolumeError> {
        if self.mounted {
            return Ok(());
        }
        fs::create_dir_all(&self.root).map_err(|_| VolumeError::Device)?;
        self.mounted = true;
        debug!("Mounted card at {}", self.root.display());
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        self.mounted
    }

    fn create_dir(&mut self, path: &str) -> Result<(), VolumeError> {
        fs::create_dir(self.resolve(path)?).map_err(map_io)
    }

    fn open_create(&mut self, path: &str) -> Result<HostFile, VolumeError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.resolve(path)?)
            .map_err(map_io)?;
        Ok(HostFile { file })
    }

    fn open_append(&mut self, path: &str) -> Result<HostFile, VolumeError> {
        let file = OpenOptions::new()
            .append(true)
            .open(self.resolve(path)?)
            .map_err(map_io)?;
        Ok(HostFile { file })
    }

    fn open_read(&mut self, path: &str) -> Result<HostFile, VolumeError> {
        let file = File::open(self.resolve(path)?).map_err(map_io)?;
        Ok(HostFile { file })
    }

    fn write(&mut self, file: &mut HostFile, bytes: &[u8]) -> Result<usize, VolumeError> {
        file.file.write(bytes).map_err(map_io)
    }

    fn read(&mut self, file: &mut HostFile, buffer: &mut [u8]) -> Result<usize, VolumeError> {
        file.file.read(buffer).map_err(map_io)
    }

    fn flush(&mut self, file: &mut HostFile) -> Result<(), VolumeError> {
        file.file.flush().map_err(map_io)?;
        file.file.sync_data().map_err(map_io)
    }

    fn close(&mut self, file: HostFile) -> Result<(), VolumeError> {
        file.file.sync_all().map_err(map_io)
    }

    fn remove(&mut self, path: &str) -> Result<(), VolumeError> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full).map_err(map_io)?;
        if meta.is_dir() {
            fs::remove_dir(&full).map_err(map_io)
        } else {
            fs::remove_file(&full).map_err(map_io)
        }
    }

    fn list_dir(
        &mut self,
        path: &str,
        visit: &mut dyn FnMut(&VolumeEntry),
    ) -> Result<(), VolumeError> {
        let mut entries: Vec<_> = fs::read_dir(self.resolve(path)?)
            .map_err(map_io)?
            .collect::<Result<_, _>>()
            .map_err(map_io)?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let meta = entry.metadata().map_err(map_io)?;
            let file_name = entry.file_name();
            // Names that could not exist on a FAT card are not listed
            let Some(name) = file_name
                .to_str()
                .and_then(|n| EntryName::try_from(n).ok())
            else {
                continue;
            };
            visit(&VolumeEntry {
                name,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        Ok(())
    }

    fn free_space(&mut self) -> Result<u64, VolumeError> {
        let root = self.resolve("")?;
        let used = used_bytes(&root).map_err(map_io)?;
        Ok(self.card_bytes.saturating_sub(used))
    }
}
