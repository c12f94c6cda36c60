//! [`StorageVolume`] over an SD card through `embedded-sdmmc`.
//!
//! Uses the raw handle API so the adapter can keep the volume and root
//! directory open for the lifetime of the device. Intermediate directories
//! are opened one level at a time and closed again straight away, so a path
//! walk never holds more than two directory handles.
//!
//! `embedded-sdmmc` cannot report free clusters or remove directories:
//! free space is the configured card size minus what the logging tree and
//! configuration file occupy, and removing a directory is `Unsupported`.

use core::fmt::{Debug, Write};

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiDevice;
use embedded_sdmmc::{
    BlockDevice, Error, Mode, RawDirectory, RawFile, RawVolume, SdCard, TimeSource, VolumeIdx,
    VolumeManager,
};
use log::{debug, info, warn};

use super::layout::{CONFIG_FILE, LOG_ROOT};
use super::{EntryName, StorageVolume, VolumeEntry, VolumeError, components, join_path, split_parent};

/// Names collected per listing pass when summing the logging tree.
const USAGE_PASS: usize = 32;

pub struct SdmmcVolume<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    manager: VolumeManager<D, T, 4, 4, 1>,
    volume: Option<RawVolume>,
    root: Option<RawDirectory>,
    card_bytes: u64,
}

impl<S, Dl, T> SdmmcVolume<SdCard<S, Dl>, T>
where
    S: SpiDevice<u8>,
    Dl: DelayNs,
    T: TimeSource,
{
    /// Wraps an SPI-attached card, sizing the free-space budget from the
    /// card itself.
    pub fn from_sd_card(card: SdCard<S, Dl>, time_source: T) -> Self {
        let card_bytes = match card.num_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not read card size: {:?}", e);
                0
            }
        };
        info!("SD card reports {} bytes", card_bytes);
        Self::new(card, time_source, card_bytes)
    }
}

impl<D, T> SdmmcVolume<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    pub fn new(device: D, time_source: T, card_bytes: u64) -> Self {
        Self {
            manager: VolumeManager::new(device, time_source),
            volume: None,
            root: None,
            card_bytes,
        }
    }

    fn root(&self) -> Result<RawDirectory, VolumeError> {
        self.root.ok_or(VolumeError::NotMounted)
    }

    /// Opens the directory at `path`. The flag says whether the caller must
    /// close it (the root stays open).
    fn open_path(&self, path: &str) -> Result<(RawDirectory, bool), VolumeError> {
        let root = self.root()?;
        let mut dir = root;
        let mut opened = false;

        for component in components(path) {
            let next = self.manager.open_dir(dir, component);
            if opened {
                let _ = self.manager.close_dir(dir);
            }
            dir = next.map_err(map_error)?;
            opened = true;
        }

        Ok((dir, opened))
    }

    fn close_opened(&self, dir: RawDirectory, opened: bool) {
        if opened {
            if let Err(e) = self.manager.close_dir(dir) {
                debug!("Closing directory failed: {:?}", e);
            }
        }
    }

    /// Runs `f` on the parent directory of `path` and the final component.
    fn in_parent<R>(
        &self,
        path: &str,
        f: impl FnOnce(&VolumeManager<D, T, 4, 4, 1>, RawDirectory, &str) -> Result<R, Error<D::Error>>,
    ) -> Result<R, VolumeError> {
        let (parent, name) = split_parent(path);
        if name.is_empty() {
            return Err(VolumeError::InvalidPath);
        }

        let (dir, opened) = self.open_path(parent)?;
        let result = f(&self.manager, dir, name);
        self.close_opened(dir, opened);
        result.map_err(map_error)
    }

    fn open_file(&self, path: &str, mode: Mode) -> Result<RawFile, VolumeError> {
        self.in_parent(path, |manager, dir, name| manager.open_file_in_dir(dir, name, mode))
    }

    fn files_size(&mut self, path: &str) -> Result<u64, VolumeError> {
        let mut total = 0;
        self.list_dir(path, &mut |entry| {
            if !entry.is_dir {
                total += entry.size;
            }
        })?;
        Ok(total)
    }

    /// Bytes used by the logging tree and configuration file.
    fn used_bytes(&mut self) -> Result<u64, VolumeError> {
        let mut used = 0;
        self.list_dir("", &mut |entry| {
            if !entry.is_dir && entry.name.eq_ignore_ascii_case(CONFIG_FILE) {
                used += entry.size;
            }
        })?;

        // Session directories are summed a pass at a time so the name
        // buffer stays fixed-size however many sessions the card holds.
        let mut skip = 0;
        loop {
            let mut names: heapless::Vec<EntryName, USAGE_PASS> = heapless::Vec::new();
            let mut index = 0;
            match self.list_dir(LOG_ROOT, &mut |entry| {
                if entry.is_dir {
                    if index >= skip {
                        let _ = names.push(entry.name.clone());
                    }
                    index += 1;
                }
            }) {
                Ok(()) => {}
                Err(VolumeError::NotFound) => return Ok(used),
                Err(e) => return Err(e),
            }

            for name in &names {
                used += self.files_size(&join_path(LOG_ROOT, name)?)?;
            }
            if names.len() < USAGE_PASS {
                return Ok(used);
            }
            skip += USAGE_PASS;
        }
    }
}

fn map_error<E: Debug>(e: Error<E>) -> VolumeError {
    match e {
        Error::DeviceError(_) => VolumeError::Device,
        Error::NotFound => VolumeError::NotFound,
        Error::FileAlreadyExists | Error::DirAlreadyExists => VolumeError::AlreadyExists,
        Error::FilenameError(_) => VolumeError::InvalidPath,
        Error::TooManyOpenVolumes | Error::TooManyOpenDirs | Error::TooManyOpenFiles => {
            VolumeError::TooManyOpen
        }
        Error::DiskFull | Error::NotEnoughSpace => VolumeError::Full,
        Error::Unsupported | Error::DeleteDirAsFile => VolumeError::Unsupported,
        other => {
            debug!("Unmapped card error: {:?}", other);
            VolumeError::Io
        }
    }
}

impl<D, T> StorageVolume for SdmmcVolume<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    type File = RawFile;

    fn mount(&mut self) -> Result<(), VolumeError> {
        if self.root.is_some() {
            return Ok(());
        }

        let volume = self
            .manager
            .open_raw_volume(VolumeIdx(0))
            .map_err(map_error)?;
        let root = match self.manager.open_root_dir(volume) {
            Ok(root) => root,
            Err(e) => {
                let _ = self.manager.close_volume(volume);
                return Err(map_error(e));
            }
        };

        self.volume = Some(volume);
        self.root = Some(root);
        info!("Mounted card volume 0");
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        self.volume.is_some() && self.root.is_some()
    }

    fn create_dir(&mut self, path: &str) -> Result<(), VolumeError> {
        self.in_parent(path, |manager, dir, name| manager.make_dir_in_dir(dir, name))
    }

    fn open_create(&mut self, path: &str) -> Result<RawFile, VolumeError> {
        self.open_file(path, Mode::ReadWriteCreateOrTruncate)
    }

    fn open_append(&mut self, path: &str) -> Result<RawFile, VolumeError> {
        self.open_file(path, Mode::ReadWriteAppend)
    }

    fn open_read(&mut self, path: &str) -> Result<RawFile, VolumeError> {
        self.open_file(path, Mode::ReadOnly)
    }

    fn write(&mut self, file: &mut RawFile, bytes: &[u8]) -> Result<usize, VolumeError> {
        // The card either takes the whole buffer or fails
        self.manager.write(*file, bytes).map_err(map_error)?;
        Ok(bytes.len())
    }

    fn read(&mut self, file: &mut RawFile, buffer: &mut [u8]) -> Result<usize, VolumeError> {
        match self.manager.read(*file, buffer) {
            Ok(n) => Ok(n),
            Err(Error::EndOfFile) => Ok(0),
            Err(e) => Err(map_error(e)),
        }
    }

    fn flush(&mut self, file: &mut RawFile) -> Result<(), VolumeError> {
        self.manager.flush_file(*file).map_err(map_error)
    }

    fn close(&mut self, file: RawFile) -> Result<(), VolumeError> {
        self.manager.close_file(file).map_err(map_error)
    }

    fn remove(&mut self, path: &str) -> Result<(), VolumeError> {
        self.in_parent(path, |manager, dir, name| manager.delete_file_in_dir(dir, name))
    }

    fn list_dir(
        &mut self,
        path: &str,
        visit: &mut dyn FnMut(&VolumeEntry),
    ) -> Result<(), VolumeError> {
        let (dir, opened) = self.open_path(path)?;

        let result = self.manager.iterate_dir(dir, |entry| {
            let mut name = EntryName::new();
            if write!(name, "{}", entry.name).is_err() || name.starts_with('.') {
                return;
            }
            visit(&VolumeEntry {
                name,
                is_dir: entry.attributes.is_directory(),
                size: entry.size.into(),
            });
        });

        self.close_opened(dir, opened);
        result.map_err(map_error)
    }

    fn free_space(&mut self) -> Result<u64, VolumeError> {
        self.root()?;
        let used = self.used_bytes()?;
        Ok(self.card_bytes.saturating_sub(used))
    }
}
