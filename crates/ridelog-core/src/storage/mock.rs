//! In-memory [`StorageVolume`] with fault injection, for tests.
//!
//! Clones share the same card contents, so a test can keep a handle for
//! inspection while the state machine owns another. [`MockVolume::reboot`]
//! models a power cycle: open handles are forgotten and the new handle
//! starts unmounted.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::string::{String, ToString};
use std::vec::Vec;

use super::{EntryName, StorageVolume, VolumeEntry, VolumeError, split_parent};

#[derive(Default)]
struct Card {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    open_handles: usize,
    free_space: Option<u64>,
    fail_mount: bool,
    fail_writes_after: Option<usize>,
    short_writes: usize,
    fail_create: Option<String>,
    flushes: usize,
}

impl Card {
    fn parent_exists(&self, path: &str) -> bool {
        let (parent, _) = split_parent(path);
        parent.is_empty() || self.dirs.contains(parent)
    }
}

#[derive(Debug)]
pub struct MockFile {
    path: String,
    position: usize,
}

#[derive(Clone)]
pub struct MockVolume {
    card: Rc<RefCell<Card>>,
    mounted: bool,
}

impl MockVolume {
    pub fn new() -> Self {
        Self {
            card: Rc::new(RefCell::new(Card::default())),
            mounted: false,
        }
    }

    /// A fresh, unmounted handle onto the same card after a power cycle.
    pub fn reboot(&self) -> Self {
        self.card.borrow_mut().open_handles = 0;
        Self {
            card: Rc::clone(&self.card),
            mounted: false,
        }
    }

    pub fn set_free_space(&self, bytes: u64) {
        self.card.borrow_mut().free_space = Some(bytes);
    }

    pub fn fail_mount(&self, fail: bool) {
        self.card.borrow_mut().fail_mount = fail;
    }

    /// Lets `count` more writes succeed, then fails every write with `Io`.
    pub fn fail_writes_after(&self, count: usize) {
        self.card.borrow_mut().fail_writes_after = Some(count);
    }

    pub fn clear_write_failure(&self) {
        self.card.borrow_mut().fail_writes_after = None;
    }

    /// Makes the next `count` writes accept only half of their bytes.
    pub fn force_short_writes(&self, count: usize) {
        self.card.borrow_mut().short_writes = count;
    }

    /// Makes `open_create` fail for any path ending in `name`.
    pub fn fail_create(&self, name: &str) {
        self.card.borrow_mut().fail_create = Some(name.to_string());
    }

    pub fn put_file(&self, path: &str, bytes: &[u8]) {
        self.card
            .borrow_mut()
            .files
            .insert(path.to_string(), bytes.to_vec());
    }

    pub fn put_dir(&self, path: &str) {
        self.card.borrow_mut().dirs.insert(path.to_string());
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        self.card.borrow().files.get(path).cloned()
    }

    pub fn dir_exists(&self, path: &str) -> bool {
        self.card.borrow().dirs.contains(path)
    }

    pub fn open_handles(&self) -> usize {
        self.card.borrow().open_handles
    }

    pub fn flushes(&self) -> usize {
        self.card.borrow().flushes
    }

    fn check_mounted(&self) -> Result<(), VolumeError> {
        if self.mounted {
            Ok(())
        } else {
            Err(VolumeError::NotMounted)
        }
    }

    fn open(&mut self, path: &str) -> MockFile {
        self.card.borrow_mut().open_handles += 1;
        MockFile {
            path: path.to_string(),
            position: 0,
        }
    }
}

impl Default for MockVolume {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageVolume for MockVolume {
    type File = MockFile;

    fn mount(&mut self) -> Result<(), VolumeError> {
        if self.card.borrow().fail_mount {
            return Err(VolumeError::Device);
        }
        self.mounted = true;
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        self.mounted
    }

    fn create_dir(&mut self, path: &str) -> Result<(), VolumeError> {
        self.check_mounted()?;
        let mut card = self.card.borrow_mut();
        if card.dirs.contains(path) || card.files.contains_key(path) {
            return Err(VolumeError::AlreadyExists);
        }
        if !card.parent_exists(path) {
            return Err(VolumeError::NotFound);
        }
        card.dirs.insert(path.to_string());
        Ok(())
    }

    fn open_create(&mut self, path: &str) -> Result<Self::File, VolumeError> {
        self.check_mounted()?;
        {
            let mut card = self.card.borrow_mut();
            if let Some(name) = &card.fail_create {
                if path.ends_with(name.as_str()) {
                    return Err(VolumeError::Io);
                }
            }
            if !card.parent_exists(path) {
                return Err(VolumeError::NotFound);
            }
            card.files.insert(path.to_string(), Vec::new());
        }
        Ok(self.open(path))
    }

    fn open_append(&mut self, path: &str) -> Result<Self::File, VolumeError> {
        self.check_mounted()?;
        if !self.card.borrow().files.contains_key(path) {
            return Err(VolumeError::NotFound);
        }
        Ok(self.open(path))
    }

    fn open_read(&mut self, path: &str) -> Result<Self::File, VolumeError> {
        self.open_append(path)
    }

    fn write(&mut self, file: &mut Self::File, bytes: &[u8]) -> Result<usize, VolumeError> {
        self.check_mounted()?;
        let mut card = self.card.borrow_mut();

        if let Some(remaining) = card.fail_writes_after.as_mut() {
            if *remaining == 0 {
                return Err(VolumeError::Io);
            }
            *remaining -= 1;
        }

        let accepted = if card.short_writes > 0 {
            card.short_writes -= 1;
            bytes.len() / 2
        } else {
            bytes.len()
        };

        let data = card.files.get_mut(&file.path).ok_or(VolumeError::NotFound)?;
        data.extend_from_slice(&bytes[..accepted]);
        Ok(accepted)
    }

    fn read(&mut self, file: &mut Self::File, buffer: &mut [u8]) -> Result<usize, VolumeError> {
        self.check_mounted()?;
        let card = self.card.borrow();
        let data = card.files.get(&file.path).ok_or(VolumeError::NotFound)?;
        let available = &data[file.position.min(data.len())..];
        let n = available.len().min(buffer.len());
        buffer[..n].copy_from_slice(&available[..n]);
        file.position += n;
        Ok(n)
    }

    fn flush(&mut self, _file: &mut Self::File) -> Result<(), VolumeError> {
        self.check_mounted()?;
        self.card.borrow_mut().flushes += 1;
        Ok(())
    }

    fn close(&mut self, _file: Self::File) -> Result<(), VolumeError> {
        let mut card = self.card.borrow_mut();
        card.open_handles = card.open_handles.saturating_sub(1);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), VolumeError> {
        self.check_mounted()?;
        let mut card = self.card.borrow_mut();
        if card.files.remove(path).is_some() {
            return Ok(());
        }
        if !card.dirs.contains(path) {
            return Err(VolumeError::NotFound);
        }
        let prefix = format!("{}/", path);
        let occupied = card.files.keys().any(|p| p.starts_with(&prefix))
            || card.dirs.iter().any(|d| d.starts_with(&prefix));
        if occupied {
            return Err(VolumeError::Io);
        }
        card.dirs.remove(path);
        Ok(())
    }

    fn list_dir(
        &mut self,
        path: &str,
        visit: &mut dyn FnMut(&VolumeEntry),
    ) -> Result<(), VolumeError> {
        self.check_mounted()?;

        // Collect first so `visit` never runs while the card is borrowed.
        let entries: Vec<VolumeEntry> = {
            let card = self.card.borrow();
            if !path.is_empty() && !card.dirs.contains(path) {
                return Err(VolumeError::NotFound);
            }

            let child = |p: &str| {
                let (parent, name) = split_parent(p);
                (parent == path).then(|| name.to_string())
            };

            let dirs = card.dirs.iter().filter_map(|d| {
                child(d).map(|name| (name, true, 0u64))
            });
            let files = card
                .files
                .iter()
                .filter_map(|(p, data)| child(p).map(|name| (name, false, data.len() as u64)));

            dirs.chain(files)
                .map(|(name, is_dir, size)| VolumeEntry {
                    name: EntryName::try_from(name.as_str()).unwrap_or_default(),
                    is_dir,
                    size,
                })
                .collect()
        };

        for entry in &entries {
            visit(entry);
        }
        Ok(())
    }

    fn free_space(&mut self) -> Result<u64, VolumeError> {
        self.check_mounted()?;
        Ok(self.card.borrow().free_space.unwrap_or(u64::MAX))
    }
}
