//! Session directory manager.
//!
//! Owns the session numbering and the lifecycle of a session's files on the
//! card. The directory listing is the only record of which sessions exist:
//! nothing here is persisted outside the session directories themselves.

use log::{error, info, warn};
use thiserror_no_std::Error;

use super::layout::{
    FIRMWARE_VERSION, FOOTER_LEN, HEADER_FILE, HEADER_LEN, LOG_ROOT, SAMPLES_FILE, SessionFooter,
    SessionHeader, parse_session_id, session_dir, session_file,
};
use super::record::RECORD_SIZE;
use super::{StorageVolume, VolumeError, VolumePath, write_all};
use crate::config::LoggerConfig;

/// Sessions kept in the in-memory catalog. Older sessions beyond this are
/// still counted for numbering but not listed.
pub const MAX_TRACKED_SESSIONS: usize = 64;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("card full: {free} bytes free, more than {required} required")]
    CardFull { free: u64, required: u64 },
    #[error("storage error: {0}")]
    Io(VolumeError),
    #[error("session {0} exists more than once")]
    DuplicateSessionId(u32),
    #[error("session {0} already finalized")]
    AlreadyFinalized(u32),
    #[error("session id {0} exceeds the numbering limit")]
    SessionLimit(u32),
}

impl From<VolumeError> for DirectoryError {
    fn from(e: VolumeError) -> Self {
        Self::Io(e)
    }
}

/// Lifecycle tag of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Being written, or the newest session after an abnormal stop
    Open,
    /// Closed after an orderly stop, footer present
    Finalized,
    /// Left open by an abnormal stop and superseded by a newer session
    Orphaned,
}

/// Catalog entry describing a session found on (or added to) the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u32,
    pub status: SessionStatus,
    pub header_bytes: u64,
    pub log_bytes: u64,
}

impl SessionInfo {
    /// Number of whole records in the sample log.
    pub fn record_count(&self) -> u64 {
        self.log_bytes / RECORD_SIZE as u64
    }
}

/// One logging run with its open files.
#[derive(Debug)]
pub struct Session<F> {
    id: u32,
    path: VolumePath,
    created_ms: u32,
    status: SessionStatus,
    header_file: Option<F>,
    log_file: Option<F>,
}

impl<F> Session<F> {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn created_ms(&self) -> u32 {
        self.created_ms
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// The sample log, while the session is still open.
    pub fn log_file_mut(&mut self) -> Option<&mut F> {
        self.log_file.as_mut()
    }
}

/// Allocates, tracks and finalizes sessions under [`LOG_ROOT`].
pub struct SessionDirectory {
    catalog: heapless::Vec<SessionInfo, MAX_TRACKED_SESSIONS>,
    highest_id: u32,
    max_short_writes: u8,
}

impl SessionDirectory {
    pub const fn new(max_short_writes: u8) -> Self {
        Self {
            catalog: heapless::Vec::new(),
            highest_id: 0,
            max_short_writes,
        }
    }

    /// Sessions known to the directory, ordered by id.
    pub fn sessions(&self) -> &[SessionInfo] {
        &self.catalog
    }

    /// Sessions that were stopped cleanly and can be offloaded.
    pub fn finalized(&self) -> impl Iterator<Item = &SessionInfo> {
        self.catalog
            .iter()
            .filter(|s| s.status == SessionStatus::Finalized)
    }

    pub fn highest_id(&self) -> u32 {
        self.highest_id
    }

    /// Rebuilds the catalog from the card.
    ///
    /// Only directories under [`LOG_ROOT`] whose names are all digits count
    /// as sessions. A missing root is an empty card. Scanning twice without
    /// writes in between gives the same result.
    pub fn scan_existing<V: StorageVolume>(
        &mut self,
        volume: &mut V,
    ) -> Result<&[SessionInfo], DirectoryError> {
        self.catalog.clear();
        self.highest_id = 0;

        let mut ids: heapless::Vec<u32, MAX_TRACKED_SESSIONS> = heapless::Vec::new();
        let mut highest = 0u32;
        let mut duplicate = None;

        let listed = volume.list_dir(LOG_ROOT, &mut |entry| {
            if !entry.is_dir {
                return;
            }
            let Some(id) = parse_session_id(&entry.name) else {
                return;
            };

            if ids.contains(&id) {
                duplicate.get_or_insert(id);
                return;
            }
            highest = highest.max(id);

            if ids.push(id).is_err() {
                // Keep the newest sessions once the catalog is full
                if let Some(lowest) = ids.iter_mut().min() {
                    if id > *lowest {
                        *lowest = id;
                    }
                }
            }
        });

        match listed {
            Ok(()) => {}
            Err(VolumeError::NotFound) => {
                info!("No {} directory, card is empty", LOG_ROOT);
                return Ok(self.catalog.as_slice());
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(id) = duplicate {
            error!("Session id {} appears twice under {}", id, LOG_ROOT);
            return Err(DirectoryError::DuplicateSessionId(id));
        }

        ids.sort_unstable();
        self.highest_id = highest;

        for id in ids {
            let (header_bytes, log_bytes) = Self::file_sizes(volume, id)?;
            let status = if header_bytes == (HEADER_LEN + FOOTER_LEN) as u64 {
                SessionStatus::Finalized
            } else if id == highest {
                SessionStatus::Open
            } else {
                SessionStatus::Orphaned
            };

            // Capacity matches `ids`, so this cannot overflow
            let _ = self.catalog.push(SessionInfo {
                id,
                status,
                header_bytes,
                log_bytes,
            });
        }

        let orphaned = self
            .catalog
            .iter()
            .filter(|s| s.status == SessionStatus::Orphaned)
            .count();
        info!(
            "Scanned {} sessions, highest id {}, {} orphaned",
            self.catalog.len(),
            self.highest_id,
            orphaned
        );

        Ok(self.catalog.as_slice())
    }

    fn file_sizes<V: StorageVolume>(volume: &mut V, id: u32) -> Result<(u64, u64), VolumeError> {
        let dir = session_dir(id)?;
        let mut header_bytes = 0;
        let mut log_bytes = 0;

        volume.list_dir(&dir, &mut |entry| {
            if entry.is_dir {
                return;
            }
            if entry.name.eq_ignore_ascii_case(HEADER_FILE) {
                header_bytes = entry.size;
            } else if entry.name.eq_ignore_ascii_case(SAMPLES_FILE) {
                log_bytes = entry.size;
            }
        })?;

        Ok((header_bytes, log_bytes))
    }

    /// Creates the next session, writes its header and opens its sample log.
    ///
    /// Anything created before a failure is removed again before the error
    /// is returned.
    pub fn allocate_session<V: StorageVolume>(
        &mut self,
        volume: &mut V,
        config: &LoggerConfig,
        now_ms: u32,
    ) -> Result<Session<V::File>, DirectoryError> {
        let required = config.thresholds.min_free_bytes;
        let free = volume.free_space()?;
        if free <= required {
            warn!("Card full: {} bytes free, need more than {}", free, required);
            return Err(DirectoryError::CardFull { free, required });
        }

        let id = self.highest_id + 1;
        if id > config.max_session_id {
            warn!("Session numbering exhausted at {}", self.highest_id);
            return Err(DirectoryError::SessionLimit(id));
        }

        match volume.create_dir(LOG_ROOT) {
            Ok(()) | Err(VolumeError::AlreadyExists) => {}
            Err(e) => return Err(e.into()),
        }

        let path = session_dir(id)?;
        match volume.create_dir(&path) {
            Ok(()) => {}
            Err(VolumeError::AlreadyExists) => {
                error!("Session directory {} already exists", path);
                return Err(DirectoryError::DuplicateSessionId(id));
            }
            Err(e) => return Err(e.into()),
        }

        let header = SessionHeader {
            session_id: id,
            start_ms: now_ms,
            firmware: FIRMWARE_VERSION,
            sensors: config.sensors,
            bike: config.bike,
            calibration: config.calibration,
        };

        let (header_file, log_file) = match self.create_files(volume, id, &header) {
            Ok(files) => files,
            Err(e) => {
                error!("Failed to create session {}: {}", id, e);
                Self::rollback(volume, id, &path);
                return Err(e.into());
            }
        };

        // The previous newest session is no longer resumable
        if let Some(last) = self.catalog.last_mut() {
            if last.status == SessionStatus::Open {
                last.status = SessionStatus::Orphaned;
            }
        }
        if self.catalog.is_full() {
            self.catalog.remove(0);
        }
        let _ = self.catalog.push(SessionInfo {
            id,
            status: SessionStatus::Open,
            header_bytes: HEADER_LEN as u64,
            log_bytes: 0,
        });
        self.highest_id = id;

        info!("Allocated session {} at {}", id, path);

        Ok(Session {
            id,
            path,
            created_ms: now_ms,
            status: SessionStatus::Open,
            header_file: Some(header_file),
            log_file: Some(log_file),
        })
    }

    fn create_files<V: StorageVolume>(
        &self,
        volume: &mut V,
        id: u32,
        header: &SessionHeader,
    ) -> Result<(V::File, V::File), VolumeError> {
        let mut header_file = volume.open_create(&session_file(id, HEADER_FILE)?)?;

        let written = write_all(
            volume,
            &mut header_file,
            &header.to_bytes(),
            self.max_short_writes,
        )
        .and_then(|_| volume.flush(&mut header_file));
        if let Err(e) = written {
            let _ = volume.close(header_file);
            return Err(e);
        }

        let log_path = match session_file(id, SAMPLES_FILE) {
            Ok(path) => path,
            Err(e) => {
                let _ = volume.close(header_file);
                return Err(e);
            }
        };
        match volume.open_create(&log_path) {
            Ok(log_file) => Ok((header_file, log_file)),
            Err(e) => {
                let _ = volume.close(header_file);
                Err(e)
            }
        }
    }

    fn rollback<V: StorageVolume>(volume: &mut V, id: u32, dir: &str) {
        for file in [HEADER_FILE, SAMPLES_FILE] {
            if let Ok(path) = session_file(id, file) {
                match volume.remove(&path) {
                    Ok(()) | Err(VolumeError::NotFound) => {}
                    Err(e) => warn!("Rollback could not remove {}: {}", path, e),
                }
            }
        }

        match volume.remove(dir) {
            Ok(()) => info!("Rolled back partial session {}", id),
            Err(VolumeError::Unsupported) => {
                warn!("Volume cannot remove directories, leaving empty {}", dir)
            }
            Err(e) => warn!("Rollback could not remove {}: {}", dir, e),
        }
    }

    /// Closes the sample log, appends the footer to the header file and
    /// marks the session finalized.
    ///
    /// Finalizing a session twice is a caller bug and is reported as
    /// [`DirectoryError::AlreadyFinalized`].
    pub fn finalize_session<V: StorageVolume>(
        &mut self,
        volume: &mut V,
        session: &mut Session<V::File>,
        footer: &SessionFooter,
    ) -> Result<(), DirectoryError> {
        if session.status != SessionStatus::Open {
            error!("Session {} finalized twice", session.id);
            return Err(DirectoryError::AlreadyFinalized(session.id));
        }

        if let Some(log_file) = session.log_file.take() {
            volume.close(log_file)?;
        }

        let mut header_file = match session.header_file.take() {
            Some(file) => file,
            None => volume.open_append(&session_file(session.id, HEADER_FILE)?)?,
        };
        let written = write_all(
            volume,
            &mut header_file,
            &footer.to_bytes(),
            self.max_short_writes,
        );
        let closed = volume.close(header_file);
        written?;
        closed?;

        session.status = SessionStatus::Finalized;
        if let Some(info) = self.catalog.iter_mut().find(|s| s.id == session.id) {
            info.status = SessionStatus::Finalized;
            info.header_bytes = (HEADER_LEN + FOOTER_LEN) as u64;
            info.log_bytes = footer.samples_written as u64 * RECORD_SIZE as u64;
        }

        info!(
            "Finalized session {}: {} samples, {} dropped",
            session.id, footer.samples_written, footer.samples_dropped
        );
        Ok(())
    }

    /// Closes a session's files without finalizing it.
    ///
    /// Used on the fault path: the session stays open on the card and is
    /// picked up as open or orphaned by the next scan.
    pub fn abandon_session<V: StorageVolume>(&mut self, volume: &mut V, session: &mut Session<V::File>) {
        for file in [session.log_file.take(), session.header_file.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = volume.close(file) {
                warn!("Closing abandoned session {} failed: {}", session.id, e);
            }
        }
        warn!("Session {} abandoned without footer", session.id);
    }
}
