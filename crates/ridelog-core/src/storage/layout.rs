//! On-card layout of the logging tree.
//!
//! ```text
//! RIDELOG.CFG            postcard-encoded LoggerConfig
//! RIDELOG/
//!   0001/
//!     HEADER.BIN         SessionHeader (64 bytes), then SessionFooter (32 bytes) once finalized
//!     SAMPLES.BIN        N x SampleRecord (32 bytes each), append-only
//!   0002/
//!     ...
//! ```
//!
//! Session ids are never stored anywhere else: the highest directory name is
//! the counter.

use core::fmt::Write;

use super::record::{DecodeError, RECORD_SIZE, get_u32, put_u32};
use super::{VolumeError, VolumePath, join_path};
use crate::config::{BikeSettings, CalibrationOffsets, SensorSettings};

/// Root logging directory holding one subdirectory per session.
pub const LOG_ROOT: &str = "RIDELOG";
/// Parameter header file inside a session directory.
pub const HEADER_FILE: &str = "HEADER.BIN";
/// Sample log file inside a session directory.
pub const SAMPLES_FILE: &str = "SAMPLES.BIN";
/// Device configuration file at the volume root.
pub const CONFIG_FILE: &str = "RIDELOG.CFG";

/// Digits in a session directory name.
pub const SESSION_ID_DIGITS: usize = 4;
/// Largest id representable with [`SESSION_ID_DIGITS`] digits.
pub const MAX_SESSION_ID: u32 = 9999;

/// Size of the encoded [`SessionHeader`].
pub const HEADER_LEN: usize = 64;
/// Size of the encoded [`SessionFooter`].
pub const FOOTER_LEN: usize = 32;

const HEADER_MAGIC: &[u8; 8] = b"RIDELOG1";
const FOOTER_MAGIC: &[u8; 8] = b"RIDEEND1";
const FORMAT_VERSION: u16 = 1;

/// Firmware version stamped into every session header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

pub const FIRMWARE_VERSION: FirmwareVersion = FirmwareVersion {
    major: 0,
    minor: 1,
    patch: 0,
};

/// Path of the session directory for `id`, e.g. `RIDELOG/0007`.
pub fn session_dir(id: u32) -> Result<VolumePath, VolumeError> {
    let mut path = VolumePath::new();
    write!(path, "{}/{:04}", LOG_ROOT, id).map_err(|_| VolumeError::InvalidPath)?;
    Ok(path)
}

/// Path of `file` inside the session directory for `id`.
pub fn session_file(id: u32, file: &str) -> Result<VolumePath, VolumeError> {
    join_path(&session_dir(id)?, file)
}

/// Parses a session directory name. Anything that is not all decimal
/// digits (or is zero) is not a session.
pub fn parse_session_id(name: &str) -> Option<u32> {
    if name.is_empty() || name.len() > 8 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse::<u32>().ok().filter(|id| *id > 0)
}

/// Device configuration snapshot written once at the start of a session.
///
/// Binary format (little-endian, 64 bytes):
/// - magic: 8 bytes (`RIDELOG1`)
/// - format version: 2 bytes (u16)
/// - record size: 2 bytes (u16)
/// - firmware version: 3 bytes + 1 reserved
/// - session id: 4 bytes (u32)
/// - start timestamp: 4 bytes (u32, ms since boot)
/// - inertial rate, position rate, accel range, gyro range: 4 x u16
/// - fork psi, shock psi: 2 x u16
/// - fork compression, fork rebound, shock lockout, shock rebound: 4 x u8
/// - accelerometer rest x/y/z: 3 x i16
/// - fork pot rest, shock pot rest: 2 x u16
/// - reserved: 14 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHeader {
    pub session_id: u32,
    pub start_ms: u32,
    pub firmware: FirmwareVersion,
    pub sensors: SensorSettings,
    pub bike: BikeSettings,
    pub calibration: CalibrationOffsets,
}

impl SessionHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..8].copy_from_slice(HEADER_MAGIC);
        bytes[8..10].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes[10..12].copy_from_slice(&(RECORD_SIZE as u16).to_le_bytes());
        bytes[12] = self.firmware.major;
        bytes[13] = self.firmware.minor;
        bytes[14] = self.firmware.patch;
        put_u32(&mut bytes, 16, self.session_id);
        put_u32(&mut bytes, 20, self.start_ms);
        bytes[24..26].copy_from_slice(&self.sensors.sample_rate_hz.to_le_bytes());
        bytes[26..28].copy_from_slice(&self.sensors.position_rate_hz.to_le_bytes());
        bytes[28..30].copy_from_slice(&self.sensors.accel_range_g.to_le_bytes());
        bytes[30..32].copy_from_slice(&self.sensors.gyro_range_dps.to_le_bytes());

        bytes[32..34].copy_from_slice(&self.bike.fork_psi.to_le_bytes());
        bytes[34..36].copy_from_slice(&self.bike.shock_psi.to_le_bytes());
        bytes[36] = self.bike.fork_compression;
        bytes[37] = self.bike.fork_rebound;
        bytes[38] = self.bike.shock_lockout;
        bytes[39] = self.bike.shock_rebound;

        for (i, rest) in self.calibration.accel_rest.iter().enumerate() {
            let offset = 40 + i * 2;
            bytes[offset..offset + 2].copy_from_slice(&rest.to_le_bytes());
        }
        bytes[46..48].copy_from_slice(&self.calibration.fork_pot_rest.to_le_bytes());
        bytes[48..50].copy_from_slice(&self.calibration.shock_pot_rest.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Result<Self, DecodeError> {
        if &bytes[0..8] != HEADER_MAGIC {
            return Err(DecodeError::BadMagic);
        }

        let u16_at = |offset: usize| u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);

        Ok(Self {
            session_id: get_u32(bytes, 16),
            start_ms: get_u32(bytes, 20),
            firmware: FirmwareVersion {
                major: bytes[12],
                minor: bytes[13],
                patch: bytes[14],
            },
            sensors: SensorSettings {
                sample_rate_hz: u16_at(24),
                position_rate_hz: u16_at(26),
                accel_range_g: u16_at(28),
                gyro_range_dps: u16_at(30),
            },
            bike: BikeSettings {
                fork_psi: u16_at(32),
                shock_psi: u16_at(34),
                fork_compression: bytes[36],
                fork_rebound: bytes[37],
                shock_lockout: bytes[38],
                shock_rebound: bytes[39],
            },
            calibration: CalibrationOffsets {
                accel_rest: [
                    u16_at(40) as i16,
                    u16_at(42) as i16,
                    u16_at(44) as i16,
                ],
                fork_pot_rest: u16_at(46),
                shock_pot_rest: u16_at(48),
            },
        })
    }
}

/// Summary appended to the header file when a session is finalized.
///
/// Its presence is what marks a session as cleanly finished on the card.
///
/// Binary format (little-endian, 32 bytes):
/// - magic: 8 bytes (`RIDEEND1`)
/// - samples written, samples dropped, flush count, end timestamp: 4 x u32
/// - reserved: 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionFooter {
    pub samples_written: u32,
    pub samples_dropped: u32,
    pub flush_count: u32,
    pub end_ms: u32,
}

impl SessionFooter {
    pub fn to_bytes(&self) -> [u8; FOOTER_LEN] {
        let mut bytes = [0u8; FOOTER_LEN];
        bytes[0..8].copy_from_slice(FOOTER_MAGIC);
        put_u32(&mut bytes, 8, self.samples_written);
        put_u32(&mut bytes, 12, self.samples_dropped);
        put_u32(&mut bytes, 16, self.flush_count);
        put_u32(&mut bytes, 20, self.end_ms);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; FOOTER_LEN]) -> Result<Self, DecodeError> {
        if &bytes[0..8] != FOOTER_MAGIC {
            return Err(DecodeError::BadMagic);
        }

        Ok(Self {
            samples_written: get_u32(bytes, 8),
            samples_dropped: get_u32(bytes, 12),
            flush_count: get_u32(bytes, 16),
            end_ms: get_u32(bytes, 20),
        })
    }
}
