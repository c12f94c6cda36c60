//! Fixed-layout sample records written to a session's sample log.
//!
//! Every record is exactly [`RECORD_SIZE`] bytes so a log can be indexed by
//! `offset / RECORD_SIZE` and its length checked against a record count.
//!
//! Binary format (little-endian):
//! - tag: 1 byte (see [`RecordKind`])
//! - flag: 1 byte (fix quality for positions, zero otherwise)
//! - reserved: 2 bytes
//! - timestamp: 4 bytes (u32, milliseconds since boot)
//! - payload: 24 bytes (kind specific, zero padded)

use thiserror_no_std::Error;

/// Size of one encoded record in bytes.
pub const RECORD_SIZE: usize = 32;

const TAG_OFFSET: usize = 0;
const FLAG_OFFSET: usize = 1;
const TIMESTAMP_OFFSET: usize = 4;
const PAYLOAD_OFFSET: usize = 8;

/// Errors raised when reading records or headers back from the card.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown record tag {0}")]
    UnknownTag(u8),
    #[error("bad fix quality {0}")]
    BadFixQuality(u8),
    #[error("bad magic")]
    BadMagic,
}

/// Tag byte identifying the record variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Inertial = 1,
    Position = 2,
    Marker = 3,
}

impl RecordKind {
    pub const fn from_tag(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            1 => Ok(Self::Inertial),
            2 => Ok(Self::Position),
            3 => Ok(Self::Marker),
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

/// Quality of a satellite position fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FixQuality {
    #[default]
    NoFix = 0,
    Fix2d = 1,
    Fix3d = 2,
    Differential = 3,
}

impl FixQuality {
    pub const fn from_byte(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::NoFix),
            1 => Ok(Self::Fix2d),
            2 => Ok(Self::Fix3d),
            3 => Ok(Self::Differential),
            other => Err(DecodeError::BadFixQuality(other)),
        }
    }

    /// Whether the fix carries a usable horizontal position.
    pub const fn has_position(self) -> bool {
        !matches!(self, Self::NoFix)
    }
}

/// One reading from the inertial sensor, already in engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InertialSample {
    /// Milliseconds since boot
    pub timestamp_ms: u32,
    /// Acceleration on x/y/z in milli-g
    pub accel_mg: [i32; 3],
    /// Angular rate on x/y/z in milli-degrees per second
    pub gyro_mdps: [i32; 3],
}

/// One position solution from the satellite receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PositionFix {
    /// Milliseconds since boot
    pub timestamp_ms: u32,
    /// Latitude in 1e-7 degrees
    pub latitude_e7: i32,
    /// Longitude in 1e-7 degrees
    pub longitude_e7: i32,
    /// Altitude above mean sea level in millimetres
    pub altitude_mm: i32,
    /// Speed over ground in millimetres per second
    pub ground_speed_mm_s: u32,
    /// Satellites used in the solution
    pub satellites: u8,
    pub fix: FixQuality,
}

/// A rider-placed marker (e.g. start of a trail section).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrailMarker {
    pub timestamp_ms: u32,
    /// Markers are numbered from 1 within a session
    pub number: u16,
}

/// A single timestamped record in the sample log.
///
/// The inertial and position streams interleave in arrival order; readers
/// demultiplex on [`SampleRecord::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRecord {
    Inertial(InertialSample),
    Position(PositionFix),
    Marker(TrailMarker),
}

impl From<InertialSample> for SampleRecord {
    fn from(sample: InertialSample) -> Self {
        Self::Inertial(sample)
    }
}

impl From<PositionFix> for SampleRecord {
    fn from(fix: PositionFix) -> Self {
        Self::Position(fix)
    }
}

impl From<TrailMarker> for SampleRecord {
    fn from(marker: TrailMarker) -> Self {
        Self::Marker(marker)
    }
}

impl SampleRecord {
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::Inertial(_) => RecordKind::Inertial,
            Self::Position(_) => RecordKind::Position,
            Self::Marker(_) => RecordKind::Marker,
        }
    }

    pub const fn timestamp_ms(&self) -> u32 {
        match self {
            Self::Inertial(s) => s.timestamp_ms,
            Self::Position(p) => p.timestamp_ms,
            Self::Marker(m) => m.timestamp_ms,
        }
    }

    /// Encodes the record into its on-card representation.
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[TAG_OFFSET] = self.kind() as u8;
        put_u32(&mut bytes, TIMESTAMP_OFFSET, self.timestamp_ms());

        match self {
            Self::Inertial(sample) => {
                let mut offset = PAYLOAD_OFFSET;
                for value in sample.accel_mg.iter().chain(sample.gyro_mdps.iter()) {
                    put_i32(&mut bytes, offset, *value);
                    offset += 4;
                }
            }
            Self::Position(fix) => {
                bytes[FLAG_OFFSET] = fix.fix as u8;
                put_i32(&mut bytes, PAYLOAD_OFFSET, fix.latitude_e7);
                put_i32(&mut bytes, PAYLOAD_OFFSET + 4, fix.longitude_e7);
                put_i32(&mut bytes, PAYLOAD_OFFSET + 8, fix.altitude_mm);
                put_u32(&mut bytes, PAYLOAD_OFFSET + 12, fix.ground_speed_mm_s);
                bytes[PAYLOAD_OFFSET + 16] = fix.satellites;
            }
            Self::Marker(marker) => {
                bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 2]
                    .copy_from_slice(&marker.number.to_le_bytes());
            }
        }

        bytes
    }

    /// Decodes a record previously produced by [`SampleRecord::to_bytes`].
    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Result<Self, DecodeError> {
        let timestamp_ms = get_u32(bytes, TIMESTAMP_OFFSET);

        let record = match RecordKind::from_tag(bytes[TAG_OFFSET])? {
            RecordKind::Inertial => {
                let mut values = [0i32; 6];
                for (i, value) in values.iter_mut().enumerate() {
                    *value = get_i32(bytes, PAYLOAD_OFFSET + i * 4);
                }
                Self::Inertial(InertialSample {
                    timestamp_ms,
                    accel_mg: [values[0], values[1], values[2]],
                    gyro_mdps: [values[3], values[4], values[5]],
                })
            }
            RecordKind::Position => Self::Position(PositionFix {
                timestamp_ms,
                latitude_e7: get_i32(bytes, PAYLOAD_OFFSET),
                longitude_e7: get_i32(bytes, PAYLOAD_OFFSET + 4),
                altitude_mm: get_i32(bytes, PAYLOAD_OFFSET + 8),
                ground_speed_mm_s: get_u32(bytes, PAYLOAD_OFFSET + 12),
                satellites: bytes[PAYLOAD_OFFSET + 16],
                fix: FixQuality::from_byte(bytes[FLAG_OFFSET])?,
            }),
            RecordKind::Marker => {
                let mut number = [0u8; 2];
                number.copy_from_slice(&bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 2]);
                Self::Marker(TrailMarker {
                    timestamp_ms,
                    number: u16::from_le_bytes(number),
                })
            }
        };

        Ok(record)
    }
}

pub(crate) fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_i32(bytes: &mut [u8], offset: usize, value: i32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn get_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut value = [0u8; 4];
    value.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(value)
}

pub(crate) fn get_i32(bytes: &[u8], offset: usize) -> i32 {
    let mut value = [0u8; 4];
    value.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_le_bytes(value)
}
