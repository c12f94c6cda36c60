//! Device configuration, persisted on the card as postcard bytes.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::storage::{CONFIG_FILE, MAX_SESSION_ID, StorageVolume, VolumeError, write_all};

/// Largest batch the logging engine may drain per tick (one 512-byte block).
pub const MAX_BATCH_SIZE: u16 = 16;

/// Upper bound on the encoded configuration size.
pub const CONFIG_MAX_LEN: usize = 128;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to encode configuration")]
    Encode,
    #[error("failed to decode configuration")]
    Decode,
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("configuration storage error: {0}")]
    Volume(VolumeError),
}

impl From<VolumeError> for ConfigError {
    fn from(e: VolumeError) -> Self {
        Self::Volume(e)
    }
}

/// Sensor settings snapshotted into every session header.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSettings {
    /// Inertial sample rate in Hz
    pub sample_rate_hz: u16,
    /// Position fix rate in Hz
    pub position_rate_hz: u16,
    /// Accelerometer full-scale range in g
    pub accel_range_g: u16,
    /// Gyroscope full-scale range in degrees per second
    pub gyro_range_dps: u16,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            sample_rate_hz: 100,
            position_rate_hz: 1,
            accel_range_g: 4,
            gyro_range_dps: 500,
        }
    }
}

/// Suspension setup the rider enters before a ride. Stored with every
/// session so logs from different setups can be compared.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BikeSettings {
    /// Fork air pressure in psi
    pub fork_psi: u16,
    /// Fork compression clicks
    pub fork_compression: u8,
    /// Fork rebound clicks
    pub fork_rebound: u8,
    /// Shock air pressure in psi
    pub shock_psi: u16,
    /// Shock lockout position
    pub shock_lockout: u8,
    /// Shock rebound clicks
    pub shock_rebound: u8,
}

/// Sensor readings taken with the bike at rest, subtracted when the logs
/// are analysed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalibrationOffsets {
    /// Resting acceleration on x/y/z in raw sensor counts
    pub accel_rest: [i16; 3],
    /// Resting fork travel potentiometer reading
    pub fork_pot_rest: u16,
    /// Resting shock travel potentiometer reading
    pub shock_pot_rest: u16,
}

/// Limits checked before and during logging.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Headroom kept free on the card. A session is only allocated while the
    /// free space is strictly above this, so finalizing can always complete.
    pub min_free_bytes: u64,
    /// Battery percentage required to start logging
    pub min_logging_battery: u8,
    /// Battery percentage that forces low-power mode
    pub critical_battery: u8,
    /// Battery percentage required to leave low-power mode
    pub recovery_battery: u8,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_free_bytes: 1024 * 1024,
            min_logging_battery: 20,
            critical_battery: 10,
            recovery_battery: 25,
        }
    }
}

/// Logging engine tuning.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Records drained and written per main-loop tick
    pub batch_size: u16,
    /// Ticks between explicit flushes of the sample log
    pub flush_interval_ticks: u16,
    /// Consecutive capture drops that raise an overrun fault
    pub overrun_drop_limit: u32,
    /// Consecutive short writes tolerated before a card fault
    pub max_short_writes: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            flush_interval_ticks: 50,
            overrun_drop_limit: 32,
            max_short_writes: 3,
        }
    }
}

/// Complete device configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggerConfig {
    pub sensors: SensorSettings,
    pub bike: BikeSettings,
    pub calibration: CalibrationOffsets,
    pub thresholds: Thresholds,
    pub engine: EngineConfig,
    /// Highest session id that may be allocated
    pub max_session_id: u32,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            sensors: SensorSettings::default(),
            bike: BikeSettings::default(),
            calibration: CalibrationOffsets::default(),
            thresholds: Thresholds::default(),
            engine: EngineConfig::default(),
            max_session_id: MAX_SESSION_ID,
        }
    }
}

impl LoggerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if engine.batch_size == 0 || engine.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid("batch size out of range"));
        }
        if engine.flush_interval_ticks == 0 {
            return Err(ConfigError::Invalid("flush interval must be non-zero"));
        }
        if engine.overrun_drop_limit == 0 {
            return Err(ConfigError::Invalid("overrun drop limit must be non-zero"));
        }

        let t = &self.thresholds;
        if t.recovery_battery > 100 || t.min_logging_battery > 100 {
            return Err(ConfigError::Invalid("battery threshold above 100%"));
        }
        if t.critical_battery >= t.recovery_battery || t.critical_battery > t.min_logging_battery
        {
            return Err(ConfigError::Invalid("inconsistent battery thresholds"));
        }

        if self.max_session_id == 0 || self.max_session_id > MAX_SESSION_ID {
            return Err(ConfigError::Invalid("session id ceiling out of range"));
        }
        if self.sensors.sample_rate_hz == 0 {
            return Err(ConfigError::Invalid("sample rate must be non-zero"));
        }

        Ok(())
    }

    /// Reads and validates the configuration file.
    pub fn load<V: StorageVolume>(volume: &mut V) -> Result<Self, ConfigError> {
        let mut buf = [0u8; CONFIG_MAX_LEN];
        let mut file = volume.open_read(CONFIG_FILE)?;

        let mut len = 0;
        let read = loop {
            match volume.read(&mut file, &mut buf[len..]) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    len += n;
                    if len == buf.len() {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };
        volume.close(file)?;
        read?;

        let config: Self = postcard::from_bytes(&buf[..len]).map_err(|_| ConfigError::Decode)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration file, replacing any previous one.
    pub fn store<V: StorageVolume>(&self, volume: &mut V) -> Result<(), ConfigError> {
        let mut buf = [0u8; CONFIG_MAX_LEN];
        let encoded = postcard::to_slice(self, &mut buf).map_err(|_| ConfigError::Encode)?;

        let mut file = volume.open_create(CONFIG_FILE)?;
        let written = write_all(volume, &mut file, encoded, self.engine.max_short_writes);
        volume.close(file)?;
        written?;
        Ok(())
    }

    /// Loads the stored configuration, falling back to defaults.
    ///
    /// A missing file is replaced with the defaults. Configuration problems
    /// never stop the device from booting.
    pub fn load_or_default<V: StorageVolume>(volume: &mut V) -> Self {
        match Self::load(volume) {
            Ok(config) => {
                info!("Loaded configuration from {}", CONFIG_FILE);
                config
            }
            Err(ConfigError::Volume(VolumeError::NotFound)) => {
                info!("No {} on card, writing defaults", CONFIG_FILE);
                let config = Self::default();
                if let Err(e) = config.store(volume) {
                    warn!("Failed to write default configuration: {}", e);
                }
                config
            }
            Err(e) => {
                warn!("Ignoring stored configuration: {}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mock::MockVolume;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(LoggerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = LoggerConfig::default();
        config.engine.batch_size = MAX_BATCH_SIZE + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = LoggerConfig::default();
        config.thresholds.critical_battery = 30;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = LoggerConfig::default();
        config.max_session_id = MAX_SESSION_ID + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_store_then_load() {
        let mut volume = MockVolume::new();
        volume.mount().unwrap();

        let mut config = LoggerConfig::default();
        config.sensors.sample_rate_hz = 250;
        config.thresholds.min_free_bytes = 42;
        config.bike = BikeSettings {
            fork_psi: 110,
            fork_compression: 8,
            fork_rebound: 10,
            shock_psi: 230,
            shock_lockout: 1,
            shock_rebound: 6,
        };
        config.calibration = CalibrationOffsets {
            accel_rest: [-120, 64, 16_380],
            fork_pot_rest: 2048,
            shock_pot_rest: 1990,
        };
        config.store(&mut volume).unwrap();

        assert_eq!(LoggerConfig::load(&mut volume), Ok(config));
    }

    #[test]
    fn test_load_or_default_writes_missing_file() {
        let mut volume = MockVolume::new();
        volume.mount().unwrap();

        let config = LoggerConfig::load_or_default(&mut volume);

        assert_eq!(config, LoggerConfig::default());
        assert!(volume.file_contents(CONFIG_FILE).is_some());
    }

    #[test]
    fn test_load_or_default_ignores_garbage() {
        let mut volume = MockVolume::new();
        volume.mount().unwrap();
        volume.put_file(CONFIG_FILE, &[0xFF; 8]);

        assert_eq!(
            LoggerConfig::load_or_default(&mut volume),
            LoggerConfig::default()
        );
    }
}
