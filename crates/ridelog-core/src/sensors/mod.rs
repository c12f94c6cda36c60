//! Capability traits for the peripherals the core talks to.
//!
//! Register access, unit conversion and threshold curves live in the
//! drivers behind these traits. The core only sees readings.

use crate::storage::{InertialSample, PositionFix};

/// A thing that yields timestamped inertial samples.
pub trait InertialSource {
    /// Reads one sample, or `None` if the sensor has nothing new.
    ///
    /// Called from the capture interrupt, so it must complete in bounded
    /// time.
    fn read_inertial(&mut self, now_ms: u32) -> Option<InertialSample>;
}

/// A thing that yields position fixes from the satellite receiver.
pub trait PositionSource {
    /// Returns the latest complete fix, or `None` if none arrived since the
    /// previous call.
    fn read_position(&mut self, now_ms: u32) -> Option<PositionFix>;
}

/// Battery state of charge.
pub trait BatteryMonitor {
    /// Remaining charge in percent (0..=100).
    fn state_of_charge(&mut self) -> u8;
}

/// Monotonic millisecond clock.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

impl<T: BatteryMonitor + ?Sized> BatteryMonitor for &mut T {
    fn state_of_charge(&mut self) -> u8 {
        (**self).state_of_charge()
    }
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}
