//! Device mode and error types for the logger.

mod machine;
#[cfg(test)]
mod tests;

pub use machine::*;

use thiserror_no_std::Error;

use crate::storage::{DirectoryError, VolumeError};

/// What the device is doing. Exactly one mode is current at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Init,
    Idle,
    PreCheck,
    Logging,
    Stopping,
    Transfer,
    Fault,
    LowPower,
}

impl DeviceMode {
    /// Modes that are the middle of a transition and refuse new requests.
    pub const fn is_transitional(self) -> bool {
        matches!(self, Self::PreCheck | Self::Stopping)
    }

    /// Modes in which the sample log is open.
    pub const fn is_logging(self) -> bool {
        matches!(self, Self::Logging | Self::Stopping)
    }
}

/// Requests a collaborator can make of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Boot,
    Start,
    Stop,
    Transfer,
    CancelTransfer,
    CompleteTransfer,
    ResetFault,
}

/// Why a start request was turned down in `PreCheck`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreCheckFailure {
    #[error("card full: {free} bytes free, more than {required} required")]
    CardFull { free: u64, required: u64 },
    #[error("battery at {level}%, {required}% required")]
    LowBattery { level: u8, required: u8 },
    #[error("no session ids left")]
    SessionLimit,
}

/// Unrecoverable conditions that put the device in `Fault`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    #[error("mount failed: {0}")]
    Mount(VolumeError),
    #[error("session scan failed: {0}")]
    Scan(DirectoryError),
    #[error("session allocation failed: {0}")]
    Allocate(DirectoryError),
    #[error("card write failed: {0}")]
    CardWrite(VolumeError),
    #[error("session finalize failed: {0}")]
    Finalize(DirectoryError),
}

/// Rejected transition requests.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("busy in {0:?}")]
    Busy(DeviceMode),
    #[error("{request:?} not allowed in {from:?}")]
    InvalidTransition { from: DeviceMode, request: Request },
    #[error("pre-check failed: {0}")]
    PreCheckFailed(PreCheckFailure),
    #[error("request faulted the device: {0}")]
    Faulted(FaultReason),
}

/// Why the last session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    User,
    Overrun,
    CardFault,
    LowBattery,
}

/// Collaborator notified synchronously of every mode change.
///
/// Calls happen before the request that caused them returns, so the UI and
/// the status indicator never show a stale mode.
pub trait ModeObserver {
    fn mode_changed(&mut self, from: DeviceMode, to: DeviceMode);

    fn precheck_failed(&mut self, _reason: PreCheckFailure) {}

    fn fault_raised(&mut self, _reason: FaultReason) {}
}

impl ModeObserver for () {
    fn mode_changed(&mut self, _from: DeviceMode, _to: DeviceMode) {}
}

impl<A: ModeObserver, B: ModeObserver> ModeObserver for (A, B) {
    fn mode_changed(&mut self, from: DeviceMode, to: DeviceMode) {
        self.0.mode_changed(from, to);
        self.1.mode_changed(from, to);
    }

    fn precheck_failed(&mut self, reason: PreCheckFailure) {
        self.0.precheck_failed(reason);
        self.1.precheck_failed(reason);
    }

    fn fault_raised(&mut self, reason: FaultReason) {
        self.0.fault_raised(reason);
        self.1.fault_raised(reason);
    }
}

impl<T: ModeObserver + ?Sized> ModeObserver for &mut T {
    fn mode_changed(&mut self, from: DeviceMode, to: DeviceMode) {
        (**self).mode_changed(from, to);
    }

    fn precheck_failed(&mut self, reason: PreCheckFailure) {
        (**self).precheck_failed(reason);
    }

    fn fault_raised(&mut self, reason: FaultReason) {
        (**self).fault_raised(reason);
    }
}
