use log::{error, info, warn};

use super::{
    DeviceMode, FaultReason, ModeObserver, PreCheckFailure, Request, StateError, StopCause,
};
use crate::capture::CaptureConsumer;
use crate::config::LoggerConfig;
use crate::engine::{EngineCounters, LoggingEngine, TickOutcome};
use crate::sensors::{BatteryMonitor, Clock};
use crate::storage::{
    DirectoryError, Session, SessionDirectory, SessionInfo, StorageVolume, VolumeError,
};

/// The device's single owned context.
///
/// Holds the current mode and everything that mode gates: the card volume,
/// the session directory, the logging engine and the active session. Every
/// change goes through the request functions or [`DeviceContext::on_tick`].
pub struct DeviceContext<'q, V, B, C, O, const N: usize>
where
    V: StorageVolume,
    B: BatteryMonitor,
    C: Clock,
    O: ModeObserver,
{
    mode: DeviceMode,
    volume: V,
    battery: B,
    clock: C,
    observer: O,
    config: LoggerConfig,
    directory: SessionDirectory,
    engine: LoggingEngine<'q, N>,
    session: Option<Session<V::File>>,
    last_stop_cause: Option<StopCause>,
    fault_reason: Option<FaultReason>,
    low_power_pending: bool,
}

impl<'q, V, B, C, O, const N: usize> DeviceContext<'q, V, B, C, O, N>
where
    V: StorageVolume,
    B: BatteryMonitor,
    C: Clock,
    O: ModeObserver,
{
    /// Creates the context in `Init`. Call [`DeviceContext::boot`] next.
    pub fn new(volume: V, battery: B, clock: C, observer: O, consumer: CaptureConsumer<'q, N>) -> Self {
        let config = LoggerConfig::default();
        Self {
            mode: DeviceMode::Init,
            volume,
            battery,
            clock,
            observer,
            config,
            directory: SessionDirectory::new(config.engine.max_short_writes),
            engine: LoggingEngine::new(consumer, config.engine),
            session: None,
            last_stop_cause: None,
            fault_reason: None,
            low_power_pending: false,
        }
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn counters(&self) -> &EngineCounters {
        self.engine.counters()
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    /// Sessions on the card, ordered by id.
    pub fn sessions(&self) -> &[SessionInfo] {
        self.directory.sessions()
    }

    /// Sessions available for offload.
    pub fn finalized_sessions(&self) -> impl Iterator<Item = &SessionInfo> {
        self.directory.finalized()
    }

    pub fn active_session_id(&self) -> Option<u32> {
        self.session.as_ref().map(Session::id)
    }

    pub fn last_stop_cause(&self) -> Option<StopCause> {
        self.last_stop_cause
    }

    pub fn fault_reason(&self) -> Option<FaultReason> {
        self.fault_reason
    }

    pub fn volume(&self) -> &V {
        &self.volume
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    fn set_mode(&mut self, to: DeviceMode) {
        let from = self.mode;
        if from == to {
            return;
        }
        info!("Mode {:?} -> {:?}", from, to);
        self.mode = to;
        self.observer.mode_changed(from, to);
    }

    fn reject(&self, request: Request) -> StateError {
        let err = if self.mode.is_transitional() {
            StateError::Busy(self.mode)
        } else {
            StateError::InvalidTransition {
                from: self.mode,
                request,
            }
        };
        warn!("Rejected {:?}: {}", request, err);
        err
    }

    fn raise_fault(&mut self, reason: FaultReason) {
        error!("Fault: {}", reason);
        self.fault_reason = Some(reason);
        self.set_mode(DeviceMode::Fault);
        self.observer.fault_raised(reason);
    }

    /// Mounts the card, loads the configuration and scans the sessions.
    ///
    /// Ends in `Idle`, or in `Fault` if the card cannot be mounted or
    /// scanned.
    pub fn boot(&mut self) -> Result<(), StateError> {
        if self.mode != DeviceMode::Init {
            return Err(self.reject(Request::Boot));
        }

        if let Err(e) = self.volume.mount() {
            self.raise_fault(FaultReason::Mount(e));
            return Ok(());
        }

        self.config = LoggerConfig::load_or_default(&mut self.volume);
        self.engine.set_config(self.config.engine);
        self.directory = SessionDirectory::new(self.config.engine.max_short_writes);

        if let Err(e) = self.directory.scan_existing(&mut self.volume) {
            self.raise_fault(FaultReason::Scan(e));
            return Ok(());
        }

        info!(
            "Boot complete, {} sessions on card",
            self.directory.sessions().len()
        );
        self.set_mode(DeviceMode::Idle);
        Ok(())
    }

    /// Runs the pre-checks and, if they pass, opens a new session and
    /// starts logging.
    ///
    /// Returns with the device in `Logging`, back in `Idle` with
    /// [`StateError::PreCheckFailed`], or in `Fault` if the card failed
    /// while allocating.
    pub fn request_start(&mut self) -> Result<(), StateError> {
        if self.mode != DeviceMode::Idle {
            return Err(self.reject(Request::Start));
        }
        self.set_mode(DeviceMode::PreCheck);

        let level = self.battery.state_of_charge();
        let required = self.config.thresholds.min_logging_battery;
        if level < required {
            return Err(self.precheck_failed(PreCheckFailure::LowBattery { level, required }));
        }

        let now = self.clock.now_ms();
        match self
            .directory
            .allocate_session(&mut self.volume, &self.config, now)
        {
            Ok(session) => {
                self.engine.start();
                info!("Logging session {}", session.id());
                self.session = Some(session);
                self.last_stop_cause = None;
                self.set_mode(DeviceMode::Logging);
                Ok(())
            }
            Err(DirectoryError::CardFull { free, required }) => {
                Err(self.precheck_failed(PreCheckFailure::CardFull { free, required }))
            }
            Err(DirectoryError::SessionLimit(_)) => {
                Err(self.precheck_failed(PreCheckFailure::SessionLimit))
            }
            Err(e) => {
                let reason = FaultReason::Allocate(e);
                self.raise_fault(reason);
                Err(StateError::Faulted(reason))
            }
        }
    }

    fn precheck_failed(&mut self, reason: PreCheckFailure) -> StateError {
        warn!("Pre-check failed: {}", reason);
        self.set_mode(DeviceMode::Idle);
        self.observer.precheck_failed(reason);
        StateError::PreCheckFailed(reason)
    }

    /// Asks for an orderly stop. The session is finalized by later ticks
    /// once everything queued has been written.
    pub fn request_stop(&mut self) -> Result<(), StateError> {
        if self.mode != DeviceMode::Logging {
            return Err(self.reject(Request::Stop));
        }
        self.begin_stop(StopCause::User);
        Ok(())
    }

    fn begin_stop(&mut self, cause: StopCause) {
        self.engine.request_stop();
        self.last_stop_cause = Some(cause);
        self.set_mode(DeviceMode::Stopping);
    }

    pub fn request_transfer(&mut self) -> Result<(), StateError> {
        if self.mode != DeviceMode::Idle {
            return Err(self.reject(Request::Transfer));
        }
        self.set_mode(DeviceMode::Transfer);
        Ok(())
    }

    pub fn request_cancel_transfer(&mut self) -> Result<(), StateError> {
        self.leave_transfer(Request::CancelTransfer)
    }

    pub fn complete_transfer(&mut self) -> Result<(), StateError> {
        self.leave_transfer(Request::CompleteTransfer)
    }

    fn leave_transfer(&mut self, request: Request) -> Result<(), StateError> {
        if self.mode != DeviceMode::Transfer {
            return Err(self.reject(request));
        }
        self.set_mode(DeviceMode::Idle);
        Ok(())
    }

    /// Leaves `Fault` and runs the boot sequence again.
    pub fn reset_from_fault(&mut self) -> Result<(), StateError> {
        if self.mode != DeviceMode::Fault {
            return Err(self.reject(Request::ResetFault));
        }
        self.fault_reason = None;
        self.low_power_pending = false;
        self.set_mode(DeviceMode::Init);
        self.boot()
    }

    /// One main-loop iteration: battery supervision, then engine work while
    /// a session is open. Returns the mode afterwards.
    pub fn on_tick(&mut self) -> DeviceMode {
        if !matches!(self.mode, DeviceMode::Init | DeviceMode::Fault) && self.check_battery() {
            return self.mode;
        }

        if self.mode.is_logging() {
            self.run_engine();
        }

        self.mode
    }

    /// Returns `true` when the tick should end here.
    fn check_battery(&mut self) -> bool {
        let level = self.battery.state_of_charge();
        let thresholds = self.config.thresholds;
        let critical = level < thresholds.critical_battery;

        match self.mode {
            DeviceMode::LowPower => {
                if level >= thresholds.recovery_battery {
                    info!("Battery recovered to {}%", level);
                    self.set_mode(DeviceMode::Idle);
                }
                true
            }
            DeviceMode::Idle | DeviceMode::Transfer if critical => {
                warn!("Battery critical at {}%", level);
                self.set_mode(DeviceMode::LowPower);
                true
            }
            DeviceMode::Logging if critical => {
                warn!("Battery critical at {}%, stopping session", level);
                self.low_power_pending = true;
                self.begin_stop(StopCause::LowBattery);
                false
            }
            DeviceMode::Stopping if critical => {
                self.low_power_pending = true;
                false
            }
            _ => false,
        }
    }

    fn run_engine(&mut self) {
        let outcome = match self.session.as_mut().and_then(Session::log_file_mut) {
            Some(file) => self.engine.on_tick(&mut self.volume, file),
            None => {
                error!("No open sample log in {:?}", self.mode);
                TickOutcome::CardFault(VolumeError::NotFound)
            }
        };

        match outcome {
            TickOutcome::Idle | TickOutcome::Progress(_) => {}
            TickOutcome::Overrun(fault) => {
                if self.mode == DeviceMode::Logging {
                    warn!("Stopping session: {}", fault);
                    self.begin_stop(StopCause::Overrun);
                }
            }
            TickOutcome::CardFault(e) => {
                if self.mode == DeviceMode::Logging {
                    self.begin_stop(StopCause::CardFault);
                }
                self.abandon_session();
                self.raise_fault(FaultReason::CardWrite(e));
            }
            TickOutcome::DrainComplete => self.finish_session(),
        }
    }

    fn finish_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let footer = self.engine.footer(self.clock.now_ms());
        if let Err(e) = self
            .directory
            .finalize_session(&mut self.volume, &mut session, &footer)
        {
            self.directory.abandon_session(&mut self.volume, &mut session);
            self.raise_fault(FaultReason::Finalize(e));
            return;
        }

        self.set_mode(DeviceMode::Idle);
        if core::mem::take(&mut self.low_power_pending) {
            self.set_mode(DeviceMode::LowPower);
        }
    }

    fn abandon_session(&mut self) {
        self.engine.abort();
        if let Some(mut session) = self.session.take() {
            self.directory.abandon_session(&mut self.volume, &mut session);
        }
        self.low_power_pending = false;
    }
}
