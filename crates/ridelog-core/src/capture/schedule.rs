//! Timer-driven stream scheduling for the capture interrupt.
//!
//! The capture timer runs at a fixed base rate. Each stream has a counter
//! period (in timer ticks) and a starting offset chosen so that the two
//! peripherals are not read in the same tick. If two streams still come due
//! together, position runs first and inertial runs on the next tick. The
//! inertial counter keeps its overshoot, so the deferred read does not shift
//! the stream's cadence or cost it a sample. When either stream runs on
//! every tick there is no free tick to defer into, and both are read in the
//! same tick.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::config::SensorSettings;
use crate::sensors::{InertialSource, PositionSource};
use crate::storage::{SampleRecord, TrailMarker};

/// When a stream runs, in timer ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSchedule {
    pub offset: u32,
    pub period: u32,
}

impl StreamSchedule {
    /// Schedule for a stream at `rate_hz` on a timer running at `timer_hz`.
    pub fn from_rate(timer_hz: u32, rate_hz: u32, offset: u32) -> Self {
        Self {
            offset,
            period: (timer_hz / rate_hz.max(1)).max(1),
        }
    }
}

/// Schedules for both sensor streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerSchedule {
    pub position: StreamSchedule,
    pub inertial: StreamSchedule,
}

impl SamplerSchedule {
    pub fn for_settings(timer_hz: u32, sensors: &SensorSettings) -> Self {
        let inertial = StreamSchedule::from_rate(timer_hz, sensors.sample_rate_hz.into(), 0);
        // Odd ticks for position when inertial runs on even ones
        let position_offset = if inertial.period > 1 { 1 } else { 0 };
        Self {
            position: StreamSchedule::from_rate(
                timer_hz,
                sensors.position_rate_hz.into(),
                position_offset,
            ),
            inertial,
        }
    }
}

#[derive(Clone, Copy)]
struct MarkerState {
    pending: bool,
    last_number: u16,
}

/// Trail marker request latched by the UI and consumed by the sampler.
pub struct MarkerLatch {
    state: Mutex<CriticalSectionRawMutex, Cell<MarkerState>>,
}

impl MarkerLatch {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(Cell::new(MarkerState {
                pending: false,
                last_number: 0,
            })),
        }
    }

    /// Requests a marker on the next timer tick. Repeated presses before
    /// that tick collapse into one marker.
    pub fn latch(&self) {
        self.state.lock(|cell| {
            let mut state = cell.get();
            state.pending = true;
            cell.set(state);
        });
    }

    /// Takes the pending marker, returning its number.
    pub fn take(&self) -> Option<u16> {
        self.state.lock(|cell| {
            let mut state = cell.get();
            if !state.pending {
                return None;
            }
            state.pending = false;
            state.last_number = state.last_number.wrapping_add(1);
            cell.set(state);
            Some(state.last_number)
        })
    }

    /// Restarts numbering for a new session.
    pub fn reset(&self) {
        self.state.lock(|cell| {
            cell.set(MarkerState {
                pending: false,
                last_number: 0,
            })
        });
    }
}

impl Default for MarkerLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// What one timer tick produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerReport {
    pub pushed: u8,
    pub rejected: u8,
}

impl TimerReport {
    fn record(&mut self, accepted: bool) {
        if accepted {
            self.pushed += 1;
        } else {
            self.rejected += 1;
        }
    }
}

/// Reads the sensor streams on their schedules from the capture interrupt.
pub struct Sampler<I, P> {
    inertial: I,
    position: P,
    schedule: SamplerSchedule,
    position_counter: u32,
    inertial_counter: u32,
}

impl<I: InertialSource, P: PositionSource> Sampler<I, P> {
    pub fn new(inertial: I, position: P, schedule: SamplerSchedule) -> Self {
        Self {
            inertial,
            position,
            schedule,
            position_counter: schedule.position.offset,
            inertial_counter: schedule.inertial.offset,
        }
    }

    pub fn schedule(&self) -> SamplerSchedule {
        self.schedule
    }

    /// Handles one timer tick: runs the due streams, then emits a latched
    /// marker. Records go to `push`, which must not block.
    pub fn on_timer(
        &mut self,
        now_ms: u32,
        markers: &MarkerLatch,
        mut push: impl FnMut(SampleRecord) -> bool,
    ) -> TimerReport {
        let mut report = TimerReport::default();

        // All counters advance together before any stream runs
        self.position_counter = self.position_counter.saturating_add(1);
        self.inertial_counter = self.inertial_counter.saturating_add(1);

        let mut position_ran = false;
        if self.position_counter >= self.schedule.position.period {
            self.position_counter = 0;
            position_ran = true;
            if let Some(fix) = self.position.read_position(now_ms) {
                report.record(push(fix.into()));
            }
        }

        let inertial_period = self.schedule.inertial.period;
        let shares_ticks = self.schedule.position.period == 1 || inertial_period == 1;
        if self.inertial_counter >= inertial_period && (!position_ran || shares_ticks) {
            // Overshoot from a deferred read carries into the next period
            self.inertial_counter = (self.inertial_counter - inertial_period)
                .min(inertial_period.saturating_sub(1));
            if let Some(sample) = self.inertial.read_inertial(now_ms) {
                report.record(push(sample.into()));
            }
        }

        if let Some(number) = markers.take() {
            report.record(push(SampleRecord::Marker(TrailMarker {
                timestamp_ms: now_ms,
                number,
            })));
        }

        report
    }
}
