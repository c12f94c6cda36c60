//! Logging engine: moves records from the capture queue into the active
//! session's sample log.

use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::capture::CaptureConsumer;
use crate::config::{EngineConfig, MAX_BATCH_SIZE};
use crate::storage::{RECORD_SIZE, SessionFooter, StorageVolume, VolumeError, write_all};

const BATCH_BYTES: usize = MAX_BATCH_SIZE as usize * RECORD_SIZE;

/// Sustained capture queue saturation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("capture overrun: {streak} consecutive samples dropped")]
pub struct OverrunFault {
    pub streak: u32,
}

/// Counters for the current session. Reset when a session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineCounters {
    pub samples_written: u32,
    pub samples_dropped: u32,
    pub flush_count: u32,
    pub last_card_error: Option<VolumeError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not logging; the capture queue is closed
    Inactive,
    /// Logging; the capture queue accepts records
    Active,
    /// Stop requested; writing out what is still queued
    Draining,
    /// A card write failed; nothing more is written until restarted
    Faulted,
}

/// Result of one [`LoggingEngine::on_tick`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do
    Idle,
    /// Records written this tick
    Progress(usize),
    /// The queue is empty after a stop request and the log is flushed
    DrainComplete,
    /// Too many consecutive samples were dropped
    Overrun(OverrunFault),
    /// The card failed; reported once
    CardFault(VolumeError),
}

pub struct LoggingEngine<'q, const N: usize> {
    consumer: CaptureConsumer<'q, N>,
    config: EngineConfig,
    counters: EngineCounters,
    state: EngineState,
    ticks_since_flush: u16,
    unflushed: bool,
}

impl<'q, const N: usize> LoggingEngine<'q, N> {
    /// Takes over the consumer half and closes the queue until started.
    pub fn new(mut consumer: CaptureConsumer<'q, N>, config: EngineConfig) -> Self {
        consumer.set_accepting(false);
        consumer.clear();
        Self {
            consumer,
            config,
            counters: EngineCounters::default(),
            state: EngineState::Inactive,
            ticks_since_flush: 0,
            unflushed: false,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    /// Records currently waiting in the capture queue.
    pub fn queued(&self) -> usize {
        self.consumer.len()
    }

    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = config;
    }

    /// Starts a session: stale records are discarded, counters reset and
    /// the queue opened.
    pub fn start(&mut self) {
        self.consumer.set_accepting(false);
        let stale = self.consumer.clear();
        if stale > 0 {
            debug!("Discarded {} stale records before start", stale);
        }
        self.consumer.reset_stats();

        self.counters = EngineCounters::default();
        self.ticks_since_flush = 0;
        self.unflushed = false;
        self.state = EngineState::Active;
        self.consumer.set_accepting(true);
        info!("Logging engine started");
    }

    /// Stops accepting new records. Ticking continues until everything
    /// queued before this call is written.
    pub fn request_stop(&mut self) {
        if self.state != EngineState::Active {
            return;
        }
        self.consumer.set_accepting(false);
        self.state = EngineState::Draining;
        info!("Stop requested, draining {} queued records", self.consumer.len());
    }

    /// Lossy stop: closes the queue and discards whatever is still queued.
    pub fn abort(&mut self) {
        self.consumer.set_accepting(false);
        let lost = self.consumer.clear();
        if lost > 0 {
            warn!("Logging aborted, {} queued records discarded", lost);
        }
        self.state = EngineState::Inactive;
    }

    /// Drains one batch into `file`, flushing on the configured interval.
    pub fn on_tick<V: StorageVolume>(&mut self, volume: &mut V, file: &mut V::File) -> TickOutcome {
        if !matches!(self.state, EngineState::Active | EngineState::Draining) {
            return TickOutcome::Idle;
        }

        let mut batch: heapless::Vec<u8, BATCH_BYTES> = heapless::Vec::new();
        let max_items = usize::from(self.config.batch_size.min(MAX_BATCH_SIZE));
        let count = self.consumer.drain_into(
            |record| {
                // Capacity is exactly MAX_BATCH_SIZE records
                let _ = batch.extend_from_slice(&record.to_bytes());
            },
            max_items,
        );

        if count > 0 {
            if let Err(e) = write_all(volume, file, &batch, self.config.max_short_writes) {
                return self.card_fault(e);
            }
            self.counters.samples_written = self.counters.samples_written.saturating_add(count as u32);
            self.unflushed = true;
            debug!("Wrote {} records ({} total)", count, self.counters.samples_written);
        }

        self.ticks_since_flush = self.ticks_since_flush.saturating_add(1);
        if self.ticks_since_flush >= self.config.flush_interval_ticks {
            if let Err(e) = self.flush(volume, file) {
                return self.card_fault(e);
            }
        }

        let stats = self.consumer.stats();
        self.counters.samples_dropped = stats.dropped;

        match self.state {
            EngineState::Draining if self.consumer.is_empty() => {
                if let Err(e) = self.flush(volume, file) {
                    return self.card_fault(e);
                }
                self.state = EngineState::Inactive;
                info!(
                    "Drain complete: {} written, {} dropped",
                    self.counters.samples_written, self.counters.samples_dropped
                );
                TickOutcome::DrainComplete
            }
            EngineState::Active => {
                let streak = self.consumer.take_longest_streak();
                if streak >= self.config.overrun_drop_limit {
                    error!("Capture overrun: {} consecutive samples dropped", streak);
                    TickOutcome::Overrun(OverrunFault { streak })
                } else if count > 0 {
                    TickOutcome::Progress(count)
                } else {
                    TickOutcome::Idle
                }
            }
            _ if count > 0 => TickOutcome::Progress(count),
            _ => TickOutcome::Idle,
        }
    }

    fn flush<V: StorageVolume>(&mut self, volume: &mut V, file: &mut V::File) -> Result<(), VolumeError> {
        self.ticks_since_flush = 0;
        if !self.unflushed {
            return Ok(());
        }
        volume.flush(file)?;
        self.unflushed = false;
        self.counters.flush_count = self.counters.flush_count.saturating_add(1);
        debug!("Flushed sample log ({} flushes)", self.counters.flush_count);
        Ok(())
    }

    fn card_fault(&mut self, e: VolumeError) -> TickOutcome {
        self.counters.last_card_error = Some(e);
        self.state = EngineState::Faulted;
        self.consumer.set_accepting(false);
        let lost = self.consumer.clear();
        error!("Card write failed: {}, {} queued records lost", e, lost);
        TickOutcome::CardFault(e)
    }

    /// Footer summarizing the session so far.
    pub fn footer(&self, end_ms: u32) -> SessionFooter {
        SessionFooter {
            samples_written: self.counters.samples_written,
            samples_dropped: self.counters.samples_dropped,
            flush_count: self.counters.flush_count,
            end_ms,
        }
    }
}
