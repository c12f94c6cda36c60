//! Sample capture queue.
//!
//! A fixed-capacity single-producer/single-consumer queue between the timer
//! interrupt that produces [`SampleRecord`]s and the main loop that drains
//! them to the card. Each side only ever holds the queue's critical section
//! for one slot, so interrupt latency stays bounded no matter how far the
//! card falls behind.

mod schedule;
mod shared;

pub use schedule::*;
pub use shared::*;

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use heapless::Deque;

use crate::storage::SampleRecord;

/// Queue capacity used by the firmware.
///
/// At 100 Hz inertial plus 1 Hz position this absorbs a 2.5 s card stall,
/// longer than the default flush interval of 50 ticks at 100 Hz.
pub const CAPTURE_QUEUE_LEN: usize = 256;

/// Overrun statistics kept by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureStats {
    /// Pushes rejected because the queue was full
    pub dropped: u32,
    /// Consecutive rejected pushes up to now
    pub current_streak: u32,
    /// Longest run of consecutive rejected pushes since last taken
    pub longest_streak: u32,
}

struct QueueState<const N: usize> {
    slots: Deque<SampleRecord, N>,
    accepting: bool,
    split: bool,
    stats: CaptureStats,
}

/// Fixed-capacity record queue. Split it once into its two halves.
pub struct CaptureQueue<const N: usize> {
    state: Mutex<CriticalSectionRawMutex, RefCell<QueueState<N>>>,
}

impl<const N: usize> CaptureQueue<N> {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(QueueState {
                slots: Deque::new(),
                accepting: true,
                split: false,
                stats: CaptureStats {
                    dropped: 0,
                    current_streak: 0,
                    longest_streak: 0,
                },
            })),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Hands out the producer and consumer halves. Only the first call
    /// succeeds.
    pub fn split(&self) -> Option<(CaptureProducer<'_, N>, CaptureConsumer<'_, N>)> {
        let first = self.with(|state| !core::mem::replace(&mut state.split, true));
        first.then(|| (CaptureProducer { queue: self }, CaptureConsumer { queue: self }))
    }

    fn with<R>(&self, f: impl FnOnce(&mut QueueState<N>) -> R) -> R {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }
}

impl<const N: usize> Default for CaptureQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer half, owned by the capture interrupt.
pub struct CaptureProducer<'a, const N: usize> {
    queue: &'a CaptureQueue<N>,
}

impl<const N: usize> CaptureProducer<'_, N> {
    /// Enqueues a record without blocking.
    ///
    /// Returns `false` and leaves the queue unchanged when it is full (the
    /// drop is counted) or when the consumer has closed the queue (not
    /// counted: nothing is being logged).
    pub fn push(&mut self, record: SampleRecord) -> bool {
        self.queue.with(|state| {
            if !state.accepting {
                return false;
            }

            let stats = &mut state.stats;
            match state.slots.push_back(record) {
                Ok(()) => {
                    stats.current_streak = 0;
                    true
                }
                Err(_) => {
                    stats.dropped = stats.dropped.saturating_add(1);
                    stats.current_streak = stats.current_streak.saturating_add(1);
                    stats.longest_streak = stats.longest_streak.max(stats.current_streak);
                    false
                }
            }
        })
    }
}

/// Consumer half, owned by the main loop.
pub struct CaptureConsumer<'a, const N: usize> {
    queue: &'a CaptureQueue<N>,
}

impl<const N: usize> CaptureConsumer<'_, N> {
    /// Pops up to `max_items` records in FIFO order into `sink`.
    ///
    /// Returns the number of records popped, zero when the queue is empty.
    pub fn drain_into(&mut self, mut sink: impl FnMut(SampleRecord), max_items: usize) -> usize {
        let mut count = 0;
        while count < max_items {
            // One slot per critical section
            let Some(record) = self.queue.with(|state| state.slots.pop_front()) else {
                break;
            };
            sink(record);
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.queue.with(|state| state.slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens or closes the queue to new pushes.
    pub fn set_accepting(&mut self, accepting: bool) {
        self.queue.with(|state| state.accepting = accepting);
    }

    pub fn is_accepting(&self) -> bool {
        self.queue.with(|state| state.accepting)
    }

    /// Discards everything queued and returns how many records were lost.
    pub fn clear(&mut self) -> usize {
        self.queue.with(|state| {
            let lost = state.slots.len();
            state.slots.clear();
            lost
        })
    }

    pub fn stats(&self) -> CaptureStats {
        self.queue.with(|state| state.stats)
    }

    /// Returns the longest drop streak seen since the previous call.
    ///
    /// A streak still in progress carries over into the next window.
    pub fn take_longest_streak(&mut self) -> u32 {
        self.queue.with(|state| {
            let stats = &mut state.stats;
            core::mem::replace(&mut stats.longest_streak, stats.current_streak)
        })
    }

    pub fn reset_stats(&mut self) {
        self.queue.with(|state| state.stats = CaptureStats::default());
    }
}
