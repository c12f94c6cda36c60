use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use super::CaptureProducer;
use crate::storage::SampleRecord;

/// Interrupt-safe home for the producer half of a static queue.
///
/// Startup code installs the producer once; the timer interrupt then pushes
/// through a shared reference without owning anything.
pub struct SharedProducer<const N: usize> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Option<CaptureProducer<'static, N>>>>,
}

impl<const N: usize> SharedProducer<N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(None)),
        }
    }

    /// Stores the producer, returning the previous one if any.
    pub fn install(&self, producer: CaptureProducer<'static, N>) -> Option<CaptureProducer<'static, N>> {
        self.inner.lock(|inner| inner.borrow_mut().replace(producer))
    }

    pub fn is_installed(&self) -> bool {
        self.inner.lock(|inner| inner.borrow().is_some())
    }

    /// Pushes through the installed producer. Returns `false` when nothing
    /// is installed yet or the queue refused the record.
    pub fn push(&self, record: SampleRecord) -> bool {
        self.inner.lock(|inner| {
            inner
                .borrow_mut()
                .as_mut()
                .is_some_and(|producer| producer.push(record))
        })
    }
}

impl<const N: usize> Default for SharedProducer<N> {
    fn default() -> Self {
        Self::new()
    }
}
