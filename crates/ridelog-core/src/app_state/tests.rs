//! Whole-device scenarios against the in-memory card.

use std::cell::Cell;
use std::rc::Rc;
use std::vec::Vec;

use super::*;
use crate::capture::{CaptureProducer, CaptureQueue};
use crate::config::LoggerConfig;
use crate::sensors::{BatteryMonitor, Clock};
use crate::storage::mock::MockVolume;
use crate::storage::{
    DirectoryError, FOOTER_LEN, HEADER_LEN, InertialSample, RECORD_SIZE, SAMPLES_FILE,
    SampleRecord, SessionDirectory, SessionStatus, StorageVolume, VolumeError,
};

const QUEUE: usize = 16;

#[derive(Clone)]
struct TestBattery(Rc<Cell<u8>>);

impl BatteryMonitor for TestBattery {
    fn state_of_charge(&mut self) -> u8 {
        self.0.get()
    }
}

#[derive(Clone, Default)]
struct TestClock(Rc<Cell<u32>>);

impl Clock for TestClock {
    fn now_ms(&self) -> u32 {
        self.0.get()
    }
}

#[derive(Default)]
struct Recorder {
    transitions: Vec<(DeviceMode, DeviceMode)>,
    prechecks: Vec<PreCheckFailure>,
    faults: Vec<FaultReason>,
}

impl Recorder {
    /// Modes entered, in order.
    fn path(&self) -> Vec<DeviceMode> {
        self.transitions.iter().map(|(_, to)| *to).collect()
    }
}

impl ModeObserver for Recorder {
    fn mode_changed(&mut self, from: DeviceMode, to: DeviceMode) {
        self.transitions.push((from, to));
    }

    fn precheck_failed(&mut self, reason: PreCheckFailure) {
        self.prechecks.push(reason);
    }

    fn fault_raised(&mut self, reason: FaultReason) {
        self.faults.push(reason);
    }
}

type Ctx<'q> = DeviceContext<'q, MockVolume, TestBattery, TestClock, Recorder, QUEUE>;

struct Bench {
    volume: MockVolume,
    battery: TestBattery,
    clock: TestClock,
}

impl Bench {
    fn new() -> Self {
        Self {
            volume: MockVolume::new(),
            battery: TestBattery(Rc::new(Cell::new(100))),
            clock: TestClock::default(),
        }
    }

    /// Same card after a power cycle.
    fn rebooted(&self) -> Self {
        Self {
            volume: self.volume.reboot(),
            battery: self.battery.clone(),
            clock: self.clock.clone(),
        }
    }

    fn context<'q>(&self, queue: &'q CaptureQueue<QUEUE>) -> (CaptureProducer<'q, QUEUE>, Ctx<'q>) {
        let (producer, consumer) = queue.split().unwrap();
        let ctx = DeviceContext::new(
            self.volume.clone(),
            self.battery.clone(),
            self.clock.clone(),
            Recorder::default(),
            consumer,
        );
        (producer, ctx)
    }

    fn set_battery(&self, level: u8) {
        self.battery.0.set(level);
    }
}

fn sample(timestamp_ms: u32) -> SampleRecord {
    SampleRecord::from(InertialSample {
        timestamp_ms,
        accel_mg: [0, 0, 1000],
        gyro_mdps: [timestamp_ms as i32, 0, 0],
    })
}

fn push_range(producer: &mut CaptureProducer<'_, QUEUE>, range: core::ops::Range<u32>) -> usize {
    range.filter(|t| producer.push(sample(*t))).count()
}

fn tick_until_settled(ctx: &mut Ctx<'_>) {
    for _ in 0..64 {
        if ctx.on_tick() != DeviceMode::Stopping {
            return;
        }
    }
    panic!("still stopping after 64 ticks");
}

/// Classification a fresh boot would see.
fn scan_fresh(volume: &MockVolume) -> Vec<(u32, SessionStatus)> {
    let mut volume = volume.reboot();
    volume.mount().unwrap();
    let mut directory = SessionDirectory::new(3);
    directory
        .scan_existing(&mut volume)
        .unwrap()
        .iter()
        .map(|s| (s.id, s.status))
        .collect()
}

fn transitions_since(ctx: &Ctx<'_>, start: usize) -> Vec<(DeviceMode, DeviceMode)> {
    ctx.observer().transitions[start..].to_vec()
}

#[test]
fn test_boot_on_empty_card() {
    let bench = Bench::new();
    let queue = CaptureQueue::new();
    let (_producer, mut ctx) = bench.context(&queue);

    assert_eq!(ctx.mode(), DeviceMode::Init);
    ctx.boot().unwrap();

    assert_eq!(ctx.mode(), DeviceMode::Idle);
    assert_eq!(ctx.observer().transitions, [(DeviceMode::Init, DeviceMode::Idle)]);
    assert!(ctx.sessions().is_empty());
    assert!(bench.volume.file_contents("RIDELOG.CFG").is_some());
    assert_eq!(
        ctx.boot(),
        Err(StateError::InvalidTransition {
            from: DeviceMode::Idle,
            request: Request::Boot
        })
    );
}

#[test]
fn test_boot_uses_stored_config() {
    let bench = Bench::new();
    let mut config = LoggerConfig::default();
    config.thresholds.min_logging_battery = 50;
    {
        let mut volume = bench.volume.clone();
        volume.mount().unwrap();
        config.store(&mut volume).unwrap();
    }

    let queue = CaptureQueue::new();
    let (_producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();
    assert_eq!(ctx.config(), &config);

    bench.set_battery(40);
    assert_eq!(
        ctx.request_start(),
        Err(StateError::PreCheckFailed(PreCheckFailure::LowBattery {
            level: 40,
            required: 50
        }))
    );
}

#[test]
fn test_mount_failure_faults_until_reset() {
    let bench = Bench::new();
    bench.volume.fail_mount(true);
    let queue = CaptureQueue::new();
    let (_producer, mut ctx) = bench.context(&queue);

    ctx.boot().unwrap();
    assert_eq!(ctx.mode(), DeviceMode::Fault);
    assert_eq!(ctx.fault_reason(), Some(FaultReason::Mount(VolumeError::Device)));
    assert_eq!(ctx.observer().faults.len(), 1);

    // No low-power transition out of Fault
    bench.set_battery(1);
    assert_eq!(ctx.on_tick(), DeviceMode::Fault);
    bench.set_battery(100);

    assert_eq!(
        ctx.request_start(),
        Err(StateError::InvalidTransition {
            from: DeviceMode::Fault,
            request: Request::Start
        })
    );

    bench.volume.fail_mount(false);
    ctx.reset_from_fault().unwrap();

    assert_eq!(ctx.mode(), DeviceMode::Idle);
    assert_eq!(ctx.fault_reason(), None);
    assert_eq!(
        ctx.observer().path(),
        [DeviceMode::Fault, DeviceMode::Init, DeviceMode::Idle]
    );
}

#[test]
fn test_duplicate_session_on_card_faults_boot() {
    let bench = Bench::new();
    bench.volume.put_dir("RIDELOG");
    bench.volume.put_dir("RIDELOG/0003");
    bench.volume.put_dir("RIDELOG/03");

    let queue = CaptureQueue::new();
    let (_producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();

    assert_eq!(
        ctx.fault_reason(),
        Some(FaultReason::Scan(DirectoryError::DuplicateSessionId(3)))
    );
}

#[test]
fn test_start_with_card_full_returns_to_idle() {
    let bench = Bench::new();
    let queue = CaptureQueue::new();
    let (_producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();

    let min = ctx.config().thresholds.min_free_bytes;
    bench.volume.set_free_space(min);
    let before = ctx.observer().transitions.len();

    assert_eq!(
        ctx.request_start(),
        Err(StateError::PreCheckFailed(PreCheckFailure::CardFull {
            free: min,
            required: min
        }))
    );
    assert_eq!(
        transitions_since(&ctx, before),
        [
            (DeviceMode::Idle, DeviceMode::PreCheck),
            (DeviceMode::PreCheck, DeviceMode::Idle)
        ]
    );
    assert!(!bench.volume.dir_exists("RIDELOG/0001"));
    assert_eq!(ctx.observer().prechecks.len(), 1);
    assert!(ctx.observer().faults.is_empty());
}

#[test]
fn test_start_with_low_battery_returns_to_idle() {
    let bench = Bench::new();
    let queue = CaptureQueue::new();
    let (_producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();

    bench.set_battery(15);
    assert_eq!(
        ctx.request_start(),
        Err(StateError::PreCheckFailed(PreCheckFailure::LowBattery {
            level: 15,
            required: 20
        }))
    );
    assert_eq!(ctx.mode(), DeviceMode::Idle);
    assert_eq!(ctx.active_session_id(), None);
}

#[test]
fn test_session_limit_returns_to_idle() {
    let bench = Bench::new();
    let mut config = LoggerConfig::default();
    config.max_session_id = 1;
    {
        let mut volume = bench.volume.clone();
        volume.mount().unwrap();
        config.store(&mut volume).unwrap();
    }

    let queue = CaptureQueue::new();
    let (_producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();
    ctx.request_start().unwrap();
    ctx.request_stop().unwrap();
    tick_until_settled(&mut ctx);

    assert_eq!(
        ctx.request_start(),
        Err(StateError::PreCheckFailed(PreCheckFailure::SessionLimit))
    );
    assert_eq!(ctx.mode(), DeviceMode::Idle);
}

#[test]
fn test_orderly_session_round_trip() {
    let bench = Bench::new();
    let queue = CaptureQueue::new();
    let (mut producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();

    // Closed while idle
    assert!(!producer.push(sample(0)));

    ctx.request_start().unwrap();
    assert_eq!(ctx.mode(), DeviceMode::Logging);
    assert_eq!(ctx.active_session_id(), Some(1));

    let mut pushed = push_range(&mut producer, 0..12);
    ctx.on_tick();
    pushed += push_range(&mut producer, 12..20);
    assert_eq!(pushed, 20);

    ctx.request_stop().unwrap();
    assert_eq!(ctx.mode(), DeviceMode::Stopping);
    assert_eq!(push_range(&mut producer, 100..105), 0);

    tick_until_settled(&mut ctx);

    assert_eq!(ctx.mode(), DeviceMode::Idle);
    assert_eq!(ctx.last_stop_cause(), Some(StopCause::User));
    assert_eq!(ctx.counters().samples_written, 20);
    assert_eq!(ctx.counters().samples_dropped, 0);
    assert_eq!(ctx.active_session_id(), None);
    assert_eq!(ctx.finalized_sessions().count(), 1);
    assert_eq!(
        ctx.observer().path(),
        [
            DeviceMode::Idle,
            DeviceMode::PreCheck,
            DeviceMode::Logging,
            DeviceMode::Stopping,
            DeviceMode::Idle
        ]
    );

    let log = bench.volume.file_contents("RIDELOG/0001/SAMPLES.BIN").unwrap();
    assert_eq!(log.len(), 20 * RECORD_SIZE);
    let records: Vec<_> = log
        .chunks_exact(RECORD_SIZE)
        .map(|c| SampleRecord::from_bytes(c.try_into().unwrap()).unwrap())
        .collect();
    assert_eq!(records, (0..20).map(sample).collect::<Vec<_>>());

    let header = bench.volume.file_contents("RIDELOG/0001/HEADER.BIN").unwrap();
    assert_eq!(header.len(), HEADER_LEN + FOOTER_LEN);
    assert_eq!(bench.volume.open_handles(), 0);
    assert_eq!(scan_fresh(&bench.volume), [(1, SessionStatus::Finalized)]);
}

#[test]
fn test_card_fault_while_logging() {
    let bench = Bench::new();
    let queue = CaptureQueue::new();
    let (mut producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();
    ctx.request_start().unwrap();

    push_range(&mut producer, 0..4);
    assert_eq!(ctx.on_tick(), DeviceMode::Logging);

    bench.volume.fail_writes_after(0);
    push_range(&mut producer, 4..8);
    let before = ctx.observer().transitions.len();
    assert_eq!(ctx.on_tick(), DeviceMode::Fault);

    assert_eq!(
        transitions_since(&ctx, before),
        [
            (DeviceMode::Logging, DeviceMode::Stopping),
            (DeviceMode::Stopping, DeviceMode::Fault)
        ]
    );
    assert_eq!(
        ctx.fault_reason(),
        Some(FaultReason::CardWrite(VolumeError::Io))
    );
    assert_eq!(ctx.last_stop_cause(), Some(StopCause::CardFault));
    assert_eq!(ctx.counters().last_card_error, Some(VolumeError::Io));
    assert_eq!(bench.volume.open_handles(), 0);
    assert!(!producer.push(sample(9)));

    // Left open on the card, and still the newest session
    let header = bench.volume.file_contents("RIDELOG/0001/HEADER.BIN").unwrap();
    assert_eq!(header.len(), HEADER_LEN);
    assert_eq!(scan_fresh(&bench.volume), [(1, SessionStatus::Open)]);

    bench.volume.clear_write_failure();
    ctx.reset_from_fault().unwrap();
    assert_eq!(ctx.mode(), DeviceMode::Idle);
    ctx.request_start().unwrap();
    assert_eq!(ctx.active_session_id(), Some(2));

    assert_eq!(
        scan_fresh(&bench.volume),
        [(1, SessionStatus::Orphaned), (2, SessionStatus::Open)]
    );
}

#[test]
fn test_power_loss_orphans_session() {
    let bench = Bench::new();
    {
        let queue = CaptureQueue::new();
        let (mut producer, mut ctx) = bench.context(&queue);
        ctx.boot().unwrap();
        ctx.request_start().unwrap();
        push_range(&mut producer, 0..10);
        ctx.on_tick();
        // Power lost: nothing is closed
    }

    let bench = bench.rebooted();
    let queue = CaptureQueue::new();
    let (mut producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();

    assert_eq!(ctx.sessions()[0].status, SessionStatus::Open);
    assert_eq!(ctx.sessions()[0].record_count(), 10);

    ctx.request_start().unwrap();
    let id = ctx.active_session_id().unwrap();
    assert!(ctx.sessions().iter().all(|s| s.id <= id));
    assert_eq!(id, 2);

    push_range(&mut producer, 10..13);
    ctx.request_stop().unwrap();
    tick_until_settled(&mut ctx);

    assert_eq!(
        scan_fresh(&bench.volume),
        [(1, SessionStatus::Orphaned), (2, SessionStatus::Finalized)]
    );
}

#[test]
fn test_allocation_io_error_faults() {
    let bench = Bench::new();
    let queue = CaptureQueue::new();
    let (_producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();

    bench.volume.fail_create(SAMPLES_FILE);
    let reason = FaultReason::Allocate(DirectoryError::Io(VolumeError::Io));
    assert_eq!(ctx.request_start(), Err(StateError::Faulted(reason)));

    assert_eq!(ctx.mode(), DeviceMode::Fault);
    assert_eq!(ctx.observer().faults, [reason]);
    assert!(!bench.volume.dir_exists("RIDELOG/0001"));
}

#[test]
fn test_requests_rejected_by_mode() {
    let bench = Bench::new();
    let queue = CaptureQueue::new();
    let (mut producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();

    assert_eq!(
        ctx.request_stop(),
        Err(StateError::InvalidTransition {
            from: DeviceMode::Idle,
            request: Request::Stop
        })
    );
    assert_eq!(
        ctx.request_cancel_transfer(),
        Err(StateError::InvalidTransition {
            from: DeviceMode::Idle,
            request: Request::CancelTransfer
        })
    );
    assert_eq!(
        ctx.reset_from_fault(),
        Err(StateError::InvalidTransition {
            from: DeviceMode::Idle,
            request: Request::ResetFault
        })
    );

    ctx.request_start().unwrap();
    assert_eq!(
        ctx.request_start(),
        Err(StateError::InvalidTransition {
            from: DeviceMode::Logging,
            request: Request::Start
        })
    );
    assert_eq!(
        ctx.request_transfer(),
        Err(StateError::InvalidTransition {
            from: DeviceMode::Logging,
            request: Request::Transfer
        })
    );

    // Keep something queued so the stop takes more than one tick
    push_range(&mut producer, 0..16);
    ctx.request_stop().unwrap();
    assert_eq!(
        ctx.request_stop(),
        Err(StateError::Busy(DeviceMode::Stopping))
    );
    assert_eq!(
        ctx.request_start(),
        Err(StateError::Busy(DeviceMode::Stopping))
    );

    tick_until_settled(&mut ctx);
    assert_eq!(ctx.mode(), DeviceMode::Idle);
}

#[test]
fn test_transfer_cycle() {
    let bench = Bench::new();
    let queue = CaptureQueue::new();
    let (_producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();

    ctx.request_transfer().unwrap();
    assert_eq!(ctx.mode(), DeviceMode::Transfer);
    assert!(matches!(
        ctx.request_start(),
        Err(StateError::InvalidTransition { .. })
    ));
    ctx.complete_transfer().unwrap();
    assert_eq!(ctx.mode(), DeviceMode::Idle);

    ctx.request_transfer().unwrap();
    ctx.request_cancel_transfer().unwrap();
    assert_eq!(ctx.mode(), DeviceMode::Idle);
}

#[test]
fn test_critical_battery_stops_logging_first() {
    let bench = Bench::new();
    let queue = CaptureQueue::new();
    let (mut producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();
    ctx.request_start().unwrap();
    push_range(&mut producer, 0..5);

    bench.set_battery(5);
    let before = ctx.observer().transitions.len();
    assert_eq!(ctx.on_tick(), DeviceMode::LowPower);

    assert_eq!(
        transitions_since(&ctx, before),
        [
            (DeviceMode::Logging, DeviceMode::Stopping),
            (DeviceMode::Stopping, DeviceMode::Idle),
            (DeviceMode::Idle, DeviceMode::LowPower)
        ]
    );
    assert_eq!(ctx.last_stop_cause(), Some(StopCause::LowBattery));
    assert_eq!(scan_fresh(&bench.volume), [(1, SessionStatus::Finalized)]);
    let log = bench.volume.file_contents("RIDELOG/0001/SAMPLES.BIN").unwrap();
    assert_eq!(log.len(), 5 * RECORD_SIZE);

    // Between critical and recovery stays in low power
    bench.set_battery(20);
    assert_eq!(ctx.on_tick(), DeviceMode::LowPower);
    bench.set_battery(25);
    assert_eq!(ctx.on_tick(), DeviceMode::Idle);
}

#[test]
fn test_critical_battery_while_idle() {
    let bench = Bench::new();
    let queue = CaptureQueue::new();
    let (_producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();

    bench.set_battery(9);
    assert_eq!(ctx.on_tick(), DeviceMode::LowPower);
    assert_eq!(
        ctx.request_start(),
        Err(StateError::InvalidTransition {
            from: DeviceMode::LowPower,
            request: Request::Start
        })
    );

    bench.set_battery(10);
    ctx.request_transfer().unwrap_err();
    assert_eq!(ctx.on_tick(), DeviceMode::LowPower);
}

#[test]
fn test_overrun_stops_session() {
    let bench = Bench::new();
    let queue = CaptureQueue::new();
    let (mut producer, mut ctx) = bench.context(&queue);
    ctx.boot().unwrap();
    ctx.request_start().unwrap();

    let limit = ctx.config().engine.overrun_drop_limit;
    let accepted = push_range(&mut producer, 0..(QUEUE as u32 + limit));
    assert_eq!(accepted, QUEUE);

    assert_eq!(ctx.on_tick(), DeviceMode::Stopping);
    assert_eq!(ctx.last_stop_cause(), Some(StopCause::Overrun));
    tick_until_settled(&mut ctx);

    assert_eq!(ctx.mode(), DeviceMode::Idle);
    assert_eq!(ctx.counters().samples_written, QUEUE as u32);
    assert_eq!(ctx.counters().samples_dropped, limit);
    assert_eq!(scan_fresh(&bench.volume), [(1, SessionStatus::Finalized)]);
}

#[test]
fn test_observer_pair_sees_every_change() {
    let bench = Bench::new();
    let queue = CaptureQueue::<QUEUE>::new();
    let (_producer, consumer) = queue.split().unwrap();
    let mut ctx = DeviceContext::new(
        bench.volume.clone(),
        bench.battery.clone(),
        bench.clock.clone(),
        (Recorder::default(), Recorder::default()),
        consumer,
    );

    ctx.boot().unwrap();
    ctx.request_transfer().unwrap();

    let (first, second) = ctx.observer();
    assert_eq!(first.path(), [DeviceMode::Idle, DeviceMode::Transfer]);
    assert_eq!(first.transitions, second.transitions);
}
