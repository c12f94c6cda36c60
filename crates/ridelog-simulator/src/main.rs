//! Host simulator for the ridelog telemetry logger.
//!
//! Runs the real core against a host directory standing in for the SD card.
//! A background thread plays the capture timer interrupt with synthetic
//! inertial and position sources; the main thread plays the main loop and
//! walks through a scripted ride:
//!
//! 1. boot, log a session with a trail marker, stop cleanly
//! 2. start another session and lose power mid-ride
//! 3. boot again, find the interrupted session, log a third one so the
//!    interrupted one becomes orphaned
//! 4. enter transfer mode and list what can be offloaded
//! 5. drain the battery into low power and recover
//!
//! The card directory defaults to `ridelog-card` under the system temp
//! directory and can be set with `RIDELOG_SIM_DIR`. Pass `--fresh` to wipe
//! it first. Log level comes from `RUST_LOG` (default `info`).

mod fs_volume;

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use static_cell::StaticCell;

use ridelog_core::app_state::{DeviceContext, DeviceMode, FaultReason, ModeObserver, PreCheckFailure};
use ridelog_core::capture::{
    CAPTURE_QUEUE_LEN, CaptureQueue, MarkerLatch, Sampler, SamplerSchedule, SharedProducer,
};
use ridelog_core::config::SensorSettings;
use ridelog_core::sensors::{BatteryMonitor, Clock, InertialSource, PositionSource};
use ridelog_core::storage::{FixQuality, InertialSample, PositionFix};

use fs_volume::HostVolume;

// ---------------------------------------------------------------------------
// Timing and card constants
// ---------------------------------------------------------------------------

/// Capture timer rate. Inertial runs every other tick at the default 100 Hz.
const TIMER_HZ: u32 = 200;

/// Main loop period.
const MAIN_LOOP_PERIOD: Duration = Duration::from_millis(20);

/// Size of the simulated card.
const CARD_BYTES: u64 = 64 * 1024 * 1024;

/// Number of power cycles in the script. Each boot gets a fresh queue, as
/// RAM does not survive a power loss.
const BOOTS: usize = 2;

static QUEUES: [StaticCell<CaptureQueue<CAPTURE_QUEUE_LEN>>; BOOTS] =
    [StaticCell::new(), StaticCell::new()];
static PRODUCER: SharedProducer<CAPTURE_QUEUE_LEN> = SharedProducer::new();
static MARKERS: MarkerLatch = MarkerLatch::new();
static TIMER_RUNNING: AtomicBool = AtomicBool::new(true);

// ---------------------------------------------------------------------------
// Simulated peripherals
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct HostClock {
    start: Instant,
}

impl Clock for HostClock {
    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

/// Battery whose level the script sets directly.
#[derive(Clone)]
struct SimBattery(Rc<Cell<u8>>);

impl BatteryMonitor for SimBattery {
    fn state_of_charge(&mut self) -> u8 {
        self.0.get()
    }
}

/// Rider on a bumpy trail: gravity on z plus a few superimposed vibrations.
struct SyntheticImu;

impl InertialSource for SyntheticImu {
    fn read_inertial(&mut self, now_ms: u32) -> Option<InertialSample> {
        let t = now_ms as f32 / 1000.0;
        Some(InertialSample {
            timestamp_ms: now_ms,
            accel_mg: [
                (180.0 * (t * 2.3).sin()) as i32,
                (90.0 * (t * 1.1).cos()) as i32,
                1000 + (250.0 * (t * 17.0).sin()) as i32,
            ],
            gyro_mdps: [
                (4_000.0 * (t * 0.7).sin()) as i32,
                (2_500.0 * (t * 1.9).cos()) as i32,
                (12_000.0 * (t * 0.3).sin()) as i32,
            ],
        })
    }
}

/// Receiver that needs a couple of fixes to lock, then heads north-east.
struct SyntheticGps {
    fixes: u32,
}

impl PositionSource for SyntheticGps {
    fn read_position(&mut self, now_ms: u32) -> Option<PositionFix> {
        self.fixes += 1;
        let locked = self.fixes > 2;
        let step = self.fixes as i32 * 35;
        Some(PositionFix {
            timestamp_ms: now_ms,
            latitude_e7: 491_234_567 + step,
            longitude_e7: -1_231_234_567 + step,
            altitude_mm: 652_000,
            ground_speed_mm_s: if locked { 4_800 } else { 0 },
            satellites: if locked { 9 } else { 2 },
            fix: if locked {
                FixQuality::Fix3d
            } else {
                FixQuality::NoFix
            },
        })
    }
}

/// Stands in for the status LED and display.
struct ConsoleIndicator;

impl ModeObserver for ConsoleIndicator {
    fn mode_changed(&mut self, from: DeviceMode, to: DeviceMode) {
        info!("[indicator] {:?} -> {:?}", from, to);
    }

    fn precheck_failed(&mut self, reason: PreCheckFailure) {
        warn!("[indicator] cannot start: {}", reason);
    }

    fn fault_raised(&mut self, reason: FaultReason) {
        error!("[indicator] FAULT: {}", reason);
    }
}

type Device = DeviceContext<'static, HostVolume, SimBattery, HostClock, ConsoleIndicator, CAPTURE_QUEUE_LEN>;

// ---------------------------------------------------------------------------
// Capture timer
// ---------------------------------------------------------------------------

fn spawn_capture_timer(clock: HostClock) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let schedule = SamplerSchedule::for_settings(TIMER_HZ, &SensorSettings::default());
        let mut sampler = Sampler::new(SyntheticImu, SyntheticGps { fixes: 0 }, schedule);
        let period = Duration::from_micros(1_000_000 / u64::from(TIMER_HZ));

        while TIMER_RUNNING.load(Ordering::Relaxed) {
            sampler.on_timer(clock.now_ms(), &MARKERS, |record| PRODUCER.push(record));
            thread::sleep(period);
        }
    })
}

// ---------------------------------------------------------------------------
// Script helpers
// ---------------------------------------------------------------------------

fn power_on(boot: usize, card: &Path, battery: &SimBattery, clock: HostClock) -> Option<Device> {
    let queue: &'static CaptureQueue<CAPTURE_QUEUE_LEN> = QUEUES.get(boot)?.init(CaptureQueue::new());
    let (producer, consumer) = queue.split()?;
    PRODUCER.install(producer);

    info!("=== Power on #{} ===", boot + 1);
    let mut device = DeviceContext::new(
        HostVolume::new(card, CARD_BYTES),
        battery.clone(),
        clock,
        ConsoleIndicator,
        consumer,
    );
    if let Err(e) = device.boot() {
        error!("Boot rejected: {}", e);
    }
    Some(device)
}

fn run_for(device: &mut Device, duration: Duration) {
    let until = Instant::now() + duration;
    while Instant::now() < until {
        device.on_tick();
        thread::sleep(MAIN_LOOP_PERIOD);
    }
}

fn stop_and_drain(device: &mut Device) {
    if let Err(e) = device.request_stop() {
        warn!("Stop rejected: {}", e);
        return;
    }
    while device.on_tick() == DeviceMode::Stopping {
        thread::sleep(MAIN_LOOP_PERIOD);
    }
}

fn start_session(device: &mut Device) -> bool {
    MARKERS.reset();
    match device.request_start() {
        Ok(()) => true,
        Err(e) => {
            warn!("Start rejected: {}", e);
            false
        }
    }
}

fn report(device: &Device) {
    let counters = device.counters();
    info!(
        "Counters: {} written, {} dropped, {} flushes",
        counters.samples_written, counters.samples_dropped, counters.flush_count
    );
    for session in device.sessions() {
        info!(
            "  session {:04}: {:?}, {} records",
            session.id,
            session.status,
            session.record_count()
        );
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let card: PathBuf = std::env::var_os("RIDELOG_SIM_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("ridelog-card"));
    if std::env::args().any(|a| a == "--fresh") {
        match std::fs::remove_dir_all(&card) {
            Ok(()) => info!("Wiped {}", card.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not wipe {}: {}", card.display(), e),
        }
    }
    info!("Starting ridelog simulator, card at {}", card.display());

    let clock = HostClock {
        start: Instant::now(),
    };
    let battery = SimBattery(Rc::new(Cell::new(90)));
    let timer = spawn_capture_timer(clock);

    // --- Ride 1: clean session ----------------------------------------------
    let Some(mut device) = power_on(0, &card, &battery, clock) else {
        error!("Could not set up capture queue");
        return;
    };
    report(&device);

    if start_session(&mut device) {
        run_for(&mut device, Duration::from_millis(1_000));
        MARKERS.latch();
        run_for(&mut device, Duration::from_millis(1_000));
        stop_and_drain(&mut device);
        report(&device);
    }

    // --- Ride 2: power lost mid-session -------------------------------------
    if start_session(&mut device) {
        run_for(&mut device, Duration::from_millis(800));
        warn!("Simulating power loss in {:?}", device.mode());
    }
    drop(device);

    // --- Ride 3: reboot, interrupted session becomes orphaned ---------------
    let Some(mut device) = power_on(1, &card, &battery, clock) else {
        error!("Could not set up capture queue");
        return;
    };
    report(&device);

    if start_session(&mut device) {
        run_for(&mut device, Duration::from_millis(1_000));
        stop_and_drain(&mut device);
        report(&device);
    }

    // --- Offload ------------------------------------------------------------
    if device.request_transfer().is_ok() {
        for session in device.finalized_sessions() {
            info!(
                "Ready for offload: session {:04} ({} records)",
                session.id,
                session.record_count()
            );
        }
        let _ = device.complete_transfer();
    }

    // --- Battery --------------------------------------------------------------
    battery.0.set(8);
    info!("Battery at 8%, mode now {:?}", device.on_tick());
    battery.0.set(30);
    info!("Battery at 30%, mode now {:?}", device.on_tick());

    TIMER_RUNNING.store(false, Ordering::Relaxed);
    if timer.join().is_err() {
        error!("Capture timer thread panicked");
    }
    info!("Simulation finished in {:?}", device.mode());
}
