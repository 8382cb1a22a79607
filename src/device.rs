use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::driver::{DeviceDriver, DeviceInfo};
use crate::health::{Alive, HealthTracker};
use crate::sync::lock;

/// Seconds over which the rolling hashrate forgets old samples.
const ROLLING_WINDOW_SECS: f64 = 5.0;

/// One compute backend instance with one or more scanning threads.
///
/// Counters are atomics written by the device's own workers and the
/// submission thread; health and rolling rates sit behind small locks shared
/// with the controller's watchdog.
pub struct Device {
    id: usize,
    name: String,
    driver: Arc<dyn DeviceDriver>,
    threads: usize,
    enabled: AtomicBool,
    restart_gen: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    hw_errors: AtomicU64,
    hashes: AtomicU64,
    started: Instant,
    last_progress: Mutex<Instant>,
    health: Mutex<HealthTracker>,
    thread_rates: Mutex<Vec<f64>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("driver", &self.driver.name())
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub id: usize,
    pub name: String,
    pub driver: String,
    pub enabled: bool,
    pub alive: Alive,
    pub threads: usize,
    pub mhs_av: f64,
    pub mhs_rolling: f64,
    pub accepted: u64,
    pub rejected: u64,
    pub hw_errors: u64,
    pub total_hashes: u64,
    /// Accepted shares per minute.
    pub utility: f64,
    pub last_progress_secs: u64,
}

impl Device {
    pub fn new(id: usize, info: DeviceInfo, driver: Arc<dyn DeviceDriver>, sick_after: u32, dead_after: u32) -> Self {
        let threads = info.threads.max(1);
        Self {
            id,
            name: info.name,
            driver,
            threads,
            enabled: AtomicBool::new(true),
            restart_gen: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            hw_errors: AtomicU64::new(0),
            hashes: AtomicU64::new(0),
            started: Instant::now(),
            last_progress: Mutex::new(Instant::now()),
            health: Mutex::new(HealthTracker::new(Alive::NoStart, sick_after, dead_after)),
            thread_rates: Mutex::new(vec![0.0; threads]),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn alive(&self) -> Alive {
        lock(&self.health).state()
    }

    /// Enabled and not dead: the controller should keep its queue filled.
    pub fn wants_work(&self) -> bool {
        self.is_enabled() && self.alive() != Alive::Dead
    }

    /// Asks every worker of this device to reinitialise its thread. Workers
    /// compare the generation against the one they last saw.
    pub fn request_restart(&self) {
        self.restart_gen.fetch_add(1, Ordering::SeqCst);
    }

    pub fn restart_generation(&self) -> u64 {
        self.restart_gen.load(Ordering::SeqCst)
    }

    pub fn record_success(&self) -> Option<Alive> {
        self.touch();
        let prev = lock(&self.health).record_success();
        if let Some(prev) = prev {
            tracing::info!(device = self.id, from = %prev, "device is well");
        }
        prev
    }

    pub fn record_failure(&self) -> Option<Alive> {
        let next = lock(&self.health).record_failure();
        if let Some(next) = next {
            tracing::warn!(device = self.id, state = %next, "device health degraded");
        }
        next
    }

    /// A scan error or a false-positive candidate.
    pub fn record_hw_error(&self) -> Option<Alive> {
        self.hw_errors.fetch_add(1, Ordering::Relaxed);
        self.record_failure()
    }

    /// Counts a watchdog timeout if no progress was made for `timeout`.
    pub fn check_timeout(&self, timeout: Duration) -> Option<Alive> {
        let stalled = {
            let mut last = lock(&self.last_progress);
            if last.elapsed() < timeout {
                return None;
            }
            *last = Instant::now();
            true
        };
        if stalled && self.alive() != Alive::NoStart {
            tracing::warn!(device = self.id, ?timeout, "device made no progress");
            return self.record_failure();
        }
        None
    }

    /// Marks the device as responsive without any hashing, e.g. while it
    /// waits for work.
    pub(crate) fn touch(&self) {
        *lock(&self.last_progress) = Instant::now();
    }

    /// Adds `hashes` scanned by thread `thr` over `elapsed` to the totals and
    /// that thread's rolling rate.
    pub fn record_hashes(&self, thr: usize, hashes: u64, elapsed: Duration) {
        self.hashes.fetch_add(hashes, Ordering::Relaxed);
        self.touch();
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let sample = hashes as f64 / secs / 1e6;
        let alpha = (secs / ROLLING_WINDOW_SECS).min(1.0);
        let mut rates = lock(&self.thread_rates);
        if let Some(rate) = rates.get_mut(thr) {
            *rate = *rate * (1.0 - alpha) + sample * alpha;
        }
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn hw_errors(&self) -> u64 {
        self.hw_errors.load(Ordering::Relaxed)
    }

    pub fn total_hashes(&self) -> u64 {
        self.hashes.load(Ordering::Relaxed)
    }

    pub fn mhs_rolling(&self) -> f64 {
        lock(&self.thread_rates).iter().sum()
    }

    pub fn status(&self) -> DeviceStatus {
        let elapsed = self.started.elapsed().as_secs_f64();
        let accepted = self.accepted();
        let (mhs_av, utility) = if elapsed > 0.0 {
            (
                self.total_hashes() as f64 / elapsed / 1e6,
                accepted as f64 * 60.0 / elapsed,
            )
        } else {
            (0.0, 0.0)
        };
        DeviceStatus {
            id: self.id,
            name: self.name.clone(),
            driver: self.driver.name().to_string(),
            enabled: self.is_enabled(),
            alive: self.alive(),
            threads: self.threads,
            mhs_av,
            mhs_rolling: self.mhs_rolling(),
            accepted,
            rejected: self.rejected(),
            hw_errors: self.hw_errors(),
            total_hashes: self.total_hashes(),
            utility,
            last_progress_secs: lock(&self.last_progress).elapsed().as_secs(),
        }
    }
}
