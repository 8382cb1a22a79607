//! Per-thread scanning loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::device::Device;
use crate::driver::{DeviceError, DeviceThread};
use crate::epoch::RestartEpoch;
use crate::health::Alive;
use crate::metrics::MinerStats;
use crate::queue::WorkQueue;
use crate::retry::RetryConfig;
use crate::submit::{SubmitMsg, Submission};
use crate::work::{Candidate, WorkUnit};

/// How a unit left the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UnitEnd {
    Exhausted,
    /// Epoch moved on; dropped without submitting.
    Stale,
    /// Older than the scan time.
    Expired,
    /// Device disabled, restarting or shutting down.
    Interrupted,
    Error(DeviceError),
}

/// What a scan needs besides the device thread and the unit.
pub(crate) struct ScanContext<'a> {
    pub epoch: &'a RestartEpoch,
    pub stats: &'a MinerStats,
    pub device: &'a Device,
    pub stopping: &'a AtomicBool,
    /// Index of the scanning thread within its device.
    pub local_thr: usize,
    pub slice: u32,
    pub max_age: Duration,
    pub restart_gen: u64,
}

impl ScanContext<'_> {
    fn interrupted(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            || !self.device.is_enabled()
            || self.device.restart_generation() != self.restart_gen
    }
}

/// Scans `unit` in slices until it is used up or must be abandoned. The
/// epoch is checked before every slice and again before a hit is passed to
/// `found`.
pub(crate) fn scan_unit(
    ctx: &ScanContext<'_>,
    thread: &mut dyn DeviceThread,
    unit: &mut WorkUnit,
    mut found: impl FnMut(Candidate),
) -> UnitEnd {
    loop {
        if ctx.epoch.is_stale(unit.epoch()) {
            discard_stale(ctx, unit);
            return UnitEnd::Stale;
        }
        if unit.is_exhausted() {
            return UnitEnd::Exhausted;
        }
        if unit.template().age() >= ctx.max_age {
            tracing::debug!(unit = unit.id(), "work expired");
            return UnitEnd::Expired;
        }
        if ctx.interrupted() {
            return UnitEnd::Interrupted;
        }

        let start = unit.cursor();
        let limit = ctx.slice.min(thread.can_limit_work()).max(1) as u64;
        let max_nonce = (start + limit - 1).min(unit.nonce_end() as u64) as u32;

        let t0 = Instant::now();
        match thread.scanhash(unit, max_nonce) {
            Ok(res) => {
                let scanned = (res.last_nonce as u64 + 1).saturating_sub(start);
                ctx.device.record_hashes(ctx.local_thr, scanned, t0.elapsed());
                ctx.device.record_success();
                unit.advance(res.last_nonce);
                if let Some(nonce) = res.found {
                    if ctx.epoch.is_stale(unit.epoch()) {
                        discard_stale(ctx, unit);
                        return UnitEnd::Stale;
                    }
                    found(unit.candidate(nonce, ctx.device.id()));
                }
            }
            Err(err) => {
                ctx.device.record_hw_error();
                ctx.stats.record_hw_error();
                tracing::warn!(device = ctx.device.id(), error = %err, "scan failed");
                return UnitEnd::Error(err);
            }
        }
    }
}

fn discard_stale(ctx: &ScanContext<'_>, unit: &WorkUnit) {
    ctx.stats.record_discarded(1);
    unit.pool().record_discarded(1);
    tracing::debug!(unit = unit.id(), epoch = unit.epoch(), "discarding stale work");
}

/// Runs the driver's per-unit preparation. A failure counts as a hardware
/// error; a success clears the device's failure streak.
pub(crate) fn prepare_unit(device: &Device, stats: &MinerStats, thread: &mut dyn DeviceThread, unit: &mut WorkUnit) -> bool {
    match thread.prepare_work(unit) {
        Ok(()) => {
            device.record_success();
            true
        }
        Err(err) => {
            device.record_hw_error();
            stats.record_hw_error();
            tracing::warn!(device = device.id(), error = %err, "prepare work failed");
            false
        }
    }
}

/// One scanning thread of one device.
pub(crate) struct Worker {
    pub device: Arc<Device>,
    pub queue: Arc<WorkQueue>,
    pub epoch: Arc<RestartEpoch>,
    pub stats: Arc<MinerStats>,
    pub stopping: Arc<AtomicBool>,
    pub submit: Sender<SubmitMsg>,
    /// Miner-wide thread id.
    pub thr_id: usize,
    pub local_thr: usize,
    pub slice: u32,
    pub max_age: Duration,
    pub pop_timeout: Duration,
    pub retry: RetryConfig,
}

impl Worker {
    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Prepares and initialises the device thread, retrying with backoff.
    /// `None` only when shutting down.
    fn start_thread(&self) -> Option<Box<dyn DeviceThread>> {
        let mut backoff = self.retry.backoff();
        while !self.stopping() {
            let attempt = self
                .device
                .driver()
                .thread_prepare(&self.device, self.local_thr)
                .and_then(|mut t| t.thread_init().map(|()| t));
            match attempt {
                Ok(thread) => {
                    self.device.record_success();
                    tracing::debug!(device = self.device.id(), thr = self.thr_id, "thread initialised");
                    return Some(thread);
                }
                Err(err) => {
                    self.device.record_hw_error();
                    self.stats.record_hw_error();
                    let delay = backoff.next_delay();
                    tracing::warn!(device = self.device.id(), thr = self.thr_id, error = %err, ?delay, "thread init failed");
                    self.sleep(delay);
                }
            }
        }
        None
    }

    /// Sleeps in short steps so shutdown is noticed.
    fn sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }

    fn reinit(&self, thread: &mut Box<dyn DeviceThread>) -> Option<()> {
        thread.thread_shutdown();
        if let Err(err) = self.device.driver().reinit_device(&self.device) {
            tracing::warn!(device = self.device.id(), error = %err, "device reinit failed");
            self.device.record_failure();
        }
        *thread = self.start_thread()?;
        Some(())
    }

    pub(crate) fn run(self) {
        let Some(mut thread) = self.start_thread() else {
            return;
        };
        let mut restart_gen = self.device.restart_generation();

        while !self.stopping() {
            let latest = self.device.restart_generation();
            if latest != restart_gen {
                restart_gen = latest;
                tracing::info!(device = self.device.id(), thr = self.thr_id, "restarting thread");
                if self.reinit(&mut thread).is_none() {
                    return;
                }
                continue;
            }

            if self.device.alive() == Alive::Dead {
                self.sleep(self.retry.retry_delay);
                if self.reinit(&mut thread).is_none() {
                    return;
                }
                continue;
            }

            if !self.device.is_enabled() {
                self.device.touch();
                self.sleep(self.pop_timeout);
                continue;
            }

            let Some(mut unit) = self.queue.pop(self.pop_timeout) else {
                self.device.touch();
                if self.queue.is_frozen() {
                    self.sleep(Duration::from_millis(10));
                }
                continue;
            };
            unit.assign(self.thr_id);

            if !prepare_unit(&self.device, &self.stats, thread.as_mut(), &mut unit) {
                continue;
            }

            let ctx = ScanContext {
                epoch: &self.epoch,
                stats: &self.stats,
                device: &self.device,
                stopping: &self.stopping,
                local_thr: self.local_thr,
                slice: self.slice,
                max_age: self.max_age,
                restart_gen,
            };
            let end = scan_unit(&ctx, thread.as_mut(), &mut unit, |candidate| {
                let sub = Submission {
                    device: Arc::clone(&self.device),
                    candidate,
                };
                if self.submit.send(SubmitMsg::Share(sub)).is_err() {
                    tracing::debug!("submission channel closed, dropping candidate");
                }
            });
            if end == UnitEnd::Interrupted {
                self.stats.record_discarded(1);
                unit.pool().record_discarded(1);
            }
            thread.free_work(&unit);
            let _ = self.submit.send(SubmitMsg::Retired(unit.id()));
        }
        thread.thread_shutdown();
    }
}
