//! The miner: owns every piece of shared state and the threads working on it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::controller::{Controller, Notifier, UpstreamEvent};
use crate::device::{Device, DeviceStatus};
use crate::driver::DeviceDriver;
use crate::epoch::RestartEpoch;
use crate::health::Alive;
use crate::job_source::JobSource;
use crate::metrics::{HealthStatus, MinerStats, Summary};
use crate::pool::PoolStatus;
use crate::pool_manager::{PoolControlError, PoolManager};
use crate::prometheus_metrics::PrometheusMetrics;
use crate::queue::WorkQueue;
use crate::submit::{SubmitMsg, Submitter};
use crate::sync::lock;
use crate::work::WorkFactory;
use crate::worker::Worker;

const SUBMIT_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum MinerError {
    #[error("no devices detected")]
    NoDevices,
    #[error("no pools configured")]
    NoPools,
    #[error("no device with id {0}")]
    UnknownDevice(usize),
    #[error("miner already started")]
    AlreadyStarted,
    #[error("failed to spawn thread {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error(transparent)]
    Pool(#[from] PoolControlError),
}

/// JSON body of the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub hw_errors: u64,
    pub devices: Vec<Alive>,
    pub pools: Vec<Alive>,
}

/// State shared by the controller, the workers and the submission thread.
pub(crate) struct Shared {
    pub config: Config,
    pub epoch: Arc<RestartEpoch>,
    pub stats: Arc<MinerStats>,
    pub prometheus: PrometheusMetrics,
    pub pools: PoolManager,
    pub devices: Vec<Arc<Device>>,
    /// One per device, same index.
    pub queues: Vec<Arc<WorkQueue>>,
    pub factory: WorkFactory,
    pub source: Arc<dyn JobSource>,
    pub submitter: Submitter,
    pub stopping: Arc<AtomicBool>,
}

/// Sends the thread's name when dropped, even on panic.
struct ExitNotice {
    name: String,
    tx: Sender<String>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(std::mem::take(&mut self.name));
    }
}

pub struct Miner {
    shared: Arc<Shared>,
    notifier: Notifier,
    events: Mutex<Option<Receiver<UpstreamEvent>>>,
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
    exits: Mutex<Option<(Sender<String>, Receiver<String>)>>,
    quit: tokio::sync::Notify,
    quit_flag: AtomicBool,
}

impl Miner {
    /// Detects devices on every driver and sets up pools and queues. Nothing
    /// runs until [`start`](Self::start).
    pub fn new(
        config: Config,
        source: Arc<dyn JobSource>,
        drivers: Vec<Arc<dyn DeviceDriver>>,
    ) -> Result<Self, MinerError> {
        if config.pools.is_empty() {
            return Err(MinerError::NoPools);
        }

        let mut devices = Vec::new();
        for driver in &drivers {
            for info in driver.detect(&config) {
                tracing::info!(device = devices.len(), driver = driver.name(), name = %info.name, threads = info.threads, "detected device");
                devices.push(Arc::new(Device::new(
                    devices.len(),
                    info,
                    Arc::clone(driver),
                    config.device_sick_after,
                    config.device_dead_after,
                )));
            }
        }
        if devices.is_empty() {
            return Err(MinerError::NoDevices);
        }

        let epoch = Arc::new(RestartEpoch::new());
        let stats = Arc::new(MinerStats::new());
        let stopping = Arc::new(AtomicBool::new(false));
        let submitter = Submitter::new(
            Arc::clone(&source),
            Arc::clone(&epoch),
            Arc::clone(&stats),
            config.retry_config(),
            Arc::clone(&stopping),
        );
        let pools = PoolManager::new(
            config.pools.clone(),
            config.pool_strategy,
            config.rotate_period,
            config.pool_sick_after,
            config.pool_dead_after,
        );
        let queues = devices.iter().map(|_| Arc::new(WorkQueue::new())).collect();
        let factory = WorkFactory::new(config.max_rolls, config.scan_time());

        let shared = Arc::new(Shared {
            config,
            epoch,
            stats,
            prometheus: PrometheusMetrics::new(),
            pools,
            devices,
            queues,
            factory,
            source,
            submitter,
            stopping,
        });

        let (tx, rx) = mpsc::channel();
        Ok(Self {
            shared,
            notifier: Notifier::new(tx),
            events: Mutex::new(Some(rx)),
            threads: Mutex::new(Vec::new()),
            exits: Mutex::new(Some(mpsc::channel())),
            quit: tokio::sync::Notify::new(),
            quit_flag: AtomicBool::new(false),
        })
    }

    fn spawn(&self, name: String, exit_tx: &Sender<String>, body: impl FnOnce() + Send + 'static) -> Result<(), MinerError> {
        let notice = ExitNotice {
            name: name.clone(),
            tx: exit_tx.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _notice = notice;
                body();
            })
            .map_err(|e| MinerError::Spawn(name.clone(), e))?;
        lock(&self.threads).push((name, handle));
        Ok(())
    }

    /// Starts the submission thread, one worker per device thread and the
    /// controller.
    pub fn start(&self) -> Result<(), MinerError> {
        let events = lock(&self.events).take().ok_or(MinerError::AlreadyStarted)?;
        let exit_tx = match lock(&self.exits).as_ref() {
            Some((tx, _)) => tx.clone(),
            None => return Err(MinerError::AlreadyStarted),
        };
        let shared = &self.shared;
        let (submit_tx, submit_rx) = mpsc::channel::<SubmitMsg>();

        let sub_shared = Arc::clone(shared);
        self.spawn("submitter".to_string(), &exit_tx, move || run_submitter(sub_shared, submit_rx))?;

        let mut thr_id = 0;
        for (dev, queue) in shared.devices.iter().zip(&shared.queues) {
            for local_thr in 0..dev.threads() {
                let worker = Worker {
                    device: Arc::clone(dev),
                    queue: Arc::clone(queue),
                    epoch: Arc::clone(&shared.epoch),
                    stats: Arc::clone(&shared.stats),
                    stopping: Arc::clone(&shared.stopping),
                    submit: submit_tx.clone(),
                    thr_id,
                    local_thr,
                    slice: shared.config.scan_slice,
                    max_age: shared.config.scan_time(),
                    pop_timeout: shared.config.pop_timeout(),
                    retry: shared.config.retry_config(),
                };
                self.spawn(format!("dev{}.thr{}", dev.id(), local_thr), &exit_tx, move || worker.run())?;
                thr_id += 1;
            }
        }

        let controller = Controller::new(Arc::clone(shared), events);
        self.spawn("controller".to_string(), &exit_tx, move || controller.run())?;

        tracing::info!(
            devices = shared.devices.len(),
            threads = thr_id,
            pools = shared.pools.pools().len(),
            strategy = %shared.pools.strategy(),
            "miner started"
        );
        Ok(())
    }

    /// Stops every thread, waiting at most the configured shutdown timeout.
    /// Threads that do not exit in time are left detached; queued work and
    /// unsubmitted candidates are dropped.
    pub fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down");
        for queue in &self.shared.queues {
            queue.freeze();
        }
        self.notifier.notify(UpstreamEvent::Shutdown);

        let handles = std::mem::take(&mut *lock(&self.threads));
        let exits = lock(&self.exits).take();
        let mut exited = HashSet::new();
        if let Some((tx, rx)) = exits {
            drop(tx);
            let deadline = Instant::now() + self.shared.config.shutdown_timeout();
            while exited.len() < handles.len() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match rx.recv_timeout(deadline - now) {
                    Ok(name) => {
                        exited.insert(name);
                    }
                    Err(_) => break,
                }
            }
        }

        for (name, handle) in handles {
            if exited.contains(&name) {
                if handle.join().is_err() {
                    tracing::warn!(thread = %name, "thread panicked");
                }
            } else {
                tracing::warn!(thread = %name, "thread did not stop in time, detaching");
            }
        }

        let dropped: usize = self.shared.queues.iter().map(|q| q.flush().len()).sum();
        tracing::info!(dropped, "miner stopped");
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Invalidates all outstanding work.
    pub fn restart_work(&self) {
        self.notifier.notify(UpstreamEvent::Restart);
    }

    pub fn request_quit(&self) {
        self.quit_flag.store(true, Ordering::SeqCst);
        self.quit.notify_one();
    }

    /// Resolves once someone called [`request_quit`](Self::request_quit).
    pub async fn quit_requested(&self) {
        if self.quit_flag.load(Ordering::SeqCst) {
            return;
        }
        self.quit.notified().await;
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn stats(&self) -> &MinerStats {
        &self.shared.stats
    }

    pub fn epoch(&self) -> u64 {
        self.shared.epoch.current()
    }

    pub fn summary(&self) -> Summary {
        let hashes = self.shared.devices.iter().map(|d| d.total_hashes()).sum();
        self.shared.stats.snapshot(hashes)
    }

    pub fn devices(&self) -> Vec<DeviceStatus> {
        self.shared.devices.iter().map(|d| d.status()).collect()
    }

    pub fn device(&self, id: usize) -> Result<DeviceStatus, MinerError> {
        self.device_ref(id).map(|d| d.status())
    }

    pub fn device_count(&self) -> usize {
        self.shared.devices.len()
    }

    fn device_ref(&self, id: usize) -> Result<&Arc<Device>, MinerError> {
        self.shared.devices.get(id).ok_or(MinerError::UnknownDevice(id))
    }

    pub fn enable_device(&self, id: usize) -> Result<(), MinerError> {
        self.device_ref(id)?.set_enabled(true);
        tracing::info!(device = id, "device enabled");
        Ok(())
    }

    pub fn disable_device(&self, id: usize) -> Result<(), MinerError> {
        self.device_ref(id)?.set_enabled(false);
        tracing::info!(device = id, "device disabled");
        Ok(())
    }

    pub fn restart_device(&self, id: usize) -> Result<(), MinerError> {
        self.device_ref(id)?.request_restart();
        tracing::info!(device = id, "device restart requested");
        Ok(())
    }

    pub fn pools(&self) -> Vec<PoolStatus> {
        self.shared.pools.statuses()
    }

    pub fn pool_manager(&self) -> &PoolManager {
        &self.shared.pools
    }

    pub fn switch_pool(&self, id: usize) -> Result<(), MinerError> {
        Ok(self.shared.pools.switch_pool(id)?)
    }

    pub fn enable_pool(&self, id: usize) -> Result<(), MinerError> {
        Ok(self.shared.pools.enable_pool(id)?)
    }

    pub fn disable_pool(&self, id: usize) -> Result<(), MinerError> {
        Ok(self.shared.pools.disable_pool(id)?)
    }

    pub fn health(&self) -> HealthReport {
        let summary = self.summary();
        let devices: Vec<Alive> = self.shared.devices.iter().map(|d| d.alive()).collect();
        let pools: Vec<Alive> = self
            .shared
            .pools
            .pools()
            .iter()
            .filter(|p| p.is_enabled())
            .map(|p| p.alive())
            .collect();
        HealthReport {
            status: HealthStatus::assess(&devices, &pools),
            uptime_seconds: summary.elapsed_secs,
            accepted: summary.accepted,
            rejected: summary.rejected,
            hw_errors: summary.hw_errors,
            devices,
            pools,
        }
    }

    /// Prometheus text exposition of the current counters.
    pub fn export_metrics(&self) -> Result<String, std::fmt::Error> {
        self.shared.prometheus.update(&self.summary(), &self.devices(), &self.pools());
        self.shared.prometheus.export_metrics()
    }
}

impl Drop for Miner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_submitter(shared: Arc<Shared>, rx: Receiver<SubmitMsg>) {
    loop {
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }
        match rx.recv_timeout(SUBMIT_POLL) {
            Ok(msg) => shared.submitter.handle(msg),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    let dropped = rx.try_iter().filter(|msg| matches!(msg, SubmitMsg::Share(_))).count();
    if dropped > 0 {
        tracing::info!(dropped, "dropping unsubmitted candidates");
    }
}
