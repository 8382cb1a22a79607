//! The controller loop: keeps every device queue topped up, reacts to new
//! blocks, probes unhealthy pools and watches for stalled devices.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::miner::Shared;
use crate::retry::Backoff;
use crate::work::{RollSeed, WorkUnit};

/// Wait between checks when every queue is full.
const IDLE_WAIT: Duration = Duration::from_millis(100);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);
/// Previous-block hashes remembered for new-block detection.
const KNOWN_BLOCKS: usize = 32;

/// Something happened upstream that the controller must act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// A new block was seen elsewhere; outstanding work is worthless.
    NewBlock,
    /// Operator asked for fresh work.
    Restart,
    Shutdown,
}

/// Handle for feeding [`UpstreamEvent`]s to a running miner.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Sender<UpstreamEvent>,
}

impl Notifier {
    pub(crate) fn new(tx: Sender<UpstreamEvent>) -> Self {
        Self { tx }
    }

    /// False once the controller has exited.
    pub fn notify(&self, event: UpstreamEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn new_block(&self) -> bool {
        self.notify(UpstreamEvent::NewBlock)
    }
}

pub(crate) struct Controller {
    shared: Arc<Shared>,
    events: Receiver<UpstreamEvent>,
    backoff: Backoff,
    seed: Option<RollSeed>,
    known_blocks: VecDeque<[u8; 32]>,
    last_probe: Instant,
    last_watchdog: Instant,
}

impl Controller {
    pub(crate) fn new(shared: Arc<Shared>, events: Receiver<UpstreamEvent>) -> Self {
        let backoff = shared.config.retry_config().backoff();
        Self {
            shared,
            events,
            backoff,
            seed: None,
            known_blocks: VecDeque::with_capacity(KNOWN_BLOCKS),
            last_probe: Instant::now(),
            last_watchdog: Instant::now(),
        }
    }

    fn stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn run(mut self) {
        tracing::debug!("controller started");
        while !self.stopping() {
            while let Ok(event) = self.events.try_recv() {
                self.handle(event);
            }
            if self.stopping() {
                break;
            }
            self.housekeeping();

            let needy = self.needy_queues();
            if needy.is_empty() {
                self.wait(IDLE_WAIT);
                continue;
            }
            for idx in needy {
                match self.next_unit() {
                    Some(unit) => {
                        if let Err(unit) = self.shared.queues[idx].push(unit) {
                            tracing::debug!(device = idx, unit = unit.id(), "queue frozen, dropping unit");
                        }
                    }
                    None => {
                        let delay = self.backoff.next_delay();
                        tracing::debug!(?delay, "no work available, backing off");
                        self.wait(delay);
                        break;
                    }
                }
            }
        }
        tracing::debug!("controller stopped");
    }

    /// Blocks up to `timeout`, handling any event that arrives meanwhile.
    fn wait(&mut self, timeout: Duration) {
        match self.events.recv_timeout(timeout) {
            Ok(event) => self.handle(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
            }
        }
    }

    fn handle(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::NewBlock => {
                self.shared.stats.record_network_block();
                self.restart_work("new block");
            }
            UpstreamEvent::Restart => self.restart_work("restart requested"),
            UpstreamEvent::Shutdown => {}
        }
    }

    /// Invalidates all outstanding work: bumps the epoch and purges the
    /// queues. Units already being scanned notice the new epoch on their own.
    fn restart_work(&mut self, reason: &str) {
        let epoch = self.shared.epoch.bump();
        self.seed = None;
        let mut discarded = 0u64;
        for queue in &self.shared.queues {
            queue.freeze();
            let drained = queue.flush();
            queue.thaw();
            for unit in &drained {
                unit.pool().record_discarded(1);
            }
            discarded += drained.len() as u64;
        }
        self.shared.stats.record_discarded(discarded);
        tracing::info!(epoch, discarded, reason, "restarting work");
    }

    fn needy_queues(&self) -> Vec<usize> {
        let depth = self.shared.config.queue_depth;
        self.shared
            .devices
            .iter()
            .zip(&self.shared.queues)
            .enumerate()
            .filter(|(_, (dev, q))| dev.wants_work() && !q.is_frozen() && q.len() < depth)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn housekeeping(&mut self) {
        if self.last_watchdog.elapsed() >= WATCHDOG_INTERVAL {
            self.last_watchdog = Instant::now();
            let timeout = self.shared.config.device_timeout();
            for dev in self.shared.devices.iter().filter(|d| d.is_enabled()) {
                dev.check_timeout(timeout);
            }
        }
        if self.last_probe.elapsed() >= self.shared.config.get_health_check_interval() {
            self.last_probe = Instant::now();
            self.probe_pools();
        }
    }

    fn probe_pools(&self) {
        for pool in self.shared.pools.probe_candidates() {
            if self.stopping() {
                return;
            }
            let ok = self.shared.source.fetch(&pool.credentials()).is_ok();
            tracing::debug!(pool = pool.id(), ok, "probed pool");
            self.shared.pools.record_probe(pool.id(), ok);
        }
    }

    /// Clones the last rollable work if possible, otherwise fetches.
    fn next_unit(&mut self) -> Option<WorkUnit> {
        let epoch = self.shared.epoch.current();
        if let Some(seed) = self.seed.as_mut() {
            match self.shared.factory.clone_rolled(seed, epoch) {
                Some(unit) => {
                    self.shared.stats.record_local_work();
                    return Some(unit);
                }
                None => self.seed = None,
            }
        }
        self.fetch()
    }

    fn fetch(&mut self) -> Option<WorkUnit> {
        let Some(pool) = self.shared.pools.select() else {
            tracing::warn!("no pool is alive and enabled");
            return None;
        };
        let t0 = Instant::now();
        match self.shared.source.fetch(&pool.credentials()) {
            Ok(raw) => {
                let latency = t0.elapsed();
                self.shared.pools.record_fetch_success(pool.id(), latency);
                self.shared.stats.record_getwork();
                self.shared.prometheus.record_fetch_latency(latency.as_secs_f64() * 1000.0);
                self.backoff.reset();

                if self.is_new_block(raw.prev_hash()) {
                    self.shared.stats.record_network_block();
                    self.restart_work("new block from pool");
                }
                let unit = self.shared.factory.create(raw, pool, self.shared.epoch.current());
                if unit.rolltime() {
                    self.seed = Some(unit.roll_seed());
                }
                Some(unit)
            }
            Err(err) => {
                self.shared.pools.record_fetch_failure(pool.id());
                self.shared.stats.record_get_failure();
                tracing::warn!(pool = pool.id(), error = %err, "work fetch failed");
                None
            }
        }
    }

    /// Remembers `prev_hash`; true if it was unknown and some other block
    /// was known before it.
    fn is_new_block(&mut self, prev_hash: [u8; 32]) -> bool {
        if self.known_blocks.contains(&prev_hash) {
            return false;
        }
        let first = self.known_blocks.is_empty();
        if self.known_blocks.len() == KNOWN_BLOCKS {
            self.known_blocks.pop_front();
        }
        self.known_blocks.push_back(prev_hash);
        !first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use crate::config::Config;
    use crate::driver::DeviceDriver;
    use crate::health::Alive;
    use crate::job_source::JobSource;
    use crate::miner::Miner;
    use crate::test_utils::{easy_work, test_config, MockDriver, MockSource};

    fn rig(config: Config, source: &Arc<MockSource>) -> (Miner, Controller) {
        let driver: Arc<dyn DeviceDriver> = Arc::new(MockDriver::new(1));
        let miner = Miner::new(config, Arc::clone(source) as Arc<dyn JobSource>, vec![driver]).unwrap();
        let (_tx, rx) = mpsc::channel();
        let controller = Controller::new(Arc::clone(miner.shared()), rx);
        (miner, controller)
    }

    #[test]
    fn first_block_is_not_new_and_history_is_bounded() {
        let (_miner, mut c) = rig(test_config(1), &Arc::new(MockSource::default()));
        assert!(!c.is_new_block([1; 32]));
        assert!(!c.is_new_block([1; 32]));
        assert!(c.is_new_block([2; 32]));
        assert!(!c.is_new_block([1; 32]));

        for b in 3..(3 + KNOWN_BLOCKS as u8) {
            assert!(c.is_new_block([b; 32]));
        }
        assert_eq!(c.known_blocks.len(), KNOWN_BLOCKS);
        assert!(c.is_new_block([1; 32]));
    }

    #[test]
    fn changed_prev_hash_flushes_queued_work() {
        let source = Arc::new(MockSource::default());
        source.push_fetch(Ok(easy_work(1, false)));
        source.push_fetch(Ok(easy_work(1, false)));
        source.push_fetch(Ok(easy_work(2, false)));
        let (miner, mut c) = rig(test_config(1), &source);
        let queue = Arc::clone(&miner.shared().queues[0]);

        for _ in 0..2 {
            let unit = c.next_unit().unwrap();
            assert!(queue.push(unit).is_ok());
        }
        assert_eq!(miner.epoch(), 0);
        assert_eq!(queue.len(), 2);

        let unit = c.next_unit().unwrap();
        assert_eq!(miner.epoch(), 1);
        assert_eq!(unit.epoch(), 1);
        assert_eq!(queue.len(), 0);
        assert!(!queue.is_frozen());
        let summary = miner.summary();
        assert_eq!(summary.network_blocks, 1);
        assert_eq!(summary.discarded, 2);
        assert_eq!(summary.getworks, 3);
        assert_eq!(miner.pools()[0].discarded, 2);
    }

    #[test]
    fn rollable_work_is_cloned_until_the_budget_runs_out() {
        let source = Arc::new(MockSource::default());
        source.push_fetch(Ok(easy_work(3, true)));
        let config = Config {
            max_rolls: 2,
            ..test_config(1)
        };
        let (miner, mut c) = rig(config, &source);

        let first = c.next_unit().unwrap();
        assert!(!first.is_clone());
        let rolled: Vec<WorkUnit> = (0..2).map(|_| c.next_unit().unwrap()).collect();
        assert!(rolled.iter().all(|u| u.is_clone()));
        assert_eq!(rolled[1].ntime_roll(), 2);
        assert!(first.is_cloned());
        assert_eq!(source.fetches(), 1);
        assert_eq!(miner.summary().local_work, 2);

        // budget spent: the next unit has to come from the pool
        assert!(c.next_unit().is_none());
        assert_eq!(source.fetches(), 2);
        assert_eq!(miner.summary().get_failures, 1);
    }

    #[test]
    fn restart_stops_cloning_from_old_work() {
        let source = Arc::new(MockSource::default());
        source.push_fetch(Ok(easy_work(4, true)));
        let (miner, mut c) = rig(test_config(1), &source);
        c.next_unit().unwrap();
        c.restart_work("test");
        assert!(c.seed.is_none());
        assert!(c.next_unit().is_none());
        assert_eq!(source.fetches(), 2);
        assert_eq!(miner.summary().local_work, 0);
    }

    #[test]
    fn dead_pools_are_rechecked_on_schedule() {
        let source = Arc::new(MockSource::default());
        let config = Config {
            health_check_interval_ms: 0,
            ..test_config(1)
        };
        let (miner, mut c) = rig(config, &source);
        let pools = &miner.shared().pools;
        while pools.pools()[0].alive() != Alive::Dead {
            pools.record_fetch_failure(0);
        }

        // nothing scripted: the check fails and the pool stays dead
        c.housekeeping();
        assert_eq!(source.fetches(), 1);
        assert_eq!(pools.pools()[0].alive(), Alive::Dead);

        source.push_fetch(Ok(easy_work(5, false)));
        c.housekeeping();
        assert_eq!(source.fetches(), 2);
        assert_eq!(pools.pools()[0].alive(), Alive::Well);
        assert!(miner.pools()[0].probed);

        // healthy pools are left alone
        c.housekeeping();
        assert_eq!(source.fetches(), 2);
    }

    #[test]
    fn pool_checks_wait_for_the_interval() {
        let source = Arc::new(MockSource::default());
        let config = Config {
            health_check_interval_ms: 200,
            ..test_config(1)
        };
        let (miner, mut c) = rig(config, &source);
        let pools = &miner.shared().pools;
        while pools.pools()[0].alive() != Alive::Dead {
            pools.record_fetch_failure(0);
        }
        c.housekeeping();
        assert_eq!(source.fetches(), 0);

        std::thread::sleep(Duration::from_millis(250));
        c.housekeeping();
        assert_eq!(source.fetches(), 1);
        c.housekeeping();
        assert_eq!(source.fetches(), 1);
    }

    #[test]
    fn watchdog_marks_stalled_devices() {
        let config = Config {
            device_timeout_secs: 0,
            device_sick_after: 1,
            device_dead_after: 2,
            ..test_config(1)
        };
        let (miner, mut c) = rig(config, &Arc::new(MockSource::default()));
        let device = Arc::clone(&miner.shared().devices[0]);

        // not yet started: ignored
        c.last_watchdog = Instant::now() - WATCHDOG_INTERVAL;
        c.housekeeping();
        assert_eq!(device.alive(), Alive::NoStart);

        device.record_success();
        c.last_watchdog = Instant::now() - WATCHDOG_INTERVAL;
        c.housekeeping();
        assert_eq!(device.alive(), Alive::Sick);

        // runs at most once per interval
        c.housekeeping();
        assert_eq!(device.alive(), Alive::Sick);

        c.last_watchdog = Instant::now() - WATCHDOG_INTERVAL;
        c.housekeeping();
        assert_eq!(device.alive(), Alive::Dead);
    }
}
