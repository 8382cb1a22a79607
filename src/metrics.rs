use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::health::Alive;
use crate::sync::lock;

/// Miner-wide totals, the per-pool and per-device counters summed up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub elapsed_secs: u64,
    pub mhs_av: f64,
    pub found_blocks: u64,
    pub getworks: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub hw_errors: u64,
    /// Accepted shares per minute.
    pub utility: f64,
    pub discarded: u64,
    pub stale: u64,
    pub get_failures: u64,
    pub local_work: u64,
    pub remote_failures: u64,
    pub network_blocks: u64,
    pub total_mh: f64,
    pub last_accepted_secs: Option<u64>,
}

#[derive(Debug)]
pub struct MinerStats {
    getworks: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    hw_errors: AtomicU64,
    stale: AtomicU64,
    discarded: AtomicU64,
    get_failures: AtomicU64,
    remote_failures: AtomicU64,
    local_work: AtomicU64,
    network_blocks: AtomicU64,
    found_blocks: AtomicU64,

    start_time: Instant,
    last_accepted: Mutex<Option<Instant>>,
}

impl Default for MinerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl MinerStats {
    pub fn new() -> Self {
        Self {
            getworks: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            hw_errors: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            get_failures: AtomicU64::new(0),
            remote_failures: AtomicU64::new(0),
            local_work: AtomicU64::new(0),
            network_blocks: AtomicU64::new(0),
            found_blocks: AtomicU64::new(0),
            start_time: Instant::now(),
            last_accepted: Mutex::new(None),
        }
    }

    pub fn record_getwork(&self) {
        self.getworks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_accepted) = Some(Instant::now());
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hw_error(&self) {
        self.hw_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_get_failure(&self) {
        self.get_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_failure(&self) {
        self.remote_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_work(&self) {
        self.local_work.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_block(&self) {
        self.network_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_found_block(&self) {
        self.found_blocks.fetch_add(1, Ordering::Relaxed);
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

    pub fn stale(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// `total_hashes` comes from the devices, which own that counter.
    pub fn snapshot(&self, total_hashes: u64) -> Summary {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let accepted = self.accepted();
        let total_mh = total_hashes as f64 / 1e6;
        let (mhs_av, utility) = if elapsed > 0.0 {
            (total_mh / elapsed, accepted as f64 * 60.0 / elapsed)
        } else {
            (0.0, 0.0)
        };
        let last_accepted_secs = lock(&self.last_accepted).map(|t| t.elapsed().as_secs());

        Summary {
            elapsed_secs: elapsed as u64,
            mhs_av,
            found_blocks: self.found_blocks.load(Ordering::Relaxed),
            getworks: self.getworks.load(Ordering::Relaxed),
            accepted,
            rejected: self.rejected(),
            hw_errors: self.hw_errors(),
            utility,
            discarded: self.discarded(),
            stale: self.stale(),
            get_failures: self.get_failures.load(Ordering::Relaxed),
            local_work: self.local_work.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            network_blocks: self.network_blocks.load(Ordering::Relaxed),
            total_mh,
            last_accepted_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    /// Critical when nothing can fetch or nothing can scan; degraded when any
    /// pool or started device is not well.
    pub fn assess(devices: &[Alive], pools: &[Alive]) -> Self {
        let usable = |a: &&Alive| matches!(a, Alive::Well | Alive::Sick);
        if devices.iter().filter(usable).count() == 0 || pools.iter().filter(usable).count() == 0 {
            return HealthStatus::Critical;
        }
        let unwell = |a: &Alive| matches!(a, Alive::Sick | Alive::Dead);
        if devices.iter().any(unwell) || pools.iter().any(unwell) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = MinerStats::new();
        for _ in 0..3 {
            stats.record_accepted();
        }
        stats.record_rejected();
        stats.record_discarded(5);
        stats.record_local_work();
        let s = stats.snapshot(2_000_000);
        assert_eq!((s.accepted, s.rejected, s.discarded, s.local_work), (3, 1, 5, 1));
        assert_eq!(s.total_mh, 2.0);
        assert_eq!(s.last_accepted_secs, Some(0));
    }

    #[test]
    fn health_assessment() {
        use Alive::*;
        assert_eq!(HealthStatus::assess(&[Well], &[Well, Well]), HealthStatus::Healthy);
        assert_eq!(HealthStatus::assess(&[Well], &[Well, Dead]), HealthStatus::Degraded);
        assert_eq!(HealthStatus::assess(&[NoStart], &[Well]), HealthStatus::Critical);
        assert_eq!(HealthStatus::assess(&[Well], &[Dead]), HealthStatus::Critical);
    }
}
