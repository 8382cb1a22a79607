use std::sync::atomic::AtomicU64;
use std::sync::Mutex;

use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

use crate::device::DeviceStatus;
use crate::health::Alive;
use crate::metrics::Summary;
use crate::pool::PoolStatus;
use crate::sync::lock;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DeviceLabels {
    device: String,
    driver: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PoolLabels {
    pool: String,
    url: String,
}

pub struct PrometheusMetrics {
    registry: Registry,
    sync: Mutex<()>,

    // Counters, advanced to the miner's totals on every refresh
    getworks: Counter,
    accepted: Counter,
    rejected: Counter,
    hw_errors: Counter,
    stale: Counter,
    discarded: Counter,
    get_failures: Counter,
    remote_failures: Counter,
    local_work: Counter,
    network_blocks: Counter,
    found_blocks: Counter,

    // Gauges
    uptime_seconds: Gauge,
    mhs_av: Gauge<f64, AtomicU64>,
    device_mhs: Family<DeviceLabels, Gauge<f64, AtomicU64>>,
    device_hw_errors: Family<DeviceLabels, Gauge>,
    pool_alive: Family<PoolLabels, Gauge>,

    // Histograms
    fetch_latency_ms: Histogram,
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let getworks = Counter::default();
        let accepted = Counter::default();
        let rejected = Counter::default();
        let hw_errors = Counter::default();
        let stale = Counter::default();
        let discarded = Counter::default();
        let get_failures = Counter::default();
        let remote_failures = Counter::default();
        let local_work = Counter::default();
        let network_blocks = Counter::default();
        let found_blocks = Counter::default();

        let uptime_seconds = Gauge::default();
        let mhs_av = Gauge::<f64, AtomicU64>::default();
        let device_mhs = Family::<DeviceLabels, Gauge<f64, AtomicU64>>::default();
        let device_hw_errors = Family::<DeviceLabels, Gauge>::default();
        let pool_alive = Family::<PoolLabels, Gauge>::default();

        let fetch_latency_ms = Histogram::new(
            [5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0].into_iter()
        );

        let counters: [(&str, &str, &Counter); 11] = [
            ("hashmill_getworks", "Work units fetched from pools", &getworks),
            ("hashmill_accepted", "Shares accepted by pools", &accepted),
            ("hashmill_rejected", "Shares rejected by pools", &rejected),
            ("hashmill_hardware_errors", "Scan errors and false-positive candidates", &hw_errors),
            ("hashmill_stale", "Candidates found on work invalidated by a new block", &stale),
            ("hashmill_discarded", "Work units dropped unscanned after a restart", &discarded),
            ("hashmill_get_failures", "Failed work fetches", &get_failures),
            ("hashmill_remote_failures", "Failed share submissions", &remote_failures),
            ("hashmill_local_work", "Work units made by rolling ntime", &local_work),
            ("hashmill_network_blocks", "New blocks seen on the network", &network_blocks),
            ("hashmill_found_blocks", "Shares that also met the block target", &found_blocks),
        ];
        for (name, help, counter) in counters {
            registry.register(name, help, counter.clone());
        }

        registry.register(
            "hashmill_uptime_seconds",
            "Miner uptime in seconds",
            uptime_seconds.clone(),
        );
        registry.register(
            "hashmill_mhs_av",
            "Average hashrate since start in MH/s",
            mhs_av.clone(),
        );
        registry.register(
            "hashmill_device_mhs",
            "Rolling hashrate per device in MH/s",
            device_mhs.clone(),
        );
        registry.register(
            "hashmill_device_hardware_errors",
            "Hardware errors per device",
            device_hw_errors.clone(),
        );
        registry.register(
            "hashmill_pool_alive",
            "1 when the pool is eligible for work, 0 when dead or disabled",
            pool_alive.clone(),
        );
        registry.register(
            "hashmill_fetch_latency_ms",
            "Work fetch latency in milliseconds",
            fetch_latency_ms.clone(),
        );

        Self {
            registry,
            sync: Mutex::new(()),
            getworks,
            accepted,
            rejected,
            hw_errors,
            stale,
            discarded,
            get_failures,
            remote_failures,
            local_work,
            network_blocks,
            found_blocks,
            uptime_seconds,
            mhs_av,
            device_mhs,
            device_hw_errors,
            pool_alive,
            fetch_latency_ms,
        }
    }

    pub fn record_fetch_latency(&self, latency_ms: f64) {
        self.fetch_latency_ms.observe(latency_ms);
    }

    /// Brings every exported value up to date with a snapshot.
    pub fn update(&self, summary: &Summary, devices: &[DeviceStatus], pools: &[PoolStatus]) {
        let _guard = lock(&self.sync);

        advance(&self.getworks, summary.getworks);
        advance(&self.accepted, summary.accepted);
        advance(&self.rejected, summary.rejected);
        advance(&self.hw_errors, summary.hw_errors);
        advance(&self.stale, summary.stale);
        advance(&self.discarded, summary.discarded);
        advance(&self.get_failures, summary.get_failures);
        advance(&self.remote_failures, summary.remote_failures);
        advance(&self.local_work, summary.local_work);
        advance(&self.network_blocks, summary.network_blocks);
        advance(&self.found_blocks, summary.found_blocks);

        self.uptime_seconds.set(summary.elapsed_secs as i64);
        self.mhs_av.set(summary.mhs_av);

        for dev in devices {
            let labels = DeviceLabels {
                device: dev.id.to_string(),
                driver: dev.driver.clone(),
            };
            self.device_mhs.get_or_create(&labels).set(dev.mhs_rolling);
            self.device_hw_errors.get_or_create(&labels).set(dev.hw_errors as i64);
        }
        for pool in pools {
            let labels = PoolLabels {
                pool: pool.id.to_string(),
                url: pool.url.clone(),
            };
            let alive = pool.enabled && matches!(pool.alive, Alive::Well | Alive::Sick);
            self.pool_alive.get_or_create(&labels).set(alive as i64);
        }
    }

    pub fn export_metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

fn advance(counter: &Counter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_tracks_summary_totals() {
        let m = PrometheusMetrics::new();
        let mut summary = Summary {
            accepted: 10,
            rejected: 2,
            ..Summary::default()
        };
        m.update(&summary, &[], &[]);
        summary.accepted = 12;
        m.update(&summary, &[], &[]);
        m.record_fetch_latency(42.0);

        let text = m.export_metrics().unwrap();
        assert!(text.contains("hashmill_accepted_total 12"), "{text}");
        assert!(text.contains("hashmill_rejected_total 2"), "{text}");
        assert!(text.contains("hashmill_fetch_latency_ms_count 1"), "{text}");
    }
}
