use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::{Alive, HealthTracker};
use crate::sync::lock;

/// Weight given to the newest sample in the responsiveness averages.
const EWMA_ALPHA: f64 = 0.2;
const MIN_LB_WEIGHT: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCredentials {
    pub url: String,
    pub user: String,
    pub pass: String,
}

#[derive(Debug)]
struct PoolState {
    credentials: PoolCredentials,
    prio: usize,
    enabled: bool,
    probed: bool,
    submit_fail: bool,
    health: HealthTracker,

    getwork_requested: u64,
    accepted: u64,
    rejected: u64,
    stale_shares: u64,
    discarded_work: u64,
    getfail_occasions: u64,
    remotefail_occasions: u64,

    success_score: f64,
    latency_secs: f64,
    last_share: Option<DateTime<Utc>>,
    last_work: Option<Instant>,
}

/// One upstream job provider. All mutable fields live behind the pool's own
/// lock; `active_work` counts live work units fetched from it.
#[derive(Debug)]
pub struct Pool {
    id: usize,
    state: Mutex<PoolState>,
    active_work: AtomicUsize,
}

/// Read-only view of a pool for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub id: usize,
    pub url: String,
    pub user: String,
    pub prio: usize,
    pub enabled: bool,
    pub alive: Alive,
    pub lagging: bool,
    pub idle: bool,
    pub probed: bool,
    pub submit_fail: bool,
    pub getworks: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub stale: u64,
    pub discarded: u64,
    pub get_failures: u64,
    pub remote_failures: u64,
    pub lb_weight: f64,
    pub last_share: Option<DateTime<Utc>>,
}

impl Pool {
    pub fn new(id: usize, credentials: PoolCredentials, prio: usize, sick_after: u32, dead_after: u32) -> Self {
        Self {
            id,
            state: Mutex::new(PoolState {
                credentials,
                prio,
                enabled: true,
                probed: false,
                submit_fail: false,
                health: HealthTracker::new(Alive::Well, sick_after, dead_after),
                getwork_requested: 0,
                accepted: 0,
                rejected: 0,
                stale_shares: 0,
                discarded_work: 0,
                getfail_occasions: 0,
                remotefail_occasions: 0,
                success_score: 1.0,
                latency_secs: 0.0,
                last_share: None,
                last_work: None,
            }),
            active_work: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn credentials(&self) -> PoolCredentials {
        lock(&self.state).credentials.clone()
    }

    pub fn url(&self) -> String {
        lock(&self.state).credentials.url.clone()
    }

    pub fn prio(&self) -> usize {
        lock(&self.state).prio
    }

    pub(crate) fn set_prio(&self, prio: usize) {
        lock(&self.state).prio = prio;
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        lock(&self.state).enabled = enabled;
    }

    pub fn alive(&self) -> Alive {
        lock(&self.state).health.state()
    }

    pub fn is_lagging(&self) -> bool {
        self.alive() == Alive::Sick
    }

    /// No unit fetched from this pool is currently alive.
    pub fn is_idle(&self) -> bool {
        self.active_work.load(Ordering::SeqCst) == 0
    }

    pub fn active_work(&self) -> usize {
        self.active_work.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire_work(&self) {
        self.active_work.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_work(&self) {
        self.active_work.fetch_sub(1, Ordering::SeqCst);
    }

    /// Load-balance weight: smoothed success rate discounted by smoothed
    /// latency, halved while lagging, floored so a recovering pool still gets
    /// the occasional request.
    pub fn lb_weight(&self) -> f64 {
        let state = lock(&self.state);
        Self::weight_of(&state)
    }

    fn weight_of(state: &PoolState) -> f64 {
        let mut w = state.success_score / (1.0 + state.latency_secs);
        if state.health.state() == Alive::Sick {
            w /= 2.0;
        }
        w.max(MIN_LB_WEIGHT)
    }

    /// Returns the previous health state if the success revived the pool.
    pub fn record_getwork_success(&self, latency: Duration) -> Option<Alive> {
        let mut state = lock(&self.state);
        state.getwork_requested += 1;
        state.success_score = ewma(state.success_score, 1.0);
        state.latency_secs = ewma(state.latency_secs, latency.as_secs_f64());
        state.last_work = Some(Instant::now());
        state.health.record_success()
    }

    /// Returns the new health state if the failure changed it.
    pub fn record_getwork_failure(&self) -> Option<Alive> {
        let mut state = lock(&self.state);
        state.getfail_occasions += 1;
        state.success_score = ewma(state.success_score, 0.0);
        state.health.record_failure()
    }

    pub fn record_probe(&self, ok: bool) -> Option<Alive> {
        let mut state = lock(&self.state);
        state.probed = true;
        if ok {
            state.success_score = ewma(state.success_score, 1.0);
            state.health.record_success()
        } else {
            state.getfail_occasions += 1;
            state.health.record_failure()
        }
    }

    pub fn record_submit_failure(&self) -> Option<Alive> {
        let mut state = lock(&self.state);
        state.remotefail_occasions += 1;
        state.submit_fail = true;
        state.health.record_failure()
    }

    pub fn record_accepted(&self) {
        let mut state = lock(&self.state);
        state.accepted += 1;
        state.submit_fail = false;
        state.last_share = Some(Utc::now());
        state.health.record_success();
    }

    pub fn record_rejected(&self) {
        let mut state = lock(&self.state);
        state.rejected += 1;
        state.submit_fail = false;
        state.last_share = Some(Utc::now());
        state.health.record_success();
    }

    pub fn record_stale(&self) {
        lock(&self.state).stale_shares += 1;
    }

    pub fn record_discarded(&self, count: u64) {
        lock(&self.state).discarded_work += count;
    }

    pub fn status(&self) -> PoolStatus {
        let state = lock(&self.state);
        PoolStatus {
            id: self.id,
            url: state.credentials.url.clone(),
            user: state.credentials.user.clone(),
            prio: state.prio,
            enabled: state.enabled,
            alive: state.health.state(),
            lagging: state.health.state() == Alive::Sick,
            idle: self.is_idle(),
            probed: state.probed,
            submit_fail: state.submit_fail,
            getworks: state.getwork_requested,
            accepted: state.accepted,
            rejected: state.rejected,
            stale: state.stale_shares,
            discarded: state.discarded_work,
            get_failures: state.getfail_occasions,
            remote_failures: state.remotefail_occasions,
            lb_weight: Self::weight_of(&state),
            last_share: state.last_share,
        }
    }
}

fn ewma(prev: f64, sample: f64) -> f64 {
    prev * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Pool {
        let creds = PoolCredentials {
            url: "http://pool.example:8332".into(),
            user: "worker".into(),
            pass: "x".into(),
        };
        Pool::new(0, creds, 0, 2, 4)
    }

    #[test]
    fn fetch_failures_make_pool_lag_then_die() {
        let p = pool();
        assert_eq!(p.record_getwork_failure(), None);
        assert_eq!(p.record_getwork_failure(), Some(Alive::Sick));
        assert!(p.is_lagging());
        p.record_getwork_failure();
        assert_eq!(p.record_getwork_failure(), Some(Alive::Dead));
        assert_eq!(p.status().get_failures, 4);
        assert_eq!(p.record_probe(true), Some(Alive::Dead));
        assert_eq!(p.alive(), Alive::Well);
        assert!(p.status().probed);
    }

    #[test]
    fn idle_tracks_live_work() {
        let p = pool();
        assert!(p.is_idle());
        p.acquire_work();
        assert!(!p.is_idle());
        p.release_work();
        assert!(p.is_idle());
    }

    #[test]
    fn failures_and_latency_lower_the_weight() {
        let fast = pool();
        let slow = pool();
        fast.record_getwork_success(Duration::from_millis(10));
        slow.record_getwork_success(Duration::from_secs(4));
        assert!(fast.lb_weight() > slow.lb_weight());

        let flaky = pool();
        flaky.record_getwork_failure();
        assert!(flaky.lb_weight() < fast.lb_weight());
        for _ in 0..50 {
            flaky.record_getwork_failure();
        }
        assert!(flaky.lb_weight() >= MIN_LB_WEIGHT);
    }

    #[test]
    fn lagging_halves_the_weight() {
        let creds = PoolCredentials {
            url: "http://other.example:8332".into(),
            user: "worker".into(),
            pass: "x".into(),
        };
        let lagging = pool();
        let tolerant = Pool::new(1, creds, 1, 10, 20);
        for p in [&lagging, &tolerant] {
            p.record_getwork_success(Duration::from_millis(10));
            p.record_getwork_failure();
            p.record_getwork_failure();
        }
        assert!(lagging.is_lagging());
        assert_eq!(tolerant.alive(), Alive::Well);
        assert!((lagging.lb_weight() * 2.0 - tolerant.lb_weight()).abs() < 1e-9);
    }
}
