//! Pool selection and health bookkeeping.
//!
//! Selection never touches the network: it is a decision over the cached
//! state of each pool. `Dead` and disabled pools are never selected until a
//! probe revives them.
//!
//! Strategy details:
//! - `Failover`, `RoundRobin` and `Rotate` pick from a tiered set: healthy
//!   (`Well`) enabled pools, or lagging (`Sick`) ones only if no pool is well.
//! - `Rotate` counts its period in fetch cycles, i.e. calls to [`PoolManager::select`].
//! - `LoadBalance` weighs well and lagging pools together with smooth weighted
//!   round-robin over [`Pool::lb_weight`], so each pool's share of fetches is
//!   proportional to its weight. A lagging pool's weight is halved.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::health::Alive;
use crate::pool::{Pool, PoolCredentials, PoolStatus};
use crate::strategy::PoolStrategy;
use crate::sync::lock;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolControlError {
    #[error("no pool with id {0}")]
    UnknownPool(usize),
    #[error("pool {0} is the last enabled pool")]
    LastEnabled(usize),
}

#[derive(Debug, Default)]
struct Selector {
    current: Option<usize>,
    rotate_count: u32,
    lb_current: Vec<f64>,
}

#[derive(Debug)]
pub struct PoolManager {
    pools: Vec<Arc<Pool>>,
    strategy: PoolStrategy,
    rotate_period: u32,
    selector: Mutex<Selector>,
}

impl PoolManager {
    /// Pool ids are their index; initial priority follows the list order.
    pub fn new(
        credentials: Vec<PoolCredentials>,
        strategy: PoolStrategy,
        rotate_period: u32,
        sick_after: u32,
        dead_after: u32,
    ) -> Self {
        let pools: Vec<Arc<Pool>> = credentials
            .into_iter()
            .enumerate()
            .map(|(id, creds)| Arc::new(Pool::new(id, creds, id, sick_after, dead_after)))
            .collect();
        let selector = Selector {
            lb_current: vec![0.0; pools.len()],
            ..Selector::default()
        };
        Self {
            pools,
            strategy,
            rotate_period: rotate_period.max(1),
            selector: Mutex::new(selector),
        }
    }

    pub fn pools(&self) -> &[Arc<Pool>] {
        &self.pools
    }

    pub fn get(&self, id: usize) -> Option<&Arc<Pool>> {
        self.pools.get(id)
    }

    pub fn strategy(&self) -> PoolStrategy {
        self.strategy
    }

    /// Pool most recently chosen by [`select`](Self::select).
    pub fn current(&self) -> Option<Arc<Pool>> {
        let current = lock(&self.selector).current;
        current.and_then(|id| self.pools.get(id).cloned())
    }

    fn eligible(&self) -> Vec<&Arc<Pool>> {
        let enabled: Vec<(&Arc<Pool>, Alive)> = self
            .pools
            .iter()
            .filter(|p| p.is_enabled())
            .map(|p| (p, p.alive()))
            .collect();
        if matches!(self.strategy, PoolStrategy::LoadBalance) {
            return enabled
                .iter()
                .filter(|(_, a)| matches!(a, Alive::Well | Alive::Sick))
                .map(|(p, _)| *p)
                .collect();
        }
        let well: Vec<&Arc<Pool>> = enabled
            .iter()
            .filter(|(_, a)| *a == Alive::Well)
            .map(|(p, _)| *p)
            .collect();
        if !well.is_empty() {
            return well;
        }
        enabled
            .iter()
            .filter(|(_, a)| *a == Alive::Sick)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Picks the pool the next fetch should go to.
    pub fn select(&self) -> Option<Arc<Pool>> {
        let tier = self.eligible();
        if tier.is_empty() {
            return None;
        }

        let mut sel = lock(&self.selector);
        let chosen = match self.strategy {
            PoolStrategy::Failover => tier
                .iter()
                .min_by_key(|p| (p.prio(), p.id()))
                .copied()?,
            PoolStrategy::RoundRobin => next_after(&tier, sel.current),
            PoolStrategy::Rotate => {
                let stay = sel.current.and_then(|id| tier.iter().find(|p| p.id() == id).copied());
                match stay {
                    Some(p) if sel.rotate_count < self.rotate_period => {
                        sel.rotate_count += 1;
                        p
                    }
                    _ => {
                        sel.rotate_count = 1;
                        next_after(&tier, sel.current)
                    }
                }
            }
            PoolStrategy::LoadBalance => {
                let mut total = 0.0;
                let mut best: Option<&Arc<Pool>> = None;
                for (id, cur) in sel.lb_current.iter_mut().enumerate() {
                    if !tier.iter().any(|p| p.id() == id) {
                        *cur = 0.0;
                    }
                }
                for &p in &tier {
                    let w = p.lb_weight();
                    total += w;
                    sel.lb_current[p.id()] += w;
                    if best.is_none_or(|b| sel.lb_current[p.id()] > sel.lb_current[b.id()]) {
                        best = Some(p);
                    }
                }
                let best = best?;
                sel.lb_current[best.id()] -= total;
                best
            }
        };

        if sel.current != Some(chosen.id()) {
            if sel.current.is_some() {
                tracing::info!(pool = chosen.id(), url = %chosen.url(), strategy = %self.strategy, "switching pool");
            }
            sel.current = Some(chosen.id());
        }
        Some(Arc::clone(chosen))
    }

    pub fn record_fetch_success(&self, id: usize, latency: Duration) {
        if let Some(pool) = self.pools.get(id) {
            if let Some(prev) = pool.record_getwork_success(latency) {
                tracing::info!(pool = id, from = %prev, "pool recovered");
            }
        }
    }

    pub fn record_fetch_failure(&self, id: usize) {
        if let Some(pool) = self.pools.get(id) {
            if let Some(next) = pool.record_getwork_failure() {
                tracing::warn!(pool = id, state = %next, "pool health degraded");
            }
        }
    }

    pub fn record_submit_failure(&self, id: usize) {
        if let Some(pool) = self.pools.get(id) {
            if let Some(next) = pool.record_submit_failure() {
                tracing::warn!(pool = id, state = %next, "pool health degraded after submit failure");
            }
        }
    }

    /// Enabled pools that are not healthy and should be re-tried.
    pub fn probe_candidates(&self) -> Vec<Arc<Pool>> {
        self.pools
            .iter()
            .filter(|p| p.is_enabled() && p.alive() != Alive::Well)
            .cloned()
            .collect()
    }

    pub fn record_probe(&self, id: usize, ok: bool) {
        if let Some(pool) = self.pools.get(id) {
            match pool.record_probe(ok) {
                Some(prev) if ok => tracing::info!(pool = id, from = %prev, "probe revived pool"),
                Some(next) => tracing::warn!(pool = id, state = %next, "probe failed"),
                None => {}
            }
        }
    }

    /// Makes `id` the top-priority pool, shifting the ones above it down.
    pub fn switch_pool(&self, id: usize) -> Result<(), PoolControlError> {
        let target = self.pools.get(id).ok_or(PoolControlError::UnknownPool(id))?;
        let old = target.prio();
        for p in &self.pools {
            let prio = p.prio();
            if p.id() != id && prio < old {
                p.set_prio(prio + 1);
            }
        }
        target.set_prio(0);
        target.set_enabled(true);

        let mut sel = lock(&self.selector);
        sel.current = Some(id);
        sel.rotate_count = 0;
        tracing::info!(pool = id, url = %target.url(), "switched to pool on request");
        Ok(())
    }

    pub fn enable_pool(&self, id: usize) -> Result<(), PoolControlError> {
        let pool = self.pools.get(id).ok_or(PoolControlError::UnknownPool(id))?;
        pool.set_enabled(true);
        Ok(())
    }

    pub fn disable_pool(&self, id: usize) -> Result<(), PoolControlError> {
        let pool = self.pools.get(id).ok_or(PoolControlError::UnknownPool(id))?;
        let others_enabled = self.pools.iter().any(|p| p.id() != id && p.is_enabled());
        if !others_enabled {
            return Err(PoolControlError::LastEnabled(id));
        }
        pool.set_enabled(false);
        Ok(())
    }

    pub fn statuses(&self) -> Vec<PoolStatus> {
        self.pools.iter().map(|p| p.status()).collect()
    }
}

/// First pool in `tier` (ordered by id) after `last`, wrapping around.
fn next_after<'a>(tier: &[&'a Arc<Pool>], last: Option<usize>) -> &'a Arc<Pool> {
    last.and_then(|last| tier.iter().find(|p| p.id() > last).copied())
        .unwrap_or(tier[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(n: usize) -> Vec<PoolCredentials> {
        (0..n)
            .map(|i| PoolCredentials {
                url: format!("http://pool{i}.example:8332"),
                user: format!("worker{i}"),
                pass: "x".into(),
            })
            .collect()
    }

    fn picks(m: &PoolManager, n: usize) -> Vec<usize> {
        (0..n).map(|_| m.select().unwrap().id()).collect()
    }

    #[test]
    fn failover_falls_through_and_returns_after_recovery() {
        let m = PoolManager::new(creds(2), PoolStrategy::Failover, 1, 2, 4);
        assert_eq!(m.select().unwrap().id(), 0);

        for _ in 0..4 {
            m.record_fetch_failure(0);
        }
        assert_eq!(m.get(0).unwrap().alive(), Alive::Dead);
        assert_eq!(picks(&m, 3), vec![1, 1, 1]);

        let candidates: Vec<usize> = m.probe_candidates().iter().map(|p| p.id()).collect();
        assert_eq!(candidates, vec![0]);
        m.record_probe(0, true);
        assert_eq!(picks(&m, 2), vec![0, 0]);
    }

    #[test]
    fn failover_prefers_well_over_lagging() {
        let m = PoolManager::new(creds(2), PoolStrategy::Failover, 1, 2, 4);
        m.record_fetch_failure(0);
        m.record_fetch_failure(0);
        assert_eq!(m.get(0).unwrap().alive(), Alive::Sick);
        assert_eq!(m.select().unwrap().id(), 1);

        m.record_fetch_failure(1);
        m.record_fetch_failure(1);
        // everyone lagging: back to priority order
        assert_eq!(m.select().unwrap().id(), 0);
    }

    #[test]
    fn round_robin_cycles_all_eligible_pools() {
        let m = PoolManager::new(creds(3), PoolStrategy::RoundRobin, 1, 2, 4);
        assert_eq!(picks(&m, 6), vec![0, 1, 2, 0, 1, 2]);
        m.disable_pool(1).unwrap();
        assert_eq!(picks(&m, 3), vec![0, 2, 0]);
    }

    #[test]
    fn rotate_stays_for_the_period() {
        let m = PoolManager::new(creds(3), PoolStrategy::Rotate, 2, 2, 4);
        assert_eq!(picks(&m, 7), vec![0, 0, 1, 1, 2, 2, 0]);
    }

    #[test]
    fn rotate_moves_on_when_current_dies() {
        let m = PoolManager::new(creds(2), PoolStrategy::Rotate, 10, 1, 2);
        assert_eq!(m.select().unwrap().id(), 0);
        m.record_fetch_failure(0);
        m.record_fetch_failure(0);
        assert_eq!(m.select().unwrap().id(), 1);
    }

    #[test]
    fn load_balance_favours_responsive_pools() {
        let m = PoolManager::new(creds(2), PoolStrategy::LoadBalance, 1, 2, 4);
        for _ in 0..10 {
            m.record_fetch_success(0, Duration::from_millis(5));
            m.record_fetch_success(1, Duration::from_secs(9));
        }
        let mut counts = [0usize; 2];
        for id in picks(&m, 100) {
            counts[id] += 1;
        }
        assert!(counts[0] > counts[1], "{counts:?}");
        assert!(counts[1] > 0, "{counts:?}");
    }

    #[test]
    fn load_balance_keeps_lagging_pools_at_reduced_share() {
        let m = PoolManager::new(creds(3), PoolStrategy::LoadBalance, 1, 2, 4);
        for id in 0..3 {
            m.record_fetch_success(id, Duration::from_millis(5));
        }
        m.record_fetch_failure(1);
        m.record_fetch_failure(1);
        assert_eq!(m.pools()[1].alive(), Alive::Sick);
        for _ in 0..4 {
            m.record_fetch_failure(2);
        }
        assert_eq!(m.pools()[2].alive(), Alive::Dead);

        let mut counts = [0usize; 3];
        for id in picks(&m, 100) {
            counts[id] += 1;
        }
        assert!(counts[1] > 0, "{counts:?}");
        assert!(counts[0] > counts[1], "{counts:?}");
        assert_eq!(counts[2], 0, "{counts:?}");
    }

    #[test]
    fn tiered_strategies_skip_lagging_pools_while_one_is_well() {
        let m = PoolManager::new(creds(2), PoolStrategy::RoundRobin, 1, 1, 4);
        m.record_fetch_failure(0);
        assert_eq!(m.pools()[0].alive(), Alive::Sick);
        assert!(picks(&m, 5).iter().all(|&id| id == 1));
    }

    #[test]
    fn no_pool_when_all_dead_or_disabled() {
        let m = PoolManager::new(creds(2), PoolStrategy::Failover, 1, 1, 1);
        m.record_fetch_failure(0);
        m.disable_pool(1).unwrap();
        assert!(m.select().is_none());
        assert_eq!(m.disable_pool(0), Err(PoolControlError::LastEnabled(0)));
    }

    #[test]
    fn switch_pool_promotes_to_top_priority() {
        let m = PoolManager::new(creds(3), PoolStrategy::Failover, 1, 2, 4);
        m.switch_pool(2).unwrap();
        let prios: Vec<usize> = m.pools().iter().map(|p| p.prio()).collect();
        assert_eq!(prios, vec![1, 2, 0]);
        assert_eq!(m.select().unwrap().id(), 2);
        assert_eq!(m.switch_pool(9), Err(PoolControlError::UnknownPool(9)));
    }
}
