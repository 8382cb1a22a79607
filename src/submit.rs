//! Share submission.
//!
//! Every candidate is re-hashed on the host before it goes anywhere. Only
//! verified, first-seen candidates reach the pool; the rest are accounted for
//! locally.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::Device;
use crate::epoch::RestartEpoch;
use crate::hash;
use crate::job_source::{JobSource, PoolError, SubmitResponse};
use crate::metrics::MinerStats;
use crate::retry::RetryConfig;
use crate::sync::lock;
use crate::work::{Candidate, WorkUnit};

/// Most units whose nonces are remembered at once.
const SEEN_UNITS: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(Option<String>),
    /// Recomputed hash does not meet the target.
    HardwareError,
    /// Work was invalidated by a restart; dropped without submitting.
    Stale,
    /// This (unit, nonce) pair was already handled.
    Duplicate,
    Failed(PoolError),
}

/// A candidate on its way to the submission thread.
#[derive(Debug)]
pub struct Submission {
    pub device: Arc<Device>,
    pub candidate: Candidate,
}

/// What workers send to the submission thread.
#[derive(Debug)]
pub enum SubmitMsg {
    Share(Submission),
    /// The unit left its worker; no more shares for it will follow.
    Retired(u64),
}

/// Nonces already handled, per unit. A unit's entry lives until the unit is
/// retired; past [`SEEN_UNITS`] live units the oldest is forgotten.
#[derive(Debug, Default)]
struct Seen {
    units: HashMap<u64, HashSet<u32>>,
    order: VecDeque<u64>,
}

impl Seen {
    /// False if the pair was already present.
    fn insert(&mut self, unit: u64, nonce: u32) -> bool {
        if let Some(nonces) = self.units.get_mut(&unit) {
            return nonces.insert(nonce);
        }
        self.units.insert(unit, HashSet::from([nonce]));
        self.order.push_back(unit);
        while self.order.len() > SEEN_UNITS {
            if let Some(old) = self.order.pop_front() {
                self.units.remove(&old);
            }
        }
        true
    }

    fn retire(&mut self, unit: u64) {
        if self.units.remove(&unit).is_some() {
            self.order.retain(|&u| u != unit);
        }
    }
}

pub struct Submitter {
    source: Arc<dyn JobSource>,
    epoch: Arc<RestartEpoch>,
    stats: Arc<MinerStats>,
    retry: RetryConfig,
    stopping: Arc<AtomicBool>,
    seen: Mutex<Seen>,
}

impl Submitter {
    pub fn new(
        source: Arc<dyn JobSource>,
        epoch: Arc<RestartEpoch>,
        stats: Arc<MinerStats>,
        retry: RetryConfig,
        stopping: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            epoch,
            stats,
            retry,
            stopping,
            seen: Mutex::new(Seen::default()),
        }
    }

    pub fn submit(&self, device: &Device, unit: &WorkUnit, nonce: u32) -> SubmitOutcome {
        self.submit_candidate(device, unit.candidate(nonce, device.id()))
    }

    /// Forgets the nonces seen for a unit that can produce no more shares.
    pub fn retire(&self, unit_id: u64) {
        lock(&self.seen).retire(unit_id);
    }

    pub fn handle(&self, msg: SubmitMsg) {
        match msg {
            SubmitMsg::Share(sub) => {
                self.submit_candidate(&sub.device, sub.candidate);
            }
            SubmitMsg::Retired(unit_id) => self.retire(unit_id),
        }
    }

    pub fn submit_candidate(&self, device: &Device, cand: Candidate) -> SubmitOutcome {
        if !lock(&self.seen).insert(cand.unit_id, cand.nonce) {
            tracing::debug!(unit = cand.unit_id, nonce = cand.nonce, "duplicate candidate ignored");
            return SubmitOutcome::Duplicate;
        }

        let digest = cand.hash();
        if !hash::meets_target(&digest, cand.template.target()) {
            device.record_hw_error();
            self.stats.record_hw_error();
            tracing::warn!(
                device = device.id(),
                unit = cand.unit_id,
                nonce = format_args!("{:08x}", cand.nonce),
                "candidate does not meet target, hardware error"
            );
            return SubmitOutcome::HardwareError;
        }

        if self.epoch.is_stale(cand.epoch) {
            self.drop_stale(&cand);
            return SubmitOutcome::Stale;
        }

        let outcome = self.forward(&cand);
        match &outcome {
            SubmitOutcome::Accepted => {
                device.record_accepted();
                cand.pool.record_accepted();
                self.stats.record_accepted();
                tracing::info!(
                    device = device.id(),
                    pool = cand.pool.id(),
                    nonce = format_args!("{:08x}", cand.nonce),
                    "share accepted"
                );
                if hash::meets_target(&digest, cand.template.block_target()) {
                    self.stats.record_found_block();
                    tracing::info!(hash = %hex::encode(digest.iter().rev().copied().collect::<Vec<u8>>()), "found block");
                }
            }
            SubmitOutcome::Rejected(reason) => {
                device.record_rejected();
                cand.pool.record_rejected();
                self.stats.record_rejected();
                tracing::info!(
                    device = device.id(),
                    pool = cand.pool.id(),
                    reason = reason.as_deref().unwrap_or("none given"),
                    "share rejected"
                );
            }
            _ => {}
        }
        outcome
    }

    fn drop_stale(&self, cand: &Candidate) {
        self.stats.record_stale();
        cand.pool.record_stale();
        tracing::debug!(unit = cand.unit_id, "dropping stale share");
    }

    fn forward(&self, cand: &Candidate) -> SubmitOutcome {
        let creds = cand.pool.credentials();
        let data = cand.data();
        let mut backoff = self.retry.backoff();
        loop {
            match self.source.submit(&creds, &data, cand.nonce) {
                Ok(SubmitResponse::Accepted) => return SubmitOutcome::Accepted,
                Ok(SubmitResponse::Rejected(reason)) => return SubmitOutcome::Rejected(reason),
                Err(err) => {
                    self.stats.record_remote_failure();
                    if let Some(next) = cand.pool.record_submit_failure() {
                        tracing::warn!(pool = cand.pool.id(), state = %next, "pool health degraded after submit failure");
                    }
                    if backoff.exhausted() || self.stopping.load(Ordering::SeqCst) {
                        tracing::warn!(pool = cand.pool.id(), error = %err, "giving up on share");
                        return SubmitOutcome::Failed(err);
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(pool = cand.pool.id(), error = %err, ?delay, "share submit failed, retrying");
                    std::thread::sleep(delay);
                    if self.epoch.is_stale(cand.epoch) {
                        self.drop_stale(cand);
                        return SubmitOutcome::Stale;
                    }
                }
            }
        }
    }
}
