//! Work units: what a device scans.
//!
//! The immutable part of a job (input block, midstate, target) lives in a
//! shared [`WorkTemplate`]. Each [`WorkUnit`] owns its nonce cursor, id and
//! ntime roll, so clones of one fetched job can be scanned independently
//! without another round trip to the pool.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::hash::{self, DATA_LEN, HEADER_LEN, NBITS_OFFSET, NONCE_OFFSET, NTIME_OFFSET, PREV_HASH_OFFSET};
use crate::pool::Pool;

/// Work as delivered by a job source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawWork {
    /// Header in wire order followed by SHA-256 padding.
    pub data: [u8; DATA_LEN],
    /// Little-endian share target.
    pub target: [u8; 32],
    /// Pool allows incrementing ntime to make more work locally.
    pub roll_ntime: bool,
}

impl RawWork {
    pub fn from_header(header: &[u8; HEADER_LEN], target: [u8; 32], roll_ntime: bool) -> Self {
        Self {
            data: hash::pad_header(header),
            target,
            roll_ntime,
        }
    }

    pub fn prev_hash(&self) -> [u8; 32] {
        prev_hash_of(&self.data)
    }
}

fn prev_hash_of(data: &[u8; DATA_LEN]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&data[PREV_HASH_OFFSET..PREV_HASH_OFFSET + 32]);
    out
}

#[derive(Debug)]
pub struct WorkTemplate {
    data: [u8; DATA_LEN],
    midstate: [u32; 8],
    target: [u8; 32],
    block_target: [u8; 32],
    roll_ntime: bool,
    fetched_at: Instant,
    cloned: AtomicBool,
}

impl WorkTemplate {
    fn new(raw: RawWork) -> Self {
        let nbits = hash::read_u32_le(&raw.data, NBITS_OFFSET);
        Self {
            midstate: hash::midstate(&raw.data),
            block_target: hash::target_from_nbits(nbits),
            data: raw.data,
            target: raw.target,
            roll_ntime: raw.roll_ntime,
            fetched_at: Instant::now(),
            cloned: AtomicBool::new(false),
        }
    }

    pub fn data(&self) -> &[u8; DATA_LEN] {
        &self.data
    }

    pub fn midstate(&self) -> &[u32; 8] {
        &self.midstate
    }

    pub fn target(&self) -> &[u8; 32] {
        &self.target
    }

    pub fn block_target(&self) -> &[u8; 32] {
        &self.block_target
    }

    pub fn prev_hash(&self) -> [u8; 32] {
        prev_hash_of(&self.data)
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// Input block with ntime advanced by `roll`.
    pub fn rolled_data(&self, roll: u32) -> [u8; DATA_LEN] {
        let mut data = self.data;
        if roll != 0 {
            let ntime = hash::read_u32_le(&data, NTIME_OFFSET).wrapping_add(roll);
            hash::write_u32_le(&mut data, NTIME_OFFSET, ntime);
        }
        data
    }
}

/// One unit of scanning work.
///
/// Holds one count of its pool's active-work gauge for its whole life.
#[derive(Debug)]
pub struct WorkUnit {
    id: u64,
    template: Arc<WorkTemplate>,
    ntime_roll: u32,
    next_nonce: u64,
    nonce_end: u32,
    epoch: u64,
    pool: Arc<Pool>,
    thr_id: Option<usize>,
    created: Instant,
    mined: bool,
    clone: bool,
}

impl WorkUnit {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn template(&self) -> &Arc<WorkTemplate> {
        &self.template
    }

    pub fn thr_id(&self) -> Option<usize> {
        self.thr_id
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_mined(&self) -> bool {
        self.mined
    }

    pub fn is_clone(&self) -> bool {
        self.clone
    }

    /// The shared input block has been cloned at least once.
    pub fn is_cloned(&self) -> bool {
        self.template.cloned.load(Ordering::Relaxed)
    }

    pub fn rolltime(&self) -> bool {
        self.template.roll_ntime
    }

    pub fn ntime_roll(&self) -> u32 {
        self.ntime_roll
    }

    pub fn data(&self) -> [u8; DATA_LEN] {
        self.template.rolled_data(self.ntime_roll)
    }

    /// Second compression block, nonce field as delivered.
    pub fn tail(&self) -> [u8; 64] {
        let mut tail = [0u8; 64];
        tail.copy_from_slice(&self.data()[64..]);
        tail
    }

    pub fn midstate(&self) -> &[u32; 8] {
        self.template.midstate()
    }

    pub fn target(&self) -> &[u8; 32] {
        self.template.target()
    }

    /// Next nonce to scan.
    pub fn cursor(&self) -> u64 {
        self.next_nonce
    }

    pub fn nonce_end(&self) -> u32 {
        self.nonce_end
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_nonce > self.nonce_end as u64
    }

    pub fn remaining(&self) -> u64 {
        (self.nonce_end as u64 + 1).saturating_sub(self.next_nonce)
    }

    /// Moves the cursor past `last_nonce`. Never moves backwards.
    pub fn advance(&mut self, last_nonce: u32) {
        self.next_nonce = self.next_nonce.max(last_nonce as u64 + 1);
    }

    pub(crate) fn assign(&mut self, thr_id: usize) {
        self.thr_id = Some(thr_id);
        self.mined = true;
    }

    pub fn candidate(&self, nonce: u32, device: usize) -> Candidate {
        Candidate {
            unit_id: self.id,
            template: Arc::clone(&self.template),
            ntime_roll: self.ntime_roll,
            nonce,
            epoch: self.epoch,
            pool: Arc::clone(&self.pool),
            device,
        }
    }

    pub fn roll_seed(&self) -> RollSeed {
        RollSeed {
            template: Arc::clone(&self.template),
            pool: Arc::clone(&self.pool),
            epoch: self.epoch,
            rolls: self.ntime_roll,
        }
    }
}

impl Drop for WorkUnit {
    fn drop(&mut self) {
        self.pool.release_work();
    }
}

/// Enough of a fetched unit to clone more work from it later.
#[derive(Debug, Clone)]
pub struct RollSeed {
    template: Arc<WorkTemplate>,
    pool: Arc<Pool>,
    epoch: u64,
    rolls: u32,
}

impl RollSeed {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn rolls(&self) -> u32 {
        self.rolls
    }
}

/// A nonce a device believes meets the unit's target.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub unit_id: u64,
    pub template: Arc<WorkTemplate>,
    pub ntime_roll: u32,
    pub nonce: u32,
    pub epoch: u64,
    pub pool: Arc<Pool>,
    pub device: usize,
}

impl Candidate {
    /// Input block with the candidate nonce filled in.
    pub fn data(&self) -> [u8; DATA_LEN] {
        let mut data = self.template.rolled_data(self.ntime_roll);
        hash::write_u32_le(&mut data, NONCE_OFFSET, self.nonce);
        data
    }

    pub fn hash(&self) -> [u8; 32] {
        let data = self.data();
        let mut tail = [0u8; 64];
        tail.copy_from_slice(&data[64..]);
        hash::hash_from_midstate(self.template.midstate(), &tail)
    }
}

/// Creates work units with process-unique sequential ids.
#[derive(Debug)]
pub struct WorkFactory {
    next_id: AtomicU64,
    max_rolls: u32,
    max_age: Duration,
}

impl WorkFactory {
    pub fn new(max_rolls: u32, max_age: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            max_rolls,
            max_age,
        }
    }

    fn unit(&self, template: Arc<WorkTemplate>, pool: Arc<Pool>, epoch: u64, ntime_roll: u32, clone: bool) -> WorkUnit {
        pool.acquire_work();
        WorkUnit {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            template,
            ntime_roll,
            next_nonce: 0,
            nonce_end: u32::MAX,
            epoch,
            pool,
            thr_id: None,
            created: Instant::now(),
            mined: false,
            clone,
        }
    }

    pub fn create(&self, raw: RawWork, pool: Arc<Pool>, epoch: u64) -> WorkUnit {
        self.unit(Arc::new(WorkTemplate::new(raw)), pool, epoch, 0, false)
    }

    /// Clones the seed's block with ntime rolled one step further, giving a
    /// fresh full nonce range. `None` when the pool does not allow rolling,
    /// the block is too old, the epoch moved on, or the roll budget is spent.
    pub fn clone_rolled(&self, seed: &mut RollSeed, current_epoch: u64) -> Option<WorkUnit> {
        if !seed.template.roll_ntime
            || seed.epoch != current_epoch
            || seed.rolls >= self.max_rolls
            || seed.template.age() >= self.max_age
        {
            return None;
        }
        seed.rolls += 1;
        seed.template.cloned.store(true, Ordering::Relaxed);
        Some(self.unit(
            Arc::clone(&seed.template),
            Arc::clone(&seed.pool),
            seed.epoch,
            seed.rolls,
            true,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{easy_work, test_pool};

    fn factory() -> WorkFactory {
        WorkFactory::new(2, Duration::from_secs(60))
    }

    #[test]
    fn units_get_sequential_ids_and_hold_their_pool() {
        let f = factory();
        let pool = test_pool(0);
        let a = f.create(easy_work(1, false), Arc::clone(&pool), 0);
        let b = f.create(easy_work(2, false), Arc::clone(&pool), 0);
        assert_eq!(b.id(), a.id() + 1);
        assert_eq!(pool.active_work(), 2);
        drop(a);
        assert_eq!(pool.active_work(), 1);
        drop(b);
        assert!(pool.is_idle());
    }

    #[test]
    fn clones_share_the_block_but_not_the_cursor() {
        let f = factory();
        let pool = test_pool(0);
        let mut base = f.create(easy_work(3, true), Arc::clone(&pool), 7);
        base.advance(999);

        let mut seed = base.roll_seed();
        let clone = f.clone_rolled(&mut seed, 7).expect("rollable");
        assert!(Arc::ptr_eq(base.template(), clone.template()));
        assert_ne!(clone.id(), base.id());
        assert_eq!(clone.cursor(), 0);
        assert_eq!(base.cursor(), 1000);
        assert!(clone.is_clone() && !base.is_clone());
        assert!(base.is_cloned());
        assert_eq!(clone.epoch(), 7);

        let base_ntime = hash::read_u32_le(&base.data(), NTIME_OFFSET);
        let clone_ntime = hash::read_u32_le(&clone.data(), NTIME_OFFSET);
        assert_eq!(clone_ntime, base_ntime.wrapping_add(1));
        assert_eq!(pool.active_work(), 2);
    }

    #[test]
    fn rolling_respects_permission_budget_and_epoch() {
        let f = factory();
        let pool = test_pool(0);

        let fixed = f.create(easy_work(4, false), Arc::clone(&pool), 0);
        assert!(f.clone_rolled(&mut fixed.roll_seed(), 0).is_none());

        let rollable = f.create(easy_work(5, true), Arc::clone(&pool), 0);
        let mut seed = rollable.roll_seed();
        assert!(f.clone_rolled(&mut seed, 1).is_none());
        assert!(f.clone_rolled(&mut seed, 0).is_some());
        assert!(f.clone_rolled(&mut seed, 0).is_some());
        assert!(f.clone_rolled(&mut seed, 0).is_none());
        assert_eq!(seed.rolls(), 2);
    }

    #[test]
    fn cursor_tracks_exhaustion() {
        let f = factory();
        let mut unit = f.create(easy_work(6, false), test_pool(0), 0);
        assert_eq!(unit.remaining(), 1 << 32);
        unit.advance(10);
        assert_eq!(unit.cursor(), 11);
        unit.advance(3);
        assert_eq!(unit.cursor(), 11);
        unit.advance(u32::MAX);
        assert!(unit.is_exhausted());
        assert_eq!(unit.remaining(), 0);
    }

    #[test]
    fn candidate_hash_matches_full_double_hash() {
        let f = factory();
        let mut seed_unit = f.create(easy_work(8, true), test_pool(0), 0).roll_seed();
        let unit = f.clone_rolled(&mut seed_unit, 0).unwrap();
        let cand = unit.candidate(0xdead_beef, 0);
        let data = cand.data();
        assert_eq!(hash::read_u32_le(&data, NONCE_OFFSET), 0xdead_beef);
        assert_eq!(cand.hash(), hash::sha256d(&data[..HEADER_LEN]));
    }
}
