#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use hashmill::config::Config;
use hashmill::hash::{DATA_LEN, HEADER_LEN, NBITS_OFFSET, NTIME_OFFSET, PREV_HASH_OFFSET};
use hashmill::job_source::{JobSource, PoolError, SubmitResponse};
use hashmill::pool::PoolCredentials;
use hashmill::work::RawWork;

pub fn config(pools: usize, cpu_threads: usize) -> Config {
    Config {
        pools: (0..pools)
            .map(|i| PoolCredentials {
                url: format!("http://pool{i}.test:8332"),
                user: format!("worker{i}"),
                pass: "x".into(),
            })
            .collect(),
        cpu_threads,
        scan_slice: 1 << 12,
        pop_timeout_ms: 20,
        retry_delay_ms: 5,
        max_retries: 1,
        shutdown_timeout_ms: 3_000,
        ..Config::default()
    }
}

/// Work whose target every hash meets.
pub fn easy_work() -> RawWork {
    let mut header = [0u8; HEADER_LEN];
    header[0] = 2;
    header[PREV_HASH_OFFSET..PREV_HASH_OFFSET + 32].fill(0x11);
    header[36..68].fill(0x22);
    header[NTIME_OFFSET..NTIME_OFFSET + 4].copy_from_slice(&0x5100_0000u32.to_le_bytes());
    header[NBITS_OFFSET..NBITS_OFFSET + 4].copy_from_slice(&0x1d00_ffffu32.to_le_bytes());
    RawWork::from_header(&header, [0xff; 32], false)
}

/// Serves the same work forever (or fails every fetch) and accepts every share.
pub struct StaticSource {
    work: Option<RawWork>,
    pub fetches: AtomicUsize,
    pub submits: AtomicUsize,
}

impl StaticSource {
    pub fn new(work: Option<RawWork>) -> Self {
        Self {
            work,
            fetches: AtomicUsize::new(0),
            submits: AtomicUsize::new(0),
        }
    }
}

impl JobSource for StaticSource {
    fn fetch(&self, _pool: &PoolCredentials) -> Result<RawWork, PoolError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.work.clone().ok_or(PoolError::Timeout)
    }

    fn submit(&self, _pool: &PoolCredentials, _data: &[u8; DATA_LEN], _nonce: u32) -> Result<SubmitResponse, PoolError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        Ok(SubmitResponse::Accepted)
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
