//! Fixtures shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::device::Device;
use crate::driver::{DeviceDriver, DeviceError, DeviceInfo, DeviceThread, ScanResult};
use crate::hash::{DATA_LEN, HEADER_LEN, NBITS_OFFSET, NTIME_OFFSET, PREV_HASH_OFFSET};
use crate::job_source::{JobSource, PoolError, SubmitResponse};
use crate::pool::{Pool, PoolCredentials};
use crate::work::{RawWork, WorkUnit};

pub fn creds(id: usize) -> PoolCredentials {
    PoolCredentials {
        url: format!("http://pool{id}.test:8332"),
        user: format!("worker{id}"),
        pass: "x".into(),
    }
}

pub fn test_pool(id: usize) -> Arc<Pool> {
    Arc::new(Pool::new(id, creds(id), id, 2, 4))
}

pub fn test_device(id: usize, sick_after: u32, dead_after: u32) -> Device {
    let info = DeviceInfo {
        name: format!("mock{id}"),
        threads: 2,
    };
    Device::new(id, info, Arc::new(MockDriver::new(1)), sick_after, dead_after)
}

fn header(seed: u8) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = 1;
    header[PREV_HASH_OFFSET..PREV_HASH_OFFSET + 32].fill(seed);
    header[36..68].fill(seed.wrapping_mul(31).wrapping_add(7));
    header[NTIME_OFFSET..NTIME_OFFSET + 4].copy_from_slice(&0x5000_0000u32.to_le_bytes());
    header[NBITS_OFFSET..NBITS_OFFSET + 4].copy_from_slice(&0x1d00_ffffu32.to_le_bytes());
    header
}

/// Every hash meets the target.
pub fn easy_work(seed: u8, roll_ntime: bool) -> RawWork {
    RawWork::from_header(&header(seed), [0xff; 32], roll_ntime)
}

/// No hash meets the target.
pub fn hard_work(seed: u8) -> RawWork {
    RawWork::from_header(&header(seed), [0; 32], false)
}

pub fn test_config(pools: usize) -> Config {
    Config {
        pools: (0..pools).map(creds).collect(),
        cpu_threads: 0,
        queue_depth: 2,
        scan_slice: 1 << 30,
        pop_timeout_ms: 20,
        retry_delay_ms: 5,
        max_retries: 1,
        health_check_interval_ms: 60_000,
        shutdown_timeout_ms: 2_000,
        ..Config::default()
    }
}

/// Scripted job source. Falls back to `work` (if any) once the fetch
/// script is used up, and accepts every share once the submit script is.
#[derive(Default)]
pub struct MockSource {
    fetch_script: Mutex<VecDeque<Result<RawWork, PoolError>>>,
    submit_script: Mutex<VecDeque<Result<SubmitResponse, PoolError>>>,
    work: Option<RawWork>,
    fetches: AtomicUsize,
    submits: AtomicUsize,
}

impl MockSource {
    pub fn with_easy_work() -> Self {
        Self {
            work: Some(easy_work(1, false)),
            ..Self::default()
        }
    }

    pub fn push_fetch(&self, result: Result<RawWork, PoolError>) {
        self.fetch_script.lock().unwrap().push_back(result);
    }

    pub fn push_submit(&self, result: Result<SubmitResponse, PoolError>) {
        self.submit_script.lock().unwrap().push_back(result);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

impl JobSource for MockSource {
    fn fetch(&self, _pool: &PoolCredentials) -> Result<RawWork, PoolError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.fetch_script.lock().unwrap().pop_front() {
            return result;
        }
        self.work
            .clone()
            .ok_or_else(|| PoolError::Connection("no work scripted".into()))
    }

    fn submit(&self, _pool: &PoolCredentials, _data: &[u8; DATA_LEN], _nonce: u32) -> Result<SubmitResponse, PoolError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        self.submit_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(SubmitResponse::Accepted))
    }
}

/// Fault injection shared by a [`MockDriver`] and its threads.
#[derive(Debug, Default)]
pub struct MockControl {
    /// While set, `scanhash` does not return.
    pub stuck: AtomicBool,
    /// How many upcoming `prepare_work` calls fail.
    pub failing_prepares: AtomicUsize,
    pub scans: AtomicUsize,
    pub reinits: AtomicUsize,
}

/// Detects `devices` single-thread devices that scan without finding anything.
pub struct MockDriver {
    devices: usize,
    control: Arc<MockControl>,
}

impl MockDriver {
    pub fn new(devices: usize) -> Self {
        Self::with_control(devices, Arc::default())
    }

    pub fn with_control(devices: usize, control: Arc<MockControl>) -> Self {
        Self { devices, control }
    }
}

impl DeviceDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn detect(&self, _config: &Config) -> Vec<DeviceInfo> {
        (0..self.devices)
            .map(|i| DeviceInfo {
                name: format!("mock{i}"),
                threads: 1,
            })
            .collect()
    }

    fn reinit_device(&self, _device: &Device) -> Result<(), DeviceError> {
        self.control.reinits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn thread_prepare(&self, _device: &Device, _thr_id: usize) -> Result<Box<dyn DeviceThread>, DeviceError> {
        Ok(Box::new(MockThread {
            control: Arc::clone(&self.control),
        }))
    }
}

struct MockThread {
    control: Arc<MockControl>,
}

impl DeviceThread for MockThread {
    fn prepare_work(&mut self, _unit: &mut WorkUnit) -> Result<(), DeviceError> {
        let fail = self
            .control
            .failing_prepares
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(DeviceError::Scan("injected fault".into()));
        }
        Ok(())
    }

    fn scanhash(&mut self, _unit: &WorkUnit, max_nonce: u32) -> Result<ScanResult, DeviceError> {
        self.control.scans.fetch_add(1, Ordering::SeqCst);
        while self.control.stuck.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(1));
        Ok(ScanResult {
            found: None,
            last_nonce: max_nonce,
        })
    }
}
