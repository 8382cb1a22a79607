use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::device::Device;
use crate::driver::{DeviceDriver, DeviceError, DeviceInfo, DeviceThread, ScanResult};
use crate::hash::{self, HEADER_LEN, NONCE_OFFSET, TAIL_NONCE_OFFSET};
use crate::work::WorkUnit;

/// Nonces per scan call; keeps epoch checks frequent on slow cores.
const CPU_SCAN_CHUNK: u32 = 1 << 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuAlgo {
    /// Full double SHA-256 of the 80-byte header for every nonce.
    C,
    /// Second block compressed from the cached midstate.
    #[default]
    Midstate,
}

impl std::fmt::Display for CpuAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CpuAlgo::C => write!(f, "c"),
            CpuAlgo::Midstate => write!(f, "midstate"),
        }
    }
}

impl FromStr for CpuAlgo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" => Ok(CpuAlgo::C),
            "midstate" | "auto" => Ok(CpuAlgo::Midstate),
            other => Err(format!("unknown cpu algorithm '{other}'")),
        }
    }
}

pub struct CpuDriver {
    algo: CpuAlgo,
}

impl CpuDriver {
    pub fn new(algo: CpuAlgo) -> Self {
        Self { algo }
    }
}

impl DeviceDriver for CpuDriver {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn detect(&self, config: &Config) -> Vec<DeviceInfo> {
        if config.cpu_threads == 0 {
            return Vec::new();
        }
        vec![DeviceInfo {
            name: format!("CPU ({})", self.algo),
            threads: config.cpu_threads,
        }]
    }

    fn thread_prepare(&self, _device: &Device, _thr_id: usize) -> Result<Box<dyn DeviceThread>, DeviceError> {
        Ok(Box::new(CpuThread { algo: self.algo }))
    }
}

struct CpuThread {
    algo: CpuAlgo,
}

impl DeviceThread for CpuThread {
    fn can_limit_work(&self) -> u32 {
        CPU_SCAN_CHUNK
    }

    fn scanhash(&mut self, unit: &WorkUnit, max_nonce: u32) -> Result<ScanResult, DeviceError> {
        let start = u32::try_from(unit.cursor())
            .map_err(|_| DeviceError::Scan(format!("unit {} has no nonces left", unit.id())))?;
        if start > max_nonce {
            return Err(DeviceError::Scan(format!("start {start} past bound {max_nonce}")));
        }
        let found = match self.algo {
            CpuAlgo::C => scan_c(unit, start, max_nonce),
            CpuAlgo::Midstate => scan_midstate(unit, start, max_nonce),
        };
        Ok(match found {
            Some(nonce) => ScanResult { found: Some(nonce), last_nonce: nonce },
            None => ScanResult { found: None, last_nonce: max_nonce },
        })
    }
}

fn scan_c(unit: &WorkUnit, start: u32, end: u32) -> Option<u32> {
    let mut data = unit.data();
    let target = unit.target();
    (start..=end).find(|&nonce| {
        hash::write_u32_le(&mut data, NONCE_OFFSET, nonce);
        hash::meets_target(&hash::sha256d(&data[..HEADER_LEN]), target)
    })
}

fn scan_midstate(unit: &WorkUnit, start: u32, end: u32) -> Option<u32> {
    let midstate = unit.midstate();
    let mut tail = unit.tail();
    let target = unit.target();
    (start..=end).find(|&nonce| {
        hash::write_u32_le(&mut tail, TAIL_NONCE_OFFSET, nonce);
        hash::meets_target(&hash::hash_from_midstate(midstate, &tail), target)
    })
}
