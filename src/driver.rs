//! Device backends.
//!
//! A backend is a [`DeviceDriver`] (one per kind of hardware) that hands out
//! a [`DeviceThread`] for every scanning thread of every device it detected.
//! The worker loop only ever talks to these two traits.

use thiserror::Error;

use crate::config::Config;
use crate::device::Device;
use crate::work::WorkUnit;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device initialisation failed: {0}")]
    Init(String),
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("device is gone: {0}")]
    Gone(String),
}

/// What detection found: one entry becomes one [`Device`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub threads: usize,
}

/// Outcome of one `scanhash` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanResult {
    /// Nonce whose hash passed the backend's filter. The host re-verifies.
    pub found: Option<u32>,
    /// Last nonce examined; the next call resumes after it.
    pub last_nonce: u32,
}

pub trait DeviceDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, config: &Config) -> Vec<DeviceInfo>;

    /// Brings a dead device back. Default: nothing to reset.
    fn reinit_device(&self, _device: &Device) -> Result<(), DeviceError> {
        Ok(())
    }

    fn thread_prepare(&self, device: &Device, thr_id: usize) -> Result<Box<dyn DeviceThread>, DeviceError>;
}

/// Per-thread scanning state.
pub trait DeviceThread: Send {
    fn thread_init(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Most nonces one `scanhash` call should cover.
    fn can_limit_work(&self) -> u32 {
        u32::MAX
    }

    fn prepare_work(&mut self, _unit: &mut WorkUnit) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Scans `unit` from its cursor up to and including `max_nonce`, stopping
    /// at the first hit. Does not move the cursor.
    fn scanhash(&mut self, unit: &WorkUnit, max_nonce: u32) -> Result<ScanResult, DeviceError>;

    fn free_work(&mut self, _unit: &WorkUnit) {}

    fn thread_shutdown(&mut self) {}
}
