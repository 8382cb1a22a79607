//! OpenCL backend.

use std::sync::Mutex;

use ocl::{Buffer, Context, Kernel, Platform, Program, Queue};

use crate::cl_kernels::SHA256D_SEARCH;
use crate::config::Config;
use crate::device::Device;
use crate::driver::{DeviceDriver, DeviceError, DeviceInfo, DeviceThread, ScanResult};
use crate::hash::{self, TAIL_NONCE_OFFSET};
use crate::sync::lock;
use crate::work::WorkUnit;

/// Nonces per kernel launch.
const GPU_BATCH: u32 = 1 << 24;
const THREADS_PER_GPU: usize = 2;
const NO_HIT: u32 = u32::MAX;

fn cl_err(e: ocl::Error) -> DeviceError {
    DeviceError::Scan(e.to_string())
}

#[derive(Default)]
pub struct GpuDriver {
    detected: Mutex<Vec<(String, ocl::Device)>>,
}

impl GpuDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, device: &Device) -> Result<ocl::Device, DeviceError> {
        lock(&self.detected)
            .iter()
            .find(|(name, _)| name == device.name())
            .map(|(_, d)| *d)
            .ok_or_else(|| DeviceError::Gone(device.name().to_string()))
    }
}

impl DeviceDriver for GpuDriver {
    fn name(&self) -> &'static str {
        "opencl"
    }

    fn detect(&self, config: &Config) -> Vec<DeviceInfo> {
        if !config.gpu_enabled {
            return Vec::new();
        }
        let platform = Platform::default();
        let devices = match ocl::Device::list(platform, Some(ocl::flags::DEVICE_TYPE_GPU)) {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!(error = %e, "OpenCL device listing failed");
                return Vec::new();
            }
        };

        let mut detected = lock(&self.detected);
        detected.clear();
        devices
            .into_iter()
            .enumerate()
            .map(|(idx, dev)| {
                let model = dev.name().unwrap_or_else(|_| "GPU".to_string());
                let name = format!("{model} #{idx}");
                detected.push((name.clone(), dev));
                DeviceInfo {
                    name,
                    threads: THREADS_PER_GPU,
                }
            })
            .collect()
    }

    fn reinit_device(&self, device: &Device) -> Result<(), DeviceError> {
        self.lookup(device).map(|_| ())
    }

    fn thread_prepare(&self, device: &Device, _thr_id: usize) -> Result<Box<dyn DeviceThread>, DeviceError> {
        let dev = self.lookup(device)?;
        let init = |e: ocl::Error| DeviceError::Init(e.to_string());
        let ctx = Context::builder()
            .platform(Platform::default())
            .devices(dev)
            .build()
            .map_err(init)?;
        let q = Queue::new(&ctx, dev, None).map_err(init)?;
        let prog = Program::builder().src(SHA256D_SEARCH).devices(dev).build(&ctx).map_err(init)?;
        let midstate = Buffer::<u32>::builder().queue(q.clone()).len(8).build().map_err(init)?;
        let tail = Buffer::<u32>::builder().queue(q.clone()).len(16).build().map_err(init)?;
        let found = Buffer::<u32>::builder().queue(q.clone()).len(1).build().map_err(init)?;
        Ok(Box::new(GpuThread {
            _ctx: ctx,
            q,
            prog,
            midstate,
            tail,
            found,
        }))
    }
}

struct GpuThread {
    _ctx: Context,
    q: Queue,
    prog: Program,
    midstate: Buffer<u32>,
    tail: Buffer<u32>,
    found: Buffer<u32>,
}

impl DeviceThread for GpuThread {
    fn can_limit_work(&self) -> u32 {
        GPU_BATCH
    }

    fn prepare_work(&mut self, unit: &mut WorkUnit) -> Result<(), DeviceError> {
        let tail = unit.tail();
        let words: Vec<u32> = tail
            .chunks_exact(4)
            .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        self.midstate.write(&unit.midstate()[..]).enq().map_err(cl_err)?;
        self.tail.write(&words).enq().map_err(cl_err)?;
        Ok(())
    }

    fn scanhash(&mut self, unit: &WorkUnit, max_nonce: u32) -> Result<ScanResult, DeviceError> {
        let start = u32::try_from(unit.cursor())
            .map_err(|_| DeviceError::Scan(format!("unit {} has no nonces left", unit.id())))?;
        if start > max_nonce {
            return Err(DeviceError::Scan(format!("start {start} past bound {max_nonce}")));
        }
        let count = (max_nonce - start) as usize + 1;

        self.found.write(&[NO_HIT][..]).enq().map_err(cl_err)?;
        let kernel = Kernel::builder()
            .program(&self.prog)
            .name("search")
            .queue(self.q.clone())
            .global_work_size(count)
            .arg(&self.midstate)
            .arg(&self.tail)
            .arg(&start)
            .arg(&self.found)
            .build()
            .map_err(cl_err)?;
        unsafe {
            kernel.enq().map_err(cl_err)?;
        }
        self.q.finish().map_err(cl_err)?;

        let mut hit = [NO_HIT];
        self.found.read(&mut hit[..]).enq().map_err(cl_err)?;
        let hit = hit[0];
        if hit < start || hit > max_nonce {
            return Ok(ScanResult { found: None, last_nonce: max_nonce });
        }

        // The kernel only filters on the top word; shares below target are dropped here.
        let mut tail = unit.tail();
        hash::write_u32_le(&mut tail, TAIL_NONCE_OFFSET, hit);
        let digest = hash::hash_from_midstate(unit.midstate(), &tail);
        let top_clear = digest[28..].iter().all(|&b| b == 0);
        if top_clear && !hash::meets_target(&digest, unit.target()) {
            return Ok(ScanResult { found: None, last_nonce: hit });
        }
        if hit == NO_HIT && !top_clear {
            return Ok(ScanResult { found: None, last_nonce: max_nonce });
        }
        Ok(ScanResult { found: Some(hit), last_nonce: hit })
    }

    fn free_work(&mut self, _unit: &WorkUnit) {
        let _ = self.q.finish();
    }
}
