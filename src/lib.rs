pub mod epoch;
pub mod hash;
pub mod sync;
pub mod health;
pub mod retry;
pub mod work;
pub mod queue;
pub mod pool;
pub mod strategy;
pub mod pool_manager;
pub mod job_source;
pub mod driver;
pub mod device;
pub mod cpu;
#[cfg(feature = "opencl")]
pub mod cl_kernels;
#[cfg(feature = "opencl")]
pub mod gpu;
pub mod config;
pub mod metrics;
pub mod prometheus_metrics;
pub mod submit;
pub mod worker;
pub mod controller;
pub mod miner;
pub mod api;
pub mod server;

#[cfg(test)]
mod test_utils;
