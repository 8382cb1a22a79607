use std::sync::Arc;

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

use hashmill::config::Config;
use hashmill::cpu::CpuDriver;
use hashmill::driver::DeviceDriver;
use hashmill::job_source::{GetworkClient, JobSource};
use hashmill::miner::Miner;
use hashmill::server::{ApiServer, MetricsServer};

fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    config.validate()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let source: Arc<dyn JobSource> = Arc::new(GetworkClient::new(config.fetch_timeout())?);
    let mut drivers: Vec<Arc<dyn DeviceDriver>> = vec![Arc::new(CpuDriver::new(config.cpu_algo))];
    #[cfg(feature = "opencl")]
    drivers.push(Arc::new(hashmill::gpu::GpuDriver::new()));
    #[cfg(not(feature = "opencl"))]
    if config.gpu_enabled {
        tracing::warn!("GPU_ENABLED is set but this build has no OpenCL support");
    }

    let miner = Arc::new(Miner::new(config.clone(), source, drivers)?);
    miner.start()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(serve(Arc::clone(&miner), &config))?;

    miner.shutdown();
    Ok(())
}

/// Runs the listeners until ctrl-c or an API `quit`.
async fn serve(miner: Arc<Miner>, config: &Config) -> anyhow::Result<()> {
    if config.api_listen {
        let api = ApiServer::bind(Arc::clone(&miner), config.api_port, config.api_network)
            .await
            .with_context(|| format!("binding API port {}", config.api_port))?;
        tokio::spawn(api.serve());
    }
    if config.metrics_enabled {
        let metrics = MetricsServer::bind(Arc::clone(&miner), config.metrics_port)
            .await
            .with_context(|| format!("binding metrics port {}", config.metrics_port))?;
        tokio::spawn(metrics.serve());
    }

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for ctrl-c")?;
            tracing::info!("interrupted");
        }
        _ = miner.quit_requested() => tracing::info!("quit requested"),
    }
    Ok(())
}
