//! Sluice Runtime
//!
//! Brings the platform backend up, reports device health for a few
//! telemetry intervals and shuts it down again.

use anyhow::{Context, Result};
use sluice_backend::driver::wgpu::WgpuDriver;
use sluice_backend::{Backend, PlatformBackend};
use sluice_services::Settings;

const REPORT_INTERVALS: u32 = 3;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    tracing::info!("Sluice v{}", sluice_backend::VERSION);
    let settings = Settings::from_env().context("loading settings")?;
    let interval = settings.backend.telemetry_interval;

    let backend = PlatformBackend::new(settings.backend, WgpuDriver::new()).context("starting backend")?;

    for _ in 0..REPORT_INTERVALS {
        std::thread::sleep(interval);
        let telemetry = backend.telemetry();
        tracing::info!(
            "Thermal state {}, low power {}, {} samples (mean {:?})",
            backend.thermal_state(),
            backend.low_power_status(),
            telemetry.sample_count(),
            telemetry.mean_sample_latency(),
        );
    }

    drop(backend);
    tracing::info!("Backend shut down cleanly");
    Ok(())
}
