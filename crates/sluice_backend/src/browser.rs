//! Browser backend
//!
//! The page owns the GPU adapter and device; this backend only wraps them,
//! caches what the browser is willing to report and polls its hints on the
//! page's own event loop. Values are approximate.

use crate::config::BackendConfig;
use crate::telemetry::providers::{BrowserHintsProvider, HintSource, NavigatorSnapshot};
use crate::telemetry::{CooperativeRuntime, ProviderKind, ScheduledTask, Scheduler, TelemetryState};
use crate::{log_device_summary, Backend, DeviceCapabilities, PhysicalDeviceType};
use std::sync::Arc;
use tracing::{info, warn};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Capability cache from the adapter label and the navigator hints.
///
/// Browsers hide memory interop entirely and round device memory to a
/// power of two, so most of this is a coarse guess.
pub fn describe_browser_device(
    name: &str,
    device_type: PhysicalDeviceType,
    hints: &NavigatorSnapshot,
) -> DeviceCapabilities {
    let device_name = if name.is_empty() { "WebGPU" } else { name };
    DeviceCapabilities {
        device_name: device_name.to_string(),
        device_type,
        physical_memory: hints.device_memory_gb.map_or(0, |gb| (gb * GIB) as u64),
        processor_count: hints.hardware_concurrency.map_or(1, |cores| cores.max(1) as usize),
        ..DeviceCapabilities::default()
    }
}

/// Backend whose telemetry is pumped by a [`Scheduler`] instead of a thread.
pub struct BrowserBackend<S: Scheduler> {
    config: BackendConfig,
    capabilities: DeviceCapabilities,
    telemetry: Arc<TelemetryState>,
    runtime: CooperativeRuntime<S>,
}

impl<S: Scheduler> BrowserBackend<S> {
    pub fn new<H>(config: BackendConfig, capabilities: DeviceCapabilities, scheduler: S, hints: H) -> Self
    where
        H: HintSource + 'static,
    {
        let telemetry = Arc::new(TelemetryState::new(
            ProviderKind::Browser,
            BrowserHintsProvider::<H>::NAME,
        ));
        let mut runtime = CooperativeRuntime::new(
            Arc::clone(&telemetry),
            Box::new(BrowserHintsProvider::new(hints)),
            config.telemetry_interval,
            scheduler,
        );
        if let Err(err) = runtime.start() {
            warn!("Telemetry polling disabled: {err}");
        }

        let backend = Self {
            config,
            capabilities,
            telemetry,
            runtime,
        };
        warn!("Browser device values are approximate.");
        log_device_summary(&backend, false);
        info!("Telemetry provider: {}", backend.telemetry.provider_name());
        backend
    }

    pub fn is_polling(&self) -> bool {
        self.runtime.is_running()
    }
}

impl<S: Scheduler> Backend for BrowserBackend<S> {
    fn label(&self) -> &'static str {
        "WebGPU"
    }

    fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn telemetry(&self) -> &TelemetryState {
        &self.telemetry
    }
}

impl<S: Scheduler> Drop for BrowserBackend<S> {
    fn drop(&mut self) {
        self.runtime.stop();
    }
}

#[cfg(target_arch = "wasm32")]
pub use web::WebGpuBackend;

#[cfg(target_arch = "wasm32")]
mod web {
    use super::*;
    use crate::telemetry::providers::browser::Navigator;
    use crate::telemetry::runtime::TimeoutScheduler;
    use tracing::error;

    /// Browser backend over the adapter and device the page acquired.
    pub struct WebGpuBackend {
        backend: BrowserBackend<TimeoutScheduler>,
        adapter: wgpu::Adapter,
        device: wgpu::Device,
        queue: wgpu::Queue,
    }

    impl WebGpuBackend {
        pub fn new(config: BackendConfig, adapter: wgpu::Adapter, device: wgpu::Device, queue: wgpu::Queue) -> Self {
            device.on_uncaptured_error(Box::new(|err| error!("[WebGPU] {err}")));

            let info = adapter.get_info();
            let capabilities = describe_browser_device(&info.name, info.device_type.into(), &Navigator.snapshot());
            let backend = BrowserBackend::new(config, capabilities, TimeoutScheduler, Navigator);
            Self {
                backend,
                adapter,
                device,
                queue,
            }
        }

        pub fn adapter(&self) -> &wgpu::Adapter {
            &self.adapter
        }

        pub fn device(&self) -> &wgpu::Device {
            &self.device
        }

        pub fn queue(&self) -> &wgpu::Queue {
            &self.queue
        }
    }

    impl Backend for WebGpuBackend {
        fn label(&self) -> &'static str {
            self.backend.label()
        }

        fn config(&self) -> &BackendConfig {
            self.backend.config()
        }

        fn capabilities(&self) -> &DeviceCapabilities {
            self.backend.capabilities()
        }

        fn telemetry(&self) -> &TelemetryState {
            self.backend.telemetry()
        }
    }
}
