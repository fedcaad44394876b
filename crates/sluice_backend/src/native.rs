//! Native backend facade
//!
//! Construction runs: instance negotiation, device selection, device
//! negotiation, resource bootstrap, telemetry selection, telemetry start.
//! `Drop` unwinds it in reverse and always stops telemetry first.

use crate::bootstrap::{bootstrap, negotiate_sample_count, BootstrapRequest, Queues, Resources, StagingBuffer};
use crate::caps::{
    device_request, instance_request, negotiate_scope, negotiate_validation, CapabilitySet, Feature, GrantedScope,
};
use crate::config::BackendConfig;
use crate::driver::{Driver, InstanceDesc, MemoryProperties, PhysicalDeviceProperties};
use crate::error::{BackendError, DriverError};
use crate::select::{select_device, DeviceCandidate};
use crate::telemetry::providers::nvml::NVIDIA_VENDOR_ID;
use crate::telemetry::providers::{NvmlProvider, ToolingProvider};
use crate::telemetry::{ProviderKind, ScheduledTask, TelemetryProvider, TelemetryState, ThreadedRuntime};
use crate::{log_device_summary, Backend, DeviceCapabilities};
use std::mem::ManuallyDrop;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const APPLICATION_NAME: &str = "Sluice";

/// Fills the capability cache from the selected device.
pub fn describe_device(
    properties: &PhysicalDeviceProperties,
    memory: &MemoryProperties,
    device_scope: &GrantedScope,
) -> DeviceCapabilities {
    let unified_memory = !memory.heaps.is_empty() && memory.heaps.iter().all(|heap| heap.device_local);
    let physical_memory = memory
        .heaps
        .iter()
        .filter(|heap| heap.device_local)
        .map(|heap| heap.size)
        .sum();
    let fd_interop = device_scope.has(Feature::ExternalMemoryFd);
    DeviceCapabilities {
        device_name: properties.name.clone(),
        api_version: properties.api_version,
        device_type: properties.device_type,
        unified_memory,
        physical_memory,
        processor_count: sluice_env::Host::detect().logical_processors,
        can_import_device_memory: fd_interop,
        can_export_device_memory: fd_interop,
        can_import_host_memory: device_scope.has(Feature::ExternalMemoryHost),
    }
}

type BoxedProvider = Box<dyn TelemetryProvider + Send>;

/// First available of: vendor library, tool introspection, nothing.
fn select_telemetry<D: Driver>(
    driver: &D,
    physical: &D::PhysicalDevice,
    properties: &PhysicalDeviceProperties,
    instance_scope: &GrantedScope,
    device_id: usize,
) -> (TelemetryState, Option<BoxedProvider>) {
    if properties.vendor_id == NVIDIA_VENDOR_ID {
        let fallback = u32::try_from(device_id).unwrap_or(u32::MAX);
        if let Some(provider) = NvmlProvider::open(&properties.name, fallback) {
            return (
                TelemetryState::new(ProviderKind::Nvml, NvmlProvider::NAME),
                Some(Box::new(provider)),
            );
        }
    }

    if instance_scope.has(Feature::ToolingInfo) {
        if let Some(query) = driver.tooling_query(physical) {
            return (
                TelemetryState::new(ProviderKind::ToolingInfo, ToolingProvider::NAME),
                Some(Box::new(ToolingProvider::new(query))),
            );
        }
    }

    warn!("Telemetry data is unavailable for '{}'.", properties.name);
    (TelemetryState::unavailable(), None)
}

/// Device-level state produced after the instance exists.
struct Opened<D: Driver> {
    physical: D::PhysicalDevice,
    device_scope: GrantedScope,
    capabilities: DeviceCapabilities,
    properties: PhysicalDeviceProperties,
    resources: Resources<D>,
}

fn open_device<D: Driver>(
    driver: &mut D,
    config: &mut BackendConfig,
    layers: &CapabilitySet,
) -> Result<Opened<D>, BackendError> {
    let physical_devices = driver
        .enumerate_physical_devices()
        .map_err(BackendError::driver("enumerate physical devices"))?;

    let request = device_request(config);
    let candidates = physical_devices
        .into_iter()
        .map(|handle| DeviceCandidate {
            name: driver.properties(&handle).name,
            extensions: driver.device_extensions(&handle),
            queue_families: driver.queue_families(&handle),
            handle,
        })
        .collect();
    let selected = select_device(candidates, &request.required, !config.headless, config.device_id)?;
    let physical = selected.handle;
    debug!("Selected device at enumeration index {}.", selected.enumeration_index);

    let device_scope = negotiate_scope(&request, &driver.device_extensions(&physical))?;
    let properties = driver.properties(&physical);
    let memory = driver.memory_properties(&physical);

    let samples = negotiate_sample_count(
        properties.color_sample_counts & properties.depth_sample_counts,
        config.multisampling,
    );
    config.multisampling = samples.count;

    let capabilities = describe_device(&properties, &memory, &device_scope);
    let resources = bootstrap(
        driver,
        &physical,
        &BootstrapRequest {
            queues: selected.queues,
            extensions: &device_scope.capabilities,
            layers,
            memory: &memory,
            staging_size: config.staging_buffer_size,
        },
    )?;

    Ok(Opened {
        physical,
        device_scope,
        capabilities,
        properties,
        resources,
    })
}

/// Backend over a native GPU/compute API.
pub struct NativeBackend<D: Driver> {
    config: BackendConfig,
    capabilities: DeviceCapabilities,
    instance_scope: GrantedScope,
    device_scope: GrantedScope,
    telemetry: Arc<TelemetryState>,
    runtime: Option<ThreadedRuntime>,
    physical: D::PhysicalDevice,
    resources: ManuallyDrop<Resources<D>>,
    debug_callback: Option<D::DebugCallback>,
    driver: D,
}

impl<D: Driver> NativeBackend<D> {
    /// Brings the backend up. On failure everything created so far is
    /// released and the error is logged once before being returned.
    pub fn new(config: BackendConfig, driver: D) -> Result<Self, BackendError> {
        let label = driver.name();
        info!("[{label}] Initializing backend.");
        Self::bring_up(config, driver).inspect_err(|err| error!("[{label}] Backend initialization failed: {err}"))
    }

    fn bring_up(mut config: BackendConfig, mut driver: D) -> Result<Self, BackendError> {
        let available_layers = driver
            .instance_layers()
            .map_err(BackendError::driver("query instance layers"))?;
        let layers = negotiate_validation(&mut config, &available_layers);

        let available = driver
            .instance_extensions()
            .map_err(BackendError::driver("query instance extensions"))?;
        let instance_scope = negotiate_scope(&instance_request(&config), &available)?;

        let enumerate_portability = instance_scope.has(Feature::PortabilityEnumeration);
        if enumerate_portability {
            debug!("Enabling portability enumeration.");
        }
        driver
            .create_instance(&InstanceDesc {
                application_name: APPLICATION_NAME,
                extensions: instance_scope.capabilities.clone(),
                layers: layers.clone(),
                enumerate_portability,
            })
            .map_err(BackendError::driver("create instance"))?;

        let debug_callback = if config.validation_enabled {
            match driver.create_debug_callback() {
                Ok(callback) => Some(callback),
                Err(err) => {
                    warn!("Couldn't install the debug callback: {err}");
                    None
                }
            }
        } else {
            None
        };

        let opened = match open_device(&mut driver, &mut config, &layers) {
            Ok(opened) => opened,
            Err(err) => {
                if let Some(callback) = debug_callback {
                    driver.destroy_debug_callback(callback);
                }
                driver.destroy_instance();
                return Err(err);
            }
        };

        let (state, provider) = select_telemetry(
            &driver,
            &opened.physical,
            &opened.properties,
            &instance_scope,
            config.device_id,
        );
        let telemetry = Arc::new(state);
        let runtime = provider.map(|provider| {
            let mut runtime = ThreadedRuntime::new(Arc::clone(&telemetry), provider, config.telemetry_interval);
            runtime.prime();
            if let Err(err) = runtime.start() {
                warn!("Telemetry polling disabled: {err}");
            }
            runtime
        });

        let backend = Self {
            config,
            capabilities: opened.capabilities,
            instance_scope,
            device_scope: opened.device_scope,
            telemetry,
            runtime,
            physical: opened.physical,
            resources: ManuallyDrop::new(opened.resources),
            debug_callback,
            driver,
        };
        log_device_summary(&backend, true);
        if backend.telemetry.is_available() {
            info!("Telemetry provider: {}", backend.telemetry.provider_name());
        }
        Ok(backend)
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn physical_device(&self) -> &D::PhysicalDevice {
        &self.physical
    }

    pub fn device(&self) -> &D::Device {
        &self.resources.device
    }

    pub fn queues(&self) -> &Queues<D::Queue> {
        &self.resources.queues
    }

    pub fn descriptor_pool(&self) -> &D::DescriptorPool {
        &self.resources.descriptor_pool
    }

    pub fn staging_buffer(&self) -> &StagingBuffer<D> {
        &self.resources.staging
    }

    pub fn staging_buffer_mut(&mut self) -> &mut StagingBuffer<D> {
        &mut self.resources.staging
    }

    /// Flushes `offset..offset + len` of the staging buffer to the device.
    pub fn flush_staging(&self, offset: u64, len: u64) -> Result<(), BackendError> {
        self.resources
            .staging
            .flush(&self.driver, &self.resources.device, offset, len)
    }

    pub fn command_pool(&self) -> &D::CommandPool {
        &self.resources.command_pool
    }

    pub fn command_buffer(&self) -> &D::CommandBuffer {
        &self.resources.command_buffer
    }

    pub fn fence(&self) -> &D::Fence {
        &self.resources.fence
    }

    pub fn instance_capabilities(&self) -> &GrantedScope {
        &self.instance_scope
    }

    pub fn device_capabilities(&self) -> &GrantedScope {
        &self.device_scope
    }

    /// Records into the shared command buffer, submits and waits.
    pub fn submit_one_shot<F>(&mut self, record: F) -> Result<(), BackendError>
    where
        F: FnOnce(&mut D::CommandBuffer) -> Result<(), DriverError>,
    {
        self.resources.submit_one_shot(&self.driver, record)
    }
}

impl<D: Driver> Backend for NativeBackend<D> {
    fn label(&self) -> &'static str {
        self.driver.name()
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

impl<D: Driver> Drop for NativeBackend<D> {
    fn drop(&mut self) {
        if let Some(mut runtime) = self.runtime.take() {
            runtime.stop();
        }

        // SAFETY: taken exactly once, here, and never touched again.
        let resources = unsafe { ManuallyDrop::take(&mut self.resources) };
        let device = resources.into_device(&self.driver);
        if let Some(callback) = self.debug_callback.take() {
            self.driver.destroy_debug_callback(callback);
        }
        self.driver.destroy_device(device);
        self.driver.destroy_instance();
        debug!("[{}] Backend destroyed.", self.driver.name());
    }
}
