//! Sluice Heterogeneous Backend
//!
//! Device selection, capability negotiation, shared resource bootstrap and
//! health telemetry for the compute/render engine.

pub mod bootstrap;
pub mod browser;
pub mod caps;
pub mod config;
pub mod driver;
pub mod error;
pub mod native;
pub mod select;
pub mod telemetry;

pub use bytemuck;
pub use wgpu;

pub use browser::BrowserBackend;
pub use config::BackendConfig;
pub use error::{BackendError, DriverError};
pub use native::NativeBackend;
pub use telemetry::{ProviderKind, TelemetryState};

use std::fmt;

/// Backend version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The backend compiled for this target.
#[cfg(not(target_arch = "wasm32"))]
pub type PlatformBackend = NativeBackend<driver::wgpu::WgpuDriver>;
#[cfg(target_arch = "wasm32")]
pub type PlatformBackend = browser::WebGpuBackend;

/// Physical device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhysicalDeviceType {
    Integrated,
    Discrete,
    Other,
    #[default]
    Unknown,
}

impl fmt::Display for PhysicalDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PhysicalDeviceType::Integrated => "INTEGRATED",
            PhysicalDeviceType::Discrete => "DISCRETE",
            PhysicalDeviceType::Other => "OTHER",
            PhysicalDeviceType::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

impl From<wgpu::DeviceType> for PhysicalDeviceType {
    fn from(kind: wgpu::DeviceType) -> Self {
        match kind {
            wgpu::DeviceType::IntegratedGpu => PhysicalDeviceType::Integrated,
            wgpu::DeviceType::DiscreteGpu => PhysicalDeviceType::Discrete,
            wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Cpu | wgpu::DeviceType::Other => {
                PhysicalDeviceType::Other
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Decodes the packed `variant:3 | major:7 | minor:10 | patch:12` layout.
    pub const fn from_packed(packed: u32) -> Self {
        Self {
            major: (packed >> 22) & 0x7f,
            minor: (packed >> 12) & 0x3ff,
            patch: packed & 0xfff,
        }
    }

    /// Reads the leading `major.minor[.patch]` out of a free-form version string.
    pub fn parse_leading(text: &str) -> Option<Self> {
        let start = text.find(|c: char| c.is_ascii_digit())?;
        let mut parts = text[start..]
            .split(|c: char| !c.is_ascii_digit())
            .take(3)
            .map(|part| part.parse::<u32>().ok());
        let major = parts.next()??;
        let minor = parts.next().flatten()?;
        let patch = parts.next().flatten().unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Device facts captured once after selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub device_name: String,
    pub api_version: ApiVersion,
    pub device_type: PhysicalDeviceType,
    pub unified_memory: bool,
    /// Sum of all device-local heaps, in bytes.
    pub physical_memory: u64,
    pub processor_count: usize,
    pub can_import_device_memory: bool,
    pub can_export_device_memory: bool,
    pub can_import_host_memory: bool,
}

/// Query surface shared by every backend.
pub trait Backend {
    fn label(&self) -> &'static str;
    fn config(&self) -> &BackendConfig;
    fn capabilities(&self) -> &DeviceCapabilities;
    fn telemetry(&self) -> &TelemetryState;

    fn device_name(&self) -> &str {
        &self.capabilities().device_name
    }

    fn api_version(&self) -> String {
        self.capabilities().api_version.to_string()
    }

    fn physical_device_type(&self) -> PhysicalDeviceType {
        self.capabilities().device_type
    }

    fn has_unified_memory(&self) -> bool {
        self.capabilities().unified_memory
    }

    fn physical_memory(&self) -> u64 {
        self.capabilities().physical_memory
    }

    fn total_processor_count(&self) -> usize {
        self.capabilities().processor_count
    }

    fn can_import_device_memory(&self) -> bool {
        self.capabilities().can_import_device_memory
    }

    fn can_export_device_memory(&self) -> bool {
        self.capabilities().can_export_device_memory
    }

    fn can_import_host_memory(&self) -> bool {
        self.capabilities().can_import_host_memory
    }

    /// Live; updated by the telemetry runtime.
    fn low_power_status(&self) -> bool {
        self.telemetry().low_power()
    }

    /// Live thermal bucket, 0 (nominal) to 3 (critical).
    fn thermal_state(&self) -> u8 {
        self.telemetry().thermal_bucket()
    }

    fn telemetry_provider(&self) -> &str {
        self.telemetry().provider_name()
    }

    /// Sample count after clamping to device support.
    fn multisampling(&self) -> u32 {
        self.config().multisampling
    }
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

fn yes_no(value: bool) -> &'static str {
    if value {
        "YES"
    } else {
        "NO"
    }
}

/// Human-readable device summary. Not a stable format.
pub fn log_device_summary(backend: &impl Backend, show_interop: bool) {
    tracing::info!("-----------------------------------------------------");
    tracing::info!("Sluice Heterogeneous Backend [{}]", backend.label());
    tracing::info!("-----------------------------------------------------");
    tracing::info!("Device Name:      {}", backend.device_name());
    tracing::info!("Device Type:      {}", backend.physical_device_type());
    tracing::info!("API Version:      {}", backend.api_version());
    tracing::info!("Unified Memory:   {}", yes_no(backend.has_unified_memory()));
    tracing::info!("Processor Count:  {}", backend.total_processor_count());
    tracing::info!("Device Memory:    {:.2} GB", backend.physical_memory() as f64 / GIB);
    tracing::info!(
        "Staging Buffer:   {:.2} MB",
        backend.config().staging_buffer_size as f64 / MIB
    );
    tracing::info!("Multisampling:    {}x", backend.multisampling());
    tracing::info!("Telemetry:        {}", backend.telemetry_provider());
    if show_interop {
        tracing::info!("Interoperability:");
        tracing::info!("  - Can Import Device Memory: {}", yes_no(backend.can_import_device_memory()));
        tracing::info!("  - Can Export Device Memory: {}", yes_no(backend.can_export_device_memory()));
        tracing::info!("  - Can Import Host Memory:   {}", yes_no(backend.can_import_host_memory()));
    }
    tracing::info!("-----------------------------------------------------");
}
