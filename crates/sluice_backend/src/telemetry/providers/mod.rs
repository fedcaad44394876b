//! Concrete telemetry providers.

pub mod browser;
pub mod nvml;
pub mod tooling;

pub use browser::{BrowserHintsProvider, HintSource, NavigatorSnapshot};
pub use nvml::{sample_sensors, NvmlProvider, NvmlSensors};
pub use tooling::ToolingProvider;
