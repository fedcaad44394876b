use crate::caps::Scope;
use thiserror::Error;

/// Failure reported by a native API call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{call} failed: {reason}")]
pub struct DriverError {
    pub call: &'static str,
    pub reason: String,
}

impl DriverError {
    pub fn new(call: &'static str, reason: impl Into<String>) -> Self {
        Self {
            call,
            reason: reason.into(),
        }
    }
}

/// Fatal errors raised while bringing up a backend.
///
/// Degraded conditions (missing optional capabilities, clamped sample
/// counts, telemetry failures) are logged and never surface here.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("required {scope} capabilities are not supported: {}", .missing.join(", "))]
    MissingCapabilities { scope: Scope, missing: Vec<String> },

    #[error("no physical devices found")]
    NoPhysicalDevices,

    #[error("none of the {candidates} physical devices satisfy the extension and queue family requirements")]
    NoSuitableDevices { candidates: usize },

    #[error("requested device index {index} is beyond the {suitable} suitable devices")]
    DeviceIndexOutOfRange { index: usize, suitable: usize },

    #[error("no memory type in {type_bits:#b} has the required properties {required:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        required: crate::driver::MemoryPropertyFlags,
    },

    #[error("couldn't {action}")]
    Driver {
        action: &'static str,
        #[source]
        source: DriverError,
    },

    #[error("staging write of {len} bytes at offset {offset} exceeds the {size}-byte buffer")]
    StagingOverflow { offset: u64, len: u64, size: u64 },

    #[error("failed to spawn telemetry worker")]
    Spawn(#[from] std::io::Error),
}

impl BackendError {
    pub(crate) fn driver(action: &'static str) -> impl FnOnce(DriverError) -> Self {
        move |source| Self::Driver { action, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_capabilities_names_every_entry() {
        let err = BackendError::MissingCapabilities {
            scope: Scope::Instance,
            missing: vec!["surface".to_string(), "debug-report".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("instance"));
        assert!(message.contains("surface, debug-report"));
    }

    #[test]
    fn selection_failures_are_distinguishable() {
        let none = BackendError::NoPhysicalDevices.to_string();
        let unsuitable = BackendError::NoSuitableDevices { candidates: 3 }.to_string();
        let range = BackendError::DeviceIndexOutOfRange { index: 4, suitable: 2 }.to_string();
        assert_ne!(none, unsuitable);
        assert!(range.contains("index 4"));
    }
}
