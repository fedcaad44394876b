//! Backend configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Caller-supplied backend configuration.
///
/// Values are validated by the caller; the backend only clamps
/// `multisampling` to what the selected device supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Index into the list of devices that pass selection, not the raw enumeration.
    pub device_id: usize,
    pub validation_enabled: bool,
    pub headless: bool,
    pub multisampling: u32,
    pub staging_buffer_size: u64,
    #[serde(with = "millis")]
    pub telemetry_interval: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            validation_enabled: false,
            headless: true,
            multisampling: 1,
            staging_buffer_size: 32 * 1024 * 1024,
            telemetry_interval: Duration::from_secs(1),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: BackendConfig =
            serde_json::from_str(r#"{ "device_id": 2, "telemetry_interval": 250 }"#).unwrap();
        assert_eq!(config.device_id, 2);
        assert_eq!(config.telemetry_interval, Duration::from_millis(250));
        assert_eq!(config.multisampling, BackendConfig::default().multisampling);
        assert!(config.headless);
    }
}
