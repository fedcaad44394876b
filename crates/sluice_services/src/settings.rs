//! Settings management

use serde::{Deserialize, Serialize};
use sluice_backend::BackendConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable naming the settings file.
pub const SETTINGS_ENV: &str = "SLUICE_SETTINGS";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("couldn't read settings from {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed settings in {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Runtime settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendConfig,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Loads the file named by `SLUICE_SETTINGS`, or defaults when unset.
    pub fn from_env() -> Result<Self, SettingsError> {
        match std::env::var_os(SETTINGS_ENV) {
            Some(path) => Self::load(path),
            None => {
                debug!("{SETTINGS_ENV} not set; using default settings.");
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scratch(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("sluice-settings-{}-{name}.json", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let path = scratch(
            "partial",
            r#"{ "backend": { "multisampling": 4, "headless": false, "telemetry_interval": 500 } }"#,
        );
        let settings = Settings::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(settings.backend.multisampling, 4);
        assert!(!settings.backend.headless);
        assert_eq!(settings.backend.telemetry_interval, Duration::from_millis(500));
        assert_eq!(settings.backend.staging_buffer_size, BackendConfig::default().staging_buffer_size);
    }

    #[test]
    fn empty_object_is_default() {
        let path = scratch("empty", "{}");
        let settings = Settings::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn errors_name_the_file() {
        let missing = std::env::temp_dir().join("sluice-settings-does-not-exist.json");
        let err = Settings::load(&missing).unwrap_err();
        assert!(matches!(err, SettingsError::Io { .. }));
        assert!(err.to_string().contains("does-not-exist"));

        let path = scratch("malformed", "{ backend: ");
        let err = Settings::load(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, SettingsError::Parse { .. }));
    }
}
