//! NVIDIA management library provider.
//!
//! Built only with the `nvml` feature. Without it, [`NvmlProvider::open`]
//! always reports the library as unavailable and selection moves on.

use crate::telemetry::classify::{
    is_low_power_from_power_budget, is_low_power_from_pstate, thermal_bucket_from_celsius,
    DEFAULT_UTILIZATION_THRESHOLD_PERCENT,
};
use crate::telemetry::{TelemetryProvider, TelemetryState};
use std::fmt;

/// PCI vendor id of NVIDIA devices.
pub const NVIDIA_VENDOR_ID: u32 = 0x10DE;

/// The four readings one NVML sample is built from.
pub trait NvmlSensors {
    type Error: fmt::Display;

    /// `Ok(None)` when the driver reports an unknown performance state.
    fn performance_state(&self) -> Result<Option<u32>, Self::Error>;
    fn temperature_celsius(&self) -> Result<u32, Self::Error>;
    fn power_usage_mw(&self) -> Result<u32, Self::Error>;
    fn power_limit_mw(&self) -> Result<u32, Self::Error>;
}

/// Folds one round of readings into `state`.
///
/// A failed reading leaves its previous value in place. The power budget
/// overwrites the pstate verdict when both succeed. The error latch clears
/// only after a round with no failures.
pub fn sample_sensors<S: NvmlSensors + ?Sized>(sensors: &S, state: &TelemetryState) {
    let mut clean = true;

    match sensors.performance_state() {
        Ok(Some(pstate)) => state.store_low_power(is_low_power_from_pstate(pstate)),
        Ok(None) => {}
        Err(err) => {
            clean = false;
            state.warn_once(format_args!("Failed to query NVML power state: {err}"));
        }
    }

    match sensors.temperature_celsius() {
        Ok(celsius) => state.store_thermal_bucket(thermal_bucket_from_celsius(celsius)),
        Err(err) => {
            clean = false;
            state.warn_once(format_args!("Failed to query NVML temperature: {err}"));
        }
    }

    match (sensors.power_usage_mw(), sensors.power_limit_mw()) {
        (Ok(usage), Ok(budget)) => state.store_low_power(is_low_power_from_power_budget(
            usage,
            budget,
            DEFAULT_UTILIZATION_THRESHOLD_PERCENT,
        )),
        (Err(err), _) | (_, Err(err)) => {
            clean = false;
            state.warn_once(format_args!("Failed to query NVML power budget: {err}"));
        }
    }

    if clean {
        state.clear_error_latch();
    }
}

#[cfg(feature = "nvml")]
mod imp {
    use super::*;
    use nvml_wrapper::enum_wrappers::device::{PerformanceState, TemperatureSensor};
    use nvml_wrapper::error::NvmlError;
    use nvml_wrapper::{Device, Nvml};
    use tracing::{debug, error};

    pub struct NvmlProvider {
        nvml: Nvml,
        index: u32,
    }

    impl NvmlProvider {
        /// Initializes the library and resolves the device, matching by name
        /// first and falling back to `fallback_index`.
        pub fn open(device_name: &str, fallback_index: u32) -> Option<Self> {
            let nvml = match Nvml::init() {
                Ok(nvml) => nvml,
                Err(err) => {
                    error!("NVML initialization failed: {err}");
                    return None;
                }
            };

            let count = nvml.device_count().unwrap_or(0);
            let by_name = (0..count).find(|&index| {
                nvml.device_by_index(index)
                    .and_then(|device| device.name())
                    .map(|name| name == device_name)
                    .unwrap_or(false)
            });
            let index = by_name.unwrap_or(fallback_index);

            if let Err(err) = nvml.device_by_index(index) {
                error!("NVML cannot access device {index}: {err}");
                return None;
            }
            debug!("NVML bound to device {index} ('{device_name}').");

            Some(Self { nvml, index })
        }
    }

    fn pstate_number(state: PerformanceState) -> Option<u32> {
        let number = match state {
            PerformanceState::Zero => 0,
            PerformanceState::One => 1,
            PerformanceState::Two => 2,
            PerformanceState::Three => 3,
            PerformanceState::Four => 4,
            PerformanceState::Five => 5,
            PerformanceState::Six => 6,
            PerformanceState::Seven => 7,
            PerformanceState::Eight => 8,
            PerformanceState::Nine => 9,
            PerformanceState::Ten => 10,
            PerformanceState::Eleven => 11,
            PerformanceState::Twelve => 12,
            PerformanceState::Thirteen => 13,
            PerformanceState::Fourteen => 14,
            PerformanceState::Fifteen => 15,
            PerformanceState::Unknown => return None,
        };
        Some(number)
    }

    impl NvmlSensors for Device<'_> {
        type Error = NvmlError;

        fn performance_state(&self) -> Result<Option<u32>, NvmlError> {
            Device::performance_state(self).map(pstate_number)
        }

        fn temperature_celsius(&self) -> Result<u32, NvmlError> {
            self.temperature(TemperatureSensor::Gpu)
        }

        fn power_usage_mw(&self) -> Result<u32, NvmlError> {
            self.power_usage()
        }

        fn power_limit_mw(&self) -> Result<u32, NvmlError> {
            self.enforced_power_limit()
        }
    }

    impl TelemetryProvider for NvmlProvider {
        fn sample(&mut self, state: &TelemetryState) {
            match self.nvml.device_by_index(self.index) {
                Ok(device) => sample_sensors(&device, state),
                Err(err) => state.warn_once(format_args!("NVML lost device {}: {err}", self.index)),
            }
        }
    }
}

#[cfg(not(feature = "nvml"))]
mod imp {
    use super::*;

    /// Placeholder; never constructed without the `nvml` feature.
    pub struct NvmlProvider {
        _private: (),
    }

    impl NvmlProvider {
        pub fn open(_device_name: &str, _fallback_index: u32) -> Option<Self> {
            tracing::debug!("Built without NVML support.");
            None
        }
    }

    impl TelemetryProvider for NvmlProvider {
        fn sample(&mut self, _state: &TelemetryState) {}
    }
}

pub use imp::NvmlProvider;

impl NvmlProvider {
    pub const NAME: &'static str = "NVML";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ProviderKind;

    /// Canned readings; `None` stands for a failed query.
    #[derive(Clone, Copy)]
    struct Readings {
        pstate: Option<Option<u32>>,
        celsius: Option<u32>,
        usage_mw: Option<u32>,
        limit_mw: Option<u32>,
    }

    impl Readings {
        fn healthy() -> Self {
            Self {
                pstate: Some(Some(0)),
                celsius: Some(60),
                usage_mw: Some(200_000),
                limit_mw: Some(250_000),
            }
        }
    }

    fn reading<T>(value: Option<T>, what: &str) -> Result<T, String> {
        value.ok_or_else(|| format!("{what} not supported"))
    }

    impl NvmlSensors for Readings {
        type Error = String;

        fn performance_state(&self) -> Result<Option<u32>, String> {
            reading(self.pstate, "pstate")
        }

        fn temperature_celsius(&self) -> Result<u32, String> {
            reading(self.celsius, "temperature")
        }

        fn power_usage_mw(&self) -> Result<u32, String> {
            reading(self.usage_mw, "power usage")
        }

        fn power_limit_mw(&self) -> Result<u32, String> {
            reading(self.limit_mw, "power limit")
        }
    }

    fn state() -> TelemetryState {
        TelemetryState::new(ProviderKind::Nvml, NvmlProvider::NAME)
    }

    #[test]
    fn healthy_readings_are_published() {
        let state = state();
        sample_sensors(
            &Readings {
                celsius: Some(88),
                ..Readings::healthy()
            },
            &state,
        );
        assert_eq!(state.thermal_bucket(), 2);
        assert!(!state.low_power());
        assert!(!state.error_latched());
    }

    #[test]
    fn power_budget_overrides_pstate() {
        let state = state();
        // P12 alone reads as low-power, but the card is drawing 80% of budget.
        sample_sensors(
            &Readings {
                pstate: Some(Some(12)),
                ..Readings::healthy()
            },
            &state,
        );
        assert!(!state.low_power());

        // Without a budget reading the pstate verdict stands.
        sample_sensors(
            &Readings {
                pstate: Some(Some(12)),
                limit_mw: None,
                ..Readings::healthy()
            },
            &state,
        );
        assert!(state.low_power());
    }

    #[test]
    fn failed_readings_keep_previous_values() {
        let state = state();
        sample_sensors(
            &Readings {
                celsius: Some(96),
                usage_mw: Some(10_000),
                ..Readings::healthy()
            },
            &state,
        );
        assert_eq!(state.thermal_bucket(), 3);
        assert!(state.low_power());

        sample_sensors(
            &Readings {
                pstate: None,
                celsius: None,
                usage_mw: None,
                limit_mw: None,
            },
            &state,
        );
        assert_eq!(state.thermal_bucket(), 3);
        assert!(state.low_power());
        assert!(state.error_latched());
    }

    #[test]
    fn latch_clears_only_after_a_clean_round() {
        let state = state();
        let partial = Readings {
            celsius: None,
            ..Readings::healthy()
        };
        sample_sensors(&partial, &state);
        assert!(state.error_latched());

        sample_sensors(&partial, &state);
        assert!(state.error_latched());

        sample_sensors(&Readings::healthy(), &state);
        assert!(!state.error_latched());
    }

    #[test]
    fn unknown_pstate_is_not_an_error() {
        let state = state();
        sample_sensors(
            &Readings {
                pstate: Some(None),
                limit_mw: None,
                ..Readings::healthy()
            },
            &state,
        );
        assert!(!state.low_power());
        assert!(state.error_latched());

        sample_sensors(
            &Readings {
                pstate: Some(None),
                ..Readings::healthy()
            },
            &state,
        );
        assert!(!state.error_latched());
    }

    #[cfg(not(feature = "nvml"))]
    #[test]
    fn unavailable_without_feature() {
        assert!(NvmlProvider::open("GeForce", 0).is_none());
    }
}
