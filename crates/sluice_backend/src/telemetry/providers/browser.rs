//! Browser hint provider.
//!
//! Browsers expose no sensors, only coarse hints (device memory, core count,
//! JS heap pressure). These are mapped onto the same buckets as native
//! telemetry. Each missing hint warns once for the lifetime of the provider.

use crate::telemetry::{TelemetryProvider, TelemetryState};
use tracing::warn;

/// One reading of the browser's capability hints. `None` means not exposed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NavigatorSnapshot {
    pub device_memory_gb: Option<f64>,
    pub hardware_concurrency: Option<u32>,
    pub heap_used_bytes: Option<f64>,
    pub heap_limit_bytes: Option<f64>,
}

pub trait HintSource {
    fn snapshot(&self) -> NavigatorSnapshot;
}

/// Small machines read as low-power.
pub fn low_power_hint(snapshot: &NavigatorSnapshot) -> Option<bool> {
    if let Some(memory) = snapshot.device_memory_gb {
        return Some(memory <= 4.0);
    }
    snapshot.hardware_concurrency.map(|cores| cores <= 4)
}

/// Heap pressure when available, otherwise device memory as a proxy.
pub fn thermal_hint(snapshot: &NavigatorSnapshot) -> Option<u8> {
    if let (Some(used), Some(limit)) = (snapshot.heap_used_bytes, snapshot.heap_limit_bytes) {
        if limit > 0.0 {
            let ratio = used / limit;
            let bucket = if ratio > 0.9 {
                3
            } else if ratio > 0.75 {
                2
            } else if ratio > 0.5 {
                1
            } else {
                0
            };
            return Some(bucket);
        }
    }
    snapshot.device_memory_gb.map(|memory| {
        if memory <= 4.0 {
            2
        } else if memory <= 8.0 {
            1
        } else {
            0
        }
    })
}

pub struct BrowserHintsProvider<H> {
    source: H,
    low_power_warned: bool,
    thermal_warned: bool,
}

impl<H: HintSource> BrowserHintsProvider<H> {
    pub const NAME: &'static str = "Navigator";

    pub fn new(source: H) -> Self {
        Self {
            source,
            low_power_warned: false,
            thermal_warned: false,
        }
    }
}

impl<H: HintSource> TelemetryProvider for BrowserHintsProvider<H> {
    fn sample(&mut self, state: &TelemetryState) {
        let snapshot = self.source.snapshot();

        match low_power_hint(&snapshot) {
            Some(low_power) => state.store_low_power(low_power),
            None if !self.low_power_warned => {
                warn!("Browser telemetry does not expose power hints.");
                self.low_power_warned = true;
            }
            None => {}
        }

        match thermal_hint(&snapshot) {
            Some(bucket) => state.store_thermal_bucket(bucket),
            None if !self.thermal_warned => {
                warn!("Browser telemetry does not expose thermal hints.");
                self.thermal_warned = true;
            }
            None => {}
        }
    }
}

/// Reads hints from the page's `navigator` and `performance` objects.
#[cfg(target_arch = "wasm32")]
#[derive(Debug, Clone, Copy, Default)]
pub struct Navigator;

#[cfg(target_arch = "wasm32")]
impl HintSource for Navigator {
    fn snapshot(&self) -> NavigatorSnapshot {
        use wasm_bindgen::JsValue;

        fn number(target: &JsValue, key: &str) -> Option<f64> {
            if target.is_undefined() || target.is_null() {
                return None;
            }
            js_sys::Reflect::get(target, &JsValue::from_str(key))
                .ok()
                .and_then(|value| value.as_f64())
        }

        fn object(target: &JsValue, key: &str) -> JsValue {
            js_sys::Reflect::get(target, &JsValue::from_str(key)).unwrap_or(JsValue::UNDEFINED)
        }

        let global = JsValue::from(js_sys::global());
        let navigator = object(&global, "navigator");
        let memory = object(&object(&global, "performance"), "memory");

        NavigatorSnapshot {
            device_memory_gb: number(&navigator, "deviceMemory"),
            hardware_concurrency: number(&navigator, "hardwareConcurrency").map(|n| n as u32),
            heap_used_bytes: number(&memory, "usedJSHeapSize"),
            heap_limit_bytes: number(&memory, "jsHeapSizeLimit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ProviderKind;
    use std::cell::Cell;

    struct Fixed(Cell<NavigatorSnapshot>);

    impl HintSource for &Fixed {
        fn snapshot(&self) -> NavigatorSnapshot {
            self.0.get()
        }
    }

    #[test]
    fn device_memory_wins_over_core_count() {
        let snapshot = NavigatorSnapshot {
            device_memory_gb: Some(8.0),
            hardware_concurrency: Some(2),
            ..Default::default()
        };
        assert_eq!(low_power_hint(&snapshot), Some(false));

        let cores_only = NavigatorSnapshot {
            hardware_concurrency: Some(4),
            ..Default::default()
        };
        assert_eq!(low_power_hint(&cores_only), Some(true));
        assert_eq!(low_power_hint(&NavigatorSnapshot::default()), None);
    }

    #[test]
    fn heap_pressure_buckets() {
        let at = |used: f64| NavigatorSnapshot {
            heap_used_bytes: Some(used),
            heap_limit_bytes: Some(100.0),
            ..Default::default()
        };
        assert_eq!(thermal_hint(&at(50.0)), Some(0));
        assert_eq!(thermal_hint(&at(51.0)), Some(1));
        assert_eq!(thermal_hint(&at(76.0)), Some(2));
        assert_eq!(thermal_hint(&at(91.0)), Some(3));
    }

    #[test]
    fn device_memory_is_thermal_fallback() {
        let with_memory = |gb: f64| NavigatorSnapshot {
            device_memory_gb: Some(gb),
            heap_limit_bytes: Some(0.0),
            heap_used_bytes: Some(10.0),
            ..Default::default()
        };
        assert_eq!(thermal_hint(&with_memory(4.0)), Some(2));
        assert_eq!(thermal_hint(&with_memory(8.0)), Some(1));
        assert_eq!(thermal_hint(&with_memory(16.0)), Some(0));
        assert_eq!(thermal_hint(&NavigatorSnapshot::default()), None);
    }

    #[test]
    fn missing_hints_keep_previous_values() {
        let source = Fixed(Cell::new(NavigatorSnapshot {
            device_memory_gb: Some(2.0),
            ..Default::default()
        }));
        let mut provider = BrowserHintsProvider::new(&source);
        let state = TelemetryState::new(ProviderKind::Browser, "Navigator");

        provider.sample(&state);
        assert!(state.low_power());
        assert_eq!(state.thermal_bucket(), 2);

        source.0.set(NavigatorSnapshot::default());
        provider.sample(&state);
        provider.sample(&state);
        assert!(provider.low_power_warned);
        assert!(provider.thermal_warned);
        assert!(state.low_power());
        assert_eq!(state.thermal_bucket(), 2);
    }
}
