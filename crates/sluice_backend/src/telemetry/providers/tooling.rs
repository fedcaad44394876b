//! Generic tool-introspection provider.
//!
//! Approximate: the runtime only reports which tools are attached, so an
//! attached monitoring tool is read as a throttled device (bucket 1,
//! low-power) and its absence as nominal. There is no real sensor behind it.

use crate::driver::ToolingQuery;
use crate::telemetry::{TelemetryProvider, TelemetryState};

pub struct ToolingProvider {
    query: Box<dyn ToolingQuery>,
}

impl ToolingProvider {
    pub const NAME: &'static str = "Tooling Info";

    pub fn new(query: Box<dyn ToolingQuery>) -> Self {
        Self { query }
    }
}

impl TelemetryProvider for ToolingProvider {
    fn sample(&mut self, state: &TelemetryState) {
        let tools = match self.query.tool_properties() {
            Ok(tools) => tools,
            Err(err) => {
                state.warn_once(format_args!("Tool property query failed: {err}"));
                return;
            }
        };

        let monitoring = tools.iter().any(|tool| tool.monitoring);
        state.store_thermal_bucket(u8::from(monitoring));
        state.store_low_power(monitoring);
        state.clear_error_latch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ToolProperties;
    use crate::error::DriverError;
    use crate::telemetry::ProviderKind;
    use std::sync::{Arc, Mutex};

    struct ScriptedTools(Arc<Mutex<Result<Vec<ToolProperties>, DriverError>>>);

    impl ToolingQuery for ScriptedTools {
        fn tool_properties(&self) -> Result<Vec<ToolProperties>, DriverError> {
            self.0.lock().unwrap().clone()
        }
    }

    fn monitor() -> ToolProperties {
        ToolProperties {
            name: "gpu-monitor".to_string(),
            monitoring: true,
        }
    }

    #[test]
    fn monitoring_tool_reads_as_throttled() {
        let script = Arc::new(Mutex::new(Ok(vec![monitor()])));
        let mut provider = ToolingProvider::new(Box::new(ScriptedTools(script.clone())));
        let state = TelemetryState::new(ProviderKind::ToolingInfo, ToolingProvider::NAME);

        provider.sample(&state);
        assert_eq!(state.thermal_bucket(), 1);
        assert!(state.low_power());

        *script.lock().unwrap() = Ok(vec![ToolProperties {
            name: "debugger".to_string(),
            monitoring: false,
        }]);
        provider.sample(&state);
        assert_eq!(state.thermal_bucket(), 0);
        assert!(!state.low_power());
    }

    #[test]
    fn failures_keep_stale_values_and_latch() {
        let script = Arc::new(Mutex::new(Ok(vec![monitor()])));
        let mut provider = ToolingProvider::new(Box::new(ScriptedTools(script.clone())));
        let state = TelemetryState::new(ProviderKind::ToolingInfo, ToolingProvider::NAME);
        provider.sample(&state);

        *script.lock().unwrap() = Err(DriverError::new("tool_properties", "lost"));
        provider.sample(&state);
        provider.sample(&state);
        assert!(state.error_latched());
        assert_eq!(state.thermal_bucket(), 1);
        assert!(state.low_power());

        *script.lock().unwrap() = Ok(Vec::new());
        provider.sample(&state);
        assert!(!state.error_latched());
        assert_eq!(state.thermal_bucket(), 0);
    }
}
