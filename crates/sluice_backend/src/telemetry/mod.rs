//! Device health telemetry
//!
//! A provider samples thermal and power signals; a runtime drives it in the
//! background; [`TelemetryState`] is the lock-free cache everyone reads.

pub mod classify;
pub mod provider;
pub mod providers;
pub mod runtime;

pub use provider::TelemetryProvider;
pub use runtime::{CooperativeRuntime, FrameScheduler, ScheduledTask, Scheduler, ThreadedRuntime};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::warn;

/// Which mechanism feeds the telemetry cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    None,
    Nvml,
    ToolingInfo,
    Browser,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderKind::None => "none",
            ProviderKind::Nvml => "nvml",
            ProviderKind::ToolingInfo => "tooling-info",
            ProviderKind::Browser => "browser",
        };
        f.write_str(label)
    }
}

/// Shared telemetry cache.
///
/// Provider identity is fixed at construction. The live samples are atomics
/// written by the runtime and readable from any thread without blocking.
pub struct TelemetryState {
    kind: ProviderKind,
    provider_name: String,
    thermal_bucket: AtomicU8,
    low_power: AtomicBool,
    error_logged: AtomicBool,
    samples: AtomicU64,
    latency: sluice_metrics::LatencyCounter,
}

impl TelemetryState {
    pub fn new(kind: ProviderKind, provider_name: impl Into<String>) -> Self {
        Self {
            kind,
            provider_name: provider_name.into(),
            thermal_bucket: AtomicU8::new(0),
            low_power: AtomicBool::new(false),
            error_logged: AtomicBool::new(false),
            samples: AtomicU64::new(0),
            latency: sluice_metrics::LatencyCounter::new(),
        }
    }

    /// Permanent default state when no provider could be established.
    pub fn unavailable() -> Self {
        Self::new(ProviderKind::None, "Unavailable")
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn is_available(&self) -> bool {
        self.kind != ProviderKind::None
    }

    pub fn thermal_bucket(&self) -> u8 {
        self.thermal_bucket.load(Ordering::Acquire)
    }

    pub fn low_power(&self) -> bool {
        self.low_power.load(Ordering::Acquire)
    }

    pub fn store_thermal_bucket(&self, bucket: u8) {
        self.thermal_bucket.store(bucket.min(3), Ordering::Release);
    }

    pub fn store_low_power(&self, low_power: bool) {
        self.low_power.store(low_power, Ordering::Release);
    }

    /// Logs `message` unless a failure was already logged in the current streak.
    pub fn warn_once(&self, message: fmt::Arguments<'_>) {
        if !self.error_logged.swap(true, Ordering::AcqRel) {
            warn!("{}", message);
        }
    }

    /// Ends a failure streak; the next failure logs again.
    pub fn clear_error_latch(&self) {
        self.error_logged.store(false, Ordering::Release);
    }

    pub fn error_latched(&self) -> bool {
        self.error_logged.load(Ordering::Acquire)
    }

    /// Number of samples taken by the runtime so far.
    pub fn sample_count(&self) -> u64 {
        self.samples.load(Ordering::Acquire)
    }

    pub(crate) fn record_sample(&self, elapsed: Duration) {
        self.latency.record(elapsed);
        self.samples.fetch_add(1, Ordering::AcqRel);
    }

    /// Zero unless built with the `metrics` feature.
    pub fn mean_sample_latency(&self) -> Duration {
        self.latency.mean()
    }

    /// Zero unless built with the `metrics` feature.
    pub fn worst_sample_latency(&self) -> Duration {
        self.latency.worst()
    }
}

impl fmt::Debug for TelemetryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryState")
            .field("kind", &self.kind)
            .field("provider_name", &self.provider_name)
            .field("thermal_bucket", &self.thermal_bucket())
            .field("low_power", &self.low_power())
            .field("samples", &self.sample_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_state_has_safe_defaults() {
        let state = TelemetryState::unavailable();
        assert!(!state.is_available());
        assert_eq!(state.provider_name(), "Unavailable");
        assert_eq!(state.thermal_bucket(), 0);
        assert!(!state.low_power());
        assert_eq!(state.sample_count(), 0);
    }

    #[test]
    fn warn_latch_holds_until_cleared() {
        let state = TelemetryState::new(ProviderKind::ToolingInfo, "test");
        assert!(!state.error_latched());
        state.warn_once(format_args!("first"));
        assert!(state.error_latched());
        state.warn_once(format_args!("second"));
        assert!(state.error_latched());
        state.clear_error_latch();
        assert!(!state.error_latched());
    }

    #[test]
    fn thermal_bucket_is_clamped() {
        let state = TelemetryState::new(ProviderKind::Browser, "test");
        state.store_thermal_bucket(9);
        assert_eq!(state.thermal_bucket(), 3);
    }

    #[test]
    fn samples_are_counted() {
        let state = TelemetryState::new(ProviderKind::Nvml, "test");
        state.record_sample(Duration::from_micros(5));
        state.record_sample(Duration::from_micros(7));
        assert_eq!(state.sample_count(), 2);
    }

    #[test]
    fn latency_reads_never_stall_the_sampler() {
        let state = TelemetryState::new(ProviderKind::Nvml, "test");
        std::thread::scope(|scope| {
            let reader = scope.spawn(|| {
                while state.sample_count() < 500 {
                    let _ = state.mean_sample_latency();
                    let _ = state.thermal_bucket();
                }
            });
            for _ in 0..500 {
                state.record_sample(Duration::from_micros(40));
            }
            reader.join().unwrap();
        });
        assert_eq!(state.sample_count(), 500);
        if cfg!(feature = "metrics") {
            assert_eq!(state.mean_sample_latency(), Duration::from_micros(40));
            assert_eq!(state.worst_sample_latency(), Duration::from_micros(40));
        } else {
            assert_eq!(state.mean_sample_latency(), Duration::ZERO);
        }
    }
}
