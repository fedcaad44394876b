//! Sluice Metrics - Sampling instrumentation for the backend's background work
//!
//! Provides zero-cost abstractions for latency tracking that completely
//! vanish in production builds via feature flags.
//!
//! # Feature Flags
//!
//! - `metrics` - Enable metrics collection (default: disabled)
//!
//! # Usage
//!
//! ```ignore
//! use sluice_metrics::LatencyCounter;
//!
//! let latency = LatencyCounter::new();
//! latency.record(elapsed);
//! println!("mean sample latency: {:?}", latency.mean());
//! ```
//!
//! Without the `metrics` feature, `record` does nothing and every reading is zero.

#[cfg(feature = "metrics")]
mod latency;

#[cfg(feature = "metrics")]
pub use latency::LatencyCounter;

// ============================================================================
// No-op stub when metrics disabled
// ============================================================================

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Default)]
pub struct LatencyCounter;

#[cfg(not(feature = "metrics"))]
impl LatencyCounter {
    pub fn new() -> Self { Self }
    pub fn record(&self, _elapsed: std::time::Duration) {}
    pub fn mean(&self) -> std::time::Duration { std::time::Duration::ZERO }
    pub fn worst(&self) -> std::time::Duration { std::time::Duration::ZERO }
    pub fn samples(&self) -> u64 { 0 }
}
