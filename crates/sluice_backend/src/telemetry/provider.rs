use super::TelemetryState;

/// A strategy for sampling device health.
///
/// `sample` writes fresh values into `state` on success. On failure it warns
/// through [`TelemetryState::warn_once`] and leaves the cached values alone,
/// so readers see the last good sample rather than a reset.
pub trait TelemetryProvider {
    fn sample(&mut self, state: &TelemetryState);
}

impl<P: TelemetryProvider + ?Sized> TelemetryProvider for Box<P> {
    fn sample(&mut self, state: &TelemetryState) {
        (**self).sample(state)
    }
}
