//! Capability negotiation
//!
//! Capabilities are named extensions or layers reported by the native API.
//! Each scope (instance, device) requests a *required* set, whose absence is
//! fatal, and an *optional* set, whose absence only switches off the single
//! [`Feature`] each optional capability backs.

use crate::config::BackendConfig;
use crate::error::BackendError;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};

/// Canonical capability names. Drivers report availability in these terms.
pub mod names {
    pub const SURFACE: &str = "surface";
    pub const XCB_SURFACE: &str = "surface.xcb";
    pub const WAYLAND_SURFACE: &str = "surface.wayland";
    pub const METAL_SURFACE: &str = "surface.metal";
    pub const WIN32_SURFACE: &str = "surface.win32";
    pub const ANDROID_SURFACE: &str = "surface.android";
    pub const DEBUG_REPORT: &str = "debug-report";
    pub const PORTABILITY_ENUMERATION: &str = "portability-enumeration";
    pub const TOOLING_INFO: &str = "tooling-info";

    pub const VALIDATION_LAYER: &str = "validation";

    pub const SWAPCHAIN: &str = "swapchain";
    pub const EXTERNAL_MEMORY_FD: &str = "external-memory-fd";
    pub const EXTERNAL_MEMORY_HOST: &str = "external-memory-host";
    pub const PORTABILITY_SUBSET: &str = "portability-subset";
}

pub type CapabilitySet = BTreeSet<String>;

/// Builds a [`CapabilitySet`] from string literals.
pub fn capability_set<I, S>(items: I) -> CapabilitySet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Instance,
    Device,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Instance => f.write_str("instance"),
            Scope::Device => f.write_str("device"),
        }
    }
}

/// Runtime feature switched on by exactly one optional capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    PortabilityEnumeration,
    ToolingInfo,
    ExternalMemoryFd,
    ExternalMemoryHost,
    PortabilitySubset,
}

/// Required and optional capabilities for one scope.
#[derive(Debug, Clone)]
pub struct ScopeRequest {
    pub scope: Scope,
    pub required: CapabilitySet,
    pub optional: BTreeMap<String, Feature>,
}

impl ScopeRequest {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            required: CapabilitySet::new(),
            optional: BTreeMap::new(),
        }
    }

    pub fn require(mut self, name: &str) -> Self {
        self.required.insert(name.to_string());
        self
    }

    pub fn prefer(mut self, name: &str, feature: Feature) -> Self {
        self.optional.insert(name.to_string(), feature);
        self
    }

    pub fn optional_set(&self) -> CapabilitySet {
        self.optional.keys().cloned().collect()
    }
}

/// Outcome of [`negotiate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiation {
    pub granted: CapabilitySet,
    pub unsupported_required: CapabilitySet,
}

/// Pure set negotiation: grant every requested capability that is available
/// and report every required one that isn't.
pub fn negotiate(
    required: &CapabilitySet,
    optional: &CapabilitySet,
    available: &CapabilitySet,
) -> Negotiation {
    let granted = required
        .union(optional)
        .filter(|name| available.contains(*name))
        .cloned()
        .collect();
    let unsupported_required = required.difference(available).cloned().collect();
    Negotiation {
        granted,
        unsupported_required,
    }
}

/// Capabilities granted for one scope plus the features they enable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantedScope {
    pub capabilities: CapabilitySet,
    pub features: BTreeSet<Feature>,
}

impl GrantedScope {
    pub fn has(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.capabilities.iter().cloned().collect()
    }
}

/// Runs [`negotiate`] for a scope and enforces the required/optional policy.
pub fn negotiate_scope(
    request: &ScopeRequest,
    available: &CapabilitySet,
) -> Result<GrantedScope, BackendError> {
    debug!("Required {} capabilities: {:?}", request.scope, request.required);
    debug!("Optional {} capabilities: {:?}", request.scope, request.optional.keys());

    let outcome = negotiate(&request.required, &request.optional_set(), available);
    if !outcome.unsupported_required.is_empty() {
        return Err(BackendError::MissingCapabilities {
            scope: request.scope,
            missing: outcome.unsupported_required.into_iter().collect(),
        });
    }

    let mut features = BTreeSet::new();
    for (name, feature) in &request.optional {
        if outcome.granted.contains(name) {
            features.insert(*feature);
        } else {
            warn!("Optional {} capability '{}' is not supported.", request.scope, name);
        }
    }

    Ok(GrantedScope {
        capabilities: outcome.granted,
        features,
    })
}

/// Presentation surface capabilities for the build target.
pub fn platform_surface_extensions() -> Vec<&'static str> {
    let mut exts = vec![names::SURFACE];
    if cfg!(target_os = "linux") {
        exts.push(names::XCB_SURFACE);
        if window_might_be_wayland() {
            exts.push(names::WAYLAND_SURFACE);
        }
    }
    if cfg!(any(target_os = "macos", target_os = "ios")) {
        exts.push(names::METAL_SURFACE);
    }
    if cfg!(target_os = "windows") {
        exts.push(names::WIN32_SURFACE);
    }
    if cfg!(target_os = "android") {
        exts.push(names::ANDROID_SURFACE);
    }
    exts
}

fn window_might_be_wayland() -> bool {
    std::env::var_os("WAYLAND_DISPLAY").is_some()
}

/// Instance scope: surfaces when presenting, debug reporting when validating.
pub fn instance_request(config: &BackendConfig) -> ScopeRequest {
    let mut request = ScopeRequest::new(Scope::Instance);
    if !config.headless {
        for ext in platform_surface_extensions() {
            request = request.require(ext);
        }
    }
    if config.validation_enabled {
        request = request.require(names::DEBUG_REPORT);
    }
    request
        .prefer(names::PORTABILITY_ENUMERATION, Feature::PortabilityEnumeration)
        .prefer(names::TOOLING_INFO, Feature::ToolingInfo)
}

/// Device scope: swapchain when presenting, memory interop when available.
pub fn device_request(config: &BackendConfig) -> ScopeRequest {
    let mut request = ScopeRequest::new(Scope::Device);
    if !config.headless {
        request = request.require(names::SWAPCHAIN);
    }
    request
        .prefer(names::EXTERNAL_MEMORY_FD, Feature::ExternalMemoryFd)
        .prefer(names::EXTERNAL_MEMORY_HOST, Feature::ExternalMemoryHost)
        .prefer(names::PORTABILITY_SUBSET, Feature::PortabilitySubset)
}

pub fn validation_layers() -> CapabilitySet {
    capability_set([names::VALIDATION_LAYER])
}

/// Downgrades a validation request when the layers are missing.
///
/// Returns the layers to enable; an empty set means validation is off.
/// Clears `config.validation_enabled` when downgrading.
pub fn negotiate_validation(config: &mut BackendConfig, available: &CapabilitySet) -> CapabilitySet {
    if !config.validation_enabled {
        return CapabilitySet::new();
    }
    let wanted = validation_layers();
    let outcome = negotiate(&CapabilitySet::new(), &wanted, available);
    if outcome.granted.len() != wanted.len() {
        warn!("Couldn't find validation layers. Disabling debug validation.");
        config.validation_enabled = false;
        return CapabilitySet::new();
    }
    outcome.granted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_fails_naming_it() {
        let required = capability_set(["A", "B"]);
        let available = capability_set(["A"]);
        let outcome = negotiate(&required, &CapabilitySet::new(), &available);
        assert_eq!(outcome.unsupported_required, capability_set(["B"]));

        let request = ScopeRequest::new(Scope::Instance).require("A").require("B");
        match negotiate_scope(&request, &available) {
            Err(BackendError::MissingCapabilities { scope, missing }) => {
                assert_eq!(scope, Scope::Instance);
                assert_eq!(missing, vec!["B".to_string()]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn every_missing_required_is_reported_together() {
        let request = ScopeRequest::new(Scope::Device)
            .require("X")
            .require("Y")
            .require("Z");
        let err = negotiate_scope(&request, &capability_set(["Y"])).unwrap_err();
        assert!(err.to_string().contains("X, Z"));
    }

    #[test]
    fn missing_optional_only_disables_its_feature() {
        let request = ScopeRequest::new(Scope::Device)
            .require("A")
            .prefer("C", Feature::ExternalMemoryFd)
            .prefer("D", Feature::ExternalMemoryHost);
        let granted = negotiate_scope(&request, &capability_set(["A", "C"])).unwrap();
        assert_eq!(granted.capabilities, capability_set(["A", "C"]));
        assert!(granted.has(Feature::ExternalMemoryFd));
        assert!(!granted.has(Feature::ExternalMemoryHost));
    }

    #[test]
    fn unrequested_capabilities_are_never_granted() {
        let outcome = negotiate(
            &capability_set(["A"]),
            &capability_set(["C"]),
            &capability_set(["A", "B", "C", "E"]),
        );
        assert_eq!(outcome.granted, capability_set(["A", "C"]));
        assert!(outcome.unsupported_required.is_empty());
    }

    #[test]
    fn headless_requests_no_presentation() {
        let config = BackendConfig {
            headless: true,
            ..BackendConfig::default()
        };
        assert!(instance_request(&config).required.is_empty());
        assert!(device_request(&config).required.is_empty());

        let presenting = BackendConfig {
            headless: false,
            validation_enabled: true,
            ..BackendConfig::default()
        };
        let instance = instance_request(&presenting);
        assert!(instance.required.contains(names::SURFACE));
        assert!(instance.required.contains(names::DEBUG_REPORT));
        assert!(device_request(&presenting).required.contains(names::SWAPCHAIN));
    }

    #[test]
    fn validation_downgrades_instead_of_failing() {
        let mut config = BackendConfig {
            validation_enabled: true,
            ..BackendConfig::default()
        };
        let layers = negotiate_validation(&mut config, &CapabilitySet::new());
        assert!(layers.is_empty());
        assert!(!config.validation_enabled);

        let mut config = BackendConfig {
            validation_enabled: true,
            ..BackendConfig::default()
        };
        let layers = negotiate_validation(&mut config, &validation_layers());
        assert_eq!(layers, validation_layers());
        assert!(config.validation_enabled);
    }
}
