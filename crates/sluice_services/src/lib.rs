//! Sluice Services Layer
//!
//! Settings loading and the block/flowgraph metadata registry.

pub mod settings;
pub mod store;

pub use settings::{Settings, SettingsError};
pub use store::{BlockMetadata, FlowgraphMetadata, Store};
