//! Sluice Host Environment
//!
//! Probes of the machine the backend runs on (processor count, system memory).

pub mod host;

pub use host::Host;
