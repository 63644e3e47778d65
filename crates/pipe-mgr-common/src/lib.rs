//! Shared infrastructure for the pipeline table manager engines.
//!
//! - [`SyncMap`]: map that never creates entries implicitly, with
//!   reference-counted release
//! - [`DeviceRegistry`]: per-device context registry with device-id bounds
//!   checking
//! - [`PipeMgrConfig`]: TOML configuration for the HA and idle engines

pub mod config;
pub mod registry;
mod sync_map;

pub use config::{HaConfig, IdleConfig, PipeMgrConfig, SymmetricReadCheck, DR_MSG_SIZE};
pub use registry::{DeviceRegistry, DEFAULT_MAX_DEVICES};
pub use sync_map::{HasRefCount, SyncMap};
