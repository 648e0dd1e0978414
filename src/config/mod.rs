//! Engine configuration
//!
//! `EngineConfig` collects the process-level knobs shared by every
//! execution: database location, browser pool sizing, timeouts, proxy
//! rotation and the optional AI recovery backend. Per-execution settings
//! (worker cap, rate delay, timeout multiplier) live in
//! [`crate::executor::ExecutionSettings`] instead, because recovery
//! actions mutate them at run time.

mod builder;
mod types;

pub use builder::EngineConfigBuilder;
pub use types::{AiBackendConfig, EngineConfig};
