//! # wirecord-common
//!
//! Shared utilities including configuration, the error taxonomy, and telemetry.

pub mod config;
pub mod error;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use config::{ClientConfig, ConfigError, Environment};
pub use error::{Classify, ErrorClass};
pub use telemetry::{
    init_tracing, init_tracing_with_config, try_init_tracing, try_init_tracing_with_config,
    TracingConfig, TracingError,
};
