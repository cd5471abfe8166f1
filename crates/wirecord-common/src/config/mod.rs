//! Configuration module

mod app_config;

pub use app_config::{ClientConfig, ConfigError, Environment};
