//! # wirecord-core
//!
//! Domain layer containing identifiers, gateway intents, and the guild cache.
//! This crate has no dependency on any transport or runtime.

pub mod cache;
pub mod error;
pub mod value_objects;

// Re-export commonly used types at crate root
pub use cache::{Guild, GuildCache};
pub use error::CacheError;
pub use value_objects::{Intents, Snowflake, SnowflakeParseError};
