//! Domain error types

mod cache_error;

pub use cache_error::CacheError;
