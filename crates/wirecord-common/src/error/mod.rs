//! Error taxonomy shared by every session layer

mod error_class;

pub use error_class::{Classify, ErrorClass};
