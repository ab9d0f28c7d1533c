//! # Aircheck Common Library
//!
//! Shared code for the aircheck processing pipeline:
//! - Common error type and error-kind taxonomy
//! - Configuration loading
//! - Clock-time (`HH:MM:SS`) parsing and normalization

pub mod clock_time;
pub mod config;
pub mod error;

pub use error::{Error, ErrorKind, Result};
