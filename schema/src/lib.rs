//! Schema definitions for jpm
//!
//! This crate contains the data structures shared between the process
//! supervisor core and its presentation layers. All types here implement
//! JSON Schema generation for external consumption.

use std::time::SystemTime;

pub mod process;

#[cfg(test)]
mod json_roundtrip_tests;

pub use process::*;

/// Create a current timestamp string in RFC3339 format (seconds precision)
#[must_use]
pub fn current_timestamp() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}
