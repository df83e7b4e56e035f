//! Shared types for the license monitor.
//!
//! Holds the value types that flow through the pipeline, the error enum,
//! configuration (CLI settings and the analysis config object), the policy
//! table and small time / formatting helpers.

pub mod calculations;
pub mod error;
pub mod formatting;
pub mod models;
pub mod percentile;
pub mod policy;
pub mod settings;
pub mod time_utils;

pub use error::{MonitorError, Result};
