//! Data layer for the license monitor.
//!
//! Discovers and parses lmstat snapshot files, reconstructs usage sessions,
//! aggregates concurrency into time bins, computes the feature, user and
//! company tables and exports them as CSV.

pub mod aggregator;
pub mod analysis;
pub mod export;
pub mod parser;
pub mod reader;
pub mod sessions;
pub mod statistics;

pub use monitor_core as core;
