//! Runtime layer for the license monitor.
//!
//! Caches loaded snapshots per date range and runs analyses on a background
//! tokio task, reporting progress over a channel.

pub mod data_manager;
pub mod orchestrator;

pub use monitor_core as core;
pub use monitor_data as data;
