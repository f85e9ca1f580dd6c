//! Library crate for edge-scan-rs: quota-bounded concurrent probing of edge IP candidates.
pub mod classifier;
pub mod config;
pub mod error;
pub mod expander;
pub mod orchestrator;
pub mod persist;
pub mod ports;
pub mod prober;
pub mod quota;
pub mod sources;
pub mod store;
pub mod types;
