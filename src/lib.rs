//! Bulk two-way sync between a local directory tree and an object store
//! bucket, with live progress published to an external status record.

pub mod config;
pub mod context;
pub mod core;
pub mod logging;
pub mod status;
pub mod store;
