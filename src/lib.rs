//! Checkpointed, crash-safe window aggregation over timestamped telemetry
//! records.
//!
//! Raw records are rolled up into fixed-interval per-key summaries (the
//! summary stream) and into per-partition latest values (the spend stream).
//! Progress is tracked through named checkpoints so a restarted process
//! resumes where the last successful window ended.

pub mod agent;
pub mod aggregate;
pub mod alert;
pub mod backend;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod freshness;
pub mod migrate;
pub mod window;
