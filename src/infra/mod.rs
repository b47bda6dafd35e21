//! Infrastructure adapters and runtime bootstrap.

pub mod blobs;
pub mod db;
pub mod error;
pub mod memory;
pub mod telemetry;
