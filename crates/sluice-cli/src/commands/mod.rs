//! CLI command implementations. Each returns the process exit code.

pub mod dlq;
pub mod indexes;
pub mod migrate;
pub mod seed;
