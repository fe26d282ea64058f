//! codematch-core
//!
//! Function-similarity store for disassembled binaries.
//!
//! Ingested reports become families, samples and functions. Functions are
//! indexed two ways: an exact PicHash index over normalized code, and MinHash
//! signatures bucketed by LSH bands for approximate candidate lookup. A
//! leased priority work queue distributes jobs between worker processes.

pub mod config;
pub mod model;
pub mod queue;
pub mod storage;

/// Returns the library version as encoded at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
