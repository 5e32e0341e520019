//! Hierarchical rollup and bounded top-K election over high-volume entity
//! access streams.

pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod ingest;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod service;
pub mod store;
