//! Indexer for an on-chain trial/wagering protocol.
//!
//! Program log lines are decoded into typed events, keyed by their position
//! on chain, stored once, interpreted into pools, trials and game instances,
//! and settled into per-user and global statistics with fixed-point math.

pub mod config;
pub mod decoder;
pub mod error;
pub mod events;
pub mod fixed_point;
pub mod logging;
pub mod model;
pub mod order;
pub mod pipeline;
pub mod queue;
pub mod storage;

pub use error::{PipelineError, PipelineResult, Prerequisite};
