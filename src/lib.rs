//! HEDGE: two-leg arbitrage bet execution engine
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod retry;
pub mod store;
pub mod adapters;
pub mod rotation;
pub mod quota;
pub mod markers;
pub mod engine;
