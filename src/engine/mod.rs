//! Execution engine: batch coordination, leg execution, reconciliation.

pub mod coordinator;
pub mod executor;
pub mod pool;
pub mod reconciler;
