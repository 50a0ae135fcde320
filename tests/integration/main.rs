//! Integration tests: full engine over in-memory stores and mock sites.

mod execution;
mod harness;
mod mock_adapter;
mod reconciliation;
