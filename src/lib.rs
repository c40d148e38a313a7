//! newsmill: deduplicating article ingestion with adaptive concurrency.
//!
//! The identity store ([`store`]) remembers every URL ever offered and
//! what became of it; the freshness gate ([`freshness`]) catches the same
//! content arriving under new URLs; the controller ([`controller`])
//! supervises per-host worker tasks and scales their number with
//! measured rewrite latency. Extraction and rewriting are injected
//! through the trait boundaries in [`pipeline`].

pub mod cli;
pub mod controller;
pub mod error;
pub mod freshness;
pub mod pipeline;
pub mod reconcile;
pub mod store;

// Re-export commonly used error types
pub use error::{ControllerError, ErrorClass, StoreError, WorkError};
