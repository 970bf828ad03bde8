//! Optimistic diff engine.
//!
//! A [`DiffBatch`](crate::types::DiffBatch) is validated against a snapshot of
//! the store and committed all-or-nothing. Concurrent writers are detected at
//! commit time and the batch is re-validated on a fresh snapshot.

mod engine;
mod plan;

pub use engine::DiffEngine;
