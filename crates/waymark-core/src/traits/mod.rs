//! Core traits for waymark storage backends.

mod element_store;

pub use element_store::*;
