//! Core types for waymark.

mod diff;
mod element;
mod element_ref;

pub use diff::*;
pub use element::*;
pub use element_ref::*;
