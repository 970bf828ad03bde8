//! waymark-core - Core library for waymark.
//!
//! A versioned store for map elements (nodes, ways, relations). Every commit
//! appends immutable element versions tagged with a global sequence id, reads
//! see a consistent snapshot as of any sequence id, and edits arrive as
//! optimistic diff batches that commit all-or-nothing.
//!
//! # Example
//!
//! ```ignore
//! use waymark_core::{DiffBatch, DiffOperation, ElementRef, ElementService, Point};
//!
//! let service = ElementService::in_memory()?;
//!
//! let batch = DiffBatch::new(1)
//!     .push(DiffOperation::create_node(-1, Point::new(21.0, 52.2)))
//!     .push(DiffOperation::create_node(-2, Point::new(21.1, 52.2)))
//!     .push(DiffOperation::create_way(-1, [ElementRef::node(-1), ElementRef::node(-2)]));
//! let result = service.submit_diff(&batch).await?;
//!
//! let way = result.assigned_ids()[&ElementRef::way(-1)];
//! let detail = service.element_detail(way.into(), None).await?;
//! ```

pub mod config;
pub mod diff;
pub mod error;
pub mod resolver;
pub mod sequence;
pub mod service;
pub mod store;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::{DiffConfig, ElementLimits, EngineConfig};
pub use diff::DiffEngine;
pub use error::{ErrorCode, WaymarkError, WaymarkResult};
pub use resolver::{
    parse_lookups, ElementDetail, ElementLookup, HistoryPage, ReferenceResolver, ResolvedMembers,
};
pub use service::ElementService;
pub use store::SqliteElementStore;
pub use traits::{CommitPlan, CommitReceipt, ElementStore, PlannedWrite, VersionQuery};
pub use types::{
    DiffAction, DiffBatch, DiffOperation, DiffResult, DiffResultEntry, DiffState, ElementMember,
    ElementRef, ElementType, ElementVersion, Point, SequenceId, VersionedElementRef,
};
