//! Element store trait and related types.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WaymarkResult;
use crate::types::{
    DiffAction, DiffResultEntry, ElementMember, ElementRef, ElementVersion, Point, SequenceId,
    VersionedElementRef,
};

/// Bounds and ordering for a version range query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionQuery {
    /// Oldest first when true.
    pub ascending: bool,
    /// Inclusive lower bound.
    pub min_version: Option<u32>,
    /// Inclusive upper bound.
    pub max_version: Option<u32>,
    pub limit: Option<usize>,
}

impl VersionQuery {
    /// Newest first, unbounded.
    pub fn newest_first() -> Self {
        Self::default()
    }

    /// Oldest first, unbounded.
    pub fn oldest_first() -> Self {
        Self {
            ascending: true,
            ..Self::default()
        }
    }

    pub fn with_range(mut self, min_version: u32, max_version: u32) -> Self {
        self.min_version = Some(min_version);
        self.max_version = Some(max_version);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One row the diff engine wants written, in batch order.
///
/// `element_ref` and member refs may still be placeholders; the store maps
/// them to real ids while committing.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWrite {
    pub action: DiffAction,
    pub element_ref: ElementRef,
    /// Version this write produces.
    pub version: u32,
    pub visible: bool,
    pub tags: BTreeMap<String, String>,
    pub members: Vec<ElementMember>,
    pub point: Option<Point>,
}

impl PlannedWrite {
    /// Whether the write supersedes a row that already exists in the store or
    /// earlier in the batch.
    pub fn has_predecessor(&self) -> bool {
        self.version > 1
    }
}

/// A validated batch ready to commit against the snapshot it was planned on.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitPlan {
    /// Sequence point every validation read used.
    pub snapshot: SequenceId,
    pub changeset_id: i64,
    pub writes: Vec<PlannedWrite>,
    /// Stored elements whose state the plan depends on. The commit fails if
    /// any of them gained a version after `snapshot`.
    pub read_set: Vec<ElementRef>,
    /// Stored elements the plan deletes. The commit fails if a visible row
    /// listing one of them was committed after `snapshot`.
    pub deleted: Vec<ElementRef>,
}

/// What a successful commit wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// One entry per planned write, in batch order.
    pub entries: Vec<DiffResultEntry>,
    pub committed_at: DateTime<Utc>,
}

/// Core ElementStore trait - all storage backends implement this.
///
/// Every read takes a sequence point and sees exactly the rows committed at or
/// before it.
#[async_trait]
pub trait ElementStore: Send + Sync {
    /// Highest committed sequence id.
    async fn current_sequence_id(&self) -> WaymarkResult<SequenceId>;

    /// Rows current as of `at` for each ref, including deleted ones. Missing
    /// elements are omitted. With `recurse_ways`, the member nodes of returned
    /// ways are appended.
    async fn get_by_refs(
        &self,
        refs: &[ElementRef],
        at: SequenceId,
        recurse_ways: bool,
        limit: Option<usize>,
    ) -> WaymarkResult<Vec<ElementVersion>>;

    /// Exact version lookups. Missing versions are omitted.
    async fn get_by_versioned_refs(
        &self,
        refs: &[VersionedElementRef],
        limit: Option<usize>,
    ) -> WaymarkResult<Vec<ElementVersion>>;

    /// Versions of one element committed at or before `at`.
    async fn get_versions(
        &self,
        element: ElementRef,
        at: SequenceId,
        query: VersionQuery,
    ) -> WaymarkResult<Vec<ElementVersion>>;

    /// Version number current as of `at`. `NotFound` if the element did not
    /// exist yet.
    async fn get_current_version(&self, element: ElementRef, at: SequenceId)
        -> WaymarkResult<u32>;

    /// Ways and relations visible as of `at` that list any of `refs`.
    async fn get_many_parents(
        &self,
        refs: &[ElementRef],
        at: SequenceId,
        limit: Option<usize>,
    ) -> WaymarkResult<Vec<ElementVersion>>;

    /// Atomically write a validated plan.
    ///
    /// Fails with a retryable stale-snapshot conflict if anything the plan
    /// read changed after `plan.snapshot`.
    async fn commit(&self, plan: CommitPlan) -> WaymarkResult<CommitReceipt>;
}
