//! Committed element versions.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DiffAction, ElementRef, ElementType, VersionedElementRef};

/// A point in the global commit order.
///
/// Every committed element version receives a unique sequence id. Reads are
/// parameterized by a sequence id and see exactly the rows committed at or
/// before it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(u64);

impl SequenceId {
    /// The point before any commit.
    pub const ZERO: SequenceId = SequenceId(0);

    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The point just before this one. Saturates at zero.
    #[inline]
    pub fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lon: f64,
    pub lat: f64,
}

impl Point {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Whether both coordinates lie within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        (-180.0..=180.0).contains(&self.lon) && (-90.0..=90.0).contains(&self.lat)
    }
}

/// One entry of a way's node list or a relation's member list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementMember {
    #[serde(rename = "ref")]
    pub element_ref: ElementRef,
    #[serde(default)]
    pub role: String,
}

impl ElementMember {
    /// A member without a role (way nodes).
    pub fn new(element_ref: ElementRef) -> Self {
        Self {
            element_ref,
            role: String::new(),
        }
    }

    /// A relation member with a role.
    pub fn with_role(element_ref: ElementRef, role: impl Into<String>) -> Self {
        Self {
            element_ref,
            role: role.into(),
        }
    }
}

/// One committed version of an element. Immutable once committed, except for
/// `next_sequence_id`, which is written once when a newer version supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementVersion {
    #[serde(rename = "type")]
    pub element_type: ElementType,
    pub id: i64,
    pub version: u32,
    pub sequence_id: SequenceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_sequence_id: Option<SequenceId>,
    pub visible: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub members: Vec<ElementMember>,
    pub changeset_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point: Option<Point>,
    pub created_at: DateTime<Utc>,
}

impl ElementVersion {
    pub fn element_ref(&self) -> ElementRef {
        ElementRef::new(self.element_type, self.id)
    }

    pub fn versioned_ref(&self) -> VersionedElementRef {
        VersionedElementRef::new(self.element_type, self.id, self.version)
    }

    /// Whether no newer version has been committed.
    pub fn is_current(&self) -> bool {
        self.next_sequence_id.is_none()
    }

    /// Whether this row was the current version as of `at`.
    pub fn visible_at(&self, at: SequenceId) -> bool {
        self.sequence_id <= at && self.next_sequence_id.map_or(true, |next| at < next)
    }

    /// The change action that produced this version.
    pub fn action(&self) -> DiffAction {
        if self.version == 1 {
            DiffAction::Create
        } else if self.visible {
            DiffAction::Modify
        } else {
            DiffAction::Delete
        }
    }

    /// The sequence point at which this version's members and parents should
    /// be read, given a reader snapshot `at`.
    ///
    /// A version superseded before `at` is shown as it was just before its
    /// successor; a version committed after `at` moves the point forward to
    /// its own commit.
    pub fn snapshot_point(&self, at: SequenceId) -> SequenceId {
        let point = match self.next_sequence_id {
            Some(next) if next <= at => next.prev(),
            _ => at,
        };
        point.max(self.sequence_id)
    }

    /// Whether a newer version had been committed as of `at`.
    pub fn superseded_at(&self, at: SequenceId) -> bool {
        self.next_sequence_id.is_some_and(|next| next <= at)
    }

    /// Member refs in order, with duplicates preserved.
    pub fn member_refs(&self) -> impl Iterator<Item = ElementRef> + '_ {
        self.members.iter().map(|m| m.element_ref)
    }
}
