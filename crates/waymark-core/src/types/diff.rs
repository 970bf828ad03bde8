//! Diff batches submitted by editors and the results returned to them.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use super::{ElementMember, ElementRef, Point, SequenceId};

/// Kind of change a diff operation applies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiffAction {
    Create,
    Modify,
    Delete,
}

/// One proposed change inside a [`DiffBatch`].
///
/// For `create`, `element_ref.id` is a negative placeholder and `version` is
/// ignored. For `modify` and `delete`, `version` is the base version the client
/// believes is current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffOperation {
    pub action: DiffAction,
    #[serde(rename = "ref")]
    pub element_ref: ElementRef,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub members: Vec<ElementMember>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<Point>,
}

impl DiffOperation {
    fn new(action: DiffAction, element_ref: ElementRef, version: u32) -> Self {
        Self {
            action,
            element_ref,
            version,
            tags: BTreeMap::new(),
            members: Vec::new(),
            point: None,
        }
    }

    /// Create a node at a placeholder id.
    pub fn create_node(placeholder: i64, point: Point) -> Self {
        Self::new(DiffAction::Create, ElementRef::node(placeholder), 0).with_point(point)
    }

    /// Create a way at a placeholder id over the given node refs.
    pub fn create_way(placeholder: i64, nodes: impl IntoIterator<Item = ElementRef>) -> Self {
        Self::new(DiffAction::Create, ElementRef::way(placeholder), 0)
            .with_members(nodes.into_iter().map(ElementMember::new))
    }

    /// Create a relation at a placeholder id.
    pub fn create_relation(
        placeholder: i64,
        members: impl IntoIterator<Item = ElementMember>,
    ) -> Self {
        Self::new(DiffAction::Create, ElementRef::relation(placeholder), 0).with_members(members)
    }

    /// Modify an element, replacing its tags, members and point.
    pub fn modify(element_ref: ElementRef, base_version: u32) -> Self {
        Self::new(DiffAction::Modify, element_ref, base_version)
    }

    /// Delete an element.
    pub fn delete(element_ref: ElementRef, base_version: u32) -> Self {
        Self::new(DiffAction::Delete, element_ref, base_version)
    }

    /// Builder: set a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Builder: replace all tags.
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Builder: replace members.
    pub fn with_members(mut self, members: impl IntoIterator<Item = ElementMember>) -> Self {
        self.members = members.into_iter().collect();
        self
    }

    /// Builder: set the node position.
    pub fn with_point(mut self, point: Point) -> Self {
        self.point = Some(point);
        self
    }
}

/// An ordered batch of operations committed all-or-nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffBatch {
    pub changeset_id: i64,
    pub operations: Vec<DiffOperation>,
}

impl DiffBatch {
    pub fn new(changeset_id: i64) -> Self {
        Self {
            changeset_id,
            operations: Vec::new(),
        }
    }

    /// Builder: append an operation.
    pub fn push(mut self, operation: DiffOperation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// What one operation of a batch became once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResultEntry {
    pub action: DiffAction,
    /// The ref as written by the client (placeholder for creates).
    pub old_ref: ElementRef,
    /// The real ref assigned or targeted.
    pub new_ref: ElementRef,
    pub new_version: u32,
    pub sequence_id: SequenceId,
}

/// Result of a committed batch, one entry per operation in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub entries: Vec<DiffResultEntry>,
    /// Number of validate+commit attempts it took.
    pub attempts: u32,
    /// States the submission passed through, ending in `Committed`.
    #[serde(skip)]
    pub states: Vec<DiffState>,
}

impl DiffResult {
    /// Placeholder refs mapped to the real refs assigned at commit.
    pub fn assigned_ids(&self) -> HashMap<ElementRef, ElementRef> {
        self.entries
            .iter()
            .filter(|e| e.old_ref.is_placeholder())
            .map(|e| (e.old_ref, e.new_ref))
            .collect()
    }

    pub fn first_sequence_id(&self) -> Option<SequenceId> {
        self.entries.first().map(|e| e.sequence_id)
    }

    pub fn last_sequence_id(&self) -> Option<SequenceId> {
        self.entries.last().map(|e| e.sequence_id)
    }
}

/// Lifecycle of one diff submission.
///
/// `Pending -> Validating -> {Committed | Conflicted -> Validating | Rejected}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DiffState {
    Pending,
    Validating,
    Committed,
    Conflicted,
    Rejected,
}

impl DiffState {
    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(&self, next: DiffState) -> bool {
        use DiffState::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, Committed)
                | (Validating, Conflicted)
                | (Validating, Rejected)
                | (Conflicted, Validating)
                | (Conflicted, Rejected)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DiffState::Committed | DiffState::Rejected)
    }
}
