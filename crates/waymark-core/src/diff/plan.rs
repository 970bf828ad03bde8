//! Validation of a diff batch against one snapshot.
//!
//! Planning is read-only. It checks every operation against the store as of
//! the snapshot plus the state the batch has built so far, and records what it
//! read so the commit can detect a concurrent change.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::ElementLimits;
use crate::error::{ErrorCode, WaymarkError, WaymarkResult};
use crate::traits::{CommitPlan, ElementStore, PlannedWrite};
use crate::types::{DiffAction, DiffBatch, DiffOperation, ElementRef, ElementType, SequenceId};

/// State of one element after the operations planned so far.
#[derive(Debug, Clone)]
struct Touched {
    version: u32,
    visible: bool,
    members: Vec<ElementRef>,
}

/// Validate `batch` against the store as of `snapshot` and produce the
/// writes to commit.
pub(crate) async fn plan_batch(
    store: &dyn ElementStore,
    limits: &ElementLimits,
    batch: &DiffBatch,
    snapshot: SequenceId,
) -> WaymarkResult<CommitPlan> {
    if batch.changeset_id <= 0 {
        return Err(WaymarkError::validation("Changeset id must be positive"));
    }
    for op in &batch.operations {
        check_shape(op)?;
        check_limits(op, limits)?;
    }

    let mut seen = HashSet::new();
    let targets: Vec<ElementRef> = batch
        .operations
        .iter()
        .filter(|op| op.action != DiffAction::Create && !op.element_ref.is_placeholder())
        .map(|op| op.element_ref)
        .filter(|r| seen.insert(*r))
        .collect();
    let stored: HashMap<_, _> = store
        .get_by_refs(&targets, snapshot, false, None)
        .await?
        .into_iter()
        .map(|e| (e.element_ref(), e))
        .collect();

    let mut touched: HashMap<ElementRef, Touched> = HashMap::new();
    let mut order: Vec<ElementRef> = Vec::new();
    let mut read_set: Vec<ElementRef> = Vec::new();
    let mut writes = Vec::with_capacity(batch.len());

    for op in &batch.operations {
        let element_ref = op.element_ref;
        if op.action != DiffAction::Delete {
            if let Some(member) = op
                .members
                .iter()
                .map(|m| m.element_ref)
                .find(|m| m.is_placeholder() && !touched.contains_key(m))
            {
                return Err(WaymarkError::invalid_element(
                    ErrorCode::ValBadPlaceholder,
                    element_ref,
                    format!(
                        "{} references placeholder {} which is not created earlier in the batch",
                        element_ref, member
                    ),
                ));
            }
        }

        let (version, visible) = match op.action {
            DiffAction::Create => {
                if touched.contains_key(&element_ref) {
                    return Err(WaymarkError::invalid_element(
                        ErrorCode::ValBadPlaceholder,
                        element_ref,
                        format!("Placeholder {} is created more than once", element_ref),
                    ));
                }
                (1, true)
            }
            DiffAction::Modify | DiffAction::Delete => {
                let (current_version, current_visible) = match touched.get(&element_ref) {
                    Some(t) => (t.version, t.visible),
                    None if element_ref.is_placeholder() => {
                        return Err(WaymarkError::invalid_element(
                            ErrorCode::ValBadPlaceholder,
                            element_ref,
                            format!(
                                "Placeholder {} is not created earlier in the batch",
                                element_ref
                            ),
                        ))
                    }
                    None => {
                        let row = stored
                            .get(&element_ref)
                            .ok_or_else(|| WaymarkError::not_found(element_ref))?;
                        read_set.push(element_ref);
                        (row.version, row.visible)
                    }
                };
                if op.version != current_version {
                    return Err(WaymarkError::version_conflict(
                        element_ref,
                        op.version,
                        current_version,
                    ));
                }
                if op.action == DiffAction::Delete && !current_visible {
                    return Err(WaymarkError::invalid_element(
                        ErrorCode::ValAlreadyDeleted,
                        element_ref,
                        format!("Element {} is already deleted", element_ref),
                    ));
                }
                (current_version + 1, op.action == DiffAction::Modify)
            }
        };

        let write = planned_write(op, version, visible);
        if !touched.contains_key(&element_ref) {
            order.push(element_ref);
        }
        touched.insert(
            element_ref,
            Touched {
                version,
                visible,
                members: write.members.iter().map(|m| m.element_ref).collect(),
            },
        );
        writes.push(write);
    }

    let deleted = check_still_referenced(store, snapshot, &touched, &order).await?;
    let external = check_members_exist(store, snapshot, &touched, &order).await?;

    read_set.extend(external);
    let mut seen = HashSet::new();
    read_set.retain(|r| seen.insert(*r));

    Ok(CommitPlan {
        snapshot,
        changeset_id: batch.changeset_id,
        writes,
        read_set,
        deleted,
    })
}

/// Reject deletes of elements still listed by a visible element, either in
/// the batch's final state or in the store outside the batch. Returns the
/// stored elements the batch deletes.
async fn check_still_referenced(
    store: &dyn ElementStore,
    snapshot: SequenceId,
    touched: &HashMap<ElementRef, Touched>,
    order: &[ElementRef],
) -> WaymarkResult<Vec<ElementRef>> {
    let deleted: Vec<ElementRef> = order
        .iter()
        .copied()
        .filter(|r| !touched[r].visible)
        .collect();
    if deleted.is_empty() {
        return Ok(Vec::new());
    }
    let deleted_set: HashSet<ElementRef> = deleted.iter().copied().collect();
    let mut referenced_by: BTreeMap<ElementRef, Vec<ElementRef>> = BTreeMap::new();

    for parent in order {
        let state = &touched[parent];
        if !state.visible {
            continue;
        }
        for member in state.members.iter().filter(|m| deleted_set.contains(m)) {
            referenced_by.entry(*member).or_default().push(*parent);
        }
    }

    let stored_deleted: Vec<ElementRef> = deleted
        .iter()
        .copied()
        .filter(|r| !r.is_placeholder())
        .collect();
    if !stored_deleted.is_empty() {
        let parents = store
            .get_many_parents(&stored_deleted, snapshot, None)
            .await?;
        for parent in parents.iter().filter(|p| !touched.contains_key(&p.element_ref())) {
            for member in parent.member_refs().filter(|m| deleted_set.contains(m)) {
                referenced_by
                    .entry(member)
                    .or_default()
                    .push(parent.element_ref());
            }
        }
    }

    if let Some(element) = deleted.iter().find(|r| referenced_by.contains_key(r)) {
        let mut parents = referenced_by.remove(element).unwrap_or_default();
        parents.sort();
        parents.dedup();
        return Err(WaymarkError::still_referenced(*element, parents));
    }
    Ok(stored_deleted)
}

/// Check that every member of every visible element in the final batch state
/// exists. Returns the stored members that were checked.
async fn check_members_exist(
    store: &dyn ElementStore,
    snapshot: SequenceId,
    touched: &HashMap<ElementRef, Touched>,
    order: &[ElementRef],
) -> WaymarkResult<Vec<ElementRef>> {
    let mut seen = HashSet::new();
    let mut external: Vec<(ElementRef, ElementRef)> = Vec::new();
    for parent in order {
        let state = &touched[parent];
        if !state.visible {
            continue;
        }
        for member in &state.members {
            match touched.get(member) {
                Some(m) if m.visible => {}
                Some(_) => {
                    return Err(WaymarkError::invalid_element(
                        ErrorCode::ValDanglingReference,
                        parent,
                        format!("{} references deleted element {}", parent, member),
                    ))
                }
                None => {
                    if seen.insert(*member) {
                        external.push((*parent, *member));
                    }
                }
            }
        }
    }
    if external.is_empty() {
        return Ok(Vec::new());
    }

    let refs: Vec<ElementRef> = external.iter().map(|(_, m)| *m).collect();
    let live: HashSet<ElementRef> = store
        .get_by_refs(&refs, snapshot, false, None)
        .await?
        .into_iter()
        .filter(|e| e.visible)
        .map(|e| e.element_ref())
        .collect();

    if let Some((parent, member)) = external.iter().find(|(_, m)| !live.contains(m)) {
        return Err(WaymarkError::invalid_element(
            ErrorCode::ValDanglingReference,
            parent,
            format!(
                "{} references {} which does not exist or is deleted",
                parent, member
            ),
        ));
    }
    Ok(refs)
}

fn planned_write(op: &DiffOperation, version: u32, visible: bool) -> PlannedWrite {
    if visible {
        PlannedWrite {
            action: op.action,
            element_ref: op.element_ref,
            version,
            visible,
            tags: op.tags.clone(),
            members: op.members.clone(),
            point: op.point,
        }
    } else {
        PlannedWrite {
            action: op.action,
            element_ref: op.element_ref,
            version,
            visible,
            tags: Default::default(),
            members: Vec::new(),
            point: None,
        }
    }
}

/// Checks that need nothing but the operation itself.
fn check_shape(op: &DiffOperation) -> WaymarkResult<()> {
    let element_ref = op.element_ref;
    if element_ref.id == 0 {
        return Err(WaymarkError::invalid_ref("Element id cannot be 0"));
    }
    match op.action {
        DiffAction::Create if !element_ref.is_placeholder() => {
            return Err(WaymarkError::invalid_element(
                ErrorCode::ValBadPlaceholder,
                element_ref,
                format!(
                    "Created element {} must use a negative placeholder id",
                    element_ref
                ),
            )
            .with_suggestion("Use ids like -1, -2 for new elements"));
        }
        DiffAction::Modify | DiffAction::Delete if op.version == 0 => {
            return Err(WaymarkError::invalid_element(
                ErrorCode::ValBadVersion,
                element_ref,
                format!("{} of {} requires a base version", op.action, element_ref),
            ));
        }
        DiffAction::Delete => return Ok(()),
        _ => {}
    }

    let element_type = element_ref.element_type;
    if let Some(member) = op
        .members
        .iter()
        .find(|m| !element_type.accepts_member(m.element_ref.element_type))
    {
        let message = match element_type {
            ElementType::Node => format!("Node {} cannot have members", element_ref),
            _ => format!(
                "Way {} may only contain nodes, found {}",
                element_ref, member.element_ref
            ),
        };
        return Err(WaymarkError::invalid_element(
            ErrorCode::ValBadMember,
            element_ref,
            message,
        ));
    }

    match (element_type, op.point) {
        (ElementType::Node, None) => Err(WaymarkError::invalid_element(
            ErrorCode::ValInvalidInput,
            element_ref,
            format!("Node {} requires a point", element_ref),
        )),
        (ElementType::Node, Some(point)) if !point.is_valid() => {
            Err(WaymarkError::invalid_element(
                ErrorCode::ValInvalidInput,
                element_ref,
                format!("Node {} has coordinates out of range", element_ref),
            ))
        }
        (ElementType::Way | ElementType::Relation, Some(_)) => {
            Err(WaymarkError::invalid_element(
                ErrorCode::ValInvalidInput,
                element_ref,
                format!("{} {} cannot have a point", element_type, element_ref),
            ))
        }
        _ => Ok(()),
    }
}

fn check_limits(op: &DiffOperation, limits: &ElementLimits) -> WaymarkResult<()> {
    if op.action == DiffAction::Delete {
        return Ok(());
    }
    let element_ref = op.element_ref;
    let exceeded =
        |message: String| WaymarkError::invalid_element(ErrorCode::ValLimitExceeded, element_ref, message);

    if op.tags.len() > limits.max_tags {
        return Err(exceeded(format!(
            "{} has {} tags, limit is {}",
            element_ref,
            op.tags.len(),
            limits.max_tags
        )));
    }
    if let Some(key) = op
        .tags
        .keys()
        .find(|k| k.chars().count() > limits.max_tag_key_length)
    {
        return Err(exceeded(format!(
            "{} has tag key longer than {} characters: {}",
            element_ref, limits.max_tag_key_length, key
        )));
    }
    let tags_size: usize = op.tags.iter().map(|(k, v)| k.len() + v.len()).sum();
    if tags_size > limits.max_tags_size {
        return Err(exceeded(format!(
            "{} tags total {} bytes, limit is {}",
            element_ref, tags_size, limits.max_tags_size
        )));
    }

    let max_members = match element_ref.element_type {
        ElementType::Node => None,
        ElementType::Way => Some(limits.max_way_members),
        ElementType::Relation => Some(limits.max_relation_members),
    };
    if let Some(max) = max_members.filter(|max| op.members.len() > *max) {
        return Err(exceeded(format!(
            "{} has {} members, limit is {}",
            element_ref,
            op.members.len(),
            max
        )));
    }
    Ok(())
}
