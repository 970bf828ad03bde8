//! Reference resolution.
//!
//! Turns plain and versioned references into committed rows as of a sequence
//! point, and assembles the surroundings of an element (members, parents,
//! history) from consistent snapshots.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{WaymarkError, WaymarkResult};
use crate::traits::{ElementStore, VersionQuery};
use crate::types::{ElementRef, ElementVersion, SequenceId, VersionedElementRef};

/// A plain or versioned element reference as accepted by read APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ElementLookup {
    /// The version current at the read snapshot.
    Current(ElementRef),
    /// One exact version.
    Versioned(VersionedElementRef),
}

impl ElementLookup {
    pub fn element_ref(&self) -> ElementRef {
        match self {
            Self::Current(r) => *r,
            Self::Versioned(r) => r.element_ref(),
        }
    }
}

impl From<ElementRef> for ElementLookup {
    fn from(value: ElementRef) -> Self {
        Self::Current(value)
    }
}

impl From<VersionedElementRef> for ElementLookup {
    fn from(value: VersionedElementRef) -> Self {
        Self::Versioned(value)
    }
}

impl fmt::Display for ElementLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current(r) => r.fmt(f),
            Self::Versioned(r) => r.fmt(f),
        }
    }
}

impl FromStr for ElementLookup {
    type Err = WaymarkError;

    /// Parse `n1` or `n1v2`.
    fn from_str(s: &str) -> WaymarkResult<Self> {
        let has_version = s.get(1..).is_some_and(|rest| rest.contains('v'));
        if has_version {
            s.parse().map(Self::Versioned)
        } else {
            s.parse().map(Self::Current)
        }
    }
}

impl TryFrom<String> for ElementLookup {
    type Error = WaymarkError;

    fn try_from(value: String) -> WaymarkResult<Self> {
        value.parse()
    }
}

impl From<ElementLookup> for String {
    fn from(value: ElementLookup) -> Self {
        value.to_string()
    }
}

/// Parse a comma-separated list of lookups, ignoring empty entries.
pub fn parse_lookups(s: &str) -> WaymarkResult<Vec<ElementLookup>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect()
}

/// Members of one element resolved at a sequence point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMembers {
    /// Visible direct members, in first-listed order.
    pub members: Vec<ElementVersion>,
    /// Visible nodes of member ways that are not direct members themselves.
    pub way_nodes: Vec<ElementVersion>,
    /// Direct members that did not exist or were deleted at the point.
    pub dangling: Vec<ElementRef>,
}

/// One page of an element's history, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub element: ElementRef,
    /// 1-based page number.
    pub page: usize,
    pub num_pages: usize,
    pub current_version: u32,
    pub entries: Vec<ElementDetail>,
}

impl HistoryPage {
    pub fn versions(&self) -> impl Iterator<Item = &ElementVersion> {
        self.entries.iter().map(|e| &e.element)
    }
}

/// An element with the surroundings it had at `at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDetail {
    pub element: ElementVersion,
    /// Sequence point members and parents were read at.
    pub at: SequenceId,
    pub members: ResolvedMembers,
    pub parents: Vec<ElementVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_version: Option<u32>,
}

/// Resolves references against an [`ElementStore`].
#[derive(Clone)]
pub struct ReferenceResolver {
    store: Arc<dyn ElementStore>,
    history_page_size: usize,
}

impl ReferenceResolver {
    pub fn new(store: Arc<dyn ElementStore>, history_page_size: usize) -> Self {
        Self {
            store,
            history_page_size: history_page_size.max(1),
        }
    }

    /// The given point, or the latest committed one.
    pub async fn snapshot(&self, at: Option<SequenceId>) -> WaymarkResult<SequenceId> {
        match at {
            Some(at) => Ok(at),
            None => self.store.current_sequence_id().await,
        }
    }

    /// Rows for each lookup as of `at`, deduplicated, in first-request order.
    ///
    /// Elements that did not exist and versions committed after the snapshot
    /// are omitted. Deleted elements are returned.
    pub async fn resolve(
        &self,
        lookups: &[ElementLookup],
        at: Option<SequenceId>,
    ) -> WaymarkResult<Vec<ElementVersion>> {
        if lookups.is_empty() {
            return Ok(Vec::new());
        }
        let at = self.snapshot(at).await?;

        let mut seen = HashSet::new();
        let lookups: Vec<ElementLookup> = lookups
            .iter()
            .copied()
            .filter(|l| seen.insert(*l))
            .collect();
        let current: Vec<ElementRef> = lookups
            .iter()
            .filter_map(|l| match l {
                ElementLookup::Current(r) => Some(*r),
                ElementLookup::Versioned(_) => None,
            })
            .collect();
        let versioned: Vec<VersionedElementRef> = lookups
            .iter()
            .filter_map(|l| match l {
                ElementLookup::Versioned(r) => Some(*r),
                ElementLookup::Current(_) => None,
            })
            .collect();

        let (current_rows, versioned_rows) = futures::try_join!(
            self.store.get_by_refs(&current, at, false, None),
            self.store.get_by_versioned_refs(&versioned, None),
        )?;

        let mut found: HashMap<ElementLookup, ElementVersion> = HashMap::new();
        for row in current_rows {
            found.insert(ElementLookup::Current(row.element_ref()), row);
        }
        for row in versioned_rows.into_iter().filter(|r| r.sequence_id <= at) {
            found.insert(ElementLookup::Versioned(row.versioned_ref()), row);
        }

        Ok(lookups.iter().filter_map(|l| found.remove(l)).collect())
    }

    /// Resolve the members of `element` as of `at` in one batched fetch.
    pub async fn resolve_members(
        &self,
        element: &ElementVersion,
        at: SequenceId,
    ) -> WaymarkResult<ResolvedMembers> {
        if element.members.is_empty() {
            return Ok(ResolvedMembers::default());
        }
        let mut seen = HashSet::new();
        let direct: Vec<ElementRef> = element
            .member_refs()
            .filter(|r| seen.insert(*r))
            .collect();

        let rows = self.store.get_by_refs(&direct, at, true, None).await?;

        let mut members = Vec::new();
        let mut way_nodes = Vec::new();
        let mut live = HashSet::new();
        for row in rows.into_iter().filter(|r| r.visible) {
            if seen.contains(&row.element_ref()) {
                live.insert(row.element_ref());
                members.push(row);
            } else {
                way_nodes.push(row);
            }
        }
        let dangling: Vec<ElementRef> = direct.into_iter().filter(|r| !live.contains(r)).collect();
        if !dangling.is_empty() {
            tracing::debug!(
                element = %element.versioned_ref(),
                at = at.value(),
                dangling = dangling.len(),
                "Element has dangling members"
            );
        }

        Ok(ResolvedMembers {
            members,
            way_nodes,
            dangling,
        })
    }

    /// Ways and relations that list `element` as of `at`.
    pub async fn parents_of(
        &self,
        element: ElementRef,
        at: Option<SequenceId>,
    ) -> WaymarkResult<Vec<ElementVersion>> {
        let at = self.snapshot(at).await?;
        self.store.get_many_parents(&[element], at, None).await
    }

    /// One newest-first page of an element's history.
    ///
    /// Pages past the end are empty. `NotFound` if the element did not exist
    /// at the snapshot.
    pub async fn history(
        &self,
        element: ElementRef,
        page: usize,
        at: Option<SequenceId>,
    ) -> WaymarkResult<HistoryPage> {
        if page == 0 {
            return Err(WaymarkError::validation("History page numbers start at 1"));
        }
        let at = self.snapshot(at).await?;
        let current_version = self.store.get_current_version(element, at).await?;

        let size = self.history_page_size;
        let num_pages = (current_version as usize).div_ceil(size);
        let skipped = size.saturating_mul(page - 1);

        let versions = if skipped >= current_version as usize {
            Vec::new()
        } else {
            let max_version = current_version - skipped as u32;
            let min_version = max_version.saturating_sub(size as u32 - 1).max(1);
            self.store
                .get_versions(
                    element,
                    at,
                    VersionQuery::newest_first()
                        .with_range(min_version, max_version)
                        .with_limit(size),
                )
                .await?
        };

        let entries =
            futures::future::try_join_all(versions.into_iter().map(|v| self.detail_of(v, at)))
                .await?;

        Ok(HistoryPage {
            element,
            page,
            num_pages,
            current_version,
            entries,
        })
    }

    /// An element with its members and parents.
    pub async fn element_detail(
        &self,
        lookup: ElementLookup,
        at: Option<SequenceId>,
    ) -> WaymarkResult<ElementDetail> {
        let at = self.snapshot(at).await?;
        let element = match lookup {
            ElementLookup::Current(r) => self
                .store
                .get_by_refs(&[r], at, false, Some(1))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| WaymarkError::not_found(r))?,
            ElementLookup::Versioned(r) => self
                .store
                .get_by_versioned_refs(&[r], Some(1))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| WaymarkError::version_not_found(r))?,
        };
        self.detail_of(element, at).await
    }

    /// Members and parents of `element`, read concurrently at its snapshot
    /// point. Deleted elements have neither.
    async fn detail_of(
        &self,
        element: ElementVersion,
        at: SequenceId,
    ) -> WaymarkResult<ElementDetail> {
        let point = element.snapshot_point(at);

        let (members, parents) = if element.visible {
            let listed = [element.element_ref()];
            tokio::try_join!(
                self.resolve_members(&element, point),
                self.store.get_many_parents(&listed, point, None),
            )?
        } else {
            (ResolvedMembers::default(), Vec::new())
        };

        let prev_version = (element.version > 1).then(|| element.version - 1);
        let next_version = element
            .superseded_at(at.max(point))
            .then(|| element.version + 1);

        Ok(ElementDetail {
            element,
            at: point,
            members,
            parents,
            prev_version,
            next_version,
        })
    }
}
