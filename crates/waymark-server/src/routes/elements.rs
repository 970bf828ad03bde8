//! Element read endpoints.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::middleware::SequencePoint;
use crate::state::AppState;
use waymark_core::{
    parse_lookups, ElementDetail, ElementLookup, ElementRef, ElementType, ElementVersion,
    HistoryPage, SequenceId,
};

/// Optional read snapshot shared by all read endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct AtQuery {
    /// Sequence point to read at. Defaults to the latest commit.
    pub at: Option<u64>,
}

impl AtQuery {
    fn at(&self) -> Option<SequenceId> {
        self.at.map(SequenceId::new)
    }
}

#[derive(Debug, Deserialize)]
pub struct ElementsQuery {
    /// Comma-separated references, e.g. `n1,w2v3`.
    pub refs: String,
    pub at: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<usize>,
    pub at: Option<u64>,
}

/// Response for a multi-element lookup.
#[derive(Debug, Serialize)]
pub struct ElementsResponse {
    /// Snapshot the rows were read at.
    pub at: SequenceId,
    pub elements: Vec<ElementVersion>,
}

/// Response for a parents lookup.
#[derive(Debug, Serialize)]
pub struct ParentsResponse {
    pub element: ElementRef,
    pub at: SequenceId,
    pub parents: Vec<ElementVersion>,
}

/// Parse `/:type/:id` path segments into a stored element reference.
fn element_ref(element_type: &str, id: i64) -> ApiResult<ElementRef> {
    let element_type: ElementType = element_type
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Unknown element type '{}'", element_type)))?;
    if id <= 0 {
        return Err(ApiError::bad_request(format!(
            "Element id must be positive, got {}",
            id
        )));
    }
    Ok(ElementRef::new(element_type, id))
}

/// Resolve a list of plain and versioned references.
/// GET /api/elements?refs=n1,w2v3&at=42
pub async fn get_elements(
    State(state): State<AppState>,
    Query(query): Query<ElementsQuery>,
) -> ApiResult<(Extension<SequencePoint>, Json<ElementsResponse>)> {
    let lookups = parse_lookups(&query.refs)?;
    if lookups.is_empty() {
        return Err(ApiError::bad_request("No element references given"));
    }

    let service = state.service();
    let at = service
        .resolver()
        .snapshot(query.at.map(SequenceId::new))
        .await?;
    let elements = service.resolve(&lookups, Some(at)).await?;

    Ok((
        Extension(SequencePoint(at)),
        Json(ElementsResponse { at, elements }),
    ))
}

/// Current version of an element with its members and parents.
/// GET /api/element/:type/:id
pub async fn get_element(
    State(state): State<AppState>,
    Path((element_type, id)): Path<(String, i64)>,
    Query(query): Query<AtQuery>,
) -> ApiResult<Json<ElementDetail>> {
    let element = element_ref(&element_type, id)?;
    let detail = state
        .service()
        .element_detail(ElementLookup::Current(element), query.at())
        .await?;
    Ok(Json(detail))
}

/// One exact version of an element.
/// GET /api/element/:type/:id/history/:version
pub async fn get_element_version(
    State(state): State<AppState>,
    Path((element_type, id, version)): Path<(String, i64, u32)>,
    Query(query): Query<AtQuery>,
) -> ApiResult<Json<ElementDetail>> {
    if version == 0 {
        return Err(ApiError::bad_request("Versions start at 1"));
    }
    let element = element_ref(&element_type, id)?;
    let detail = state
        .service()
        .element_detail(
            ElementLookup::Versioned(element.with_version(version)),
            query.at(),
        )
        .await?;
    Ok(Json(detail))
}

/// One page of an element's history, newest first.
/// GET /api/element/:type/:id/history?page=1
pub async fn get_history(
    State(state): State<AppState>,
    Path((element_type, id)): Path<(String, i64)>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryPage>> {
    let element = element_ref(&element_type, id)?;
    let page = state
        .service()
        .history(
            element,
            query.page.unwrap_or(1),
            query.at.map(SequenceId::new),
        )
        .await?;
    Ok(Json(page))
}

/// Ways and relations listing an element.
/// GET /api/element/:type/:id/parents
pub async fn get_parents(
    State(state): State<AppState>,
    Path((element_type, id)): Path<(String, i64)>,
    Query(query): Query<AtQuery>,
) -> ApiResult<(Extension<SequencePoint>, Json<ParentsResponse>)> {
    let element = element_ref(&element_type, id)?;
    let service = state.service();
    let at = service.resolver().snapshot(query.at()).await?;
    let parents = service.parents_of(element, Some(at)).await?;

    Ok((
        Extension(SequencePoint(at)),
        Json(ParentsResponse {
            element,
            at,
            parents,
        }),
    ))
}
