//! Request tracing and CORS for the REST API.
//!
//! Every request runs in a `request` span. Handlers that read or commit at a
//! known sequence point attach a [`SequencePoint`] to their response, which
//! ends up in the `x-waymark-sequence` header and on the span.

use axum::{
    extract::Request,
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{field::Empty, Span};
use waymark_core::SequenceId;

/// Response header carrying the sequence id a response was read or committed at.
pub const SEQUENCE_HEADER: HeaderName = HeaderName::from_static("x-waymark-sequence");

/// Sequence point of a response, set by handlers as a response extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencePoint(pub SequenceId);

/// CORS for the read and diff endpoints.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE])
        .expose_headers([SEQUENCE_HEADER])
}

/// Span for one request. `sequence_id` and `changeset_id` are recorded later.
pub fn request_span(request: &Request) -> Span {
    tracing::info_span!(
        "request",
        method = %request.method(),
        uri = %request.uri(),
        sequence_id = Empty,
        changeset_id = Empty,
    )
}

/// Expose the handler's sequence point as a header and a span field.
pub async fn sequence_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;

    if let Some(SequencePoint(sequence_id)) = response.extensions().get::<SequencePoint>().copied()
    {
        Span::current().record("sequence_id", sequence_id.value());
        response
            .headers_mut()
            .insert(SEQUENCE_HEADER, HeaderValue::from(sequence_id.value()));
    }

    response
}
