use crate::tracing::RequestId;
use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

/// Header carrying the correlation id in both directions
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest caller-supplied id that is echoed back; longer ids are replaced.
const MAX_REQUEST_ID_LEN: usize = 128;

fn inbound_request_id(request: &Request) -> Option<RequestId> {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(RequestId::new)
}

/// Tags the request with an id, scopes it for error bodies and response
/// metadata, and echoes it on the response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = inbound_request_id(&request).unwrap_or_default();
    let header_value = HeaderValue::from_str(request_id.as_str()).ok();
    if let Some(value) = header_value.clone() {
        request
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    request.extensions_mut().insert(request_id.clone());

    let span = tracing::info_span!("request", request_id = %request_id);
    let mut response = crate::tracing::scope_request_id(
        request_id,
        async move { next.run(request).await }.instrument(span),
    )
    .await;

    if let Some(value) = header_value {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}
