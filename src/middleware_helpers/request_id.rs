use crate::tracing::RequestId;
use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

/// Header carrying the request id in both directions
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest caller-supplied id that is reused as is
const MAX_INCOMING_ID_LEN: usize = 128;

/// Tags the request with an id (the caller's, when usable) and echoes it back
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let incoming = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .filter(|value| !value.is_empty() && value.len() <= MAX_INCOMING_ID_LEN)
        .and_then(|value| value.to_str().ok().map(|s| (RequestId::new(s), value.clone())));
    let (request_id, header_value) = match incoming {
        Some(pair) => pair,
        None => generated_id(),
    };

    request
        .headers_mut()
        .insert(HeaderName::from_static(REQUEST_ID_HEADER), header_value.clone());
    request.extensions_mut().insert(request_id.clone());

    let span = tracing::info_span!("request", request_id = %request_id);
    let mut response = crate::tracing::scope_request_id(
        request_id,
        async move { next.run(request).await }.instrument(span),
    )
    .await;

    response
        .headers_mut()
        .insert(HeaderName::from_static(REQUEST_ID_HEADER), header_value);
    response
}

fn generated_id() -> (RequestId, HeaderValue) {
    let id = RequestId::generate();
    match HeaderValue::from_str(id.as_str()) {
        Ok(value) => (id, value),
        Err(_) => (RequestId::new("unknown"), HeaderValue::from_static("unknown")),
    }
}
