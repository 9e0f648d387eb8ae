use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Attach a correlation id to every response (generated when the caller did
/// not supply one) and emit one structured log line per request.
pub async fn request_context(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let req_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let identity = state.auth.identity_label(req.headers());
    let start = Instant::now();

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&req_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    tracing::info!(
        req_id = %req_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        identity = identity.as_deref().unwrap_or("-"),
        latency_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}
