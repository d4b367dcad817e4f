use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tracing::{error, warn};

use crate::error::CacheError;
use crate::priority::PriorityGate;
use crate::range::{parse_range_header, IntRange};
use crate::stream::StreamRequestOutcome;

use super::ServerState;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Rewrites the loopback request's scheme/host/port onto the configured
/// origin, keeping path and query as-is (spec.md §4.6: "derive the
/// source URL by rewriting only scheme/host/port").
fn source_url(origin: &url::Url, uri: &Uri) -> url::Url {
    let mut url = origin.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    url
}

pub(crate) async fn serve(
    State(state): State<Arc<ServerState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let url = source_url(&state.origin, &uri);
    let fallback_content_type = mime_guess::from_path(uri.path())
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string();

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) => match parse_range_header(value) {
            Some(range) => range,
            None => return StatusCode::BAD_REQUEST.into_response(),
        },
        None => IntRange::full(),
    };

    let handle = match state.manager.create_stream(url).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to create cache stream");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    // `create_stream` already retains on our behalf; this handler always
    // releases exactly that one retain before returning, on every path.
    let result = match tokio::time::timeout(REQUEST_TIMEOUT, handle.request(range)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("request timed out waiting for cache stream response");
            handle.dispose().await;
            return StatusCode::GATEWAY_TIMEOUT.into_response();
        }
    };

    let response = match result {
        Ok(outcome) => {
            let priority = state.manager.priority().clone();
            build_response(range, outcome, &fallback_content_type, priority)
        }
        Err(e) => error_response(e, range),
    };
    handle.dispose().await;
    response
}

/// Drops `end_playback()` whenever the response body stream itself is
/// dropped — whether the client read it to completion or the connection
/// closed early — so playback-vs-pre-cache admission (spec.md §5) tracks
/// the real lifetime of a streaming read, not just the time it took to
/// build the response.
struct PlaybackGuard(Arc<PriorityGate>);

impl Drop for PlaybackGuard {
    fn drop(&mut self) {
        self.0.end_playback();
    }
}

fn build_response(
    range: IntRange,
    outcome: StreamRequestOutcome,
    fallback_content_type: &str,
    priority: Arc<PriorityGate>,
) -> Response {
    let StreamRequestOutcome {
        response,
        content_type,
        accept_ranges,
        source_length,
    } = outcome;

    let is_full = range.is_full_request(source_length);
    let status = if is_full {
        StatusCode::OK
    } else {
        StatusCode::PARTIAL_CONTENT
    };

    let content_type = content_type.unwrap_or_else(|| fallback_content_type.to_string());

    priority.begin_playback();
    let guard = PlaybackGuard(priority);
    let body_stream = response.map(move |chunk| {
        let _keep_alive = &guard;
        chunk.map_err(axum::Error::new)
    });
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type);

    if accept_ranges {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }

    if let Some(length) = range.len(source_length) {
        builder = builder.header(header::CONTENT_LENGTH, length.to_string());
    }

    if !is_full {
        if let Some(total) = source_length {
            let end = range.end.unwrap_or(total.saturating_sub(1));
            builder = builder.header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", range.start, end, total),
            );
        }
    }

    builder
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `416` carries `Content-Range: bytes */TOTAL` only when the total is
/// known at the point the range was rejected (spec.md §6); the Cache
/// Stream validates ranges before the source length is necessarily
/// resolved, so this implementation omits the header rather than guess.
fn error_response(error: CacheError, _range: IntRange) -> Response {
    match error {
        CacheError::InvalidRange | CacheError::HttpRange => {
            StatusCode::RANGE_NOT_SATISFIABLE.into_response()
        }
        other => other.status_code().into_response(),
    }
}
