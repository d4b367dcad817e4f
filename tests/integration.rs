//! Cross-component scenario coverage (the six concrete scenarios plus
//! boundary behaviors). Unit-level behavior of each component already has
//! its own `#[cfg(test)]` module; this file exercises them wired together
//! through `CacheManager`, the way a real caller would.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::{stream, StreamExt};
use tempfile::tempdir;
use tokio::net::TcpListener;
use url::Url;
use wiremock::matchers::{header as wm_header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cachecast::headers::CachedResponseHeaders;
use cachecast::metadata::{CacheFiles, CacheMetadataFile};
use cachecast::range::{parse_range_header, IntRange};
use cachecast::response::StreamResponseKind;
use cachecast::{CacheConfig, CacheError, CacheManager};

fn test_config() -> CacheConfig {
    CacheConfig {
        min_chunk_size: 16,
        read_timeout_secs: 10,
        ..Default::default()
    }
}

/// A small origin stand-in that streams a fixed payload in paced chunks
/// and honors `Range` requests, for scenarios a canned mock response can't
/// reproduce: concurrent readers racing a slow download, split downloads,
/// and buffer overflow all depend on the origin actually taking time to
/// deliver bytes.
struct PacedOriginState {
    payload: Bytes,
    chunk_size: usize,
    delay: Duration,
    request_count: AtomicUsize,
    observed_ranges: Mutex<Vec<Option<String>>>,
}

async fn start_paced_origin(
    payload: Vec<u8>,
    chunk_size: usize,
    delay: Duration,
) -> (SocketAddr, Arc<PacedOriginState>) {
    let state = Arc::new(PacedOriginState {
        payload: Bytes::from(payload),
        chunk_size,
        delay,
        request_count: AtomicUsize::new(0),
        observed_ranges: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/*path", get(serve_paced))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, state)
}

async fn serve_paced(State(state): State<Arc<PacedOriginState>>, headers: HeaderMap) -> Response {
    state.request_count.fetch_add(1, Ordering::SeqCst);
    let range_value = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state
        .observed_ranges
        .lock()
        .unwrap()
        .push(range_value.clone());

    let total = state.payload.len() as u64;
    let range = range_value.as_deref().and_then(parse_range_header);
    let (start, end_exclusive, status) = match &range {
        Some(r) => (
            r.start,
            r.end.map(|e| e + 1).unwrap_or(total).min(total),
            StatusCode::PARTIAL_CONTENT,
        ),
        None => (0, total, StatusCode::OK),
    };

    let slice = state.payload.slice(start as usize..end_exclusive as usize);
    let chunk_size = state.chunk_size.max(1);
    let delay = state.delay;
    let chunks: Vec<Bytes> = slice
        .chunks(chunk_size)
        .map(|c| Bytes::copy_from_slice(c))
        .collect();
    let body_stream = stream::iter(chunks).then(move |chunk| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, std::io::Error>(chunk)
    });

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, (end_exclusive - start).to_string())
        .header(header::ACCEPT_RANGES, "bytes");
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end_exclusive.saturating_sub(1), total),
        );
    }
    builder.body(Body::from_stream(body_stream)).unwrap()
}

async fn collect(mut response: cachecast::StreamResponse) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = response.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

/// Scenario 1: cold full fetch.
#[tokio::test]
async fn cold_full_fetch_serves_complete_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/video.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"ABCDEFGHIJ".to_vec())
                .insert_header("content-length", "10")
                .insert_header("accept-ranges", "bytes"),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.cache_directory = Some(dir.path().to_path_buf());
    let manager = CacheManager::new(config).unwrap();
    let url = Url::parse(&format!("{}/video.bin", server.uri())).unwrap();

    let handle = manager.create_stream(url).await.unwrap();
    let mut progress = handle.progress();
    let outcome = handle.request(IntRange::full()).await.unwrap();
    assert_eq!(outcome.source_length, Some(10));
    assert!(outcome.accept_ranges);
    let body = collect(outcome.response).await;
    assert_eq!(body, b"ABCDEFGHIJ");

    // Wait for the download to finish and progress to reach 1.0.
    loop {
        progress.changed().await.unwrap();
        let snapshot = progress.borrow().clone();
        if snapshot.value == Some(1.0) {
            break;
        }
    }

    let files = CacheFiles::for_url(dir.path(), handle.url());
    assert!(files.exists_complete());
    assert_eq!(tokio::fs::read(&files.complete).await.unwrap(), b"ABCDEFGHIJ");

    handle.dispose().await;
}

/// Scenario 2: two concurrent identical requests against a slow origin
/// produce exactly one outbound connection.
#[tokio::test]
async fn parallel_identical_requests_share_one_download() {
    let payload = b"0123456789".to_vec();
    let (addr, origin) = start_paced_origin(payload.clone(), 1, Duration::from_millis(10)).await;

    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.cache_directory = Some(dir.path().to_path_buf());
    let manager = CacheManager::new(config).unwrap();
    let url = Url::parse(&format!("http://{addr}/clip.bin")).unwrap();

    let a = manager.create_stream(url.clone()).await.unwrap();
    let b = manager.create_stream(url.clone()).await.unwrap();

    let (ra, rb) = tokio::join!(a.request(IntRange::full()), b.request(IntRange::full()));
    let (body_a, body_b) = tokio::join!(collect(ra.unwrap().response), collect(rb.unwrap().response));

    assert_eq!(body_a, payload);
    assert_eq!(body_b, payload);
    assert_eq!(origin.request_count.load(Ordering::SeqCst), 1);

    a.dispose().await;
    b.dispose().await;
}

/// Scenario 3: a range request that lands after the download has already
/// passed its start but before its end is served as Combined (file head,
/// live tail).
#[tokio::test]
async fn range_mid_download_is_combined() {
    let mut payload = Vec::with_capacity(1000);
    for i in 0..1000u32 {
        payload.push((i % 256) as u8);
    }
    let (addr, _origin) =
        start_paced_origin(payload.clone(), 100, Duration::from_millis(20)).await;

    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.cache_directory = Some(dir.path().to_path_buf());
    let manager = CacheManager::new(config).unwrap();
    let url = Url::parse(&format!("http://{addr}/clip.bin")).unwrap();

    let a = manager.create_stream(url.clone()).await.unwrap();
    let a_task = {
        let a = a.clone();
        tokio::spawn(async move { a.download().await })
    };

    // After ~4-5 chunks (roughly 400-500 bytes in), the shared download is
    // well inside [200, 799] with comfortable margin either way.
    tokio::time::sleep(Duration::from_millis(90)).await;

    let outcome = a.request(IntRange::new(200, Some(799))).await.unwrap();
    assert_eq!(outcome.response.kind(), StreamResponseKind::Combined);
    let body = collect(outcome.response).await;
    assert_eq!(body, &payload[200..=799]);

    a_task.await.unwrap().unwrap();
    a.dispose().await;
}

/// Scenario 4: a range request far enough ahead of the shared download
/// opens its own split download instead of waiting for it.
#[tokio::test]
async fn far_ahead_range_opens_split_download() {
    let mut payload = Vec::with_capacity(1000);
    for i in 0..1000u32 {
        payload.push((i % 256) as u8);
    }
    let (addr, origin) = start_paced_origin(payload.clone(), 10, Duration::from_millis(30)).await;

    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.cache_directory = Some(dir.path().to_path_buf());
    config.range_request_split_threshold = Some(100);
    let manager = CacheManager::new(config).unwrap();
    let url = Url::parse(&format!("http://{addr}/clip.bin")).unwrap();

    let a = manager.create_stream(url.clone()).await.unwrap();
    let a_task = {
        let a = a.clone();
        tokio::spawn(async move { a.download().await })
    };

    // A is only a couple of chunks in (well under byte 500) when B arrives.
    tokio::time::sleep(Duration::from_millis(60)).await;

    let outcome = a.request(IntRange::new(600, Some(899))).await.unwrap();
    assert_eq!(outcome.response.kind(), StreamResponseKind::SplitRangeDownload);
    let body = collect(outcome.response).await;
    assert_eq!(body, &payload[600..=899]);

    assert_eq!(origin.request_count.load(Ordering::SeqCst), 2);
    let ranges = origin.observed_ranges.lock().unwrap().clone();
    assert!(ranges.iter().any(|r| r.as_deref() == Some("bytes=600-")));

    a_task.await.unwrap().unwrap();
    a.dispose().await;
}

/// Scenario 5: a resumed download whose origin headers changed resets the
/// partial cache and refetches from scratch, surfacing the mismatch.
#[tokio::test]
async fn source_changed_on_resume_resets_and_refetches() {
    let server = MockServer::start().await;
    let url = Url::parse(&format!("{}/movie.bin", server.uri())).unwrap();

    let dir = tempdir().unwrap();
    let files = CacheFiles::for_url(dir.path(), &url);
    files.ensure_parent_dir().await.unwrap();
    tokio::fs::write(&files.partial, vec![0u8; 500]).await.unwrap();
    let saved_headers = CachedResponseHeaders::from_map(
        [
            ("etag".to_string(), "\"v1\"".to_string()),
            ("content-length".to_string(), "1000".to_string()),
            ("accept-ranges".to_string(), "bytes".to_string()),
        ]
        .into_iter()
        .collect(),
    );
    CacheMetadataFile::new(&url, &saved_headers, true)
        .save(&files.metadata)
        .await
        .unwrap();

    // The resumed request (`Range: bytes=500-`) gets a different resource.
    let new_body = vec![7u8; 1200];
    Mock::given(method("GET"))
        .and(path("/movie.bin"))
        .and(wm_header("range", "bytes=500-"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(new_body[500..].to_vec())
                .insert_header("etag", "\"v2\"")
                .insert_header("accept-ranges", "bytes"),
        )
        .mount(&server)
        .await;
    // The restarted full fetch that follows the reset.
    Mock::given(method("GET"))
        .and(path("/movie.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(new_body.clone())
                .insert_header("content-length", "1200")
                .insert_header("etag", "\"v2\"")
                .insert_header("accept-ranges", "bytes"),
        )
        .mount(&server)
        .await;

    let mut config = test_config();
    config.cache_directory = Some(dir.path().to_path_buf());
    let manager = CacheManager::new(config).unwrap();
    let handle = manager.create_stream(url).await.unwrap();

    let mut progress = handle.progress();
    let saw_source_changed = tokio::spawn(async move {
        loop {
            if progress.changed().await.is_err() {
                return false;
            }
            if matches!(
                progress.borrow().last_error,
                Some(CacheError::CacheSourceChanged)
            ) {
                return true;
            }
        }
    });

    let path = tokio::time::timeout(Duration::from_secs(5), handle.download())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), new_body);
    assert!(saw_source_changed.await.unwrap());

    handle.dispose().await;
}

/// Scenario 6: an unread `DownloadOnly` subscriber falls behind the
/// shared downloader's broadcast and is told so instead of silently
/// buffering without bound. `max_buffer_size` uses this crate's own
/// enforced floor rather than the spec's illustrative 4096, with the
/// payload scaled up proportionally so the overflow margin is the same.
#[tokio::test]
async fn unread_subscriber_exceeds_max_buffer_size() {
    let payload = vec![0u8; 4 * 1024 * 1024];
    let (addr, _origin) = start_paced_origin(payload, 64 * 1024, Duration::ZERO).await;

    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.cache_directory = Some(dir.path().to_path_buf());
    config.max_buffer_size = cachecast::config::MIN_MAX_BUFFER_SIZE;
    config.min_chunk_size = 128 * 1024;
    let manager = CacheManager::new(config).unwrap();
    let url = Url::parse(&format!("http://{addr}/big.bin")).unwrap();

    let handle = manager.create_stream(url).await.unwrap();
    let outcome = handle.request(IntRange::full()).await.unwrap();

    // Let the shared downloader race far ahead without ever polling the
    // response stream.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut response = outcome.response;
    let first = response.next().await.unwrap();
    assert_eq!(first, Err(CacheError::ExceededMaxBufferSize));

    handle.dispose().await;
}

/// Boundary: a range starting exactly at the known source length is
/// rejected rather than silently served as empty.
#[tokio::test]
async fn range_starting_at_source_length_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clip.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"0123456789".to_vec())
                .insert_header("content-length", "10")
                .insert_header("accept-ranges", "bytes"),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.cache_directory = Some(dir.path().to_path_buf());
    let manager = CacheManager::new(config).unwrap();
    let url = Url::parse(&format!("{}/clip.bin", server.uri())).unwrap();
    let handle = manager.create_stream(url).await.unwrap();

    // Force headers to resolve first so the request is actually evaluated
    // against a known source length rather than queued as Pending.
    handle.download().await.unwrap();

    let result = handle.request(IntRange::new(10, None)).await;
    assert!(matches!(result, Err(CacheError::InvalidRange)));

    handle.dispose().await;
}

/// Boundary: an omitted range end resolves to the rest of the resource.
#[tokio::test]
async fn omitted_range_end_reads_to_end_of_resource() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clip.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"0123456789".to_vec())
                .insert_header("content-length", "10")
                .insert_header("accept-ranges", "bytes"),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.cache_directory = Some(dir.path().to_path_buf());
    let manager = CacheManager::new(config).unwrap();
    let url = Url::parse(&format!("{}/clip.bin", server.uri())).unwrap();
    let handle = manager.create_stream(url).await.unwrap();
    handle.download().await.unwrap();

    let outcome = handle.request(IntRange::new(7, None)).await.unwrap();
    let body = collect(outcome.response).await;
    assert_eq!(body, b"789");

    handle.dispose().await;
}

/// Boundary: `rangeRequestSplitThreshold = 0` forces every seek into a
/// split download, with no regression to the shared downloader.
#[tokio::test]
async fn zero_split_threshold_always_splits() {
    let payload = b"0123456789ABCDEF".to_vec();
    let (addr, origin) = start_paced_origin(payload.clone(), 2, Duration::from_millis(5)).await;

    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.cache_directory = Some(dir.path().to_path_buf());
    config.range_request_split_threshold = Some(0);
    let manager = CacheManager::new(config).unwrap();
    let url = Url::parse(&format!("http://{addr}/clip.bin")).unwrap();

    let handle = manager.create_stream(url).await.unwrap();
    let a_task = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.download().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Even a range starting at byte 0 — right where the shared download
    // already is — still splits once the threshold is zero.
    let outcome = handle.request(IntRange::new(0, Some(3))).await.unwrap();
    assert_eq!(outcome.response.kind(), StreamResponseKind::SplitRangeDownload);
    let body = collect(outcome.response).await;
    assert_eq!(body, &payload[0..=3]);

    assert!(origin.request_count.load(Ordering::SeqCst) >= 2);

    a_task.await.unwrap().unwrap();
    handle.dispose().await;
}
