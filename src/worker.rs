use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::{mpsc, Notify};
use tracing::warn;
use url::Url;

use crate::error::CacheError;
use crate::headers::CachedResponseHeaders;

const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Messages a [`DownloadWorker`] hands upward to its [`crate::downloader::CacheDownloader`].
#[derive(Debug)]
pub enum WorkerMessage {
    /// Response headers, emitted exactly once per download session.
    Headers(CachedResponseHeaders),
    /// A coalesced chunk of body bytes.
    Data(Bytes),
    /// A retryable failure; already being retried after a 5s backoff.
    TransientError(CacheError),
    /// A non-retryable cache-consistency failure. Terminal: no further
    /// messages follow.
    Fatal(CacheError),
    /// Body reached end-of-stream. Terminal: no further messages follow.
    Done,
}

enum StreamOutcome {
    BodyEnded,
    Cancelled,
}

/// Opens an origin HTTP GET (optionally ranged), parses headers, and
/// streams the body with chunk coalescing, a read timeout, and
/// pause/resume (C2, spec.md §4.2).
pub struct DownloadWorker {
    client: Client,
    url: Url,
    read_timeout: Duration,
    min_chunk_size: usize,
    /// Shared with the owning `CacheDownloader`: the absolute origin
    /// offset to resume from on the next iteration. The downloader
    /// advances this after each `Data` message it processes, so a retry
    /// after a transient failure resumes exactly where the last
    /// successfully-ingested byte left off.
    position: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
}

impl DownloadWorker {
    pub fn new(
        client: Client,
        url: Url,
        read_timeout: Duration,
        min_chunk_size: usize,
        position: Arc<AtomicU64>,
    ) -> Self {
        Self {
            client,
            url,
            read_timeout,
            min_chunk_size,
            position,
            paused: Arc::new(AtomicBool::new(false)),
            resume_notify: Arc::new(Notify::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn wait_while_paused(&self) {
        while self.paused.load(Ordering::SeqCst) && !self.cancelled.load(Ordering::SeqCst) {
            self.resume_notify.notified().await;
        }
    }

    /// Runs until the body ends, the worker is cancelled, or a fatal
    /// (cache-consistency) error occurs. Retryable errors are retried
    /// internally after a 5s backoff and reported via
    /// `WorkerMessage::TransientError` for progress observation — they
    /// never terminate the loop.
    pub async fn run(&self, request_headers: HashMap<String, String>, events: mpsc::Sender<WorkerMessage>) {
        let mut headers_emitted = false;
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return;
            }
            self.wait_while_paused().await;
            if self.cancelled.load(Ordering::SeqCst) {
                return;
            }

            let start = self.position.load(Ordering::SeqCst);
            match self
                .fetch_and_stream(start, &request_headers, &mut headers_emitted, &events)
                .await
            {
                Ok(StreamOutcome::BodyEnded) => {
                    let _ = events.send(WorkerMessage::Done).await;
                    return;
                }
                Ok(StreamOutcome::Cancelled) => return,
                Err(e) if e.is_invalid_cache() => {
                    let _ = events.send(WorkerMessage::Fatal(e)).await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, url = %self.url, "download worker iteration failed, retrying in 5s");
                    let _ = events.send(WorkerMessage::TransientError(e)).await;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }

    async fn fetch_and_stream(
        &self,
        start: u64,
        request_headers: &HashMap<String, String>,
        headers_emitted: &mut bool,
        events: &mpsc::Sender<WorkerMessage>,
    ) -> Result<StreamOutcome, CacheError> {
        let mut builder = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::ACCEPT_ENCODING, "identity");
        for (name, value) in request_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if start > 0 {
            builder = builder.header(reqwest::header::RANGE, format!("bytes={start}-"));
        }

        let response = tokio::time::timeout(self.read_timeout, builder.send())
            .await
            .map_err(|_| CacheError::RequestTimedOut)??;

        let status = response.status();
        if start > 0 {
            if status != reqwest::StatusCode::PARTIAL_CONTENT {
                return Err(CacheError::HttpRange);
            }
        } else if status != reqwest::StatusCode::OK {
            return Err(CacheError::HttpStatusCode(status.as_u16()));
        }

        if !*headers_emitted {
            let headers = CachedResponseHeaders::from_reqwest(response.headers());
            let _ = events.send(WorkerMessage::Headers(headers)).await;
            *headers_emitted = true;
        }

        let mut body = response.bytes_stream();
        let mut coalesced = BytesMut::new();

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(StreamOutcome::Cancelled);
            }
            self.wait_while_paused().await;
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(StreamOutcome::Cancelled);
            }

            match tokio::time::timeout(self.read_timeout, body.next()).await {
                Err(_) => return Err(CacheError::ReadTimedOut),
                Ok(None) => {
                    if !coalesced.is_empty() {
                        let _ = events
                            .send(WorkerMessage::Data(coalesced.split().freeze()))
                            .await;
                    }
                    return Ok(StreamOutcome::BodyEnded);
                }
                Ok(Some(Err(e))) => return Err(CacheError::from(e)),
                Ok(Some(Ok(bytes))) => {
                    coalesced.extend_from_slice(&bytes);
                    if coalesced.len() >= self.min_chunk_size {
                        let _ = events
                            .send(WorkerMessage::Data(coalesced.split().freeze()))
                            .await;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for DownloadWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadWorker")
            .field("url", &self.url)
            .field("paused", &self.is_paused())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
