use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use reqwest::Client;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::headers::CachedResponseHeaders;
use crate::metadata::{CacheFiles, CacheMetadataFile};
use crate::sink::BufferedSink;
use crate::worker::{DownloadWorker, WorkerMessage};

const MIN_BROADCAST_CAPACITY: usize = 8;

/// Requests serviced by the `pump` task itself, so they're naturally
/// serialized against its own mutation of `sink`/`position`/`bytes_tx`
/// (spec.md §4.3 step 2-3 handover: "file lags stream → pause worker,
/// flush sink, then fulfill combined").
enum DownloaderControl {
    /// Pause the worker, flush the sink, and report the now-durable
    /// position together with a broadcast subscription taken in the same
    /// breath — so a `Combined`/`DownloadOnly` response can never drop or
    /// duplicate a byte at the file/broadcast seam (invariant 7, P4). The
    /// worker stays paused until the caller calls `resume()`.
    Quiesce {
        reply: oneshot::Sender<Result<(u64, broadcast::Receiver<Result<Bytes, CacheError>>), CacheError>>,
    },
}

/// Progress signals the owning `CacheStream` actor reacts to. Plain
/// `Data` bytes travel over the broadcast channel instead; this channel
/// only carries state transitions.
#[derive(Debug)]
pub enum DownloaderEvent {
    /// Headers have arrived (or been revalidated); nothing terminal yet.
    Progress,
    /// The download finished and the cache file is now complete.
    Completed,
    /// The download cannot continue: a cache-consistency failure or an
    /// I/O error while finalizing.
    Fatal(CacheError),
}

/// Owns the on-disk sink, the origin worker, and the live broadcast of
/// freshly-downloaded bytes for one source URL (C3, spec.md §4.3).
/// A `CacheStream` drives exactly one of these per active download.
pub struct CacheDownloader {
    url: Url,
    files: CacheFiles,
    config: Arc<CacheConfig>,
    sink: Arc<BufferedSink>,
    position: Arc<AtomicU64>,
    headers: watch::Sender<Option<CachedResponseHeaders>>,
    bytes_tx: broadcast::Sender<Result<Bytes, CacheError>>,
    worker: Arc<DownloadWorker>,
    finalize_lock: Mutex<()>,
    control_tx: mpsc::Sender<DownloaderControl>,
}

impl CacheDownloader {
    /// Starts a fresh download at offset zero, truncating any existing
    /// partial file.
    pub async fn start_new(
        client: Client,
        url: Url,
        config: Arc<CacheConfig>,
        files: CacheFiles,
    ) -> Result<(Arc<Self>, JoinHandle<()>, mpsc::Receiver<DownloaderEvent>), CacheError> {
        files.ensure_parent_dir().await?;
        let sink = Arc::new(BufferedSink::open(files.partial.clone(), 0, false).await?);
        Self::spawn(client, url, config, files, sink, None)
    }

    /// Resumes a partial download. `saved_headers` is the metadata
    /// persisted alongside the partial file; the first freshly-fetched
    /// `Headers` message is checked against it and a mismatch surfaces as
    /// `CacheError::CacheSourceChanged` instead of silently re-downloading
    /// a different resource (spec.md §4.3).
    pub async fn start_resume(
        client: Client,
        url: Url,
        config: Arc<CacheConfig>,
        files: CacheFiles,
        resume_from: u64,
        saved_headers: CachedResponseHeaders,
    ) -> Result<(Arc<Self>, JoinHandle<()>, mpsc::Receiver<DownloaderEvent>), CacheError> {
        files.ensure_parent_dir().await?;
        let sink = Arc::new(BufferedSink::open(files.partial.clone(), resume_from, true).await?);
        Self::spawn(client, url, config, files, sink, Some(saved_headers))
    }

    fn spawn(
        client: Client,
        url: Url,
        config: Arc<CacheConfig>,
        files: CacheFiles,
        sink: Arc<BufferedSink>,
        saved_headers: Option<CachedResponseHeaders>,
    ) -> Result<(Arc<Self>, JoinHandle<()>, mpsc::Receiver<DownloaderEvent>), CacheError> {
        let position = Arc::new(AtomicU64::new(sink.flushed_bytes()));
        let capacity = ((config.max_buffer_size / config.min_chunk_size.max(1)) as usize)
            .max(MIN_BROADCAST_CAPACITY);
        let (bytes_tx, _) = broadcast::channel(capacity);
        let (headers_tx, _) = watch::channel(None);

        let worker = Arc::new(DownloadWorker::new(
            client,
            url.clone(),
            config.read_timeout(),
            config.min_chunk_size as usize,
            position.clone(),
        ));

        let (control_tx, control_rx) = mpsc::channel(4);

        let this = Arc::new(Self {
            url,
            files,
            config: config.clone(),
            sink,
            position,
            headers: headers_tx,
            bytes_tx,
            worker: worker.clone(),
            finalize_lock: Mutex::new(()),
            control_tx,
        });

        let (worker_tx, worker_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(16);

        let request_headers = config.effective_request_headers();
        let worker_task = worker.clone();
        tokio::spawn(async move {
            worker_task.run(request_headers, worker_tx).await;
        });

        let pump_target = this.clone();
        let handle = tokio::spawn(async move {
            pump_target
                .pump(worker_rx, control_rx, event_tx, saved_headers)
                .await;
        });

        Ok((this, handle, event_rx))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    pub fn headers(&self) -> Option<CachedResponseHeaders> {
        self.headers.borrow().clone()
    }

    pub fn subscribe_headers(&self) -> watch::Receiver<Option<CachedResponseHeaders>> {
        self.headers.subscribe()
    }

    /// Subscribes to the live tail of freshly-downloaded bytes. A lagged
    /// receiver (the backlog outran `max_buffer_size`) surfaces as
    /// `CacheError::ExceededMaxBufferSize` on the next `recv`.
    pub fn subscribe_bytes(&self) -> broadcast::Receiver<Result<Bytes, CacheError>> {
        self.bytes_tx.subscribe()
    }

    /// Pauses the worker, flushes the sink, and subscribes to the live
    /// broadcast — all performed inside the `pump` task so they're
    /// serialized against every `Data` message it processes. Returns the
    /// position once flushed (exactly what the returned receiver's first
    /// future send will continue from) so a `Combined`/`DownloadOnly`
    /// response can line up its file-read bound and its broadcast skip
    /// without a gap or an overlap (spec.md §4.3 step 2-3 handover;
    /// invariant 7, P4). The worker is left paused; callers must call
    /// `resume()` once they've finished using the returned position,
    /// including on their own error paths.
    pub async fn quiesce(&self) -> Result<(u64, broadcast::Receiver<Result<Bytes, CacheError>>), CacheError> {
        let (reply, rx) = oneshot::channel();
        self.control_tx
            .send(DownloaderControl::Quiesce { reply })
            .await
            .map_err(|_| CacheError::DownloadStopped)?;
        rx.await.map_err(|_| CacheError::DownloadStopped)?
    }

    pub fn sink(&self) -> &Arc<BufferedSink> {
        &self.sink
    }

    pub fn pause(&self) {
        self.worker.pause();
    }

    pub fn resume(&self) {
        self.worker.resume();
    }

    pub fn cancel(&self) {
        self.worker.cancel();
    }

    async fn pump(
        self: Arc<Self>,
        mut messages: mpsc::Receiver<WorkerMessage>,
        mut control: mpsc::Receiver<DownloaderControl>,
        events: mpsc::Sender<DownloaderEvent>,
        mut saved_headers: Option<CachedResponseHeaders>,
    ) {
        loop {
            let message = tokio::select! {
                biased;
                message = messages.recv() => message,
                Some(control) = control.recv() => {
                    self.handle_quiesce(control).await;
                    continue;
                }
            };
            let Some(message) = message else { return };
            match message {
                WorkerMessage::Headers(fresh) => {
                    if let Some(saved) = saved_headers.take() {
                        if !fresh.matches_for_resume(&saved) {
                            warn!(url = %self.url, "origin headers changed across resume");
                            self.worker.cancel();
                            let _ = events
                                .send(DownloaderEvent::Fatal(CacheError::CacheSourceChanged))
                                .await;
                            return;
                        }
                    }
                    self.headers.send_replace(Some(fresh));
                    let _ = events.send(DownloaderEvent::Progress).await;
                }
                WorkerMessage::Data(chunk) => {
                    // Step 1: append to the sink before anything else is
                    // told about this chunk (spec.md §4.3 step 1).
                    self.sink.add(chunk.clone()).await;

                    // Steps 2-3: over the configured buffer ceiling, pause
                    // the worker and flush synchronously (resume on
                    // success); otherwise a background flush once the
                    // coalescing threshold is reached, without blocking
                    // ingest.
                    if self.sink.buffer_size() >= self.config.max_buffer_size as usize {
                        self.worker.pause();
                        match self.sink.flush().await {
                            Ok(()) => self.worker.resume(),
                            Err(e) => {
                                self.worker.cancel();
                                let _ = self.bytes_tx.send(Err(e.clone()));
                                let _ = events.send(DownloaderEvent::Fatal(e)).await;
                                return;
                            }
                        }
                    } else if self.sink.buffer_size() >= self.config.min_chunk_size as usize {
                        let sink = self.sink.clone();
                        let bytes_tx = self.bytes_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = sink.flush().await {
                                let _ = bytes_tx.send(Err(e));
                            }
                        });
                    }

                    // Steps 4-6: advance the position subscribers will be
                    // told about, then broadcast — position always moves
                    // before the chunk it describes is published (P2).
                    self.position
                        .fetch_add(chunk.len() as u64, Ordering::SeqCst);
                    let _ = self.bytes_tx.send(Ok(chunk));
                    let _ = events.send(DownloaderEvent::Progress).await;
                }
                WorkerMessage::TransientError(e) => {
                    debug!(url = %self.url, error = %e, "transient download error, worker is retrying");
                }
                WorkerMessage::Fatal(e) => {
                    let _ = self.bytes_tx.send(Err(e.clone()));
                    let _ = events.send(DownloaderEvent::Fatal(e)).await;
                    return;
                }
                WorkerMessage::Done => {
                    match self.finalize().await {
                        Ok(()) => {
                            info!(url = %self.url, bytes = self.position(), "download complete");
                            let _ = events.send(DownloaderEvent::Completed).await;
                        }
                        Err(e) => {
                            let _ = events.send(DownloaderEvent::Fatal(e)).await;
                        }
                    }
                    return;
                }
            }
        }
    }

    async fn handle_quiesce(&self, control: DownloaderControl) {
        match control {
            DownloaderControl::Quiesce { reply } => {
                self.worker.pause();
                let result = self.sink.flush().await.map(|()| {
                    let position = self.position();
                    let rx = self.bytes_tx.subscribe();
                    (position, rx)
                });
                let _ = reply.send(result);
            }
        }
    }

    /// Flushes and closes the sink, corrects the persisted content length
    /// when the origin never sent one (chunked/compressed responses),
    /// renames the partial file onto the complete path, and writes
    /// metadata when configured to.
    async fn finalize(&self) -> Result<(), CacheError> {
        let _guard = self.finalize_lock.lock().await;
        self.sink.close(true).await?;

        let mut headers = self.headers().unwrap_or_default();
        if headers.content_length().is_none() {
            headers = headers.with_content_length(self.position());
        }

        tokio::fs::rename(&self.files.partial, &self.files.complete).await?;

        if self.config.save_metadata {
            let metadata = CacheMetadataFile::new(&self.url, &headers, self.config.save_all_headers);
            metadata.save(&self.files.metadata).await?;
        }
        self.headers.send_replace(Some(headers));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> Arc<CacheConfig> {
        Arc::new(CacheConfig {
            min_chunk_size: 4,
            read_timeout_secs: 5,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn full_download_produces_complete_file_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/movie.mp4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"0123456789ABCDEF".to_vec())
                    .insert_header("content-length", "16"),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let url = Url::parse(&format!("{}/movie.mp4", server.uri())).unwrap();
        let files = CacheFiles::for_url(dir.path(), &url);

        let (downloader, _handle, mut events) =
            CacheDownloader::start_new(Client::new(), url, config(), files.clone())
                .await
                .unwrap();
        let mut rx = downloader.subscribe_bytes();
        let mut collected = Vec::new();

        loop {
            tokio::select! {
                Ok(chunk) = rx.recv() => {
                    if let Ok(bytes) = chunk {
                        collected.extend_from_slice(&bytes);
                    }
                }
                Some(event) = events.recv() => {
                    match event {
                        DownloaderEvent::Completed => break,
                        DownloaderEvent::Fatal(e) => panic!("unexpected failure: {e}"),
                        DownloaderEvent::Progress => {}
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(5)) => panic!("timed out"),
            }
        }

        assert!(files.exists_complete());
        assert!(!files.exists_partial());
        let on_disk = tokio::fs::read(&files.complete).await.unwrap();
        assert_eq!(on_disk, b"0123456789ABCDEF");
    }

    #[tokio::test]
    async fn resume_with_changed_etag_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/movie.mp4"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(b"NEWDATA".to_vec())
                    .insert_header("etag", "\"v2\""),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let url = Url::parse(&format!("{}/movie.mp4", server.uri())).unwrap();
        let files = CacheFiles::for_url(dir.path(), &url);
        tokio::fs::create_dir_all(files.partial.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&files.partial, b"OLDDATA").await.unwrap();

        let saved = CachedResponseHeaders::from_map(
            [("etag".to_string(), "\"v1\"".to_string())]
                .into_iter()
                .collect(),
        );

        let (_downloader, _handle, mut events) = CacheDownloader::start_resume(
            Client::new(),
            url,
            config(),
            files,
            7,
            saved,
        )
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            DownloaderEvent::Fatal(CacheError::CacheSourceChanged) => {}
            other => panic!("expected CacheSourceChanged, got {other:?}"),
        }
    }
}
