use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::downloader::{CacheDownloader, DownloaderEvent};
use crate::error::CacheError;
use crate::headers::CachedResponseHeaders;
use crate::metadata::{CacheFiles, CacheMetadataFile};
use crate::range::IntRange;
use crate::response::StreamResponse;

/// Progress snapshot published on every `CacheStream`'s watch channel
/// (spec.md §4.5 `progressStream`). `value` is `None` while the source
/// length is unknown; it only ever reaches `1.0` once the complete file
/// exists — during an active download it is capped at `0.99`.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub value: Option<f64>,
    pub last_error: Option<CacheError>,
}

/// A [`StreamResponse`] plus the header fields a loopback server needs to
/// build its own response without a second round trip to the actor
/// (spec.md §4.6: `Content-Type`, `Content-Length`/`Content-Range`,
/// `Accept-Ranges`).
pub struct StreamRequestOutcome {
    pub response: StreamResponse,
    pub content_type: Option<String>,
    pub accept_ranges: bool,
    pub source_length: Option<u64>,
}

struct PendingRequest {
    range: IntRange,
    reply: oneshot::Sender<Result<StreamRequestOutcome, CacheError>>,
}

enum StreamCommand {
    Request {
        range: IntRange,
        reply: oneshot::Sender<Result<StreamRequestOutcome, CacheError>>,
    },
    Download {
        reply: oneshot::Sender<Result<std::path::PathBuf, CacheError>>,
    },
    ValidateCache {
        force: bool,
        reset_invalid: bool,
        reply: oneshot::Sender<Result<Option<bool>, CacheError>>,
    },
    ResetCache {
        reply: oneshot::Sender<()>,
    },
    Suspend {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
    Retain,
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable front for a `CacheStream` actor (C5, spec.md §4.5).
/// Mirrors `arsfeld-reel`'s `FileCacheHandle`: every public operation
/// sends a command and awaits a `oneshot` reply, so the stream's mutable
/// state never needs a lock.
#[derive(Clone)]
pub struct CacheStreamHandle {
    url: Arc<Url>,
    tx: mpsc::UnboundedSender<StreamCommand>,
    progress: watch::Receiver<Progress>,
    disposed: Arc<AtomicBool>,
}

impl CacheStreamHandle {
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Synchronously observable — lets a `CacheManager` tell a stale
    /// registry entry from a live one without a round trip through the
    /// actor's command channel.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub async fn request(&self, range: IntRange) -> Result<StreamRequestOutcome, CacheError> {
        let (reply, rx) = oneshot::channel();
        self.send(StreamCommand::Request { range, reply })?;
        rx.await.map_err(|_| CacheError::CacheStreamDisposed)?
    }

    pub async fn download(&self) -> Result<std::path::PathBuf, CacheError> {
        let (reply, rx) = oneshot::channel();
        self.send(StreamCommand::Download { reply })?;
        rx.await.map_err(|_| CacheError::CacheStreamDisposed)?
    }

    pub async fn validate_cache(
        &self,
        force: bool,
        reset_invalid: bool,
    ) -> Result<Option<bool>, CacheError> {
        let (reply, rx) = oneshot::channel();
        self.send(StreamCommand::ValidateCache {
            force,
            reset_invalid,
            reply,
        })?;
        rx.await.map_err(|_| CacheError::CacheStreamDisposed)?
    }

    pub async fn reset_cache(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(StreamCommand::ResetCache { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Pauses the active download's worker, if any (spec.md §5 Priority:
    /// "in-flight pre-caches are suspended" once playback starts). A
    /// no-op when no download is in progress.
    pub async fn suspend(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(StreamCommand::Suspend { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn resume(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(StreamCommand::Resume { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn retain(&self) -> Result<(), CacheError> {
        self.send(StreamCommand::Retain)
    }

    pub async fn dispose(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(StreamCommand::Dispose { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    fn send(&self, command: StreamCommand) -> Result<(), CacheError> {
        self.tx
            .send(command)
            .map_err(|_| CacheError::CacheStreamDisposed)
    }
}

/// Resolution of one pending request or the `download()` waiter list
/// against the current downloader state (spec.md §4.3 `processRequest`).
enum Match {
    /// No downloader at all and the complete file already exists — safe
    /// to read directly, no quiescing needed.
    FileOnly,
    /// A downloader is active and might serve this range from disk, the
    /// broadcast, or both; `build_response` resolves exactly which against
    /// the downloader's quiesced position.
    Live,
    Pending,
}

/// One instance per source URL; owns at most one active [`CacheDownloader`]
/// at a time (C5, spec.md §4.5).
pub struct CacheStream {
    url: Arc<Url>,
    client: Client,
    config: Arc<CacheConfig>,
    files: CacheFiles,
    headers: Option<CachedResponseHeaders>,
    downloader: Option<Arc<CacheDownloader>>,
    downloader_task: Option<JoinHandle<()>>,
    pending: Vec<PendingRequest>,
    download_waiters: Vec<oneshot::Sender<Result<std::path::PathBuf, CacheError>>>,
    retain_count: u32,
    disposed: bool,
    disposed_flag: Arc<AtomicBool>,
    progress_tx: watch::Sender<Progress>,
}

impl CacheStream {
    pub async fn spawn(
        url: Url,
        client: Client,
        config: Arc<CacheConfig>,
        cache_dir: &std::path::Path,
    ) -> (CacheStreamHandle, JoinHandle<()>) {
        let files = CacheFiles::for_url(cache_dir, &url);
        let headers = CacheMetadataFile::load(&files.metadata)
            .await
            .ok()
            .map(|m| m.headers());
        let (progress_tx, progress_rx) = watch::channel(Progress::default());
        let url = Arc::new(url);
        let disposed_flag = Arc::new(AtomicBool::new(false));

        let mut stream = Self {
            url: url.clone(),
            client,
            config,
            files,
            headers,
            downloader: None,
            downloader_task: None,
            pending: Vec::new(),
            download_waiters: Vec::new(),
            retain_count: 1,
            disposed: false,
            disposed_flag: disposed_flag.clone(),
            progress_tx,
        };

        let (tx, commands) = mpsc::unbounded_channel();
        let handle = CacheStreamHandle {
            url,
            tx,
            progress: progress_rx,
            disposed: disposed_flag,
        };
        let task = tokio::spawn(async move { stream.run(commands).await });
        (handle, task)
    }

    fn source_length(&self) -> Option<u64> {
        self.headers.as_ref().and_then(|h| h.source_length())
    }

    async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<StreamCommand>) {
        // Placeholder until the first download starts; never polled while
        // `self.downloader` is `None` (the select arm below is guarded),
        // and replaced wholesale by `ensure_downloading`.
        let (_keep_alive, mut events_rx) = mpsc::channel::<DownloaderEvent>(1);
        loop {
            let has_downloader = self.downloader.is_some();
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd, &mut events_rx).await,
                        None => break,
                    }
                }
                event = events_rx.recv(), if has_downloader => {
                    match event {
                        Some(event) => self.handle_downloader_event(event, &mut events_rx).await,
                        None => {}
                    }
                }
            }
            if self.disposed && self.pending.is_empty() && self.download_waiters.is_empty() {
                break;
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: StreamCommand,
        events_rx: &mut mpsc::Receiver<DownloaderEvent>,
    ) {
        match command {
            StreamCommand::Request { range, reply } => {
                self.handle_request(range, reply, events_rx).await;
            }
            StreamCommand::Download { reply } => {
                self.handle_download(reply, events_rx).await;
            }
            StreamCommand::ValidateCache {
                force,
                reset_invalid,
                reply,
            } => {
                let result = self.handle_validate_cache(force, reset_invalid).await;
                let _ = reply.send(result);
            }
            StreamCommand::ResetCache { reply } => {
                self.perform_reset(CacheError::CacheReset, events_rx).await;
                let _ = reply.send(());
            }
            StreamCommand::Suspend { reply } => {
                if let Some(downloader) = &self.downloader {
                    downloader.pause();
                }
                let _ = reply.send(());
            }
            StreamCommand::Resume { reply } => {
                if let Some(downloader) = &self.downloader {
                    downloader.resume();
                }
                let _ = reply.send(());
            }
            StreamCommand::Retain => {
                if !self.disposed {
                    self.retain_count += 1;
                }
            }
            StreamCommand::Dispose { reply } => {
                self.handle_dispose(events_rx).await;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_request(
        &mut self,
        range: IntRange,
        reply: oneshot::Sender<Result<StreamRequestOutcome, CacheError>>,
        events_rx: &mut mpsc::Receiver<DownloaderEvent>,
    ) {
        if self.disposed {
            let _ = reply.send(Err(CacheError::CacheStreamDisposed));
            return;
        }
        if let Err(e) = range.validate(self.source_length()) {
            let _ = reply.send(Err(e));
            return;
        }
        if let Some(threshold) = self.config.range_request_split_threshold {
            let ahead = range
                .start
                .saturating_sub(self.downloader.as_ref().map(|d| d.position()).unwrap_or(0));
            if self.downloader.is_some() && ahead > threshold {
                match self.open_split_download(range).await {
                    Ok(response) => {
                        let outcome = self.outcome_for(response);
                        let _ = reply.send(Ok(outcome));
                        return;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                }
            }
        }
        self.ensure_downloading(events_rx).await;
        self.try_fulfill(range, reply).await;
    }

    async fn handle_download(
        &mut self,
        reply: oneshot::Sender<Result<std::path::PathBuf, CacheError>>,
        events_rx: &mut mpsc::Receiver<DownloaderEvent>,
    ) {
        if self.disposed {
            let _ = reply.send(Err(CacheError::CacheStreamDisposed));
            return;
        }
        if self.retain_count == 0 {
            let _ = reply.send(Err(CacheError::DownloadStopped));
            return;
        }
        if self.files.exists_complete() {
            let _ = reply.send(Ok(self.files.complete.clone()));
            return;
        }
        self.ensure_downloading(events_rx).await;
        self.download_waiters.push(reply);
    }

    async fn handle_validate_cache(
        &mut self,
        force: bool,
        reset_invalid: bool,
    ) -> Result<Option<bool>, CacheError> {
        if self.downloader.is_some() {
            return Ok(None);
        }
        if !self.files.exists_complete() {
            return Ok(None);
        }
        let should = match &self.headers {
            Some(h) => force || h.should_revalidate(chrono::Utc::now()),
            None => true,
        };
        if !should {
            return Ok(Some(true));
        }

        let response = self
            .client
            .head(self.url.as_str())
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await
            .map_err(CacheError::from)?;
        let fresh = CachedResponseHeaders::from_reqwest(response.headers());
        let still_valid = match &self.headers {
            Some(previous) => fresh.still_valid_against(previous),
            None => false,
        };
        if !still_valid && reset_invalid {
            self.reset_state(None).await;
        }
        Ok(Some(still_valid))
    }

    async fn perform_reset(
        &mut self,
        _reason: CacheError,
        events_rx: &mut mpsc::Receiver<DownloaderEvent>,
    ) {
        if let Some(downloader) = &self.downloader {
            downloader.cancel();
        }
        self.downloader = None;
        if let Some(task) = self.downloader_task.take() {
            task.abort();
        }
        self.reset_state(None).await;
        if !self.pending.is_empty() || !self.download_waiters.is_empty() {
            self.ensure_downloading(events_rx).await;
        }
    }

    /// Clears cached headers and deletes the on-disk files, replacing the
    /// published progress with a fresh `value: None` snapshot. `last_error`
    /// is carried straight into that snapshot rather than cleared first and
    /// set after — otherwise a caller that wants to surface the reason for
    /// the reset (e.g. a source-changed reset) would have it immediately
    /// overwritten by this function's own clear.
    async fn reset_state(&mut self, last_error: Option<CacheError>) {
        self.headers = None;
        let _ = tokio::fs::remove_file(&self.files.partial).await;
        let _ = tokio::fs::remove_file(&self.files.complete).await;
        let _ = tokio::fs::remove_file(&self.files.metadata).await;
        self.progress_tx.send_replace(Progress {
            value: None,
            last_error,
        });
    }

    async fn handle_dispose(&mut self, events_rx: &mut mpsc::Receiver<DownloaderEvent>) {
        if self.disposed {
            return;
        }
        if self.retain_count > 0 {
            self.retain_count -= 1;
        }
        if self.retain_count > 0 {
            return;
        }
        self.disposed = true;
        self.disposed_flag.store(true, Ordering::SeqCst);
        if let Some(downloader) = &self.downloader {
            downloader.cancel();
        }
        self.downloader = None;
        if let Some(task) = self.downloader_task.take() {
            task.abort();
        }
        let _ = events_rx;
        for pending in self.pending.drain(..) {
            let _ = pending.reply.send(Err(CacheError::CacheStreamDisposed));
        }
        for waiter in self.download_waiters.drain(..) {
            let _ = waiter.send(Err(CacheError::CacheStreamDisposed));
        }
        if !self.config.save_partial_cache {
            let _ = tokio::fs::remove_file(&self.files.partial).await;
            let _ = tokio::fs::remove_file(&self.files.metadata).await;
        }
        if !self.config.save_metadata && self.files.exists_complete() {
            let _ = tokio::fs::remove_file(&self.files.metadata).await;
        }
        info!(url = %self.url, "cache stream disposed");
    }

    async fn ensure_downloading(&mut self, events_rx: &mut mpsc::Receiver<DownloaderEvent>) {
        if self.downloader.is_some() || self.files.exists_complete() {
            return;
        }
        let start = match tokio::fs::metadata(&self.files.partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let can_resume = start > 0
            && self
                .headers
                .as_ref()
                .map(|h| h.can_resume_download())
                .unwrap_or(false);

        let result = if can_resume {
            CacheDownloader::start_resume(
                self.client.clone(),
                (*self.url).clone(),
                self.config.clone(),
                self.files.clone(),
                start,
                self.headers.clone().unwrap_or_default(),
            )
            .await
        } else {
            CacheDownloader::start_new(
                self.client.clone(),
                (*self.url).clone(),
                self.config.clone(),
                self.files.clone(),
            )
            .await
        };

        match result {
            Ok((downloader, task, new_events)) => {
                self.downloader = Some(downloader);
                self.downloader_task = Some(task);
                *events_rx = new_events;
            }
            Err(e) => {
                error!(url = %self.url, error = %e, "failed to start download");
                self.progress_tx.send_replace(Progress {
                    value: self.progress_tx.borrow().value,
                    last_error: Some(e),
                });
            }
        }
    }

    async fn handle_downloader_event(
        &mut self,
        event: DownloaderEvent,
        events_rx: &mut mpsc::Receiver<DownloaderEvent>,
    ) {
        match event {
            DownloaderEvent::Progress => {
                self.refresh_progress(false);
                self.dispatch_pending().await;
            }
            DownloaderEvent::Completed => {
                self.headers = self
                    .downloader
                    .as_ref()
                    .and_then(|d| d.headers());
                self.downloader = None;
                if let Some(task) = self.downloader_task.take() {
                    task.abort();
                }
                self.refresh_progress(true);
                self.dispatch_pending().await;
                for waiter in self.download_waiters.drain(..) {
                    let _ = waiter.send(Ok(self.files.complete.clone()));
                }
            }
            DownloaderEvent::Fatal(e) if e.is_invalid_cache() => {
                warn!(url = %self.url, error = %e, "cache invalidated, resetting");
                self.downloader = None;
                if let Some(task) = self.downloader_task.take() {
                    task.abort();
                }
                self.reset_state(Some(e)).await;
                // Restart immediately rather than waiting for a fresh
                // external command: `download()` waiters sit in
                // `download_waiters`, not `self.pending`, so nothing would
                // ever re-drive them otherwise.
                if !self.pending.is_empty() || !self.download_waiters.is_empty() {
                    self.ensure_downloading(events_rx).await;
                }
            }
            DownloaderEvent::Fatal(e) => {
                warn!(url = %self.url, error = %e, "download failed, will retry");
                self.downloader = None;
                if let Some(task) = self.downloader_task.take() {
                    task.abort();
                }
                self.progress_tx.send_replace(Progress {
                    value: self.progress_tx.borrow().value,
                    last_error: Some(e),
                });
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                if self.retain_count > 0
                    && !self.disposed
                    && (!self.pending.is_empty() || !self.download_waiters.is_empty())
                {
                    self.ensure_downloading(events_rx).await;
                }
            }
        }
    }

    fn refresh_progress(&mut self, completed: bool) {
        let value = if completed {
            Some(1.0)
        } else if let Some(total) = self.source_length() {
            let position = self.downloader.as_ref().map(|d| d.position()).unwrap_or(0);
            Some(((position as f64 / total as f64) * 100.0).round() / 100.0).map(|v: f64| v.min(0.99))
        } else {
            None
        };
        self.progress_tx.send_replace(Progress {
            value,
            last_error: self.progress_tx.borrow().last_error.clone(),
        });
    }

    /// Re-evaluates every pending request and the `download()` waiter
    /// list against the current position (spec.md §4.3 `processRequest`,
    /// called here in place of the original's per-chunk `onPosition` hook
    /// — see DESIGN.md for why the coupling is one step looser than the
    /// source design).
    async fn dispatch_pending(&mut self) {
        let mut still_pending = Vec::new();
        let pending = std::mem::take(&mut self.pending);
        for request in pending {
            match self.classify(request.range) {
                Match::Pending => still_pending.push(request),
                _ => {
                    let range = request.range;
                    let reply = request.reply;
                    self.fulfill(range, reply).await;
                }
            }
        }
        self.pending = still_pending;
    }

    fn classify(&self, range: IntRange) -> Match {
        let downloader = match &self.downloader {
            Some(d) => d,
            None => {
                return if self.files.exists_complete() {
                    Match::FileOnly
                } else {
                    Match::Pending
                };
            }
        };
        let position = downloader.position();
        if range.start > position {
            return Match::Pending;
        }
        if self.headers.is_none() {
            return Match::Pending;
        }
        Match::Live
    }

    async fn try_fulfill(
        &mut self,
        range: IntRange,
        reply: oneshot::Sender<Result<StreamRequestOutcome, CacheError>>,
    ) {
        match self.classify(range) {
            Match::Pending => self.pending.push(PendingRequest { range, reply }),
            _ => self.fulfill(range, reply).await,
        }
    }

    async fn fulfill(
        &mut self,
        range: IntRange,
        reply: oneshot::Sender<Result<StreamRequestOutcome, CacheError>>,
    ) {
        let result = self
            .build_response(range)
            .await
            .map(|response| self.outcome_for(response));
        let _ = reply.send(result);
    }

    fn outcome_for(&self, response: StreamResponse) -> StreamRequestOutcome {
        StreamRequestOutcome {
            response,
            content_type: self
                .headers
                .as_ref()
                .and_then(|h| h.content_type())
                .map(str::to_string),
            accept_ranges: self
                .headers
                .as_ref()
                .map(|h| h.accepts_range_requests())
                .unwrap_or(false),
            source_length: self.source_length(),
        }
    }

    async fn build_response(&self, range: IntRange) -> Result<StreamResponse, CacheError> {
        let end_exclusive = range.end_exclusive(self.source_length());
        match self.classify(range) {
            Match::FileOnly => {
                let path = if self.files.exists_complete() {
                    &self.files.complete
                } else {
                    &self.files.partial
                };
                let file = tokio::fs::File::open(path).await?;
                Ok(StreamResponse::file_only(file, range.start, end_exclusive))
            }
            Match::Live => self.build_live_response(range, end_exclusive).await,
            Match::Pending => Err(CacheError::DownloadStopped),
        }
    }

    /// Pauses the downloader, drains its sink to a stable, fully-flushed
    /// position, and serves the request against that reconciled boundary
    /// — disk for whatever's durable, the live broadcast (subscribed in
    /// the same breath the sink was flushed) for the rest. This closes
    /// the race where the sink's on-disk length lags the downloader's
    /// received position (spec.md §4.3 step 2-3 handover; invariant 7,
    /// P4): the downloader is resumed again before returning, on every
    /// path.
    async fn build_live_response(
        &self,
        range: IntRange,
        end_exclusive: Option<u64>,
    ) -> Result<StreamResponse, CacheError> {
        let downloader = self
            .downloader
            .as_ref()
            .ok_or(CacheError::DownloadStopped)?;

        // Already entirely durable: no need to pause the worker at all.
        if let Some(end) = end_exclusive {
            if downloader.sink().flushed_bytes() >= end {
                let path = if self.files.exists_complete() {
                    &self.files.complete
                } else {
                    &self.files.partial
                };
                let file = tokio::fs::File::open(path).await?;
                return Ok(StreamResponse::file_only(file, range.start, end_exclusive));
            }
        }

        let (flushed, rx) = downloader.quiesce().await?;

        let result = async {
            if end_exclusive.map(|end| flushed >= end).unwrap_or(false) {
                drop(rx);
                let path = if self.files.exists_complete() {
                    &self.files.complete
                } else {
                    &self.files.partial
                };
                let file = tokio::fs::File::open(path).await?;
                Ok(StreamResponse::file_only(file, range.start, end_exclusive))
            } else if range.start >= flushed {
                let skip = range.start.saturating_sub(flushed);
                let limit = end_exclusive.map(|end| end - range.start);
                Ok(StreamResponse::download_only(rx, skip, limit))
            } else {
                let path = if self.files.exists_complete() {
                    &self.files.complete
                } else {
                    &self.files.partial
                };
                let file = tokio::fs::File::open(path).await?;
                Ok(StreamResponse::combined(
                    file,
                    range.start,
                    flushed,
                    rx,
                    0,
                    end_exclusive,
                ))
            }
        }
        .await;

        downloader.resume();
        result
    }

    /// A dedicated, independent download opened just for this reader's
    /// range, bypassing the shared downloader entirely (spec.md §4.4
    /// SplitRangeDownload).
    async fn open_split_download(&self, range: IntRange) -> Result<StreamResponse, CacheError> {
        use std::sync::atomic::AtomicU64;
        use crate::worker::DownloadWorker;

        let position = Arc::new(AtomicU64::new(range.start));
        let worker = DownloadWorker::new(
            self.client.clone(),
            (*self.url).clone(),
            self.config.read_timeout(),
            self.config.min_chunk_size as usize,
            position,
        );
        let (tx, mut worker_rx) = mpsc::channel(32);
        let (byte_tx, byte_rx) = tokio::sync::broadcast::channel::<Result<bytes::Bytes, CacheError>>(64);
        let request_headers = self.config.effective_request_headers();
        tokio::spawn(async move { worker.run(request_headers, tx).await });

        let byte_tx_task = byte_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = worker_rx.recv().await {
                match message {
                    crate::worker::WorkerMessage::Data(bytes) => {
                        let _ = byte_tx_task.send(Ok(bytes));
                    }
                    crate::worker::WorkerMessage::Fatal(e) | crate::worker::WorkerMessage::TransientError(e) => {
                        let _ = byte_tx_task.send(Err(e));
                    }
                    crate::worker::WorkerMessage::Done | crate::worker::WorkerMessage::Headers(_) => {}
                }
            }
        });

        let limit = range.len(self.source_length());
        Ok(StreamResponse::split_range_download(byte_rx, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
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
    async fn full_download_then_request_serves_complete_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/movie.mp4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"0123456789".to_vec())
                    .insert_header("content-length", "10"),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let url = Url::parse(&format!("{}/movie.mp4", server.uri())).unwrap();
        let (handle, _task) = CacheStream::spawn(url, Client::new(), config(), dir.path()).await;

        let path = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            handle.download(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(path.is_file());

        let outcome = handle.request(IntRange::full()).await.unwrap();
        let mut response = outcome.response;
        let mut collected = Vec::new();
        while let Some(chunk) = response.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"0123456789");
        assert_eq!(outcome.source_length, Some(10));

        handle.dispose().await;
    }

    #[tokio::test]
    async fn dispose_fails_queued_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.bin"))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(10)))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let url = Url::parse(&format!("{}/slow.bin", server.uri())).unwrap();
        let (handle, _task) = CacheStream::spawn(url, Client::new(), config(), dir.path()).await;

        let request = handle.request(IntRange::new(0, Some(9)));
        let dispose = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            handle.dispose().await;
        };
        let (result, _) = tokio::join!(request, dispose);
        match result {
            Err(CacheError::CacheStreamDisposed) => {}
            other => panic!("expected CacheStreamDisposed, got {:?}", other.map(|_| ())),
        }
    }
}
