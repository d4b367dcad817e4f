use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::broadcast;

use crate::error::CacheError;

const READ_CHUNK: usize = 64 * 1024;

pub type BoxedByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, CacheError>> + Send>>;

/// Which of the four composition strategies produced a given
/// [`StreamResponse`] (spec.md §4.4). Carried alongside the stream itself
/// mostly for logging and tests — callers that only want bytes can ignore
/// it and just poll the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResponseKind {
    /// The whole requested range is already on disk.
    FileOnly,
    /// The whole requested range is still arriving from the origin.
    DownloadOnly,
    /// Part of the range is on disk; the rest arrives live.
    Combined,
    /// A dedicated, independent download opened just for this request
    /// because it falls too far ahead of the shared cache download.
    SplitRangeDownload,
}

/// A single HTTP response body, composed from the on-disk cache file, the
/// live broadcast of a `CacheDownloader`, or both (C4, spec.md §4.4).
pub struct StreamResponse {
    kind: StreamResponseKind,
    inner: BoxedByteStream,
}

impl StreamResponse {
    pub fn kind(&self) -> StreamResponseKind {
        self.kind
    }

    pub fn file_only(file: File, start: u64, end_exclusive: Option<u64>) -> Self {
        Self {
            kind: StreamResponseKind::FileOnly,
            inner: Box::pin(file_range_stream(file, start, end_exclusive)),
        }
    }

    /// `skip` discards leading bytes from the subscription point up to
    /// `start` — subscribing happens the instant the request is accepted
    /// (not once the position catches up to `start`), so the stream itself
    /// head-clips whatever arrives before the requested start (spec.md
    /// §4.4: "head-clipped when start > currentPosition").
    pub fn download_only(
        receiver: broadcast::Receiver<Result<Bytes, CacheError>>,
        skip: u64,
        limit: Option<u64>,
    ) -> Self {
        Self {
            kind: StreamResponseKind::DownloadOnly,
            inner: Box::pin(broadcast_stream(receiver, skip, limit)),
        }
    }

    /// Reads `[start, split)` off disk, then switches to the live
    /// broadcast tail for whatever remains of `end_exclusive`. `tail_skip`
    /// head-clips the tail subscription the same way `download_only` does,
    /// for the rare case the subscribe point landed slightly before
    /// `split`.
    pub fn combined(
        file: File,
        start: u64,
        split: u64,
        receiver: broadcast::Receiver<Result<Bytes, CacheError>>,
        tail_skip: u64,
        end_exclusive: Option<u64>,
    ) -> Self {
        let head = file_range_stream(file, start, Some(split));
        let tail_limit = end_exclusive.map(|end| end.saturating_sub(split));
        let tail = broadcast_stream(receiver, tail_skip, tail_limit);
        Self {
            kind: StreamResponseKind::Combined,
            inner: Box::pin(head.chain(tail)),
        }
    }

    pub fn split_range_download(
        receiver: broadcast::Receiver<Result<Bytes, CacheError>>,
        limit: Option<u64>,
    ) -> Self {
        Self {
            kind: StreamResponseKind::SplitRangeDownload,
            inner: Box::pin(broadcast_stream(receiver, 0, limit)),
        }
    }
}

impl Stream for StreamResponse {
    type Item = Result<Bytes, CacheError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

struct FileRangeState {
    file: File,
    pos: u64,
    end: Option<u64>,
    seeked: bool,
    done: bool,
}

fn file_range_stream(
    file: File,
    start: u64,
    end_exclusive: Option<u64>,
) -> impl Stream<Item = Result<Bytes, CacheError>> + Send {
    let state = FileRangeState {
        file,
        pos: start,
        end: end_exclusive,
        seeked: false,
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        if let Some(end) = state.end {
            if state.pos >= end {
                return None;
            }
        }
        if !state.seeked {
            if let Err(e) = state.file.seek(SeekFrom::Start(state.pos)).await {
                state.done = true;
                return Some((Err(CacheError::Io(e.to_string())), state));
            }
            state.seeked = true;
        }

        let want = state
            .end
            .map(|end| (end - state.pos).min(READ_CHUNK as u64) as usize)
            .unwrap_or(READ_CHUNK);
        let mut buf = vec![0u8; want];
        match state.file.read(&mut buf).await {
            Ok(0) => {
                state.done = true;
                None
            }
            Ok(n) => {
                buf.truncate(n);
                state.pos += n as u64;
                Some((Ok(Bytes::from(buf)), state))
            }
            Err(e) => {
                state.done = true;
                Some((Err(CacheError::Io(e.to_string())), state))
            }
        }
    })
}

fn broadcast_stream(
    receiver: broadcast::Receiver<Result<Bytes, CacheError>>,
    skip: u64,
    limit: Option<u64>,
) -> impl Stream<Item = Result<Bytes, CacheError>> + Send {
    stream::unfold(
        (receiver, skip, 0u64, limit, false),
        |(mut rx, mut skip, consumed, limit, done)| async move {
            if done {
                return None;
            }
            if let Some(limit) = limit {
                if consumed >= limit {
                    return None;
                }
            }
            loop {
                match rx.recv().await {
                    Ok(Ok(mut bytes)) => {
                        if skip > 0 {
                            if (bytes.len() as u64) <= skip {
                                skip -= bytes.len() as u64;
                                continue;
                            }
                            bytes = bytes.slice(skip as usize..);
                            skip = 0;
                        }
                        let mut consumed = consumed;
                        if let Some(limit) = limit {
                            let remaining = (limit - consumed) as usize;
                            if bytes.len() > remaining {
                                bytes = bytes.slice(0..remaining);
                            }
                        }
                        consumed += bytes.len() as u64;
                        return Some((Ok(bytes), (rx, skip, consumed, limit, false)));
                    }
                    Ok(Err(e)) => return Some((Err(e), (rx, skip, consumed, limit, true))),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        return Some((
                            Err(CacheError::ExceededMaxBufferSize),
                            (rx, skip, consumed, limit, true),
                        ))
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    )
}
