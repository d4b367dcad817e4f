use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::CacheError;

/// Append-only writer in front of the partial cache file (C1, spec.md
/// §4.1). `add` is synchronous-ish (just appends to an in-memory buffer);
/// `flush` is the only thing that touches the file. Concurrent `flush`
/// callers coalesce onto the same unit of work via `flush_lock`, which is
/// held for the whole drain loop — anyone blocked on it sees an empty
/// buffer (or close to it) the moment they get in.
pub struct BufferedSink {
    path: PathBuf,
    file: Mutex<File>,
    buffer: Mutex<BytesMut>,
    buffered_len: AtomicUsize,
    flush_lock: Mutex<()>,
    flushed_bytes: AtomicU64,
    closed: AtomicBool,
}

impl BufferedSink {
    /// Opens the partial file for write. `resume` truncates to
    /// `start_offset` bytes of pre-existing sink state: when `false` the
    /// file is truncated to empty; when `true` it is opened for append and
    /// `flushed_bytes` starts at `start_offset` (normally the on-disk size).
    pub async fn open(path: PathBuf, start_offset: u64, resume: bool) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = if resume {
            OpenOptions::new().append(true).open(&path).await?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .await?
        };
        Ok(Self {
            path,
            file: Mutex::new(file),
            buffer: Mutex::new(BytesMut::new()),
            buffered_len: AtomicUsize::new(0),
            flush_lock: Mutex::new(()),
            flushed_bytes: AtomicU64::new(if resume { start_offset } else { 0 }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Un-flushed bytes currently held in memory.
    pub fn buffer_size(&self) -> usize {
        self.buffered_len.load(Ordering::SeqCst)
    }

    /// Durable bytes written relative to this sink's start position.
    pub fn flushed_bytes(&self) -> u64 {
        self.flushed_bytes.load(Ordering::SeqCst)
    }

    pub async fn add(&self, chunk: Bytes) {
        let mut buffer = self.buffer.lock().await;
        buffer.extend_from_slice(&chunk);
        self.buffered_len.store(buffer.len(), Ordering::SeqCst);
    }

    /// Drains the in-memory buffer to disk. Re-entrant: a caller that
    /// arrives while another flush is in progress waits on the same
    /// `flush_lock` and then drains whatever (if anything) has
    /// accumulated since — it never duplicates work, and it never misses
    /// bytes added after it started waiting.
    pub async fn flush(&self) -> Result<(), CacheError> {
        let _guard = self.flush_lock.lock().await;
        loop {
            let chunk = {
                let mut buffer = self.buffer.lock().await;
                if buffer.is_empty() {
                    break;
                }
                let taken = buffer.split().freeze();
                self.buffered_len.store(buffer.len(), Ordering::SeqCst);
                taken
            };
            let mut file = self.file.lock().await;
            file.write_all(&chunk).await.map_err(|e| {
                CacheError::Io(format!("writing to {}: {e}", self.path.display()))
            })?;
            drop(file);
            self.flushed_bytes.fetch_add(chunk.len() as u64, Ordering::SeqCst);
            trace!(path = %self.path.display(), bytes = chunk.len(), "sink flushed chunk");
        }
        Ok(())
    }

    /// Flushes (unless `flush_buffer` is false) and fsyncs. Idempotent —
    /// the second and later calls are no-ops.
    pub async fn close(&self, flush_buffer: bool) -> Result<(), CacheError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if flush_buffer {
            self.flush().await?;
        }
        let file = self.file.lock().await;
        file.sync_all().await.ok();
        debug!(path = %self.path.display(), flushed = self.flushed_bytes(), "sink closed");
        Ok(())
    }
}
