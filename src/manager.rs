use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{info, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::metadata::CacheFiles;
use crate::priority::PriorityGate;
use crate::stream::{CacheStream, CacheStreamHandle};

static GLOBAL: OnceCell<Arc<CacheManager>> = OnceCell::new();

/// Initializes the process-wide manager singleton (spec.md §9 "Global
/// mutable state": "initialized explicitly once... forbid use before
/// init"). Returns the existing instance unchanged if already initialized.
pub fn init_global(config: CacheConfig) -> Result<Arc<CacheManager>, CacheError> {
    if let Some(existing) = GLOBAL.get() {
        return Ok(existing.clone());
    }
    let manager = CacheManager::new(config)?;
    Ok(GLOBAL.get_or_init(|| manager).clone())
}

/// Returns the process-wide manager, or `None` if [`init_global`] hasn't
/// run yet.
pub fn global() -> Option<Arc<CacheManager>> {
    GLOBAL.get().cloned()
}

/// Process-wide registry keyed by source URL (spec.md §4.7). Mirrors
/// `arsfeld-reel`'s `CacheStorage`, but the thing it tracks is a live
/// actor handle rather than a database row: `create_stream` dedupes and
/// retains, `delete_cache` walks the cache directory the way
/// `CacheStorage::cleanup_cache` walks its entry table.
pub struct CacheManager {
    client: Client,
    config: Arc<CacheConfig>,
    cache_dir: PathBuf,
    streams: RwLock<HashMap<Url, CacheStreamHandle>>,
    priority: Arc<PriorityGate>,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        config.validate()?;
        Self::with_client(config, Client::new())
    }

    /// As `new`, but with a caller-supplied HTTP client instead of the
    /// manager building its own (spec.md §4.7: "owns the global HTTP
    /// client, unless one is injected").
    pub fn with_client(config: CacheConfig, client: Client) -> Result<Arc<Self>, CacheError> {
        config.validate()?;
        let cache_dir = config.cache_directory()?;
        Ok(Arc::new(Self {
            client,
            config: Arc::new(config),
            cache_dir,
            streams: RwLock::new(HashMap::new()),
            priority: PriorityGate::new(),
        }))
    }

    pub fn cache_directory(&self) -> &Path {
        &self.cache_dir
    }

    /// The process-wide playback/pre-cache admission gate (spec.md §5).
    /// The loopback server's request handler calls `begin_playback`/
    /// `end_playback` on this around every range read it serves.
    pub fn priority(&self) -> &Arc<PriorityGate> {
        &self.priority
    }

    /// Looks up a live, non-disposed stream for `url`, retaining it, or
    /// spawns a fresh one at `retain_count = 1` (spec.md §3 Lifecycle:
    /// "subsequent lookups return the same instance with `retain++`").
    pub async fn create_stream(&self, url: Url) -> Result<CacheStreamHandle, CacheError> {
        {
            let streams = self.streams.read().await;
            if let Some(handle) = streams.get(&url) {
                if !handle.is_disposed() {
                    handle.retain()?;
                    return Ok(handle.clone());
                }
            }
        }

        let mut streams = self.streams.write().await;
        if let Some(handle) = streams.get(&url) {
            if !handle.is_disposed() {
                handle.retain()?;
                return Ok(handle.clone());
            }
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let (handle, _task) = CacheStream::spawn(
            url.clone(),
            self.client.clone(),
            self.config.clone(),
            &self.cache_dir,
        )
        .await;
        streams.insert(url, handle.clone());
        Ok(handle)
    }

    /// Creates a stream, awaits its complete download, then disposes it
    /// (spec.md §4.7 `preCacheUrl`). Waits for a pre-cache concurrency
    /// slot up front, and suspends the download for as long as active
    /// playback holds the gate closed (spec.md §5 Priority).
    pub async fn pre_cache_url(&self, url: Url) -> Result<PathBuf, CacheError> {
        self.priority.wait_for_pre_cache_slot().await;
        let handle = self.create_stream(url).await?;

        let suspend_handle = handle.clone();
        let priority = self.priority.clone();
        let watcher = tokio::spawn(async move {
            loop {
                priority.wait_for_playback_start().await;
                suspend_handle.suspend().await;
                priority.wait_for_pre_cache_slot().await;
                suspend_handle.resume().await;
            }
        });

        let result = handle.download().await;
        watcher.abort();
        handle.dispose().await;
        result
    }

    /// Walks the cache directory and deletes files not claimed by any
    /// live, non-disposed stream (spec.md §4.7 `deleteCache`). When
    /// `partial_only`, only `.part` files and orphan `.metadata` files
    /// (whose sibling complete file no longer exists) are removed.
    pub async fn delete_cache(&self, partial_only: bool) -> Result<u64, CacheError> {
        let claimed = self.claimed_paths().await;
        let mut removed = 0u64;
        let root = self.cache_dir.clone();
        self.walk_and_delete(&root, &claimed, partial_only, &mut removed)
            .await?;
        Ok(removed)
    }

    async fn claimed_paths(&self) -> std::collections::HashSet<PathBuf> {
        let streams = self.streams.read().await;
        let mut claimed = std::collections::HashSet::new();
        for (url, handle) in streams.iter() {
            if handle.is_disposed() {
                continue;
            }
            let files = CacheFiles::for_url(&self.cache_dir, url);
            claimed.insert(files.complete);
            claimed.insert(files.partial);
            claimed.insert(files.metadata);
        }
        claimed
    }

    async fn walk_and_delete(
        &self,
        dir: &Path,
        claimed: &std::collections::HashSet<PathBuf>,
        partial_only: bool,
        removed: &mut u64,
    ) -> Result<(), CacheError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                Box::pin(self.walk_and_delete(&path, claimed, partial_only, removed)).await?;
                continue;
            }
            if claimed.contains(&path) {
                continue;
            }
            let should_delete = if partial_only {
                is_partial_file(&path) || is_orphan_metadata_file(&path).await
            } else {
                true
            };
            if should_delete {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => *removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to delete cache file"),
                }
            }
        }
        Ok(())
    }

    /// Removes every stream whose actor has disposed itself from the
    /// registry, so `create_stream` doesn't keep a growing tail of dead
    /// entries around.
    pub async fn reap_disposed(&self) {
        let mut streams = self.streams.write().await;
        let before = streams.len();
        streams.retain(|_, handle| !handle.is_disposed());
        let removed = before - streams.len();
        if removed > 0 {
            info!(removed, "reaped disposed cache stream entries");
        }
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }
}

fn is_partial_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("part")
}

async fn is_orphan_metadata_file(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) != Some("metadata") {
        return false;
    }
    let complete = path.with_extension("");
    !tokio::fs::try_exists(&complete).await.unwrap_or(true)
}
