use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Lower bound for `max_buffer_size` (spec.md §6): below this the sink and
/// per-reader buffers would thrash constantly.
pub const MIN_MAX_BUFFER_SIZE: u64 = 1024 * 1024;

/// Configuration for a [`crate::manager::CacheManager`] and the streams it
/// creates. Mirrors `arsfeld-reel`'s `FileCacheConfig`: a flat struct of
/// options with a `Default` impl and a `validate()` that raises
/// configuration errors synchronously, per spec.md §7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on in-memory bytes in the sink and per DownloadOnly reader.
    pub max_buffer_size: u64,

    /// Downstream chunk coalescing threshold.
    pub min_chunk_size: u64,

    /// Minimum gap (bytes) ahead of the cache position that triggers a
    /// split range download instead of reusing the shared downloader.
    pub range_request_split_threshold: Option<u64>,

    /// Send and inter-chunk read timeout, in seconds.
    pub read_timeout_secs: u64,

    /// Copy cached origin headers into the proxy response.
    pub copy_cached_response_headers: bool,

    /// Issue a HEAD validation on stream creation if the cache is expired.
    pub validate_outdated_cache: bool,

    /// Keep the partial file + metadata around on dispose before completion.
    pub save_partial_cache: bool,

    /// Keep the metadata file around on dispose after completion.
    pub save_metadata: bool,

    /// Persist every cacheable header, not just the essential subset.
    pub save_all_headers: bool,

    /// Combine stream-level request/response headers over the global ones.
    pub use_global_headers: bool,

    /// Per-stream request header overrides (stream wins over global).
    pub request_headers: HashMap<String, String>,

    /// Per-stream response header overrides.
    pub response_headers: HashMap<String, String>,

    /// Global request headers, combined under stream-level ones when
    /// `use_global_headers` is set.
    pub global_request_headers: HashMap<String, String>,

    /// Root directory for cache files. Defaults to a platform temp
    /// subdirectory named `http_cache_stream` (spec.md §6).
    pub cache_directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 25 * 1024 * 1024,
            min_chunk_size: 64 * 1024,
            range_request_split_threshold: None,
            read_timeout_secs: 30,
            copy_cached_response_headers: false,
            validate_outdated_cache: false,
            save_partial_cache: true,
            save_metadata: true,
            save_all_headers: true,
            use_global_headers: true,
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
            global_request_headers: HashMap::new(),
            cache_directory: None,
        }
    }
}

impl CacheConfig {
    /// Raise configuration errors synchronously, before any stream is
    /// created (spec.md §7: "raised synchronously on set").
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_buffer_size < MIN_MAX_BUFFER_SIZE {
            return Err(CacheError::Configuration(format!(
                "max_buffer_size must be >= {MIN_MAX_BUFFER_SIZE} bytes (got {})",
                self.max_buffer_size
            )));
        }
        if self.min_chunk_size == 0 {
            return Err(CacheError::Configuration(
                "min_chunk_size must be greater than zero".into(),
            ));
        }
        if let Some(threshold) = self.range_request_split_threshold {
            if threshold > i64::MAX as u64 {
                return Err(CacheError::Configuration(
                    "range_request_split_threshold is out of range".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn cache_directory(&self) -> Result<PathBuf, CacheError> {
        match &self.cache_directory {
            Some(dir) => Ok(dir.clone()),
            None => Self::default_cache_directory(),
        }
    }

    /// Platform temp subdirectory `http_cache_stream`, matching
    /// `arsfeld-reel::cache::config::FileCacheConfig::default_cache_directory`'s
    /// shape (a `dirs`-based fallback chain) but rooted under the system
    /// temp directory per spec.md §6 rather than an app-specific cache dir.
    pub fn default_cache_directory() -> Result<PathBuf, CacheError> {
        let base = std::env::temp_dir();
        Ok(base.join("http_cache_stream"))
    }

    /// Merge global and stream-level request headers, stream-level winning.
    pub fn effective_request_headers(&self) -> HashMap<String, String> {
        let mut merged = if self.use_global_headers {
            self.global_request_headers.clone()
        } else {
            HashMap::new()
        };
        merged.extend(self.request_headers.clone());
        merged
    }
}
