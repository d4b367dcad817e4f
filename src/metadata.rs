use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use url::Url;

use crate::error::CacheError;
use crate::headers::CachedResponseHeaders;

/// The three cache files bound to one source URL, immutable for the life
/// of a `CacheStream` (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheFiles {
    pub complete: PathBuf,
    pub partial: PathBuf,
    pub metadata: PathBuf,
}

impl CacheFiles {
    pub fn for_url(cache_dir: &Path, url: &Url) -> Self {
        let complete = cache_dir.join(cache_relative_path(url));
        CacheFiles {
            partial: with_extra_suffix(&complete, "part"),
            metadata: with_extra_suffix(&complete, "metadata"),
            complete,
        }
    }

    pub async fn ensure_parent_dir(&self) -> Result<(), CacheError> {
        if let Some(parent) = self.complete.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    pub fn exists_complete(&self) -> bool {
        self.complete.is_file()
    }

    pub fn exists_partial(&self) -> bool {
        self.partial.is_file()
    }
}

fn with_extra_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Filesystem component filter: keep `[A-Za-z0-9._-]`, drop everything
/// else, per spec.md §6.
fn sanitize_component(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let sanitized = if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    };
    sanitized.chars().take(255).collect()
}

const MAX_TOTAL_PATH_LEN: usize = 4096;

/// `host/pathSegments…`, sanitized, with `.cache` appended when the final
/// component has no extension; falls back to `sha1(url)` plus the
/// original extension (if alphanumeric and ≤20 chars) on any failure.
fn cache_relative_path(url: &Url) -> PathBuf {
    match try_cache_relative_path(url) {
        Some(path) => path,
        None => fallback_relative_path(url),
    }
}

fn try_cache_relative_path(url: &Url) -> Option<PathBuf> {
    let host = url.host_str()?;
    let mut components: Vec<String> = vec![sanitize_component(host)];
    if let Some(segments) = url.path_segments() {
        for segment in segments.filter(|s| !s.is_empty()) {
            components.push(sanitize_component(segment));
        }
    }
    if components.len() == 1 {
        components.push("index".to_string());
    }

    let last = components.last_mut().expect("at least host + one segment");
    if !last.contains('.') {
        last.push_str(".cache");
    }

    let mut path = PathBuf::new();
    let mut total_len = 0usize;
    for component in &components {
        total_len += component.len() + 1;
        if total_len > MAX_TOTAL_PATH_LEN {
            return None;
        }
        path.push(component);
    }
    Some(path)
}

fn fallback_relative_path(url: &Url) -> PathBuf {
    let mut hasher = Sha1::new();
    hasher.update(url.as_str().as_bytes());
    let digest = hasher.finalize();
    let mut name = hex::encode(digest);

    let extension = url
        .path()
        .rsplit('.')
        .next()
        .filter(|ext| !ext.is_empty() && ext.len() <= 20 && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    if let Some(ext) = extension {
        name.push('.');
        name.push_str(ext);
    } else {
        name.push_str(".cache");
    }
    PathBuf::from(name)
}

/// `{ "Url": "<source>", "headers": { ... } }` persisted alongside a
/// partial file so downloads can resume (spec.md §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadataFile {
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl CacheMetadataFile {
    pub fn new(url: &Url, headers: &CachedResponseHeaders, save_all_headers: bool) -> Self {
        let headers = if save_all_headers {
            headers.clone()
        } else {
            headers.essential()
        };
        Self {
            url: url.to_string(),
            headers: headers.to_map(),
        }
    }

    pub fn headers(&self) -> CachedResponseHeaders {
        CachedResponseHeaders::from_map(self.headers.clone())
    }

    pub async fn load(path: &Path) -> Result<Self, CacheError> {
        let data = tokio::fs::read(path).await?;
        let parsed: Self = serde_json::from_slice(&data)?;
        if parsed.url.is_empty() {
            return Err(CacheError::Io(
                "metadata file is missing its Url field".into(),
            ));
        }
        Ok(parsed)
    }

    pub async fn save(&self, path: &Path) -> Result<(), CacheError> {
        let data = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }
}
