//! Starts a loopback cache proxy in front of a single origin URL.
//!
//! ```sh
//! cargo run --bin cachecast-demo -- https://example.com/video.mp4
//! ```
//!
//! Once running, requesting `http://127.0.0.1:<port>/video.mp4` (and any
//! `Range:` request against it) is served from the shared cache stream
//! instead of re-fetching the origin per request.

use cachecast::{CacheConfig, CacheManager, LoopbackServer};
use url::Url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let origin = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: cachecast-demo <origin-url>"))?;
    let origin = Url::parse(&origin)?;

    let manager = CacheManager::new(CacheConfig::default())?;
    tracing::info!(cache_dir = %manager.cache_directory().display(), "cache directory");

    let server = LoopbackServer::new(origin.clone(), manager);
    let addr = server.start().await?;
    tracing::info!(%addr, %origin, "proxying origin through loopback cache");

    tokio::signal::ctrl_c().await?;
    Ok(())
}
