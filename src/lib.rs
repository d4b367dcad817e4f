//! Local HTTP caching proxy for streamed media.
//!
//! Binds one origin fetch, one on-disk partial file, and N concurrent
//! range readers behind a loopback HTTP server: the first reader of a
//! URL triggers a single download from the origin, later readers for
//! the same URL — whether starting cold, mid-download, or fully cached
//! — are served from the shared partial file and the live download
//! broadcast, never from a second origin request.
//!
//! The entry points are [`CacheManager`], which owns the registry of
//! live [`CacheStreamHandle`]s keyed by source URL, and
//! [`LoopbackServer`], the axum-based HTTP front end that resolves
//! incoming range requests against a manager.

pub mod config;
pub mod downloader;
pub mod error;
pub mod headers;
pub mod manager;
pub mod metadata;
pub mod priority;
pub mod range;
pub mod response;
pub mod server;
pub mod sink;
pub mod stream;
pub mod worker;

pub use config::CacheConfig;
pub use error::CacheError;
pub use manager::{global, init_global, CacheManager};
pub use priority::PriorityGate;
pub use range::IntRange;
pub use response::StreamResponse;
pub use server::LoopbackServer;
pub use stream::{CacheStream, CacheStreamHandle, Progress, StreamRequestOutcome};
