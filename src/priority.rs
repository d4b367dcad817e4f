use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

const DEFAULT_PRE_CACHE_CONCURRENCY: u32 = 2;

/// Process-wide admission control between active playback and background
/// pre-caching (spec.md §5 "Priority"). Whenever at least one playback is
/// active, pre-cache concurrency drops to zero and in-flight pre-caches
/// are suspended; it relaxes back to 2 once playback count returns to
/// zero.
pub struct PriorityGate {
    active_playbacks: AtomicU32,
    concurrency_cap: AtomicU32,
    relaxed: Notify,
    tightened: Notify,
}

impl Default for PriorityGate {
    fn default() -> Self {
        Self {
            active_playbacks: AtomicU32::new(0),
            concurrency_cap: AtomicU32::new(DEFAULT_PRE_CACHE_CONCURRENCY),
            relaxed: Notify::new(),
            tightened: Notify::new(),
        }
    }
}

impl PriorityGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Call when a reader starts consuming a `CacheStream` for playback
    /// (as opposed to pre-caching).
    pub fn begin_playback(&self) {
        if self.active_playbacks.fetch_add(1, Ordering::SeqCst) == 0 {
            self.concurrency_cap.store(0, Ordering::SeqCst);
            self.tightened.notify_waiters();
        }
    }

    pub fn end_playback(&self) {
        if self.active_playbacks.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.concurrency_cap
                .store(DEFAULT_PRE_CACHE_CONCURRENCY, Ordering::SeqCst);
            self.relaxed.notify_waiters();
        }
    }

    pub fn active_playback_count(&self) -> u32 {
        self.active_playbacks.load(Ordering::SeqCst)
    }

    pub fn pre_cache_concurrency_cap(&self) -> u32 {
        self.concurrency_cap.load(Ordering::SeqCst)
    }

    /// Waits until pre-caching is allowed to proceed at all — i.e. any
    /// playback in progress has ended. Pre-cache callers should call this
    /// before starting, and suspend (pause the underlying download worker)
    /// rather than poll if it returns while they're already running.
    pub async fn wait_for_pre_cache_slot(&self) {
        while self.concurrency_cap.load(Ordering::SeqCst) == 0 {
            self.relaxed.notified().await;
        }
    }

    /// Waits until playback starts (concurrency cap drops to zero). Used
    /// by an already-running pre-cache to know when to suspend.
    pub async fn wait_for_playback_start(&self) {
        while self.concurrency_cap.load(Ordering::SeqCst) != 0 {
            self.tightened.notified().await;
        }
    }
}
