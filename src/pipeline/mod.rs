// src/pipeline/mod.rs: visible-slot fetch, viewport prefetch, bounded decoded-image cache

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::AppConfig;

pub mod cache;
pub mod error;
pub mod fetch;
pub mod prefetch;
pub mod types;
pub mod worker;

pub use cache::{CacheStats, ImageCache};
pub use error::{DeliveryOutcome, FetchError, PipelineError};
pub use fetch::{Fetcher, HttpFetcher};
pub use prefetch::{prefetch_ranges, ItemSource, PrefetchPlanner};
pub use types::{SlotId, Thumbnail, Viewport};
pub use worker::{FetchWorker, PreloadWorker, ThumbnailListener, ThumbnailWorker, WorkerPriority};

// ---- Tunables ----
pub const DEFAULT_PREFETCH_WINDOW: usize = 10;
pub const DEFAULT_PRELOAD_NICE: i32 = 10; // Linux nice; 0 is default priority
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_USER_AGENT: &str = "thumbfetch/0.1";
pub const DEFAULT_MAX_THUMBNAIL_WIDTH: u32 = 320;
pub const DEFAULT_MAX_DELIVERIES_PER_POLL: usize = 12;
const POLL_IDLE_SLEEP_MS: u64 = 5;

const FETCH_THREAD_NAME: &str = "thumb-fetch";
const PRELOAD_THREAD_NAME: &str = "thumb-preload";

/// Owns the shared cache, both workers and the planner for one grid/session.
///
/// All methods are meant to be called from the thread that owns the grid state;
/// only the downloads themselves run elsewhere.
pub struct ThumbnailPipeline {
    cache: Arc<ImageCache>,
    fetch: FetchWorker,
    preload: PreloadWorker,
    planner: PrefetchPlanner,
    prefetch_enabled: bool,
    max_deliveries_per_poll: usize,
}

impl ThumbnailPipeline {
    /// Pipeline over the real HTTP fetcher.
    pub fn from_config(cfg: &AppConfig) -> Result<Self, PipelineError> {
        let fetcher = HttpFetcher::from_config(cfg)?;
        Ok(Self::new(cfg, Arc::new(fetcher)))
    }

    pub fn new(cfg: &AppConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        let cache = match cfg.cache_capacity_bytes {
            Some(bytes) => ImageCache::with_capacity_bytes(bytes),
            None => ImageCache::from_available_memory(),
        };
        Self::with_cache(cfg, fetcher, Arc::new(cache))
    }

    pub fn with_cache(cfg: &AppConfig, fetcher: Arc<dyn Fetcher>, cache: Arc<ImageCache>) -> Self {
        let fetch = FetchWorker::new(FETCH_THREAD_NAME, Arc::clone(&fetcher))
            .with_cache(Arc::clone(&cache));
        let preload = PreloadWorker::new(PRELOAD_THREAD_NAME, fetcher)
            .with_cache(Arc::clone(&cache))
            .with_priority(WorkerPriority::Lowered(cfg.preload_nice));
        let planner = PrefetchPlanner::new(Arc::clone(&cache), cfg.prefetch_window);

        Self {
            cache,
            fetch,
            preload,
            planner,
            prefetch_enabled: cfg.prefetch_enabled,
            max_deliveries_per_poll: cfg.max_deliveries_per_poll.max(1),
        }
    }

    pub fn start(&mut self) -> Result<(), PipelineError> {
        self.fetch.start()?;
        self.preload.start()?;
        info!(
            "thumbnail pipeline started (cache {} KiB, prefetch {})",
            self.cache.capacity_kib(),
            if self.prefetch_enabled { "on" } else { "off" }
        );
        Ok(())
    }

    /// Called for every delivered visible-slot thumbnail.
    pub fn set_slot_listener(&mut self, listener: impl ThumbnailListener<SlotId> + 'static) {
        self.fetch.set_listener(listener);
    }

    /// Called for every delivered prefetch; the image is already cached by then.
    pub fn set_preload_listener(&mut self, listener: impl ThumbnailListener<usize> + 'static) {
        self.preload.set_listener(listener);
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    /// Bind `url` to `slot`: a cache hit is returned right away, a miss is queued.
    ///
    /// A hit also cancels whatever the slot was waiting for before it was recycled.
    pub fn request_slot(&self, slot: SlotId, url: &str) -> Option<Arc<Thumbnail>> {
        if let Some(hit) = self.cache.get(url) {
            debug!("slot {slot:?}: found in cache, no need to download {url}");
            self.fetch.enqueue(slot, None);
            return Some(hit);
        }
        self.fetch.enqueue(slot, Some(url));
        None
    }

    /// The slot no longer shows anything; drop its request.
    pub fn release_slot(&self, slot: SlotId) {
        self.fetch.enqueue(slot, None);
    }

    /// Prefetch around the new viewport. Returns the positions handed to the preloader.
    pub fn viewport_changed<S>(&self, viewport: Viewport, source: &S) -> Vec<usize>
    where
        S: ItemSource + ?Sized,
    {
        if !self.prefetch_enabled {
            return Vec::new();
        }
        self.planner.on_viewport_changed(viewport, source, &self.preload)
    }

    /// Deliver finished downloads from both workers. Returns listener invocations.
    pub fn poll(&mut self) -> usize {
        let max = self.max_deliveries_per_poll;
        self.fetch.poll(max) + self.preload.poll(max)
    }

    /// Keep polling until something is delivered or `timeout` passes.
    pub fn poll_for(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let n = self.poll();
            if n > 0 || Instant::now() >= deadline {
                return n;
            }
            thread::sleep(Duration::from_millis(POLL_IDLE_SLEEP_MS));
        }
    }

    pub fn pending_slots(&self) -> usize {
        self.fetch.pending_len()
    }

    pub fn pending_prefetch(&self) -> usize {
        self.preload.pending_len()
    }

    /// Both workers have nothing queued, nothing in flight and nothing left to poll.
    ///
    /// Slots whose download failed keep waiting, so settle on this rather than
    /// on `pending_slots() == 0`.
    pub fn is_idle(&self) -> bool {
        self.fetch.is_idle() && self.preload.is_idle()
    }

    /// Forget all outstanding requests, e.g. when the grid is torn down or re-queried.
    pub fn reset(&self) {
        self.fetch.clear();
        self.preload.clear();
    }

    pub fn stop(&self) {
        self.fetch.stop();
        self.preload.stop();
    }

    /// Stop and wait for both threads to finish their current download.
    pub fn join(&mut self) {
        self.fetch.join();
        self.preload.join();
    }
}
