// src/pipeline/prefetch.rs
use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, trace};

use super::cache::ImageCache;
use super::types::Viewport;
use super::worker::PreloadWorker;

/// Position -> URL lookup over the current item list.
pub trait ItemSource {
    fn url_at(&self, position: usize) -> Option<&str>;
    fn count(&self) -> usize;
}

impl<S: AsRef<str>> ItemSource for [S] {
    fn url_at(&self, position: usize) -> Option<&str> {
        self.get(position).map(AsRef::as_ref)
    }

    fn count(&self) -> usize {
        self.len()
    }
}

impl<S: AsRef<str>> ItemSource for Vec<S> {
    fn url_at(&self, position: usize) -> Option<&str> {
        self.as_slice().url_at(position)
    }

    fn count(&self) -> usize {
        self.len()
    }
}

/// Positions just outside the viewport worth warming.
///
/// Before: `first - window .. first`, only when the whole band is in bounds.
/// After: `last + 1 .. last + window`, only when `last + window <= total`.
pub fn prefetch_ranges(
    viewport: Viewport,
    window: usize,
) -> (Option<Range<usize>>, Option<Range<usize>>) {
    if viewport.is_empty() || window == 0 {
        return (None, None);
    }
    let Viewport {
        first_visible: first,
        last_visible: last,
        total_count: total,
    } = viewport;

    let before = first.checked_sub(window).map(|start| start..first);
    let after = last
        .checked_add(window)
        .filter(|end| *end <= total)
        .map(|end| (last + 1)..end);

    (before, after)
}

/// Decides which off-screen positions to hand to the preload worker.
pub struct PrefetchPlanner {
    cache: Arc<ImageCache>,
    window: usize,
}

impl PrefetchPlanner {
    pub fn new(cache: Arc<ImageCache>, window: usize) -> Self {
        Self { cache, window }
    }

    pub const fn window(&self) -> usize {
        self.window
    }

    /// Enqueue every uncached position in the prefetch window. Returns the enqueued positions.
    ///
    /// Safe to call on every scroll event: re-enqueuing a pending position is an overwrite.
    pub fn on_viewport_changed<S>(
        &self,
        viewport: Viewport,
        source: &S,
        preload: &PreloadWorker,
    ) -> Vec<usize>
    where
        S: ItemSource + ?Sized,
    {
        let (before, after) = prefetch_ranges(viewport, self.window);
        let limit = source.count().min(viewport.total_count);

        let mut enqueued = Vec::new();
        for position in before.into_iter().chain(after).flatten() {
            if position >= limit {
                break;
            }
            let Some(url) = source.url_at(position).filter(|u| !u.is_empty()) else {
                continue;
            };
            if self.cache.get(url).is_some() {
                trace!("prefetch: {position} already cached");
                continue;
            }
            preload.enqueue(position, Some(url));
            enqueued.push(position);
        }

        debug!(
            "prefetch: viewport {}..={} of {} -> {} queued",
            viewport.first_visible,
            viewport.last_visible,
            viewport.total_count,
            enqueued.len()
        );
        enqueued
    }
}
