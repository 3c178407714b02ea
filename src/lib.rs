//! Background thumbnail acquisition for scrolling grids.
//!
//! A visible-slot fetch worker, a lower-priority prefetch worker driven by the
//! viewport, and a memory-bounded LRU cache of decoded images.

pub mod config;
pub mod pipeline;

pub use config::AppConfig;
pub use pipeline::{ImageCache, SlotId, Thumbnail, ThumbnailPipeline, Viewport};
