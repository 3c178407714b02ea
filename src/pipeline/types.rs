// src/pipeline/types.rs
use std::sync::Arc;

use image::{imageops::FilterType, DynamicImage, GenericImageView};

use super::error::FetchError;

// ---- decoded image ----

/// A decoded thumbnail, normalised to RGBA8.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Thumbnail {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

impl Thumbnail {
    pub fn from_rgba(width: u32, height: u32, rgba: Vec<u8>) -> Self {
        Self {
            width,
            height,
            rgba,
        }
    }

    /// Convert a decoded image, downscaling to `max_width` (keeping aspect) if wider.
    pub fn from_image(img: DynamicImage, max_width: Option<u32>) -> Self {
        let (w, h) = img.dimensions();
        let img = match max_width {
            Some(max_w) if max_w > 0 && w > max_w => {
                let new_h = ((h as f32) * (max_w as f32 / w as f32))
                    .round()
                    .max(1.0) as u32;
                img.resize_exact(max_w, new_h, FilterType::CatmullRom)
            }
            _ => img,
        };
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            rgba: img.to_rgba8().into_raw(),
        }
    }

    pub fn decode(bytes: &[u8], max_width: Option<u32>) -> Result<Self, FetchError> {
        let img = image::load_from_memory(bytes)?;
        Ok(Self::from_image(img, max_width))
    }

    pub const fn width(&self) -> u32 {
        self.width
    }

    pub const fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.rgba
    }

    /// Resident footprint of the pixel buffer.
    pub fn byte_size(&self) -> usize {
        self.rgba.len()
    }
}

// ---- targets ----

/// Handle for a UI slot (a recycled grid cell). Owned by the UI layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u64);

/// Visible band of the grid, as reported on every scroll/layout event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Viewport {
    pub first_visible: usize,
    pub last_visible: usize,
    pub total_count: usize,
}

impl Viewport {
    pub const fn new(first_visible: usize, last_visible: usize, total_count: usize) -> Self {
        Self {
            first_visible,
            last_visible,
            total_count,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.total_count == 0 || self.last_visible < self.first_visible
    }
}

// ---- cross-thread messages ----

/// Request-side message, UI thread -> worker thread.
pub(crate) enum Command<T> {
    Process { target: T, generation: u64 },
    Quit,
}

/// Finished fetch, worker thread -> polling thread. Still unvalidated.
pub(crate) struct Completed<T> {
    pub target: T,
    pub url: String,
    pub image: Arc<Thumbnail>,
}
